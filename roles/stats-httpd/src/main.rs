use std::sync::Arc;

use share_stats::SystemClock;
use tracing::{error, info};

use stats_httpd::config::Config;
use stats_httpd::server::StatsServer;
use stats_httpd::source::TcpLogSource;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_args()?;
    init_tracing(config.log_file.as_deref())?;

    info!("starting stats-httpd");
    info!(
        "share log source: {} topic: {}",
        config.source_address, config.source_topic
    );
    info!("http server: {}", config.http_address);

    let server = Arc::new(StatsServer::new(Arc::new(SystemClock)));
    let source = TcpLogSource::new(config.source_address.clone(), config.source_topic.clone());

    {
        let server = server.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("interrupt received"),
                Err(e) => error!("unable to listen for interrupt: {}", e),
            }
            server.stop();
        });
    }

    server.run(Box::new(source), &config.http_address).await?;
    info!("stats-httpd stopped");
    Ok(())
}

fn init_tracing(log_file: Option<&str>) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match log_file {
        Some(path) => {
            let file = std::fs::File::create(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}
