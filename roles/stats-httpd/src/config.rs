use serde::Deserialize;
use std::{env, fs};

#[derive(Debug, Clone)]
pub struct Config {
    pub source_address: String,
    pub source_topic: String,
    pub http_address: String,
    pub log_file: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StatsHttpdConfig {
    #[serde(default)]
    source: SourceConfig,
    #[serde(default)]
    server: ServerConfig,
}

#[derive(Debug, Deserialize)]
struct SourceConfig {
    address: Option<String>,
    topic: Option<String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            address: Some("127.0.0.1:9092".to_string()),
            topic: Some("share_log".to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ServerConfig {
    http_listen_address: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_listen_address: Some("0.0.0.0:8080".to_string()),
        }
    }
}

impl Config {
    pub fn from_args() -> anyhow::Result<Self> {
        let args: Vec<String> = env::args().collect();
        Self::from_arg_list(&args)
    }

    fn from_arg_list(args: &[String]) -> anyhow::Result<Self> {
        let log_file = args
            .iter()
            .position(|arg| arg == "-f" || arg == "--log-file")
            .and_then(|i| args.get(i + 1))
            .cloned();

        let config_path = args
            .iter()
            .position(|arg| arg == "--config" || arg == "-c")
            .and_then(|i| args.get(i + 1))
            .map(|s| s.as_str())
            .ok_or_else(|| anyhow::anyhow!("Missing required argument: --config"))?;

        let config_str = fs::read_to_string(config_path).unwrap_or_default();
        let file_config: StatsHttpdConfig = if config_str.is_empty() {
            StatsHttpdConfig::default()
        } else {
            toml::from_str(&config_str)?
        };

        let source_address = args
            .iter()
            .position(|arg| arg == "--source-address" || arg == "-s")
            .and_then(|i| args.get(i + 1))
            .cloned()
            .or(file_config.source.address)
            .ok_or_else(|| anyhow::anyhow!("Missing required config: source.address"))?;

        let source_topic = file_config
            .source
            .topic
            .unwrap_or_else(|| "share_log".to_string());

        let http_address = args
            .iter()
            .position(|arg| arg == "--http-address" || arg == "-h")
            .and_then(|i| args.get(i + 1))
            .cloned()
            .or(file_config.server.http_listen_address)
            .ok_or_else(|| anyhow::anyhow!("Missing required config: server.http_listen_address"))?;

        Ok(Config {
            source_address,
            source_topic,
            http_address,
            log_file,
        })
    }
}
