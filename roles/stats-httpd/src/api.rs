//! HTTP query surface.
//!
//! Three routes, all answering `text/json` with an
//! `{"error_no":N,"error_msg":"...","result":...}` envelope and HTTP 200 even
//! on logical errors: `/` for the pool-wide status and `/worker_status` (plus
//! its trailing-slash alias) for per-worker windowed statistics.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use serde_json::json;
use share_stats::{WorkerKey, WorkerStatus};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::server::StatsServer;

/// Connection-level timeout for slow clients.
pub const HTTP_TIMEOUT_SECS: u64 = 5;

pub async fn run_http_server(address: &str, server: Arc<StatsServer>) -> anyhow::Result<()> {
    let listener = match TcpListener::bind(address).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("couldn't bind http server to {}: {}", address, e);
            return Err(e.into());
        }
    };
    info!("http server listening on {}", address);
    serve(listener, server).await;
    Ok(())
}

/// Accept loop over an already-bound listener; returns when the server is
/// stopped.
pub async fn serve(listener: TcpListener, server: Arc<StatsServer>) {
    let mut shutdown = server.subscribe_shutdown();

    loop {
        let (stream, _) = tokio::select! {
            result = listener.accept() => match result {
                Ok(conn) => conn,
                Err(e) => {
                    error!("accept: {}", e);
                    continue;
                }
            },
            _ = shutdown.changed() => break,
        };

        let io = TokioIo::new(stream);
        let server = server.clone();

        tokio::task::spawn(async move {
            let service = service_fn(move |req| {
                let server = server.clone();
                async move { handle_request(req, server).await }
            });

            if let Err(err) = http1::Builder::new()
                .keep_alive(true)
                .timer(TokioTimer::new())
                .header_read_timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
                .serve_connection(io, service)
                .await
            {
                error!("error serving connection: {:?}", err);
            }
        });
    }
}

async fn handle_request(
    req: Request<Incoming>,
    server: Arc<StatsServer>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    match req.method() {
        &Method::GET | &Method::POST | &Method::HEAD => {}
        _ => {
            return Ok(plain_response(
                StatusCode::METHOD_NOT_ALLOWED,
                "Method Not Allowed",
            ))
        }
    }

    let path = req.uri().path().to_string();
    let response = match path.as_str() {
        "/" => serve_server_status(&server),
        "/worker_status" | "/worker_status/" => serve_worker_status(req, &server).await,
        _ => plain_response(StatusCode::NOT_FOUND, "Not Found"),
    };
    Ok(response)
}

fn serve_server_status(server: &StatsServer) -> Response<Full<Bytes>> {
    server.note_request();
    let status = server.server_status();

    let body = json!({
        "error_no": 0,
        "error_msg": "",
        "result": {
            "uptime": format_uptime(status.uptime_secs),
            "request": status.request_count,
            "repbytes": status.response_bytes,
            "pool": {
                "accept": [status.pool.accept_1m, status.pool.accept_5m, status.pool.accept_15m],
                "reject": [0, 0, status.pool.reject_15m],
                "accept_count": status.pool.accept_count,
                "workers": status.worker_count,
                "users": status.user_count,
            },
        },
    })
    .to_string();

    json_response(server, body)
}

async fn serve_worker_status(
    req: Request<Incoming>,
    server: &Arc<StatsServer>,
) -> Response<Full<Bytes>> {
    server.note_request();

    // Query string and urlencoded POST body are parsed identically.
    let raw_params = if req.method() == Method::POST {
        let collected = tokio::time::timeout(
            Duration::from_secs(HTTP_TIMEOUT_SECS),
            req.into_body().collect(),
        )
        .await;
        let body = match collected {
            Ok(Ok(collected)) => collected.to_bytes(),
            _ => Bytes::new(),
        };
        String::from_utf8_lossy(&body).into_owned()
    } else {
        req.uri().query().unwrap_or("").to_string()
    };
    let params = parse_params(&raw_params);

    let (Some(user_raw), Some(worker_raw)) = (params.get("user_id"), params.get("worker_id"))
    else {
        let body = json!({"error_no": 1, "error_msg": "invalid args"}).to_string();
        return json_response(server, body);
    };

    let user_id = parse_int_prefix(user_raw) as i32;
    let is_merge = params
        .get("is_merge")
        .map(|v| matches!(v.chars().next(), Some('T' | 't')))
        .unwrap_or(false);

    // Order and duplicates in the requested list are preserved.
    let keys: Vec<WorkerKey> = worker_raw
        .split(',')
        .map(|id| WorkerKey::new(user_id, parse_int_prefix(id)))
        .collect();

    let handles = server.registry().batch_lookup(&keys);
    let statuses: Vec<WorkerStatus> = handles
        .iter()
        .map(|handle| {
            handle
                .as_ref()
                .map(|worker| worker.status())
                .unwrap_or_default()
        })
        .collect();

    let rows: Vec<serde_json::Value> = if is_merge {
        vec![render_row(0, &WorkerStatus::merge(&statuses), None)]
    } else {
        keys.iter()
            .zip(&statuses)
            .map(|(key, status)| {
                let workers = key
                    .is_aggregate()
                    .then(|| server.registry().user_worker_count(key.user_id));
                render_row(key.worker_id, status, workers)
            })
            .collect()
    };

    let body = json!({"error_no": 0, "error_msg": "", "result": rows}).to_string();
    json_response(server, body)
}

fn render_row(worker_id: i64, status: &WorkerStatus, workers: Option<u64>) -> serde_json::Value {
    let mut row = json!({
        "worker_id": worker_id,
        "accept": [status.accept_1m, status.accept_5m, status.accept_15m],
        "reject": [0, 0, status.reject_15m],
        "accept_count": status.accept_count,
        "last_share_ip": status.last_share_ip.to_string(),
        "last_share_time": status.last_share_time,
    });
    if let Some(count) = workers {
        row["workers"] = json!(count);
    }
    row
}

fn json_response(server: &StatsServer, body: String) -> Response<Full<Bytes>> {
    server.note_response_bytes(body.len() as u64);
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

fn plain_response(status: StatusCode, message: &'static str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(message)))
        .unwrap()
}

fn format_uptime(secs: u64) -> String {
    format!(
        "{:02} d {:02} h {:02} m {:02} s",
        secs / 86_400,
        (secs % 86_400) / 3_600,
        (secs % 3_600) / 60,
        secs % 60
    )
}

/// Parse an urlencoded parameter string; the first occurrence of a key wins.
fn parse_params(raw: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for pair in raw.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        params
            .entry(url_decode(key))
            .or_insert_with(|| url_decode(value));
    }
    params
}

fn url_decode(s: &str) -> String {
    fn hex_val(byte: u8) -> Option<u8> {
        (byte as char).to_digit(16).map(|d| d as u8)
    }

    let bytes = s.as_bytes();
    let mut result = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                result.push(hi * 16 + lo);
                i += 3;
                continue;
            }
        }
        if bytes[i] == b'+' {
            result.push(b' ');
        } else {
            result.push(bytes[i]);
        }
        i += 1;
    }
    String::from_utf8_lossy(&result).into_owned()
}

/// Leading-integer parse with C `strtoll` semantics: optional sign, digits
/// until the first non-digit, 0 for no digits, saturating on overflow.
fn parse_int_prefix(s: &str) -> i64 {
    let s = s.trim_start();
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };

    let mut value: i64 = 0;
    for c in digits.chars() {
        let Some(d) = c.to_digit(10) else { break };
        value = match value
            .checked_mul(10)
            .and_then(|v| v.checked_add(d as i64))
        {
            Some(v) => v,
            None => return if negative { i64::MIN } else { i64::MAX },
        };
    }
    if negative {
        -value
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(0), "00 d 00 h 00 m 00 s");
        assert_eq!(format_uptime(59), "00 d 00 h 00 m 59 s");
        assert_eq!(format_uptime(86_400 + 3_600 + 60 + 1), "01 d 01 h 01 m 01 s");
        assert_eq!(format_uptime(90 * 86_400 + 7), "90 d 00 h 00 m 07 s");
    }

    #[test]
    fn test_parse_params_basic() {
        let params = parse_params("user_id=7&worker_id=42,43&is_merge=T");
        assert_eq!(params.get("user_id").unwrap(), "7");
        assert_eq!(params.get("worker_id").unwrap(), "42,43");
        assert_eq!(params.get("is_merge").unwrap(), "T");
    }

    #[test]
    fn test_parse_params_percent_decoding() {
        let params = parse_params("worker_id=42%2C43&note=a+b");
        assert_eq!(params.get("worker_id").unwrap(), "42,43");
        assert_eq!(params.get("note").unwrap(), "a b");
    }

    #[test]
    fn test_parse_params_first_occurrence_wins() {
        let params = parse_params("user_id=7&user_id=8");
        assert_eq!(params.get("user_id").unwrap(), "7");
    }

    #[test]
    fn test_parse_params_valueless_key() {
        let params = parse_params("is_merge");
        assert_eq!(params.get("is_merge").unwrap(), "");
    }

    #[test]
    fn test_url_decode_tolerates_malformed_escapes() {
        assert_eq!(url_decode("%4"), "%4");
        assert_eq!(url_decode("%zz"), "%zz");
        assert_eq!(url_decode("a%éb"), "a%éb");
    }

    #[test]
    fn test_parse_int_prefix() {
        assert_eq!(parse_int_prefix("42"), 42);
        assert_eq!(parse_int_prefix("-17"), -17);
        assert_eq!(parse_int_prefix("+5"), 5);
        assert_eq!(parse_int_prefix("12abc"), 12);
        assert_eq!(parse_int_prefix("abc"), 0);
        assert_eq!(parse_int_prefix(""), 0);
        assert_eq!(parse_int_prefix("  9"), 9);
        assert_eq!(parse_int_prefix("99999999999999999999999"), i64::MAX);
        assert_eq!(parse_int_prefix("-99999999999999999999999"), i64::MIN);
    }

    #[test]
    fn test_render_row_shape() {
        let status = WorkerStatus {
            accept_1m: 1,
            accept_5m: 2,
            accept_15m: 3,
            reject_15m: 4,
            accept_count: 5,
            last_share_ip: Ipv4Addr::new(1, 2, 3, 4),
            last_share_time: 77,
        };

        let row = render_row(42, &status, None);
        assert_eq!(row["worker_id"], 42);
        assert_eq!(row["accept"], json!([1, 2, 3]));
        assert_eq!(row["reject"], json!([0, 0, 4]));
        assert_eq!(row["accept_count"], 5);
        assert_eq!(row["last_share_ip"], "1.2.3.4");
        assert_eq!(row["last_share_time"], 77);
        assert!(row.get("workers").is_none());
    }

    #[test]
    fn test_render_row_workers_field_for_aggregate() {
        let row = render_row(0, &WorkerStatus::default(), Some(3));
        assert_eq!(row["worker_id"], 0);
        assert_eq!(row["workers"], 3);
        assert_eq!(row["last_share_ip"], "0.0.0.0");
    }
}
