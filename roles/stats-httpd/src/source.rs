//! Client side of the share-log event stream.
//!
//! The engine only depends on the `ShareLogSource` trait: attach at a
//! position, probe liveness, poll one frame at a time. `TcpLogSource` is the
//! bundled transport: it subscribes to the broker over TCP and reads tagged,
//! length-prefixed frames, reconnecting on the next poll after a failure.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::debug;

pub const FRAME_KIND_DATA: u8 = 0;
pub const FRAME_KIND_END_OF_LOG: u8 = 1;
pub const FRAME_KIND_ERROR: u8 = 2;
pub const FRAME_KIND_FATAL: u8 = 3;

const FRAME_HEADER_LEN: usize = 5;
const MAX_FRAME_LEN: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("share log source is not alive")]
    NotAlive,
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
}

/// Where to start reading the log on attach.
#[derive(Debug, Clone, Copy)]
pub enum StartPosition {
    /// This many events before the current tail.
    TailOffset(u64),
}

/// One frame delivered by the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogFrame {
    /// A share record payload.
    Data(Vec<u8>),
    /// Caught up with the tail; not an error.
    EndOfLog,
    /// Transient delivery problem; safe to keep polling.
    Error(String),
    /// Unrecoverable stream condition, e.g. the topic does not exist.
    Fatal(String),
}

#[async_trait]
pub trait ShareLogSource: Send {
    async fn attach(&mut self, start: StartPosition) -> Result<(), SourceError>;
    async fn check_alive(&mut self) -> bool;
    /// Wait up to `timeout` for the next frame; `None` on timeout.
    async fn poll(&mut self, timeout: Duration) -> Option<LogFrame>;
}

pub struct TcpLogSource {
    address: String,
    topic: String,
    start: Option<StartPosition>,
    stream: Option<TcpStream>,
    buf: Vec<u8>,
}

impl TcpLogSource {
    pub fn new(address: String, topic: String) -> Self {
        Self {
            address,
            topic,
            start: None,
            stream: None,
            buf: Vec::new(),
        }
    }

    async fn connect(&mut self) -> Result<(), SourceError> {
        let mut stream =
            TcpStream::connect(&self.address)
                .await
                .map_err(|source| SourceError::Connect {
                    address: self.address.clone(),
                    source,
                })?;

        let StartPosition::TailOffset(tail_offset) =
            self.start.unwrap_or(StartPosition::TailOffset(0));
        let subscribe = json!({
            "topic": self.topic,
            "partition": 0,
            "tail_offset": tail_offset,
        });
        stream
            .write_all(format!("{}\n", subscribe).as_bytes())
            .await?;
        stream.flush().await?;

        debug!("subscribed to {} at {}", self.topic, self.address);
        self.buf.clear();
        self.stream = Some(stream);
        Ok(())
    }
}

#[async_trait]
impl ShareLogSource for TcpLogSource {
    async fn attach(&mut self, start: StartPosition) -> Result<(), SourceError> {
        self.start = Some(start);
        self.connect().await
    }

    async fn check_alive(&mut self) -> bool {
        self.stream.is_some()
    }

    async fn poll(&mut self, timeout: Duration) -> Option<LogFrame> {
        if self.stream.is_none() {
            if let Err(e) = self.connect().await {
                // Pace reconnect attempts at the poll cadence.
                tokio::time::sleep(timeout).await;
                return Some(LogFrame::Error(e.to_string()));
            }
        }

        let deadline = Instant::now() + timeout;
        let mut chunk = [0u8; 8192];
        loop {
            match parse_frame(&mut self.buf) {
                Ok(Some(frame)) => return Some(frame),
                Ok(None) => {}
                Err(e) => {
                    self.stream = None;
                    return Some(LogFrame::Error(e.to_string()));
                }
            }

            let stream = self.stream.as_mut()?;
            match tokio::time::timeout_at(deadline, stream.read(&mut chunk)).await {
                Err(_) => return None,
                Ok(Ok(0)) => {
                    self.stream = None;
                    return Some(LogFrame::Error("share log connection closed".to_string()));
                }
                Ok(Ok(n)) => self.buf.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => {
                    self.stream = None;
                    return Some(LogFrame::Error(e.to_string()));
                }
            }
        }
    }
}

/// Extract one complete frame from the front of `buf`, if present.
fn parse_frame(buf: &mut Vec<u8>) -> io::Result<Option<LogFrame>> {
    if buf.len() < FRAME_HEADER_LEN {
        return Ok(None);
    }

    let kind = buf[0];
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&buf[1..5]);
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {} exceeds limit", len),
        ));
    }
    if buf.len() < FRAME_HEADER_LEN + len {
        return Ok(None);
    }

    let payload: Vec<u8> = buf[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len].to_vec();
    buf.drain(..FRAME_HEADER_LEN + len);

    let frame = match kind {
        FRAME_KIND_DATA => LogFrame::Data(payload),
        FRAME_KIND_END_OF_LOG => LogFrame::EndOfLog,
        FRAME_KIND_ERROR => LogFrame::Error(String::from_utf8_lossy(&payload).into_owned()),
        FRAME_KIND_FATAL => LogFrame::Fatal(String::from_utf8_lossy(&payload).into_owned()),
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown frame kind {}", other),
            ))
        }
    };
    Ok(Some(frame))
}
