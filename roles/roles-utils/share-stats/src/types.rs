//! Share records and identity keys.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Sliding horizon over which all per-identity statistics are computed.
pub const WINDOW_SECS: u64 = 900;

/// Exact byte length of a share frame on the wire.
pub const SHARE_FRAME_LEN: usize = 32;

/// Errors that can occur while decoding share frames.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("share frame must be {SHARE_FRAME_LEN} bytes, got {actual}")]
    Length { actual: usize },
    #[error("unknown share verdict {raw}")]
    Verdict { raw: i32 },
}

/// Whether the upstream judged a share as counting toward the hashrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShareVerdict {
    Reject = 0,
    Accept = 1,
}

impl TryFrom<i32> for ShareVerdict {
    type Error = FrameError;

    fn try_from(raw: i32) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(ShareVerdict::Reject),
            1 => Ok(ShareVerdict::Accept),
            _ => Err(FrameError::Verdict { raw }),
        }
    }
}

/// One share event as delivered by the share log.
///
/// Wire layout is a fixed 32-byte record: timestamp (u32), user id (i32),
/// worker id (i64), IPv4 address (4 network-order octets), verdict (i32),
/// share difficulty (u64). Integers are little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Share {
    pub timestamp: u32,
    pub user_id: i32,
    pub worker_id: i64,
    pub ip: Ipv4Addr,
    pub verdict: ShareVerdict,
    pub weight: u64,
}

impl Share {
    /// Decode a share from its fixed-size frame.
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() != SHARE_FRAME_LEN {
            return Err(FrameError::Length { actual: buf.len() });
        }

        let mut u32buf = [0u8; 4];
        let mut u64buf = [0u8; 8];

        u32buf.copy_from_slice(&buf[0..4]);
        let timestamp = u32::from_le_bytes(u32buf);
        u32buf.copy_from_slice(&buf[4..8]);
        let user_id = i32::from_le_bytes(u32buf);
        u64buf.copy_from_slice(&buf[8..16]);
        let worker_id = i64::from_le_bytes(u64buf);
        u32buf.copy_from_slice(&buf[16..20]);
        let ip = Ipv4Addr::from(u32buf);
        u32buf.copy_from_slice(&buf[20..24]);
        let verdict = ShareVerdict::try_from(i32::from_le_bytes(u32buf))?;
        u64buf.copy_from_slice(&buf[24..32]);
        let weight = u64::from_le_bytes(u64buf);

        Ok(Share {
            timestamp,
            user_id,
            worker_id,
            ip,
            verdict,
            weight,
        })
    }

    /// Encode this share into its fixed-size frame.
    pub fn encode(&self) -> [u8; SHARE_FRAME_LEN] {
        let mut buf = [0u8; SHARE_FRAME_LEN];
        buf[0..4].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[4..8].copy_from_slice(&self.user_id.to_le_bytes());
        buf[8..16].copy_from_slice(&self.worker_id.to_le_bytes());
        buf[16..20].copy_from_slice(&self.ip.octets());
        buf[20..24].copy_from_slice(&(self.verdict as i32).to_le_bytes());
        buf[24..32].copy_from_slice(&self.weight.to_le_bytes());
        buf
    }

    /// Screen out malformed records before they reach the accumulators.
    pub fn is_valid(&self) -> bool {
        self.user_id > 0 && self.timestamp != 0
    }
}

/// Identity key: a worker under a user.
///
/// `worker_id == 0` is reserved: it addresses the aggregate across all of
/// that user's workers rather than a real worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerKey {
    pub user_id: i32,
    pub worker_id: i64,
}

impl WorkerKey {
    pub const fn new(user_id: i32, worker_id: i64) -> Self {
        Self { user_id, worker_id }
    }

    /// Aggregate across all workers of one user.
    pub const fn user_aggregate(user_id: i32) -> Self {
        Self::new(user_id, 0)
    }

    /// The pool-wide accumulator identity.
    pub const fn pool() -> Self {
        Self::new(0, 0)
    }

    pub const fn is_aggregate(&self) -> bool {
        self.worker_id == 0
    }
}
