//! Per-identity share accumulator and its query-side snapshot.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use crate::clock::Clock;
use crate::types::{Share, ShareVerdict, WINDOW_SECS};
use crate::window::WindowCounter;

/// Point-in-time view of one identity's windowed statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStatus {
    pub accept_1m: u64,
    pub accept_5m: u64,
    pub accept_15m: u64,
    pub reject_15m: u64,
    pub accept_count: u32,
    pub last_share_ip: Ipv4Addr,
    pub last_share_time: u32,
}

impl Default for WorkerStatus {
    fn default() -> Self {
        Self {
            accept_1m: 0,
            accept_5m: 0,
            accept_15m: 0,
            accept_count: 0,
            reject_15m: 0,
            last_share_ip: Ipv4Addr::UNSPECIFIED,
            last_share_time: 0,
        }
    }
}

impl WorkerStatus {
    /// Collapse several statuses into one synthetic row: windowed sums and
    /// accept counts add up, the last-share fields follow the entry with the
    /// newest share (later entries win ties).
    pub fn merge(statuses: &[WorkerStatus]) -> WorkerStatus {
        let mut merged = WorkerStatus::default();
        for status in statuses {
            merged.accept_1m += status.accept_1m;
            merged.accept_5m += status.accept_5m;
            merged.accept_15m += status.accept_15m;
            merged.reject_15m += status.reject_15m;
            merged.accept_count += status.accept_count;

            if status.last_share_time >= merged.last_share_time {
                merged.last_share_time = status.last_share_time;
                merged.last_share_ip = status.last_share_ip;
            }
        }
        merged
    }
}

struct WorkerState {
    accept_count: u32,
    accept_by_sec: WindowCounter,
    reject_by_min: WindowCounter,
    last_share_ip: Ipv4Addr,
    last_share_time: u32,
}

/// Windowed accept/reject accumulator for one (user, worker) identity.
///
/// Accepted difficulty is bucketed per second over the full window; rejected
/// difficulty per minute. Shares older than the window are dropped on entry,
/// which also keeps ring-slot aliasing impossible.
pub struct WorkerShares {
    worker_id: i64,
    user_id: i32,
    clock: Arc<dyn Clock>,
    state: Mutex<WorkerState>,
}

impl WorkerShares {
    pub fn new(worker_id: i64, user_id: i32, clock: Arc<dyn Clock>) -> Self {
        Self {
            worker_id,
            user_id,
            clock,
            state: Mutex::new(WorkerState {
                accept_count: 0,
                accept_by_sec: WindowCounter::new(WINDOW_SECS as usize),
                reject_by_min: WindowCounter::new((WINDOW_SECS / 60) as usize),
                last_share_ip: Ipv4Addr::UNSPECIFIED,
                last_share_time: 0,
            }),
        }
    }

    pub fn worker_id(&self) -> i64 {
        self.worker_id
    }

    pub fn user_id(&self) -> i32 {
        self.user_id
    }

    /// Fold one share into the accumulators. Shares older than the window
    /// are discarded without touching any state.
    pub fn process_share(&self, share: &Share) {
        let now = self.clock.now_secs();
        if now > share.timestamp as u64 + WINDOW_SECS {
            return;
        }

        let mut state = self.state.lock().unwrap();
        match share.verdict {
            ShareVerdict::Accept => {
                state.accept_count += 1;
                state.accept_by_sec.insert(share.timestamp as i64, share.weight);
            }
            ShareVerdict::Reject => {
                state
                    .reject_by_min
                    .insert((share.timestamp / 60) as i64, share.weight);
            }
        }
        state.last_share_ip = share.ip;
        state.last_share_time = share.timestamp;
    }

    /// Snapshot the windowed sums as of now.
    pub fn status(&self) -> WorkerStatus {
        let state = self.state.lock().unwrap();
        let now = self.clock.now_secs() as i64;

        WorkerStatus {
            accept_1m: state.accept_by_sec.sum(now, 60),
            accept_5m: state.accept_by_sec.sum(now, 300),
            accept_15m: state.accept_by_sec.sum(now, 900),
            reject_15m: state.reject_by_min.sum(now / 60, 15),
            accept_count: state.accept_count,
            last_share_ip: state.last_share_ip,
            last_share_time: state.last_share_time,
        }
    }

    /// An identity is expired once it has been silent for a full window.
    pub fn is_expired(&self) -> bool {
        let state = self.state.lock().unwrap();
        (state.last_share_time as u64 + WINDOW_SECS) < self.clock.now_secs()
    }
}
