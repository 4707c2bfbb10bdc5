//! Sliding-window share statistics for mining identities.
//!
//! This crate holds the in-memory accounting used by the stats HTTP service:
//! per-identity windowed accept/reject accumulators, a concurrent registry of
//! live identities with idle eviction, and the snapshot/merge types served
//! over the query API.

pub mod clock;
pub mod registry;
pub mod types;
pub mod window;
pub mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use registry::Registry;
pub use types::{FrameError, Share, ShareVerdict, WorkerKey, SHARE_FRAME_LEN, WINDOW_SECS};
pub use window::WindowCounter;
pub use worker::{WorkerShares, WorkerStatus};
