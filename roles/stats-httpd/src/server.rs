use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use share_stats::{Clock, Registry, Share, WorkerKey, WorkerShares, WorkerStatus, WINDOW_SECS};
use tokio::sync::watch;

use crate::api;
use crate::ingest;
use crate::source::ShareLogSource;

/// How often the ingest loop sweeps out idle identities.
pub const EXPIRE_INTERVAL_SECS: u64 = 1800;

/// Snapshot served by the `/` endpoint.
#[derive(Debug, Clone)]
pub struct ServerStatus {
    pub uptime_secs: u64,
    pub request_count: u64,
    pub response_bytes: u64,
    pub worker_count: u64,
    pub user_count: u64,
    pub pool: WorkerStatus,
}

/// Shared state of the service: the identity registry, the pool-wide
/// accumulator, and the HTTP counters.
///
/// Every admitted share fans out three ways: the pool accumulator, the
/// `(user, worker)` entry, and the `(user, 0)` user aggregate.
pub struct StatsServer {
    registry: Registry,
    pool_worker: WorkerShares,
    clock: Arc<dyn Clock>,
    up_since: u64,
    running: AtomicBool,
    request_count: AtomicU64,
    response_bytes: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
}

impl StatsServer {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            registry: Registry::new(clock.clone()),
            pool_worker: WorkerShares::new(0, 0, clock.clone()),
            up_since: clock.now_secs(),
            clock,
            running: AtomicBool::new(true),
            request_count: AtomicU64::new(0),
            response_bytes: AtomicU64::new(0),
            shutdown_tx,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Fan one share out to the pool, worker, and user-aggregate scopes.
    /// Shares older than the window are dropped here before touching any
    /// accumulator.
    pub fn process_share(&self, share: &Share) {
        let now = self.clock.now_secs();
        if now > share.timestamp as u64 + WINDOW_SECS {
            return;
        }

        self.pool_worker.process_share(share);
        self.registry
            .insert_or_update(WorkerKey::new(share.user_id, share.worker_id), share);
        self.registry
            .insert_or_update(WorkerKey::user_aggregate(share.user_id), share);
    }

    pub fn server_status(&self) -> ServerStatus {
        let (worker_count, user_count) = self.registry.total_counts();
        ServerStatus {
            uptime_secs: self.clock.now_secs().saturating_sub(self.up_since),
            request_count: self.request_count.load(Ordering::Relaxed),
            response_bytes: self.response_bytes.load(Ordering::Relaxed),
            worker_count,
            user_count,
            pool: self.pool_worker.status(),
        }
    }

    pub fn note_request(&self) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_response_bytes(&self, bytes: u64) {
        self.response_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Idempotent shutdown: flips the running flag and wakes the HTTP loop;
    /// the ingest loop notices on its next poll tick.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            let _ = self.shutdown_tx.send(true);
        }
    }

    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Attach to the share log (failing fast if it is unreachable), then run
    /// ingest and the HTTP server side by side until one of them stops.
    pub async fn run(
        self: &Arc<Self>,
        mut source: Box<dyn ShareLogSource>,
        http_address: &str,
    ) -> anyhow::Result<()> {
        ingest::setup(source.as_mut()).await?;

        let ingest_task = tokio::spawn(ingest::run_loop(Arc::clone(self), source));
        let http_result = api::run_http_server(http_address, Arc::clone(self)).await;

        self.stop();
        let ingest_result = ingest_task.await?;

        http_result?;
        ingest_result?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use share_stats::{ManualClock, ShareVerdict};
    use std::net::Ipv4Addr;

    const T: u32 = 1_700_000_000;

    fn share(user_id: i32, worker_id: i64, timestamp: u32, weight: u64) -> Share {
        Share {
            timestamp,
            user_id,
            worker_id,
            ip: Ipv4Addr::new(1, 2, 3, 4),
            verdict: ShareVerdict::Accept,
            weight,
        }
    }

    fn server_at(now: u64) -> (Arc<ManualClock>, StatsServer) {
        let clock = Arc::new(ManualClock::new(now));
        let server = StatsServer::new(clock.clone());
        (clock, server)
    }

    #[test]
    fn test_share_fans_out_to_three_scopes() {
        let (_, server) = server_at(T as u64);

        server.process_share(&share(7, 42, T, 100));
        server.process_share(&share(7, 43, T, 100));

        let status = server.server_status();
        assert_eq!(status.worker_count, 2);
        assert_eq!(status.user_count, 1);
        assert_eq!(status.pool.accept_15m, 200);
        assert_eq!(status.pool.accept_count, 2);

        let aggregate = server
            .registry()
            .batch_lookup(&[WorkerKey::user_aggregate(7)])
            .remove(0)
            .unwrap();
        assert_eq!(aggregate.status().accept_15m, 200);
        assert_eq!(aggregate.status().accept_count, 2);
        assert_eq!(server.registry().user_worker_count(7), 2);
    }

    #[test]
    fn test_stale_share_registers_nothing() {
        let (_, server) = server_at(T as u64);

        server.process_share(&share(7, 42, T - 1000, 100));

        let status = server.server_status();
        assert_eq!(status.worker_count, 0);
        assert_eq!(status.user_count, 0);
        assert_eq!(status.pool, WorkerStatus::default());
    }

    #[test]
    fn test_pool_accumulator_spans_users() {
        let (_, server) = server_at(T as u64);

        server.process_share(&share(7, 42, T, 100));
        server.process_share(&share(8, 99, T, 40));

        let status = server.server_status();
        assert_eq!(status.pool.accept_15m, 140);
        assert_eq!(status.worker_count, 2);
        assert_eq!(status.user_count, 2);
    }

    #[test]
    fn test_uptime_tracks_clock() {
        let (clock, server) = server_at(T as u64);
        clock.advance(3_725);
        assert_eq!(server.server_status().uptime_secs, 3_725);
    }

    #[test]
    fn test_stop_is_idempotent_and_signals_shutdown() {
        let (_, server) = server_at(T as u64);
        let mut shutdown = server.subscribe_shutdown();

        assert!(server.is_running());
        server.stop();
        server.stop();

        assert!(!server.is_running());
        assert!(shutdown.has_changed().unwrap());
    }
}
