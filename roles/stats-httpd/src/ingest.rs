//! Share-log consume loop.

use std::sync::Arc;
use std::time::Duration;

use share_stats::{Share, SHARE_FRAME_LEN, WINDOW_SECS};
use thiserror::Error;
use tracing::{error, info};

use crate::server::{StatsServer, EXPIRE_INTERVAL_SECS};
use crate::source::{LogFrame, ShareLogSource, SourceError, StartPosition};

/// Warm-start position: this many events behind the tail, so the first
/// queries after boot already reflect recent activity.
pub const TAIL_OFFSET: u64 = 10_000 * (WINDOW_SECS / 10);

/// Poll timeout; bounds how quickly the loop observes a stop request.
pub const POLL_TIMEOUT: Duration = Duration::from_millis(1000);

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("share log source: {0}")]
    Source(#[from] SourceError),
    #[error("fatal share log error: {0}")]
    Fatal(String),
}

/// Attach the source at the warm-start position and verify it is reachable.
/// Called before the consume task is spawned so startup fails fast.
pub async fn setup(source: &mut dyn ShareLogSource) -> Result<(), IngestError> {
    source.attach(StartPosition::TailOffset(TAIL_OFFSET)).await?;
    if !source.check_alive().await {
        return Err(IngestError::Source(SourceError::NotAlive));
    }
    Ok(())
}

/// Consume frames until the server stops or the source reports a fatal
/// condition. Idle identities are swept out on a fixed wall-clock interval.
pub async fn run_loop(
    server: Arc<StatsServer>,
    mut source: Box<dyn ShareLogSource>,
) -> Result<(), IngestError> {
    info!("share log consume loop started");
    let mut last_sweep = server.clock().now_secs();

    while server.is_running() {
        let frame = match source.poll(POLL_TIMEOUT).await {
            Some(frame) => frame,
            None => continue,
        };

        match frame {
            LogFrame::Data(payload) => consume_frame(&server, &payload),
            LogFrame::EndOfLog => {}
            LogFrame::Error(msg) => error!("share log error: {}", msg),
            LogFrame::Fatal(msg) => {
                error!("fatal share log error: {}", msg);
                server.stop();
                return Err(IngestError::Fatal(msg));
            }
        }

        let now = server.clock().now_secs();
        if last_sweep + EXPIRE_INTERVAL_SECS < now {
            let removed = server.registry().evict_expired();
            info!("removed expired workers: {}", removed);
            last_sweep = now;
        }
    }

    info!("share log consume loop stopped");
    Ok(())
}

/// Screen one data frame and fold it into the statistics.
pub(crate) fn consume_frame(server: &StatsServer, payload: &[u8]) {
    if payload.len() != SHARE_FRAME_LEN {
        error!(
            "share frame size {} is not {}",
            payload.len(),
            SHARE_FRAME_LEN
        );
        return;
    }

    let share = match Share::decode(payload) {
        Ok(share) => share,
        Err(err) => {
            error!("bad share frame: {}", err);
            return;
        }
    };

    if !share.is_valid() {
        error!("invalid share: {:?}", share);
        return;
    }

    server.process_share(&share);
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use share_stats::{ManualClock, ShareVerdict, WorkerKey};
    use std::collections::VecDeque;
    use std::net::Ipv4Addr;

    const T: u32 = 1_700_000_000;

    fn share(user_id: i32, worker_id: i64, timestamp: u32) -> Share {
        Share {
            timestamp,
            user_id,
            worker_id,
            ip: Ipv4Addr::new(1, 2, 3, 4),
            verdict: ShareVerdict::Accept,
            weight: 100,
        }
    }

    fn server_at(now: u64) -> (Arc<ManualClock>, Arc<StatsServer>) {
        let clock = Arc::new(ManualClock::new(now));
        let server = Arc::new(StatsServer::new(clock.clone()));
        (clock, server)
    }

    fn worker_count(server: &StatsServer) -> u64 {
        server.server_status().worker_count
    }

    #[test]
    fn test_consume_frame_accepts_valid_share() {
        let (_, server) = server_at(T as u64);
        consume_frame(&server, &share(7, 42, T).encode());
        assert_eq!(worker_count(&server), 1);
    }

    #[test]
    fn test_consume_frame_drops_wrong_length() {
        let (_, server) = server_at(T as u64);
        consume_frame(&server, &[0u8; 31]);
        consume_frame(&server, &[0u8; 64]);
        assert_eq!(worker_count(&server), 0);
    }

    #[test]
    fn test_consume_frame_drops_unknown_verdict() {
        let (_, server) = server_at(T as u64);
        let mut frame = share(7, 42, T).encode();
        frame[20..24].copy_from_slice(&5i32.to_le_bytes());
        consume_frame(&server, &frame);
        assert_eq!(worker_count(&server), 0);
    }

    #[test]
    fn test_consume_frame_drops_invalid_share() {
        let (_, server) = server_at(T as u64);
        consume_frame(&server, &share(0, 42, T).encode());
        assert_eq!(worker_count(&server), 0);
    }

    /// Scripted source for driving the loop: frames to deliver, interleaved
    /// with clock jumps and a final stop request.
    enum Step {
        Frame(LogFrame),
        AdvanceClock(u64),
        Stop,
    }

    struct ScriptedSource {
        steps: VecDeque<Step>,
        clock: Arc<ManualClock>,
        server: Arc<StatsServer>,
    }

    #[async_trait]
    impl ShareLogSource for ScriptedSource {
        async fn attach(&mut self, _start: StartPosition) -> Result<(), SourceError> {
            Ok(())
        }

        async fn check_alive(&mut self) -> bool {
            true
        }

        async fn poll(&mut self, _timeout: Duration) -> Option<LogFrame> {
            loop {
                match self.steps.pop_front() {
                    Some(Step::Frame(frame)) => return Some(frame),
                    Some(Step::AdvanceClock(secs)) => self.clock.advance(secs),
                    Some(Step::Stop) => {
                        self.server.stop();
                        return None;
                    }
                    None => return None,
                }
            }
        }
    }

    #[tokio::test]
    async fn test_run_loop_processes_shares_then_stops() {
        let (clock, server) = server_at(T as u64);
        let source = ScriptedSource {
            steps: VecDeque::from([
                Step::Frame(LogFrame::Data(share(7, 42, T).encode().to_vec())),
                Step::Frame(LogFrame::EndOfLog),
                Step::Frame(LogFrame::Error("transient".to_string())),
                Step::Frame(LogFrame::Data(share(7, 43, T).encode().to_vec())),
                Step::Stop,
            ]),
            clock,
            server: server.clone(),
        };

        let result = run_loop(server.clone(), Box::new(source)).await;
        assert!(result.is_ok());
        assert_eq!(worker_count(&server), 2);
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_run_loop_fatal_frame_stops_the_server() {
        let (clock, server) = server_at(T as u64);
        let source = ScriptedSource {
            steps: VecDeque::from([
                Step::Frame(LogFrame::Data(share(7, 42, T).encode().to_vec())),
                Step::Frame(LogFrame::Fatal("unknown topic".to_string())),
            ]),
            clock,
            server: server.clone(),
        };

        let result = run_loop(server.clone(), Box::new(source)).await;
        assert!(matches!(result, Err(IngestError::Fatal(_))));
        assert!(!server.is_running());
        assert_eq!(worker_count(&server), 1, "shares before the failure still count");
    }

    #[tokio::test]
    async fn test_run_loop_sweeps_expired_identities() {
        let (clock, server) = server_at(T as u64);
        let source = ScriptedSource {
            steps: VecDeque::from([
                Step::Frame(LogFrame::Data(share(7, 42, T).encode().to_vec())),
                Step::AdvanceClock(EXPIRE_INTERVAL_SECS + 1),
                Step::Frame(LogFrame::EndOfLog),
                Step::Stop,
            ]),
            clock,
            server: server.clone(),
        };

        run_loop(server.clone(), Box::new(source)).await.unwrap();

        assert_eq!(worker_count(&server), 0, "idle identity must be evicted");
        assert!(server
            .registry()
            .batch_lookup(&[WorkerKey::new(7, 42)])[0]
            .is_none());
    }
}
