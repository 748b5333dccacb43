//! Realtime change notification channel.
//!
//! Wraps a provider subscription into "something changed" pulses and a
//! health snapshot the delta loop consumes to adapt its cadence.
//! Missed heartbeats degrade the channel; a dropped subscription fails
//! it. Transitions are logged once, with the time spent in the
//! previous state.

use parking_lot::Mutex;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

/// Heartbeats missed before the channel counts as degraded.
const DEGRADED_AFTER: u32 = 2;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Health {
    Healthy,
    Degraded,
    Failed,
}

#[derive(Clone, Debug)]
pub struct HealthSnapshot {
    pub status: Health,
    pub missed_heartbeats: u32,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub reconnect_count: u32,
}

struct MonitorState {
    status: Health,
    missed_heartbeats: u32,
    consecutive_failures: u32,
    last_error: Option<String>,
    reconnect_count: u32,
    since: Instant,
}

impl MonitorState {
    fn transition(&mut self, to: Health) {
        if self.status == to {
            return;
        }
        let spent = self.since.elapsed();
        match to {
            Health::Healthy => info!(after_ms = spent.as_millis() as u64, "realtime channel healthy"),
            Health::Degraded => debug!(after_ms = spent.as_millis() as u64, "realtime channel degraded"),
            Health::Failed => warn!(after_ms = spent.as_millis() as u64, "realtime channel failed"),
        }
        self.status = to;
        self.since = Instant::now();
    }
}

pub struct Notifier {
    pulses: flume::Receiver<()>,
    state: Arc<Mutex<MonitorState>>,
}

impl Notifier {
    /// Monitor `source`, forwarding pulses and tracking health by
    /// heartbeat cadence.
    pub fn spawn(
        source: flume::Receiver<()>,
        heartbeat: Duration,
        cancel: CancellationToken,
        tracker: &TaskTracker,
    ) -> Notifier {
        let (out_tx, out_rx) = flume::unbounded();
        let state = Arc::new(Mutex::new(MonitorState {
            status: Health::Healthy,
            missed_heartbeats: 0,
            consecutive_failures: 0,
            last_error: None,
            reconnect_count: 0,
            since: Instant::now(),
        }));

        let monitor = state.clone();
        tracker.spawn(async move {
            loop {
                let pulse = tokio::select! {
                    _ = cancel.cancelled() => break,
                    pulse = tokio::time::timeout(heartbeat, source.recv_async()) => pulse,
                };
                match pulse {
                    Ok(Ok(())) => {
                        let mut state = monitor.lock();
                        state.missed_heartbeats = 0;
                        state.consecutive_failures = 0;
                        state.transition(Health::Healthy);
                        drop(state);
                        let _ = out_tx.send(());
                    }
                    Err(_elapsed) => {
                        let mut state = monitor.lock();
                        state.missed_heartbeats += 1;
                        if state.missed_heartbeats >= DEGRADED_AFTER {
                            state.transition(Health::Degraded);
                        }
                    }
                    Ok(Err(_disconnected)) => {
                        let mut state = monitor.lock();
                        state.consecutive_failures += 1;
                        state.last_error = Some("subscription channel closed".to_owned());
                        state.transition(Health::Failed);
                        break;
                    }
                }
            }
        });

        Notifier {
            pulses: out_rx,
            state,
        }
    }

    /// Pulse stream consumed by the delta loop.
    pub fn pulses(&self) -> flume::Receiver<()> {
        self.pulses.clone()
    }

    pub fn health(&self) -> HealthSnapshot {
        let state = self.state.lock();
        HealthSnapshot {
            status: state.status,
            missed_heartbeats: state.missed_heartbeats,
            consecutive_failures: state.consecutive_failures,
            last_error: state.last_error.clone(),
            reconnect_count: state.reconnect_count,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pulses_forward_and_keep_healthy() {
        let (tx, rx) = flume::unbounded();
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let notifier = Notifier::spawn(rx, Duration::from_secs(60), cancel.clone(), &tracker);

        tx.send(()).unwrap();
        notifier.pulses().recv_async().await.unwrap();
        assert_eq!(notifier.health().status, Health::Healthy);

        cancel.cancel();
        tracker.close();
        tracker.wait().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn missed_heartbeats_degrade() {
        let (_tx, rx) = flume::unbounded::<()>();
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let notifier = Notifier::spawn(rx, Duration::from_millis(5), cancel.clone(), &tracker);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(notifier.health().status, Health::Degraded);
        assert!(notifier.health().missed_heartbeats >= DEGRADED_AFTER);

        cancel.cancel();
        tracker.close();
        tracker.wait().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dropped_subscription_fails() {
        let (tx, rx) = flume::unbounded::<()>();
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let notifier = Notifier::spawn(rx, Duration::from_secs(60), cancel.clone(), &tracker);

        drop(tx);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(notifier.health().status, Health::Failed);
        assert_eq!(notifier.health().consecutive_failures, 1);

        cancel.cancel();
        tracker.close();
        tracker.wait().await;
    }
}
