//! Heartbeat and timeout monitoring.
//!
//! Two periodic tasks run beside the worker pool on their own spawned
//! tasks, so liveness checking never blocks on worker I/O: a ping task
//! that sends a no-op through every live worker's command link, and a
//! much more frequent timeout sweep that compares each running worker's
//! last activity against its configured timeout.
//!
//! Timeout detection is cooperative: the sweep marks the handle and asks
//! the worker to stop, it never forcibly kills. The explicit kill path is
//! [`WorkerRegistry::kill_all`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::warn;

use crate::worker::WorkerRegistry;

/// Interval between liveness pings.
pub const PING_INTERVAL: Duration = Duration::from_secs(10);

/// Interval between timeout sweeps.
pub const TIMEOUT_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// The running ping and timeout tasks for one dispatch.
pub struct WorkerMonitor {
    ping: JoinHandle<()>,
    sweep: JoinHandle<()>,
}

impl WorkerMonitor {
    /// Start both tasks against the given registry.
    pub fn start(registry: Arc<WorkerRegistry>) -> Self {
        let ping = {
            let registry = registry.clone();
            tokio::spawn(async move {
                let mut ticks = tokio::time::interval(PING_INTERVAL);
                loop {
                    ticks.tick().await;
                    registry.broadcast_noop();
                }
            })
        };

        let sweep = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(TIMEOUT_CHECK_INTERVAL);
            loop {
                ticks.tick().await;
                sweep_timeouts(&registry, Instant::now());
            }
        });

        Self { ping, sweep }
    }

    /// Stop both tasks.
    pub fn stop(self) {
        self.ping.abort();
        self.sweep.abort();
    }
}

/// One timeout sweep: mark every running worker whose idle time exceeds
/// its timeout, and ask it to stop.
fn sweep_timeouts(registry: &WorkerRegistry, now: Instant) {
    for handle in registry.snapshot() {
        if !handle.is_running() {
            continue;
        }
        if handle.idle_duration(now) > handle.timeout() && handle.mark_timed_out() {
            warn!(
                slot = handle.slot(),
                timeout_secs = handle.timeout().as_secs(),
                "worker exceeded its timeout; requesting stop"
            );
            handle.link().halt();
        }
    }
}
