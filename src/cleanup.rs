// ============================================================================
// CLEANUP DAEMON
// ============================================================================
// Periodic CleanupCheck sweeps over the context tree. A sweep that would
// overlap a running one (manual or periodic) is skipped.
// ============================================================================

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::context::{CleanupReport, MonitoringContextTree};

/// Runs sweeps, one at a time.
#[derive(Debug)]
pub struct Sweeper {
    tree: Arc<MonitoringContextTree>,
    sweeping: AtomicBool,
    sweeps: AtomicU64,
}

/// Clears the sweeping flag even if the sweep panics.
struct SweepGuard<'a>(&'a AtomicBool);

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, AtomicOrdering::Release);
    }
}

impl Sweeper {
    pub fn new(tree: Arc<MonitoringContextTree>) -> Self {
        Self {
            tree,
            sweeping: AtomicBool::new(false),
            sweeps: AtomicU64::new(0),
        }
    }

    /// One sweep. `None` when another sweep is still running.
    pub fn sweep(&self) -> Option<CleanupReport> {
        if self.sweeping.swap(true, AtomicOrdering::AcqRel) {
            debug!(target: "vitals::cleanup", "Sweep already running, skipped");
            return None;
        }
        let _guard = SweepGuard(&self.sweeping);

        let start = Instant::now();
        let report = self.tree.cleanup();
        self.sweeps.fetch_add(1, AtomicOrdering::Relaxed);
        debug!(
            target: "vitals::cleanup",
            visited = report.visited_nodes,
            removed_metrics = report.removed_metrics,
            removed_nodes = report.removed_nodes,
            duration_us = start.elapsed().as_micros() as u64,
            "Cleanup sweep complete"
        );
        Some(report)
    }

    /// Completed sweeps so far.
    pub fn sweep_count(&self) -> u64 {
        self.sweeps.load(AtomicOrdering::Relaxed)
    }

    pub fn is_sweeping(&self) -> bool {
        self.sweeping.load(AtomicOrdering::Acquire)
    }
}

/// Handle to the background sweep task.
#[derive(Debug)]
pub struct CleanupDaemon {
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

impl CleanupDaemon {
    /// Start sweeping every `period`. Must be called inside a tokio runtime.
    pub fn spawn(sweeper: Arc<Sweeper>, period: Duration) -> Self {
        let shutdown = Arc::new(Notify::new());
        let signal = Arc::clone(&shutdown);

        let task = tokio::spawn(async move {
            let mut tick = interval_at(tokio::time::Instant::now() + period, period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let sweeper = Arc::clone(&sweeper);
                        if let Err(e) = tokio::task::spawn_blocking(move || sweeper.sweep()).await {
                            warn!(target: "vitals::cleanup", error = %e, "Cleanup sweep failed");
                        }
                    }
                    _ = signal.notified() => {
                        info!(target: "vitals::cleanup", "Cleanup daemon shutting down");
                        break;
                    }
                }
            }
        });

        info!(target: "vitals::cleanup", period_ms = period.as_millis() as u64, "Cleanup daemon started");
        Self { shutdown, task }
    }

    /// Stop the daemon and wait for the task to finish.
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        if let Err(e) = self.task.await {
            warn!(target: "vitals::cleanup", error = %e, "Cleanup daemon ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
