// ----------------------------------------------------------------------------
// Timer - Durations Measured in Monotonic Ticks
// ----------------------------------------------------------------------------

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ForwardTarget, Forwarders, MetricCore, MetricState};
use crate::clock::SharedClock;
use crate::path::ContextPath;
use crate::reservoir::{Reservoir, Snapshot};

/// Where a timer stores its splits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerType {
    /// Stores locally and forwards to attached contexts.
    #[default]
    Default,
    /// Stores nothing; forwards to the parent context's timer and to
    /// attached contexts.
    ForwardOnly,
}

#[derive(Debug)]
struct TimerState {
    reservoir: Option<Box<dyn Reservoir>>,
}

impl MetricState for TimerState {
    fn reservoir(&self) -> Option<&dyn Reservoir> {
        self.reservoir.as_deref()
    }
}

#[derive(Debug)]
pub(crate) struct TimerCore {
    timer_type: TimerType,
    core: MetricCore<TimerState>,
}

impl TimerCore {
    fn record_at(&self, forwarded: Option<i64>, elapsed: i64, hops: usize) {
        if elapsed < 0 {
            debug!(
                target: "vitals::reservoir",
                path = %self.core.path,
                elapsed,
                "Dropping negative timer split"
            );
            return;
        }
        let now = {
            let mut state = self.core.state.lock();
            let now = self.core.stamp(&state, forwarded);
            if let Some(reservoir) = state.reservoir.as_mut() {
                reservoir.update(now, elapsed);
            }
            now
        };
        self.core.forwards.send(&self.core.path, now, elapsed, hops);
    }
}

impl ForwardTarget for TimerCore {
    fn receive(&self, timestamp: i64, value: i64, hops: usize) {
        self.record_at(Some(timestamp), value, hops);
    }
}

/// Records elapsed ticks (nanoseconds) at the wall-clock time the split
/// stopped.
#[derive(Debug, Clone, Default)]
pub struct Timer(Option<Arc<TimerCore>>);

impl Timer {
    /// Discards every split.
    pub const NOOP: Timer = Timer(None);

    pub(crate) fn new(
        path: ContextPath,
        clock: SharedClock,
        timer_type: TimerType,
        reservoir: Box<dyn Reservoir>,
        forwards: Forwarders,
    ) -> Self {
        let reservoir = match timer_type {
            TimerType::Default => Some(reservoir),
            TimerType::ForwardOnly => None,
        };
        Self(Some(Arc::new(TimerCore {
            timer_type,
            core: MetricCore::new("timer", path, clock, TimerState { reservoir }, forwards),
        })))
    }

    /// Start measuring.
    pub fn time(&self) -> Split {
        let start = self.0.as_ref().map_or(0, |core| core.core.clock.tick());
        Split {
            timer: self.0.clone(),
            start,
        }
    }

    /// Record an externally measured duration in ticks.
    pub fn record(&self, elapsed: i64) {
        if let Some(core) = &self.0 {
            core.record_at(None, elapsed, 0);
        }
    }

    pub fn timer_type(&self) -> Option<TimerType> {
        self.0.as_ref().map(|core| core.timer_type)
    }

    pub fn is_noop(&self) -> bool {
        self.0.is_none()
    }

    pub fn path(&self) -> Option<&ContextPath> {
        self.0.as_ref().map(|core| &core.core.path)
    }

    pub fn forward_count(&self) -> usize {
        self.0.as_ref().map_or(0, |core| core.core.forwards.len())
    }

    pub fn snapshot(&self) -> Option<Snapshot> {
        self.snapshot_at(None)
    }

    pub fn snapshot_at(&self, resolution: Option<i64>) -> Option<Snapshot> {
        self.0.as_ref()?.core.current(resolution)
    }

    pub fn snapshots(&self, start: i64, end: i64, resolution: i64) -> Vec<Snapshot> {
        self.0
            .as_ref()
            .map(|core| core.core.range(start, end, resolution))
            .unwrap_or_default()
    }

    pub fn all_snapshots(&self, resolution: Option<i64>) -> Vec<Snapshot> {
        self.0
            .as_ref()
            .map(|core| core.core.all(resolution))
            .unwrap_or_default()
    }

    pub(crate) fn forward_target(&self) -> Option<Arc<dyn ForwardTarget>> {
        self.0.clone().map(|core| core as Arc<dyn ForwardTarget>)
    }
}

/// A running measurement. Stopping consumes it.
#[derive(Debug)]
#[must_use = "a split records nothing until stopped"]
pub struct Split {
    timer: Option<Arc<TimerCore>>,
    start: i64,
}

impl Split {
    /// Ticks since the split started; 0 for a no-op timer.
    pub fn elapsed(&self) -> i64 {
        self.timer
            .as_ref()
            .map_or(0, |core| core.core.clock.tick() - self.start)
    }

    /// Record the elapsed ticks and return them. Negative durations (a
    /// misbehaving tick source) are dropped.
    pub fn stop(self) -> i64 {
        let Some(core) = self.timer else {
            return 0;
        };
        let elapsed = core.core.clock.tick() - self.start;
        core.record_at(None, elapsed, 0);
        elapsed
    }
}
