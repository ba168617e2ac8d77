// ----------------------------------------------------------------------------
// Counter - Running Total
// ----------------------------------------------------------------------------

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{ForwardTarget, Forwarders, MetricCore, MetricState};
use crate::clock::SharedClock;
use crate::path::ContextPath;
use crate::reservoir::{Reservoir, Snapshot};

/// How a counter propagates deltas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterType {
    /// Forwards only to attached contexts.
    #[default]
    Default,
    /// Also forwards every delta to the parent context's counter, so a
    /// parent's total is the sum of its descendants' deltas.
    Hierarchical,
}

#[derive(Debug)]
struct CounterState {
    total: i64,
    reservoir: Box<dyn Reservoir>,
}

impl MetricState for CounterState {
    fn reservoir(&self) -> Option<&dyn Reservoir> {
        Some(self.reservoir.as_ref())
    }
}

#[derive(Debug)]
pub(crate) struct CounterCore {
    counter_type: CounterType,
    core: MetricCore<CounterState>,
}

impl CounterCore {
    fn apply(&self, delta: i64, forwarded: Option<i64>, hops: usize) {
        let now = {
            let mut state = self.core.state.lock();
            let now = self.core.stamp(&state, forwarded);
            state.total = state.total.wrapping_add(delta);
            let total = state.total;
            state.reservoir.update(now, total);
            now
        };
        self.core.forwards.send(&self.core.path, now, delta, hops);
    }
}

impl ForwardTarget for CounterCore {
    fn receive(&self, timestamp: i64, value: i64, hops: usize) {
        self.apply(value, Some(timestamp), hops);
    }
}

/// Integer running total. Each `inc`/`dec` stores the new total, not the
/// delta, in the reservoir.
#[derive(Debug, Clone, Default)]
pub struct Counter(Option<Arc<CounterCore>>);

impl Counter {
    /// Discards every write.
    pub const NOOP: Counter = Counter(None);

    pub(crate) fn new(
        path: ContextPath,
        clock: SharedClock,
        counter_type: CounterType,
        reservoir: Box<dyn Reservoir>,
        forwards: Forwarders,
    ) -> Self {
        let state = CounterState { total: 0, reservoir };
        Self(Some(Arc::new(CounterCore {
            counter_type,
            core: MetricCore::new("counter", path, clock, state, forwards),
        })))
    }

    pub fn inc(&self, delta: i64) {
        if let Some(core) = &self.0 {
            core.apply(delta, None, 0);
        }
    }

    pub fn inc_one(&self) {
        self.inc(1);
    }

    /// Negative deltas are accepted; the total may go below zero.
    pub fn dec(&self, delta: i64) {
        self.inc(delta.wrapping_neg());
    }

    pub fn dec_one(&self) {
        self.dec(1);
    }

    /// Current total; 0 for the no-op counter.
    pub fn count(&self) -> i64 {
        self.0.as_ref().map_or(0, |core| core.core.state.lock().total)
    }

    pub fn counter_type(&self) -> Option<CounterType> {
        self.0.as_ref().map(|core| core.counter_type)
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
