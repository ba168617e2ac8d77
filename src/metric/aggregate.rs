// ----------------------------------------------------------------------------
// Aggregate - Arbitrary Values, Optionally Summed Upstream
// ----------------------------------------------------------------------------

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{ForwardTarget, Forwarders, MetricCore, MetricState};
use crate::clock::SharedClock;
use crate::path::ContextPath;
use crate::reservoir::{Reservoir, Snapshot};

/// Storage and forwarding policy of an aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateType {
    /// Stores the running total; forwards raw values to the parent
    /// context's sum aggregate.
    #[default]
    Sum,
    /// Stores raw values.
    Simple,
    /// Stores nothing; forwards raw values to the parent context's sum
    /// aggregate.
    ForwardOnly,
}

#[derive(Debug)]
struct AggregateState {
    total: i64,
    reservoir: Option<Box<dyn Reservoir>>,
}

impl MetricState for AggregateState {
    fn reservoir(&self) -> Option<&dyn Reservoir> {
        self.reservoir.as_deref()
    }
}

#[derive(Debug)]
pub(crate) struct AggregateCore {
    aggregate_type: AggregateType,
    core: MetricCore<AggregateState>,
}

impl AggregateCore {
    fn update_at(&self, forwarded: Option<i64>, value: i64, hops: usize) {
        let now = {
            let mut state = self.core.state.lock();
            let now = self.core.stamp(&state, forwarded);
            state.total = state.total.wrapping_add(value);
            let stored = match self.aggregate_type {
                AggregateType::Sum => state.total,
                AggregateType::Simple | AggregateType::ForwardOnly => value,
            };
            if let Some(reservoir) = state.reservoir.as_mut() {
                reservoir.update(now, stored);
            }
            now
        };
        self.core.forwards.send(&self.core.path, now, value, hops);
    }
}

impl ForwardTarget for AggregateCore {
    fn receive(&self, timestamp: i64, value: i64, hops: usize) {
        self.update_at(Some(timestamp), value, hops);
    }
}

#[derive(Debug, Clone, Default)]
pub struct Aggregate(Option<Arc<AggregateCore>>);

impl Aggregate {
    /// Discards every value.
    pub const NOOP: Aggregate = Aggregate(None);

    pub(crate) fn new(
        path: ContextPath,
        clock: SharedClock,
        aggregate_type: AggregateType,
        reservoir: Box<dyn Reservoir>,
        forwards: Forwarders,
    ) -> Self {
        let reservoir = match aggregate_type {
            AggregateType::ForwardOnly => None,
            AggregateType::Sum | AggregateType::Simple => Some(reservoir),
        };
        let state = AggregateState { total: 0, reservoir };
        Self(Some(Arc::new(AggregateCore {
            aggregate_type,
            core: MetricCore::new("aggregate", path, clock, state, forwards),
        })))
    }

    pub fn update(&self, value: i64) {
        if let Some(core) = &self.0 {
            core.update_at(None, value, 0);
        }
    }

    /// Running total of every value seen (forwarded ones included); `None`
    /// unless this is a live sum aggregate.
    pub fn total(&self) -> Option<i64> {
        let core = self.0.as_ref()?;
        (core.aggregate_type == AggregateType::Sum).then(|| core.core.state.lock().total)
    }

    pub fn aggregate_type(&self) -> Option<AggregateType> {
        self.0.as_ref().map(|core| core.aggregate_type)
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::testing;
    use pretty_assertions::assert_eq;

    fn aggregate(shared: &SharedClock, path: &str, ty: AggregateType, forwards: Forwarders) -> Aggregate {
        Aggregate::new(ContextPath::from(path), shared.clone(), ty, testing::reservoir(0), forwards)
    }

    #[test]
    fn test_sum_stores_total_and_forwards_raw() {
        let (_clock, shared) = testing::clock();
        let parent = aggregate(&shared, "p", AggregateType::Sum, Forwarders::default());
        let child = aggregate(&shared, "p/c", AggregateType::Sum, Forwarders::new(parent.forward_target()));
        child.update(4);
        child.update(6);
        parent.update(1);

        assert_eq!(child.snapshot().unwrap().raw_values, Some(vec![4, 10]));
        assert_eq!(child.total(), Some(10));
        // parent totals its own raw inputs: 4, 6, then its local 1
        assert_eq!(parent.snapshot().unwrap().raw_values, Some(vec![4, 10, 11]));
        assert_eq!(parent.total(), Some(11));
    }

    #[test]
    fn test_simple_stores_raw_values() {
        let (_clock, shared) = testing::clock();
        let simple = aggregate(&shared, "s", AggregateType::Simple, Forwarders::default());
        simple.update(4);
        simple.update(6);
        assert_eq!(simple.snapshot().unwrap().raw_values, Some(vec![4, 6]));
        assert_eq!(simple.total(), None);
    }

    #[test]
    fn test_forward_only() {
        let (_clock, shared) = testing::clock();
        let parent = aggregate(&shared, "p", AggregateType::Sum, Forwarders::default());
        let child = aggregate(&shared, "p/c", AggregateType::ForwardOnly, Forwarders::new(parent.forward_target()));
        child.update(9);
        assert!(child.snapshot().is_none());
        assert_eq!(parent.total(), Some(9));
    }
}
