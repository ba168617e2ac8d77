// ----------------------------------------------------------------------------
// Meter - Event Rates
// ----------------------------------------------------------------------------

use std::sync::Arc;

use super::{ForwardTarget, Forwarders, MetricCore, MetricState};
use crate::clock::SharedClock;
use crate::path::ContextPath;
use crate::reservoir::{RateMode, Reservoir, Snapshot};

#[derive(Debug)]
struct MeterState {
    reservoir: Box<dyn Reservoir>,
}

impl MetricState for MeterState {
    fn reservoir(&self) -> Option<&dyn Reservoir> {
        Some(self.reservoir.as_ref())
    }
}

#[derive(Debug)]
pub(crate) struct MeterCore {
    core: MetricCore<MeterState>,
}

impl MeterCore {
    fn mark_at(&self, forwarded: Option<i64>, events: i64, hops: usize) {
        let now = {
            let mut state = self.core.state.lock();
            let now = self.core.stamp(&state, forwarded);
            state.reservoir.update(now, events);
            now
        };
        self.core.forwards.send(&self.core.path, now, events, hops);
    }
}

impl ForwardTarget for MeterCore {
    fn receive(&self, timestamp: i64, value: i64, hops: usize) {
        self.mark_at(Some(timestamp), value, hops);
    }
}

/// Stores each marked count as-is. Snapshots carry the rate mode used by
/// [`Snapshot::mean_rate`]: the live window is rated absolutely, history
/// relatively.
#[derive(Debug, Clone, Default)]
pub struct Meter(Option<Arc<MeterCore>>);

impl Meter {
    /// Discards every mark.
    pub const NOOP: Meter = Meter(None);

    pub(crate) fn new(
        path: ContextPath,
        clock: SharedClock,
        reservoir: Box<dyn Reservoir>,
        forwards: Forwarders,
    ) -> Self {
        Self(Some(Arc::new(MeterCore {
            core: MetricCore::new("meter", path, clock, MeterState { reservoir }, forwards),
        })))
    }

    pub fn mark(&self, events: i64) {
        if let Some(core) = &self.0 {
            core.mark_at(None, events, 0);
        }
    }

    pub fn mark_one(&self) {
        self.mark(1);
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
        self.0
            .as_ref()?
            .core
            .current(resolution)
            .map(|s| s.with_rate_mode(RateMode::Absolute))
    }

    pub fn snapshots(&self, start: i64, end: i64, resolution: i64) -> Vec<Snapshot> {
        self.0
            .as_ref()
            .map(|core| core.core.range(start, end, resolution))
            .unwrap_or_default()
            .into_iter()
            .map(|s| s.with_rate_mode(RateMode::Relative))
            .collect()
    }

    pub fn all_snapshots(&self, resolution: Option<i64>) -> Vec<Snapshot> {
        self.0
            .as_ref()
            .map(|core| core.core.all(resolution))
            .unwrap_or_default()
            .into_iter()
            .map(|s| s.with_rate_mode(RateMode::Relative))
            .collect()
    }

    pub(crate) fn forward_target(&self) -> Option<Arc<dyn ForwardTarget>> {
        self.0.clone().map(|core| core as Arc<dyn ForwardTarget>)
    }
}
