// ============================================================================
// METRIC FAMILY
// ============================================================================
// Counter, Timer, Meter and Aggregate handles. Each handle is either a live
// metric (shared core behind an `Arc`) or the no-op variant handed out for
// disabled contexts, which discards writes and reports no snapshots.
//
// Every live core follows the same discipline:
// - take its state token, stamp the observation and update the reservoir
// - release the token, then forward the stamped observation
//
// Local observations read the clock while the token is held, so writers
// reach the reservoir in timestamp order. Forwarded observations keep the
// source's timestamp, raised to the newest one the receiver has accepted
// when writers from several sources interleave.
// ============================================================================

mod aggregate;
mod counter;
mod meter;
mod timer;

use std::fmt::{self, Debug, Display, Formatter};
use std::str::FromStr;
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::clock::SharedClock;
use crate::error::ConfigError;
use crate::lock::StateLock;
use crate::path::ContextPath;
use crate::reservoir::{Reservoir, Snapshot};
use crate::MAX_FORWARD_DEPTH;

pub use aggregate::{Aggregate, AggregateType};
pub use counter::{Counter, CounterType};
pub use meter::Meter;
pub use timer::{Split, Timer, TimerType};

// ----------------------------------------------------------------------------
// 1 Metric Kinds & Filters
// ----------------------------------------------------------------------------

/// The four metric families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Counter,
    Timer,
    Meter,
    Aggregate,
}

impl MetricKind {
    pub const ALL: [MetricKind; 4] = [
        MetricKind::Counter,
        MetricKind::Timer,
        MetricKind::Meter,
        MetricKind::Aggregate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Timer => "timer",
            MetricKind::Meter => "meter",
            MetricKind::Aggregate => "aggregate",
        }
    }
}

impl Display for MetricKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        MetricKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(raw))
            .ok_or_else(|| ConfigError::UnknownMetricKind(raw.to_string()))
    }
}

/// Selects which bound metric a registry query accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MetricFilter {
    #[default]
    Any,
    Kind(MetricKind),
}

impl MetricFilter {
    pub fn accepts(&self, metric: &Metric) -> bool {
        match self {
            MetricFilter::Any => true,
            MetricFilter::Kind(kind) => metric.kind() == *kind,
        }
    }
}

impl From<MetricKind> for MetricFilter {
    fn from(kind: MetricKind) -> Self {
        MetricFilter::Kind(kind)
    }
}

// ----------------------------------------------------------------------------
// 2 The Metric Union
// ----------------------------------------------------------------------------

/// A metric bound to a context node.
#[derive(Debug, Clone)]
pub enum Metric {
    Counter(Counter),
    Timer(Timer),
    Meter(Meter),
    Aggregate(Aggregate),
}

impl Metric {
    pub fn kind(&self) -> MetricKind {
        match self {
            Metric::Counter(_) => MetricKind::Counter,
            Metric::Timer(_) => MetricKind::Timer,
            Metric::Meter(_) => MetricKind::Meter,
            Metric::Aggregate(_) => MetricKind::Aggregate,
        }
    }

    pub fn path(&self) -> Option<&ContextPath> {
        match self {
            Metric::Counter(m) => m.path(),
            Metric::Timer(m) => m.path(),
            Metric::Meter(m) => m.path(),
            Metric::Aggregate(m) => m.path(),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.path().is_none()
    }

    /// Current window at the finest resolution.
    pub fn snapshot(&self) -> Option<Snapshot> {
        self.snapshot_at(None)
    }

    pub fn snapshot_at(&self, resolution: Option<i64>) -> Option<Snapshot> {
        match self {
            Metric::Counter(m) => m.snapshot_at(resolution),
            Metric::Timer(m) => m.snapshot_at(resolution),
            Metric::Meter(m) => m.snapshot_at(resolution),
            Metric::Aggregate(m) => m.snapshot_at(resolution),
        }
    }

    pub fn snapshots(&self, start: i64, end: i64, resolution: i64) -> Vec<Snapshot> {
        match self {
            Metric::Counter(m) => m.snapshots(start, end, resolution),
            Metric::Timer(m) => m.snapshots(start, end, resolution),
            Metric::Meter(m) => m.snapshots(start, end, resolution),
            Metric::Aggregate(m) => m.snapshots(start, end, resolution),
        }
    }

    pub fn all_snapshots(&self, resolution: Option<i64>) -> Vec<Snapshot> {
        match self {
            Metric::Counter(m) => m.all_snapshots(resolution),
            Metric::Timer(m) => m.all_snapshots(resolution),
            Metric::Meter(m) => m.all_snapshots(resolution),
            Metric::Aggregate(m) => m.all_snapshots(resolution),
        }
    }

    pub fn as_counter(&self) -> Option<&Counter> {
        match self {
            Metric::Counter(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_timer(&self) -> Option<&Timer> {
        match self {
            Metric::Timer(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_meter(&self) -> Option<&Meter> {
        match self {
            Metric::Meter(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_aggregate(&self) -> Option<&Aggregate> {
        match self {
            Metric::Aggregate(m) => Some(m),
            _ => None,
        }
    }

    /// The live core as a forwarding destination; `None` for no-ops.
    pub(crate) fn forward_target(&self) -> Option<Arc<dyn ForwardTarget>> {
        match self {
            Metric::Counter(m) => m.forward_target(),
            Metric::Timer(m) => m.forward_target(),
            Metric::Meter(m) => m.forward_target(),
            Metric::Aggregate(m) => m.forward_target(),
        }
    }
}

impl From<Counter> for Metric {
    fn from(metric: Counter) -> Self {
        Metric::Counter(metric)
    }
}

impl From<Timer> for Metric {
    fn from(metric: Timer) -> Self {
        Metric::Timer(metric)
    }
}

impl From<Meter> for Metric {
    fn from(metric: Meter) -> Self {
        Metric::Meter(metric)
    }
}

impl From<Aggregate> for Metric {
    fn from(metric: Aggregate) -> Self {
        Metric::Aggregate(metric)
    }
}

// ----------------------------------------------------------------------------
// 3 Forwarding
// ----------------------------------------------------------------------------

/// Something that accepts observations forwarded from another metric.
///
/// `hops` counts how many forwarding edges the observation has crossed so
/// chains through attached contexts cannot loop forever.
pub(crate) trait ForwardTarget: Send + Sync + Debug {
    fn receive(&self, timestamp: i64, value: i64, hops: usize);
}

/// Non-owning fan-out list. Targets belong to their own contexts; a target
/// whose context dropped it is skipped silently.
#[derive(Debug, Clone, Default)]
pub(crate) struct Forwarders(Vec<Weak<dyn ForwardTarget>>);

impl Forwarders {
    pub(crate) fn new(targets: impl IntoIterator<Item = Arc<dyn ForwardTarget>>) -> Self {
        Self(targets.into_iter().map(|t| Arc::downgrade(&t)).collect())
    }

    pub(crate) fn len(&self) -> usize {
        self.0.len()
    }

    pub(crate) fn send(&self, path: &ContextPath, timestamp: i64, value: i64, hops: usize) {
        if self.0.is_empty() {
            return;
        }
        if hops >= MAX_FORWARD_DEPTH {
            warn!(
                target: "vitals::forward",
                path = %path,
                hops,
                "Forwarding chain too deep, observation not forwarded further"
            );
            return;
        }
        for target in self.0.iter().filter_map(Weak::upgrade) {
            target.receive(timestamp, value, hops + 1);
        }
    }
}

// ----------------------------------------------------------------------------
// 4 Shared Core
// ----------------------------------------------------------------------------

/// State kept behind a metric's state token.
pub(crate) trait MetricState: Send {
    fn reservoir(&self) -> Option<&dyn Reservoir>;
}

/// Identity, clock, locked state and forward targets of a live metric.
#[derive(Debug)]
pub(crate) struct MetricCore<S> {
    pub(crate) path: ContextPath,
    pub(crate) clock: SharedClock,
    pub(crate) state: StateLock<S>,
    pub(crate) forwards: Forwarders,
}

impl<S: MetricState> MetricCore<S> {
    pub(crate) fn new(
        label: &'static str,
        path: ContextPath,
        clock: SharedClock,
        state: S,
        forwards: Forwarders,
    ) -> Self {
        Self {
            path,
            clock,
            state: StateLock::new(label, state),
            forwards,
        }
    }

    /// Timestamp of an observation about to be stored into `state`, which
    /// the caller holds. `forwarded` carries the source's timestamp.
    pub(crate) fn stamp(&self, state: &S, forwarded: Option<i64>) -> i64 {
        match forwarded {
            None => self.clock.time_millis(),
            Some(timestamp) => state
                .reservoir()
                .and_then(|r| r.last_timestamp())
                .map_or(timestamp, |last| timestamp.max(last)),
        }
    }

    pub(crate) fn current(&self, resolution: Option<i64>) -> Option<Snapshot> {
        let now = self.clock.time_millis();
        let state = self.state.lock();
        state
            .reservoir()?
            .snapshot(now, resolution)
            .map(|s| s.with_path(&self.path))
    }

    pub(crate) fn range(&self, start: i64, end: i64, resolution: i64) -> Vec<Snapshot> {
        let state = self.state.lock();
        state
            .reservoir()
            .map(|r| r.snapshots(start, end, resolution))
            .unwrap_or_default()
            .into_iter()
            .map(|s| s.with_path(&self.path))
            .collect()
    }

    pub(crate) fn all(&self, resolution: Option<i64>) -> Vec<Snapshot> {
        let now = self.clock.time_millis();
        let state = self.state.lock();
        state
            .reservoir()
            .map(|r| r.all_snapshots(now, resolution))
            .unwrap_or_default()
            .into_iter()
            .map(|s| s.with_path(&self.path))
            .collect()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_kind_parsing() {
        assert_eq!("Timer".parse::<MetricKind>(), Ok(MetricKind::Timer));
        assert_eq!(
            "histogram".parse::<MetricKind>(),
            Err(ConfigError::UnknownMetricKind("histogram".into()))
        );
        assert_eq!(MetricKind::Aggregate.to_string(), "aggregate");
    }

    #[test]
    fn test_filter() {
        let metric = Metric::Meter(Meter::NOOP);
        assert!(MetricFilter::Any.accepts(&metric));
        assert!(MetricFilter::from(MetricKind::Meter).accepts(&metric));
        assert!(!MetricFilter::Kind(MetricKind::Counter).accepts(&metric));
        assert!(metric.is_noop());
        assert!(metric.snapshot().is_none());
    }

    #[derive(Debug, Default)]
    struct Sink(parking_lot::Mutex<Vec<(i64, i64, usize)>>);

    impl ForwardTarget for Sink {
        fn receive(&self, timestamp: i64, value: i64, hops: usize) {
            self.0.lock().push((timestamp, value, hops));
        }
    }

    #[test]
    fn test_forwarders_skip_dropped_targets_and_cap_depth() {
        let kept = Arc::new(Sink::default());
        let dropped: Arc<dyn ForwardTarget> = Arc::new(Sink::default());
        let forwards = Forwarders::new([kept.clone() as Arc<dyn ForwardTarget>, dropped.clone()]);
        drop(dropped);

        let path = ContextPath::from("a");
        forwards.send(&path, 5, 7, 0);
        forwards.send(&path, 6, 8, MAX_FORWARD_DEPTH);
        assert_eq!(*kept.0.lock(), vec![(5, 7, 1)]);
        assert_eq!(forwards.len(), 2);
    }
}
