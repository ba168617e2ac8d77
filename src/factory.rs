// ============================================================================
// METRIC FACTORY
// ============================================================================
// Returns the metric bound to a context, building and binding it on first
// use. Disabled contexts get the no-op variant and no storage. A new metric's
// forward targets are wired once, here:
// - hierarchical counters, forward-only timers, sum and forward-only
//   aggregates forward to the same-kind metric of the parent context
// - every metric forwards to the same-kind metric of each attached context
// ============================================================================

use std::sync::Arc;

use ahash::AHashMap;
use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::context::{Context, MonitoringContextTree};
use crate::error::{ConfigError, ConfigResult, InvariantError, VitalsResult};
use crate::metric::{
    Aggregate, AggregateType, Counter, CounterType, ForwardTarget, Forwarders, Meter, Metric, MetricKind, Timer,
    TimerType,
};
use crate::path::ContextPath;
use crate::reservoir::{Reservoir, ReservoirSpec};
use crate::{DEFAULT_RESERVOIR, MAX_FORWARD_DEPTH};

/// Paths whose metrics are being built further up the current call.
type Chain = Vec<ContextPath>;

/// Builds metrics with the reservoir recipe assigned to each metric kind.
#[derive(Debug)]
pub struct MetricFactory {
    clock: SharedClock,
    reservoirs: AHashMap<MetricKind, ReservoirSpec>,
}

impl MetricFactory {
    /// `assignments` maps metric kinds to reservoir names; unassigned kinds
    /// use [`DEFAULT_RESERVOIR`]. Fails if an assigned name has no recipe.
    pub fn new(
        clock: SharedClock,
        specs: &[ReservoirSpec],
        assignments: &AHashMap<MetricKind, String>,
    ) -> ConfigResult<Self> {
        let mut reservoirs = AHashMap::with_capacity(MetricKind::ALL.len());
        for kind in MetricKind::ALL {
            let name = assignments.get(&kind).map_or(DEFAULT_RESERVOIR, String::as_str);
            let spec = specs
                .iter()
                .find(|s| s.name == name)
                .ok_or_else(|| ConfigError::MissingReservoir(name.to_string()))?;
            reservoirs.insert(kind, spec.clone());
        }
        Ok(Self { clock, reservoirs })
    }

    pub fn reservoir_spec(&self, kind: MetricKind) -> Option<&ReservoirSpec> {
        self.reservoirs.get(&kind)
    }

    fn reservoir(&self, kind: MetricKind) -> VitalsResult<Box<dyn Reservoir>> {
        let spec = self
            .reservoirs
            .get(&kind)
            .ok_or_else(|| ConfigError::MissingReservoir(kind.as_str().to_string()))?;
        Ok(spec.build(self.clock.time_millis()))
    }

    // ------------------------------------------------------------------------
    // Public entry points
    // ------------------------------------------------------------------------

    pub fn counter(&self, tree: &MonitoringContextTree, ctx: &Context, counter_type: CounterType) -> VitalsResult<Counter> {
        self.counter_at(tree, ctx, counter_type, &mut Vec::new())
    }

    pub fn timer(&self, tree: &MonitoringContextTree, ctx: &Context, timer_type: TimerType) -> VitalsResult<Timer> {
        self.timer_at(tree, ctx, timer_type, &mut Vec::new())
    }

    pub fn meter(&self, tree: &MonitoringContextTree, ctx: &Context) -> VitalsResult<Meter> {
        self.meter_at(tree, ctx, &mut Vec::new())
    }

    pub fn aggregate(
        &self,
        tree: &MonitoringContextTree,
        ctx: &Context,
        aggregate_type: AggregateType,
    ) -> VitalsResult<Aggregate> {
        self.aggregate_at(tree, ctx, aggregate_type, &mut Vec::new())
    }

    /// A metric of `kind` with that kind's default variant.
    pub fn metric(&self, tree: &MonitoringContextTree, ctx: &Context, kind: MetricKind) -> VitalsResult<Metric> {
        Ok(match kind {
            MetricKind::Counter => self.counter(tree, ctx, CounterType::default())?.into(),
            MetricKind::Timer => self.timer(tree, ctx, TimerType::default())?.into(),
            MetricKind::Meter => self.meter(tree, ctx)?.into(),
            MetricKind::Aggregate => self.aggregate(tree, ctx, AggregateType::default())?.into(),
        })
    }

    // ------------------------------------------------------------------------
    // Construction
    // ------------------------------------------------------------------------

    fn counter_at(
        &self,
        tree: &MonitoringContextTree,
        ctx: &Context,
        counter_type: CounterType,
        chain: &mut Chain,
    ) -> VitalsResult<Counter> {
        let ctx = tree.resolve(ctx);
        match ctx.metric() {
            Some(Metric::Counter(existing)) => return Ok(existing),
            Some(other) => return Err(mismatch(&ctx, &other, MetricKind::Counter)),
            None => {}
        }
        if !tree.is_effectively_enabled(&ctx) {
            return Ok(Counter::NOOP);
        }

        let mut targets = Vec::new();
        if self.may_forward(&ctx, chain) {
            chain.push(ctx.path().clone());
            if counter_type == CounterType::Hierarchical {
                if let Some(parent) = non_root_parent(&ctx) {
                    targets.extend(wire(&ctx, &parent, chain, |chain| {
                        self.counter_at(tree, &parent, counter_type, chain)
                    }));
                }
            }
            for attached in ctx.attached() {
                targets.extend(wire(&ctx, &attached, chain, |chain| {
                    self.counter_at(tree, &attached, counter_type, chain)
                }));
            }
            chain.pop();
        }

        let counter = Counter::new(
            ctx.path().clone(),
            Arc::clone(&self.clock),
            counter_type,
            self.reservoir(MetricKind::Counter)?,
            Forwarders::new(targets),
        );
        match self.bind(tree, &ctx, counter.into())? {
            Some(Metric::Counter(counter)) => Ok(counter),
            Some(other) => Err(mismatch(&ctx, &other, MetricKind::Counter)),
            None => Ok(Counter::NOOP),
        }
    }

    fn timer_at(
        &self,
        tree: &MonitoringContextTree,
        ctx: &Context,
        timer_type: TimerType,
        chain: &mut Chain,
    ) -> VitalsResult<Timer> {
        let ctx = tree.resolve(ctx);
        match ctx.metric() {
            Some(Metric::Timer(existing)) => return Ok(existing),
            Some(other) => return Err(mismatch(&ctx, &other, MetricKind::Timer)),
            None => {}
        }
        if !tree.is_effectively_enabled(&ctx) {
            return Ok(Timer::NOOP);
        }

        let mut targets = Vec::new();
        if self.may_forward(&ctx, chain) {
            chain.push(ctx.path().clone());
            if timer_type == TimerType::ForwardOnly {
                if let Some(parent) = non_root_parent(&ctx) {
                    targets.extend(wire(&ctx, &parent, chain, |chain| {
                        self.timer_at(tree, &parent, TimerType::Default, chain)
                    }));
                }
            }
            for attached in ctx.attached() {
                targets.extend(wire(&ctx, &attached, chain, |chain| {
                    self.timer_at(tree, &attached, TimerType::Default, chain)
                }));
            }
            chain.pop();
        }

        let timer = Timer::new(
            ctx.path().clone(),
            Arc::clone(&self.clock),
            timer_type,
            self.reservoir(MetricKind::Timer)?,
            Forwarders::new(targets),
        );
        match self.bind(tree, &ctx, timer.into())? {
            Some(Metric::Timer(timer)) => Ok(timer),
            Some(other) => Err(mismatch(&ctx, &other, MetricKind::Timer)),
            None => Ok(Timer::NOOP),
        }
    }

    fn meter_at(&self, tree: &MonitoringContextTree, ctx: &Context, chain: &mut Chain) -> VitalsResult<Meter> {
        let ctx = tree.resolve(ctx);
        match ctx.metric() {
            Some(Metric::Meter(existing)) => return Ok(existing),
            Some(other) => return Err(mismatch(&ctx, &other, MetricKind::Meter)),
            None => {}
        }
        if !tree.is_effectively_enabled(&ctx) {
            return Ok(Meter::NOOP);
        }

        let mut targets = Vec::new();
        if self.may_forward(&ctx, chain) {
            chain.push(ctx.path().clone());
            for attached in ctx.attached() {
                targets.extend(wire(&ctx, &attached, chain, |chain| {
                    self.meter_at(tree, &attached, chain)
                }));
            }
            chain.pop();
        }

        let meter = Meter::new(
            ctx.path().clone(),
            Arc::clone(&self.clock),
            self.reservoir(MetricKind::Meter)?,
            Forwarders::new(targets),
        );
        match self.bind(tree, &ctx, meter.into())? {
            Some(Metric::Meter(meter)) => Ok(meter),
            Some(other) => Err(mismatch(&ctx, &other, MetricKind::Meter)),
            None => Ok(Meter::NOOP),
        }
    }

    fn aggregate_at(
        &self,
        tree: &MonitoringContextTree,
        ctx: &Context,
        aggregate_type: AggregateType,
        chain: &mut Chain,
    ) -> VitalsResult<Aggregate> {
        let ctx = tree.resolve(ctx);
        match ctx.metric() {
            Some(Metric::Aggregate(existing)) => return Ok(existing),
            Some(other) => return Err(mismatch(&ctx, &other, MetricKind::Aggregate)),
            None => {}
        }
        if !tree.is_effectively_enabled(&ctx) {
            return Ok(Aggregate::NOOP);
        }

        let mut targets = Vec::new();
        if self.may_forward(&ctx, chain) {
            chain.push(ctx.path().clone());
            if matches!(aggregate_type, AggregateType::Sum | AggregateType::ForwardOnly) {
                if let Some(parent) = non_root_parent(&ctx) {
                    targets.extend(wire(&ctx, &parent, chain, |chain| {
                        self.aggregate_at(tree, &parent, AggregateType::Sum, chain)
                    }));
                }
            }
            // a forward-only destination would store nothing
            let attached_type = match aggregate_type {
                AggregateType::ForwardOnly => AggregateType::Sum,
                other => other,
            };
            for attached in ctx.attached() {
                targets.extend(wire(&ctx, &attached, chain, |chain| {
                    self.aggregate_at(tree, &attached, attached_type, chain)
                }));
            }
            chain.pop();
        }

        let aggregate = Aggregate::new(
            ctx.path().clone(),
            Arc::clone(&self.clock),
            aggregate_type,
            self.reservoir(MetricKind::Aggregate)?,
            Forwarders::new(targets),
        );
        match self.bind(tree, &ctx, aggregate.into())? {
            Some(Metric::Aggregate(aggregate)) => Ok(aggregate),
            Some(other) => Err(mismatch(&ctx, &other, MetricKind::Aggregate)),
            None => Ok(Aggregate::NOOP),
        }
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn may_forward(&self, ctx: &Context, chain: &Chain) -> bool {
        if chain.len() < MAX_FORWARD_DEPTH {
            return true;
        }
        warn!(
            target: "vitals::factory",
            path = %ctx.path(),
            depth = chain.len(),
            "Forward wiring too deep, metric created without forward targets"
        );
        false
    }

    fn bind(&self, tree: &MonitoringContextTree, ctx: &Context, metric: Metric) -> VitalsResult<Option<Metric>> {
        let kind = metric.kind();
        let bound = tree.bind_metric(ctx, metric)?;
        if bound.is_some() {
            debug!(target: "vitals::factory", path = %ctx.path(), %kind, "Metric bound");
        }
        Ok(bound)
    }
}

fn non_root_parent(ctx: &Context) -> Option<Context> {
    ctx.parent().filter(|parent| !parent.is_root())
}

fn mismatch(ctx: &Context, existing: &Metric, requested: MetricKind) -> crate::error::VitalsError {
    InvariantError::MetricKindMismatch {
        path: ctx.path().to_string(),
        existing: existing.kind().as_str(),
        requested: requested.as_str(),
    }
    .into()
}

/// Obtain the live core of a forward destination. An edge back into a
/// metric still under construction, or a failure, only costs that edge.
fn wire<M, F>(source: &Context, target: &Context, chain: &mut Chain, build: F) -> Option<Arc<dyn ForwardTarget>>
where
    M: Into<Metric>,
    F: FnOnce(&mut Chain) -> VitalsResult<M>,
{
    if chain.iter().any(|path| path == target.path()) {
        debug!(
            target: "vitals::factory",
            source = %source.path(),
            destination = %target.path(),
            "Forward cycle, edge skipped"
        );
        return None;
    }
    match build(chain) {
        Ok(metric) => metric.into().forward_target(),
        Err(err) => {
            warn!(
                target: "vitals::factory",
                source = %source.path(),
                destination = %target.path(),
                error = %err,
                "Forward target unavailable"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::context::{DisposalContext, EnablementMap};
    use crate::reservoir::{ArchiveSpec, StartSpec};
    use pretty_assertions::assert_eq;

    struct Fixture {
        clock: Arc<ManualClock>,
        tree: MonitoringContextTree,
        factory: MetricFactory,
    }

    impl Fixture {
        fn new() -> Self {
            let clock = ManualClock::shared(0);
            let shared: SharedClock = clock.clone();
            let tree = MonitoringContextTree::new(shared.clone(), Box::new(EnablementMap::new()), 0, true);
            let spec = ReservoirSpec::round_robin(
                DEFAULT_RESERVOIR,
                10,
                vec![ArchiveSpec {
                    resolution: 10,
                    retention: 6,
                    max_raw_values: 32,
                }],
                StartSpec::Zero,
            )
            .unwrap();
            let factory = MetricFactory::new(shared, &[spec], &AHashMap::new()).unwrap();
            Self { clock, tree, factory }
        }

        fn ctx(&self, path: &str) -> Context {
            self.tree.get_or_create(&ContextPath::parse(path))
        }
    }

    #[test]
    fn test_same_metric_returned() {
        let fx = Fixture::new();
        let ctx = fx.ctx("a");
        let first = fx.factory.counter(&fx.tree, &ctx, CounterType::Default).unwrap();
        let second = fx.factory.counter(&fx.tree, &ctx, CounterType::Default).unwrap();
        first.inc(2);
        assert_eq!(second.count(), 2);
    }

    #[test]
    fn test_kind_mismatch_is_error() {
        let fx = Fixture::new();
        let ctx = fx.ctx("a");
        fx.factory.meter(&fx.tree, &ctx).unwrap();
        let err = fx.factory.timer(&fx.tree, &ctx, TimerType::Default).unwrap_err();
        assert_eq!(err.category(), "invariant");
    }

    #[test]
    fn test_disabled_context_gets_noop() {
        let fx = Fixture::new();
        let ctx = fx.ctx("a/b");
        fx.tree.set_enabled(&fx.ctx("a"), false);
        let counter = fx.factory.counter(&fx.tree, &ctx, CounterType::Default).unwrap();
        assert!(counter.is_noop());
        assert!(ctx.metric().is_none());

        fx.tree.set_enabled(&fx.ctx("a"), true);
        assert!(!fx.factory.counter(&fx.tree, &ctx, CounterType::Default).unwrap().is_noop());
    }

    #[test]
    fn test_hierarchical_counter_chain() {
        let fx = Fixture::new();
        let leaf = fx.factory.counter(&fx.tree, &fx.ctx("a/b/c"), CounterType::Hierarchical).unwrap();
        let sibling = fx.factory.counter(&fx.tree, &fx.ctx("a/b/d"), CounterType::Hierarchical).unwrap();
        leaf.inc(2);
        sibling.inc(5);

        let b = fx.ctx("a/b").metric().unwrap();
        let a = fx.ctx("a").metric().unwrap();
        assert_eq!(b.as_counter().unwrap().count(), 7);
        assert_eq!(a.as_counter().unwrap().count(), 7);
        // the child of the root does not forward to the root
        assert_eq!(a.as_counter().unwrap().forward_count(), 0);
        assert!(fx.tree.root().metric().is_none());
    }

    #[test]
    fn test_forward_only_timer_feeds_parent() {
        let fx = Fixture::new();
        let child = fx.factory.timer(&fx.tree, &fx.ctx("svc/call"), TimerType::ForwardOnly).unwrap();
        fx.clock.set_tick(100);
        let split = child.time();
        fx.clock.set_tick(160);
        split.stop();

        let parent = fx.ctx("svc").metric().unwrap();
        let timer = parent.as_timer().unwrap();
        assert_eq!(timer.timer_type(), Some(TimerType::Default));
        assert_eq!(timer.snapshot().unwrap().sum, 60);
        assert!(child.snapshot().is_none());
    }

    #[test]
    fn test_sum_aggregate_forwards_to_parent_and_attached() {
        let fx = Fixture::new();
        let source = fx.ctx("x/y");
        let extra = fx.ctx("totals");
        assert!(source.attach_context(&extra));

        let agg = fx.factory.aggregate(&fx.tree, &source, AggregateType::Sum).unwrap();
        agg.update(3);
        agg.update(4);

        let parent = fx.ctx("x").metric().unwrap();
        assert_eq!(parent.as_aggregate().unwrap().total(), Some(7));
        let attached = extra.metric().unwrap();
        assert_eq!(attached.as_aggregate().unwrap().total(), Some(7));
        assert_eq!(agg.forward_count(), 2);
    }

    #[test]
    fn test_simple_aggregate_does_not_forward_to_parent() {
        let fx = Fixture::new();
        let agg = fx.factory.aggregate(&fx.tree, &fx.ctx("x/y"), AggregateType::Simple).unwrap();
        agg.update(1);
        assert!(fx.ctx("x").metric().is_none());
    }

    #[test]
    fn test_attachment_cycle_is_bounded() {
        let fx = Fixture::new();
        let a = fx.ctx("a");
        let b = fx.ctx("b");
        a.attach_context(&b);
        b.attach_context(&a);
        let meter = fx.factory.meter(&fx.tree, &a).unwrap();
        meter.mark(1);
        let other = b.metric().unwrap();
        assert_eq!(other.as_meter().unwrap().snapshot().unwrap().sum, 1);
        // b was built while a was under construction, so it does not point back
        assert_eq!(other.as_meter().unwrap().forward_count(), 0);
        assert_eq!(meter.forward_count(), 1);
    }

    #[test]
    fn test_disposed_handle_is_rebuilt() {
        let fx = Fixture::new();
        let ctx = fx.ctx("a");
        let counter = fx.factory.counter(&fx.tree, &ctx, CounterType::Default).unwrap();
        counter.inc(1);
        fx.tree.dispose(&ctx, DisposalContext::External, true);
        let fresh = fx.factory.counter(&fx.tree, &ctx, CounterType::Default).unwrap();
        assert_eq!(fresh.count(), 0);
        assert!(fx.tree.find(&ContextPath::parse("a")).is_some());
    }

    #[test]
    fn test_missing_reservoir() {
        let clock: SharedClock = ManualClock::shared(0);
        let mut assignments = AHashMap::new();
        assignments.insert(MetricKind::Timer, "latency".to_string());
        let spec = ReservoirSpec::open(DEFAULT_RESERVOIR, 0);
        assert_eq!(
            MetricFactory::new(clock, &[spec], &assignments).unwrap_err(),
            ConfigError::MissingReservoir("latency".into())
        );
    }
}
