// ============================================================================
// ENGINE FACADE
// ============================================================================
// One explicitly constructed engine per process (or per test): the context
// tree, the metric factory, the compiled forward rules and the cleanup
// sweeper, built from a validated configuration.
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cleanup::{CleanupDaemon, Sweeper};
use crate::clock::{SharedClock, SystemClock};
use crate::config::EngineConfig;
use crate::context::{CleanupReport, Context, DisposalContext, MonitoringContextTree};
use crate::error::VitalsResult;
use crate::factory::MetricFactory;
use crate::forward::{ForwardRule, NodeNameResolver, VariableResolver};
use crate::matcher::PathMatcher;
use crate::metric::{Aggregate, AggregateType, Counter, CounterType, Meter, Metric, MetricFilter, Timer, TimerType};
use crate::path::ContextPath;
use crate::scope::CallScope;
use crate::MAX_FORWARD_DEPTH;

#[derive(Debug)]
pub struct VitalsEngine {
    config: EngineConfig,
    clock: SharedClock,
    tree: Arc<MonitoringContextTree>,
    factory: MetricFactory,
    rules: Vec<ForwardRule>,
    sweeper: Arc<Sweeper>,
}

impl VitalsEngine {
    /// Build an engine. Fails on any configuration error before any state
    /// exists.
    pub fn new(config: EngineConfig, clock: SharedClock) -> VitalsResult<Self> {
        config.validate()?;

        let specs = config.reservoir_specs()?;
        let factory = MetricFactory::new(Arc::clone(&clock), &specs, &config.metric_reservoirs.assignments())?;

        let resolver: Arc<dyn VariableResolver> = Arc::new(NodeNameResolver::new(config.engine.node_name.as_str()));
        let rules: Vec<ForwardRule> = config
            .forward_rules()?
            .into_iter()
            .map(|rule| rule.with_resolver(Arc::clone(&resolver)))
            .collect();

        let tree = Arc::new(MonitoringContextTree::new(
            Arc::clone(&clock),
            Box::new(config.enablement_map()),
            config.engine.consumed_metric_timeout_ms,
            config.engine.global_enabled,
        ));
        let sweeper = Arc::new(Sweeper::new(Arc::clone(&tree)));

        info!(
            target: "vitals::engine",
            node = %config.engine.node_name,
            reservoirs = specs.len(),
            forward_rules = rules.len(),
            global_enabled = config.engine.global_enabled,
            "Engine initialized"
        );

        Ok(Self {
            config,
            clock,
            tree,
            factory,
            rules,
            sweeper,
        })
    }

    /// Build an engine on the system clock.
    pub fn with_system_clock(config: EngineConfig) -> VitalsResult<Self> {
        Self::new(config, SystemClock::shared())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn tree(&self) -> &Arc<MonitoringContextTree> {
        &self.tree
    }

    pub fn factory(&self) -> &MetricFactory {
        &self.factory
    }

    pub fn forward_rules(&self) -> &[ForwardRule] {
        &self.rules
    }

    // ------------------------------------------------------------------------
    // Contexts
    // ------------------------------------------------------------------------

    /// Get or create the context at `path`. Every node this call creates is
    /// run through the forward rules and attached to the resolved targets.
    pub fn context(&self, path: &ContextPath) -> Context {
        self.context_at(path, 0)
    }

    /// [`context`](Self::context) for a `/`-delimited path.
    pub fn context_str(&self, path: &str) -> Context {
        self.context(&ContextPath::parse(path))
    }

    fn context_at(&self, path: &ContextPath, depth: usize) -> Context {
        let (ctx, created) = self.tree.get_or_create_tracked(path);
        if !self.rules.is_empty() {
            for node in &created {
                self.apply_rules(node, depth);
            }
        }
        ctx
    }

    fn apply_rules(&self, node: &Context, depth: usize) {
        for rule in &self.rules {
            for target in rule.targets(node.path()) {
                if &target == node.path() {
                    continue;
                }
                if depth >= MAX_FORWARD_DEPTH {
                    warn!(
                        target: "vitals::engine",
                        source = %node.path(),
                        destination = %target,
                        depth,
                        "Forward rule chain too deep, target skipped"
                    );
                    continue;
                }
                let destination = self.context_at(&target, depth + 1);
                if node.attach_context(&destination) {
                    debug!(
                        target: "vitals::engine",
                        source = %node.path(),
                        destination = %target,
                        rule = %rule.source(),
                        "Context attached"
                    );
                }
            }
        }
    }

    /// A per-call scope for instance contexts.
    pub fn call_scope(&self) -> CallScope<'_> {
        CallScope::new(self)
    }

    // ------------------------------------------------------------------------
    // Metrics
    // ------------------------------------------------------------------------

    pub fn counter(&self, ctx: &Context, counter_type: CounterType) -> VitalsResult<Counter> {
        self.factory.counter(&self.tree, ctx, counter_type)
    }

    pub fn timer(&self, ctx: &Context, timer_type: TimerType) -> VitalsResult<Timer> {
        self.factory.timer(&self.tree, ctx, timer_type)
    }

    pub fn meter(&self, ctx: &Context) -> VitalsResult<Meter> {
        self.factory.meter(&self.tree, ctx)
    }

    pub fn aggregate(&self, ctx: &Context, aggregate_type: AggregateType) -> VitalsResult<Aggregate> {
        self.factory.aggregate(&self.tree, ctx, aggregate_type)
    }

    /// The live node for `ctx`, without creating one.
    fn live(&self, ctx: &Context) -> Option<Context> {
        if ctx.is_detached() {
            self.tree.find(ctx.path())
        } else {
            Some(Arc::clone(ctx))
        }
    }

    /// The metric bound to `ctx`, if `filter` accepts it.
    pub fn get_metric(&self, ctx: &Context, filter: MetricFilter) -> Option<Metric> {
        self.live(ctx)?.metric().filter(|m| filter.accepts(m))
    }

    /// Read and mark for removal. The container stays until the consumed
    /// timeout has elapsed, so concurrent writers keep a valid metric.
    pub fn consume_metric(&self, ctx: &Context, filter: MetricFilter) -> Option<Metric> {
        let live = self.live(ctx)?;
        if !live.metric().map_or(false, |m| filter.accepts(&m)) {
            return None;
        }
        self.tree.dispose(&live, DisposalContext::Consume, false)
    }

    /// Every bound metric whose context path matches `pattern`, in tree order.
    pub fn find_metrics(&self, pattern: &PathMatcher) -> Vec<Metric> {
        self.tree
            .contexts()
            .iter()
            .filter(|ctx| pattern.is_match(ctx.path()))
            .filter_map(|ctx| ctx.metric())
            .collect()
    }

    // ------------------------------------------------------------------------
    // Enablement & lifecycle
    // ------------------------------------------------------------------------

    pub fn set_enabled(&self, ctx: &Context, enabled: bool) {
        self.tree.set_enabled(&self.tree.resolve(ctx), enabled);
    }

    pub fn set_global_enabled(&self, enabled: bool) {
        self.tree.set_global_enabled(enabled);
    }

    pub fn is_effectively_enabled(&self, ctx: &Context) -> bool {
        self.live(ctx).map_or(false, |live| self.tree.is_effectively_enabled(&live))
    }

    /// External disposal of `ctx` and its subtree. Returns the metric of
    /// `ctx` if it was dropped.
    pub fn dispose(&self, ctx: &Context, force: bool) -> Option<Metric> {
        let live = self.live(ctx)?;
        self.tree.dispose(&live, DisposalContext::External, force)
    }

    /// One synchronous cleanup sweep. `None` when a sweep is already running.
    pub fn cleanup(&self) -> Option<CleanupReport> {
        self.sweeper.sweep()
    }

    /// Start the periodic cleanup task. Must be called inside a tokio runtime.
    pub fn spawn_cleanup_daemon(&self) -> CleanupDaemon {
        let period = Duration::from_millis(self.config.engine.cleanup_period_ms);
        CleanupDaemon::spawn(Arc::clone(&self.sweeper), period)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{EnablementEntry, ForwardRuleConfig, ReservoirConfig};
    use crate::metric::MetricKind;
    use pretty_assertions::assert_eq;

    fn config() -> EngineConfig {
        EngineConfig {
            reservoirs: vec![ReservoirConfig {
                resolution_step_ms: 10,
                resolutions_ms: vec![10, 100],
                retentions: vec![10, 10],
                max_raw_values: vec![16, 0],
                ..ReservoirConfig::default()
            }],
            ..EngineConfig::default()
        }
    }

    const THREADS: usize = 8;
    const ITERATIONS: usize = 20_000;

    /// System clock and a single open window, so every accepted write shows
    /// up in one snapshot.
    fn concurrent_engine() -> VitalsEngine {
        let config = EngineConfig {
            reservoirs: vec![ReservoirConfig {
                kind: "open_resolution".into(),
                max_raw_values: vec![0],
                ..ReservoirConfig::default()
            }],
            ..EngineConfig::default()
        };
        VitalsEngine::with_system_clock(config).unwrap()
    }

    fn hammer(write: impl Fn(usize) + Sync) {
        std::thread::scope(|scope| {
            for thread in 0..THREADS {
                let write = &write;
                scope.spawn(move || {
                    for _ in 0..ITERATIONS {
                        write(thread);
                    }
                });
            }
        });
    }

    fn engine(config: EngineConfig) -> (Arc<ManualClock>, VitalsEngine) {
        let clock = ManualClock::shared(0);
        let engine = VitalsEngine::new(config, clock.clone()).unwrap();
        (clock, engine)
    }

    #[test]
    fn test_concurrent_writers_lose_nothing() {
        let engine = concurrent_engine();
        let counter = engine.counter(&engine.context_str("hot/counter"), CounterType::Default).unwrap();
        let meter = engine.meter(&engine.context_str("hot/meter")).unwrap();
        let timer = engine.timer(&engine.context_str("hot/timer"), TimerType::Default).unwrap();

        hammer(|_| {
            counter.inc_one();
            meter.mark_one();
            timer.record(1);
        });

        let expected = THREADS * ITERATIONS;
        assert_eq!(counter.count(), expected as i64);
        assert_eq!(counter.snapshot().unwrap().size, expected as u64);
        let marks = meter.snapshot().unwrap();
        assert_eq!((marks.size, marks.sum), (expected as u64, expected as i64));
        let splits = timer.snapshot().unwrap();
        assert_eq!((splits.size, splits.sum), (expected as u64, expected as i64));
    }

    #[test]
    fn test_concurrent_forwarding_into_one_parent() {
        let engine = concurrent_engine();
        let parent = engine.context_str("pool");
        let rollup = engine.counter(&parent, CounterType::Hierarchical).unwrap();
        let children: Vec<Counter> = (0..THREADS)
            .map(|i| {
                let ctx = engine.context(&parent.path().child(&format!("worker-{}", i)));
                engine.counter(&ctx, CounterType::Hierarchical).unwrap()
            })
            .collect();

        hammer(|thread| children[thread].inc_one());

        let expected = THREADS * ITERATIONS;
        assert_eq!(rollup.count(), expected as i64);
        assert_eq!(rollup.snapshot().unwrap().size, expected as u64);
        for child in &children {
            assert_eq!(child.snapshot().unwrap().size, ITERATIONS as u64);
        }
    }

    #[test]
    fn test_forward_rule_attaches_new_contexts() {
        let mut config = config();
        config.engine.node_name = "clusterNode1".into();
        config.forward_rules.push(ForwardRuleConfig {
            source_pattern: "**/connection/*/statement/*".into(),
            target_templates: vec!["$node/db/connection".into()],
        });
        let (_clock, engine) = engine(config);

        let statement = engine.context_str("undefined/connection/1234/statement/18978394");
        let attached = statement.attached();
        assert_eq!(attached.len(), 1);
        assert_eq!(attached[0].path(), &ContextPath::parse("clusterNode1/db/connection"));

        let counter = engine.counter(&statement, CounterType::Default).unwrap();
        counter.inc(3);
        let rollup = engine
            .get_metric(&attached[0], MetricFilter::Kind(MetricKind::Counter))
            .unwrap();
        assert_eq!(rollup.as_counter().unwrap().count(), 3);
    }

    #[test]
    fn test_rules_skip_self_targets() {
        let mut config = config();
        config.forward_rules.push(ForwardRuleConfig {
            source_pattern: "a/*:x".into(),
            target_templates: vec!["a/$x".into(), "sum/$x".into()],
        });
        let (_clock, engine) = engine(config);
        let ctx = engine.context_str("a/b");
        let attached: Vec<String> = ctx.attached().iter().map(|c| c.path().to_string()).collect();
        assert_eq!(attached, vec![ContextPath::parse("sum/b").to_string()]);
    }

    #[test]
    fn test_get_and_consume_metric() {
        let (clock, engine) = engine(EngineConfig {
            engine: crate::config::GeneralConfig {
                consumed_metric_timeout_ms: 1_000,
                ..Default::default()
            },
            ..config()
        });
        let ctx = engine.context_str("jobs/import");
        engine.meter(&ctx).unwrap().mark(4);

        assert!(engine.get_metric(&ctx, MetricFilter::Kind(MetricKind::Timer)).is_none());
        assert!(engine.consume_metric(&ctx, MetricFilter::Kind(MetricKind::Timer)).is_none());

        let consumed = engine.consume_metric(&ctx, MetricFilter::Any).unwrap();
        assert_eq!(consumed.as_meter().unwrap().snapshot().unwrap().sum, 4);
        // still readable until the timeout elapses
        assert!(engine.get_metric(&ctx, MetricFilter::Any).is_some());
        assert_eq!(engine.cleanup().unwrap().removed_metrics, 0);

        clock.advance_time(1_000);
        let report = engine.cleanup().unwrap();
        assert_eq!(report.removed_metrics, 1);
        assert_eq!(report.removed_nodes, 2);
        assert!(engine.get_metric(&ctx, MetricFilter::Any).is_none());
    }

    #[test]
    fn test_find_metrics() {
        let (_clock, engine) = engine(config());
        for path in ["svc/a/db", "svc/b/db", "svc/b/cache"] {
            engine.counter(&engine.context_str(path), CounterType::Default).unwrap();
        }
        let found = engine.find_metrics(&PathMatcher::parse("svc/*/db").unwrap());
        let paths: Vec<String> = found.iter().filter_map(|m| m.path()).map(|p| p.to_string()).collect();
        assert_eq!(paths, vec!["svc/a/db".to_string(), "svc/b/db".to_string()]);
    }

    #[test]
    fn test_configured_enablement() {
        let mut config = config();
        config.enablement.push(EnablementEntry {
            path: "noisy".into(),
            enabled: false,
        });
        let (_clock, engine) = engine(config);
        let ctx = engine.context_str("noisy/sql");
        assert!(!engine.is_effectively_enabled(&ctx));
        assert!(engine.timer(&ctx, TimerType::Default).unwrap().is_noop());

        engine.set_enabled(&engine.context_str("noisy"), true);
        assert!(!engine.timer(&ctx, TimerType::Default).unwrap().is_noop());

        engine.set_global_enabled(false);
        assert!(!engine.is_effectively_enabled(&ctx));
        assert!(engine.get_metric(&ctx, MetricFilter::Any).is_none());
    }

    #[test]
    fn test_dispose_removes_subtree() {
        let (_clock, engine) = engine(config());
        let parent = engine.context_str("batch");
        let child = engine.context_str("batch/step");
        engine.counter(&child, CounterType::Default).unwrap().inc_one();

        assert!(engine.dispose(&parent, false).is_none());
        assert!(engine.tree().find(&ContextPath::parse("batch/step")).is_some());

        engine.dispose(&parent, true);
        assert!(child.is_detached());
        assert!(engine.tree().find(&ContextPath::parse("batch")).is_none());
        assert!(engine.dispose(&child, true).is_none());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = config();
        config.metric_reservoirs.meter = "missing".into();
        let err = VitalsEngine::new(config, ManualClock::shared(0)).unwrap_err();
        assert_eq!(err.category(), "config");
    }
}
