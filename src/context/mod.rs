// ============================================================================
// MONITORING CONTEXT TREE
// ============================================================================
// The namespace that owns every metric:
// - nodes are created on first lookup along a path
// - enablement is inherited top-down unless set explicitly on a node
// - disposal is deferred until a container's timeout has elapsed
// - empty nodes are pruned bottom-up after their metric goes away
//
// Structural changes (creation, disposal, cleanup, enablement propagation)
// hold the tree-wide write lock. Lookups and metric binding hold the read
// lock. Per-node state sits behind its own mutex and is only ever locked one
// node at a time.
// ============================================================================

mod node;

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::clock::SharedClock;
use crate::error::InvariantError;
use crate::metric::{Metric, MetricFilter};
use crate::path::ContextPath;

pub use node::{Context, ContextNode, DisposalContext, MetricContainer};

// ----------------------------------------------------------------------------
// 1 Enablement Provider
// ----------------------------------------------------------------------------

/// Initial per-node enablement, consulted once when a node is created.
pub trait EnablementProvider: Send + Sync + Debug {
    fn enabled_for(&self, path: &ContextPath) -> Option<bool>;
}

/// Enablement flags keyed by exact path.
#[derive(Debug, Clone, Default)]
pub struct EnablementMap(AHashMap<ContextPath, bool>);

impl EnablementMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, path: impl Into<ContextPath>, enabled: bool) -> Self {
        self.0.insert(path.into(), enabled);
        self
    }

    pub fn insert(&mut self, path: ContextPath, enabled: bool) {
        self.0.insert(path, enabled);
    }
}

impl EnablementProvider for EnablementMap {
    fn enabled_for(&self, path: &ContextPath) -> Option<bool> {
        self.0.get(path).copied()
    }
}

// ----------------------------------------------------------------------------
// 2 Sweep Report
// ----------------------------------------------------------------------------

/// What a disposal or cleanup pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub visited_nodes: usize,
    pub removed_metrics: usize,
    pub removed_nodes: usize,
}

// ----------------------------------------------------------------------------
// 3 The Tree
// ----------------------------------------------------------------------------

pub struct MonitoringContextTree {
    root: Context,
    structure: RwLock<()>,
    global_enabled: AtomicBool,
    provider: Box<dyn EnablementProvider>,
    clock: SharedClock,
    consumed_timeout_ms: i64,
    next_ordinal: AtomicU64,
}

impl MonitoringContextTree {
    /// Create a tree holding only the root. The root's flag comes from the
    /// provider, defaulting to enabled.
    pub fn new(
        clock: SharedClock,
        provider: Box<dyn EnablementProvider>,
        consumed_timeout_ms: i64,
        global_enabled: bool,
    ) -> Self {
        let root_enabled = provider.enabled_for(&ContextPath::root()).unwrap_or(true);
        Self {
            root: Arc::new(ContextNode::root(root_enabled)),
            structure: RwLock::new(()),
            global_enabled: AtomicBool::new(global_enabled),
            provider,
            clock,
            consumed_timeout_ms,
            next_ordinal: AtomicU64::new(1),
        }
    }

    pub fn root(&self) -> &Context {
        &self.root
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn consumed_timeout_ms(&self) -> i64 {
        self.consumed_timeout_ms
    }

    pub fn is_global_enabled(&self) -> bool {
        self.global_enabled.load(AtomicOrdering::Acquire)
    }

    /// `global AND node.enabled`.
    pub fn is_effectively_enabled(&self, ctx: &Context) -> bool {
        self.is_global_enabled() && ctx.is_enabled()
    }

    // ------------------------------------------------------------------------
    // Lookup & creation
    // ------------------------------------------------------------------------

    fn lookup(&self, path: &ContextPath) -> Option<Context> {
        let mut node = Arc::clone(&self.root);
        for segment in path.segments() {
            node = node.child(segment)?;
        }
        Some(node)
    }

    /// Existing node at `path`, without creating anything.
    pub fn find(&self, path: &ContextPath) -> Option<Context> {
        let _read = self.structure.read();
        self.lookup(path)
    }

    pub fn get_or_create(&self, path: &ContextPath) -> Context {
        self.get_or_create_tracked(path).0
    }

    /// Like [`get_or_create`](Self::get_or_create), also returning the nodes
    /// this call created, shallowest first.
    pub fn get_or_create_tracked(&self, path: &ContextPath) -> (Context, Vec<Context>) {
        {
            let _read = self.structure.read();
            if let Some(node) = self.lookup(path) {
                return (node, Vec::new());
            }
        }

        let _write = self.structure.write();
        let mut created = Vec::new();
        let mut node = Arc::clone(&self.root);
        for segment in path.segments() {
            node = match node.child(segment) {
                Some(child) => child,
                None => {
                    let child = self.create_child(&node, segment);
                    created.push(Arc::clone(&child));
                    child
                }
            };
        }
        (node, created)
    }

    fn create_child(&self, parent: &Context, segment: &str) -> Context {
        let path = parent.path().child(segment);
        let (enabled, inherited) = match self.provider.enabled_for(&path) {
            Some(enabled) => (enabled, false),
            None => (parent.is_enabled(), true),
        };
        let ordinal = self.next_ordinal.fetch_add(1, AtomicOrdering::Relaxed);
        let child = Arc::new(ContextNode::child_of(parent, segment, ordinal, enabled, inherited));
        parent
            .state
            .lock()
            .children
            .insert(segment.into(), Arc::clone(&child));
        debug!(target: "vitals::context", path = %path, enabled, inherited, "Context created");
        child
    }

    /// `ctx` itself while it is in the tree, otherwise the live node at its
    /// path (created if necessary).
    pub fn resolve(&self, ctx: &Context) -> Context {
        if ctx.is_detached() {
            self.get_or_create(ctx.path())
        } else {
            Arc::clone(ctx)
        }
    }

    /// Every node below the root, depth first, children in creation order.
    pub fn contexts(&self) -> Vec<Context> {
        let _read = self.structure.read();
        let mut out = Vec::new();
        let mut stack: Vec<Context> = self.root.children().into_iter().rev().collect();
        while let Some(node) = stack.pop() {
            stack.extend(node.children().into_iter().rev());
            out.push(node);
        }
        out
    }

    /// Bound metrics accepted by `filter`, in tree order.
    pub fn metrics(&self, filter: MetricFilter) -> Vec<Metric> {
        self.contexts()
            .iter()
            .filter_map(|ctx| ctx.metric())
            .filter(|m| filter.accepts(m))
            .collect()
    }

    pub fn node_count(&self) -> usize {
        self.contexts().len()
    }

    // ------------------------------------------------------------------------
    // Metric binding
    // ------------------------------------------------------------------------

    /// Bind `metric` to `ctx` unless a metric is already bound, in which case
    /// the existing one is returned. `Ok(None)` when the context is not
    /// effectively enabled.
    ///
    /// A node detached since the caller resolved it is replaced by the live
    /// node at the same path.
    pub(crate) fn bind_metric(&self, ctx: &Context, metric: Metric) -> Result<Option<Metric>, InvariantError> {
        let mut node = Arc::clone(ctx);
        loop {
            {
                let _read = self.structure.read();
                if !node.is_detached() {
                    return self.bind_attached(&node, metric);
                }
            }
            debug!(target: "vitals::context", path = %ctx.path(), "Context detached before bind, re-resolving");
            node = self.get_or_create(ctx.path());
        }
    }

    /// Caller holds the structure lock and `ctx` is in the tree.
    fn bind_attached(&self, ctx: &Context, metric: Metric) -> Result<Option<Metric>, InvariantError> {
        if !self.is_effectively_enabled(ctx) {
            return Ok(None);
        }
        let mut state = ctx.state.lock();
        if let Some(existing) = state.container.as_ref().map(|c| c.metric().clone()) {
            if existing.kind() != metric.kind() {
                return Err(InvariantError::MetricKindMismatch {
                    path: ctx.path().to_string(),
                    existing: existing.kind().as_str(),
                    requested: metric.kind().as_str(),
                });
            }
            return Ok(Some(existing));
        }
        state.container = Some(MetricContainer::new(metric.clone(), self.consumed_timeout_ms));
        Ok(Some(metric))
    }

    // ------------------------------------------------------------------------
    // Enablement
    // ------------------------------------------------------------------------

    /// Set `ctx` explicitly and push the value down into every descendant
    /// that still inherits. A node whose effective state flips loses its
    /// metric, so the factory builds the right variant next time.
    pub fn set_enabled(&self, ctx: &Context, enabled: bool) {
        let _write = self.structure.write();
        let global = self.is_global_enabled();
        {
            let mut state = ctx.state.lock();
            let before = state.enabled;
            state.enabled = enabled;
            state.inherited = false;
            if before != enabled && global && state.container.take().is_some() {
                debug!(target: "vitals::context", path = %ctx.path(), enabled, "Metric dropped on enablement change");
            }
        }
        Self::propagate_enabled(ctx, enabled, global);
        info!(target: "vitals::context", path = %ctx.path(), enabled, "Context enablement set");
    }

    fn propagate_enabled(node: &Context, enabled: bool, global: bool) {
        for child in node.children() {
            {
                let mut state = child.state.lock();
                if !state.inherited {
                    continue;
                }
                let before = state.enabled;
                state.enabled = enabled;
                if before != enabled && global {
                    state.container = None;
                }
            }
            Self::propagate_enabled(&child, enabled, global);
        }
    }

    /// Flip the global switch. Local flags are untouched; metrics on nodes
    /// whose effective state changes are dropped.
    pub fn set_global_enabled(&self, enabled: bool) {
        let _write = self.structure.write();
        let before = self.global_enabled.swap(enabled, AtomicOrdering::AcqRel);
        if before == enabled {
            return;
        }
        let mut stack = vec![Arc::clone(&self.root)];
        while let Some(node) = stack.pop() {
            let mut state = node.state.lock();
            if state.enabled {
                state.container = None;
            }
            stack.extend(state.children.values().cloned());
        }
        info!(target: "vitals::context", enabled, "Global enablement set");
    }

    // ------------------------------------------------------------------------
    // Disposal & cleanup
    // ------------------------------------------------------------------------

    /// Dispose `ctx` in the given mode.
    ///
    /// Returns the metric released by the call: for `Consume`, the metric
    /// held before the call whether or not it could be dropped yet; for the
    /// other modes, the metric of `ctx` if it was dropped.
    pub fn dispose(&self, ctx: &Context, mode: DisposalContext, force: bool) -> Option<Metric> {
        let _write = self.structure.write();
        let now = self.clock.time_millis();
        let mut report = CleanupReport::default();
        let metric = self.dispose_node(ctx, mode, force, now, &mut report);
        debug!(
            target: "vitals::context",
            path = %ctx.path(),
            ?mode,
            force,
            removed_metrics = report.removed_metrics,
            removed_nodes = report.removed_nodes,
            "Context disposed"
        );
        metric
    }

    /// One `CleanupCheck` pass over the whole tree.
    pub fn cleanup(&self) -> CleanupReport {
        let _write = self.structure.write();
        let now = self.clock.time_millis();
        let mut report = CleanupReport::default();
        self.dispose_node(&self.root, DisposalContext::CleanupCheck, false, now, &mut report);
        report
    }

    fn dispose_node(
        &self,
        node: &Context,
        mode: DisposalContext,
        force: bool,
        now: i64,
        report: &mut CleanupReport,
    ) -> Option<Metric> {
        report.visited_nodes += 1;
        if mode != DisposalContext::Consume {
            for child in node.children() {
                self.dispose_node(&child, mode, force, now, report);
            }
        }

        let (held, dropped) = {
            let mut state = node.state.lock();
            let held = state.container.as_ref().map(|c| c.metric().clone());
            let safe = match state.container.as_mut() {
                Some(container) => {
                    container.mark(mode, now);
                    container.is_safe_to_drop(now, force)
                }
                None => false,
            };
            let dropped = if safe {
                state.container.take().map(|c| c.metric().clone())
            } else {
                None
            };
            (held, dropped)
        };

        if dropped.is_some() {
            report.removed_metrics += 1;
            debug!(target: "vitals::context", path = %node.path(), ?mode, "Metric container dropped");
        }
        if dropped.is_some() || mode == DisposalContext::External {
            self.collapse(node, report);
        }

        match mode {
            DisposalContext::Consume => held,
            DisposalContext::External | DisposalContext::CleanupCheck => dropped,
        }
    }

    /// Detach `node` if it is empty, then each ancestor that became empty.
    /// The root is never detached.
    fn collapse(&self, node: &Context, report: &mut CleanupReport) {
        let mut current = Arc::clone(node);
        while !current.is_root() {
            {
                let state = current.state.lock();
                if state.container.is_some() || !state.children.is_empty() {
                    return;
                }
            }
            let (Some(parent), Some(name)) = (current.parent(), current.name()) else {
                return;
            };
            let removed = {
                let mut parent_state = parent.state.lock();
                let ours = parent_state
                    .children
                    .get(name)
                    .map_or(false, |c| Arc::ptr_eq(c, &current));
                ours && parent_state.children.remove(name).is_some()
            };
            if !removed {
                return;
            }
            current.mark_detached();
            report.removed_nodes += 1;
            debug!(target: "vitals::context", path = %current.path(), "Context removed");
            current = parent;
        }
    }
}

impl Debug for MonitoringContextTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitoringContextTree")
            .field("global_enabled", &self.is_global_enabled())
            .field("consumed_timeout_ms", &self.consumed_timeout_ms)
            .field("provider", &self.provider)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::metric::{testing, Counter, CounterType, Forwarders, Meter, MetricKind};
    use pretty_assertions::assert_eq;

    fn tree_with(provider: EnablementMap, timeout_ms: i64) -> (Arc<ManualClock>, MonitoringContextTree) {
        let clock = ManualClock::shared(0);
        let tree = MonitoringContextTree::new(clock.clone(), Box::new(provider), timeout_ms, true);
        (clock, tree)
    }

    fn counter_for(tree: &MonitoringContextTree, ctx: &Context) -> Metric {
        let counter = Counter::new(
            ctx.path().clone(),
            Arc::clone(tree.clock()),
            CounterType::Default,
            testing::reservoir(0),
            Forwarders::default(),
        );
        tree.bind_metric(ctx, Metric::Counter(counter)).unwrap().unwrap()
    }

    #[test]
    fn test_creation_and_insertion_order() {
        let (_clock, tree) = tree_with(EnablementMap::new(), 0);
        let (leaf, created) = tree.get_or_create_tracked(&ContextPath::parse("a/b/c"));
        assert_eq!(created.len(), 3);
        assert_eq!(leaf.path(), &ContextPath::parse("a/b/c"));

        tree.get_or_create(&ContextPath::parse("a/z"));
        tree.get_or_create(&ContextPath::parse("a/m"));
        let a = tree.find(&ContextPath::parse("a")).unwrap();
        let names: Vec<_> = a.children().iter().map(|c| c.name().unwrap().to_string()).collect();
        assert_eq!(names, vec!["b", "z", "m"]);

        let (again, created) = tree.get_or_create_tracked(&ContextPath::parse("a/b/c"));
        assert!(created.is_empty());
        assert!(Arc::ptr_eq(&again, &leaf));
        assert_eq!(tree.node_count(), 5);
    }

    #[test]
    fn test_provider_and_inheritance() {
        let provider = EnablementMap::new().with("a/off", false);
        let (_clock, tree) = tree_with(provider, 0);
        let off = tree.get_or_create(&ContextPath::parse("a/off"));
        let below = tree.get_or_create(&ContextPath::parse("a/off/x"));
        assert!(!off.is_enabled());
        assert!(!off.is_inherited());
        assert!(!below.is_enabled());
        assert!(below.is_inherited());
    }

    #[test]
    fn test_enable_propagation() {
        let (_clock, tree) = tree_with(EnablementMap::new(), 0);
        let a = tree.get_or_create(&ContextPath::parse("a"));
        let b = tree.get_or_create(&ContextPath::parse("a/b"));
        let c = tree.get_or_create(&ContextPath::parse("a/b/c"));

        tree.set_enabled(&a, false);
        assert!(!tree.is_effectively_enabled(&b));
        assert!(!tree.is_effectively_enabled(&c));

        tree.set_enabled(&a, true);
        tree.set_enabled(&c, true);
        tree.set_enabled(&a, false);
        assert!(!b.is_enabled());
        assert!(c.is_enabled());
        assert!(!c.is_inherited());
    }

    #[test]
    fn test_disabling_drops_metric() {
        let (_clock, tree) = tree_with(EnablementMap::new(), 0);
        let a = tree.get_or_create(&ContextPath::parse("a"));
        let b = tree.get_or_create(&ContextPath::parse("a/b"));
        counter_for(&tree, &b);
        tree.set_enabled(&a, false);
        assert!(b.metric().is_none());

        let meter = Meter::new(b.path().clone(), Arc::clone(tree.clock()), testing::reservoir(0), Forwarders::default());
        assert!(tree.bind_metric(&b, Metric::Meter(meter)).unwrap().is_none());
    }

    #[test]
    fn test_global_round_trip_keeps_local_flags() {
        let (_clock, tree) = tree_with(EnablementMap::new(), 0);
        let a = tree.get_or_create(&ContextPath::parse("a"));
        let b = tree.get_or_create(&ContextPath::parse("a/b"));
        let c = tree.get_or_create(&ContextPath::parse("c"));
        tree.set_enabled(&c, false);
        counter_for(&tree, &b);

        tree.set_global_enabled(false);
        assert!(!tree.is_effectively_enabled(&a));
        assert!(b.metric().is_none());
        tree.set_global_enabled(true);

        assert!(a.is_enabled() && a.is_inherited());
        assert!(b.is_enabled() && b.is_inherited());
        assert!(!c.is_enabled() && !c.is_inherited());
    }

    #[test]
    fn test_kind_mismatch() {
        let (_clock, tree) = tree_with(EnablementMap::new(), 0);
        let a = tree.get_or_create(&ContextPath::parse("a"));
        counter_for(&tree, &a);
        let meter = Meter::new(a.path().clone(), Arc::clone(tree.clock()), testing::reservoir(0), Forwarders::default());
        assert_eq!(
            tree.bind_metric(&a, Metric::Meter(meter)).err(),
            Some(InvariantError::MetricKindMismatch {
                path: "a".into(),
                existing: "counter",
                requested: "meter",
            })
        );
        assert_eq!(tree.metrics(MetricFilter::Kind(MetricKind::Counter)).len(), 1);
    }

    #[test]
    fn test_deferred_disposal() {
        let (clock, tree) = tree_with(EnablementMap::new(), 1_000);
        let parent = tree.get_or_create(&ContextPath::parse("p"));
        let child = tree.get_or_create(&ContextPath::parse("p/c"));
        counter_for(&tree, &child);

        assert!(tree.dispose(&parent, DisposalContext::External, false).is_none());
        assert!(tree.find(&ContextPath::parse("p")).is_some());
        assert_eq!(child.container().unwrap().externally_disposed_at(), Some(0));

        clock.set_time(999);
        assert_eq!(tree.cleanup().removed_metrics, 0);
        assert!(tree.find(&ContextPath::parse("p/c")).is_some());

        clock.set_time(1_000);
        let report = tree.cleanup();
        assert_eq!(report.removed_metrics, 1);
        assert_eq!(report.removed_nodes, 2);
        assert!(tree.find(&ContextPath::parse("p")).is_none());
        assert!(parent.is_detached() && child.is_detached());
    }

    #[test]
    fn test_forced_disposal_collapses_empty_ancestors() {
        let (_clock, tree) = tree_with(EnablementMap::new(), 60_000);
        let keep = tree.get_or_create(&ContextPath::parse("a/keep"));
        counter_for(&tree, &keep);
        let leaf = tree.get_or_create(&ContextPath::parse("a/b/c"));
        counter_for(&tree, &leaf);

        assert!(tree.dispose(&leaf, DisposalContext::External, true).is_some());
        assert!(tree.find(&ContextPath::parse("a/b")).is_none());
        assert!(tree.find(&ContextPath::parse("a/keep")).is_some());

        // a detached handle resolves to a fresh node
        let revived = tree.resolve(&leaf);
        assert!(!Arc::ptr_eq(&revived, &leaf));
        assert_eq!(revived.path(), leaf.path());
    }

    #[test]
    fn test_consume_returns_metric_and_keeps_children() {
        let (clock, tree) = tree_with(EnablementMap::new(), 500);
        let a = tree.get_or_create(&ContextPath::parse("a"));
        let b = tree.get_or_create(&ContextPath::parse("a/b"));
        counter_for(&tree, &a);
        counter_for(&tree, &b);

        let consumed = tree.dispose(&a, DisposalContext::Consume, false);
        assert!(consumed.is_some());
        assert!(a.metric().is_some());
        assert!(b.container().unwrap().consumed_at().is_none());

        clock.set_time(500);
        assert_eq!(tree.cleanup().removed_metrics, 1);
        assert!(a.metric().is_none());
        assert!(!a.is_detached());
        assert!(b.metric().is_some());
    }

    #[test]
    fn test_cleanup_ignores_live_metrics() {
        let (clock, tree) = tree_with(EnablementMap::new(), 0);
        let a = tree.get_or_create(&ContextPath::parse("a"));
        counter_for(&tree, &a);
        clock.set_time(1_000_000);
        assert_eq!(tree.cleanup().removed_metrics, 0);
        assert!(a.metric().is_some());
    }

    #[test]
    fn test_cleanup_releases_root_metric() {
        let (clock, tree) = tree_with(EnablementMap::new(), 100);
        let root = Arc::clone(tree.root());
        counter_for(&tree, &root);
        tree.get_or_create(&ContextPath::parse("a"));

        assert!(tree.dispose(&root, DisposalContext::Consume, false).is_some());
        clock.set_time(99);
        assert_eq!(tree.cleanup().removed_metrics, 0);
        assert!(root.metric().is_some());

        clock.set_time(100);
        let report = tree.cleanup();
        assert_eq!(report.removed_metrics, 1);
        assert!(root.metric().is_none());
        assert!(!root.is_detached());
        assert!(tree.find(&ContextPath::parse("a")).is_some());
    }

    #[test]
    fn test_bind_after_collapse_lands_on_live_node() {
        let (_clock, tree) = tree_with(EnablementMap::new(), 0);
        let a = tree.get_or_create(&ContextPath::parse("a"));
        let b = tree.get_or_create(&ContextPath::parse("a/b"));
        counter_for(&tree, &b);

        // `a` was resolved before the subtree collapsed underneath it
        tree.dispose(&b, DisposalContext::External, true);
        assert!(a.is_detached());

        let bound = counter_for(&tree, &a);
        let live = tree.find(&ContextPath::parse("a")).unwrap();
        assert!(!Arc::ptr_eq(&live, &a));
        assert_eq!(live.metric().and_then(|m| m.path().cloned()), bound.path().cloned());
        assert!(a.metric().is_none());
        assert_eq!(tree.metrics(MetricFilter::Any).len(), 1);
    }
}
