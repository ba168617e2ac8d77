// ----------------------------------------------------------------------------
// Context Nodes & Metric Containers
// ----------------------------------------------------------------------------

use std::fmt::{self, Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};

use ahash::AHashMap;
use compact_str::CompactString;
use parking_lot::Mutex;

use crate::metric::Metric;
use crate::path::ContextPath;

/// Shared handle to a context node.
pub type Context = Arc<ContextNode>;

/// Why a container is being asked to go away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisposalContext {
    /// Explicit caller dispose; propagates to children first.
    External,
    /// Read-and-remove query; does not touch children.
    Consume,
    /// Periodic sweep; drops containers whose disposal timeout elapsed.
    CleanupCheck,
}

// ----------------------------------------------------------------------------
// Metric Container
// ----------------------------------------------------------------------------

/// A bound metric plus its disposal bookkeeping.
#[derive(Debug, Clone)]
pub struct MetricContainer {
    metric: Metric,
    consumed_at: Option<i64>,
    externally_disposed_at: Option<i64>,
    timeout_ms: i64,
}

impl MetricContainer {
    pub fn new(metric: Metric, timeout_ms: i64) -> Self {
        Self {
            metric,
            consumed_at: None,
            externally_disposed_at: None,
            timeout_ms,
        }
    }

    pub fn metric(&self) -> &Metric {
        &self.metric
    }

    pub fn consumed_at(&self) -> Option<i64> {
        self.consumed_at
    }

    pub fn externally_disposed_at(&self) -> Option<i64> {
        self.externally_disposed_at
    }

    pub(crate) fn mark(&mut self, mode: DisposalContext, now: i64) {
        match mode {
            DisposalContext::External => self.externally_disposed_at = Some(now),
            DisposalContext::Consume => self.consumed_at = Some(now),
            DisposalContext::CleanupCheck => {}
        }
    }

    /// Latest disposal signal; a renewed signal restarts the timeout.
    fn signal_time(&self) -> Option<i64> {
        self.consumed_at.max(self.externally_disposed_at)
    }

    /// Forced, or signalled at least `timeout` ago.
    pub fn is_safe_to_drop(&self, now: i64, force: bool) -> bool {
        force
            || self
                .signal_time()
                .map_or(false, |at| now.saturating_sub(at) >= self.timeout_ms)
    }
}

// ----------------------------------------------------------------------------
// Context Node
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub(crate) struct NodeState {
    pub(crate) children: AHashMap<CompactString, Context>,
    pub(crate) attached: Vec<Weak<ContextNode>>,
    pub(crate) enabled: bool,
    pub(crate) inherited: bool,
    pub(crate) container: Option<MetricContainer>,
}

/// A namespace node. Identity is the path; the parent link is weak so the
/// tree owns nodes strictly top-down.
pub struct ContextNode {
    path: ContextPath,
    ordinal: u64,
    parent: Option<Weak<ContextNode>>,
    detached: AtomicBool,
    pub(crate) state: Mutex<NodeState>,
}

impl ContextNode {
    pub(crate) fn root(enabled: bool) -> Self {
        Self {
            path: ContextPath::root(),
            ordinal: 0,
            parent: None,
            detached: AtomicBool::new(false),
            state: Mutex::new(NodeState {
                children: AHashMap::new(),
                attached: Vec::new(),
                enabled,
                inherited: false,
                container: None,
            }),
        }
    }

    pub(crate) fn child_of(
        parent: &Context,
        segment: &str,
        ordinal: u64,
        enabled: bool,
        inherited: bool,
    ) -> Self {
        Self {
            path: parent.path.child(segment),
            ordinal,
            parent: Some(Arc::downgrade(parent)),
            detached: AtomicBool::new(false),
            state: Mutex::new(NodeState {
                children: AHashMap::new(),
                attached: Vec::new(),
                enabled,
                inherited,
                container: None,
            }),
        }
    }

    pub fn path(&self) -> &ContextPath {
        &self.path
    }

    pub fn name(&self) -> Option<&str> {
        self.path.name()
    }

    pub fn is_root(&self) -> bool {
        self.path.is_root()
    }

    /// Creation order, used to list children in insertion order.
    pub fn ordinal(&self) -> u64 {
        self.ordinal
    }

    pub fn parent(&self) -> Option<Context> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    /// Removed from the tree by disposal or cleanup.
    pub fn is_detached(&self) -> bool {
        self.detached.load(AtomicOrdering::Acquire)
    }

    pub(crate) fn mark_detached(&self) {
        self.detached.store(true, AtomicOrdering::Release);
    }

    /// Local flag, possibly inherited; ignores the global switch.
    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    /// True while the local flag has never been set explicitly.
    pub fn is_inherited(&self) -> bool {
        self.state.lock().inherited
    }

    pub fn metric(&self) -> Option<Metric> {
        self.state.lock().container.as_ref().map(|c| c.metric().clone())
    }

    pub fn container(&self) -> Option<MetricContainer> {
        self.state.lock().container.clone()
    }

    pub fn child(&self, segment: &str) -> Option<Context> {
        self.state.lock().children.get(segment).cloned()
    }

    /// Children in creation order.
    pub fn children(&self) -> Vec<Context> {
        let mut children: Vec<Context> = self.state.lock().children.values().cloned().collect();
        children.sort_by_key(|c| c.ordinal);
        children
    }

    pub fn child_count(&self) -> usize {
        self.state.lock().children.len()
    }

    /// Live attached contexts in attachment order.
    pub fn attached(&self) -> Vec<Context> {
        self.state.lock().attached.iter().filter_map(Weak::upgrade).collect()
    }

    /// Forward this node's future metrics to `other` as well. Attaching a
    /// node to itself or twice is a no-op.
    pub fn attach_context(self: &Arc<Self>, other: &Context) -> bool {
        if Arc::ptr_eq(self, other) {
            return false;
        }
        let mut state = self.state.lock();
        let known = state
            .attached
            .iter()
            .any(|w| w.upgrade().map_or(false, |c| Arc::ptr_eq(&c, other)));
        if known {
            return false;
        }
        state.attached.push(Arc::downgrade(other));
        true
    }
}

impl Debug for ContextNode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextNode")
            .field("path", &self.path.to_string())
            .field("ordinal", &self.ordinal)
            .field("detached", &self.is_detached())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::Counter;

    #[test]
    fn test_container_safety() {
        let mut container = MetricContainer::new(Metric::Counter(Counter::NOOP), 100);
        assert!(!container.is_safe_to_drop(1_000, false));
        assert!(container.is_safe_to_drop(1_000, true));

        container.mark(DisposalContext::Consume, 1_000);
        assert!(!container.is_safe_to_drop(1_099, false));
        assert!(container.is_safe_to_drop(1_100, false));

        // a later external signal restarts the clock
        container.mark(DisposalContext::External, 1_050);
        container.mark(DisposalContext::CleanupCheck, 5_000);
        assert_eq!(container.externally_disposed_at(), Some(1_050));
        assert!(!container.is_safe_to_drop(1_100, false));
        assert!(container.is_safe_to_drop(1_150, false));
    }

    #[test]
    fn test_attach_ignores_self_and_duplicates() {
        let root: Context = Arc::new(ContextNode::root(true));
        let a: Context = Arc::new(ContextNode::child_of(&root, "a", 1, true, true));
        let b: Context = Arc::new(ContextNode::child_of(&root, "b", 2, true, true));
        assert!(!a.attach_context(&a));
        assert!(a.attach_context(&b));
        assert!(!a.attach_context(&b));
        assert_eq!(a.attached().len(), 1);
        assert_eq!(a.path(), &ContextPath::from("a"));
        assert!(Arc::ptr_eq(&a.parent().unwrap(), &root));
    }
}
