// ----------------------------------------------------------------------------
// Instance Contexts
// ----------------------------------------------------------------------------
// A call scope carries at most one active instance context: a short-lived
// child context (one request, one job run) that is disposed when the
// instance ends. Scopes are passed explicitly to the code that records
// into them.
// ----------------------------------------------------------------------------

use tracing::debug;

use crate::context::Context;
use crate::engine::VitalsEngine;
use crate::error::{InvariantError, VitalsResult};
use crate::metric::Metric;

#[derive(Debug)]
pub struct CallScope<'e> {
    engine: &'e VitalsEngine,
    active: Option<Context>,
}

impl<'e> CallScope<'e> {
    pub fn new(engine: &'e VitalsEngine) -> Self {
        Self { engine, active: None }
    }

    pub fn active(&self) -> Option<&Context> {
        self.active.as_ref()
    }

    /// Create `parent/id` and make it the active instance context.
    pub fn begin_instance(&mut self, parent: &Context, id: &str) -> VitalsResult<Context> {
        if let Some(active) = &self.active {
            return Err(InvariantError::InstanceContextActive(active.path().to_string()).into());
        }
        let ctx = self.engine.context(&parent.path().child(id));
        debug!(target: "vitals::context", path = %ctx.path(), "Instance context started");
        self.active = Some(ctx.clone());
        Ok(ctx)
    }

    /// Dispose the active instance context. Returns its metric if it was
    /// dropped.
    pub fn end_instance(&mut self, force: bool) -> VitalsResult<Option<Metric>> {
        let ctx = self.active.take().ok_or(InvariantError::NoActiveInstanceContext)?;
        debug!(target: "vitals::context", path = %ctx.path(), force, "Instance context ended");
        Ok(self.engine.dispose(&ctx, force))
    }
}

impl Drop for CallScope<'_> {
    fn drop(&mut self) {
        if let Some(ctx) = self.active.take() {
            self.engine.dispose(&ctx, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::EngineConfig;
    use crate::error::VitalsError;
    use crate::metric::CounterType;
    use crate::path::ContextPath;

    fn engine() -> VitalsEngine {
        VitalsEngine::new(EngineConfig::default(), ManualClock::shared(0)).unwrap()
    }

    #[test]
    fn test_single_active_instance() {
        let engine = engine();
        let parent = engine.context_str("requests");
        let mut scope = engine.call_scope();

        let ctx = scope.begin_instance(&parent, "r-1").unwrap();
        assert_eq!(ctx.path(), &ContextPath::parse("requests/r-1"));
        let err = scope.begin_instance(&parent, "r-2").unwrap_err();
        assert!(matches!(
            err,
            VitalsError::Invariant(InvariantError::InstanceContextActive(ref path)) if path == "requests/r-1"
        ));

        engine.counter(&ctx, CounterType::Default).unwrap().inc_one();
        assert!(scope.end_instance(true).unwrap().is_some());
        assert!(ctx.is_detached());
        assert!(scope.active().is_none());
    }

    #[test]
    fn test_end_without_instance() {
        let engine = engine();
        let mut scope = engine.call_scope();
        assert!(matches!(
            scope.end_instance(false),
            Err(VitalsError::Invariant(InvariantError::NoActiveInstanceContext))
        ));
    }

    #[test]
    fn test_dropped_scope_disposes_instance() {
        let engine = engine();
        let parent = engine.context_str("jobs");
        let ctx = {
            let mut scope = engine.call_scope();
            scope.begin_instance(&parent, "run-7").unwrap()
        };
        // no metric was bound, so nothing holds the node back
        assert!(ctx.is_detached());
    }
}
