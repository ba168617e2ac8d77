//! # Vitals Engine
//!
//! An in-process metrics engine. Instrumented code records counters, timers,
//! meters and aggregates against contexts in a hierarchical namespace; every
//! metric keeps its history in a fixed-memory round-robin reservoir (or a
//! single open accumulator) and can forward its observations to parent and
//! attached contexts.
//!
//! ## Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                            VITALS ENGINE                             │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  CONTEXT TREE → METRIC FACTORY → METRIC (+ FORWARDERS) → RESERVOIR   │
//! │        ↑                                                             │
//! │  FORWARD RULES (pattern → target templates)      CLEANUP DAEMON      │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ```
//! use vitals_engine::{CounterType, EngineConfig, ManualClock, VitalsEngine};
//!
//! let engine = VitalsEngine::new(EngineConfig::default(), ManualClock::shared(0)).unwrap();
//! let ctx = engine.context_str("shop/checkout");
//! let counter = engine.counter(&ctx, CounterType::Hierarchical).unwrap();
//! counter.inc(3);
//! assert_eq!(counter.count(), 3);
//! ```

#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ============================================================================
// MODULES
// ============================================================================

pub mod cleanup;
pub mod clock;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod factory;
pub mod forward;
pub mod lock;
pub mod logging;
pub mod matcher;
pub mod metric;
pub mod path;
pub mod reservoir;
pub mod scope;

pub use cleanup::{CleanupDaemon, Sweeper};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{EngineConfig, LoggingConfig};
pub use context::{CleanupReport, Context, DisposalContext, EnablementMap, EnablementProvider, MonitoringContextTree};
pub use engine::VitalsEngine;
pub use error::{ConfigError, ConfigResult, InvariantError, VitalsError, VitalsResult};
pub use factory::MetricFactory;
pub use forward::{ForwardRule, MapResolver, NodeNameResolver, TargetTemplate, VariableResolver};
pub use logging::{init_logging, parse_level, LogFormat};
pub use matcher::{Bindings, PathMatcher};
pub use metric::{
    Aggregate, AggregateType, Counter, CounterType, Meter, Metric, MetricFilter, MetricKind, Split, Timer, TimerType,
};
pub use path::ContextPath;
pub use reservoir::{ArchiveSpec, RateMode, Reservoir, ReservoirKind, ReservoirSpec, Snapshot, StartSpec};
pub use scope::CallScope;

// ============================================================================
// CONSTANTS
// ============================================================================

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_NAME: &str = "vitals-engine";

/// Reservoir used by every metric kind without an explicit assignment.
pub const DEFAULT_RESERVOIR: &str = "default";

/// Longest chain of forwarding hops (and forward-rule context creations)
/// followed from one observation.
pub const MAX_FORWARD_DEPTH: usize = 8;

/// Grace period of consumed and disposed metrics.
pub const DEFAULT_CONSUMED_TIMEOUT_MS: i64 = 60_000;

pub const DEFAULT_CLEANUP_PERIOD_MS: u64 = 10_000;
