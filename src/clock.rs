// ============================================================================
// CLOCK PROVIDERS
// ============================================================================
// Two time bases are used by the engine:
// - wall-clock milliseconds, which place observations into archive windows
// - a monotonic tick (nanoseconds) used only to measure timer splits
// ============================================================================

use std::fmt::Debug;
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of wall-clock time and monotonic ticks.
pub trait Clock: Send + Sync + Debug {
    /// Wall-clock milliseconds since the Unix epoch.
    fn time_millis(&self) -> i64;

    /// Monotonic counter in nanoseconds, only meaningful as a difference.
    fn tick(&self) -> i64;
}

/// Shared clock handle passed around the engine.
pub type SharedClock = Arc<dyn Clock>;

// ----------------------------------------------------------------------------
// System Clock
// ----------------------------------------------------------------------------

/// Production clock: `SystemTime` for wall time, quanta for ticks.
#[derive(Debug, Clone)]
pub struct SystemClock {
    ticks: quanta::Clock,
    origin: quanta::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        let ticks = quanta::Clock::new();
        let origin = ticks.now();
        Self { ticks, origin }
    }

    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    #[inline]
    fn time_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default()
    }

    #[inline]
    fn tick(&self) -> i64 {
        self.ticks.now().duration_since(self.origin).as_nanos() as i64
    }
}

// ----------------------------------------------------------------------------
// Manual Clock
// ----------------------------------------------------------------------------

/// Deterministic clock whose time and tick only move when told to.
///
/// Used by tests and by embedders that replay recorded data.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicI64,
    tick: AtomicI64,
}

impl ManualClock {
    pub fn new(millis: i64) -> Self {
        Self {
            millis: AtomicI64::new(millis),
            tick: AtomicI64::new(0),
        }
    }

    pub fn shared(millis: i64) -> Arc<Self> {
        Arc::new(Self::new(millis))
    }

    pub fn set_time(&self, millis: i64) {
        self.millis.store(millis, AtomicOrdering::SeqCst);
    }

    pub fn advance_time(&self, millis: i64) {
        self.millis.fetch_add(millis, AtomicOrdering::SeqCst);
    }

    pub fn set_tick(&self, tick: i64) {
        self.tick.store(tick, AtomicOrdering::SeqCst);
    }

    pub fn advance_tick(&self, nanos: i64) {
        self.tick.fetch_add(nanos, AtomicOrdering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn time_millis(&self) -> i64 {
        self.millis.load(AtomicOrdering::SeqCst)
    }

    fn tick(&self) -> i64 {
        self.tick.load(AtomicOrdering::SeqCst)
    }
}
