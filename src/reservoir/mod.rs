// ============================================================================
// RESERVOIR ENGINE
// ============================================================================
// Storage and online statistics backing one metric:
// - RoundRobinReservoir: fixed-memory ring buffers, one per resolution
// - OneValueReservoir: a single unbounded accumulator ("open resolution")
//
// Reservoirs are not synchronized. The owning metric serializes every call
// through its state token.
// ============================================================================

mod archive;
mod open;
mod round_robin;

use std::fmt::Debug;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult, InvariantError};
use crate::path::ContextPath;

pub use open::OneValueReservoir;
pub use round_robin::RoundRobinReservoir;

// ----------------------------------------------------------------------------
// 1 Reservoir Contract
// ----------------------------------------------------------------------------

/// Storage + statistics engine behind a metric.
pub trait Reservoir: Send + Debug {
    /// Record one observation. Returns `false` when the observation was
    /// dropped because its timestamp is older than the last accepted one.
    fn update(&mut self, timestamp: i64, value: i64) -> bool;

    /// Timestamp of the newest accepted observation.
    fn last_timestamp(&self) -> Option<i64>;

    /// Statistics of the window containing `now`. `resolution = None` picks
    /// the finest resolution. `None` when no archive serves the resolution.
    fn snapshot(&self, now: i64, resolution: Option<i64>) -> Option<Snapshot>;

    /// Historical windows overlapping `[start, end]`, oldest first. Empty
    /// unless the whole range is covered by the retained span.
    fn snapshots(&self, start: i64, end: i64, resolution: i64) -> Vec<Snapshot>;

    /// Every retained window for a resolution, oldest first.
    fn all_snapshots(&self, now: i64, resolution: Option<i64>) -> Vec<Snapshot>;

    /// Configured resolutions, finest first. Empty for open resolution.
    fn resolutions(&self) -> Vec<i64>;

    fn kind(&self) -> ReservoirKind;
}

// ----------------------------------------------------------------------------
// 2 Snapshots
// ----------------------------------------------------------------------------

/// How a meter's mean rate is derived from a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateMode {
    /// `sum / (end - start)`; used for the live window, which is still open.
    Absolute,
    /// `sum * unit / (end - start + 1)`; used for closed historical windows.
    Relative,
}

/// Statistics of one window (or of the whole life of an open reservoir).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub path: ContextPath,
    pub start: i64,
    pub end: i64,
    /// Window width, `None` for open resolution.
    pub resolution: Option<i64>,
    pub size: u64,
    pub sum: i64,
    pub mean: f64,
    pub std_dev: f64,
    pub min: Option<i64>,
    pub min_timestamp: Option<i64>,
    pub max: Option<i64>,
    pub max_timestamp: Option<i64>,
    pub first_usage_timestamp: Option<i64>,
    pub last_usage_timestamp: Option<i64>,
    pub last_value: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_values: Option<Vec<i64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_mode: Option<RateMode>,
}

impl Snapshot {
    /// An empty window.
    pub fn empty(start: i64, end: i64, resolution: Option<i64>) -> Self {
        Self {
            path: ContextPath::root(),
            start,
            end,
            resolution,
            size: 0,
            sum: 0,
            mean: f64::NAN,
            std_dev: f64::NAN,
            min: None,
            min_timestamp: None,
            max: None,
            max_timestamp: None,
            first_usage_timestamp: None,
            last_usage_timestamp: None,
            last_value: None,
            raw_values: None,
            rate_mode: None,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub(crate) fn with_path(mut self, path: &ContextPath) -> Self {
        self.path = path.clone();
        self
    }

    pub(crate) fn with_rate_mode(mut self, mode: RateMode) -> Self {
        self.rate_mode = Some(mode);
        self
    }

    /// Mean rate per `unit`, only for meter snapshots.
    pub fn mean_rate(&self, unit: Duration) -> Option<f64> {
        let mode = self.rate_mode?;
        if self.size == 0 {
            return Some(0.0);
        }
        let unit_ms = unit.as_secs_f64() * 1000.0;
        let sum = self.sum as f64;
        let rate = match mode {
            RateMode::Absolute => {
                let elapsed = (self.end - self.start).max(1) as f64;
                sum / elapsed * unit_ms
            }
            RateMode::Relative => sum * (unit_ms / (self.end - self.start + 1) as f64),
        };
        Some(rate)
    }

    /// Nearest-rank quantile over retained raw values.
    pub fn quantile(&self, q: f64) -> Result<Option<i64>, InvariantError> {
        if !(0.0..=1.0).contains(&q) {
            return Err(InvariantError::QuantileOutOfRange(q));
        }
        let Some(values) = self.raw_values.as_ref().filter(|v| !v.is_empty()) else {
            return Ok(None);
        };
        let mut sorted = values.clone();
        sorted.sort_unstable();
        let rank = (q * sorted.len() as f64).ceil() as usize;
        let index = rank.saturating_sub(1).min(sorted.len() - 1);
        Ok(Some(sorted[index]))
    }
}

// ----------------------------------------------------------------------------
// 3 Reservoir Specification & Builder
// ----------------------------------------------------------------------------

/// Storage strategy of a reservoir.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservoirKind {
    RoundRobin,
    OpenResolution,
}

impl FromStr for ReservoirKind {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.to_ascii_lowercase().replace('-', "_").as_str() {
            "round_robin" => Ok(ReservoirKind::RoundRobin),
            "open_resolution" => Ok(ReservoirKind::OpenResolution),
            _ => Err(ConfigError::UnknownReservoirKind(raw.to_string())),
        }
    }
}

/// Where the first window of a round-robin reservoir begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartSpec {
    /// At the creation instant, unrounded.
    #[default]
    Zero,
    /// At the start of the minute containing the creation instant.
    CurrentMinute,
    /// At the start of the second containing the creation instant.
    CurrentSecond,
}

impl StartSpec {
    pub fn align(self, now: i64) -> i64 {
        match self {
            StartSpec::Zero => now,
            StartSpec::CurrentMinute => now - now.rem_euclid(60_000),
            StartSpec::CurrentSecond => now - now.rem_euclid(1_000),
        }
    }
}

impl FromStr for StartSpec {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.to_ascii_lowercase().as_str() {
            "zero" => Ok(StartSpec::Zero),
            "current_minute" => Ok(StartSpec::CurrentMinute),
            "current_second" => Ok(StartSpec::CurrentSecond),
            _ => Err(ConfigError::invalid_value("start", format!("unknown start spec '{}'", raw))),
        }
    }
}

/// One resolution of a round-robin reservoir.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveSpec {
    /// Window width in milliseconds.
    pub resolution: i64,
    /// Number of windows kept.
    pub retention: usize,
    /// Raw values kept per window; 0 disables raw retention.
    pub max_raw_values: usize,
}

/// Validated recipe for building reservoirs.
#[derive(Debug, Clone, PartialEq)]
pub struct ReservoirSpec {
    pub name: String,
    pub kind: ReservoirKind,
    pub step: i64,
    pub archives: Vec<ArchiveSpec>,
    pub start: StartSpec,
}

impl ReservoirSpec {
    /// A round-robin recipe. Fails unless every resolution is a positive
    /// multiple of `step`, resolutions strictly increase, and the smallest
    /// equals `step`.
    pub fn round_robin(
        name: impl Into<String>,
        step: i64,
        archives: Vec<ArchiveSpec>,
        start: StartSpec,
    ) -> ConfigResult<Self> {
        let spec = Self {
            name: name.into(),
            kind: ReservoirKind::RoundRobin,
            step,
            archives,
            start,
        };
        spec.validate()?;
        Ok(spec)
    }

    /// An open-resolution recipe.
    pub fn open(name: impl Into<String>, max_raw_values: usize) -> Self {
        Self {
            name: name.into(),
            kind: ReservoirKind::OpenResolution,
            step: 0,
            archives: vec![ArchiveSpec {
                resolution: 0,
                retention: 1,
                max_raw_values,
            }],
            start: StartSpec::Zero,
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.kind == ReservoirKind::OpenResolution {
            return Ok(());
        }
        if self.step <= 0 {
            return Err(ConfigError::invalid_value(
                format!("reservoirs.{}.resolution_step_ms", self.name),
                "step must be positive",
            ));
        }
        let Some(first) = self.archives.first() else {
            return Err(ConfigError::invalid_value(
                format!("reservoirs.{}.resolutions_ms", self.name),
                "at least one resolution is required",
            ));
        };
        if first.resolution != self.step {
            return Err(ConfigError::SmallestResolutionNotStep {
                reservoir: self.name.clone(),
                smallest: first.resolution,
                step: self.step,
            });
        }
        let mut previous: Option<i64> = None;
        for archive in &self.archives {
            if archive.resolution <= 0 || archive.resolution % self.step != 0 {
                return Err(ConfigError::ResolutionNotMultipleOfStep {
                    reservoir: self.name.clone(),
                    resolution: archive.resolution,
                    step: self.step,
                });
            }
            if let Some(prev) = previous {
                if archive.resolution <= prev {
                    return Err(ConfigError::ResolutionsNotIncreasing {
                        reservoir: self.name.clone(),
                        previous: prev,
                        next: archive.resolution,
                    });
                }
            }
            if archive.retention == 0 {
                return Err(ConfigError::invalid_value(
                    format!("reservoirs.{}.retentions", self.name),
                    "retention must be at least 1",
                ));
            }
            previous = Some(archive.resolution);
        }
        Ok(())
    }

    /// Build a fresh reservoir created at `now`.
    pub fn build(&self, now: i64) -> Box<dyn Reservoir> {
        match self.kind {
            ReservoirKind::RoundRobin => Box::new(RoundRobinReservoir::from_spec(self, now)),
            ReservoirKind::OpenResolution => {
                let max_raw = self.archives.first().map(|a| a.max_raw_values).unwrap_or(0);
                Box::new(OneValueReservoir::new(now, max_raw))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn archive(resolution: i64, retention: usize) -> ArchiveSpec {
        ArchiveSpec {
            resolution,
            retention,
            max_raw_values: 0,
        }
    }

    #[test]
    fn test_spec_validation() {
        assert!(ReservoirSpec::round_robin("ok", 5, vec![archive(5, 5), archive(10, 5)], StartSpec::Zero).is_ok());

        assert_eq!(
            ReservoirSpec::round_robin("a", 5, vec![archive(5, 5), archive(12, 5)], StartSpec::Zero),
            Err(ConfigError::ResolutionNotMultipleOfStep {
                reservoir: "a".into(),
                resolution: 12,
                step: 5
            })
        );
        assert_eq!(
            ReservoirSpec::round_robin("b", 5, vec![archive(5, 5), archive(5, 5)], StartSpec::Zero),
            Err(ConfigError::ResolutionsNotIncreasing {
                reservoir: "b".into(),
                previous: 5,
                next: 5
            })
        );
        assert_eq!(
            ReservoirSpec::round_robin("c", 5, vec![archive(10, 5)], StartSpec::Zero),
            Err(ConfigError::SmallestResolutionNotStep {
                reservoir: "c".into(),
                smallest: 10,
                step: 5
            })
        );
        assert!(ReservoirSpec::round_robin("d", 5, vec![archive(5, 0)], StartSpec::Zero).is_err());
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("ROUND_ROBIN".parse::<ReservoirKind>(), Ok(ReservoirKind::RoundRobin));
        assert_eq!("open-resolution".parse::<ReservoirKind>(), Ok(ReservoirKind::OpenResolution));
        assert_eq!(
            "ring".parse::<ReservoirKind>(),
            Err(ConfigError::UnknownReservoirKind("ring".into()))
        );
    }

    #[test]
    fn test_start_alignment() {
        assert_eq!(StartSpec::Zero.align(61_234), 61_234);
        assert_eq!(StartSpec::CurrentSecond.align(61_234), 61_000);
        assert_eq!(StartSpec::CurrentMinute.align(61_234), 60_000);
    }

    #[test]
    fn test_quantile() {
        let mut snap = Snapshot::empty(0, 9, Some(10));
        snap.size = 4;
        snap.raw_values = Some(vec![40, 10, 30, 20]);
        assert_eq!(snap.quantile(0.5), Ok(Some(20)));
        assert_eq!(snap.quantile(1.0), Ok(Some(40)));
        assert_eq!(snap.quantile(0.0), Ok(Some(10)));
        assert_eq!(snap.quantile(1.5), Err(InvariantError::QuantileOutOfRange(1.5)));
        snap.raw_values = None;
        assert_eq!(snap.quantile(0.5), Ok(None));
    }

    #[test]
    fn test_snapshot_serializes_without_empty_extras() {
        let mut snap = Snapshot::empty(0, 9, Some(10)).with_path(&ContextPath::parse("db/query"));
        snap.size = 1;
        snap.sum = 7;
        snap.mean = 7.0;
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["path"], serde_json::json!(["db", "query"]));
        assert_eq!(json["sum"], serde_json::json!(7));
        assert!(json.get("raw_values").is_none());
        assert!(json.get("rate_mode").is_none());

        let json = serde_json::to_value(snap.with_rate_mode(RateMode::Absolute)).unwrap();
        assert_eq!(json["rate_mode"], serde_json::json!("absolute"));
    }

    #[test]
    fn test_mean_rate_modes() {
        let mut snap = Snapshot::empty(0, 9, Some(10));
        snap.size = 2;
        snap.sum = 20;
        assert_eq!(snap.mean_rate(Duration::from_millis(1)), None);

        let relative = snap.clone().with_rate_mode(RateMode::Relative);
        assert_eq!(relative.mean_rate(Duration::from_millis(1)), Some(2.0));

        let mut absolute = snap.with_rate_mode(RateMode::Absolute);
        absolute.end = 4;
        assert_eq!(absolute.mean_rate(Duration::from_millis(1)), Some(5.0));
        assert_eq!(absolute.mean_rate(Duration::from_secs(1)), Some(5000.0));
    }
}
