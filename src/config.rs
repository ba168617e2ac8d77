// ============================================================================
// CONFIGURATION SYSTEM
// ============================================================================
// TOML-backed engine configuration:
// - File loading with VITALS_-prefixed environment overrides (figment)
// - Validation of every reservoir, pattern and reference before any engine
//   state is built
// - Sensible defaults, including a `default` round-robin reservoir
// ============================================================================

use std::fs;
use std::path::Path;

use ahash::AHashMap;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::context::EnablementMap;
use crate::error::{ConfigError, ConfigResult, VitalsResult};
use crate::forward::ForwardRule;
use crate::logging::{parse_level, LogFormat};
use crate::metric::MetricKind;
use crate::path::ContextPath;
use crate::reservoir::{ArchiveSpec, ReservoirKind, ReservoirSpec, StartSpec};
use crate::{DEFAULT_CLEANUP_PERIOD_MS, DEFAULT_CONSUMED_TIMEOUT_MS, DEFAULT_RESERVOIR};

// ----------------------------------------------------------------------------
// 1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration of a metrics engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// `[engine]`: node identity, switches and timings
    #[serde(default)]
    pub engine: GeneralConfig,

    /// Reservoir recipes, referenced by name
    #[serde(default = "default_reservoirs")]
    pub reservoirs: Vec<ReservoirConfig>,

    /// Reservoir name per metric kind
    #[serde(default)]
    pub metric_reservoirs: MetricReservoirs,

    /// Initial per-node enablement
    #[serde(default)]
    pub enablement: Vec<EnablementEntry>,

    /// Forward rules evaluated against newly created contexts
    #[serde(default)]
    pub forward_rules: Vec<ForwardRuleConfig>,

    /// `[logging]`: subscriber level and layout
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            engine: GeneralConfig::default(),
            reservoirs: default_reservoirs(),
            metric_reservoirs: MetricReservoirs::default(),
            enablement: Vec::new(),
            forward_rules: Vec::new(),
            logging: LoggingConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Read `path` as TOML, then apply `VITALS_` variables on top
    /// (`VITALS_ENGINE__NODE_NAME` sets `engine.node_name`) and validate.
    pub fn load<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("VITALS_").split("__"));

        let config: Self = figment.extract().map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML string
    pub fn from_toml_str(toml_str: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration. Every error the engine could hit while
    /// building itself from this config is raised here.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.engine.node_name.trim().is_empty() {
            return Err(ConfigError::invalid_value("engine.node_name", "node name cannot be empty"));
        }
        if self.engine.consumed_metric_timeout_ms < 0 {
            return Err(ConfigError::invalid_value(
                "engine.consumed_metric_timeout_ms",
                "timeout cannot be negative",
            ));
        }
        if self.engine.cleanup_period_ms == 0 {
            return Err(ConfigError::invalid_value(
                "engine.cleanup_period_ms",
                "cleanup period must be positive",
            ));
        }

        let specs = self.reservoir_specs()?;
        for (kind, name) in self.metric_reservoirs.assignments() {
            if !specs.iter().any(|s| s.name == name) {
                return Err(ConfigError::invalid_value(
                    format!("metric_reservoirs.{}", kind),
                    ConfigError::MissingReservoir(name).to_string(),
                ));
            }
        }

        self.forward_rules()?;

        parse_level(&self.logging.level)?;
        self.logging.format.parse::<LogFormat>()?;

        Ok(())
    }

    /// Validated reservoir recipes. The built-in `default` recipe is added
    /// when no reservoir carries that name.
    pub fn reservoir_specs(&self) -> ConfigResult<Vec<ReservoirSpec>> {
        let mut specs = Vec::with_capacity(self.reservoirs.len() + 1);
        for reservoir in &self.reservoirs {
            if specs.iter().any(|s: &ReservoirSpec| s.name == reservoir.name) {
                return Err(ConfigError::invalid_value(
                    "reservoirs",
                    format!("reservoir '{}' is defined twice", reservoir.name),
                ));
            }
            specs.push(reservoir.to_spec()?);
        }
        if !specs.iter().any(|s| s.name == DEFAULT_RESERVOIR) {
            specs.push(ReservoirConfig::default().to_spec()?);
        }
        Ok(specs)
    }

    /// Compiled forward rules, in configuration order.
    pub fn forward_rules(&self) -> ConfigResult<Vec<ForwardRule>> {
        self.forward_rules
            .iter()
            .map(|rule| ForwardRule::parse(&rule.source_pattern, &rule.target_templates))
            .collect()
    }

    /// Initial enablement flags keyed by path.
    pub fn enablement_map(&self) -> EnablementMap {
        let mut map = EnablementMap::new();
        for entry in &self.enablement {
            map.insert(ContextPath::parse(&entry.path), entry.enabled);
        }
        map
    }

    /// The defaults rendered as TOML.
    pub fn generate_default_config() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }

    /// Write [`generate_default_config`](Self::generate_default_config)
    /// to `path`.
    pub fn write_default_config<P: AsRef<Path>>(path: P) -> VitalsResult<()> {
        fs::write(path, Self::generate_default_config())?;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 2 General Engine Configuration
// ----------------------------------------------------------------------------

/// Node identity, the global switch and disposal timings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Name of this process in a cluster; fills `$node` in forward targets
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// Master switch for every context
    #[serde(default = "default_true")]
    pub global_enabled: bool,

    /// How long a consumed or disposed metric survives before cleanup drops it
    #[serde(default = "default_consumed_timeout")]
    pub consumed_metric_timeout_ms: i64,

    /// Period of the cleanup daemon
    #[serde(default = "default_cleanup_period")]
    pub cleanup_period_ms: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            global_enabled: true,
            consumed_metric_timeout_ms: default_consumed_timeout(),
            cleanup_period_ms: default_cleanup_period(),
        }
    }
}

fn default_node_name() -> String {
    "local".into()
}

fn default_true() -> bool {
    true
}

fn default_consumed_timeout() -> i64 {
    DEFAULT_CONSUMED_TIMEOUT_MS
}

fn default_cleanup_period() -> u64 {
    DEFAULT_CLEANUP_PERIOD_MS
}

// ----------------------------------------------------------------------------
// 3 Reservoir Configuration
// ----------------------------------------------------------------------------

/// One reservoir recipe. `resolutions_ms`, `retentions` and
/// `max_raw_values` are parallel lists; `max_raw_values` may be left empty
/// to keep no raw values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservoirConfig {
    pub name: String,

    /// round_robin or open_resolution
    #[serde(default = "default_reservoir_kind")]
    pub kind: String,

    #[serde(default = "default_step")]
    pub resolution_step_ms: i64,

    #[serde(default = "default_resolutions")]
    pub resolutions_ms: Vec<i64>,

    #[serde(default = "default_retentions")]
    pub retentions: Vec<usize>,

    #[serde(default = "default_max_raw_values")]
    pub max_raw_values: Vec<usize>,

    /// zero, current_minute or current_second
    #[serde(default = "default_start")]
    pub start: String,
}

impl Default for ReservoirConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_RESERVOIR.into(),
            kind: default_reservoir_kind(),
            resolution_step_ms: default_step(),
            resolutions_ms: default_resolutions(),
            retentions: default_retentions(),
            max_raw_values: default_max_raw_values(),
            start: default_start(),
        }
    }
}

impl ReservoirConfig {
    /// Validate and convert into a reservoir recipe.
    pub fn to_spec(&self) -> ConfigResult<ReservoirSpec> {
        let kind: ReservoirKind = self.kind.parse()?;
        let start: StartSpec = self.start.parse()?;

        if kind == ReservoirKind::OpenResolution {
            let max_raw = self.max_raw_values.first().copied().unwrap_or(0);
            return Ok(ReservoirSpec::open(self.name.clone(), max_raw));
        }

        let resolutions = self.resolutions_ms.len();
        if self.retentions.len() != resolutions {
            return Err(ConfigError::invalid_value(
                format!("reservoirs.{}.retentions", self.name),
                format!("expected {} entries, found {}", resolutions, self.retentions.len()),
            ));
        }
        if !self.max_raw_values.is_empty() && self.max_raw_values.len() != resolutions {
            return Err(ConfigError::invalid_value(
                format!("reservoirs.{}.max_raw_values", self.name),
                format!("expected {} entries, found {}", resolutions, self.max_raw_values.len()),
            ));
        }

        let archives = self
            .resolutions_ms
            .iter()
            .zip(&self.retentions)
            .enumerate()
            .map(|(i, (&resolution, &retention))| ArchiveSpec {
                resolution,
                retention,
                max_raw_values: self.max_raw_values.get(i).copied().unwrap_or(0),
            })
            .collect();
        ReservoirSpec::round_robin(self.name.clone(), self.resolution_step_ms, archives, start)
    }
}

fn default_reservoirs() -> Vec<ReservoirConfig> {
    vec![ReservoirConfig::default()]
}

fn default_reservoir_kind() -> String {
    "round_robin".into()
}

fn default_step() -> i64 {
    1_000
}

fn default_resolutions() -> Vec<i64> {
    vec![1_000, 60_000, 3_600_000]
}

fn default_retentions() -> Vec<usize> {
    vec![60, 60, 24]
}

fn default_max_raw_values() -> Vec<usize> {
    vec![100, 0, 0]
}

fn default_start() -> String {
    "zero".into()
}

// ----------------------------------------------------------------------------
// 4 Metric, Enablement & Forwarding Configuration
// ----------------------------------------------------------------------------

/// Reservoir name used by each metric kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricReservoirs {
    #[serde(default = "default_reservoir_name")]
    pub counter: String,
    #[serde(default = "default_reservoir_name")]
    pub timer: String,
    #[serde(default = "default_reservoir_name")]
    pub meter: String,
    #[serde(default = "default_reservoir_name")]
    pub aggregate: String,
}

impl Default for MetricReservoirs {
    fn default() -> Self {
        Self {
            counter: default_reservoir_name(),
            timer: default_reservoir_name(),
            meter: default_reservoir_name(),
            aggregate: default_reservoir_name(),
        }
    }
}

impl MetricReservoirs {
    pub fn assignments(&self) -> AHashMap<MetricKind, String> {
        let mut map = AHashMap::with_capacity(MetricKind::ALL.len());
        map.insert(MetricKind::Counter, self.counter.clone());
        map.insert(MetricKind::Timer, self.timer.clone());
        map.insert(MetricKind::Meter, self.meter.clone());
        map.insert(MetricKind::Aggregate, self.aggregate.clone());
        map
    }
}

fn default_reservoir_name() -> String {
    DEFAULT_RESERVOIR.into()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnablementEntry {
    /// `/`-delimited context path
    pub path: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardRuleConfig {
    /// `/`-delimited pattern, e.g. `**/db/statement/<\d+>:nr`
    pub source_pattern: String,
    /// `/`-delimited targets with `$variable` segments
    #[serde(default)]
    pub target_templates: Vec<String>,
}

// ----------------------------------------------------------------------------
// 5 Logging Configuration
// ----------------------------------------------------------------------------

/// Subscriber settings consumed by [`init_logging`](crate::logging::init_logging).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// off, error, warn, info, debug or trace
    #[serde(default = "default_log_level")]
    pub level: String,

    /// pretty, compact or json
    #[serde(default = "default_log_format")]
    pub format: String,

    /// ANSI colors for pretty and compact output
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Emit file and line of each event
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}
