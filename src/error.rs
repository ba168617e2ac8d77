// ============================================================================
// ERROR HANDLING FRAMEWORK
// ============================================================================
// Error types for every subsystem in the engine.
// - Configuration errors are fatal at startup
// - Invariant errors indicate a bug in the calling code
// - Runtime data anomalies never surface here: they are logged and dropped
// ============================================================================

use std::path::PathBuf;

use thiserror::Error;

// ----------------------------------------------------------------------------
// 1 Core Engine Errors
// ----------------------------------------------------------------------------

/// Error returned by engine construction and metric operations.
#[derive(Error, Debug)]
pub enum VitalsError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invariant violated: {0}")]
    Invariant(#[from] InvariantError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl VitalsError {
    /// Only I/O failures are worth retrying; everything else needs a config
    /// or code change.
    pub fn is_recoverable(&self) -> bool {
        match self {
            VitalsError::Config(_) => false,
            VitalsError::Invariant(_) => false,
            VitalsError::Io(_) => true,
            VitalsError::Internal(_) => false,
        }
    }

    /// Short label used as the `category` field in logs.
    pub fn category(&self) -> &'static str {
        match self {
            VitalsError::Config(_) => "config",
            VitalsError::Invariant(_) => "invariant",
            VitalsError::Io(_) => "io",
            VitalsError::Internal(_) => "internal",
        }
    }
}

// ----------------------------------------------------------------------------
// 2 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors raised while validating configuration or building engine parts from it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Configuration file not found: {}", path.display())]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Reservoir '{reservoir}': resolution {resolution} is not a multiple of step {step}")]
    ResolutionNotMultipleOfStep {
        reservoir: String,
        resolution: i64,
        step: i64,
    },

    #[error("Reservoir '{reservoir}': resolutions must be strictly increasing ({previous} then {next})")]
    ResolutionsNotIncreasing {
        reservoir: String,
        previous: i64,
        next: i64,
    },

    #[error("Reservoir '{reservoir}': smallest resolution {smallest} must equal step {step}")]
    SmallestResolutionNotStep {
        reservoir: String,
        smallest: i64,
        step: i64,
    },

    #[error("Unknown reservoir kind: {0}")]
    UnknownReservoirKind(String),

    #[error("Unknown metric kind: {0}")]
    UnknownMetricKind(String),

    #[error("No reservoir configured under the name '{0}'")]
    MissingReservoir(String),

    #[error("Malformed path pattern segment '{segment}': {message}")]
    MalformedPattern { segment: String, message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn malformed_pattern(segment: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::MalformedPattern {
            segment: segment.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 3 Invariant Errors
// ----------------------------------------------------------------------------

/// Programming errors: the caller broke a contract of the engine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InvariantError {
    #[error("Re-entrant acquisition of the state lock for '{0}'")]
    ReentrantLock(String),

    #[error("Release of a state lock that is not held")]
    UnbalancedRelease,

    #[error("An instance context is already active in this call scope: {0}")]
    InstanceContextActive(String),

    #[error("No instance context is active in this call scope")]
    NoActiveInstanceContext,

    #[error("Quantile {0} is outside [0, 1]")]
    QuantileOutOfRange(f64),

    #[error("Context '{path}' already holds a {existing} metric, requested {requested}")]
    MetricKindMismatch {
        path: String,
        existing: &'static str,
        requested: &'static str,
    },
}

// ----------------------------------------------------------------------------
// 4 Result Type Aliases
// ----------------------------------------------------------------------------

/// Result type alias for engine operations
pub type VitalsResult<T> = Result<T, VitalsError>;

/// Result type for configuration validation
pub type ConfigResult<T> = Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err: VitalsError = ConfigError::UnknownReservoirKind("ring".into()).into();
        assert_eq!(err.category(), "config");
        assert!(!err.is_recoverable());

        let err: VitalsError = InvariantError::QuantileOutOfRange(1.5).into();
        assert_eq!(err.category(), "invariant");
        assert!(err.to_string().contains("1.5"));
    }

    #[test]
    fn test_config_error_messages() {
        let err = ConfigError::ResolutionNotMultipleOfStep {
            reservoir: "default".into(),
            resolution: 7,
            step: 5,
        };
        assert_eq!(
            err.to_string(),
            "Reservoir 'default': resolution 7 is not a multiple of step 5"
        );
    }
}
