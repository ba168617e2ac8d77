// ============================================================================
// LOGGING & TRACING
// ============================================================================
// One fmt layer on stderr (stdout belongs to CLI output), filtered by the
// configured level unless RUST_LOG says otherwise. Engine components log on
// `vitals::<module>` targets.
// ============================================================================

use std::str::FromStr;

use tracing::level_filters::LevelFilter;
use tracing::{info, Subscriber};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::config::LoggingConfig;
use crate::error::{ConfigError, ConfigResult, VitalsError, VitalsResult};

/// Layout of emitted events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line, human oriented
    Pretty,
    /// One line per event
    Compact,
    /// One JSON object per event, with the current span
    Json,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            _ => Err(ConfigError::invalid_value(
                "logging.format",
                format!("unknown format '{}'", raw),
            )),
        }
    }
}

/// Level names accepted in `logging.level`; `off` silences the engine.
pub fn parse_level(raw: &str) -> ConfigResult<LevelFilter> {
    match raw.to_ascii_lowercase().as_str() {
        "off" => Ok(LevelFilter::OFF),
        "error" => Ok(LevelFilter::ERROR),
        "warn" => Ok(LevelFilter::WARN),
        "info" => Ok(LevelFilter::INFO),
        "debug" => Ok(LevelFilter::DEBUG),
        "trace" => Ok(LevelFilter::TRACE),
        _ => Err(ConfigError::invalid_value(
            "logging.level",
            format!("unknown level '{}'", raw),
        )),
    }
}

fn event_layer<S>(config: &LoggingConfig, format: LogFormat) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_file(config.source_location)
        .with_line_number(config.source_location);

    match format {
        LogFormat::Json => layer
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_thread_ids(true)
            .boxed(),
        LogFormat::Compact => layer.compact().with_ansi(config.colors).boxed(),
        LogFormat::Pretty => layer.pretty().with_ansi(config.colors).with_thread_names(true).boxed(),
    }
}

/// Install the process-wide subscriber. Fails on an unknown level or
/// format, or when a subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> VitalsResult<()> {
    let level = parse_level(&config.level)?;
    let format: LogFormat = config.format.parse()?;
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(event_layer(config, format))
        .try_init()
        .map_err(|e| VitalsError::Internal(format!("Subscriber already installed: {}", e)))?;

    info!(target: "vitals::init", %level, ?format, "Logging ready");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_level_names() {
        assert_eq!(parse_level("DEBUG"), Ok(LevelFilter::DEBUG));
        assert_eq!(parse_level("off"), Ok(LevelFilter::OFF));
        assert!(matches!(
            parse_level("verbose"),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "logging.level"
        ));
    }

    #[test]
    fn test_format_names() {
        assert_eq!("Json".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_bad_level_is_rejected_before_install() {
        let config = LoggingConfig {
            level: "loud".into(),
            ..LoggingConfig::default()
        };
        assert_eq!(init_logging(&config).unwrap_err().category(), "config");
    }

    #[test]
    fn test_second_init_fails() {
        let config = LoggingConfig {
            format: "compact".into(),
            colors: false,
            ..LoggingConfig::default()
        };
        // another test in this process may already have installed a subscriber
        let _ = init_logging(&config);
        let err = init_logging(&config).unwrap_err();
        assert_eq!(err.category(), "internal");
    }
}
