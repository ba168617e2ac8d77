// ============================================================================
// VITALS CLI
// ============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result as AnyhowResult};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use vitals_engine::{init_logging, EngineConfig, MetricFilter, VitalsEngine, ENGINE_NAME, ENGINE_VERSION};

// ----------------------------------------------------------------------------
// CLI Argument Parser
// ----------------------------------------------------------------------------

/// Vitals engine CLI
#[derive(Parser, Debug)]
#[command(
    name = "vitals",
    version,
    about = "In-process metrics engine with hierarchical contexts and round-robin reservoirs"
)]
struct Cli {
    /// Overrides `logging.level` from the config file
    #[arg(short, long, env = "VITALS_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build the engine and run the cleanup daemon until Ctrl-C
    Run {
        /// Engine config; defaults apply when the file is absent
        #[arg(short, long, default_value = "vitals.toml", env = "VITALS_CONFIG")]
        config: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        /// Engine config to check
        #[arg(short, long, default_value = "vitals.toml", env = "VITALS_CONFIG")]
        config: PathBuf,

        /// Show the full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate the default configuration
    GenerateConfig {
        /// Write here instead of printing
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

// ----------------------------------------------------------------------------
// CLI Handler Functions
// ----------------------------------------------------------------------------

fn handle_validate(config_path: &Path, verbose: bool) -> AnyhowResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    let config = EngineConfig::load(config_path)
        .with_context(|| format!("Invalid configuration in {}", config_path.display()))?;
    println!("Configuration is valid");

    if verbose {
        println!("{}", toml::to_string_pretty(&config)?);
    }

    println!("  node name:      {}", config.engine.node_name);
    println!("  reservoirs:     {}", config.reservoir_specs()?.len());
    println!("  forward rules:  {}", config.forward_rules.len());
    println!("  enablement:     {}", config.enablement.len());
    Ok(())
}

fn handle_generate_config(output: Option<&Path>) -> AnyhowResult<()> {
    match output {
        Some(path) => {
            EngineConfig::write_default_config(path).with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Default configuration written to: {}", path.display());
        }
        None => println!("{}", EngineConfig::generate_default_config()),
    }
    Ok(())
}

async fn handle_run(config_path: &Path, log_level: Option<String>) -> AnyhowResult<()> {
    let config = if config_path.exists() {
        EngineConfig::load(config_path)
            .with_context(|| format!("Failed to load config from {}", config_path.display()))?
    } else {
        EngineConfig::default()
    };

    let mut logging_config = config.logging.clone();
    if let Some(level) = log_level {
        logging_config.level = level;
    }
    init_logging(&logging_config)?;
    if !config_path.exists() {
        warn!(target: "vitals::engine", path = %config_path.display(), "Config file not found, using defaults");
    }

    info!(target: "vitals::engine", "{} v{}", ENGINE_NAME, ENGINE_VERSION);

    let engine = VitalsEngine::with_system_clock(config)?;
    let daemon = engine.spawn_cleanup_daemon();

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    info!(target: "vitals::engine", "Shutdown signal received");

    daemon.shutdown().await;
    info!(
        target: "vitals::engine",
        contexts = engine.tree().node_count(),
        metrics = engine.tree().metrics(MetricFilter::Any).len(),
        "Engine stopped"
    );
    Ok(())
}

// ============================================================================
// MAIN ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config, verbose } => handle_validate(&config, verbose),
        Commands::GenerateConfig { output } => handle_generate_config(output.as_deref()),
        Commands::Run { config } => handle_run(&config, cli.log_level).await,
    }
}
