//! Evolab CLI: process control for the strategy evolution engine.
//!
//! Commands:
//! - `start`: load or create the population and tick until stopped
//! - `stop`: ask a running engine to shut down via its stop file
//! - `status`: print the summary of the last checkpoint as JSON
//! - `export-report`: write the full evolution report as JSON
//!
//! SIGINT and SIGTERM request the same graceful shutdown as `stop`; a second
//! signal exits immediately.
//!
//! Exit codes: 0 clean, 2 invalid configuration, 3 invariant violation,
//! 1 anything else.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use evolab_core::{CancelToken, SystemClock};
use evolab_runner::query::SUMMARY_HISTORY;
use evolab_runner::{
    read_checkpoint, ConfigError, EngineConfig, EngineError, EvolutionReport, EvolutionScheduler,
    InvariantViolation, StoreError, Summary,
};

#[derive(Parser)]
#[command(
    name = "evolab",
    version,
    about = "Evolab: autonomous trading-strategy evolution engine"
)]
struct Cli {
    /// Path to a TOML config file. Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, short, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize (or resume) the population and evolve until stopped.
    Start {
        /// Override the master seed.
        #[arg(long)]
        seed: Option<u64>,

        /// Stop after this many ticks.
        #[arg(long)]
        max_ticks: Option<u64>,
    },
    /// Ask a running engine to stop by creating its stop file.
    Stop,
    /// Print the summary of the last checkpoint as JSON.
    Status,
    /// Write a report snapshot of the last checkpoint.
    ExportReport {
        /// Output path for the JSON report.
        #[arg(long)]
        out: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        Commands::Start { seed, max_ticks } => run_start(cli.config.as_deref(), seed, max_ticks),
        Commands::Stop => run_stop(cli.config.as_deref()),
        Commands::Status => run_status(cli.config.as_deref()),
        Commands::ExportReport { out } => run_export(cli.config.as_deref(), &out),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Map the error chain onto the documented exit codes.
fn exit_code(error: &anyhow::Error) -> u8 {
    for cause in error.chain() {
        if cause.is::<ConfigError>() {
            return 2;
        }
        if cause.is::<InvariantViolation>() {
            return 3;
        }
        if let Some(engine) = cause.downcast_ref::<EngineError>() {
            match engine {
                EngineError::Config(_) => return 2,
                EngineError::Invariant(_) => return 3,
                _ => {}
            }
        }
        if let Some(StoreError::Invalid(_)) = cause.downcast_ref::<StoreError>() {
            return 3;
        }
    }
    1
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

fn run_start(config_path: Option<&Path>, seed: Option<u64>, max_ticks: Option<u64>) -> Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(seed) = seed {
        config.runtime.master_seed = seed;
    }
    if max_ticks.is_some() {
        config.runtime.max_ticks = max_ticks;
    }

    let mut scheduler = EvolutionScheduler::from_config(config, Arc::new(SystemClock))
        .context("starting engine")?;
    spawn_signal_listener(scheduler.cancel_token())?;
    info!(
        stop_file = %scheduler.config().runtime.stop_file.display(),
        "engine started; press Ctrl+C or run `evolab stop` to shut down"
    );
    let summary = scheduler.run().context("engine stopped with an error")?;

    println!();
    println!("=== Evolution Stopped ===");
    println!("Reason:         {:?}", summary.stop_reason);
    println!("Ticks:          {}", summary.ticks);
    println!("Generation:     {}", summary.generation);
    println!("Best Fitness:   {:.4}", summary.best_fitness);
    println!();
    Ok(())
}

/// Cancel the engine on the first shutdown signal so `run` drains in-flight
/// work and writes its final checkpoint.
fn spawn_signal_listener(cancel: CancelToken) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building signal runtime")?;
    std::thread::Builder::new()
        .name("evolab-signals".into())
        .spawn(move || {
            runtime.block_on(async {
                match shutdown_signal().await {
                    Ok(name) => {
                        info!(signal = name, "shutdown signal received");
                        cancel.cancel();
                    }
                    Err(e) => {
                        error!(error = %e, "unable to listen for shutdown signals");
                        return;
                    }
                }
                if shutdown_signal().await.is_ok() {
                    warn!("second shutdown signal; exiting without a final checkpoint");
                    std::process::exit(130);
                }
            })
        })
        .context("spawning signal listener")?;
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map(|()| "SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|()| "ctrl-c")
}

fn run_stop(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let stop_file = &config.runtime.stop_file;
    if let Some(parent) = stop_file.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    std::fs::write(stop_file, b"")
        .with_context(|| format!("writing stop file {}", stop_file.display()))?;
    println!("Stop requested: {}", stop_file.display());
    Ok(())
}

fn run_status(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let path = &config.runtime.checkpoint_path;
    let state = read_checkpoint(path, None)
        .with_context(|| format!("reading checkpoint {}", path.display()))?;
    let summary = Summary::from_state(&state, None, SUMMARY_HISTORY);
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn run_export(config_path: Option<&Path>, out: &Path) -> Result<()> {
    let mut config = load_config(config_path)?;
    let schema = config.validate()?;
    let path = &config.runtime.checkpoint_path;
    let state = read_checkpoint(path, Some(&schema))
        .with_context(|| format!("reading checkpoint {}", path.display()))?;
    let report = EvolutionReport::build(&state, None, &config.evolution, &schema, chrono::Utc::now());
    report
        .write(out)
        .with_context(|| format!("writing report {}", out.display()))?;
    println!(
        "Report written to: {} ({} strategies, {} history records)",
        out.display(),
        report.top_strategies.len(),
        report.history.len()
    );
    Ok(())
}
