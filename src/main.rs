use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use traceflow::agent::Agent;
use traceflow::config::Config;
use traceflow::dyntrace::ports::{EventKind, EventPublisher, TraceSubsystem};
use traceflow::error::CollectError;

/// Flow-controlled application trace capture agent.
#[derive(Parser)]
#[command(name = "traceflow", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

/// Trace subsystem stub wired when no device recorder is available.
///
/// Every call fails with a subsystem error, so capture requests complete the
/// Start -> Stop unwind path instead of wedging the state machine.
struct UnavailableTraceSubsystem;

impl TraceSubsystem for UnavailableTraceSubsystem {
    fn open_recording(&self, args: &str) -> Result<(), CollectError> {
        tracing::warn!(args, "no trace recorder available on this device");
        Err(CollectError::TraceSubsystem)
    }

    fn trace_on(&self) -> Result<(), CollectError> {
        Err(CollectError::TraceSubsystem)
    }

    fn trace_off(&self) -> Result<Vec<PathBuf>, CollectError> {
        Err(CollectError::TraceSubsystem)
    }

    fn close(&self) -> Result<(), CollectError> {
        Err(CollectError::TraceSubsystem)
    }
}

/// Publisher stub that logs instead of delivering.
struct LogPublisher;

impl EventPublisher for LogPublisher {
    fn push(&self, uid: i32, event_name: &str, kind: EventKind, payload: serde_json::Value) {
        tracing::info!(uid, event_name, kind = kind.as_str(), %payload, "app event");
    }

    fn report(&self, event_name: &str, kind: EventKind, payload: serde_json::Value) {
        tracing::info!(event_name, kind = kind.as_str(), %payload, "diagnostic event");
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("traceflow {}", version::full());
        return Ok(());
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    let cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting traceflow",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: Config) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    let mut agent = Agent::new(
        &cfg,
        Arc::new(UnavailableTraceSubsystem),
        Arc::new(LogPublisher),
    )?;
    agent.start().await?;

    let _ = shutdown_rx.await;

    agent.stop().await?;

    tracing::info!("traceflow stopped");

    Ok(())
}
