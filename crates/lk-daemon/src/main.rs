//! leasekeeper renewal daemon
//!
//! Keeps the stored tokens of every configured profile alive by renewing
//! them through the credential binary before their leases run out.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use lk_core::config::{self, DaemonConfig};
use lk_core::FileTokenStore;
use lk_daemon::{logging, LogNotifier, RenewalEngine, Scheduler};
use lk_exec::{Executor, ExecutorConfig, OutputSink};

#[derive(Parser)]
#[command(name = "leasekeeperd")]
#[command(about = "leasekeeper token renewal daemon")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Check every profile once and exit
    #[arg(long)]
    once: bool,

    /// Log level (error, warn, info, debug, trace); overrides config
    #[arg(long)]
    log_level: Option<String>,

    /// Health endpoint address (overrides config, empty disables)
    #[arg(long)]
    health_address: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (mut config, config_note) = load_config(args.config.as_ref())?;
    if let Some(address) = args.health_address {
        config.health_address = address;
    }

    // Initialize logging
    let log_level = match (&args.log_level, args.foreground) {
        (Some(level), _) => level.clone(),
        (None, true) => "debug".to_string(),
        (None, false) => config.log.level.clone(),
    };
    let _log_guard = logging::init(&config.log, &log_level).context("Failed to initialize logging")?;

    tracing::info!("leasekeeperd {} starting...", env!("CARGO_PKG_VERSION"));
    if let Some(note) = config_note {
        tracing::warn!("{}", note);
    }
    if config.profiles.is_empty() {
        tracing::warn!("No profiles configured - nothing will be renewed");
    }

    let store = Arc::new(FileTokenStore::new(config.data_dir.join("tokens")));

    // Renew output carries the token itself; keep it off the terminal
    let executor = Executor::new(ExecutorConfig {
        stdout: OutputSink::Discard,
        stderr: OutputSink::Inherit,
        ..ExecutorConfig::default()
    });
    let engine = RenewalEngine::new(executor, store, config.policy());
    let mut scheduler =
        Scheduler::new(config, engine, Arc::new(LogNotifier)).context("Invalid configuration")?;

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    // Setup signal handlers
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        cancel_clone.cancel();
    });

    if args.once {
        let summary = scheduler.run_once(&cancel).await;
        for (profile, outcome) in &summary.outcomes {
            println!("{}: {}", profile, outcome);
        }
        for profile in &summary.deferred {
            println!("{}: backing off", profile);
        }
        if summary.failures() > 0 {
            anyhow::bail!("{} profile(s) failed to renew", summary.failures());
        }
        return Ok(());
    }

    scheduler.run(cancel).await?;

    tracing::info!("leasekeeperd shutdown complete");
    Ok(())
}

/// Load the daemon configuration.
///
/// An explicit path must load; a broken default file falls back to defaults
/// with a note to log once logging is up.
fn load_config(path: Option<&PathBuf>) -> Result<(DaemonConfig, Option<String>)> {
    if let Some(config_path) = path {
        let config = config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?;
        return Ok((config, None));
    }

    let default_path = config::default_config_path();
    if !default_path.exists() {
        return Ok((DaemonConfig::default(), None));
    }
    match config::load_config(&default_path) {
        Ok(config) => Ok((config, None)),
        Err(e) => Ok((
            DaemonConfig::default(),
            Some(format!("Failed to load config from {:?}: {}", default_path, e)),
        )),
    }
}
