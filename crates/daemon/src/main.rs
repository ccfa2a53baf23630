//! imagesync daemon entry point.
//!
//! Loads configuration, initializes the registry client and orchestrator,
//! starts the webhook/status server and the pass scheduler, and handles
//! graceful shutdown.

mod scheduler;
mod signals;
mod web;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use imagesync_core::config::AppConfig;
use imagesync_core::orchestrator::Orchestrator;
use imagesync_core::registry::RegistryClient;

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// imagesync update daemon.
#[derive(Parser, Debug)]
#[command(
    name = "imagesync-daemon",
    version,
    about = "Keeps container-image references in git repositories up to date"
)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Override the log level from the config file (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load and resolve configuration
    let mut config =
        AppConfig::load_from_file(&args.config).context("failed to load configuration file")?;
    config
        .resolve_env_vars()
        .context("failed to resolve environment variables in config")?;
    config
        .validate()
        .context("configuration validation failed")?;

    // Initialize tracing
    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.daemon.log_level);

    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .init();

    // Startup banner
    info!("========================================");
    info!("  imagesync daemon v{}", env!("CARGO_PKG_VERSION"));
    info!("========================================");
    info!("Config file   : {}", args.config.display());
    info!("Repositories  : {}", config.repositories.len());
    info!("Policies      : {}", config.policies.len());
    info!("Poll interval : {}s", config.daemon.poll_interval_secs);
    info!("Web listen    : {}", config.web.listen);
    info!("Data dir      : {}", config.daemon.data_dir.display());
    info!("Log level     : {}", log_level);
    info!("========================================");

    // Ensure data directory exists
    std::fs::create_dir_all(&config.daemon.data_dir).context("failed to create data directory")?;

    if config.registry.username.is_none() {
        warn!("no registry credentials configured, using anonymous access");
    }

    // Initialize the registry client and orchestrator
    let registry = Arc::new(RegistryClient::new(&config.registry));
    let webhook_secret = config.web.webhook_secret.clone();
    let listen_addr = config.web.listen.clone();
    let poll_interval = std::time::Duration::from_secs(config.daemon.poll_interval_secs);

    let orchestrator = Arc::new(
        Orchestrator::new(config, registry).context("failed to initialize orchestrator")?,
    );
    info!("orchestrator initialized");

    // Pass trigger channel (webhook -> scheduler) and shared last summary
    let (trigger_tx, trigger_rx) = tokio::sync::mpsc::channel::<()>(16);
    let last_summary = Arc::new(tokio::sync::RwLock::new(None));

    // Start the web server in the background
    let web_state = Arc::new(web::WebState {
        trigger: trigger_tx,
        last_summary: last_summary.clone(),
        webhook_secret,
    });
    let web_handle = tokio::spawn(async move {
        if let Err(e) = web::serve(&listen_addr, web_state).await {
            error!("web server error: {}", e);
        }
    });

    // Create a shutdown notify for cooperative cancellation
    let shutdown = Arc::new(tokio::sync::Notify::new());
    let scheduler_shutdown = shutdown.clone();

    // Create and start the scheduler
    let mut sched =
        scheduler::Scheduler::new(orchestrator, poll_interval, trigger_rx, last_summary);
    let scheduler_handle = tokio::spawn(async move {
        sched.run(scheduler_shutdown).await;
    });

    // Wait for shutdown signal
    signals::wait_for_shutdown().await;

    info!("shutdown signal received, stopping...");

    // Signal cooperative shutdown to the scheduler
    shutdown.notify_waiters();

    // Wait for the scheduler to finish its current pass (up to 30s)
    match tokio::time::timeout(std::time::Duration::from_secs(30), scheduler_handle).await {
        Ok(Ok(())) => info!("scheduler stopped gracefully"),
        Ok(Err(e)) => warn!("scheduler task error: {}", e),
        Err(_) => warn!("scheduler did not stop within 30s, forcing shutdown"),
    }

    // Abort the web server
    web_handle.abort();

    info!("imagesync daemon stopped.");
    Ok(())
}
