//! framesync daemon entry point.
//!
//! Loads configuration, wires converters and the sync session, watches
//! both trees until a termination signal arrives, then drains and exits.

mod signals;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use framesync_core::config::AppConfig;
use framesync_core::convert::{ConverterSet, DocumentConverter, MirrorPairing};
use framesync_core::db::Database;
use framesync_core::session::SyncSession;

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// framesync synchronization daemon.
#[derive(Parser, Debug)]
#[command(
    name = "framesync-daemon",
    version,
    about = "Bidirectional UI source tree synchronization daemon"
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
    let config =
        AppConfig::load_and_resolve(&args.config).context("failed to load configuration file")?;
    config
        .validate()
        .context("configuration validation failed")?;

    // Initialize tracing; RUST_LOG wins over --log-level over the config.
    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.daemon.log_level);
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .init();

    // Startup banner
    info!("========================================");
    info!("  framesync Daemon v{}", env!("CARGO_PKG_VERSION"));
    info!("========================================");
    info!("Config file : {}", args.config.display());
    info!("Mode        : {}", config.sync.mode);
    info!("Side A      : {}", config.sync.dir_a.display());
    info!("Side B      : {}", config.sync.dir_b.display());
    info!("IR store    : {}", config.storage.dir.display());
    info!("Data dir    : {}", config.daemon.data_dir.display());
    info!("Log level   : {}", log_level);
    info!("========================================");

    // Ensure data directory exists
    std::fs::create_dir_all(&config.daemon.data_dir)
        .context("failed to create data directory")?;

    // Initialize database
    let db_path = config.database_path();
    let db = Database::new(&db_path).context("failed to open database")?;
    db.initialize()
        .context("failed to initialize database schema")?;
    info!("Database initialized at {}", db_path.display());

    // Converters and pairing come from the [converters] config section.
    let converters = ConverterSet::new(
        Arc::new(DocumentConverter::new(&config.converters.framework_a)),
        Arc::new(DocumentConverter::new(&config.converters.framework_b)),
    );
    let pairing = Arc::new(MirrorPairing::from_config(&config.converters));

    let mut session = SyncSession::new(config, converters, pairing, db)
        .context("failed to construct sync session")?;
    session
        .start()
        .await
        .context("failed to start sync session")?;
    info!("Sync session started");

    // Wait for shutdown signal
    signals::wait_for_shutdown().await;
    info!("Shutdown signal received, stopping...");

    session.stop().await;

    let stats = session.stats();
    info!(
        total = stats.total_syncs,
        succeeded = stats.succeeded,
        failed = stats.failed,
        conflicts_detected = stats.conflicts_detected,
        conflicts_resolved = stats.conflicts_resolved,
        average_latency_ms = stats.average_latency_ms,
        "final statistics"
    );
    info!("framesync daemon stopped.");
    Ok(())
}
