//! framesync command-line management tool.
//!
//! Provides subcommands for inspecting session status, managing conflicts,
//! viewing the sync activity log, pruning backups, and generating /
//! validating configuration files.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use framesync_core::backup::BackupManager;
use framesync_core::config::AppConfig;
use framesync_core::conflict::{ConflictDetector, ResolutionOption};
use framesync_core::convert::{ConverterSet, DocumentConverter, MirrorPairing};
use framesync_core::db::Database;
use framesync_core::models::StatsSnapshot;
use framesync_core::session::SyncSession;
use framesync_core::store::IrStore;

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// framesync command-line management tool.
#[derive(Parser, Debug)]
#[command(
    name = "framesync",
    version,
    about = "Manage and inspect a framesync synchronization session"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, global = true, default_value = "./framesync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show current session status and counters.
    Status,

    /// Manage sync conflicts.
    Conflicts {
        #[command(subcommand)]
        action: ConflictsAction,
    },

    /// Show recent sync activity.
    History {
        /// Maximum number of entries to show.
        #[arg(short, long, default_value = "20")]
        limit: u32,
    },

    /// Inspect and prune conflict backups.
    Backups {
        #[command(subcommand)]
        action: BackupsAction,
    },

    /// Generate a default configuration file.
    Init {
        /// Output path for the generated config file.
        #[arg(short, long, default_value = "./framesync.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file.
    Validate,
}

#[derive(Subcommand, Debug)]
enum ConflictsAction {
    /// List recorded conflicts.
    List {
        /// Filter by status: unresolved, awaiting_merge, resolved.
        #[arg(short, long)]
        status: Option<String>,

        /// Number of results.
        #[arg(long, default_value = "20")]
        limit: u32,
    },
    /// Show details of a specific conflict.
    Show {
        /// Conflict ID.
        id: String,
    },
    /// Apply a resolution to an open conflict.
    Resolve {
        /// Conflict ID.
        id: String,

        /// Decision: a, b, skip, or merge.
        #[arg(long)]
        accept: String,
    },
    /// Complete a conflict that was parked for manual merge.
    ConfirmMerge {
        /// Conflict ID.
        id: String,
    },
}

#[derive(Subcommand, Debug)]
enum BackupsAction {
    /// List recorded backups, newest first.
    List {
        /// Only show backups of this original file.
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Number of results.
        #[arg(long, default_value = "20")]
        limit: u32,
    },
    /// Prune old backups of one file, keeping the newest N.
    Cleanup {
        /// Original file whose backups to prune.
        file: PathBuf,

        /// How many backups to keep.
        #[arg(long)]
        keep: usize,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    // Minimal logging for CLI
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("warn"))
        .with_target(false)
        .without_time()
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Init { output } => cmd_init(&output),
        Commands::Validate => cmd_validate(&cli.config),
        _ => {
            // All other commands need the resolved config and database
            let config = AppConfig::load_and_resolve(&cli.config)
                .context("failed to load configuration file")?;
            let db = open_database(&config)?;

            match cli.command {
                Commands::Status => cmd_status(&db),
                Commands::Conflicts { action } => cmd_conflicts(config, db, action).await,
                Commands::History { limit } => cmd_history(&db, limit),
                Commands::Backups { action } => cmd_backups(config, db, action).await,
                _ => unreachable!(),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Construction helpers
// ---------------------------------------------------------------------------

fn open_database(config: &AppConfig) -> Result<Database> {
    let db = Database::new(config.database_path()).context("failed to open database")?;
    db.initialize().context("failed to initialize database")?;
    Ok(db)
}

/// Build an unstarted session around the configured converters. Resolution
/// commands go through it so regeneration, backups, and write suppression
/// behave exactly as they do under the daemon.
fn build_session(config: AppConfig, db: Database) -> Result<SyncSession> {
    let converters = ConverterSet::new(
        Arc::new(DocumentConverter::new(&config.converters.framework_a)),
        Arc::new(DocumentConverter::new(&config.converters.framework_b)),
    );
    let pairing = Arc::new(MirrorPairing::from_config(&config.converters));
    SyncSession::new(config, converters, pairing, db).context("failed to construct sync session")
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

fn cmd_init(output: &PathBuf) -> Result<()> {
    let default_config = r#"# framesync configuration
# Relative paths are resolved against this file's directory.

[sync]
dir_a = "app-a/src"
dir_b = "app-b/src"
mode = "bidirectional"        # a | b | bidirectional
debounce_ms = 300
include_patterns = []
exclude_patterns = ["**/*.tmp", "**/node_modules/**"]
batch_size = 10
batch_delay_ms = 500
conflict_window_ms = 5000
max_concurrent = 4
convert_timeout_ms = 30000
suppression_ttl_ms = 2000

[storage]
dir = ".framesync/ir"

[backup]
enabled = true
strategy = "timestamped"      # timestamped | numbered | single | directory
max_backups = 5
dir = ".framesync/backups"

[converters]
framework_a = "framework-a"
framework_b = "framework-b"
ext_a = "json"
ext_b = "json"

[daemon]
log_level = "info"
data_dir = ".framesync"
"#;

    if output.exists() {
        anyhow::bail!(
            "file already exists: {}. Use a different path or remove the existing file.",
            output.display()
        );
    }

    std::fs::write(output, default_config).context("failed to write config file")?;

    println!("Default configuration written to {}", output.display());
    println!();
    println!("Next steps:");
    println!("  1. Edit the config file with your tree roots and framework names");
    println!(
        "  2. Validate with: framesync validate --config {}",
        output.display()
    );
    println!(
        "  3. Start the daemon: framesync-daemon --config {}",
        output.display()
    );

    Ok(())
}

fn cmd_validate(config_path: &PathBuf) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());
    println!();

    let mut config =
        AppConfig::load_from_file(config_path).context("failed to parse configuration")?;

    // Check structure
    println!("  [OK] TOML structure is valid");

    // Resolve relative paths the way the daemon would
    let base = config_path.parent().unwrap_or_else(|| Path::new("."));
    config.resolve_paths(base);
    println!("  [OK] Relative paths resolved against the config directory");

    // Validate values
    match config.validate() {
        Ok(()) => {
            println!("  [OK] All required fields are valid");
        }
        Err(e) => {
            println!("  [FAIL] Validation error: {}", e);
            anyhow::bail!("configuration validation failed");
        }
    }

    // Summary
    println!();
    println!("Configuration summary:");
    println!("  Mode            : {}", config.sync.mode);
    println!("  Side A          : {}", config.sync.dir_a.display());
    println!("  Side B          : {}", config.sync.dir_b.display());
    println!("  Framework A     : {}", config.converters.framework_a);
    println!("  Framework B     : {}", config.converters.framework_b);
    println!("  Debounce        : {}ms", config.sync.debounce_ms);
    println!("  Batch size      : {}", config.sync.batch_size);
    println!("  Conflict window : {}ms", config.sync.conflict_window_ms);
    println!(
        "  Backups         : {}",
        if config.backup.enabled {
            format!(
                "{} (keep {})",
                config.backup.strategy, config.backup.max_backups
            )
        } else {
            "disabled".to_string()
        }
    );
    println!("  IR store        : {}", config.storage.dir.display());
    println!("  Data directory  : {}", config.daemon.data_dir.display());
    println!();
    println!("Configuration is valid.");

    Ok(())
}

fn cmd_status(db: &Database) -> Result<()> {
    let status = db
        .get_state("session_status")
        .context("failed to read session status")?
        .unwrap_or_else(|| "idle".to_string());

    let last_activity = db
        .get_state("last_activity_at")
        .context("failed to read last activity time")?;

    let total_ops = db
        .count_sync_log()
        .context("failed to count sync operations")?;
    let failures = db
        .count_sync_failures()
        .context("failed to count sync failures")?;
    let unresolved = db
        .count_unresolved_conflicts()
        .context("failed to count unresolved conflicts")?;
    let total_conflicts = db
        .count_all_conflicts()
        .context("failed to count total conflicts")?;

    println!("framesync Status");
    println!("================");
    println!();
    println!("  Session status       : {}", status);
    println!(
        "  Last activity at     : {}",
        last_activity.as_deref().unwrap_or("never")
    );
    println!("  Sync log entries     : {}", total_ops);
    println!("  Failed operations    : {}", failures);
    println!("  Unresolved conflicts : {}", unresolved);
    println!("  Total conflicts      : {}", total_conflicts);

    // Counters saved by the last daemon shutdown, when present.
    if let Some(json) = db
        .get_state("final_stats")
        .context("failed to read final stats")?
    {
        if let Ok(stats) = serde_json::from_str::<StatsSnapshot>(&json) {
            println!();
            println!("Last run:");
            println!("  Events converted     : {}", stats.succeeded);
            println!("  Failures             : {}", stats.failed);
            println!("  Conflicts detected   : {}", stats.conflicts_detected);
            println!("  Conflicts resolved   : {}", stats.conflicts_resolved);
            println!(
                "  Average latency      : {:.1} ms",
                stats.average_latency_ms
            );
        }
    }

    Ok(())
}

async fn cmd_conflicts(config: AppConfig, db: Database, action: ConflictsAction) -> Result<()> {
    match action {
        ConflictsAction::List { status, limit } => {
            let conflicts = db
                .list_conflicts(status.as_deref(), limit)
                .context("failed to list conflicts")?;

            if conflicts.is_empty() {
                println!("No conflicts found.");
                return Ok(());
            }

            println!("{:<38} {:<15} {:<42} DETECTED AT", "ID", "STATUS", "FILE A");
            println!("{}", "-".repeat(116));

            for c in &conflicts {
                println!(
                    "{:<38} {:<15} {:<42} {}",
                    c.id,
                    c.status.to_string(),
                    truncate(&c.file_a.display().to_string(), 40),
                    c.detected_at.format("%Y-%m-%d %H:%M:%S"),
                );
            }

            println!();
            println!("{} conflict(s) shown", conflicts.len());

            Ok(())
        }

        ConflictsAction::Show { id } => {
            let db = Arc::new(db);
            let conflict = db
                .get_conflict(&id)
                .context("database error")?
                .ok_or_else(|| anyhow::anyhow!("conflict '{}' not found", id))?;

            let gap_ms = (conflict.timestamp_b - conflict.timestamp_a)
                .num_milliseconds()
                .abs();

            println!("Conflict: {}", conflict.id);
            println!("==========={}", "=".repeat(conflict.id.len()));
            println!();
            println!("  File A       : {}", conflict.file_a.display());
            println!("  File B       : {}", conflict.file_b.display());
            println!("  Edited A at  : {}", conflict.timestamp_a.to_rfc3339());
            println!("  Edited B at  : {}", conflict.timestamp_b.to_rfc3339());
            println!("  Edit gap     : {} ms", gap_ms);
            println!("  IR version   : {}", conflict.ir_version_at_detection);
            println!("  Detected at  : {}", conflict.detected_at.to_rfc3339());
            println!("  Status       : {}", conflict.status);

            if let Some(ref resolution) = conflict.resolution {
                println!("  Resolution   : {}", resolution);
                println!(
                    "  Resolved at  : {}",
                    conflict
                        .resolved_at
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "-".to_string())
                );
            }

            let store = IrStore::new(&config.storage.dir)
                .context("failed to open IR snapshot store")?;
            let detector = ConflictDetector::new(&config.sync, db.clone());
            let higher_ir = detector
                .compare_ir_versions(&conflict, &store)
                .await
                .map(|s| format!("side {}", s))
                .unwrap_or_else(|| "versions tied".to_string());

            println!();
            println!("Tie-break hints:");
            println!(
                "  Newer file   : side {}",
                detector.compare_file_timestamps(&conflict)
            );
            println!("  Higher IR    : {}", higher_ir);

            let mut backups = db
                .list_backups_for(&conflict.file_a)
                .context("failed to list backups")?;
            backups.extend(
                db.list_backups_for(&conflict.file_b)
                    .context("failed to list backups")?,
            );

            if !backups.is_empty() {
                println!();
                println!("Backups of the conflicted files:");
                for b in &backups {
                    println!(
                        "  {}  ({} bytes, {})",
                        b.backup_file.display(),
                        b.size,
                        b.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    );
                }
            }

            Ok(())
        }

        ConflictsAction::Resolve { id, accept } => {
            let option = ResolutionOption::from_str_val(&accept).ok_or_else(|| {
                anyhow::anyhow!(
                    "invalid resolution '{}': use 'a', 'b', 'skip', or 'merge'",
                    accept
                )
            })?;

            let session = build_session(config, db)?;
            let outcome = session
                .resolve_conflict(&id, option)
                .await
                .context("failed to resolve conflict")?;

            match option {
                ResolutionOption::ManualMerge => {
                    println!("Conflict {} parked for manual merge.", id);
                    if !outcome.backups.is_empty() {
                        println!();
                        println!("Backups taken:");
                        for b in &outcome.backups {
                            println!("  {}", b.backup_file.display());
                        }
                    }
                    println!();
                    println!("Edit both files to the merged result, then run:");
                    println!("  framesync conflicts confirm-merge {}", id);
                }
                _ => {
                    println!("Conflict {} resolved ({}).", id, option);
                    for path in &outcome.files_regenerated {
                        println!("  regenerated {}", path.display());
                    }
                    for b in &outcome.backups {
                        println!("  backed up   {}", b.backup_file.display());
                    }
                }
            }

            Ok(())
        }

        ConflictsAction::ConfirmMerge { id } => {
            let session = build_session(config, db)?;
            session
                .confirm_merge(&id)
                .await
                .context("failed to confirm merge")?;

            println!("Conflict {} resolved (manual merge confirmed).", id);
            println!("Both files were re-imported into the IR store.");

            Ok(())
        }
    }
}

fn cmd_history(db: &Database, limit: u32) -> Result<()> {
    let entries = db
        .recent_sync_log(limit)
        .context("failed to list sync history")?;

    if entries.is_empty() {
        println!("No sync activity recorded.");
        return Ok(());
    }

    println!(
        "{:<20} {:<5} {:<16} {:<8} {:>6} PATH",
        "TIMESTAMP", "SIDE", "ACTION", "OUTCOME", "MS"
    );
    println!("{}", "-".repeat(108));

    for entry in &entries {
        let ts = entry.created_at.get(..19).unwrap_or(&entry.created_at);
        let ms = entry
            .duration_ms
            .map(|d| d.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<20} {:<5} {:<16} {:<8} {:>6} {}",
            ts,
            entry.side,
            entry.action,
            entry.outcome,
            ms,
            truncate(&entry.path, 48),
        );
        if let Some(ref error) = entry.error {
            println!("    error: {}", truncate(error, 90));
        }
    }

    println!();
    println!("{} entries shown", entries.len());

    Ok(())
}

async fn cmd_backups(config: AppConfig, db: Database, action: BackupsAction) -> Result<()> {
    match action {
        BackupsAction::List { file, limit } => {
            let backups = match file {
                Some(ref path) => db
                    .list_backups_for(path)
                    .context("failed to list backups")?,
                None => db.list_backups(limit).context("failed to list backups")?,
            };

            if backups.is_empty() {
                println!("No backups recorded.");
                return Ok(());
            }

            println!(
                "{:<6} {:<44} {:>9} {:<20} BACKUP FILE",
                "ID", "ORIGINAL", "BYTES", "CREATED AT"
            );
            println!("{}", "-".repeat(120));

            for b in &backups {
                println!(
                    "{:<6} {:<44} {:>9} {:<20} {}",
                    b.id,
                    truncate(&b.original_file.display().to_string(), 42),
                    b.size,
                    b.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
                    b.backup_file.display(),
                );
            }

            println!();
            println!("{} backup(s) shown", backups.len());

            Ok(())
        }

        BackupsAction::Cleanup { file, keep } => {
            let db = Arc::new(db);
            let manager = BackupManager::new(config.backup.clone(), db.clone())
                .context("failed to open backup area")?;

            let removed = manager
                .cleanup_backups(&file, keep)
                .await
                .context("failed to clean up backups")?;
            let remaining = db
                .list_backups_for(&file)
                .context("failed to list backups")?
                .len();

            println!(
                "Removed {} old backup(s) of {}; {} remain",
                removed,
                file.display(),
                remaining
            );

            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Utilities
// ---------------------------------------------------------------------------

fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        format!("{}...", &s[..max_len.saturating_sub(3)])
    }
}
