//! TOML-based configuration system for framesync.
//!
//! Relative paths in the file (tree roots, storage, backups, data dir) are
//! resolved against the config file's own directory at load time via
//! [`AppConfig::resolve_paths`], so a config checked into a project root
//! works no matter where the daemon is launched from.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::ConfigurationError;
use crate::models::Side;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Tree roots, mode, and timing knobs.
    pub sync: SyncConfig,

    /// IR snapshot storage settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Backup policy for files overwritten during conflict resolution.
    #[serde(default)]
    pub backup: BackupConfig,

    /// Reference converter settings used by the binaries.
    #[serde(default)]
    pub converters: ConvertersConfig,

    /// Daemon settings.
    #[serde(default)]
    pub daemon: DaemonConfig,
}

// ---------------------------------------------------------------------------
// Sync behaviour
// ---------------------------------------------------------------------------

/// Which side(s) are authoritative (editable) versus generated.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Only side A is watched; side B is generated output.
    A,
    /// Only side B is watched; side A is generated output.
    B,
    /// Both sides are watched and writable; conflict detection active.
    #[default]
    Bidirectional,
}

impl SyncMode {
    /// Parse a mode string.
    pub fn from_str_val(s: &str) -> Result<Self, ConfigurationError> {
        match s {
            "a" => Ok(Self::A),
            "b" => Ok(Self::B),
            "bidirectional" => Ok(Self::Bidirectional),
            other => Err(ConfigurationError::InvalidMode(other.to_string())),
        }
    }

    /// Whether changes on `side` are watched and converted in this mode.
    pub fn watches(&self, side: Side) -> bool {
        match self {
            Self::A => side == Side::A,
            Self::B => side == Side::B,
            Self::Bidirectional => true,
        }
    }

    /// Conflict detection only applies when both sides are editable.
    pub fn detects_conflicts(&self) -> bool {
        matches!(self, Self::Bidirectional)
    }
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::A => write!(f, "a"),
            Self::B => write!(f, "b"),
            Self::Bidirectional => write!(f, "bidirectional"),
        }
    }
}

/// Tree roots, mode, and timing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Root directory of side A's source tree.
    pub dir_a: PathBuf,

    /// Root directory of side B's source tree.
    pub dir_b: PathBuf,

    /// Sync mode.
    #[serde(default)]
    pub mode: SyncMode,

    /// Milliseconds of quiet time before a burst of changes to one path
    /// collapses into a single event (default 300).
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Glob patterns (relative to the tree root) to watch. Empty = all.
    #[serde(default)]
    pub include_patterns: Vec<String>,

    /// Glob patterns to ignore.
    #[serde(default)]
    pub exclude_patterns: Vec<String>,

    /// Maximum events per conversion batch (default 10).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Milliseconds of queue inactivity before a partial batch flushes
    /// (default 500).
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,

    /// Window within which edits on both sides of a pair count as
    /// concurrent, and therefore conflicting (default 5000).
    #[serde(default = "default_conflict_window_ms")]
    pub conflict_window_ms: u64,

    /// Maximum conversions in flight across distinct paths (default 4).
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Per-converter-call timeout in milliseconds (default 30000).
    #[serde(default = "default_convert_timeout_ms")]
    pub convert_timeout_ms: u64,

    /// How long a self-written path stays suppressed in the watcher
    /// (default 2000).
    #[serde(default = "default_suppression_ttl_ms")]
    pub suppression_ttl_ms: u64,
}

fn default_debounce_ms() -> u64 {
    300
}
fn default_batch_size() -> usize {
    10
}
fn default_batch_delay_ms() -> u64 {
    500
}
fn default_conflict_window_ms() -> u64 {
    5000
}
fn default_max_concurrent() -> usize {
    4
}
fn default_convert_timeout_ms() -> u64 {
    30_000
}
fn default_suppression_ttl_ms() -> u64 {
    2000
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// IR snapshot storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding one `<encoded-key>.json` snapshot file per
    /// source file (default `.framesync/ir`).
    #[serde(default = "default_storage_dir")]
    pub dir: PathBuf,
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from(".framesync/ir")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: default_storage_dir(),
        }
    }
}

// ---------------------------------------------------------------------------
// Backups
// ---------------------------------------------------------------------------

/// Naming/layout policy for backup files.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackupStrategy {
    /// `<name>.<utc-timestamp>.bak`, unbounded until pruned.
    #[default]
    Timestamped,
    /// `<name>.<n>.bak` with an incrementing counter.
    Numbered,
    /// One `<name>.bak` slot, overwritten on every backup.
    Single,
    /// File copied into a fresh timestamped subdirectory.
    Directory,
}

impl std::fmt::Display for BackupStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timestamped => write!(f, "timestamped"),
            Self::Numbered => write!(f, "numbered"),
            Self::Single => write!(f, "single"),
            Self::Directory => write!(f, "directory"),
        }
    }
}

/// Backup policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Whether backups are taken before destructive overwrites
    /// (default true).
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Naming/layout strategy.
    #[serde(default)]
    pub strategy: BackupStrategy,

    /// How many backups to retain per original file (default 5).
    #[serde(default = "default_max_backups")]
    pub max_backups: usize,

    /// Directory for backup files (default `.framesync/backups`).
    #[serde(default = "default_backup_dir")]
    pub dir: PathBuf,
}

fn default_true() -> bool {
    true
}
fn default_max_backups() -> usize {
    5
}
fn default_backup_dir() -> PathBuf {
    PathBuf::from(".framesync/backups")
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: BackupStrategy::default(),
            max_backups: default_max_backups(),
            dir: default_backup_dir(),
        }
    }
}

// ---------------------------------------------------------------------------
// Converters
// ---------------------------------------------------------------------------

/// Settings for the document converters and mirror pairing used by the
/// daemon and CLI. Embedders supplying their own converters ignore this.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvertersConfig {
    /// Framework name declared in side A's document envelopes.
    #[serde(default = "default_framework_a")]
    pub framework_a: String,

    /// Framework name declared in side B's document envelopes.
    #[serde(default = "default_framework_b")]
    pub framework_b: String,

    /// File extension of side A sources (no leading dot).
    #[serde(default = "default_ext")]
    pub ext_a: String,

    /// File extension of side B sources (no leading dot).
    #[serde(default = "default_ext")]
    pub ext_b: String,
}

fn default_framework_a() -> String {
    "framework-a".into()
}
fn default_framework_b() -> String {
    "framework-b".into()
}
fn default_ext() -> String {
    "json".into()
}

impl Default for ConvertersConfig {
    fn default() -> Self {
        Self {
            framework_a: default_framework_a(),
            framework_b: default_framework_b(),
            ext_a: default_ext(),
            ext_b: default_ext(),
        }
    }
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

/// Daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory for persistent data (database).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_data_dir() -> PathBuf {
    PathBuf::from(".framesync")
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data_dir: default_data_dir(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Load an [`AppConfig`] from a TOML file at the given path.
    ///
    /// This does **not** resolve relative paths -- call
    /// [`resolve_paths`](Self::resolve_paths) afterwards.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigurationError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&contents)
            .map_err(|e| ConfigurationError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Resolve all relative paths against `base` (normally the directory
    /// containing the config file).
    pub fn resolve_paths(&mut self, base: &Path) {
        for dir in [
            &mut self.sync.dir_a,
            &mut self.sync.dir_b,
            &mut self.storage.dir,
            &mut self.backup.dir,
            &mut self.daemon.data_dir,
        ] {
            if dir.is_relative() {
                *dir = base.join(&*dir);
            }
        }
        debug!(base = %base.display(), "resolved relative config paths");
    }

    /// Validate that all required fields are present and sane.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.sync.dir_a.as_os_str().is_empty() {
            return Err(ConfigurationError::InvalidValue {
                field: "sync.dir_a".into(),
                detail: "side A directory must not be empty".into(),
            });
        }
        if self.sync.dir_b.as_os_str().is_empty() {
            return Err(ConfigurationError::InvalidValue {
                field: "sync.dir_b".into(),
                detail: "side B directory must not be empty".into(),
            });
        }
        if !self.sync.dir_a.is_dir() {
            return Err(ConfigurationError::InvalidValue {
                field: "sync.dir_a".into(),
                detail: format!("'{}' is not a directory", self.sync.dir_a.display()),
            });
        }
        if !self.sync.dir_b.is_dir() {
            return Err(ConfigurationError::InvalidValue {
                field: "sync.dir_b".into(),
                detail: format!("'{}' is not a directory", self.sync.dir_b.display()),
            });
        }
        if same_tree(&self.sync.dir_a, &self.sync.dir_b) {
            return Err(ConfigurationError::InvalidValue {
                field: "sync.dir_b".into(),
                detail: "side A and side B directories must be distinct and non-nested".into(),
            });
        }
        if self.sync.batch_size == 0 {
            return Err(ConfigurationError::InvalidValue {
                field: "sync.batch_size".into(),
                detail: "batch size must be > 0".into(),
            });
        }
        if self.sync.conflict_window_ms == 0 {
            return Err(ConfigurationError::InvalidValue {
                field: "sync.conflict_window_ms".into(),
                detail: "conflict window must be > 0".into(),
            });
        }
        if self.sync.max_concurrent == 0 {
            return Err(ConfigurationError::InvalidValue {
                field: "sync.max_concurrent".into(),
                detail: "max concurrent conversions must be > 0".into(),
            });
        }
        if self.sync.convert_timeout_ms == 0 {
            return Err(ConfigurationError::InvalidValue {
                field: "sync.convert_timeout_ms".into(),
                detail: "convert timeout must be > 0".into(),
            });
        }
        if self.backup.enabled && self.backup.max_backups == 0 {
            return Err(ConfigurationError::InvalidValue {
                field: "backup.max_backups".into(),
                detail: "must retain at least one backup when backups are enabled".into(),
            });
        }

        Ok(())
    }

    /// Convenience: load, resolve paths against the config file's
    /// directory, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        let mut config = Self::load_from_file(path)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.resolve_paths(base);
        config.validate()?;
        Ok(config)
    }

    /// The root directory for a side's tree.
    pub fn dir_for(&self, side: Side) -> &Path {
        match side {
            Side::A => &self.sync.dir_a,
            Side::B => &self.sync.dir_b,
        }
    }

    /// Path of the SQLite database inside the data directory.
    pub fn database_path(&self) -> PathBuf {
        self.daemon.data_dir.join("framesync.db")
    }
}

/// True when the two roots resolve to the same directory or one contains
/// the other. Watching nested roots would deliver every event twice.
fn same_tree(a: &Path, b: &Path) -> bool {
    let a = a.canonicalize().unwrap_or_else(|_| a.to_path_buf());
    let b = b.canonicalize().unwrap_or_else(|_| b.to_path_buf());
    a.starts_with(&b) || b.starts_with(&a)
}
