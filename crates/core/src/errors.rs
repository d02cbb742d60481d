//! Error types for the framesync core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Conversion(#[from] ConversionError),

    #[error(transparent)]
    Resolution(#[from] ConflictResolutionError),

    #[error(transparent)]
    FileSystem(#[from] FileSystemError),

    #[error(transparent)]
    Config(#[from] ConfigurationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Notify(#[from] NotifyError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// Conversion errors
// ---------------------------------------------------------------------------

/// Errors from converter invocations.
///
/// These are caught per file at the queue boundary and reported as status
/// events; they never abort the batch they occurred in.
#[derive(Debug, Error)]
pub enum ConversionError {
    /// The converter for the file's side returned an error.
    #[error("converter failed for '{path}': {detail}")]
    Failed {
        path: String,
        detail: String,
    },

    /// The converter did not finish within the configured timeout.
    #[error("conversion timed out after {timeout_ms}ms for '{path}'")]
    Timeout {
        path: String,
        timeout_ms: u64,
    },

    /// The source file is not in the format the converter expects.
    #[error("invalid document envelope in '{path}': {detail}")]
    InvalidEnvelope {
        path: String,
        detail: String,
    },

    /// Generic I/O wrapper.
    #[error("conversion I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Conflict resolution errors
// ---------------------------------------------------------------------------

/// Errors from applying a resolution decision to a conflict.
#[derive(Debug, Error)]
pub enum ConflictResolutionError {
    /// The requested conflict ID was not found.
    #[error("conflict not found: {0}")]
    NotFound(String),

    /// Attempted to resolve a conflict that is already resolved.
    #[error("conflict {0} is already resolved")]
    AlreadyResolved(String),

    /// Attempted to park a conflict for manual merge twice.
    #[error("conflict {0} is already awaiting manual merge")]
    AlreadyAwaitingMerge(String),

    /// `confirm_merge` was called on a conflict not parked for merge.
    #[error("conflict {0} is not awaiting manual merge")]
    NotAwaitingMerge(String),

    /// Regeneration after a decision failed; the conflict stays
    /// unresolved and its backups are preserved.
    #[error("regeneration failed for conflict {id} at '{path}': {detail}")]
    RegenerationFailed {
        id: String,
        path: String,
        detail: String,
    },

    /// A required backup could not be created; resolution is aborted
    /// before anything is overwritten.
    #[error("backup failed for '{path}': {detail}")]
    BackupFailed {
        path: String,
        detail: String,
    },

    /// Underlying conversion error during regeneration.
    #[error("resolution conversion error: {0}")]
    ConversionError(#[from] ConversionError),

    /// Snapshot store error while re-establishing IR state.
    #[error("resolution store error: {0}")]
    StoreError(#[from] StoreError),

    /// Database error when persisting resolution state.
    #[error("resolution database error: {0}")]
    DatabaseError(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// Filesystem errors
// ---------------------------------------------------------------------------

/// Errors from direct filesystem operations (reads, writes, deletes,
/// directory creation) outside the IR store.
#[derive(Debug, Error)]
pub enum FileSystemError {
    /// The path does not exist.
    #[error("path not found: '{0}'")]
    NotFound(String),

    /// The process lacks permission for the operation.
    #[error("permission denied for '{0}'")]
    PermissionDenied(String),

    /// An I/O failure with path context.
    #[error("I/O error at '{path}': {detail}")]
    Io {
        path: String,
        detail: String,
    },

    /// Generic I/O wrapper.
    #[error("filesystem I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl FileSystemError {
    /// Wraps an `io::Error` with the path it occurred on, mapping the common
    /// kinds to their dedicated variants.
    pub fn from_io(path: &std::path::Path, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => {
                FileSystemError::NotFound(path.display().to_string())
            }
            std::io::ErrorKind::PermissionDenied => {
                FileSystemError::PermissionDenied(path.display().to_string())
            }
            _ => FileSystemError::Io {
                path: path.display().to_string(),
                detail: err.to_string(),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
///
/// These are the only errors that propagate synchronously from
/// `SyncSession::start`; they fail fast before any watcher is installed.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue {
        field: String,
        detail: String,
    },

    /// The sync mode string is not recognized.
    #[error("invalid sync mode '{0}': use 'a', 'b', or 'bidirectional'")]
    InvalidMode(String),

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// IR store errors
// ---------------------------------------------------------------------------

/// Errors from the versioned IR snapshot store.
///
/// An optimistic-concurrency mismatch is not an error: `IrStore::put`
/// reports it as a [`crate::store::PutOutcome::VersionConflict`] value.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No snapshot exists for the requested key.
    #[error("snapshot not found for '{0}'")]
    SnapshotNotFound(String),

    /// A snapshot file exists but could not be deserialized.
    #[error("corrupt snapshot file '{path}': {detail}")]
    CorruptSnapshot {
        path: String,
        detail: String,
    },

    /// A compare-and-set write lost to a concurrent writer even after
    /// re-reading the current version.
    #[error("snapshot version for '{path}' kept moving during write")]
    VersionRace {
        path: String,
    },

    /// JSON serialization failure.
    #[error("snapshot serialization error: {0}")]
    SerializeError(#[from] serde_json::Error),

    /// Generic I/O wrapper.
    #[error("store I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Watcher errors
// ---------------------------------------------------------------------------

/// Errors from the filesystem change watcher.
#[derive(Debug, Error)]
pub enum WatchError {
    /// The directory to watch does not exist.
    #[error("watch root does not exist: '{0}'")]
    RootNotFound(String),

    /// The OS watch handle could not be installed.
    #[error("failed to install watcher on '{path}': {detail}")]
    InstallFailed {
        path: String,
        detail: String,
    },

    /// The watcher was started twice.
    #[error("watcher already started")]
    AlreadyStarted,

    /// Underlying notify backend error.
    #[error("watch backend error: {0}")]
    Backend(#[from] notify::Error),
}

// ---------------------------------------------------------------------------
// Session errors
// ---------------------------------------------------------------------------

/// Errors from the sync session lifecycle.
#[derive(Debug, Error)]
pub enum SessionError {
    /// `start` was called on a session that is already running.
    #[error("sync session already running")]
    AlreadyRunning,

    /// Configuration problem discovered at startup.
    #[error("session configuration error: {0}")]
    ConfigError(#[from] ConfigurationError),

    /// Watcher installation failed during startup.
    #[error("session watch error: {0}")]
    WatchError(#[from] WatchError),

    /// Database error during session state handling.
    #[error("session database error: {0}")]
    DatabaseError(#[from] DatabaseError),

    /// Store error during session startup.
    #[error("session store error: {0}")]
    StoreError(#[from] StoreError),

    /// The backup area could not be prepared at construction time.
    #[error("session backup error: {0}")]
    BackupError(#[from] ConflictResolutionError),
}

// ---------------------------------------------------------------------------
// Notification errors
// ---------------------------------------------------------------------------

/// Errors from the conflict notifier.
#[derive(Debug, Error)]
pub enum NotifyError {
    /// A single channel failed to deliver.
    #[error("channel '{channel}' delivery failed: {detail}")]
    ChannelFailed {
        channel: String,
        detail: String,
    },

    /// Every registered channel failed to deliver.
    #[error("all notification channels failed: {0}")]
    AllChannelsFailed(String),
}

// ---------------------------------------------------------------------------
// Database errors
// ---------------------------------------------------------------------------

/// Errors from the SQLite persistence layer.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Underlying rusqlite error.
    #[error("database error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    /// A migration failed.
    #[error("database migration failed (version {version}): {detail}")]
    MigrationFailed {
        version: u32,
        detail: String,
    },

    /// A record was not found.
    #[error("{entity} not found: {id}")]
    NotFound {
        entity: String,
        id: String,
    },

    /// Generic I/O error (e.g. file permissions).
    #[error("database I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
