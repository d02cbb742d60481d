//! Domain model types used throughout framesync.
//!
//! These types bridge the watcher, conversion queue, conflict subsystem,
//! and database layer.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Side
// ---------------------------------------------------------------------------

/// Which of the two source trees a file belongs to.
///
/// A file's side is fixed by the tree it lives in and never changes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    A,
    B,
}

impl Side {
    /// The other tree.
    pub fn opposite(&self) -> Side {
        match self {
            Side::A => Side::B,
            Side::B => Side::A,
        }
    }

    /// Parse a side string.
    pub fn from_str_val(s: &str) -> Option<Self> {
        match s {
            "a" => Some(Side::A),
            "b" => Some(Side::B),
            _ => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::A => write!(f, "a"),
            Side::B => write!(f, "b"),
        }
    }
}

// ---------------------------------------------------------------------------
// Change events
// ---------------------------------------------------------------------------

/// What happened to a watched file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Modified => write!(f, "modified"),
            Self::Deleted => write!(f, "deleted"),
        }
    }
}

/// A debounced change to a single watched file.
///
/// Ephemeral: produced by the watcher, consumed exactly once by the
/// conversion queue. `path` is relative to the side's root directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub side: Side,
    pub timestamp: DateTime<Utc>,
    pub kind: ChangeKind,
}

impl ChangeEvent {
    pub fn new(path: impl Into<PathBuf>, side: Side, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            side,
            timestamp: Utc::now(),
            kind,
        }
    }
}

// ---------------------------------------------------------------------------
// Source files
// ---------------------------------------------------------------------------

/// A file in one of the two trees, with its last-modified time as read
/// from the filesystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceFile {
    pub path: PathBuf,
    pub side: Side,
    pub last_modified_at: Option<DateTime<Utc>>,
}

impl SourceFile {
    /// Stat `path` and capture its mtime. A missing file yields
    /// `last_modified_at: None` rather than an error, since conflict
    /// tie-breaking must work even when one side was deleted.
    pub fn stat(path: &Path, side: Side) -> Self {
        let last_modified_at = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .map(DateTime::<Utc>::from);
        Self {
            path: path.to_path_buf(),
            side,
            last_modified_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Sync status
// ---------------------------------------------------------------------------

/// Lifecycle status of a sync session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Constructed but not started, or stopped.
    Idle,
    /// Watching for changes with nothing in flight.
    Watching,
    /// At least one conversion batch is executing.
    Syncing,
    /// One or more conflicts are unresolved.
    Conflict,
}

impl SyncStatus {
    /// Parse a status string.
    pub fn from_str_val(s: &str) -> Self {
        match s {
            "watching" => Self::Watching,
            "syncing" => Self::Syncing,
            "conflict" => Self::Conflict,
            _ => Self::Idle,
        }
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Watching => write!(f, "watching"),
            Self::Syncing => write!(f, "syncing"),
            Self::Conflict => write!(f, "conflict"),
        }
    }
}

// ---------------------------------------------------------------------------
// Status events
// ---------------------------------------------------------------------------

/// A status transition or per-file outcome, broadcast to observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEvent {
    pub status: SyncStatus,
    pub at: DateTime<Utc>,
    /// For error events: the offending path and error category.
    pub detail: Option<String>,
}

impl StatusEvent {
    pub fn new(status: SyncStatus) -> Self {
        Self {
            status,
            at: Utc::now(),
            detail: None,
        }
    }

    pub fn with_detail(status: SyncStatus, detail: impl Into<String>) -> Self {
        Self {
            status,
            at: Utc::now(),
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Running counters for a sync session.
///
/// All fields are atomics so the queue, resolver, and status queries can
/// update and read them without locking.
#[derive(Debug, Default)]
pub struct SyncStats {
    total: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    conflicts_detected: AtomicU64,
    conflicts_resolved: AtomicU64,
    latency_ms_total: AtomicU64,
}

impl SyncStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, latency_ms: u64) {
        self.total.fetch_add(1, Ordering::SeqCst);
        self.succeeded.fetch_add(1, Ordering::SeqCst);
        self.latency_ms_total.fetch_add(latency_ms, Ordering::SeqCst);
    }

    pub fn record_failure(&self) {
        self.total.fetch_add(1, Ordering::SeqCst);
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_conflict_detected(&self) {
        self.conflicts_detected.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_conflict_resolved(&self) {
        self.conflicts_resolved.fetch_add(1, Ordering::SeqCst);
    }

    /// Point-in-time copy of the counters. Average latency covers
    /// successful syncs only.
    pub fn snapshot(&self) -> StatsSnapshot {
        let succeeded = self.succeeded.load(Ordering::SeqCst);
        let latency_total = self.latency_ms_total.load(Ordering::SeqCst);
        StatsSnapshot {
            total_syncs: self.total.load(Ordering::SeqCst),
            succeeded,
            failed: self.failed.load(Ordering::SeqCst),
            conflicts_detected: self.conflicts_detected.load(Ordering::SeqCst),
            conflicts_resolved: self.conflicts_resolved.load(Ordering::SeqCst),
            average_latency_ms: if succeeded == 0 {
                0.0
            } else {
                latency_total as f64 / succeeded as f64
            },
        }
    }
}

/// Serializable view of [`SyncStats`] as returned by status queries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatsSnapshot {
    pub total_syncs: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub conflicts_detected: u64,
    pub conflicts_resolved: u64,
    pub average_latency_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_average_latency() {
        let stats = SyncStats::new();
        assert_eq!(stats.snapshot().average_latency_ms, 0.0);

        stats.record_success(10);
        stats.record_success(30);
        stats.record_failure();

        let snap = stats.snapshot();
        assert_eq!(snap.total_syncs, 3);
        assert_eq!(snap.succeeded, 2);
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.average_latency_ms, 20.0);
    }
}
