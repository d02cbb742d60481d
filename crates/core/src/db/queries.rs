//! Typed query helpers for every table in the framesync database.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::params;
use tracing::debug;

use super::Database;
use crate::backup::BackupRecord;
use crate::conflict::{Conflict, ConflictStatus};
use crate::errors::DatabaseError;

// ---------------------------------------------------------------------------
// Domain structs returned by queries
// ---------------------------------------------------------------------------

/// A row from the `sync_log` table.
#[derive(Debug, Clone)]
pub struct SyncLogRow {
    pub id: i64,
    pub path: String,
    pub side: String,
    pub action: String,
    pub outcome: String,
    pub error: Option<String>,
    pub duration_ms: Option<i64>,
    pub created_at: String,
}

/// Parse an RFC3339 timestamp stored as TEXT, reporting a conversion
/// failure against the originating column on bad data.
fn parse_ts(idx: usize, s: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

fn row_to_conflict(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conflict> {
    let resolved_at: Option<String> = row.get(9)?;
    Ok(Conflict {
        id: row.get(0)?,
        file_a: PathBuf::from(row.get::<_, String>(1)?),
        file_b: PathBuf::from(row.get::<_, String>(2)?),
        timestamp_a: parse_ts(3, row.get(3)?)?,
        timestamp_b: parse_ts(4, row.get(4)?)?,
        ir_version_at_detection: row.get::<_, i64>(5)? as u64,
        detected_at: parse_ts(6, row.get(6)?)?,
        status: ConflictStatus::from_str_val(&row.get::<_, String>(7)?),
        resolution: row.get(8)?,
        resolved_at: resolved_at.map(|s| parse_ts(9, s)).transpose()?,
    })
}

const CONFLICT_COLUMNS: &str = "id, file_a, file_b, timestamp_a, timestamp_b, ir_version,
     detected_at, status, resolution, resolved_at";

// ---------------------------------------------------------------------------
// Query implementations
// ---------------------------------------------------------------------------

impl Database {
    // -- conflicts ----------------------------------------------------------

    /// Insert a freshly detected conflict.
    pub fn insert_conflict(&self, conflict: &Conflict) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO conflicts (id, file_a, file_b, timestamp_a, timestamp_b,
             ir_version, detected_at, status, resolution, resolved_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                conflict.id,
                conflict.file_a.display().to_string(),
                conflict.file_b.display().to_string(),
                conflict.timestamp_a.to_rfc3339(),
                conflict.timestamp_b.to_rfc3339(),
                conflict.ir_version_at_detection as i64,
                conflict.detected_at.to_rfc3339(),
                conflict.status.to_string(),
                conflict.resolution,
                conflict.resolved_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        debug!(id = %conflict.id, file_a = %conflict.file_a.display(), "inserted conflict");
        Ok(())
    }

    /// Get a conflict by ID.
    pub fn get_conflict(&self, id: &str) -> Result<Option<Conflict>, DatabaseError> {
        let conn = self.conn();
        let sql = format!("SELECT {CONFLICT_COLUMNS} FROM conflicts WHERE id = ?1");
        match conn.query_row(&sql, params![id], row_to_conflict) {
            Ok(conflict) => Ok(Some(conflict)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Merge new edit timestamps into an existing open conflict. Resolved
    /// rows are never touched; updating one reports `NotFound` so the
    /// caller raises a fresh conflict instead.
    pub fn update_conflict_timestamps(
        &self,
        id: &str,
        timestamp_a: DateTime<Utc>,
        timestamp_b: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE conflicts SET timestamp_a = ?1, timestamp_b = ?2
             WHERE id = ?3 AND status != 'resolved'",
            params![timestamp_a.to_rfc3339(), timestamp_b.to_rfc3339(), id],
        )?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "conflict".into(),
                id: id.to_string(),
            });
        }
        debug!(id, "updated conflict timestamps");
        Ok(())
    }

    /// Park a conflict awaiting an explicit merge confirmation.
    pub fn mark_conflict_awaiting_merge(&self, id: &str) -> Result<(), DatabaseError> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE conflicts SET status = 'awaiting_merge' WHERE id = ?1",
            params![id],
        )?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "conflict".into(),
                id: id.to_string(),
            });
        }
        debug!(id, "conflict awaiting manual merge");
        Ok(())
    }

    /// Mark a conflict resolved with the decision that resolved it.
    pub fn mark_conflict_resolved(&self, id: &str, resolution: &str) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE conflicts SET status = 'resolved', resolution = ?1, resolved_at = ?2
             WHERE id = ?3",
            params![resolution, now, id],
        )?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "conflict".into(),
                id: id.to_string(),
            });
        }
        debug!(id, resolution, "marked conflict resolved");
        Ok(())
    }

    /// List conflicts filtered by status, newest first.
    pub fn list_conflicts(
        &self,
        status: Option<&str>,
        limit: u32,
    ) -> Result<Vec<Conflict>, DatabaseError> {
        let conn = self.conn();
        let (sql, bound_params): (String, Vec<Box<dyn rusqlite::types::ToSql>>) = match status {
            Some(s) => (
                format!(
                    "SELECT {CONFLICT_COLUMNS} FROM conflicts
                     WHERE status = ?1 ORDER BY detected_at DESC LIMIT ?2"
                ),
                vec![Box::new(s.to_string()), Box::new(limit)],
            ),
            None => (
                format!(
                    "SELECT {CONFLICT_COLUMNS} FROM conflicts
                     ORDER BY detected_at DESC LIMIT ?1"
                ),
                vec![Box::new(limit)],
            ),
        };

        let mut stmt = conn.prepare(&sql)?;
        let param_refs: Vec<&dyn rusqlite::types::ToSql> =
            bound_params.iter().map(|p| p.as_ref()).collect();
        let entries = stmt
            .query_map(param_refs.as_slice(), row_to_conflict)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// All conflicts not yet resolved (including those awaiting merge),
    /// oldest first so session startup replays them in detection order.
    pub fn unresolved_conflicts(&self) -> Result<Vec<Conflict>, DatabaseError> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {CONFLICT_COLUMNS} FROM conflicts
             WHERE status != 'resolved' ORDER BY detected_at ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let entries = stmt
            .query_map([], row_to_conflict)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Count conflicts that are not resolved.
    pub fn count_unresolved_conflicts(&self) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM conflicts WHERE status != 'resolved'",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Count all conflicts ever recorded.
    pub fn count_all_conflicts(&self) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM conflicts", [], |row| row.get(0))?;
        Ok(count)
    }

    // -- backups ------------------------------------------------------------

    /// Record a backup copy that was just written.
    pub fn insert_backup(
        &self,
        original_file: &Path,
        backup_file: &Path,
        size: u64,
    ) -> Result<BackupRecord, DatabaseError> {
        let now = Utc::now();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO backups (original_file, backup_file, size, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                original_file.display().to_string(),
                backup_file.display().to_string(),
                size as i64,
                now.to_rfc3339(),
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id, original = %original_file.display(), "inserted backup record");
        Ok(BackupRecord {
            id,
            original_file: original_file.to_path_buf(),
            backup_file: backup_file.to_path_buf(),
            timestamp: now,
            size,
        })
    }

    /// Backups for one original file, newest first.
    pub fn list_backups_for(&self, original_file: &Path) -> Result<Vec<BackupRecord>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, original_file, backup_file, size, created_at
             FROM backups WHERE original_file = ?1 ORDER BY id DESC",
        )?;
        let entries = stmt
            .query_map(params![original_file.display().to_string()], row_to_backup)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// The most recent backups across all files, newest first.
    pub fn list_backups(&self, limit: u32) -> Result<Vec<BackupRecord>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, original_file, backup_file, size, created_at
             FROM backups ORDER BY id DESC LIMIT ?1",
        )?;
        let entries = stmt
            .query_map(params![limit], row_to_backup)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Delete a single backup record (the file itself is the caller's
    /// responsibility).
    pub fn delete_backup_record(&self, id: i64) -> Result<(), DatabaseError> {
        let conn = self.conn();
        let changed = conn.execute("DELETE FROM backups WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "backup".into(),
                id: id.to_string(),
            });
        }
        debug!(id, "deleted backup record");
        Ok(())
    }

    // -- sync_log -----------------------------------------------------------

    /// Append an entry to the sync activity log.
    pub fn insert_sync_log(
        &self,
        path: &str,
        side: &str,
        action: &str,
        outcome: &str,
        error: Option<&str>,
        duration_ms: Option<i64>,
    ) -> Result<i64, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO sync_log (path, side, action, outcome, error, duration_ms, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![path, side, action, outcome, error, duration_ms, now],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id, path, action, outcome, "inserted sync_log entry");
        Ok(id)
    }

    /// List recent sync-log entries, newest first.
    pub fn recent_sync_log(&self, limit: u32) -> Result<Vec<SyncLogRow>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, path, side, action, outcome, error, duration_ms, created_at
             FROM sync_log ORDER BY id DESC LIMIT ?1",
        )?;
        let entries = stmt
            .query_map(params![limit], |row| {
                Ok(SyncLogRow {
                    id: row.get(0)?,
                    path: row.get(1)?,
                    side: row.get(2)?,
                    action: row.get(3)?,
                    outcome: row.get(4)?,
                    error: row.get(5)?,
                    duration_ms: row.get(6)?,
                    created_at: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Count all sync-log entries.
    pub fn count_sync_log(&self) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM sync_log", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Count sync-log entries that recorded a failure.
    pub fn count_sync_failures(&self) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sync_log WHERE outcome = 'failure'",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // -- session_state ------------------------------------------------------

    /// Set a session-state key (upsert).
    pub fn set_state(&self, key: &str, value: &str) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO session_state (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3",
            params![key, value, now],
        )?;
        Ok(())
    }

    /// Get a session-state value by key.
    pub fn get_state(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT value FROM session_state WHERE key = ?1")?;
        let mut rows = stmt.query_map(params![key], |row| row.get::<_, String>(0))?;
        match rows.next() {
            Some(Ok(val)) => Ok(Some(val)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }
}

fn row_to_backup(row: &rusqlite::Row<'_>) -> rusqlite::Result<BackupRecord> {
    Ok(BackupRecord {
        id: row.get(0)?,
        original_file: PathBuf::from(row.get::<_, String>(1)?),
        backup_file: PathBuf::from(row.get::<_, String>(2)?),
        size: row.get::<_, i64>(3)? as u64,
        timestamp: parse_ts(4, row.get(4)?)?,
    })
}
