//! File backups taken before destructive overwrites.
//!
//! Every file the engine is about to overwrite or delete during conflict
//! resolution gets copied aside first, according to the configured
//! [`BackupStrategy`]. Records are durable in the database; retention is
//! append-only until pruned oldest-first down to `max_backups`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{BackupConfig, BackupStrategy};
use crate::db::Database;
use crate::errors::ConflictResolutionError;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A single backup copy on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: i64,
    pub original_file: PathBuf,
    pub backup_file: PathBuf,
    pub timestamp: DateTime<Utc>,
    pub size: u64,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Creates, restores, and prunes backup copies.
pub struct BackupManager {
    config: BackupConfig,
    db: Arc<Database>,
}

impl BackupManager {
    /// Create a manager; the backup directory is created eagerly when
    /// backups are enabled.
    pub fn new(config: BackupConfig, db: Arc<Database>) -> Result<Self, ConflictResolutionError> {
        if config.enabled {
            std::fs::create_dir_all(&config.dir).map_err(|e| {
                ConflictResolutionError::BackupFailed {
                    path: config.dir.display().to_string(),
                    detail: e.to_string(),
                }
            })?;
        }
        Ok(Self { config, db })
    }

    /// Copy `file` aside and record it.
    ///
    /// Returns `Ok(None)` when backups are disabled or the file does not
    /// exist (a deletion with no counterpart leaves nothing to back up).
    /// After a successful copy the retention bound is enforced, pruning
    /// oldest records beyond `max_backups`.
    pub async fn create_backup(
        &self,
        file: &Path,
    ) -> Result<Option<BackupRecord>, ConflictResolutionError> {
        if !self.config.enabled {
            warn!(file = %file.display(), "backups disabled, skipping backup");
            return Ok(None);
        }
        let metadata = match tokio::fs::metadata(file).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(file = %file.display(), "nothing to back up, file missing");
                return Ok(None);
            }
            Err(e) => {
                return Err(ConflictResolutionError::BackupFailed {
                    path: file.display().to_string(),
                    detail: e.to_string(),
                })
            }
        };

        let backup_path = self.backup_path_for(file).await?;
        if let Some(parent) = backup_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                ConflictResolutionError::BackupFailed {
                    path: parent.display().to_string(),
                    detail: e.to_string(),
                }
            })?;
        }
        tokio::fs::copy(file, &backup_path).await.map_err(|e| {
            ConflictResolutionError::BackupFailed {
                path: file.display().to_string(),
                detail: e.to_string(),
            }
        })?;

        let record = self.db.insert_backup(file, &backup_path, metadata.len())?;
        info!(
            file = %file.display(),
            backup = %backup_path.display(),
            strategy = %self.config.strategy,
            "backup created"
        );

        // Retention bound: a single slot keeps exactly one record.
        let keep = match self.config.strategy {
            BackupStrategy::Single => 1,
            _ => self.config.max_backups,
        };
        self.cleanup_backups(file, keep).await?;

        Ok(Some(record))
    }

    /// Copy a backup back over its original file.
    pub async fn restore(&self, record: &BackupRecord) -> Result<(), ConflictResolutionError> {
        if let Some(parent) = record.original_file.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                ConflictResolutionError::BackupFailed {
                    path: parent.display().to_string(),
                    detail: e.to_string(),
                }
            })?;
        }
        tokio::fs::copy(&record.backup_file, &record.original_file)
            .await
            .map_err(|e| ConflictResolutionError::BackupFailed {
                path: record.backup_file.display().to_string(),
                detail: e.to_string(),
            })?;
        info!(
            file = %record.original_file.display(),
            backup = %record.backup_file.display(),
            "backup restored"
        );
        Ok(())
    }

    /// Remove all but the `keep` most recent backups of `file`, oldest
    /// first. Returns how many were removed.
    pub async fn cleanup_backups(
        &self,
        file: &Path,
        keep: usize,
    ) -> Result<usize, ConflictResolutionError> {
        let records = self.db.list_backups_for(file)?;
        if records.len() <= keep {
            return Ok(0);
        }

        // Newest-first list: everything past `keep` goes, starting from
        // the oldest. A single-slot strategy reuses one backup path across
        // records, so never delete a file a kept record still points at.
        let kept_files: HashSet<&PathBuf> = records
            .iter()
            .take(keep)
            .map(|r| &r.backup_file)
            .collect();

        let mut removed = 0;
        for record in records.iter().skip(keep).rev() {
            if !kept_files.contains(&record.backup_file) {
                match tokio::fs::remove_file(&record.backup_file).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(ConflictResolutionError::BackupFailed {
                            path: record.backup_file.display().to_string(),
                            detail: e.to_string(),
                        })
                    }
                }
            }
            self.db.delete_backup_record(record.id)?;
            removed += 1;
        }

        debug!(file = %file.display(), removed, keep, "pruned old backups");
        Ok(removed)
    }

    /// All recorded backups of `file`, newest first.
    pub fn list_backups(&self, file: &Path) -> Result<Vec<BackupRecord>, ConflictResolutionError> {
        Ok(self.db.list_backups_for(file)?)
    }

    /// Build the destination path for a new backup of `file` under the
    /// configured strategy, probing for a free name so rapid successive
    /// backups never overwrite each other.
    async fn backup_path_for(&self, file: &Path) -> Result<PathBuf, ConflictResolutionError> {
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_string());

        let candidate = match self.config.strategy {
            BackupStrategy::Timestamped => {
                let stamp = Utc::now().format("%Y%m%dT%H%M%S%3fZ");
                self.config.dir.join(format!("{name}.{stamp}.bak"))
            }
            BackupStrategy::Numbered => {
                let n = self.db.list_backups_for(file)?.len() + 1;
                self.config.dir.join(format!("{name}.{n}.bak"))
            }
            BackupStrategy::Single => {
                return Ok(self.config.dir.join(format!("{name}.bak")));
            }
            BackupStrategy::Directory => {
                let stamp = Utc::now().format("%Y%m%dT%H%M%S%3fZ");
                self.config.dir.join(stamp.to_string()).join(&name)
            }
        };

        // Probe for collisions (same millisecond, or a numbered slot that
        // survived pruning).
        let mut unique = candidate;
        let mut suffix = 1;
        while tokio::fs::try_exists(&unique).await.unwrap_or(false) {
            let stem = unique.with_extension("");
            unique = PathBuf::from(format!("{}-{suffix}.bak", stem.display()));
            suffix += 1;
        }
        Ok(unique)
    }
}
