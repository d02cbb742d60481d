//! Conflict resolution actions.
//!
//! The [`ConflictResolver`] applies a decision to an open conflict: prefer
//! one side (regenerating the other through IR), park it for a manual
//! merge, or skip it. Every file about to be overwritten or deleted is
//! backed up first, and a failed regeneration leaves the conflict open
//! with its backups intact.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::backup::{BackupManager, BackupRecord};
use crate::config::SyncConfig;
use crate::convert::ConverterSet;
use crate::db::Database;
use crate::errors::ConflictResolutionError;
use crate::ir::IrDocument;
use crate::models::Side;
use crate::store::{IrStore, PutOutcome};
use crate::watcher::WriteSuppressor;

use super::detector::{Conflict, ConflictStatus};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Named resolution decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionOption {
    /// Side A wins; side B is regenerated from A's IR.
    PreferA,
    /// Side B wins; side A is regenerated from B's IR.
    PreferB,
    /// Touch nothing; park the conflict until a merge is confirmed.
    ManualMerge,
    /// Mark resolved without touching any file.
    Skip,
}

impl ResolutionOption {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreferA => "prefer_a",
            Self::PreferB => "prefer_b",
            Self::ManualMerge => "manual_merge",
            Self::Skip => "skip",
        }
    }

    /// Parse a decision, accepting the short forms used on the command
    /// line (`a`, `b`, `merge`, `skip`).
    pub fn from_str_val(s: &str) -> Option<Self> {
        match s {
            "a" | "prefer_a" => Some(Self::PreferA),
            "b" | "prefer_b" => Some(Self::PreferB),
            "merge" | "manual_merge" => Some(Self::ManualMerge),
            "skip" => Some(Self::Skip),
            _ => None,
        }
    }
}

impl std::fmt::Display for ResolutionOption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a resolution actually did.
#[derive(Debug, Clone, Serialize)]
pub struct ResolutionOutcome {
    pub conflict_id: String,
    pub option: ResolutionOption,
    /// Files rewritten (or deleted) by the decision.
    pub files_regenerated: Vec<PathBuf>,
    /// Backups taken before anything was touched.
    pub backups: Vec<BackupRecord>,
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

pub struct ConflictResolver {
    db: Arc<Database>,
    store: Arc<IrStore>,
    converters: ConverterSet,
    backups: Arc<BackupManager>,
    suppressor: Arc<WriteSuppressor>,
    dir_a: PathBuf,
    dir_b: PathBuf,
}

impl ConflictResolver {
    pub fn new(
        config: &SyncConfig,
        db: Arc<Database>,
        store: Arc<IrStore>,
        converters: ConverterSet,
        backups: Arc<BackupManager>,
        suppressor: Arc<WriteSuppressor>,
    ) -> Self {
        Self {
            db,
            store,
            converters,
            backups,
            suppressor,
            dir_a: config.dir_a.clone(),
            dir_b: config.dir_b.clone(),
        }
    }

    /// Apply a decision to an open conflict.
    pub async fn resolve(
        &self,
        conflict_id: &str,
        option: ResolutionOption,
    ) -> Result<ResolutionOutcome, ConflictResolutionError> {
        let conflict = self
            .db
            .get_conflict(conflict_id)?
            .ok_or_else(|| ConflictResolutionError::NotFound(conflict_id.to_string()))?;
        match conflict.status {
            ConflictStatus::Resolved => {
                return Err(ConflictResolutionError::AlreadyResolved(
                    conflict_id.to_string(),
                ))
            }
            ConflictStatus::AwaitingMerge => {
                return Err(ConflictResolutionError::AlreadyAwaitingMerge(
                    conflict_id.to_string(),
                ))
            }
            ConflictStatus::Unresolved => {}
        }

        info!(conflict_id, option = %option, "resolving conflict");
        let started = std::time::Instant::now();
        let result = match option {
            ResolutionOption::PreferA => self.apply_preference(&conflict, Side::A).await,
            ResolutionOption::PreferB => self.apply_preference(&conflict, Side::B).await,
            ResolutionOption::ManualMerge => self.park_for_merge(&conflict).await,
            ResolutionOption::Skip => self.skip(&conflict),
        };
        self.log_resolution(
            &conflict,
            &format!("resolve_{option}"),
            &result,
            started.elapsed().as_millis() as i64,
        );

        result.map(|(files_regenerated, backups)| ResolutionOutcome {
            conflict_id: conflict_id.to_string(),
            option,
            files_regenerated,
            backups,
        })
    }

    /// Confirm that a parked conflict was merged by hand: both files are
    /// re-imported through IR and the conflict is closed.
    pub async fn confirm_merge(
        &self,
        conflict_id: &str,
    ) -> Result<ResolutionOutcome, ConflictResolutionError> {
        let conflict = self
            .db
            .get_conflict(conflict_id)?
            .ok_or_else(|| ConflictResolutionError::NotFound(conflict_id.to_string()))?;
        if conflict.status != ConflictStatus::AwaitingMerge {
            return Err(ConflictResolutionError::NotAwaitingMerge(
                conflict_id.to_string(),
            ));
        }

        info!(conflict_id, "confirming manual merge");
        let started = std::time::Instant::now();
        let result = self.reimport_both(&conflict).await;
        self.log_resolution(
            &conflict,
            "confirm_merge",
            &result,
            started.elapsed().as_millis() as i64,
        );

        result.map(|(files_regenerated, backups)| ResolutionOutcome {
            conflict_id: conflict_id.to_string(),
            option: ResolutionOption::ManualMerge,
            files_regenerated,
            backups,
        })
    }

    // -----------------------------------------------------------------------
    // Decisions
    // -----------------------------------------------------------------------

    /// One side wins: back up the loser, then regenerate it from the
    /// winner's IR. A missing winner file means the winning change was a
    /// deletion, which propagates instead.
    async fn apply_preference(
        &self,
        conflict: &Conflict,
        winner: Side,
    ) -> Result<(Vec<PathBuf>, Vec<BackupRecord>), ConflictResolutionError> {
        let loser = winner.opposite();
        let winner_path = conflict.file_for(winner);
        let loser_path = conflict.file_for(loser).to_path_buf();
        let winner_rel = self.rel(winner, winner_path, &conflict.id)?;
        let loser_rel = self.rel(loser, &loser_path, &conflict.id)?;
        let resolution = match winner {
            Side::A => ResolutionOption::PreferA,
            Side::B => ResolutionOption::PreferB,
        };

        let mut backups = Vec::new();

        if !winner_path.exists() {
            // The winning change was a deletion; propagate it.
            if let Some(record) = self.backups.create_backup(&loser_path).await? {
                backups.push(record);
            }
            self.suppressor.record(&loser_path);
            match tokio::fs::remove_file(&loser_path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(ConflictResolutionError::RegenerationFailed {
                        id: conflict.id.clone(),
                        path: loser_path.display().to_string(),
                        detail: e.to_string(),
                    })
                }
            }
            self.store.remove(winner, &winner_rel).await?;
            self.store.remove(loser, &loser_rel).await?;
            self.db
                .mark_conflict_resolved(&conflict.id, resolution.as_str())?;
            debug!(id = %conflict.id, path = %loser_path.display(), "deletion propagated by resolution");
            return Ok((vec![loser_path], backups));
        }

        // Convert the winner first; a parse failure leaves everything
        // untouched and the conflict open.
        let ir = self
            .converters
            .for_side(winner)
            .convert_to_ir(winner_path)
            .await?;

        if let Some(record) = self.backups.create_backup(&loser_path).await? {
            backups.push(record);
        }
        self.suppressor.record(&loser_path);
        self.converters
            .for_side(loser)
            .generate_from_ir(&ir, &loser_path)
            .await?;

        self.put_latest(winner, &winner_rel, ir.clone(), winner, &conflict.id)
            .await?;
        self.put_latest(loser, &loser_rel, ir, winner, &conflict.id)
            .await?;
        self.db
            .mark_conflict_resolved(&conflict.id, resolution.as_str())?;

        Ok((vec![loser_path], backups))
    }

    /// Back up both sides, touch neither, and park the conflict until the
    /// caller confirms the merge.
    async fn park_for_merge(
        &self,
        conflict: &Conflict,
    ) -> Result<(Vec<PathBuf>, Vec<BackupRecord>), ConflictResolutionError> {
        let mut backups = Vec::new();
        for path in [&conflict.file_a, &conflict.file_b] {
            if let Some(record) = self.backups.create_backup(path).await? {
                backups.push(record);
            }
        }
        self.db.mark_conflict_awaiting_merge(&conflict.id)?;
        debug!(id = %conflict.id, "conflict parked for manual merge");
        Ok((Vec::new(), backups))
    }

    fn skip(
        &self,
        conflict: &Conflict,
    ) -> Result<(Vec<PathBuf>, Vec<BackupRecord>), ConflictResolutionError> {
        self.db.mark_conflict_resolved(&conflict.id, "skip")?;
        debug!(id = %conflict.id, "conflict skipped");
        Ok((Vec::new(), Vec::new()))
    }

    async fn reimport_both(
        &self,
        conflict: &Conflict,
    ) -> Result<(Vec<PathBuf>, Vec<BackupRecord>), ConflictResolutionError> {
        let rel_a = self.rel(Side::A, &conflict.file_a, &conflict.id)?;
        let rel_b = self.rel(Side::B, &conflict.file_b, &conflict.id)?;

        // Either import failing leaves the conflict parked.
        let ir_a = self
            .converters
            .for_side(Side::A)
            .convert_to_ir(&conflict.file_a)
            .await?;
        let ir_b = self
            .converters
            .for_side(Side::B)
            .convert_to_ir(&conflict.file_b)
            .await?;

        self.put_latest(Side::A, &rel_a, ir_a, Side::A, &conflict.id)
            .await?;
        self.put_latest(Side::B, &rel_b, ir_b, Side::B, &conflict.id)
            .await?;
        self.db
            .mark_conflict_resolved(&conflict.id, "manual_merge")?;

        Ok((Vec::new(), Vec::new()))
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn dir_for(&self, side: Side) -> &Path {
        match side {
            Side::A => &self.dir_a,
            Side::B => &self.dir_b,
        }
    }

    /// Overwrite the current snapshot for (side, path), whatever version it
    /// holds. The queue never writes snapshots for a conflicted pair, so a
    /// version conflict here means a concurrent resolution raced this one.
    async fn put_latest(
        &self,
        side: Side,
        rel: &Path,
        ir: IrDocument,
        origin: Side,
        conflict_id: &str,
    ) -> Result<(), ConflictResolutionError> {
        let expected = self
            .store
            .version_info(side, rel)
            .await?
            .map(|info| info.version);
        match self.store.put(side, rel, ir, origin, expected).await? {
            PutOutcome::Written { .. } => Ok(()),
            PutOutcome::VersionConflict { current } => {
                Err(ConflictResolutionError::RegenerationFailed {
                    id: conflict_id.to_string(),
                    path: rel.display().to_string(),
                    detail: format!("snapshot moved to version {current} during resolution"),
                })
            }
        }
    }

    fn rel(
        &self,
        side: Side,
        path: &Path,
        conflict_id: &str,
    ) -> Result<PathBuf, ConflictResolutionError> {
        path.strip_prefix(self.dir_for(side))
            .map(Path::to_path_buf)
            .map_err(|_| ConflictResolutionError::RegenerationFailed {
                id: conflict_id.to_string(),
                path: path.display().to_string(),
                detail: format!("file is outside the side-{side} tree root"),
            })
    }

    fn log_resolution(
        &self,
        conflict: &Conflict,
        action: &str,
        result: &Result<(Vec<PathBuf>, Vec<BackupRecord>), ConflictResolutionError>,
        duration_ms: i64,
    ) {
        let path = conflict
            .file_a
            .strip_prefix(&self.dir_a)
            .unwrap_or(&conflict.file_a)
            .display()
            .to_string();
        let (outcome, error) = match result {
            Ok(_) => ("success", None),
            Err(e) => ("failure", Some(e.to_string())),
        };
        let _ = self.db.insert_sync_log(
            &path,
            "a",
            action,
            outcome,
            error.as_deref(),
            Some(duration_ms),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackupConfig, BackupStrategy};
    use crate::convert::{DocumentConverter, SourceConverter};
    use crate::ir::{IrDocument, IrNode};
    use chrono::Utc;
    use std::time::Duration;

    struct Env {
        _dir: tempfile::TempDir,
        db: Arc<Database>,
        store: Arc<IrStore>,
        converters: ConverterSet,
        suppressor: Arc<WriteSuppressor>,
        resolver: ConflictResolver,
        dir_a: PathBuf,
        dir_b: PathBuf,
    }

    fn doc(text: &str) -> IrDocument {
        IrDocument::new(IrNode::new("text").with_prop("value", serde_json::json!(text)))
    }

    fn setup() -> Env {
        let dir = tempfile::tempdir().unwrap();
        let dir_a = dir.path().join("a");
        let dir_b = dir.path().join("b");
        std::fs::create_dir_all(&dir_a).unwrap();
        std::fs::create_dir_all(&dir_b).unwrap();

        let config: SyncConfig = toml::from_str(&format!(
            "dir_a = '{}'\ndir_b = '{}'",
            dir_a.display(),
            dir_b.display()
        ))
        .unwrap();

        let db = Arc::new(Database::in_memory().unwrap());
        db.initialize().unwrap();
        let store = Arc::new(IrStore::new(dir.path().join("ir")).unwrap());
        let converters = ConverterSet::new(
            Arc::new(DocumentConverter::new("framework-a")),
            Arc::new(DocumentConverter::new("framework-b")),
        );
        let backups = Arc::new(
            BackupManager::new(
                BackupConfig {
                    enabled: true,
                    strategy: BackupStrategy::Timestamped,
                    max_backups: 5,
                    dir: dir.path().join("backups"),
                },
                db.clone(),
            )
            .unwrap(),
        );
        let suppressor = Arc::new(WriteSuppressor::new(Duration::from_millis(2000)));
        let resolver = ConflictResolver::new(
            &config,
            db.clone(),
            store.clone(),
            converters.clone(),
            backups,
            suppressor.clone(),
        );

        Env {
            _dir: dir,
            db,
            store,
            converters,
            suppressor,
            resolver,
            dir_a,
            dir_b,
        }
    }

    /// Write differing content on both sides and insert an open conflict.
    async fn seed(env: &Env, rel: &str, text_a: &str, text_b: &str) -> Conflict {
        let file_a = env.dir_a.join(rel);
        let file_b = env.dir_b.join(rel);
        env.converters
            .a
            .generate_from_ir(&doc(text_a), &file_a)
            .await
            .unwrap();
        env.converters
            .b
            .generate_from_ir(&doc(text_b), &file_b)
            .await
            .unwrap();
        let conflict = Conflict::new(file_a, file_b, Utc::now(), Utc::now(), 0);
        env.db.insert_conflict(&conflict).unwrap();
        conflict
    }

    #[tokio::test]
    async fn test_prefer_a_backs_up_and_regenerates_b() {
        let env = setup();
        let conflict = seed(&env, "views/home.json", "edit from a", "edit from b").await;

        let outcome = env
            .resolver
            .resolve(&conflict.id, ResolutionOption::PreferA)
            .await
            .unwrap();

        assert_eq!(outcome.files_regenerated, vec![conflict.file_b.clone()]);
        assert_eq!(outcome.backups.len(), 1);

        // The backup preserves B's losing content.
        let saved = tokio::fs::read_to_string(&outcome.backups[0].backup_file)
            .await
            .unwrap();
        assert!(saved.contains("edit from b"));

        // B now carries A's content.
        let regenerated = env
            .converters
            .b
            .convert_to_ir(&conflict.file_b)
            .await
            .unwrap();
        assert_eq!(regenerated, doc("edit from a"));

        // Snapshots exist for both sides, with the winner as origin.
        let rel = Path::new("views/home.json");
        let snapshot = env.store.get(Side::B, rel).await.unwrap();
        assert_eq!(snapshot.origin_side, Side::A);
        assert_eq!(snapshot.version, 1);

        let stored = env.db.get_conflict(&conflict.id).unwrap().unwrap();
        assert_eq!(stored.status, ConflictStatus::Resolved);
        assert_eq!(stored.resolution.as_deref(), Some("prefer_a"));

        // The regeneration wrote B, so its watcher event is suppressed.
        assert!(env.suppressor.is_suppressed(&conflict.file_b));
    }

    #[tokio::test]
    async fn test_skip_resolves_without_touching_files() {
        let env = setup();
        let conflict = seed(&env, "views/home.json", "a text", "b text").await;
        let before = tokio::fs::read_to_string(&conflict.file_b).await.unwrap();

        let outcome = env
            .resolver
            .resolve(&conflict.id, ResolutionOption::Skip)
            .await
            .unwrap();
        assert!(outcome.files_regenerated.is_empty());
        assert!(outcome.backups.is_empty());

        let after = tokio::fs::read_to_string(&conflict.file_b).await.unwrap();
        assert_eq!(before, after);
        assert!(env.db.list_backups_for(&conflict.file_b).unwrap().is_empty());

        let stored = env.db.get_conflict(&conflict.id).unwrap().unwrap();
        assert_eq!(stored.status, ConflictStatus::Resolved);
        assert_eq!(stored.resolution.as_deref(), Some("skip"));
    }

    #[tokio::test]
    async fn test_manual_merge_parks_then_confirm_resolves() {
        let env = setup();
        let conflict = seed(&env, "views/home.json", "a text", "b text").await;

        let parked = env
            .resolver
            .resolve(&conflict.id, ResolutionOption::ManualMerge)
            .await
            .unwrap();
        assert_eq!(parked.backups.len(), 2);
        assert!(parked.files_regenerated.is_empty());
        let stored = env.db.get_conflict(&conflict.id).unwrap().unwrap();
        assert_eq!(stored.status, ConflictStatus::AwaitingMerge);

        // A parked conflict rejects further decisions.
        let again = env
            .resolver
            .resolve(&conflict.id, ResolutionOption::PreferA)
            .await;
        assert!(matches!(
            again,
            Err(ConflictResolutionError::AlreadyAwaitingMerge(_))
        ));

        // The human merges both files by hand.
        env.converters
            .a
            .generate_from_ir(&doc("merged"), &conflict.file_a)
            .await
            .unwrap();
        env.converters
            .b
            .generate_from_ir(&doc("merged"), &conflict.file_b)
            .await
            .unwrap();

        env.resolver.confirm_merge(&conflict.id).await.unwrap();
        let stored = env.db.get_conflict(&conflict.id).unwrap().unwrap();
        assert_eq!(stored.status, ConflictStatus::Resolved);
        assert_eq!(stored.resolution.as_deref(), Some("manual_merge"));

        // Both sides were re-imported.
        let rel = Path::new("views/home.json");
        assert_eq!(
            env.store.get(Side::A, rel).await.unwrap().content,
            doc("merged")
        );
        assert_eq!(
            env.store.get(Side::B, rel).await.unwrap().content,
            doc("merged")
        );

        let once_more = env.resolver.confirm_merge(&conflict.id).await;
        assert!(matches!(
            once_more,
            Err(ConflictResolutionError::NotAwaitingMerge(_))
        ));
    }

    #[tokio::test]
    async fn test_confirm_merge_requires_parked_conflict() {
        let env = setup();
        let conflict = seed(&env, "views/home.json", "a", "b").await;
        let result = env.resolver.confirm_merge(&conflict.id).await;
        assert!(matches!(
            result,
            Err(ConflictResolutionError::NotAwaitingMerge(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_regeneration_leaves_conflict_open() {
        let env = setup();
        let conflict = seed(&env, "views/home.json", "a text", "b text").await;

        // Corrupt the winning side so conversion fails.
        tokio::fs::write(&conflict.file_a, "{ not json")
            .await
            .unwrap();

        let result = env
            .resolver
            .resolve(&conflict.id, ResolutionOption::PreferA)
            .await;
        assert!(matches!(
            result,
            Err(ConflictResolutionError::ConversionError(_))
        ));

        let stored = env.db.get_conflict(&conflict.id).unwrap().unwrap();
        assert_eq!(stored.status, ConflictStatus::Unresolved);

        // The losing side was never touched.
        let untouched = env
            .converters
            .b
            .convert_to_ir(&conflict.file_b)
            .await
            .unwrap();
        assert_eq!(untouched, doc("b text"));
    }

    #[tokio::test]
    async fn test_deleted_winner_propagates_deletion() {
        let env = setup();
        let conflict = seed(&env, "views/home.json", "a text", "b text").await;
        tokio::fs::remove_file(&conflict.file_a).await.unwrap();

        let outcome = env
            .resolver
            .resolve(&conflict.id, ResolutionOption::PreferA)
            .await
            .unwrap();

        assert!(!conflict.file_b.exists());
        assert_eq!(outcome.backups.len(), 1);
        let saved = tokio::fs::read_to_string(&outcome.backups[0].backup_file)
            .await
            .unwrap();
        assert!(saved.contains("b text"));

        let stored = env.db.get_conflict(&conflict.id).unwrap().unwrap();
        assert_eq!(stored.status, ConflictStatus::Resolved);
    }

    #[tokio::test]
    async fn test_resolve_validations() {
        let env = setup();
        let missing = env
            .resolver
            .resolve("no-such-id", ResolutionOption::Skip)
            .await;
        assert!(matches!(missing, Err(ConflictResolutionError::NotFound(_))));

        let conflict = seed(&env, "views/home.json", "a", "b").await;
        env.resolver
            .resolve(&conflict.id, ResolutionOption::Skip)
            .await
            .unwrap();
        let twice = env
            .resolver
            .resolve(&conflict.id, ResolutionOption::Skip)
            .await;
        assert!(matches!(
            twice,
            Err(ConflictResolutionError::AlreadyResolved(_))
        ));
    }

    #[test]
    fn test_option_parsing() {
        assert_eq!(
            ResolutionOption::from_str_val("a"),
            Some(ResolutionOption::PreferA)
        );
        assert_eq!(
            ResolutionOption::from_str_val("prefer_b"),
            Some(ResolutionOption::PreferB)
        );
        assert_eq!(
            ResolutionOption::from_str_val("merge"),
            Some(ResolutionOption::ManualMerge)
        );
        assert_eq!(
            ResolutionOption::from_str_val("skip"),
            Some(ResolutionOption::Skip)
        );
        assert_eq!(ResolutionOption::from_str_val("both"), None);
    }
}
