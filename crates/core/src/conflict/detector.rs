//! Conflict detection logic.
//!
//! A pair is in conflict when both of its files receive a human edit
//! within the configured window. The detector raises and merges conflicts
//! but never resolves anything itself; it only surfaces the tie-break data
//! (edit timestamps, stored IR versions) that resolution decisions use.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::db::Database;
use crate::errors::DatabaseError;
use crate::models::{Side, SourceFile};
use crate::store::IrStore;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Lifecycle status of a conflict.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    /// Detected and waiting for a resolution decision.
    Unresolved,
    /// Parked by a manual-merge decision, waiting for confirmation.
    AwaitingMerge,
    /// Resolved; kept for history.
    Resolved,
}

impl ConflictStatus {
    /// Parse the database representation. The schema CHECK constraint
    /// guarantees one of the three values; anything else reads as open.
    pub fn from_str_val(s: &str) -> Self {
        match s {
            "awaiting_merge" => Self::AwaitingMerge,
            "resolved" => Self::Resolved,
            _ => Self::Unresolved,
        }
    }
}

impl std::fmt::Display for ConflictStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unresolved => write!(f, "unresolved"),
            Self::AwaitingMerge => write!(f, "awaiting_merge"),
            Self::Resolved => write!(f, "resolved"),
        }
    }
}

/// A detected pair of independent edits, durable across restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    /// Unique conflict ID.
    pub id: String,
    /// Absolute path of the side-A file.
    pub file_a: PathBuf,
    /// Absolute path of the side-B file.
    pub file_b: PathBuf,
    /// Latest observed side-A edit time.
    pub timestamp_a: DateTime<Utc>,
    /// Latest observed side-B edit time.
    pub timestamp_b: DateTime<Utc>,
    /// Highest stored IR version across the pair when detected.
    pub ir_version_at_detection: u64,
    /// When the conflict was first raised.
    pub detected_at: DateTime<Utc>,
    /// Current status.
    pub status: ConflictStatus,
    /// The decision that resolved it (if resolved).
    pub resolution: Option<String>,
    /// When it was resolved.
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Conflict {
    /// Create a new unresolved conflict with a fresh UUID.
    pub fn new(
        file_a: PathBuf,
        file_b: PathBuf,
        timestamp_a: DateTime<Utc>,
        timestamp_b: DateTime<Utc>,
        ir_version_at_detection: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            file_a,
            file_b,
            timestamp_a,
            timestamp_b,
            ir_version_at_detection,
            detected_at: Utc::now(),
            status: ConflictStatus::Unresolved,
            resolution: None,
            resolved_at: None,
        }
    }

    pub fn file_for(&self, side: Side) -> &Path {
        match side {
            Side::A => &self.file_a,
            Side::B => &self.file_b,
        }
    }

    pub fn timestamp_for(&self, side: Side) -> DateTime<Utc> {
        match side {
            Side::A => self.timestamp_a,
            Side::B => self.timestamp_b,
        }
    }
}

/// What a single observed change means for its pair.
#[derive(Debug, Clone)]
pub enum Observation {
    /// No recent opposite-side edit; normal propagation may proceed.
    Clear,
    /// First detection for this pair.
    New(Conflict),
    /// The pair already has an open conflict; its timestamps were merged.
    Updated(String),
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

#[derive(Default)]
struct PairActivity {
    last_a: Option<DateTime<Utc>>,
    last_b: Option<DateTime<Utc>>,
}

impl PairActivity {
    fn set(&mut self, side: Side, ts: DateTime<Utc>) {
        match side {
            Side::A => self.last_a = Some(ts),
            Side::B => self.last_b = Some(ts),
        }
    }

    fn get(&self, side: Side) -> Option<DateTime<Utc>> {
        match side {
            Side::A => self.last_a,
            Side::B => self.last_b,
        }
    }

    fn latest(&self) -> Option<DateTime<Utc>> {
        self.last_a.max(self.last_b)
    }
}

/// Correlates paired changes within the conflict window. Pairs are keyed
/// by the absolute side-A path.
pub struct ConflictDetector {
    window: chrono::Duration,
    dir_a: PathBuf,
    dir_b: PathBuf,
    db: Arc<Database>,
    activity: Mutex<HashMap<PathBuf, PairActivity>>,
    open: Mutex<HashMap<PathBuf, String>>,
}

impl ConflictDetector {
    pub fn new(config: &SyncConfig, db: Arc<Database>) -> Self {
        Self {
            window: chrono::Duration::milliseconds(config.conflict_window_ms as i64),
            dir_a: config.dir_a.clone(),
            dir_b: config.dir_b.clone(),
            db,
            activity: Mutex::new(HashMap::new()),
            open: Mutex::new(HashMap::new()),
        }
    }

    /// Re-key open conflicts loaded from the database, so duplicate
    /// suppression survives a restart.
    pub fn restore_open(&self, conflicts: &[Conflict]) {
        let mut open = lock(&self.open);
        for conflict in conflicts {
            open.insert(conflict.file_a.clone(), conflict.id.clone());
        }
        debug!(count = open.len(), "restored open conflicts");
    }

    /// Whether the pair keyed by `file_a` has an open conflict. Conflicted
    /// pairs are excluded from conversion until resolved.
    pub fn is_conflicted(&self, file_a: &Path) -> bool {
        lock(&self.open).contains_key(file_a)
    }

    /// Forget the open conflict for a pair once it is resolved. A later
    /// overlapping pair of edits raises a fresh conflict.
    pub fn close(&self, file_a: &Path) {
        lock(&self.open).remove(file_a);
    }

    pub fn open_count(&self) -> usize {
        lock(&self.open).len()
    }

    /// Fold one human change into the pair's activity record and decide
    /// whether it conflicts with the opposite side.
    ///
    /// `ir_version` is the highest stored IR version across the pair at
    /// this moment; it is frozen into the conflict as tie-break data.
    pub fn observe(
        &self,
        file_a: &Path,
        file_b: &Path,
        side: Side,
        timestamp: DateTime<Utc>,
        ir_version: u64,
    ) -> Result<Observation, DatabaseError> {
        let key = file_a.to_path_buf();

        let (ts_a, ts_b, overlaps) = {
            let mut activity = lock(&self.activity);
            let now = Utc::now();
            activity
                .retain(|_, act| act.latest().map(|t| now - t <= self.window).unwrap_or(false));

            let entry = activity.entry(key.clone()).or_default();
            entry.set(side, timestamp);
            let overlaps = entry
                .get(side.opposite())
                .map(|t| (timestamp - t).abs() <= self.window)
                .unwrap_or(false);
            (
                entry.get(Side::A).unwrap_or(timestamp),
                entry.get(Side::B).unwrap_or(timestamp),
                overlaps,
            )
        };

        if !overlaps {
            return Ok(Observation::Clear);
        }

        let existing = lock(&self.open).get(&key).cloned();
        if let Some(id) = existing {
            match self.db.update_conflict_timestamps(&id, ts_a, ts_b) {
                Ok(()) => {
                    debug!(id = %id, file_a = %key.display(), "merged timestamps into open conflict");
                    return Ok(Observation::Updated(id));
                }
                // The row was resolved out from under the map; raise anew.
                Err(DatabaseError::NotFound { .. }) => {
                    lock(&self.open).remove(&key);
                }
                Err(e) => return Err(e),
            }
        }

        let conflict = Conflict::new(
            file_a.to_path_buf(),
            file_b.to_path_buf(),
            ts_a,
            ts_b,
            ir_version,
        );
        self.db.insert_conflict(&conflict)?;
        lock(&self.open).insert(key, conflict.id.clone());
        warn!(
            id = %conflict.id,
            file_a = %conflict.file_a.display(),
            file_b = %conflict.file_b.display(),
            "conflict detected"
        );
        Ok(Observation::New(conflict))
    }

    // -----------------------------------------------------------------------
    // Tie-break data
    // -----------------------------------------------------------------------

    /// The side whose file is newer on disk, falling back to the recorded
    /// edit timestamps when a file is missing; A on an exact tie.
    pub fn compare_file_timestamps(&self, conflict: &Conflict) -> Side {
        let stat = |side: Side| {
            SourceFile::stat(conflict.file_for(side), side)
                .last_modified_at
                .unwrap_or(conflict.timestamp_for(side))
        };
        if stat(Side::B) > stat(Side::A) {
            Side::B
        } else {
            Side::A
        }
    }

    /// The side with the higher stored IR version, or `None` when the
    /// versions tie (including when neither side has a snapshot).
    pub async fn compare_ir_versions(&self, conflict: &Conflict, store: &IrStore) -> Option<Side> {
        let rel_a = conflict.file_a.strip_prefix(&self.dir_a).ok()?;
        let rel_b = conflict.file_b.strip_prefix(&self.dir_b).ok()?;
        let version = |info: Option<crate::ir::VersionInfo>| info.map(|i| i.version).unwrap_or(0);
        let va = version(store.version_info(Side::A, rel_a).await.ok().flatten());
        let vb = version(store.version_info(Side::B, rel_b).await.ok().flatten());
        match va.cmp(&vb) {
            std::cmp::Ordering::Greater => Some(Side::A),
            std::cmp::Ordering::Less => Some(Side::B),
            std::cmp::Ordering::Equal => None,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (ConflictDetector, Arc<Database>, PathBuf, PathBuf) {
        let db = Arc::new(Database::in_memory().unwrap());
        db.initialize().unwrap();
        let config: SyncConfig =
            toml::from_str("dir_a = '/trees/a'\ndir_b = '/trees/b'\nconflict_window_ms = 5000")
                .unwrap();
        let detector = ConflictDetector::new(&config, db.clone());
        let file_a = PathBuf::from("/trees/a/views/home.json");
        let file_b = PathBuf::from("/trees/b/views/home.json");
        (detector, db, file_a, file_b)
    }

    #[test]
    fn test_paired_edits_within_window_raise_one_conflict() {
        let (detector, db, file_a, file_b) = setup();
        let t = Utc::now();

        let first = detector.observe(&file_a, &file_b, Side::A, t, 2).unwrap();
        assert!(matches!(first, Observation::Clear));
        assert!(!detector.is_conflicted(&file_a));

        let second = detector
            .observe(
                &file_a,
                &file_b,
                Side::B,
                t + chrono::Duration::milliseconds(200),
                2,
            )
            .unwrap();
        let Observation::New(conflict) = second else {
            panic!("expected a new conflict");
        };
        assert_eq!(conflict.timestamp_a, t);
        assert_eq!(conflict.ir_version_at_detection, 2);
        assert_eq!(conflict.status, ConflictStatus::Unresolved);
        assert!(detector.is_conflicted(&file_a));
        assert_eq!(db.count_all_conflicts().unwrap(), 1);
    }

    #[test]
    fn test_further_overlap_merges_instead_of_duplicating() {
        let (detector, db, file_a, file_b) = setup();
        let t = Utc::now();

        detector.observe(&file_a, &file_b, Side::A, t, 0).unwrap();
        let raised = detector
            .observe(
                &file_a,
                &file_b,
                Side::B,
                t + chrono::Duration::milliseconds(200),
                0,
            )
            .unwrap();
        let Observation::New(conflict) = raised else {
            panic!("expected a new conflict");
        };

        let later_a = t + chrono::Duration::milliseconds(900);
        let third = detector
            .observe(&file_a, &file_b, Side::A, later_a, 0)
            .unwrap();
        assert!(matches!(third, Observation::Updated(ref id) if *id == conflict.id));

        assert_eq!(db.count_all_conflicts().unwrap(), 1);
        let stored = db.get_conflict(&conflict.id).unwrap().unwrap();
        assert_eq!(stored.timestamp_a, later_a);
    }

    #[test]
    fn test_edits_outside_window_stay_clear() {
        let (detector, db, file_a, file_b) = setup();
        let t = Utc::now();

        detector.observe(&file_a, &file_b, Side::A, t, 0).unwrap();
        let later = detector
            .observe(
                &file_a,
                &file_b,
                Side::B,
                t + chrono::Duration::milliseconds(6000),
                0,
            )
            .unwrap();
        assert!(matches!(later, Observation::Clear));
        assert_eq!(db.count_all_conflicts().unwrap(), 0);
    }

    #[test]
    fn test_closed_pair_can_conflict_again() {
        let (detector, db, file_a, file_b) = setup();
        let t = Utc::now();

        detector.observe(&file_a, &file_b, Side::A, t, 0).unwrap();
        detector
            .observe(
                &file_a,
                &file_b,
                Side::B,
                t + chrono::Duration::milliseconds(100),
                0,
            )
            .unwrap();
        assert!(detector.is_conflicted(&file_a));

        detector.close(&file_a);
        assert!(!detector.is_conflicted(&file_a));

        let again = detector
            .observe(
                &file_a,
                &file_b,
                Side::A,
                t + chrono::Duration::milliseconds(300),
                0,
            )
            .unwrap();
        assert!(matches!(again, Observation::New(_)));
        assert_eq!(db.count_all_conflicts().unwrap(), 2);
    }

    #[test]
    fn test_independent_pairs_get_independent_conflicts() {
        let (detector, db, file_a, file_b) = setup();
        let other_a = PathBuf::from("/trees/a/views/settings.json");
        let other_b = PathBuf::from("/trees/b/views/settings.json");
        let t = Utc::now();

        for (fa, fb) in [(&file_a, &file_b), (&other_a, &other_b)] {
            detector.observe(fa, fb, Side::A, t, 0).unwrap();
            detector
                .observe(fa, fb, Side::B, t + chrono::Duration::milliseconds(50), 0)
                .unwrap();
        }

        assert_eq!(db.count_all_conflicts().unwrap(), 2);
        assert_eq!(detector.open_count(), 2);
    }

    #[test]
    fn test_restore_open_rehydrates_suppression() {
        let (detector, db, file_a, file_b) = setup();
        let conflict = Conflict::new(file_a.clone(), file_b, Utc::now(), Utc::now(), 1);
        db.insert_conflict(&conflict).unwrap();

        assert!(!detector.is_conflicted(&file_a));
        let open = db.unresolved_conflicts().unwrap();
        detector.restore_open(&open);
        assert!(detector.is_conflicted(&file_a));
    }

    #[test]
    fn test_timestamp_tie_break_falls_back_to_recorded_edits() {
        // Neither file exists on disk, so the recorded edit timestamps
        // decide.
        let (detector, _db, file_a, file_b) = setup();
        let t = Utc::now();

        let newer_b = Conflict::new(
            file_a.clone(),
            file_b.clone(),
            t,
            t + chrono::Duration::milliseconds(10),
            0,
        );
        assert_eq!(detector.compare_file_timestamps(&newer_b), Side::B);

        let tied = Conflict::new(file_a, file_b, t, t, 0);
        assert_eq!(detector.compare_file_timestamps(&tied), Side::A);
    }

    #[test]
    fn test_timestamp_tie_break_prefers_on_disk_mtime() {
        let (detector, _db, _fa, _fb) = setup();
        let dir = tempfile::tempdir().unwrap();
        let file_b = dir.path().join("home.json");
        std::fs::write(&file_b, "fresh edit").unwrap();

        // Side A's file is gone and its recorded edit is an hour old;
        // side B's on-disk mtime is current.
        let stale = Utc::now() - chrono::Duration::hours(1);
        let conflict = Conflict::new(dir.path().join("missing.json"), file_b, stale, stale, 0);
        assert_eq!(detector.compare_file_timestamps(&conflict), Side::B);
    }

    #[tokio::test]
    async fn test_ir_version_tie_break() {
        let (detector, _db, file_a, file_b) = setup();
        let dir = tempfile::tempdir().unwrap();
        let store = IrStore::new(dir.path().join("ir")).unwrap();

        let conflict = Conflict::new(file_a, file_b, Utc::now(), Utc::now(), 0);
        assert_eq!(detector.compare_ir_versions(&conflict, &store).await, None);

        let doc = crate::ir::IrDocument::new(crate::ir::IrNode::new("root"));
        let rel = Path::new("views/home.json");
        store
            .put(Side::A, rel, doc.clone(), Side::A, None)
            .await
            .unwrap();
        store
            .put(Side::A, rel, doc.clone(), Side::A, Some(1))
            .await
            .unwrap();
        store.put(Side::B, rel, doc, Side::A, None).await.unwrap();

        assert_eq!(
            detector.compare_ir_versions(&conflict, &store).await,
            Some(Side::A)
        );
    }
}
