//! Versioned IR snapshot store.
//!
//! One current [`IrSnapshot`] per (side, relative path) key, persisted as
//! `storage_dir/<encoded-key>.json`. Writes go through an optimistic
//! compare-and-set on the snapshot version: the store is the single source
//! of truth for "last known good" state, and a stale writer gets a
//! [`PutOutcome::VersionConflict`] back instead of silently overwriting.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::errors::StoreError;
use crate::ir::{IrDocument, IrSnapshot, VersionInfo};
use crate::models::Side;

/// Per-key history entries retained for diagnostics.
const HISTORY_LIMIT: usize = 16;

/// Result of an [`IrStore::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The snapshot was written with this new version.
    Written { version: u64 },
    /// The caller's expected version did not match the stored one; nothing
    /// was written. `current` is the version on disk (0 when none).
    VersionConflict { current: u64 },
}

struct StoreEntry {
    info: VersionInfo,
    history: VecDeque<VersionInfo>,
}

/// Filesystem-backed snapshot store with an in-memory version index.
///
/// The index is loaded lazily per key, so `version_info` and
/// `compare_versions` never read full snapshot contents after the first
/// touch of a key.
pub struct IrStore {
    dir: PathBuf,
    index: Mutex<HashMap<String, StoreEntry>>,
}

impl IrStore {
    /// Open a store rooted at `dir`, creating the directory if needed.
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        debug!(dir = %dir.display(), "opened IR store");
        Ok(Self {
            dir,
            index: Mutex::new(HashMap::new()),
        })
    }

    /// Write a new snapshot for (side, path) if `expected_version` matches
    /// the stored version (`None` = no snapshot expected to exist yet).
    ///
    /// On a match the snapshot is written with version `stored + 1` and the
    /// outcome is [`PutOutcome::Written`]; on a mismatch nothing is touched
    /// and the outcome is [`PutOutcome::VersionConflict`].
    pub async fn put(
        &self,
        side: Side,
        path: &Path,
        content: IrDocument,
        origin_side: Side,
        expected_version: Option<u64>,
    ) -> Result<PutOutcome, StoreError> {
        let key = key_for(side, path);
        // The lock spans the read-check-write so concurrent puts for the
        // same key serialize and versions never skip or repeat.
        let mut index = self.index.lock().await;

        let current = match index.get(&key) {
            Some(entry) => Some(entry.info),
            None => self.load_info(&key).await?,
        };
        let current_version = current.map(|info| info.version);

        if expected_version != current_version {
            warn!(
                key = %key,
                expected = ?expected_version,
                current = ?current_version,
                "snapshot version conflict"
            );
            return Ok(PutOutcome::VersionConflict {
                current: current_version.unwrap_or(0),
            });
        }

        let version = current_version.unwrap_or(0) + 1;
        let snapshot = IrSnapshot {
            path: path.display().to_string(),
            side,
            version,
            content,
            generated_at: Utc::now(),
            origin_side,
        };

        let json = serde_json::to_string_pretty(&snapshot)?;
        tokio::fs::write(self.snapshot_file(&key), json).await?;

        let info = VersionInfo {
            version,
            generated_at: snapshot.generated_at,
            origin_side,
        };
        let entry = index.entry(key.clone()).or_insert_with(|| StoreEntry {
            info,
            history: VecDeque::new(),
        });
        entry.info = info;
        entry.history.push_back(info);
        while entry.history.len() > HISTORY_LIMIT {
            entry.history.pop_front();
        }

        debug!(key = %key, version, origin = %origin_side, "snapshot written");
        Ok(PutOutcome::Written { version })
    }

    /// Load the full current snapshot for (side, path).
    pub async fn get(&self, side: Side, path: &Path) -> Result<IrSnapshot, StoreError> {
        let key = key_for(side, path);
        match self.read_snapshot(&key).await? {
            Some(snapshot) => Ok(snapshot),
            None => Err(StoreError::SnapshotNotFound(key)),
        }
    }

    /// Version and timestamp for (side, path) without loading content,
    /// or `None` when no snapshot exists.
    pub async fn version_info(
        &self,
        side: Side,
        path: &Path,
    ) -> Result<Option<VersionInfo>, StoreError> {
        let key = key_for(side, path);
        let mut index = self.index.lock().await;
        if let Some(entry) = index.get(&key) {
            return Ok(Some(entry.info));
        }
        match self.load_info(&key).await? {
            Some(info) => {
                index.insert(
                    key,
                    StoreEntry {
                        info,
                        history: VecDeque::from([info]),
                    },
                );
                Ok(Some(info))
            }
            None => Ok(None),
        }
    }

    /// Compare the stored versions of two files. `None` when either side
    /// has no snapshot.
    pub async fn compare_versions(
        &self,
        a: (Side, &Path),
        b: (Side, &Path),
    ) -> Result<Option<std::cmp::Ordering>, StoreError> {
        let info_a = self.version_info(a.0, a.1).await?;
        let info_b = self.version_info(b.0, b.1).await?;
        match (info_a, info_b) {
            (Some(ia), Some(ib)) => Ok(Some(ia.version.cmp(&ib.version))),
            _ => Ok(None),
        }
    }

    /// Recent version history for (side, path), oldest first. Only covers
    /// writes observed by this store instance.
    pub async fn history(&self, side: Side, path: &Path) -> Vec<VersionInfo> {
        let key = key_for(side, path);
        let index = self.index.lock().await;
        index
            .get(&key)
            .map(|entry| entry.history.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Remove the snapshot for (side, path). Returns whether one existed.
    pub async fn remove(&self, side: Side, path: &Path) -> Result<bool, StoreError> {
        let key = key_for(side, path);
        let mut index = self.index.lock().await;
        index.remove(&key);
        match tokio::fs::remove_file(self.snapshot_file(&key)).await {
            Ok(()) => {
                debug!(key = %key, "snapshot removed");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn snapshot_file(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", encode_key(key)))
    }

    async fn read_snapshot(&self, key: &str) -> Result<Option<IrSnapshot>, StoreError> {
        let file = self.snapshot_file(key);
        let contents = match tokio::fs::read_to_string(&file).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let snapshot =
            serde_json::from_str(&contents).map_err(|e| StoreError::CorruptSnapshot {
                path: file.display().to_string(),
                detail: e.to_string(),
            })?;
        Ok(Some(snapshot))
    }

    async fn load_info(&self, key: &str) -> Result<Option<VersionInfo>, StoreError> {
        Ok(self.read_snapshot(key).await?.map(|s| VersionInfo {
            version: s.version,
            generated_at: s.generated_at,
            origin_side: s.origin_side,
        }))
    }
}

fn key_for(side: Side, path: &Path) -> String {
    format!("{}/{}", side, path.display())
}

/// Encode a snapshot key into a flat file name. Every byte outside
/// `[A-Za-z0-9._-]` becomes a `%XX` escape; since `%` itself is escaped,
/// distinct keys can never collide.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-' => {
                out.push(byte as char)
            }
            other => {
                out.push('%');
                out.push_str(&format!("{:02X}", other));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::IrNode;

    fn sample_doc(label: &str) -> IrDocument {
        IrDocument::new(
            IrNode::new("container")
                .with_child(IrNode::new("text").with_prop("value", serde_json::json!(label))),
        )
    }

    #[tokio::test]
    async fn test_put_and_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = IrStore::new(dir.path()).unwrap();
        let path = Path::new("views/home.json");

        let outcome = store
            .put(Side::A, path, sample_doc("one"), Side::A, None)
            .await
            .unwrap();
        assert_eq!(outcome, PutOutcome::Written { version: 1 });

        let snapshot = store.get(Side::A, path).await.unwrap();
        assert_eq!(snapshot.version, 1);
        assert_eq!(snapshot.side, Side::A);
        assert_eq!(snapshot.content, sample_doc("one"));
    }

    #[tokio::test]
    async fn test_versions_strictly_increase() {
        let dir = tempfile::tempdir().unwrap();
        let store = IrStore::new(dir.path()).unwrap();
        let path = Path::new("views/home.json");

        let mut last = 0;
        for i in 0..5 {
            let expected = if i == 0 { None } else { Some(last) };
            let outcome = store
                .put(Side::A, path, sample_doc(&format!("v{i}")), Side::A, expected)
                .await
                .unwrap();
            match outcome {
                PutOutcome::Written { version } => {
                    assert_eq!(version, last + 1);
                    last = version;
                }
                other => panic!("unexpected outcome: {other:?}"),
            }
        }
        assert_eq!(last, 5);
    }

    #[tokio::test]
    async fn test_stale_put_is_rejected_without_overwriting() {
        let dir = tempfile::tempdir().unwrap();
        let store = IrStore::new(dir.path()).unwrap();
        let path = Path::new("views/home.json");

        store
            .put(Side::A, path, sample_doc("first"), Side::A, None)
            .await
            .unwrap();
        store
            .put(Side::A, path, sample_doc("second"), Side::A, Some(1))
            .await
            .unwrap();

        // A writer that still thinks version 1 is current must be refused.
        let outcome = store
            .put(Side::A, path, sample_doc("stale"), Side::A, Some(1))
            .await
            .unwrap();
        assert_eq!(outcome, PutOutcome::VersionConflict { current: 2 });

        let snapshot = store.get(Side::A, path).await.unwrap();
        assert_eq!(snapshot.version, 2);
        assert_eq!(snapshot.content, sample_doc("second"));
    }

    #[tokio::test]
    async fn test_first_put_with_expected_version_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let store = IrStore::new(dir.path()).unwrap();
        let outcome = store
            .put(
                Side::B,
                Path::new("views/new.json"),
                sample_doc("x"),
                Side::B,
                Some(4),
            )
            .await
            .unwrap();
        assert_eq!(outcome, PutOutcome::VersionConflict { current: 0 });
    }

    #[tokio::test]
    async fn test_version_info_survives_new_instance() {
        let dir = tempfile::tempdir().unwrap();
        let path = Path::new("views/home.json");
        {
            let store = IrStore::new(dir.path()).unwrap();
            store
                .put(Side::A, path, sample_doc("one"), Side::B, None)
                .await
                .unwrap();
        }

        // A fresh store over the same directory lazily reloads from disk.
        let store = IrStore::new(dir.path()).unwrap();
        let info = store.version_info(Side::A, path).await.unwrap().unwrap();
        assert_eq!(info.version, 1);
        assert_eq!(info.origin_side, Side::B);

        let outcome = store
            .put(Side::A, path, sample_doc("two"), Side::A, Some(1))
            .await
            .unwrap();
        assert_eq!(outcome, PutOutcome::Written { version: 2 });
    }

    #[tokio::test]
    async fn test_sides_have_independent_lineages() {
        let dir = tempfile::tempdir().unwrap();
        let store = IrStore::new(dir.path()).unwrap();
        let path = Path::new("views/home.json");

        store
            .put(Side::A, path, sample_doc("a"), Side::A, None)
            .await
            .unwrap();
        store
            .put(Side::B, path, sample_doc("b"), Side::A, None)
            .await
            .unwrap();
        store
            .put(Side::A, path, sample_doc("a2"), Side::A, Some(1))
            .await
            .unwrap();

        let ordering = store
            .compare_versions((Side::A, path), (Side::B, path))
            .await
            .unwrap();
        assert_eq!(ordering, Some(std::cmp::Ordering::Greater));

        assert!(store
            .compare_versions((Side::A, path), (Side::B, Path::new("missing.json")))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let store = IrStore::new(dir.path()).unwrap();
        let path = Path::new("views/busy.json");

        let mut expected = None;
        for i in 0..(HISTORY_LIMIT as u64 + 4) {
            store
                .put(Side::A, path, sample_doc(&i.to_string()), Side::A, expected)
                .await
                .unwrap();
            expected = Some(i + 1);
        }

        let history = store.history(Side::A, path).await;
        assert_eq!(history.len(), HISTORY_LIMIT);
        assert_eq!(history.last().unwrap().version, HISTORY_LIMIT as u64 + 4);
    }

    #[tokio::test]
    async fn test_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = IrStore::new(dir.path()).unwrap();
        let path = Path::new("views/gone.json");

        store
            .put(Side::A, path, sample_doc("x"), Side::A, None)
            .await
            .unwrap();
        assert!(store.remove(Side::A, path).await.unwrap());
        assert!(!store.remove(Side::A, path).await.unwrap());
        assert!(store.version_info(Side::A, path).await.unwrap().is_none());
    }

    #[test]
    fn test_encode_key_is_injective_on_separators() {
        assert_eq!(encode_key("a/views/home.json"), "a%2Fviews%2Fhome.json");
        // A literal '%2F' in a path must not collide with an escaped '/'.
        assert_ne!(encode_key("a/x"), encode_key("a%2Fx"));
    }
}
