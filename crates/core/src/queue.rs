//! Batched conversion pipeline.
//!
//! [`ConversionQueue::enqueue`] is non-blocking. A worker task collects
//! events into batches (up to `batch_size`, flushed after `batch_delay_ms`
//! of inactivity) and runs each batch in two phases: first every event is
//! offered to the conflict detector, then the pairs that did not conflict
//! are converted concurrently. Running detection over the whole batch
//! before any regeneration means a paired edit arriving in the same batch
//! is never clobbered by its counterpart's conversion.
//!
//! One failing file never blocks the rest of its batch: per-file errors
//! become status events and sync-log rows, and processing continues.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backup::BackupManager;
use crate::config::AppConfig;
use crate::conflict::{ConflictDetector, ConflictEvent, ConflictNotifier, Observation};
use crate::convert::{ConverterSet, PairingConvention};
use crate::db::Database;
use crate::errors::{ConversionError, CoreError, FileSystemError, StoreError};
use crate::ir::IrDocument;
use crate::models::{ChangeEvent, ChangeKind, Side, StatusEvent, SyncStats, SyncStatus};
use crate::store::{IrStore, PutOutcome};
use crate::watcher::WriteSuppressor;

// ---------------------------------------------------------------------------
// Shared context
// ---------------------------------------------------------------------------

/// The services one sync session shares between its queue worker, its
/// watchers, and the session facade itself.
pub struct SyncContext {
    pub config: AppConfig,
    pub converters: ConverterSet,
    pub pairing: Arc<dyn PairingConvention>,
    pub db: Arc<Database>,
    pub store: Arc<IrStore>,
    pub backups: Arc<BackupManager>,
    pub suppressor: Arc<WriteSuppressor>,
    pub detector: ConflictDetector,
    pub notifier: ConflictNotifier,
    pub stats: SyncStats,
    pub status_tx: broadcast::Sender<StatusEvent>,
    pub(crate) current_status: Mutex<SyncStatus>,
}

impl SyncContext {
    /// Broadcast a status event. This is the only writer of the current
    /// status; send failures just mean nobody is subscribed.
    pub(crate) fn emit(&self, event: StatusEvent) {
        *lock(&self.current_status) = event.status;
        let _ = self.status_tx.send(event);
    }

    /// The status carried by the most recent event.
    pub fn status(&self) -> SyncStatus {
        *lock(&self.current_status)
    }

    fn resolve_paths(&self, event: &ChangeEvent) -> EventPaths {
        let rel_own = event.path.clone();
        let abs_own = self.config.dir_for(event.side).join(&rel_own);
        let pair = self
            .pairing
            .counterpart(event.side, &rel_own)
            .map(|rel_other| {
                let abs_other = self.config.dir_for(event.side.opposite()).join(&rel_other);
                let (rel_a, rel_b, file_a, file_b) = match event.side {
                    Side::A => (
                        rel_own.clone(),
                        rel_other.clone(),
                        abs_own.clone(),
                        abs_other.clone(),
                    ),
                    Side::B => (
                        rel_other.clone(),
                        rel_own.clone(),
                        abs_other.clone(),
                        abs_own.clone(),
                    ),
                };
                PairPaths {
                    rel_other,
                    abs_other,
                    rel_a,
                    rel_b,
                    file_a,
                    file_b,
                }
            });
        EventPaths {
            rel_own,
            abs_own,
            pair,
        }
    }

    async fn stored_version(&self, side: Side, rel: &Path) -> u64 {
        self.store
            .version_info(side, rel)
            .await
            .ok()
            .flatten()
            .map(|info| info.version)
            .unwrap_or(0)
    }

    /// Highest stored IR version across both sides of a pair.
    async fn highest_pair_version(&self, pair: &PairPaths) -> u64 {
        let a = self.stored_version(Side::A, &pair.rel_a).await;
        let b = self.stored_version(Side::B, &pair.rel_b).await;
        a.max(b)
    }
}

/// Paths derived from one change event.
struct EventPaths {
    /// Path relative to its own tree root.
    rel_own: PathBuf,
    abs_own: PathBuf,
    pair: Option<PairPaths>,
}

/// The counterpart of a paired change, plus the pair's identity.
struct PairPaths {
    rel_other: PathBuf,
    abs_other: PathBuf,
    rel_a: PathBuf,
    rel_b: PathBuf,
    /// Absolute side-A path: the key conflicts are tracked under.
    file_a: PathBuf,
    file_b: PathBuf,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ---------------------------------------------------------------------------
// Queue handle
// ---------------------------------------------------------------------------

/// Intake handle for the conversion worker task.
pub struct ConversionQueue {
    tx: mpsc::UnboundedSender<ChangeEvent>,
    worker: Option<JoinHandle<()>>,
}

impl ConversionQueue {
    /// Spawn the worker task. Events flow in through [`enqueue`] or the
    /// sender handed to watchers, until `shutdown` fires.
    ///
    /// [`enqueue`]: Self::enqueue
    pub fn start(ctx: Arc<SyncContext>, shutdown: broadcast::Receiver<()>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = QueueWorker::new(ctx);
        let handle = tokio::spawn(worker.run(rx, shutdown));
        Self {
            tx,
            worker: Some(handle),
        }
    }

    /// Sender side of the intake channel, for wiring watchers.
    pub fn sender(&self) -> mpsc::UnboundedSender<ChangeEvent> {
        self.tx.clone()
    }

    /// Queue one event without blocking. Returns false once the worker
    /// has exited.
    pub fn enqueue(&self, event: ChangeEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    /// Await worker exit after a shutdown signal, up to `grace`.
    /// In-flight conversions are allowed to finish; on grace expiry the
    /// worker is aborted. Returns whether the drain completed cleanly.
    pub async fn drain(&mut self, grace: Duration) -> bool {
        let Some(mut handle) = self.worker.take() else {
            return true;
        };
        match tokio::time::timeout(grace, &mut handle).await {
            Ok(_) => true,
            Err(_) => {
                warn!(grace_ms = grace.as_millis() as u64, "queue drain grace period expired");
                handle.abort();
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

struct QueueWorker {
    ctx: Arc<SyncContext>,
    batch_size: usize,
    batch_delay: Duration,
    convert_timeout: Duration,
    semaphore: Arc<Semaphore>,
}

impl QueueWorker {
    fn new(ctx: Arc<SyncContext>) -> Self {
        let sync = &ctx.config.sync;
        Self {
            batch_size: sync.batch_size,
            batch_delay: Duration::from_millis(sync.batch_delay_ms),
            convert_timeout: Duration::from_millis(sync.convert_timeout_ms),
            semaphore: Arc::new(Semaphore::new(sync.max_concurrent)),
            ctx,
        }
    }

    async fn run(
        self,
        mut rx: mpsc::UnboundedReceiver<ChangeEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!(
            batch_size = self.batch_size,
            batch_delay_ms = self.batch_delay.as_millis() as u64,
            "conversion queue started"
        );
        let mut batch: Vec<ChangeEvent> = Vec::new();

        loop {
            if batch.is_empty() {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    received = rx.recv() => match received {
                        Some(event) => batch.push(event),
                        None => break,
                    },
                }
            } else {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    received = tokio::time::timeout(self.batch_delay, rx.recv()) => match received {
                        Ok(Some(event)) => batch.push(event),
                        Ok(None) => break,
                        // Inactivity: flush the partial batch.
                        Err(_) => {
                            self.process_batch(std::mem::take(&mut batch)).await;
                            continue;
                        }
                    },
                }
            }
            if batch.len() >= self.batch_size {
                self.process_batch(std::mem::take(&mut batch)).await;
            }
        }

        // Flush whatever the watchers handed over before they stopped, so
        // a drain never abandons edits.
        while let Ok(event) = rx.try_recv() {
            batch.push(event);
        }
        if !batch.is_empty() {
            self.process_batch(batch).await;
        }
        info!("conversion queue stopped");
    }

    async fn process_batch(&self, events: Vec<ChangeEvent>) {
        let ctx = &self.ctx;
        debug!(count = events.len(), "processing batch");
        ctx.emit(StatusEvent::new(SyncStatus::Syncing));

        // The debouncer already collapses bursts per side; collapsing again
        // here covers the same path reported by both flushes of one watcher
        // landing in a single batch.
        let events = collapse_latest(events);
        let resolved: Vec<(ChangeEvent, EventPaths)> = events
            .into_iter()
            .map(|event| {
                let paths = ctx.resolve_paths(&event);
                (event, paths)
            })
            .collect();

        // Phase 1: offer every change to the detector before any
        // conversion runs, so paired edits within one batch raise a
        // conflict instead of the first one overwriting the second.
        for (event, paths) in &resolved {
            self.observe_event(event, paths).await;
        }

        // Phase 2: convert, grouped by pair so no two tasks ever touch the
        // same pair's files concurrently.
        let mut tasks: FuturesUnordered<_> = group_by_pair(resolved)
            .into_iter()
            .map(|group| self.process_group(group))
            .collect();
        while tasks.next().await.is_some() {}

        let status = if ctx.detector.open_count() > 0 {
            SyncStatus::Conflict
        } else {
            SyncStatus::Watching
        };
        ctx.emit(StatusEvent::new(status));
        let _ = ctx.db.set_state("session_status", &status.to_string());
        let _ = ctx
            .db
            .set_state("last_activity_at", &chrono::Utc::now().to_rfc3339());
    }

    /// Phase 1 for one event: fold it into the detector's pair activity
    /// and fan out any raised or updated conflict.
    async fn observe_event(&self, event: &ChangeEvent, paths: &EventPaths) {
        let ctx = &self.ctx;
        if !ctx.config.sync.mode.detects_conflicts() {
            return;
        }
        let Some(pair) = &paths.pair else {
            // Unpaired files sync one-way and never conflict.
            return;
        };

        let ir_version = ctx.highest_pair_version(pair).await;
        match ctx.detector.observe(
            &pair.file_a,
            &pair.file_b,
            event.side,
            event.timestamp,
            ir_version,
        ) {
            Ok(Observation::Clear) => {}
            Ok(Observation::New(conflict)) => {
                ctx.stats.record_conflict_detected();
                if let Err(e) = ctx.notifier.notify_all(ConflictEvent::detected(&conflict)).await {
                    warn!(conflict_id = %conflict.id, error = %e, "conflict notification failed");
                }
            }
            Ok(Observation::Updated(id)) => {
                if let Ok(Some(conflict)) = ctx.db.get_conflict(&id) {
                    if let Err(e) = ctx.notifier.notify_all(ConflictEvent::updated(&conflict)).await
                    {
                        warn!(conflict_id = %id, error = %e, "conflict notification failed");
                    }
                }
            }
            Err(e) => {
                warn!(path = %event.path.display(), error = %e, "conflict observation failed")
            }
        }
    }

    /// Phase 2 for one pair: its events run strictly in order.
    async fn process_group(&self, group: Vec<(ChangeEvent, EventPaths)>) {
        for (event, paths) in group {
            let _permit = match self.semaphore.acquire().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            self.process_one(event, paths).await;
        }
    }

    async fn process_one(&self, event: ChangeEvent, paths: EventPaths) {
        let ctx = &self.ctx;

        // Conflicted pairs are left alone until a resolution decides which
        // side wins; the detector already merged this event's timestamps.
        if let Some(pair) = &paths.pair {
            if ctx.detector.is_conflicted(&pair.file_a) {
                warn!(
                    path = %paths.rel_own.display(),
                    side = %event.side,
                    "change held back: pair has an unresolved conflict"
                );
                return;
            }
        }

        let started = std::time::Instant::now();
        let action = match event.kind {
            ChangeKind::Deleted => "delete",
            _ => "convert",
        };
        let result = match event.kind {
            ChangeKind::Deleted => self.propagate_deletion(&event, &paths).await,
            _ => self.convert_and_generate(&event, &paths).await,
        };
        let duration_ms = started.elapsed().as_millis() as i64;

        let log_path = paths.rel_own.display().to_string();
        match &result {
            Ok(()) => {
                ctx.stats.record_success(duration_ms as u64);
                debug!(path = %log_path, side = %event.side, action, duration_ms, "sync applied");
                let _ = ctx.db.insert_sync_log(
                    &log_path,
                    &event.side.to_string(),
                    action,
                    "success",
                    None,
                    Some(duration_ms),
                );
            }
            Err(e) => {
                ctx.stats.record_failure();
                warn!(path = %log_path, error = %e, "sync failed; continuing with batch");
                ctx.emit(StatusEvent::with_detail(
                    SyncStatus::Syncing,
                    format!("conversion error at '{log_path}': {e}"),
                ));
                let _ = ctx.db.insert_sync_log(
                    &log_path,
                    &event.side.to_string(),
                    action,
                    "failure",
                    Some(&e.to_string()),
                    Some(duration_ms),
                );
            }
        }
    }

    async fn convert_and_generate(
        &self,
        event: &ChangeEvent,
        paths: &EventPaths,
    ) -> Result<(), CoreError> {
        let ctx = &self.ctx;
        let side = event.side;

        // 1. Parse the changed source into IR.
        let ir = self.convert_with_timeout(side, &paths.abs_own).await?;

        // 2. Persist the authoritative side's snapshot.
        self.put_snapshot(side, &paths.rel_own, ir.clone(), side)
            .await?;

        // 3. Regenerate the counterpart, suppressing its watcher echo, and
        //    snapshot it under the originating side.
        if let Some(pair) = &paths.pair {
            ctx.suppressor.record(&pair.abs_other);
            self.generate_with_timeout(side.opposite(), &ir, &pair.abs_other)
                .await?;
            self.put_snapshot(side.opposite(), &pair.rel_other, ir, side)
                .await?;
        }
        Ok(())
    }

    /// A debounced deletion removes the counterpart file (after backing it
    /// up) and both sides' snapshots.
    async fn propagate_deletion(
        &self,
        event: &ChangeEvent,
        paths: &EventPaths,
    ) -> Result<(), CoreError> {
        let ctx = &self.ctx;

        ctx.store.remove(event.side, &paths.rel_own).await?;

        let Some(pair) = &paths.pair else {
            return Ok(());
        };

        // Back up before removing; a failed backup aborts the propagation.
        ctx.backups.create_backup(&pair.abs_other).await?;
        ctx.suppressor.record(&pair.abs_other);
        match tokio::fs::remove_file(&pair.abs_other).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(FileSystemError::from_io(&pair.abs_other, e).into()),
        }
        ctx.store
            .remove(event.side.opposite(), &pair.rel_other)
            .await?;

        debug!(path = %paths.rel_own.display(), "deletion propagated");
        Ok(())
    }

    async fn convert_with_timeout(
        &self,
        side: Side,
        path: &Path,
    ) -> Result<IrDocument, ConversionError> {
        let converter = self.ctx.converters.for_side(side);
        match tokio::time::timeout(self.convert_timeout, converter.convert_to_ir(path)).await {
            Ok(result) => result,
            Err(_) => Err(ConversionError::Timeout {
                path: path.display().to_string(),
                timeout_ms: self.convert_timeout.as_millis() as u64,
            }),
        }
    }

    async fn generate_with_timeout(
        &self,
        side: Side,
        ir: &IrDocument,
        path: &Path,
    ) -> Result<(), ConversionError> {
        let converter = self.ctx.converters.for_side(side);
        match tokio::time::timeout(self.convert_timeout, converter.generate_from_ir(ir, path)).await
        {
            Ok(result) => result,
            Err(_) => Err(ConversionError::Timeout {
                path: path.display().to_string(),
                timeout_ms: self.convert_timeout.as_millis() as u64,
            }),
        }
    }

    /// Compare-and-set against the current version, re-reading once if a
    /// concurrent writer advanced it in between.
    async fn put_snapshot(
        &self,
        side: Side,
        rel: &Path,
        ir: IrDocument,
        origin: Side,
    ) -> Result<(), StoreError> {
        let store = &self.ctx.store;
        for _ in 0..2 {
            let expected = store
                .version_info(side, rel)
                .await?
                .map(|info| info.version);
            match store.put(side, rel, ir.clone(), origin, expected).await? {
                PutOutcome::Written { .. } => return Ok(()),
                PutOutcome::VersionConflict { current } => {
                    debug!(side = %side, path = %rel.display(), current, "snapshot moved, retrying put");
                }
            }
        }
        Err(StoreError::VersionRace {
            path: rel.display().to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Batch shaping
// ---------------------------------------------------------------------------

/// Keep only the newest event per (side, path), preserving first-seen
/// order.
fn collapse_latest(events: Vec<ChangeEvent>) -> Vec<ChangeEvent> {
    let mut index: HashMap<(Side, PathBuf), usize> = HashMap::new();
    let mut out: Vec<ChangeEvent> = Vec::with_capacity(events.len());
    for event in events {
        match index.get(&(event.side, event.path.clone())) {
            Some(&slot) => out[slot] = event,
            None => {
                index.insert((event.side, event.path.clone()), out.len());
                out.push(event);
            }
        }
    }
    out
}

/// Group events by pair identity (side-A absolute path, or the file's own
/// absolute path when unpaired), preserving batch order within each group.
fn group_by_pair(resolved: Vec<(ChangeEvent, EventPaths)>) -> Vec<Vec<(ChangeEvent, EventPaths)>> {
    let mut index: HashMap<PathBuf, usize> = HashMap::new();
    let mut groups: Vec<Vec<(ChangeEvent, EventPaths)>> = Vec::new();
    for (event, paths) in resolved {
        let key = match &paths.pair {
            Some(pair) => pair.file_a.clone(),
            None => paths.abs_own.clone(),
        };
        match index.get(&key) {
            Some(&slot) => groups[slot].push((event, paths)),
            None => {
                index.insert(key, groups.len());
                groups.push(vec![(event, paths)]);
            }
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::conflict::ConflictStatus;
    use crate::convert::{DocumentConverter, MirrorPairing, SourceConverter};
    use crate::ir::IrNode;
    use async_trait::async_trait;
    use chrono::Utc;

    fn doc(text: &str) -> IrDocument {
        IrDocument::new(IrNode::new("text").with_prop("value", serde_json::json!(text)))
    }

    struct Env {
        _dir: tempfile::TempDir,
        ctx: Arc<SyncContext>,
        dir_a: PathBuf,
        dir_b: PathBuf,
    }

    fn build_env(mode: &str) -> Env {
        build_env_with(mode, |_| None)
    }

    /// `override_a` may replace side A's converter (for failure-mode tests).
    fn build_env_with(
        mode: &str,
        override_a: impl Fn(&AppConfig) -> Option<Arc<dyn SourceConverter>>,
    ) -> Env {
        let dir = tempfile::tempdir().unwrap();
        let dir_a = dir.path().join("a");
        let dir_b = dir.path().join("b");
        std::fs::create_dir_all(&dir_a).unwrap();
        std::fs::create_dir_all(&dir_b).unwrap();

        let config: AppConfig = toml::from_str(&format!(
            r#"
[sync]
dir_a = "{}"
dir_b = "{}"
mode = "{mode}"
batch_size = 8
batch_delay_ms = 50
conflict_window_ms = 2000
convert_timeout_ms = 1000

[storage]
dir = "{}"

[backup]
dir = "{}"
"#,
            dir_a.display(),
            dir_b.display(),
            dir.path().join("ir").display(),
            dir.path().join("backups").display(),
        ))
        .unwrap();

        let db = Arc::new(Database::in_memory().unwrap());
        db.initialize().unwrap();
        let store = Arc::new(IrStore::new(&config.storage.dir).unwrap());
        let backups = Arc::new(BackupManager::new(config.backup.clone(), db.clone()).unwrap());
        let suppressor = Arc::new(WriteSuppressor::from_config(&config.sync));
        let detector = ConflictDetector::new(&config.sync, db.clone());

        let converter_a = override_a(&config)
            .unwrap_or_else(|| Arc::new(DocumentConverter::new("framework-a")));
        let converters = ConverterSet::new(converter_a, Arc::new(DocumentConverter::new("framework-b")));

        let ctx = Arc::new(SyncContext {
            config,
            converters,
            pairing: Arc::new(MirrorPairing::new("json", "json")),
            db,
            store,
            backups,
            suppressor,
            detector,
            notifier: ConflictNotifier::new(),
            stats: SyncStats::new(),
            status_tx: broadcast::channel(64).0,
            current_status: Mutex::new(SyncStatus::Idle),
        });
        Env {
            _dir: dir,
            ctx,
            dir_a,
            dir_b,
        }
    }

    async fn write_doc(env: &Env, side: Side, rel: &str, text: &str) {
        let root = if side == Side::A { &env.dir_a } else { &env.dir_b };
        env.ctx
            .converters
            .for_side(side)
            .generate_from_ir(&doc(text), &root.join(rel))
            .await
            .unwrap();
    }

    fn event(side: Side, rel: &str, kind: ChangeKind) -> ChangeEvent {
        ChangeEvent::new(rel, side, kind)
    }

    #[tokio::test]
    async fn test_modified_event_regenerates_counterpart() {
        let env = build_env("bidirectional");
        let worker = QueueWorker::new(env.ctx.clone());
        write_doc(&env, Side::A, "views/home.json", "hello").await;

        worker
            .process_batch(vec![event(Side::A, "views/home.json", ChangeKind::Modified)])
            .await;

        // Side B was generated with the same IR content.
        let generated = env
            .ctx
            .converters
            .b
            .convert_to_ir(&env.dir_b.join("views/home.json"))
            .await
            .unwrap();
        assert_eq!(generated, doc("hello"));

        // Both snapshots exist, attributed to side A.
        let rel = Path::new("views/home.json");
        let snap_b = env.ctx.store.get(Side::B, rel).await.unwrap();
        assert_eq!(snap_b.version, 1);
        assert_eq!(snap_b.origin_side, Side::A);
        assert_eq!(env.ctx.store.get(Side::A, rel).await.unwrap().version, 1);

        // The generated write is suppressed for B's watcher.
        assert!(env
            .ctx
            .suppressor
            .is_suppressed(&env.dir_b.join("views/home.json")));

        let snap = env.ctx.stats.snapshot();
        assert_eq!(snap.total_syncs, 1);
        assert_eq!(snap.succeeded, 1);
        assert_eq!(env.ctx.db.count_sync_log().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_bad_file_does_not_block_batch() {
        let env = build_env("bidirectional");
        let worker = QueueWorker::new(env.ctx.clone());
        let mut status_rx = env.ctx.status_tx.subscribe();

        write_doc(&env, Side::A, "good.json", "fine").await;
        tokio::fs::write(env.dir_a.join("bad.json"), "{ not json")
            .await
            .unwrap();

        worker
            .process_batch(vec![
                event(Side::A, "bad.json", ChangeKind::Modified),
                event(Side::A, "good.json", ChangeKind::Modified),
            ])
            .await;

        // The good file still synced.
        assert!(env.dir_b.join("good.json").exists());
        let snap = env.ctx.stats.snapshot();
        assert_eq!(snap.total_syncs, 2);
        assert_eq!(snap.succeeded, 1);
        assert_eq!(snap.failed, 1);

        // A status event carried the offending path, and the batch still
        // ended back in watching.
        let mut saw_error_detail = false;
        let mut last_status = None;
        while let Ok(status) = status_rx.try_recv() {
            if let Some(detail) = &status.detail {
                saw_error_detail |= detail.contains("bad.json");
            }
            last_status = Some(status.status);
        }
        assert!(saw_error_detail);
        assert_eq!(last_status, Some(SyncStatus::Watching));

        assert_eq!(env.ctx.db.count_sync_failures().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_paired_edits_in_one_batch_conflict_without_overwrite() {
        let env = build_env("bidirectional");
        let worker = QueueWorker::new(env.ctx.clone());

        write_doc(&env, Side::A, "views/home.json", "edit from a").await;
        write_doc(&env, Side::B, "views/home.json", "edit from b").await;

        let now = Utc::now();
        let mut ev_a = event(Side::A, "views/home.json", ChangeKind::Modified);
        ev_a.timestamp = now;
        let mut ev_b = event(Side::B, "views/home.json", ChangeKind::Modified);
        ev_b.timestamp = now + chrono::Duration::milliseconds(200);

        worker.process_batch(vec![ev_a, ev_b]).await;

        // Exactly one conflict, and neither file was overwritten.
        let open = env.ctx.db.unresolved_conflicts().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].status, ConflictStatus::Unresolved);
        assert_eq!(
            env.ctx
                .converters
                .a
                .convert_to_ir(&env.dir_a.join("views/home.json"))
                .await
                .unwrap(),
            doc("edit from a")
        );
        assert_eq!(
            env.ctx
                .converters
                .b
                .convert_to_ir(&env.dir_b.join("views/home.json"))
                .await
                .unwrap(),
            doc("edit from b")
        );

        assert_eq!(env.ctx.stats.snapshot().conflicts_detected, 1);
        let history = env.ctx.notifier.history(10);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].kind, crate::conflict::ConflictEventKind::Detected);
    }

    #[tokio::test]
    async fn test_conflicted_pair_holds_back_later_changes() {
        let env = build_env("bidirectional");
        let worker = QueueWorker::new(env.ctx.clone());

        write_doc(&env, Side::A, "views/home.json", "edit from a").await;
        write_doc(&env, Side::B, "views/home.json", "edit from b").await;
        worker
            .process_batch(vec![
                event(Side::A, "views/home.json", ChangeKind::Modified),
                event(Side::B, "views/home.json", ChangeKind::Modified),
            ])
            .await;
        assert_eq!(env.ctx.detector.open_count(), 1);

        // A follow-up edit on A is held back while the conflict is open.
        write_doc(&env, Side::A, "views/home.json", "third edit").await;
        worker
            .process_batch(vec![event(Side::A, "views/home.json", ChangeKind::Modified)])
            .await;

        assert_eq!(
            env.ctx
                .converters
                .b
                .convert_to_ir(&env.dir_b.join("views/home.json"))
                .await
                .unwrap(),
            doc("edit from b")
        );
        assert!(env
            .ctx
            .store
            .version_info(Side::B, Path::new("views/home.json"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_deletion_propagates_with_backup() {
        let env = build_env("bidirectional");
        let worker = QueueWorker::new(env.ctx.clone());
        let rel = Path::new("views/home.json");

        // Establish the pair and its snapshots first.
        write_doc(&env, Side::A, "views/home.json", "content").await;
        worker
            .process_batch(vec![event(Side::A, "views/home.json", ChangeKind::Modified)])
            .await;
        assert!(env.dir_b.join(rel).exists());

        tokio::fs::remove_file(env.dir_a.join(rel)).await.unwrap();
        worker
            .process_batch(vec![event(Side::A, "views/home.json", ChangeKind::Deleted)])
            .await;

        assert!(!env.dir_b.join(rel).exists());
        assert!(env.ctx.store.version_info(Side::A, rel).await.unwrap().is_none());
        assert!(env.ctx.store.version_info(Side::B, rel).await.unwrap().is_none());

        // The removed counterpart was backed up first.
        let backups = env.ctx.db.list_backups_for(&env.dir_b.join(rel)).unwrap();
        assert_eq!(backups.len(), 1);

        let snap = env.ctx.stats.snapshot();
        assert_eq!(snap.total_syncs, 2);
        assert_eq!(snap.succeeded, 2);
    }

    #[tokio::test]
    async fn test_conversion_timeout_is_reported() {
        struct StalledConverter;

        #[async_trait]
        impl SourceConverter for StalledConverter {
            fn framework(&self) -> &str {
                "stalled"
            }

            async fn convert_to_ir(&self, _path: &Path) -> Result<IrDocument, ConversionError> {
                tokio::time::sleep(Duration::from_secs(600)).await;
                Ok(doc("never"))
            }

            async fn generate_from_ir(
                &self,
                _ir: &IrDocument,
                _output_path: &Path,
            ) -> Result<(), ConversionError> {
                Ok(())
            }
        }

        let env = build_env_with("bidirectional", |_| Some(Arc::new(StalledConverter)));
        let worker = QueueWorker::new(env.ctx.clone());
        tokio::fs::create_dir_all(env.dir_a.join("views")).await.unwrap();
        tokio::fs::write(env.dir_a.join("views/home.json"), "{}")
            .await
            .unwrap();

        // Paused time lets the 1s conversion timeout fire instantly.
        tokio::time::pause();
        worker
            .process_batch(vec![event(Side::A, "views/home.json", ChangeKind::Modified)])
            .await;

        let snap = env.ctx.stats.snapshot();
        assert_eq!(snap.failed, 1);
        let log = env.ctx.db.recent_sync_log(5).unwrap();
        assert!(log[0].error.as_deref().unwrap_or("").contains("timed out"));
    }

    #[tokio::test]
    async fn test_queue_flushes_partial_batch_after_delay() {
        let env = build_env("bidirectional");
        write_doc(&env, Side::A, "views/home.json", "flush me").await;

        let (shutdown_tx, _) = broadcast::channel(1);
        let mut queue = ConversionQueue::start(env.ctx.clone(), shutdown_tx.subscribe());
        assert!(queue.enqueue(event(Side::A, "views/home.json", ChangeKind::Modified)));

        // One event is below batch_size, so only the inactivity timer
        // (50ms) can flush it.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(env.dir_b.join("views/home.json").exists());

        let _ = shutdown_tx.send(());
        assert!(queue.drain(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_drain_processes_buffered_events() {
        let env = build_env("bidirectional");
        write_doc(&env, Side::A, "one.json", "1").await;
        write_doc(&env, Side::A, "two.json", "2").await;

        let (shutdown_tx, _) = broadcast::channel(1);
        let mut queue = ConversionQueue::start(env.ctx.clone(), shutdown_tx.subscribe());
        queue.enqueue(event(Side::A, "one.json", ChangeKind::Modified));
        queue.enqueue(event(Side::A, "two.json", ChangeKind::Modified));

        // Stop immediately: the buffered events must still be converted.
        let _ = shutdown_tx.send(());
        assert!(queue.drain(Duration::from_secs(5)).await);

        assert!(env.dir_b.join("one.json").exists());
        assert!(env.dir_b.join("two.json").exists());
        assert!(!queue.enqueue(event(Side::A, "one.json", ChangeKind::Modified)));
    }

    #[test]
    fn test_collapse_keeps_latest_per_side_and_path() {
        let first = event(Side::A, "views/home.json", ChangeKind::Created);
        let second = event(Side::A, "views/home.json", ChangeKind::Modified);
        let other_side = event(Side::B, "views/home.json", ChangeKind::Modified);

        let collapsed = collapse_latest(vec![first, second.clone(), other_side.clone()]);
        assert_eq!(collapsed.len(), 2);
        assert_eq!(collapsed[0], second);
        assert_eq!(collapsed[1], other_side);
    }
}
