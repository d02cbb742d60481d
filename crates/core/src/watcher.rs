//! Filesystem watching for one side of a sync pair.
//!
//! Raw notify events are bridged onto a tokio channel and debounced per
//! path: a burst of saves to one file collapses into a single
//! [`ChangeEvent`] carrying the latest timestamp and the path relative
//! to the tree root. Events caused by the engine's own writes are
//! dropped via the shared [`WriteSuppressor`] so regeneration never
//! feeds back into the pipeline.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use notify::{recommended_watcher, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::SyncConfig;
use crate::errors::WatchError;
use crate::models::{ChangeEvent, ChangeKind, Side};

// ---------------------------------------------------------------------------
// Self-write suppression
// ---------------------------------------------------------------------------

/// Remembers paths the engine itself just wrote (or deleted), so the
/// watcher can drop the filesystem events those writes produce.
///
/// Entries expire after a TTL rather than being consumed, because one
/// write can surface as several backend events (create + data change).
pub struct WriteSuppressor {
    ttl: Duration,
    recent: Mutex<HashMap<PathBuf, Instant>>,
}

impl WriteSuppressor {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            recent: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(Duration::from_millis(config.suppression_ttl_ms))
    }

    /// Mark a path the engine is writing or deleting right now.
    pub fn record(&self, path: &Path) {
        let key = canonical_key(path);
        let mut recent = self.lock();
        let now = Instant::now();
        recent.retain(|_, at| now.duration_since(*at) < self.ttl);
        recent.insert(key, now);
    }

    /// Whether an event for `path` should be dropped as a self-write.
    pub fn is_suppressed(&self, path: &Path) -> bool {
        let key = canonical_key(path);
        let mut recent = self.lock();
        let now = Instant::now();
        recent.retain(|_, at| now.duration_since(*at) < self.ttl);
        recent.contains_key(&key)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, Instant>> {
        match self.recent.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Resolve symlinks so recorded writes and backend-reported events key
/// identically. A deleted file canonicalizes through its parent.
fn canonical_key(path: &Path) -> PathBuf {
    if let Ok(real) = std::fs::canonicalize(path) {
        return real;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => std::fs::canonicalize(parent)
            .map(|p| p.join(name))
            .unwrap_or_else(|_| path.to_path_buf()),
        _ => path.to_path_buf(),
    }
}

// ---------------------------------------------------------------------------
// Debounce buffer
// ---------------------------------------------------------------------------

struct PendingChange {
    kind: ChangeKind,
    last_seen: Instant,
    latest: DateTime<Utc>,
}

/// Per-path trailing-edge debounce with kind netting.
struct DebounceBuffer {
    window: Duration,
    pending: HashMap<PathBuf, PendingChange>,
}

impl DebounceBuffer {
    fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
        }
    }

    /// Fold a raw change into the buffer, restarting that path's quiet
    /// window.
    fn observe(&mut self, path: PathBuf, kind: ChangeKind, now: Instant) {
        match self.pending.remove(&path) {
            None => {
                self.pending.insert(
                    path,
                    PendingChange {
                        kind,
                        last_seen: now,
                        latest: Utc::now(),
                    },
                );
            }
            Some(prev) => {
                if let Some(netted) = net_kinds(prev.kind, kind) {
                    self.pending.insert(
                        path,
                        PendingChange {
                            kind: netted,
                            last_seen: now,
                            latest: Utc::now(),
                        },
                    );
                }
                // A create followed by a delete within one window cancels
                // out entirely.
            }
        }
    }

    /// Earliest instant at which some path's window closes.
    fn next_deadline(&self) -> Option<Instant> {
        self.pending
            .values()
            .map(|p| p.last_seen + self.window)
            .min()
    }

    /// Remove and return every path whose quiet window has closed.
    fn take_expired(&mut self, now: Instant) -> Vec<(PathBuf, ChangeKind, DateTime<Utc>)> {
        let expired: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.last_seen) >= self.window)
            .map(|(path, _)| path.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|path| {
                self.pending
                    .remove(&path)
                    .map(|p| (path, p.kind, p.latest))
            })
            .collect()
    }

    /// Flush everything regardless of deadlines (used on shutdown).
    fn drain_all(&mut self) -> Vec<(PathBuf, ChangeKind, DateTime<Utc>)> {
        self.pending
            .drain()
            .map(|(path, p)| (path, p.kind, p.latest))
            .collect()
    }

    fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Combine two changes to the same path seen within one debounce window.
/// `None` means the pair cancels out.
fn net_kinds(old: ChangeKind, new: ChangeKind) -> Option<ChangeKind> {
    match (old, new) {
        (ChangeKind::Created, ChangeKind::Deleted) => None,
        (ChangeKind::Created, _) => Some(ChangeKind::Created),
        (ChangeKind::Deleted, ChangeKind::Created) => Some(ChangeKind::Modified),
        (ChangeKind::Deleted, ChangeKind::Modified) => Some(ChangeKind::Modified),
        (ChangeKind::Modified, ChangeKind::Deleted) => Some(ChangeKind::Deleted),
        (ChangeKind::Modified, _) => Some(ChangeKind::Modified),
        (ChangeKind::Deleted, ChangeKind::Deleted) => Some(ChangeKind::Deleted),
    }
}

fn change_kind(kind: &EventKind) -> Option<ChangeKind> {
    match kind {
        EventKind::Create(_) => Some(ChangeKind::Created),
        EventKind::Modify(_) => Some(ChangeKind::Modified),
        EventKind::Remove(_) => Some(ChangeKind::Deleted),
        _ => None,
    }
}

/// Test a root-relative path against include/exclude globs. An empty
/// include list admits everything.
fn matches_filters(rel: &Path, include: &[String], exclude: &[String]) -> bool {
    let path = rel.to_string_lossy().replace('\\', "/");
    if exclude.iter().any(|pat| glob_match::glob_match(pat, &path)) {
        return false;
    }
    include.is_empty() || include.iter().any(|pat| glob_match::glob_match(pat, &path))
}

// ---------------------------------------------------------------------------
// Watcher
// ---------------------------------------------------------------------------

/// Watches one tree root and emits debounced [`ChangeEvent`]s with
/// root-relative paths.
pub struct ChangeWatcher {
    side: Side,
    root: PathBuf,
    debounce: Duration,
    include: Vec<String>,
    exclude: Vec<String>,
    suppressor: Arc<WriteSuppressor>,
    task: Option<JoinHandle<()>>,
}

impl ChangeWatcher {
    pub fn new(
        side: Side,
        root: impl Into<PathBuf>,
        config: &SyncConfig,
        suppressor: Arc<WriteSuppressor>,
    ) -> Self {
        Self {
            side,
            root: root.into(),
            debounce: Duration::from_millis(config.debounce_ms),
            include: config.include_patterns.clone(),
            exclude: config.exclude_patterns.clone(),
            suppressor,
            task: None,
        }
    }

    /// Install the OS watch and spawn the debounce pump. Events flow into
    /// `events` until `shutdown` fires; anything still buffered at that
    /// point is flushed before the task exits.
    pub fn start(
        &mut self,
        events: mpsc::UnboundedSender<ChangeEvent>,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<(), WatchError> {
        if self.task.is_some() {
            return Err(WatchError::AlreadyStarted);
        }
        if !self.root.exists() {
            return Err(WatchError::RootNotFound(self.root.display().to_string()));
        }

        // Canonicalize so backend paths (already resolved by the OS)
        // strip cleanly against the root.
        let root = std::fs::canonicalize(&self.root).unwrap_or_else(|_| self.root.clone());

        let (raw_tx, raw_rx) = mpsc::unbounded_channel::<notify::Result<notify::Event>>();
        let mut watcher: RecommendedWatcher = recommended_watcher(move |res| {
            let _ = raw_tx.send(res);
        })?;
        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|e| WatchError::InstallFailed {
                path: root.display().to_string(),
                detail: e.to_string(),
            })?;

        info!(side = %self.side, root = %root.display(), "watching tree");
        let pump = Pump {
            side: self.side,
            root,
            window: self.debounce,
            include: self.include.clone(),
            exclude: self.exclude.clone(),
            suppressor: self.suppressor.clone(),
        };
        self.task = Some(tokio::spawn(pump.run(watcher, raw_rx, events, shutdown)));
        Ok(())
    }

    /// Wait for the pump task to finish after shutdown has been signalled.
    pub async fn join(&mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

/// The spawned half of a [`ChangeWatcher`]: folds raw backend events into
/// the debounce buffer and emits whatever falls due.
struct Pump {
    side: Side,
    root: PathBuf,
    window: Duration,
    include: Vec<String>,
    exclude: Vec<String>,
    suppressor: Arc<WriteSuppressor>,
}

impl Pump {
    async fn run(
        self,
        _watcher: RecommendedWatcher,
        mut raw_rx: mpsc::UnboundedReceiver<notify::Result<notify::Event>>,
        events: mpsc::UnboundedSender<ChangeEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut buffer = DebounceBuffer::new(self.window);

        loop {
            let received = match buffer.next_deadline() {
                None => tokio::select! {
                    _ = shutdown.recv() => break,
                    raw = raw_rx.recv() => Some(raw),
                },
                Some(deadline) => tokio::select! {
                    _ = shutdown.recv() => break,
                    raw = raw_rx.recv() => Some(raw),
                    _ = tokio::time::sleep_until(deadline) => None,
                },
            };

            match received {
                // Backend hung up; nothing more will arrive.
                Some(None) => break,
                Some(Some(Err(err))) => {
                    warn!(side = %self.side, error = %err, "watch backend error");
                }
                Some(Some(Ok(event))) => {
                    let Some(kind) = change_kind(&event.kind) else {
                        continue;
                    };
                    for path in event.paths {
                        if let Some(rel) = self.admit(&path) {
                            buffer.observe(rel, kind, Instant::now());
                        }
                    }
                }
                None => {
                    for (path, kind, at) in buffer.take_expired(Instant::now()) {
                        debug!(side = %self.side, path = %path.display(), kind = %kind, "change detected");
                        if events
                            .send(ChangeEvent {
                                path,
                                side: self.side,
                                timestamp: at,
                                kind,
                            })
                            .is_err()
                        {
                            return;
                        }
                    }
                }
            }
        }

        // Flush what is still buffered so a stop never loses edits.
        for (path, kind, at) in buffer.drain_all() {
            let _ = events.send(ChangeEvent {
                path,
                side: self.side,
                timestamp: at,
                kind,
            });
        }
    }

    /// Admit a backend path, returning its root-relative form. Suppression
    /// is keyed on the absolute path because that is what was recorded.
    fn admit(&self, path: &Path) -> Option<PathBuf> {
        if path.is_dir() {
            return None;
        }
        let rel = path.strip_prefix(&self.root).ok()?;
        if !matches_filters(rel, &self.include, &self.exclude) {
            return None;
        }
        if self.suppressor.is_suppressed(path) {
            trace!(side = %self.side, path = %path.display(), "dropping self-write event");
            return None;
        }
        Some(rel.to_path_buf())
    }
}
