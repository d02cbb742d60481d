//! Session facade over the watchers, the conversion queue, and the
//! conflict resolver for one configured pair of trees.
//!
//! A session holds no global state: several can coexist in one process
//! as long as their storage and backup directories are distinct.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::backup::BackupManager;
use crate::config::AppConfig;
use crate::conflict::{
    Conflict, ConflictChannel, ConflictDetector, ConflictEvent, ConflictNotifier,
    ConflictResolver, ConflictStatus, LogChannel, ResolutionOption, ResolutionOutcome,
};
use crate::convert::{ConverterSet, PairingConvention};
use crate::db::Database;
use crate::errors::{ConflictResolutionError, DatabaseError, SessionError};
use crate::models::{Side, StatsSnapshot, StatusEvent, SyncStats, SyncStatus};
use crate::queue::{ConversionQueue, SyncContext};
use crate::store::IrStore;
use crate::watcher::{ChangeWatcher, WriteSuppressor};

/// How long `stop` waits for in-flight conversions before aborting them.
const STOP_GRACE: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One bidirectional (or one-way) sync between two source trees.
///
/// Construct with [`SyncSession::new`], then [`start`] to begin watching
/// and [`stop`] to drain and release. Dropping a running session
/// detaches its tasks without draining; call [`stop`] first.
///
/// [`start`]: Self::start
/// [`stop`]: Self::stop
pub struct SyncSession {
    ctx: Arc<SyncContext>,
    resolver: ConflictResolver,
    runtime: Option<SessionRuntime>,
}

/// Everything that only exists while the session is running.
struct SessionRuntime {
    watcher_shutdown: broadcast::Sender<()>,
    queue_shutdown: broadcast::Sender<()>,
    watchers: Vec<ChangeWatcher>,
    queue: ConversionQueue,
}

impl SyncSession {
    /// Wire a session from its parts. Creates the IR store and backup
    /// directories; configuration itself is validated by [`start`].
    ///
    /// [`start`]: Self::start
    pub fn new(
        config: AppConfig,
        converters: ConverterSet,
        pairing: Arc<dyn PairingConvention>,
        db: Database,
    ) -> Result<Self, SessionError> {
        let db = Arc::new(db);
        let store = Arc::new(IrStore::new(&config.storage.dir)?);
        let backups = Arc::new(BackupManager::new(config.backup.clone(), db.clone())?);
        let suppressor = Arc::new(WriteSuppressor::from_config(&config.sync));
        let detector = ConflictDetector::new(&config.sync, db.clone());
        let notifier = ConflictNotifier::new();
        notifier.register(Arc::new(LogChannel));

        let resolver = ConflictResolver::new(
            &config.sync,
            db.clone(),
            store.clone(),
            converters.clone(),
            backups.clone(),
            suppressor.clone(),
        );

        let (status_tx, _) = broadcast::channel(64);
        let ctx = Arc::new(SyncContext {
            config,
            converters,
            pairing,
            db,
            store,
            backups,
            suppressor,
            detector,
            notifier,
            stats: SyncStats::new(),
            status_tx,
            current_status: Mutex::new(SyncStatus::Idle),
        });

        Ok(Self {
            ctx,
            resolver,
            runtime: None,
        })
    }

    /// Validate configuration, restore conflicts left open by a previous
    /// run, and spawn the queue worker plus the watcher(s) the mode calls
    /// for. Fails before installing anything if the configuration is bad.
    pub async fn start(&mut self) -> Result<(), SessionError> {
        if self.runtime.is_some() {
            return Err(SessionError::AlreadyRunning);
        }
        self.ctx.config.validate()?;

        // Manual merges and unanswered conflicts span restarts.
        let open = self.ctx.db.unresolved_conflicts()?;
        if !open.is_empty() {
            warn!(
                count = open.len(),
                "restoring unresolved conflicts from previous run"
            );
            self.ctx.detector.restore_open(&open);
        }

        let mode = self.ctx.config.sync.mode;
        info!(
            mode = %mode,
            dir_a = %self.ctx.config.sync.dir_a.display(),
            dir_b = %self.ctx.config.sync.dir_b.display(),
            "starting sync session"
        );

        let (watcher_shutdown, _) = broadcast::channel(4);
        let (queue_shutdown, _) = broadcast::channel(4);
        let mut queue = ConversionQueue::start(self.ctx.clone(), queue_shutdown.subscribe());
        let sender = queue.sender();

        let mut watchers: Vec<ChangeWatcher> = Vec::new();
        for side in [Side::A, Side::B] {
            if !mode.watches(side) {
                continue;
            }
            let mut watcher = ChangeWatcher::new(
                side,
                self.ctx.config.dir_for(side),
                &self.ctx.config.sync,
                self.ctx.suppressor.clone(),
            );
            if let Err(e) = watcher.start(sender.clone(), watcher_shutdown.subscribe()) {
                // Unwind the half-started runtime before reporting.
                let _ = watcher_shutdown.send(());
                for started in &mut watchers {
                    started.join().await;
                }
                let _ = queue_shutdown.send(());
                queue.drain(Duration::from_secs(1)).await;
                return Err(e.into());
            }
            watchers.push(watcher);
        }

        let status = if self.ctx.detector.open_count() > 0 {
            SyncStatus::Conflict
        } else {
            SyncStatus::Watching
        };
        self.ctx.emit(StatusEvent::new(status));
        let _ = self.ctx.db.set_state("session_status", &status.to_string());

        self.runtime = Some(SessionRuntime {
            watcher_shutdown,
            queue_shutdown,
            watchers,
            queue,
        });
        Ok(())
    }

    /// Stop watching and drain in-flight work. Watchers flush their
    /// debounce buffers into the queue before the queue itself is asked
    /// to finish, so a stop never abandons a buffered edit. Idempotent.
    pub async fn stop(&mut self) {
        let Some(mut runtime) = self.runtime.take() else {
            return;
        };
        info!("stopping sync session");

        let _ = runtime.watcher_shutdown.send(());
        for watcher in &mut runtime.watchers {
            watcher.join().await;
        }

        let _ = runtime.queue_shutdown.send(());
        if !runtime.queue.drain(STOP_GRACE).await {
            warn!("conversion queue did not drain cleanly");
        }

        let snapshot = self.ctx.stats.snapshot();
        let _ = self.ctx.db.set_state("session_status", "idle");
        let _ = self
            .ctx
            .db
            .set_state("last_activity_at", &chrono::Utc::now().to_rfc3339());
        if let Ok(counters) = serde_json::to_string(&snapshot) {
            let _ = self.ctx.db.set_state("final_stats", &counters);
        }
        self.ctx.emit(StatusEvent::new(SyncStatus::Idle));
        info!(
            total = snapshot.total_syncs,
            succeeded = snapshot.succeeded,
            failed = snapshot.failed,
            conflicts = snapshot.conflicts_detected,
            "sync session stopped"
        );
    }

    // -- observation --------------------------------------------------------

    /// Subscribe to status transitions and per-file error events.
    pub fn on_status_update(&self) -> broadcast::Receiver<StatusEvent> {
        self.ctx.status_tx.subscribe()
    }

    /// Register an additional conflict notification channel. A logging
    /// channel is always installed.
    pub fn on_conflict(&self, channel: Arc<dyn ConflictChannel>) {
        self.ctx.notifier.register(channel);
    }

    /// The status carried by the most recent event.
    pub fn status(&self) -> SyncStatus {
        self.ctx.status()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.ctx.stats.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.runtime.is_some()
    }

    pub fn unresolved_conflicts(&self) -> Result<Vec<Conflict>, DatabaseError> {
        self.ctx.db.unresolved_conflicts()
    }

    /// Recent conflict notifications, newest first.
    pub fn conflict_history(&self, limit: usize) -> Vec<ConflictEvent> {
        self.ctx.notifier.history(limit)
    }

    // -- resolution ---------------------------------------------------------

    /// Apply a resolution decision to an open conflict. Prefer-A/B
    /// regenerate the losing side from the winner, `ManualMerge` parks
    /// the conflict until [`confirm_merge`], `Skip` closes it without
    /// touching either file.
    ///
    /// [`confirm_merge`]: Self::confirm_merge
    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        option: ResolutionOption,
    ) -> Result<ResolutionOutcome, ConflictResolutionError> {
        let outcome = self.resolver.resolve(conflict_id, option).await?;
        self.settle(conflict_id).await;
        Ok(outcome)
    }

    /// Complete a parked manual merge by re-importing both hand-edited
    /// files.
    pub async fn confirm_merge(
        &self,
        conflict_id: &str,
    ) -> Result<ResolutionOutcome, ConflictResolutionError> {
        let outcome = self.resolver.confirm_merge(conflict_id).await?;
        self.settle(conflict_id).await;
        Ok(outcome)
    }

    /// Post-resolution bookkeeping: release the pair, notify, and return
    /// to WATCHING when the last open conflict closes.
    async fn settle(&self, conflict_id: &str) {
        let Ok(Some(conflict)) = self.ctx.db.get_conflict(conflict_id) else {
            return;
        };
        if conflict.status != ConflictStatus::Resolved {
            // Parked for manual merge; the pair stays held back.
            return;
        }
        self.ctx.detector.close(&conflict.file_a);
        self.ctx.stats.record_conflict_resolved();
        if let Err(e) = self
            .ctx
            .notifier
            .notify_all(ConflictEvent::resolved(&conflict))
            .await
        {
            warn!(conflict_id = %conflict.id, error = %e, "conflict notification failed");
        }
        if self.is_running() && self.ctx.detector.open_count() == 0 {
            self.ctx.emit(StatusEvent::new(SyncStatus::Watching));
            let _ = self.ctx.db.set_state("session_status", "watching");
        }
    }
}
