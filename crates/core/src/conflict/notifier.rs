//! Conflict notification fanout.
//!
//! The [`ConflictNotifier`] pushes conflict lifecycle events to every
//! registered [`ConflictChannel`]. Channels are independent: one failing
//! delivery never blocks the rest, and the call only errors when every
//! channel failed. A bounded in-memory history backs status queries.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::NotifyError;

use super::detector::Conflict;

/// Events retained for `history()` queries.
const HISTORY_LIMIT: usize = 100;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Where in its lifecycle the conflict is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictEventKind {
    /// A new conflict was raised.
    Detected,
    /// An open conflict absorbed further edits.
    Updated,
    /// The conflict was resolved.
    Resolved,
}

impl std::fmt::Display for ConflictEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Detected => write!(f, "detected"),
            Self::Updated => write!(f, "updated"),
            Self::Resolved => write!(f, "resolved"),
        }
    }
}

/// A conflict lifecycle event as delivered to channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictEvent {
    pub conflict_id: String,
    pub file_a: PathBuf,
    pub file_b: PathBuf,
    pub detected_at: DateTime<Utc>,
    pub kind: ConflictEventKind,
}

impl ConflictEvent {
    pub fn detected(conflict: &Conflict) -> Self {
        Self::from_conflict(conflict, ConflictEventKind::Detected)
    }

    pub fn updated(conflict: &Conflict) -> Self {
        Self::from_conflict(conflict, ConflictEventKind::Updated)
    }

    pub fn resolved(conflict: &Conflict) -> Self {
        Self::from_conflict(conflict, ConflictEventKind::Resolved)
    }

    fn from_conflict(conflict: &Conflict, kind: ConflictEventKind) -> Self {
        Self {
            conflict_id: conflict.id.clone(),
            file_a: conflict.file_a.clone(),
            file_b: conflict.file_b.clone(),
            detected_at: conflict.detected_at,
            kind,
        }
    }
}

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

/// A delivery target for conflict events.
#[async_trait]
pub trait ConflictChannel: Send + Sync {
    /// Channel name used in logs when delivery fails.
    fn name(&self) -> &str;

    async fn deliver(&self, event: &ConflictEvent) -> Result<(), NotifyError>;
}

/// Writes conflict events to the tracing log.
pub struct LogChannel;

#[async_trait]
impl ConflictChannel for LogChannel {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, event: &ConflictEvent) -> Result<(), NotifyError> {
        match event.kind {
            ConflictEventKind::Resolved => info!(
                conflict_id = %event.conflict_id,
                file_a = %event.file_a.display(),
                file_b = %event.file_b.display(),
                "conflict resolved"
            ),
            _ => warn!(
                conflict_id = %event.conflict_id,
                file_a = %event.file_a.display(),
                file_b = %event.file_b.display(),
                kind = %event.kind,
                "conflict requires attention"
            ),
        }
        Ok(())
    }
}

/// Invokes an embedding-supplied callback for each event.
pub struct CallbackChannel {
    name: String,
    callback: Box<dyn Fn(&ConflictEvent) + Send + Sync>,
}

impl CallbackChannel {
    pub fn new(
        name: impl Into<String>,
        callback: impl Fn(&ConflictEvent) + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            callback: Box::new(callback),
        }
    }
}

#[async_trait]
impl ConflictChannel for CallbackChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, event: &ConflictEvent) -> Result<(), NotifyError> {
        (self.callback)(event);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Notifier
// ---------------------------------------------------------------------------

/// Fans conflict events out to registered channels and keeps a bounded
/// event history.
pub struct ConflictNotifier {
    channels: Mutex<Vec<Arc<dyn ConflictChannel>>>,
    history: Mutex<VecDeque<ConflictEvent>>,
}

impl ConflictNotifier {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(Vec::new()),
            history: Mutex::new(VecDeque::new()),
        }
    }

    pub fn register(&self, channel: Arc<dyn ConflictChannel>) {
        lock(&self.channels).push(channel);
    }

    pub fn channel_count(&self) -> usize {
        lock(&self.channels).len()
    }

    /// Deliver `event` to every channel. The event lands in history even
    /// if every delivery fails; individual failures are logged and only
    /// a total failure is reported to the caller.
    pub async fn notify_all(&self, event: ConflictEvent) -> Result<(), NotifyError> {
        {
            let mut history = lock(&self.history);
            history.push_back(event.clone());
            while history.len() > HISTORY_LIMIT {
                history.pop_front();
            }
        }

        // Snapshot under the lock; deliveries await without holding it.
        let channels: Vec<Arc<dyn ConflictChannel>> = lock(&self.channels).clone();
        if channels.is_empty() {
            return Ok(());
        }

        let mut delivered = 0usize;
        let mut failures = Vec::new();
        for channel in &channels {
            match channel.deliver(&event).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(
                        channel = channel.name(),
                        conflict_id = %event.conflict_id,
                        error = %e,
                        "notification delivery failed"
                    );
                    failures.push(format!("{}: {e}", channel.name()));
                }
            }
        }

        if delivered == 0 {
            return Err(NotifyError::AllChannelsFailed(failures.join("; ")));
        }
        Ok(())
    }

    /// Most recent events, newest first, up to `limit`.
    pub fn history(&self, limit: usize) -> Vec<ConflictEvent> {
        lock(&self.history)
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }
}

impl Default for ConflictNotifier {
    fn default() -> Self {
        Self::new()
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
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingChannel;

    #[async_trait]
    impl ConflictChannel for FailingChannel {
        fn name(&self) -> &str {
            "failing"
        }

        async fn deliver(&self, _event: &ConflictEvent) -> Result<(), NotifyError> {
            Err(NotifyError::ChannelFailed {
                channel: "failing".to_string(),
                detail: "socket closed".to_string(),
            })
        }
    }

    fn event(n: usize) -> ConflictEvent {
        ConflictEvent {
            conflict_id: format!("conflict-{n}"),
            file_a: PathBuf::from("/trees/a/views/home.json"),
            file_b: PathBuf::from("/trees/b/views/home.json"),
            detected_at: Utc::now(),
            kind: ConflictEventKind::Detected,
        }
    }

    #[tokio::test]
    async fn test_failing_channel_does_not_block_others() {
        let notifier = ConflictNotifier::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        notifier.register(Arc::new(FailingChannel));
        notifier.register(Arc::new(CallbackChannel::new("counter", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })));

        notifier.notify_all(event(1)).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_every_channel_failing_is_reported() {
        let notifier = ConflictNotifier::new();
        notifier.register(Arc::new(FailingChannel));
        notifier.register(Arc::new(FailingChannel));

        let result = notifier.notify_all(event(1)).await;
        assert!(matches!(result, Err(NotifyError::AllChannelsFailed(_))));

        // The event is still visible in history.
        assert_eq!(notifier.history(10).len(), 1);
    }

    #[tokio::test]
    async fn test_no_channels_is_ok() {
        let notifier = ConflictNotifier::new();
        notifier.notify_all(event(1)).await.unwrap();
        assert_eq!(notifier.history(10).len(), 1);
    }

    #[tokio::test]
    async fn test_history_is_bounded_and_newest_first() {
        let notifier = ConflictNotifier::new();
        for n in 0..105 {
            notifier.notify_all(event(n)).await.unwrap();
        }

        let recent = notifier.history(10);
        assert_eq!(recent.len(), 10);
        assert_eq!(recent[0].conflict_id, "conflict-104");
        assert_eq!(recent[9].conflict_id, "conflict-95");

        assert_eq!(notifier.history(500).len(), 100);
    }

    #[tokio::test]
    async fn test_log_channel_delivers() {
        let notifier = ConflictNotifier::new();
        notifier.register(Arc::new(LogChannel));
        assert_eq!(notifier.channel_count(), 1);
        notifier.notify_all(event(1)).await.unwrap();
    }
}
