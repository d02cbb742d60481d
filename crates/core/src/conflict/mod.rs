//! Conflict detection, resolution, and notification.
//!
//! The conflict subsystem is responsible for:
//! 1. **Detection** -- correlating near-simultaneous edits to both files of
//!    a pair into exactly one open conflict.
//! 2. **Resolution** -- applying a decision (prefer one side, manual merge,
//!    skip) with backups before anything destructive.
//! 3. **Notification** -- fanning lifecycle events out to registered
//!    channels and keeping a bounded history.

pub mod detector;
pub mod notifier;
pub mod resolver;

pub use detector::{Conflict, ConflictDetector, ConflictStatus, Observation};
pub use notifier::{
    CallbackChannel, ConflictChannel, ConflictEvent, ConflictEventKind, ConflictNotifier,
    LogChannel,
};
pub use resolver::{ConflictResolver, ResolutionOption, ResolutionOutcome};
