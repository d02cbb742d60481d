//! framesync core library.
//!
//! This crate provides the foundational components for bidirectional
//! synchronization of two UI source trees through a framework-agnostic
//! intermediate representation: configuration, filesystem watching,
//! conversion, the versioned IR store, conflict handling, database
//! persistence, and the sync session that ties them together.

pub mod backup;
pub mod config;
pub mod conflict;
pub mod convert;
pub mod db;
pub mod errors;
pub mod ir;
pub mod models;
pub mod queue;
pub mod session;
pub mod store;
pub mod watcher;

// Re-exports for convenience.
pub use config::AppConfig;
pub use convert::{ConverterSet, DocumentConverter, MirrorPairing, PairingConvention, SourceConverter};
pub use db::Database;
pub use errors::CoreError;
pub use session::SyncSession;
