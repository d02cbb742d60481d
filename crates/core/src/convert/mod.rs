//! Converter and pairing seams.
//!
//! The engine never understands framework source itself. It drives a pair
//! of [`SourceConverter`]s supplied by the embedding application, one per
//! side, and a [`PairingConvention`] that maps a file on one side to its
//! counterpart on the other.

mod document;

pub use document::DocumentConverter;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ConvertersConfig;
use crate::errors::ConversionError;
use crate::ir::IrDocument;
use crate::models::Side;

// ---------------------------------------------------------------------------
// Converter seam
// ---------------------------------------------------------------------------

/// Parses framework source into the shared IR and renders it back out.
///
/// Both directions must be deterministic for unchanged input; the engine
/// relies on that to avoid feedback loops between the two trees.
#[async_trait]
pub trait SourceConverter: Send + Sync {
    /// Framework label used in logs and generated-file envelopes.
    fn framework(&self) -> &str;

    /// Parse the source file at `path` into an IR document.
    async fn convert_to_ir(&self, path: &Path) -> Result<IrDocument, ConversionError>;

    /// Render `ir` as framework source at `output_path`, creating parent
    /// directories as needed.
    async fn generate_from_ir(
        &self,
        ir: &IrDocument,
        output_path: &Path,
    ) -> Result<(), ConversionError>;
}

/// The two converters driving a session, keyed by side.
#[derive(Clone)]
pub struct ConverterSet {
    pub a: Arc<dyn SourceConverter>,
    pub b: Arc<dyn SourceConverter>,
}

impl ConverterSet {
    pub fn new(a: Arc<dyn SourceConverter>, b: Arc<dyn SourceConverter>) -> Self {
        Self { a, b }
    }

    pub fn for_side(&self, side: Side) -> &Arc<dyn SourceConverter> {
        match side {
            Side::A => &self.a,
            Side::B => &self.b,
        }
    }
}

// ---------------------------------------------------------------------------
// Pairing
// ---------------------------------------------------------------------------

/// Maps a side-relative path to its counterpart on the opposite side.
pub trait PairingConvention: Send + Sync {
    /// Counterpart of `rel_path` on the other side, or `None` when the
    /// file has no pair and should sync one-way without conflict checks.
    fn counterpart(&self, side: Side, rel_path: &Path) -> Option<PathBuf>;
}

/// Same relative path on both sides, differing only in file extension.
pub struct MirrorPairing {
    ext_a: String,
    ext_b: String,
}

impl MirrorPairing {
    pub fn new(ext_a: impl Into<String>, ext_b: impl Into<String>) -> Self {
        Self {
            ext_a: ext_a.into(),
            ext_b: ext_b.into(),
        }
    }

    pub fn from_config(config: &ConvertersConfig) -> Self {
        Self::new(config.ext_a.clone(), config.ext_b.clone())
    }
}

impl PairingConvention for MirrorPairing {
    fn counterpart(&self, side: Side, rel_path: &Path) -> Option<PathBuf> {
        let (own, other) = match side {
            Side::A => (&self.ext_a, &self.ext_b),
            Side::B => (&self.ext_b, &self.ext_a),
        };
        let ext = rel_path.extension()?.to_str()?;
        if ext != own.as_str() {
            return None;
        }
        Some(rel_path.with_extension(other.as_str()))
    }
}
