//! Built-in converter for JSON document files.
//!
//! Each file is a small envelope naming its framework and carrying the IR
//! root inline. This is the format the daemon uses out of the box; real
//! framework parsers plug in through [`SourceConverter`] instead.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::ConversionError;
use crate::ir::{IrDocument, IrNode};

use super::SourceConverter;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    framework: String,
    root: IrNode,
    #[serde(default)]
    state: BTreeMap<String, serde_json::Value>,
}

/// Converter for `{"framework", "root", "state"}` JSON documents.
pub struct DocumentConverter {
    framework: String,
}

impl DocumentConverter {
    pub fn new(framework: impl Into<String>) -> Self {
        Self {
            framework: framework.into(),
        }
    }
}

#[async_trait]
impl SourceConverter for DocumentConverter {
    fn framework(&self) -> &str {
        &self.framework
    }

    async fn convert_to_ir(&self, path: &Path) -> Result<IrDocument, ConversionError> {
        let raw = tokio::fs::read_to_string(path).await?;
        let envelope: Envelope =
            serde_json::from_str(&raw).map_err(|e| ConversionError::InvalidEnvelope {
                path: path.display().to_string(),
                detail: e.to_string(),
            })?;
        if envelope.framework != self.framework {
            return Err(ConversionError::InvalidEnvelope {
                path: path.display().to_string(),
                detail: format!(
                    "expected framework '{}', found '{}'",
                    self.framework, envelope.framework
                ),
            });
        }
        debug!(path = %path.display(), framework = %self.framework, "parsed document");
        Ok(IrDocument {
            root: envelope.root,
            state: envelope.state,
        })
    }

    async fn generate_from_ir(
        &self,
        ir: &IrDocument,
        output_path: &Path,
    ) -> Result<(), ConversionError> {
        let envelope = Envelope {
            framework: self.framework.clone(),
            root: ir.root.clone(),
            state: ir.state.clone(),
        };
        let rendered =
            serde_json::to_string_pretty(&envelope).map_err(|e| ConversionError::Failed {
                path: output_path.display().to_string(),
                detail: e.to_string(),
            })?;
        if let Some(parent) = output_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(output_path, rendered).await?;
        debug!(path = %output_path.display(), framework = %self.framework, "generated document");
        Ok(())
    }
}
