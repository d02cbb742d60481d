//! The framework-agnostic intermediate representation.
//!
//! An [`IrDocument`] is the pivot format between the two source trees: a
//! tree of [`IrNode`]s describing UI structure plus a flat state map.
//! Converters produce and consume these; the IR store persists them as
//! versioned snapshots.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::Side;

// ---------------------------------------------------------------------------
// IR tree
// ---------------------------------------------------------------------------

/// One node in the IR tree.
///
/// `kind` names the abstract widget or construct ("container", "button",
/// "text", ...); `props` carries its attributes as arbitrary JSON values.
/// `BTreeMap` keeps the serialized form deterministic, so two structurally
/// equal documents serialize byte-identically.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IrNode {
    pub kind: String,
    #[serde(default)]
    pub props: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub children: Vec<IrNode>,
}

impl IrNode {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            props: BTreeMap::new(),
            children: Vec::new(),
        }
    }

    pub fn with_prop(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.props.insert(key.into(), value);
        self
    }

    pub fn with_child(mut self, child: IrNode) -> Self {
        self.children.push(child);
        self
    }

    /// Total node count including this node.
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(IrNode::node_count).sum::<usize>()
    }
}

/// A complete IR document for one source file: the widget tree plus
/// document-level state (bindings, handlers, metadata).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IrDocument {
    pub root: IrNode,
    #[serde(default)]
    pub state: BTreeMap<String, serde_json::Value>,
}

impl IrDocument {
    pub fn new(root: IrNode) -> Self {
        Self {
            root,
            state: BTreeMap::new(),
        }
    }

    pub fn with_state(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.state.insert(key.into(), value);
        self
    }
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// A versioned IR snapshot as persisted by the store.
///
/// Owned exclusively by [`crate::store::IrStore`]: one current snapshot per
/// (side, path) key, version strictly increasing across successful writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IrSnapshot {
    /// Path relative to the side's root directory.
    pub path: String,
    pub side: Side,
    pub version: u64,
    pub content: IrDocument,
    pub generated_at: DateTime<Utc>,
    /// Which side's edit this snapshot originated from. Differs from
    /// `side` when the snapshot was written for a generated file.
    pub origin_side: Side,
}

/// Version and timestamp of a snapshot, without the full content.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionInfo {
    pub version: u64,
    pub generated_at: DateTime<Utc>,
    pub origin_side: Side,
}
