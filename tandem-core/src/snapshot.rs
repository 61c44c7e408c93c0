//! Durable snapshot format.
//!
//! The stored `content` string is the JSON node tree with one extra field,
//! `crdt`, holding the base64 encoded replica state:
//!
//! ```json
//! {"type":"doc","content":[...],"crdt":"AQLk..."}
//! ```
//!
//! The node tree keeps the content readable by anything that understands the
//! editor's JSON. The replica state is what a new replica is hydrated from;
//! content without it (written before replication existed) is seeded from the
//! tree instead.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::model::DocumentTree;
use crate::schema::{JsonNode, SchemaError};

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("snapshot tree is invalid: {0}")]
    Schema(#[from] SchemaError),
    #[error("snapshot replica state is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// A complete serialization of one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub tree: DocumentTree,
    /// Full replica state (a v1 update from the empty state vector).
    pub state: Option<Vec<u8>>,
}

#[derive(Serialize, Deserialize)]
struct StoredContent {
    #[serde(flatten)]
    doc: JsonNode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    crdt: Option<String>,
}

impl Snapshot {
    /// Tree-only snapshot; a replica created from it seeds the tree.
    pub fn from_tree(tree: DocumentTree) -> Self {
        Self { tree, state: None }
    }

    pub fn to_content(&self) -> Result<String, SnapshotError> {
        let stored = StoredContent {
            doc: self.tree.to_json(),
            crdt: self.state.as_deref().map(|state| STANDARD.encode(state)),
        };
        Ok(serde_json::to_string(&stored)?)
    }

    /// Parses stored content. Empty content is a fresh document.
    pub fn from_content(content: &str) -> Result<Self, SnapshotError> {
        if content.trim().is_empty() {
            return Ok(Self::from_tree(DocumentTree::empty()));
        }
        let stored: StoredContent = serde_json::from_str(content)?;
        let tree = DocumentTree::from_json(&stored.doc)?;
        let state = stored.crdt.map(|crdt| STANDARD.decode(crdt)).transpose()?;
        Ok(Self { tree, state })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Block, TextRun, Marks};

    #[test]
    fn test_content_roundtrip_keeps_state() {
        let snapshot = Snapshot {
            tree: DocumentTree::new(vec![Block::Paragraph(vec![
                TextRun::plain("a "),
                TextRun::styled("b", Marks::bold()),
            ])])
            .unwrap(),
            state: Some(vec![1, 2, 3, 250]),
        };
        let content = snapshot.to_content().unwrap();
        assert!(content.contains(r#""crdt":"#));
        assert_eq!(Snapshot::from_content(&content).unwrap(), snapshot);
    }

    #[test]
    fn test_plain_node_json_is_readable() {
        let content = r#"{"type":"doc","content":[{"type":"paragraph","content":[{"type":"text","text":"old note"}]}]}"#;
        let snapshot = Snapshot::from_content(content).unwrap();
        assert_eq!(snapshot.state, None);
        assert_eq!(snapshot.tree.plain_text(), "old note");
    }

    #[test]
    fn test_empty_content_is_fresh_document() {
        let snapshot = Snapshot::from_content("").unwrap();
        assert_eq!(snapshot.tree, DocumentTree::empty());
        assert_eq!(snapshot.state, None);
    }

    #[test]
    fn test_bad_content_rejected() {
        assert!(matches!(Snapshot::from_content("{"), Err(SnapshotError::Json(_))));
        assert!(matches!(
            Snapshot::from_content(r#"{"type":"doc","crdt":"***"}"#),
            Err(SnapshotError::Base64(_))
        ));
        assert!(matches!(
            Snapshot::from_content(r#"{"type":"doc","content":[{"type":"video"}]}"#),
            Err(SnapshotError::Schema(_))
        ));
    }
}
