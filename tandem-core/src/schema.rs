//! Node vocabulary and the JSON node/mark format.
//!
//! Node and mark names follow the ProseMirror/tiptap vocabulary so stored
//! content stays readable by the browser editor:
//!
//! ```json
//! {"type":"doc","content":[
//!   {"type":"heading","attrs":{"level":1},"content":[{"type":"text","text":"Notes"}]},
//!   {"type":"paragraph","content":[
//!     {"type":"text","text":"Hello","marks":[{"type":"bold"}]}
//!   ]}
//! ]}
//! ```
//!
//! Conversion into the typed tree is strict for nodes: unknown node types and
//! misplaced children are errors. Unknown marks are dropped with a warning so
//! content written by richer editors still opens.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::model::{
    Block, DocumentTree, HeadingLevel, ListItem, Marks, ModelError, TableCell, TableRow, TextRun,
};

pub const DOC: &str = "doc";
pub const PARAGRAPH: &str = "paragraph";
pub const HEADING: &str = "heading";
pub const BULLET_LIST: &str = "bulletList";
pub const ORDERED_LIST: &str = "orderedList";
pub const LIST_ITEM: &str = "listItem";
pub const TABLE: &str = "table";
pub const TABLE_ROW: &str = "tableRow";
pub const TABLE_CELL: &str = "tableCell";
pub const TABLE_HEADER: &str = "tableHeader";
pub const IMAGE: &str = "image";
pub const TEXT: &str = "text";

pub const ATTR_LEVEL: &str = "level";
pub const ATTR_SRC: &str = "src";
pub const ATTR_COLOR: &str = "color";

/// Mark name used by tiptap for the text color style.
const TEXT_STYLE: &str = "textStyle";

/// Schema violations found while reading a tree from an untyped source.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error("unknown node type '{0}'")]
    UnknownNode(String),
    #[error("'{child}' is not allowed inside '{parent}'")]
    UnexpectedChild { parent: String, child: String },
    #[error("'{node}' is missing attribute '{attr}'")]
    MissingAttribute { node: &'static str, attr: &'static str },
    #[error("'{node}' has an invalid '{attr}' attribute")]
    InvalidAttribute { node: &'static str, attr: &'static str },
    #[error("unknown mark '{0}'")]
    UnknownMark(String),
    #[error("invalid value for mark '{0}'")]
    InvalidMark(String),
    #[error("'{0}' must hold exactly one text node")]
    MalformedTextBlock(String),
    #[error("foreign content in the replicated tree: {0}")]
    ForeignContent(String),
    #[error("{0}")]
    Model(#[from] ModelError),
}

/// One node of the JSON format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonNode {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attrs: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<JsonNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub marks: Vec<JsonMark>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonMark {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attrs: Option<Map<String, Value>>,
}

impl JsonNode {
    fn element(kind: &str, content: Vec<JsonNode>) -> Self {
        Self {
            kind: kind.to_string(),
            attrs: None,
            content,
            text: None,
            marks: Vec::new(),
        }
    }

    fn with_attr(mut self, key: &str, value: Value) -> Self {
        self.attrs
            .get_or_insert_with(Map::new)
            .insert(key.to_string(), value);
        self
    }

    fn attr(&self, key: &str) -> Option<&Value> {
        self.attrs.as_ref().and_then(|attrs| attrs.get(key))
    }

    fn unexpected(&self, parent: &str) -> SchemaError {
        SchemaError::UnexpectedChild {
            parent: parent.to_string(),
            child: self.kind.clone(),
        }
    }
}

// ─── Typed tree → JSON ────────────────────────────────────────────────

impl DocumentTree {
    pub fn to_json(&self) -> JsonNode {
        JsonNode::element(DOC, self.blocks().iter().map(block_to_json).collect())
    }

    pub fn from_json(node: &JsonNode) -> Result<Self, SchemaError> {
        if node.kind != DOC {
            return Err(SchemaError::UnknownNode(node.kind.clone()));
        }
        let blocks = blocks_from_json(&node.content, DOC)?;
        Ok(DocumentTree::new(blocks)?)
    }
}

fn block_to_json(block: &Block) -> JsonNode {
    match block {
        Block::Paragraph(runs) => JsonNode::element(PARAGRAPH, runs_to_json(runs)),
        Block::Heading { level, runs } => JsonNode::element(HEADING, runs_to_json(runs))
            .with_attr(ATTR_LEVEL, Value::from(level.get())),
        Block::BulletList(items) => JsonNode::element(BULLET_LIST, items_to_json(items)),
        Block::OrderedList(items) => JsonNode::element(ORDERED_LIST, items_to_json(items)),
        Block::Table(rows) => JsonNode::element(
            TABLE,
            rows.iter()
                .map(|row| {
                    let cells = row
                        .cells
                        .iter()
                        .map(|cell| {
                            let kind = if cell.header { TABLE_HEADER } else { TABLE_CELL };
                            JsonNode::element(kind, cell.blocks.iter().map(block_to_json).collect())
                        })
                        .collect();
                    JsonNode::element(TABLE_ROW, cells)
                })
                .collect(),
        ),
        Block::Image { src } => {
            JsonNode::element(IMAGE, Vec::new()).with_attr(ATTR_SRC, Value::from(src.as_str()))
        }
    }
}

fn items_to_json(items: &[ListItem]) -> Vec<JsonNode> {
    items
        .iter()
        .map(|item| JsonNode::element(LIST_ITEM, item.blocks.iter().map(block_to_json).collect()))
        .collect()
}

fn runs_to_json(runs: &[TextRun]) -> Vec<JsonNode> {
    runs.iter()
        .map(|run| JsonNode {
            kind: TEXT.to_string(),
            attrs: None,
            content: Vec::new(),
            text: Some(run.text.clone()),
            marks: marks_to_json(&run.marks),
        })
        .collect()
}

fn marks_to_json(marks: &Marks) -> Vec<JsonMark> {
    let mut out: Vec<JsonMark> = [
        (marks.bold, "bold"),
        (marks.italic, "italic"),
        (marks.underline, "underline"),
        (marks.highlight, "highlight"),
    ]
    .into_iter()
    .filter(|(on, _)| *on)
    .map(|(_, kind)| JsonMark {
        kind: kind.to_string(),
        attrs: None,
    })
    .collect();
    if let Some(color) = &marks.color {
        let mut attrs = Map::new();
        attrs.insert(ATTR_COLOR.to_string(), Value::from(color.as_str()));
        out.push(JsonMark {
            kind: TEXT_STYLE.to_string(),
            attrs: Some(attrs),
        });
    }
    out
}

// ─── JSON → typed tree ────────────────────────────────────────────────

fn blocks_from_json(nodes: &[JsonNode], parent: &str) -> Result<Vec<Block>, SchemaError> {
    nodes.iter().map(|node| block_from_json(node, parent)).collect()
}

fn block_from_json(node: &JsonNode, parent: &str) -> Result<Block, SchemaError> {
    match node.kind.as_str() {
        PARAGRAPH => Ok(Block::Paragraph(runs_from_json(node)?)),
        HEADING => {
            let level = node
                .attr(ATTR_LEVEL)
                .ok_or(SchemaError::MissingAttribute {
                    node: HEADING,
                    attr: ATTR_LEVEL,
                })?
                .as_u64()
                .and_then(|level| u8::try_from(level).ok())
                .and_then(HeadingLevel::new)
                .ok_or(SchemaError::InvalidAttribute {
                    node: HEADING,
                    attr: ATTR_LEVEL,
                })?;
            Ok(Block::Heading {
                level,
                runs: runs_from_json(node)?,
            })
        }
        BULLET_LIST => Ok(Block::BulletList(items_from_json(node)?)),
        ORDERED_LIST => Ok(Block::OrderedList(items_from_json(node)?)),
        TABLE => {
            let rows = node
                .content
                .iter()
                .map(|row| {
                    if row.kind != TABLE_ROW {
                        return Err(row.unexpected(TABLE));
                    }
                    let cells = row
                        .content
                        .iter()
                        .map(|cell| match cell.kind.as_str() {
                            TABLE_CELL | TABLE_HEADER => Ok(TableCell {
                                header: cell.kind == TABLE_HEADER,
                                blocks: blocks_from_json(&cell.content, &cell.kind)?,
                            }),
                            _ => Err(cell.unexpected(TABLE_ROW)),
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok(TableRow { cells })
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Block::Table(rows))
        }
        IMAGE => {
            let src = node
                .attr(ATTR_SRC)
                .and_then(Value::as_str)
                .ok_or(SchemaError::MissingAttribute {
                    node: IMAGE,
                    attr: ATTR_SRC,
                })?;
            Ok(Block::Image {
                src: src.to_string(),
            })
        }
        LIST_ITEM | TABLE_ROW | TABLE_CELL | TABLE_HEADER | TEXT => Err(node.unexpected(parent)),
        other => Err(SchemaError::UnknownNode(other.to_string())),
    }
}

fn items_from_json(node: &JsonNode) -> Result<Vec<ListItem>, SchemaError> {
    node.content
        .iter()
        .map(|item| {
            if item.kind != LIST_ITEM {
                return Err(item.unexpected(&node.kind));
            }
            Ok(ListItem::new(blocks_from_json(&item.content, LIST_ITEM)?))
        })
        .collect()
}

fn runs_from_json(node: &JsonNode) -> Result<Vec<TextRun>, SchemaError> {
    node.content
        .iter()
        .map(|child| {
            if child.kind != TEXT {
                return Err(child.unexpected(&node.kind));
            }
            Ok(TextRun::styled(
                child.text.clone().unwrap_or_default(),
                marks_from_json(&child.marks),
            ))
        })
        .collect()
}

fn marks_from_json(marks: &[JsonMark]) -> Marks {
    let mut out = Marks::plain();
    for mark in marks {
        match mark.kind.as_str() {
            "bold" => out.bold = true,
            "italic" => out.italic = true,
            "underline" => out.underline = true,
            "highlight" => out.highlight = true,
            TEXT_STYLE => {
                out.color = mark
                    .attrs
                    .as_ref()
                    .and_then(|attrs| attrs.get(ATTR_COLOR))
                    .and_then(Value::as_str)
                    .map(str::to_string);
            }
            other => log::warn!("Dropping unsupported mark '{other}'"),
        }
    }
    out
}
