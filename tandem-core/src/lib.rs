//! # tandem-core: Replicated rich-text documents for Tandem notes
//!
//! Owns the document model, the CRDT replica built on `yrs`, the snapshot
//! format and the editor binding. Nothing here does I/O; persistence and
//! transport live in `tandem-collab`.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐  EditorCommand   ┌────────────────────┐
//! │ EditorBinding │ ───────────────► │ ReplicatedDocument │ ◄── UpdateDelta (remote)
//! │ (selection)   │ ◄─── watch ───── │ (yrs XmlFragment)  │ ──► UpdateDelta (local)
//! └───────────────┘                  └─────────┬──────────┘
//!                                              │ serialize / create
//!                                              ▼
//!                                      ┌──────────────┐
//!                                      │   Snapshot   │  JSON nodes + base64 state
//!                                      └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`model`]: Typed document tree
//! - [`schema`]: Node vocabulary and JSON node/mark format
//! - [`replica`]: CRDT replica, local mutations and remote deltas
//! - [`snapshot`]: Durable snapshot format
//! - [`editor`]: Command binding and view derivation

pub mod editor;
pub mod model;
pub mod replica;
pub mod schema;
pub mod snapshot;

pub use editor::{
    ActiveFormats, CommandError, CommandOutcome, EditorBinding, EditorCommand, Selection, ViewModel,
};
pub use model::{
    Block, BlockPath, DocumentTree, HeadingLevel, ListItem, Mark, MarkChange, MarkKind, Marks,
    ModelError, TableCell, TableRow, TextRun,
};
pub use replica::{
    ApplyOutcome, ChangeEvent, ChangeOrigin, ListenerId, Mutation, ReplicaConfig, ReplicaId,
    ReplicatedDocument, StoreError, UpdateDelta,
};
pub use schema::{JsonMark, JsonNode, SchemaError};
pub use snapshot::{Snapshot, SnapshotError};
