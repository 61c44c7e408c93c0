//! Repository backends.
//!
//! ```text
//! ┌────────────────────┐   DocumentRepository   ┌──────────────────────┐
//! │ PersistenceBridge  │ ─────────────────────► │ MemoryRepository     │  tests, single process
//! │                    │   ShareRepository      │ RocksRepository      │  durable, one WriteBatch
//! └────────────────────┘                        └──────────────────────┘  per mutation
//! ```

pub mod memory;
pub mod rocks;

pub use memory::MemoryRepository;
pub use rocks::{RocksRepository, StoreConfig};
