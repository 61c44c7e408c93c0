//! # tandem-collab: Realtime collaboration and persistence for Tandem notes
//!
//! Wires `tandem-core` replicas to a document repository and to a broadcast
//! channel per document, so several people can edit one note at once.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐   load / save    ┌───────────────────┐
//! │ DocumentSession │ ───────────────► │ PersistenceBridge │ ── RocksDB | memory
//! │ (per open doc)  │                  └───────────────────┘
//! └────────┬────────┘
//!          │ DocMessage
//!          ▼
//! ┌──────────────────┐  ChannelProvider  ┌──────────────┐     ┌─────────────┐
//! │ RealtimeChannel  │ ────────────────► │ LocalHub     │  or │ RelayServer │
//! │ (topic doc-<id>) │                   │ (in-process) │     │ (WebSocket) │
//! └──────────────────┘                   └──────────────┘     └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Relay frames and document messages (bincode)
//! - [`broadcast`]: Topic-keyed fan-out rooms
//! - [`channel`]: Channel seam and the in-process hub
//! - [`client`]: WebSocket channel provider
//! - [`server`]: WebSocket relay
//! - [`transport`]: Per-document realtime channel
//! - [`presence`]: Connection status
//! - [`repository`]: Document and share records
//! - [`storage`]: RocksDB and in-memory repositories
//! - [`persistence`]: Load/save bridge and debounced writer
//! - [`identity`]: Signed-in identity
//! - [`session`]: One open document, all of the above wired together

pub mod broadcast;
pub mod channel;
pub mod client;
pub mod error;
pub mod identity;
pub mod persistence;
pub mod presence;
pub mod protocol;
pub mod repository;
pub mod server;
pub mod session;
pub mod storage;
pub mod transport;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, Envelope, RoomManager};
pub use channel::{Channel, ChannelError, ChannelEvent, ChannelProvider, ChannelSink, LocalHub};
pub use client::WsChannelProvider;
pub use error::CollabError;
pub use identity::{Identity, IdentityProvider, SessionContext, StaticIdentity};
pub use persistence::{PersistenceBridge, SaveScheduler, SaveStatus};
pub use presence::{ConnectionState, Presence};
pub use protocol::{DocMessage, Frame, FrameKind, ProtocolError};
pub use repository::{
    DocumentRecord, DocumentRepository, DocumentSummary, RepositoryError, ShareGrant, ShareRepository,
};
pub use server::{RelayServer, RelayStats, ServerConfig};
pub use session::{DocumentSession, SessionConfig};
pub use storage::{MemoryRepository, RocksRepository, StoreConfig};
pub use transport::{RealtimeChannel, RealtimeTransport, TransportEvent};
