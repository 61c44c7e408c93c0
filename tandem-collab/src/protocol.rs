//! Binary wire protocol for the relay and for document messages.
//!
//! Two layers, both bincode-encoded:
//! ```text
//! Frame { sender, kind }                 relay envelope (one per WebSocket message)
//!   └─ Broadcast { topic, event, payload }
//!                              └─ DocMessage  ("doc-update" | "sync-step1" | "sync-step2")
//! ```
//!
//! The relay only looks at frames; document messages are opaque to it.

use serde::{Deserialize, Serialize};
use tandem_core::{ReplicaId, UpdateDelta};
use uuid::Uuid;

/// Event name of an incremental update.
pub const EVENT_UPDATE: &str = "doc-update";
/// Event name of a catch-up request carrying a state vector.
pub const EVENT_SYNC_REQUEST: &str = "sync-step1";
/// Event name of a catch-up answer carrying a state diff.
pub const EVENT_SYNC_RESPONSE: &str = "sync-step2";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameKind {
    /// Subscribe the sender to a topic
    Join { topic: String },
    /// Subscription acknowledged
    Joined { topic: String },
    /// Unsubscribe from the current topic
    Leave,
    /// Fan-out to every other member of `topic`
    Broadcast {
        topic: String,
        event: String,
        payload: Vec<u8>,
    },
    /// The receiver fell behind and `missed` broadcasts were dropped
    Lagged { missed: u64 },
    Ping,
    Pong,
    Error { reason: String },
}

/// Top-level relay message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// Channel member that produced the frame (nil for the relay itself)
    pub sender: Uuid,
    pub kind: FrameKind,
}

impl Frame {
    pub fn join(sender: Uuid, topic: impl Into<String>) -> Self {
        Self {
            sender,
            kind: FrameKind::Join {
                topic: topic.into(),
            },
        }
    }

    pub fn joined(topic: impl Into<String>) -> Self {
        Self {
            sender: Uuid::nil(),
            kind: FrameKind::Joined {
                topic: topic.into(),
            },
        }
    }

    pub fn leave(sender: Uuid) -> Self {
        Self {
            sender,
            kind: FrameKind::Leave,
        }
    }

    pub fn broadcast(
        sender: Uuid,
        topic: impl Into<String>,
        event: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            sender,
            kind: FrameKind::Broadcast {
                topic: topic.into(),
                event: event.into(),
                payload,
            },
        }
    }

    pub fn lagged(missed: u64) -> Self {
        Self {
            sender: Uuid::nil(),
            kind: FrameKind::Lagged { missed },
        }
    }

    pub fn ping(sender: Uuid) -> Self {
        Self {
            sender,
            kind: FrameKind::Ping,
        }
    }

    pub fn pong(sender: Uuid) -> Self {
        Self {
            sender,
            kind: FrameKind::Pong,
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            sender: Uuid::nil(),
            kind: FrameKind::Error {
                reason: reason.into(),
            },
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(frame)
    }
}

/// Document-level message carried in a broadcast payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocMessage {
    /// A local edit of the sending replica
    Update(UpdateDelta),
    /// "Send me what I am missing"
    SyncRequest {
        from: ReplicaId,
        state_vector: Vec<u8>,
    },
    /// Catch-up diff, addressed to one replica or to everyone (`None`)
    SyncResponse {
        to: Option<ReplicaId>,
        diff: UpdateDelta,
    },
}

impl DocMessage {
    /// Event name the message travels under.
    pub fn event(&self) -> &'static str {
        match self {
            Self::Update(_) => EVENT_UPDATE,
            Self::SyncRequest { .. } => EVENT_SYNC_REQUEST,
            Self::SyncResponse { .. } => EVENT_SYNC_RESPONSE,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Decode a payload received under `event`; the two must agree.
    pub fn decode(event: &str, bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _): (Self, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        if msg.event() != event {
            return Err(ProtocolError::InvalidMessageType);
        }
        Ok(msg)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}
