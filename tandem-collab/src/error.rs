//! Error taxonomy seen by callers of the collaboration layer.
//!
//! Component errors convert into [`CollabError`] at the component boundary.
//! Fatal for opening a session: `AccessDenied`, `NotFound`, read-side
//! `PersistenceFailure`. Everything else degrades (save retried, channel
//! dropped to local-only, delta dropped).

use tandem_core::{SnapshotError, StoreError};

use crate::channel::ChannelError;
use crate::protocol::ProtocolError;
use crate::repository::RepositoryError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollabError {
    #[error("access denied to '{0}'")]
    AccessDenied(String),
    #[error("'{0}' not found")]
    NotFound(String),
    #[error("malformed delta: {0}")]
    MalformedDelta(String),
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),
    #[error("channel failure: {0}")]
    ChannelFailure(String),
}

impl From<RepositoryError> for CollabError {
    fn from(e: RepositoryError) -> Self {
        match e {
            RepositoryError::Forbidden(doc) => Self::AccessDenied(doc),
            RepositoryError::NotFound(doc) => Self::NotFound(doc),
            other => Self::PersistenceFailure(other.to_string()),
        }
    }
}

impl From<StoreError> for CollabError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::InvalidSnapshot(_) => Self::PersistenceFailure(e.to_string()),
            other => Self::MalformedDelta(other.to_string()),
        }
    }
}

impl From<SnapshotError> for CollabError {
    fn from(e: SnapshotError) -> Self {
        Self::PersistenceFailure(e.to_string())
    }
}

impl From<ChannelError> for CollabError {
    fn from(e: ChannelError) -> Self {
        Self::ChannelFailure(e.to_string())
    }
}

impl From<ProtocolError> for CollabError {
    fn from(e: ProtocolError) -> Self {
        Self::ChannelFailure(e.to_string())
    }
}
