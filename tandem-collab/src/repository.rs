//! Document and share-grant records, and the repository seams.
//!
//! Records are addressed externally by `doc_id` only; the internal `id` never
//! leaves a repository (summaries drop it).

use std::time::SystemTime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::Identity;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    /// Internal primary key
    pub id: Uuid,
    /// Public, sharable key
    pub doc_id: String,
    pub title: String,
    /// Serialized snapshot; empty for a document never saved
    pub content: String,
    pub owner_id: Uuid,
    pub created_at: u64,
    pub updated_at: u64,
}

impl DocumentRecord {
    pub fn new(owner: &Identity, title: &str) -> Self {
        let now = now_millis();
        Self {
            id: Uuid::new_v4(),
            doc_id: Uuid::new_v4().to_string(),
            title: title.to_string(),
            content: String::new(),
            owner_id: owner.id,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn summary(&self) -> DocumentSummary {
        DocumentSummary {
            doc_id: self.doc_id.clone(),
            title: self.title.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// What list operations return.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSummary {
    pub doc_id: String,
    pub title: String,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Read/write access for `shared_with` to the document with internal id `document`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareGrant {
    pub document: Uuid,
    pub shared_with: String,
    pub shared_by: String,
    pub created_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
    #[error("access to '{0}' forbidden")]
    Forbidden(String),
    #[error("document '{0}' not found")]
    NotFound(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("storage error: {0}")]
    Storage(String),
}

#[async_trait]
pub trait DocumentRepository: Send + Sync {
    async fn create_document(&self, owner: &Identity, title: &str) -> Result<DocumentRecord, RepositoryError>;

    /// The record, if `requester` owns it or holds a grant for it.
    async fn fetch_by_doc_id(&self, doc_id: &str, requester: &Identity) -> Result<DocumentRecord, RepositoryError>;

    async fn update_content(&self, doc_id: &str, content: &str) -> Result<(), RepositoryError>;

    async fn update_title(&self, doc_id: &str, title: &str) -> Result<(), RepositoryError>;

    /// Newest first.
    async fn list_owned(&self, owner_id: Uuid) -> Result<Vec<DocumentSummary>, RepositoryError>;
}

#[async_trait]
pub trait ShareRepository: Send + Sync {
    /// Idempotent per `(doc_id, grantee)`; returns the existing grant on repeat.
    async fn grant(&self, doc_id: &str, grantee_email: &str, grantor_email: &str) -> Result<ShareGrant, RepositoryError>;

    /// Owner or grantee.
    async fn is_authorized(&self, doc_id: &str, identity: &Identity) -> Result<bool, RepositoryError>;

    /// Newest first.
    async fn list_shared_with(&self, email: &str) -> Result<Vec<DocumentSummary>, RepositoryError>;
}

/// Minimal shape check; the identity provider owns real validation.
pub(crate) fn check_email(email: &str) -> Result<String, RepositoryError> {
    let email = crate::identity::normalize_email(email);
    match email.split_once('@') {
        Some((user, domain)) if !user.is_empty() && !domain.is_empty() => Ok(email),
        _ => Err(RepositoryError::InvalidInput(format!("'{email}' is not an email address"))),
    }
}

pub(crate) fn newest_first(summaries: &mut [DocumentSummary]) {
    summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.doc_id.cmp(&b.doc_id)));
}
