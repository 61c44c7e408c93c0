//! In-memory repository, the default for tests and single-process use.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::identity::Identity;
use crate::repository::{
    check_email, newest_first, now_millis, DocumentRecord, DocumentRepository, DocumentSummary,
    RepositoryError, ShareGrant, ShareRepository,
};

#[derive(Default)]
struct MemoryState {
    records: HashMap<Uuid, DocumentRecord>,
    doc_index: HashMap<String, Uuid>,
    /// (internal id, grantee email) → grant
    grants: HashMap<(Uuid, String), ShareGrant>,
}

impl MemoryState {
    fn record(&self, doc_id: &str) -> Result<&DocumentRecord, RepositoryError> {
        self.doc_index
            .get(doc_id)
            .and_then(|id| self.records.get(id))
            .ok_or_else(|| RepositoryError::NotFound(doc_id.to_string()))
    }

    fn record_mut(&mut self, doc_id: &str) -> Result<&mut DocumentRecord, RepositoryError> {
        let id = *self
            .doc_index
            .get(doc_id)
            .ok_or_else(|| RepositoryError::NotFound(doc_id.to_string()))?;
        self.records
            .get_mut(&id)
            .ok_or_else(|| RepositoryError::NotFound(doc_id.to_string()))
    }

    fn authorized(&self, record: &DocumentRecord, identity: &Identity) -> bool {
        record.owner_id == identity.id
            || self
                .grants
                .contains_key(&(record.id, crate::identity::normalize_email(&identity.email)))
    }
}

#[derive(Default)]
pub struct MemoryRepository {
    state: RwLock<MemoryState>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record as-is, e.g. one carrying content from elsewhere.
    pub async fn insert(&self, record: DocumentRecord) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        if state.doc_index.contains_key(&record.doc_id) {
            return Err(RepositoryError::InvalidInput(format!(
                "doc_id '{}' already exists",
                record.doc_id
            )));
        }
        state.doc_index.insert(record.doc_id.clone(), record.id);
        state.records.insert(record.id, record);
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.records.len()
    }
}

#[async_trait]
impl DocumentRepository for MemoryRepository {
    async fn create_document(&self, owner: &Identity, title: &str) -> Result<DocumentRecord, RepositoryError> {
        let record = DocumentRecord::new(owner, title);
        self.insert(record.clone()).await?;
        Ok(record)
    }

    async fn fetch_by_doc_id(&self, doc_id: &str, requester: &Identity) -> Result<DocumentRecord, RepositoryError> {
        let state = self.state.read().await;
        let record = state.record(doc_id)?;
        if !state.authorized(record, requester) {
            return Err(RepositoryError::Forbidden(doc_id.to_string()));
        }
        Ok(record.clone())
    }

    async fn update_content(&self, doc_id: &str, content: &str) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        let record = state.record_mut(doc_id)?;
        record.content = content.to_string();
        record.updated_at = now_millis();
        Ok(())
    }

    async fn update_title(&self, doc_id: &str, title: &str) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        let record = state.record_mut(doc_id)?;
        record.title = title.to_string();
        record.updated_at = now_millis();
        Ok(())
    }

    async fn list_owned(&self, owner_id: Uuid) -> Result<Vec<DocumentSummary>, RepositoryError> {
        let state = self.state.read().await;
        let mut owned: Vec<_> = state
            .records
            .values()
            .filter(|r| r.owner_id == owner_id)
            .map(DocumentRecord::summary)
            .collect();
        newest_first(&mut owned);
        Ok(owned)
    }
}

#[async_trait]
impl ShareRepository for MemoryRepository {
    async fn grant(&self, doc_id: &str, grantee_email: &str, grantor_email: &str) -> Result<ShareGrant, RepositoryError> {
        let grantee = check_email(grantee_email)?;
        let grantor = check_email(grantor_email)?;
        let mut state = self.state.write().await;
        let document = state.record(doc_id)?.id;
        let grant = state
            .grants
            .entry((document, grantee.clone()))
            .or_insert_with(|| ShareGrant {
                document,
                shared_with: grantee,
                shared_by: grantor,
                created_at: now_millis(),
            });
        Ok(grant.clone())
    }

    async fn is_authorized(&self, doc_id: &str, identity: &Identity) -> Result<bool, RepositoryError> {
        let state = self.state.read().await;
        let record = state.record(doc_id)?;
        Ok(state.authorized(record, identity))
    }

    async fn list_shared_with(&self, email: &str) -> Result<Vec<DocumentSummary>, RepositoryError> {
        let email = crate::identity::normalize_email(email);
        let state = self.state.read().await;
        let mut shared: Vec<_> = state
            .grants
            .values()
            .filter(|g| g.shared_with == email)
            .filter_map(|g| state.records.get(&g.document))
            .map(DocumentRecord::summary)
            .collect();
        newest_first(&mut shared);
        Ok(shared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn who(email: &str) -> Identity {
        Identity::new(Uuid::new_v4(), email)
    }

    #[tokio::test]
    async fn test_owner_can_fetch_stranger_cannot() {
        let repo = MemoryRepository::new();
        let owner = who("owner@example.com");
        let record = repo.create_document(&owner, "Plan").await.unwrap();

        let fetched = repo.fetch_by_doc_id(&record.doc_id, &owner).await.unwrap();
        assert_eq!(fetched.title, "Plan");

        let stranger = who("x@example.com");
        assert_eq!(
            repo.fetch_by_doc_id(&record.doc_id, &stranger).await,
            Err(RepositoryError::Forbidden(record.doc_id.clone()))
        );
        assert!(matches!(
            repo.fetch_by_doc_id("missing", &owner).await,
            Err(RepositoryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_grant_is_idempotent_and_case_insensitive() {
        let repo = MemoryRepository::new();
        let owner = who("owner@example.com");
        let record = repo.create_document(&owner, "Plan").await.unwrap();

        let first = repo
            .grant(&record.doc_id, "Grantee@Example.com", &owner.email)
            .await
            .unwrap();
        let second = repo
            .grant(&record.doc_id, "grantee@example.com", "other@example.com")
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(first.shared_by, "owner@example.com");

        let grantee = who("grantee@example.com");
        assert!(repo.is_authorized(&record.doc_id, &grantee).await.unwrap());
        assert_eq!(repo.list_shared_with("GRANTEE@example.com").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_updates_touch_timestamp() {
        let repo = MemoryRepository::new();
        let owner = who("owner@example.com");
        let record = repo.create_document(&owner, "Plan").await.unwrap();

        repo.update_content(&record.doc_id, "{}").await.unwrap();
        repo.update_title(&record.doc_id, "Plan B").await.unwrap();
        let fetched = repo.fetch_by_doc_id(&record.doc_id, &owner).await.unwrap();
        assert_eq!(fetched.content, "{}");
        assert_eq!(fetched.title, "Plan B");
        assert!(fetched.updated_at >= record.updated_at);
        assert!(repo.update_title("missing", "x").await.is_err());
    }

    #[tokio::test]
    async fn test_list_owned_only_returns_own() {
        let repo = MemoryRepository::new();
        let a = who("a@example.com");
        let b = who("b@example.com");
        repo.create_document(&a, "one").await.unwrap();
        repo.create_document(&a, "two").await.unwrap();
        repo.create_document(&b, "three").await.unwrap();

        assert_eq!(repo.list_owned(a.id).await.unwrap().len(), 2);
        assert_eq!(repo.list_owned(b.id).await.unwrap().len(), 1);
        assert_eq!(repo.len().await, 3);
    }
}
