//! Snapshot persistence.
//!
//! [`PersistenceBridge`] loads a document record and turns its content into a
//! [`Snapshot`], and writes snapshots back. [`SaveScheduler`] owns the write
//! timing for one open document:
//!
//! ```text
//! mark_dirty ─┐                       quiet period elapsed
//! mark_dirty ─┼─► Dirty (deadline reset) ─────────────────► Saving ─► Saved
//! mark_dirty ─┘                                               │
//!                                                             └─ error ─► Failed (retry after interval)
//! flush ──────────────────────────────────────────────────► Saving now, reply when done
//! ```
//!
//! One task per document performs every write, so at most one is in flight
//! and each write carries the state current when it starts.

use std::sync::Arc;
use std::time::Duration;

use tandem_core::{DocumentTree, Snapshot};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use crate::error::CollabError;
use crate::identity::Identity;
use crate::repository::{
    DocumentRecord, DocumentRepository, DocumentSummary, ShareGrant, ShareRepository,
};

#[derive(Clone)]
pub struct PersistenceBridge {
    documents: Arc<dyn DocumentRepository>,
    shares: Arc<dyn ShareRepository>,
}

impl PersistenceBridge {
    pub fn new(documents: Arc<dyn DocumentRepository>, shares: Arc<dyn ShareRepository>) -> Self {
        Self { documents, shares }
    }

    /// Fetch `doc_id` for `requester` and decode its content.
    ///
    /// Anonymous requesters are denied. A record that was never saved
    /// yields the empty document.
    pub async fn load(
        &self,
        doc_id: &str,
        requester: Option<&Identity>,
    ) -> Result<(DocumentRecord, Snapshot), CollabError> {
        let requester = requester.ok_or_else(|| CollabError::AccessDenied(doc_id.to_string()))?;
        let record = self.documents.fetch_by_doc_id(doc_id, requester).await?;
        let snapshot = if record.content.trim().is_empty() {
            Snapshot::from_tree(DocumentTree::empty())
        } else {
            Snapshot::from_content(&record.content)?
        };
        log::debug!("Loaded '{doc_id}' ({} bytes of content)", record.content.len());
        Ok((record, snapshot))
    }

    /// Write the snapshot as the document's content. Latest write wins.
    pub async fn save(&self, doc_id: &str, snapshot: &Snapshot) -> Result<(), CollabError> {
        let content = snapshot.to_content()?;
        self.documents
            .update_content(doc_id, &content)
            .await
            .map_err(|e| CollabError::PersistenceFailure(e.to_string()))
    }

    pub async fn update_title(&self, doc_id: &str, title: &str) -> Result<(), CollabError> {
        Ok(self.documents.update_title(doc_id, title).await?)
    }

    pub async fn create_document(&self, owner: &Identity, title: &str) -> Result<DocumentRecord, CollabError> {
        Ok(self.documents.create_document(owner, title).await?)
    }

    pub async fn list_owned(&self, owner: &Identity) -> Result<Vec<DocumentSummary>, CollabError> {
        Ok(self.documents.list_owned(owner.id).await?)
    }

    pub async fn list_shared_with(&self, identity: &Identity) -> Result<Vec<DocumentSummary>, CollabError> {
        Ok(self.shares.list_shared_with(&identity.email).await?)
    }

    /// Share `doc_id` with `grantee_email`; the grantor must have access itself.
    pub async fn share(
        &self,
        doc_id: &str,
        grantee_email: &str,
        grantor: &Identity,
    ) -> Result<ShareGrant, CollabError> {
        if !self.shares.is_authorized(doc_id, grantor).await? {
            return Err(CollabError::AccessDenied(doc_id.to_string()));
        }
        Ok(self.shares.grant(doc_id, grantee_email, &grantor.email).await?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveStatus {
    /// Nothing unsaved.
    Saved,
    /// Unsaved changes, write pending.
    Dirty,
    Saving,
    /// Last write failed; retried later. Local editing is unaffected.
    Failed(String),
}

enum SaveCommand {
    Dirty,
    Flush(oneshot::Sender<Result<(), CollabError>>),
}

/// Debounced writer for one document.
pub struct SaveScheduler {
    commands: mpsc::UnboundedSender<SaveCommand>,
    status: watch::Receiver<SaveStatus>,
    task: JoinHandle<()>,
}

impl SaveScheduler {
    /// Start the writer task. `source` produces the snapshot to write.
    pub fn spawn<F>(
        bridge: PersistenceBridge,
        doc_id: impl Into<String>,
        source: F,
        quiet_period: Duration,
        retry_interval: Duration,
    ) -> Self
    where
        F: Fn() -> Option<Snapshot> + Send + Sync + 'static,
    {
        let (commands, rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(SaveStatus::Saved);
        let writer = Writer {
            bridge,
            doc_id: doc_id.into(),
            source,
            status: status_tx,
            quiet_period,
            retry_interval,
        };
        let task = tokio::spawn(writer.run(rx));
        Self {
            commands,
            status,
            task,
        }
    }

    /// Note an unsaved change; the write happens after the quiet period.
    pub fn mark_dirty(&self) {
        let _ = self.commands.send(SaveCommand::Dirty);
    }

    /// Write now if anything is unsaved and wait for the outcome.
    pub async fn flush(&self) -> Result<(), CollabError> {
        let (reply, outcome) = oneshot::channel();
        self.commands
            .send(SaveCommand::Flush(reply))
            .map_err(|_| CollabError::PersistenceFailure("save task stopped".into()))?;
        outcome
            .await
            .map_err(|_| CollabError::PersistenceFailure("save task stopped".into()))?
    }

    pub fn status(&self) -> watch::Receiver<SaveStatus> {
        self.status.clone()
    }

    /// Stop the writer. Unsaved changes get one write attempt, without retry.
    pub async fn shutdown(self) {
        drop(self.commands);
        let _ = self.task.await;
    }
}

struct Writer<F> {
    bridge: PersistenceBridge,
    doc_id: String,
    source: F,
    status: watch::Sender<SaveStatus>,
    quiet_period: Duration,
    retry_interval: Duration,
}

impl<F> Writer<F>
where
    F: Fn() -> Option<Snapshot> + Send + Sync + 'static,
{
    async fn run(self, mut commands: mpsc::UnboundedReceiver<SaveCommand>) {
        let mut dirty = false;
        let mut deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SaveCommand::Dirty) => {
                        dirty = true;
                        deadline = Some(Instant::now() + self.quiet_period);
                        self.status.send_replace(SaveStatus::Dirty);
                    }
                    Some(SaveCommand::Flush(reply)) => {
                        let outcome = if dirty { self.write().await } else { Ok(()) };
                        match &outcome {
                            Ok(()) => {
                                dirty = false;
                                deadline = None;
                            }
                            Err(_) => deadline = Some(Instant::now() + self.retry_interval),
                        }
                        let _ = reply.send(outcome);
                    }
                    None => break,
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    match self.write().await {
                        Ok(()) => {
                            dirty = false;
                            deadline = None;
                        }
                        Err(_) => deadline = Some(Instant::now() + self.retry_interval),
                    }
                }
            }
        }
        // Owner gone without a flush; one last attempt, no retries.
        if dirty {
            if let Err(e) = self.write().await {
                log::warn!("Save task for '{}' stopped with unsaved changes: {e}", self.doc_id);
            }
        }
    }

    async fn write(&self) -> Result<(), CollabError> {
        let Some(snapshot) = (self.source)() else {
            let reason = "document is no longer available".to_string();
            self.status.send_replace(SaveStatus::Failed(reason.clone()));
            return Err(CollabError::PersistenceFailure(reason));
        };
        self.status.send_replace(SaveStatus::Saving);
        match self.bridge.save(&self.doc_id, &snapshot).await {
            Ok(()) => {
                log::debug!("Saved '{}'", self.doc_id);
                self.status.send_replace(SaveStatus::Saved);
                Ok(())
            }
            Err(e) => {
                log::warn!("Saving '{}' failed, will retry: {e}", self.doc_id);
                self.status.send_replace(SaveStatus::Failed(e.to_string()));
                Err(e)
            }
        }
    }
}
