//! Replicated document store.
//!
//! One [`ReplicatedDocument`] per open document. Content lives in a `yrs`
//! XML fragment; the typed [`DocumentTree`] is re-read after every change and
//! cached, so readers never touch the CRDT directly.
//!
//! ```text
//!   Mutation ──plan──► Step* ──execute──► yrs txn ("local") ──► UpdateDelta
//!                                                                   │
//!   UpdateDelta ──trial merge──► strict read ──► yrs txn ("remote") │
//!                                                                   ▼
//!                                                    listeners(ChangeEvent)
//! ```
//!
//! Concurrent inserts at the same position are ordered by ascending replica
//! id, which is the `yrs` client id of the replica.
//!
//! Remote deltas are first merged into a mirror of the document and only
//! reach the real one when the mirrored tree still reads back. The mirror
//! follows every change, so a merge costs the delta plus one tree read; it
//! is rebuilt from the full state only after a rejected or deferred delta.

pub mod mutation;
mod xml;

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Doc, OffsetKind, Options, ReadTxn, StateVector, Transact, UndoManager, Update, XmlFragmentRef,
};

use crate::model::{BlockPath, DocumentTree, ModelError};
use crate::schema::SchemaError;
use crate::snapshot::Snapshot;

pub use mutation::Mutation;

/// Name of the root XML fragment, shared with the browser editor binding.
pub const ROOT_FRAGMENT: &str = "default";

/// Client id that authors seed content. Never handed out to a replica.
const SEED_CLIENT: u64 = 0;

const ORIGIN_LOCAL: &str = "local";
const ORIGIN_REMOTE: &str = "remote";
const ORIGIN_SEED: &str = "seed";

/// Largest client id representable in every `yrs` peer.
const MAX_REPLICA_ID: u64 = (1 << 53) - 1;

/// Out-of-order sequence numbers remembered per origin.
const MAX_SEEN_AHEAD: usize = 256;

/// Identity of one replica; doubles as the CRDT client id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicaId(u64);

impl ReplicaId {
    pub fn new(id: u64) -> Option<Self> {
        (id != SEED_CLIENT && id <= MAX_REPLICA_ID).then_some(Self(id))
    }

    pub fn random() -> Self {
        let (high, _) = Uuid::new_v4().as_u64_pair();
        Self((high & MAX_REPLICA_ID).max(1))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// One transmittable change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateDelta {
    pub doc_id: String,
    pub origin: ReplicaId,
    /// Per-origin sequence number, starting at 1. Zero marks a catch-up diff.
    pub seq: u64,
    /// `yrs` v1 update.
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Remote(ReplicaId),
}

/// Emitted to listeners after every change of the tree.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub origin: ChangeOrigin,
    pub delta: UpdateDelta,
    pub tree: Arc<DocumentTree>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Already integrated; nothing changed.
    Duplicate,
    /// Depends on updates not seen yet; buffered until they arrive.
    Deferred,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("no block at {0}")]
    InvalidPath(BlockPath),
    #[error("block at {0} does not hold text")]
    NotATextBlock(BlockPath),
    #[error("invalid mutation: {0}")]
    InvalidMutation(#[from] ModelError),
    #[error("delta for document '{found}' sent to '{expected}'")]
    WrongDocument { expected: String, found: String },
    #[error("delta originated from this replica")]
    Echo,
    #[error("malformed delta: {0}")]
    MalformedDelta(String),
    #[error("invalid snapshot state: {0}")]
    InvalidSnapshot(String),
    #[error("replicated tree is invalid: {0}")]
    Schema(#[from] SchemaError),
}

#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// Causally premature deltas kept for retry; the oldest is dropped past this.
    pub max_pending_deltas: usize,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            max_pending_deltas: 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub type Listener = Box<dyn Fn(&ChangeEvent) + Send + Sync>;

enum Integration {
    Applied,
    Duplicate,
    Deferred,
}

/// One replica of one document.
pub struct ReplicatedDocument {
    doc_id: String,
    replica: ReplicaId,
    config: ReplicaConfig,
    doc: Doc,
    root: XmlFragmentRef,
    history: UndoManager,
    mirror: Mirror,
    tree: Arc<DocumentTree>,
    seq: u64,
    seen: SeenDeltas,
    pending: VecDeque<UpdateDelta>,
    listeners: Vec<(ListenerId, Listener)>,
    next_listener: u64,
}

fn doc_options(client_id: u64) -> Options {
    let mut options = Options::with_client_id(client_id);
    options.offset_kind = OffsetKind::Utf16;
    // Collected XML elements encode differently from their replayed
    // deltas, and replicas that merged the same deltas would disagree.
    options.skip_gc = true;
    options
}

/// Trial copy of a replica's document; remote deltas land here first.
struct Mirror {
    doc: Doc,
    root: XmlFragmentRef,
}

impl Mirror {
    fn of(doc: &Doc, client_id: u64) -> Result<Self, StoreError> {
        let mirror = Doc::with_options(doc_options(client_id));
        let root = mirror.get_or_insert_xml_fragment(ROOT_FRAGMENT);
        let state = doc.transact().encode_state_as_update_v1(&StateVector::default());
        let update = Update::decode_v1(&state).map_err(|e| StoreError::InvalidSnapshot(e.to_string()))?;
        mirror
            .transact_mut()
            .apply_update(update)
            .map_err(|e| StoreError::InvalidSnapshot(e.to_string()))?;
        Ok(Self { doc: mirror, root })
    }

    /// Merge `payload`; `None` when it still lacks dependencies.
    fn merge(&self, payload: &[u8]) -> Result<Option<DocumentTree>, StoreError> {
        let update = Update::decode_v1(payload).map_err(|e| StoreError::MalformedDelta(e.to_string()))?;
        {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| StoreError::MalformedDelta(e.to_string()))?;
            if txn.has_missing_updates() {
                return Ok(None);
            }
        }
        xml::read_tree(&self.doc.transact(), &self.root)
            .map(Some)
            .map_err(|e| StoreError::MalformedDelta(e.to_string()))
    }
}

/// Sequence numbers already integrated, per origin: everything up to a
/// contiguous watermark plus a bounded set of later ones.
#[derive(Debug, Default)]
struct SeenDeltas {
    contiguous: HashMap<ReplicaId, u64>,
    ahead: HashMap<ReplicaId, BTreeSet<u64>>,
}

impl SeenDeltas {
    fn contains(&self, origin: ReplicaId, seq: u64) -> bool {
        self.contiguous.get(&origin).is_some_and(|floor| seq <= *floor)
            || self.ahead.get(&origin).is_some_and(|ahead| ahead.contains(&seq))
    }

    fn insert(&mut self, origin: ReplicaId, seq: u64) {
        let floor = self.contiguous.entry(origin).or_insert(0);
        if seq <= *floor {
            return;
        }
        let ahead = self.ahead.entry(origin).or_default();
        ahead.insert(seq);
        while ahead.remove(&(*floor + 1)) {
            *floor += 1;
        }
        // Forgetting only costs a redundant merge, which yrs reports as a duplicate.
        while ahead.len() > MAX_SEEN_AHEAD {
            ahead.pop_first();
        }
        if ahead.is_empty() {
            self.ahead.remove(&origin);
        }
    }

    #[cfg(test)]
    fn ahead_len(&self) -> usize {
        self.ahead.values().map(BTreeSet::len).sum()
    }
}

/// Seed content authored by [`SEED_CLIENT`], identical on every replica.
fn seed_update(tree: &DocumentTree) -> Vec<u8> {
    let scratch = Doc::with_options(doc_options(SEED_CLIENT));
    let root = scratch.get_or_insert_xml_fragment(ROOT_FRAGMENT);
    let mut txn = scratch.transact_mut();
    xml::write_tree(&mut txn, &root, tree);
    txn.encode_state_as_update_v1(&StateVector::default())
}

impl ReplicatedDocument {
    /// Empty replica (one empty paragraph) or one hydrated from `snapshot`.
    pub fn create(
        doc_id: impl Into<String>,
        replica: ReplicaId,
        snapshot: Option<&Snapshot>,
    ) -> Result<Self, StoreError> {
        Self::with_config(doc_id, replica, snapshot, ReplicaConfig::default())
    }

    pub fn with_config(
        doc_id: impl Into<String>,
        replica: ReplicaId,
        snapshot: Option<&Snapshot>,
        config: ReplicaConfig,
    ) -> Result<Self, StoreError> {
        let doc_id = doc_id.into();
        let doc = Doc::with_options(doc_options(replica.get()));
        let root = doc.get_or_insert_xml_fragment(ROOT_FRAGMENT);

        let state = match snapshot {
            Some(Snapshot {
                state: Some(state), ..
            }) => state.clone(),
            Some(Snapshot { tree, state: None }) => seed_update(tree),
            None => seed_update(&DocumentTree::empty()),
        };
        let update =
            Update::decode_v1(&state).map_err(|e| StoreError::InvalidSnapshot(e.to_string()))?;
        {
            let mut txn = doc.transact_mut_with(ORIGIN_SEED);
            txn.apply_update(update)
                .map_err(|e| StoreError::InvalidSnapshot(e.to_string()))?;
            if txn.has_missing_updates() {
                return Err(StoreError::InvalidSnapshot("state has unresolved dependencies".into()));
            }
        }

        let tree = xml::read_tree(&doc.transact(), &root)
            .map_err(|e| StoreError::InvalidSnapshot(e.to_string()))?;
        if let Some(snapshot) = snapshot {
            if snapshot.state.is_some() && snapshot.tree != tree {
                log::warn!("Snapshot tree of '{doc_id}' differs from its replica state, using the state");
            }
        }

        let mut history = UndoManager::with_scope_and_options(&doc, &root, yrs::undo::Options::default());
        history.include_origin(ORIGIN_LOCAL);
        let mirror = Mirror::of(&doc, replica.get())?;

        log::debug!("Replica {replica} created for '{doc_id}'");
        Ok(Self {
            doc_id,
            replica,
            config,
            doc,
            root,
            history,
            mirror,
            tree: Arc::new(tree),
            seq: 0,
            seen: SeenDeltas::default(),
            pending: VecDeque::new(),
            listeners: Vec::new(),
            next_listener: 0,
        })
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica
    }

    /// Current tree; cheap to clone.
    pub fn tree(&self) -> Arc<DocumentTree> {
        self.tree.clone()
    }

    /// Deltas waiting for missing dependencies.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    // ─── Local edits ──────────────────────────────────────────────────

    /// Applies one edit in one transaction.
    ///
    /// Returns `None` when the mutation changes nothing (an empty insert or
    /// zero-length format). Invalid mutations change nothing and fail.
    pub fn apply_local_mutation(&mut self, mutation: Mutation) -> Result<Option<UpdateDelta>, StoreError> {
        let steps = mutation::plan(&self.tree, mutation)?;
        if steps.is_empty() {
            return Ok(None);
        }

        // One mutation is one undo step.
        self.history.reset();
        let payload = {
            let mut txn = self.doc.transact_mut_with(ORIGIN_LOCAL);
            xml::execute(&mut txn, &self.root, &steps)?;
            txn.commit();
            txn.encode_update_v1()
        };
        self.emit_local(payload).map(Some)
    }

    pub fn undo(&mut self) -> Result<Option<UpdateDelta>, StoreError> {
        self.step_history(true)
    }

    pub fn redo(&mut self) -> Result<Option<UpdateDelta>, StoreError> {
        self.step_history(false)
    }

    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    fn step_history(&mut self, undo: bool) -> Result<Option<UpdateDelta>, StoreError> {
        let before = self.doc.transact().state_vector();
        let changed = if undo {
            self.history.undo_blocking()
        } else {
            self.history.redo_blocking()
        };
        if !changed {
            return Ok(None);
        }
        let payload = self.doc.transact().encode_state_as_update_v1(&before);
        self.emit_local(payload).map(Some)
    }

    fn emit_local(&mut self, payload: Vec<u8>) -> Result<UpdateDelta, StoreError> {
        self.tree = Arc::new(xml::read_tree(&self.doc.transact(), &self.root)?);
        if let Err(e) = self.mirror.merge(&payload) {
            log::debug!("Rebuilding mirror of '{}': {e}", self.doc_id);
            self.mirror = Mirror::of(&self.doc, self.replica.get())?;
        }
        self.seq += 1;
        let delta = UpdateDelta {
            doc_id: self.doc_id.clone(),
            origin: self.replica,
            seq: self.seq,
            payload,
        };
        self.notify(&ChangeEvent {
            origin: ChangeOrigin::Local,
            delta: delta.clone(),
            tree: self.tree.clone(),
        });
        Ok(delta)
    }

    // ─── Remote deltas ────────────────────────────────────────────────

    /// Merges a delta from another replica.
    ///
    /// Idempotent. A delta whose dependencies are missing is buffered and
    /// retried after each later successful merge. A delta that does not decode,
    /// or that would leave the tree outside the schema, is rejected without
    /// touching the document.
    pub fn apply_remote_delta(&mut self, delta: &UpdateDelta) -> Result<ApplyOutcome, StoreError> {
        if delta.doc_id != self.doc_id {
            return Err(StoreError::WrongDocument {
                expected: self.doc_id.clone(),
                found: delta.doc_id.clone(),
            });
        }
        if delta.origin == self.replica {
            return Err(StoreError::Echo);
        }
        if delta.seq != 0 && self.is_known(delta) {
            return Ok(ApplyOutcome::Duplicate);
        }

        let outcome = match self.integrate(delta)? {
            Integration::Applied => ApplyOutcome::Applied,
            Integration::Duplicate => ApplyOutcome::Duplicate,
            Integration::Deferred => {
                self.defer(delta.clone());
                return Ok(ApplyOutcome::Deferred);
            }
        };
        self.mark_seen(delta);
        if outcome == ApplyOutcome::Applied {
            self.drain_pending();
        }
        Ok(outcome)
    }

    fn is_known(&self, delta: &UpdateDelta) -> bool {
        self.seen.contains(delta.origin, delta.seq)
            || self
                .pending
                .iter()
                .any(|p| p.origin == delta.origin && p.seq == delta.seq)
    }

    fn mark_seen(&mut self, delta: &UpdateDelta) {
        if delta.seq != 0 {
            self.seen.insert(delta.origin, delta.seq);
        }
    }

    fn defer(&mut self, delta: UpdateDelta) {
        log::debug!(
            "Deferring delta {}#{} for '{}': missing dependencies",
            delta.origin,
            delta.seq,
            self.doc_id
        );
        self.pending.push_back(delta);
        if self.pending.len() > self.config.max_pending_deltas {
            if let Some(dropped) = self.pending.pop_front() {
                log::warn!(
                    "Pending delta buffer full for '{}', dropping {}#{}",
                    self.doc_id,
                    dropped.origin,
                    dropped.seq
                );
            }
        }
    }

    fn drain_pending(&mut self) {
        loop {
            let mut progress = false;
            for delta in std::mem::take(&mut self.pending) {
                match self.integrate(&delta) {
                    Ok(Integration::Applied) => {
                        self.mark_seen(&delta);
                        progress = true;
                    }
                    Ok(Integration::Duplicate) => self.mark_seen(&delta),
                    Ok(Integration::Deferred) => self.pending.push_back(delta),
                    Err(e) => log::warn!("Dropping buffered delta {}#{}: {e}", delta.origin, delta.seq),
                }
            }
            if !progress || self.pending.is_empty() {
                break;
            }
        }
    }

    fn integrate(&mut self, delta: &UpdateDelta) -> Result<Integration, StoreError> {
        let tree = match self.mirror.merge(&delta.payload) {
            Ok(Some(tree)) => tree,
            Ok(None) => {
                self.mirror = Mirror::of(&self.doc, self.replica.get())?;
                return Ok(Integration::Deferred);
            }
            Err(e) => {
                log::warn!(
                    "Rejecting delta {}#{} for '{}': {e}",
                    delta.origin,
                    delta.seq,
                    self.doc_id
                );
                self.mirror = Mirror::of(&self.doc, self.replica.get())?;
                return Err(e);
            }
        };
        let update = Update::decode_v1(&delta.payload).map_err(|e| StoreError::MalformedDelta(e.to_string()))?;

        let before = self.doc.transact().state_vector();
        {
            let mut txn = self.doc.transact_mut_with(ORIGIN_REMOTE);
            txn.apply_update(update)
                .map_err(|e| StoreError::MalformedDelta(e.to_string()))?;
        }
        let after = self.doc.transact().state_vector();
        if before == after && tree == *self.tree {
            return Ok(Integration::Duplicate);
        }

        self.tree = Arc::new(tree);
        self.notify(&ChangeEvent {
            origin: ChangeOrigin::Remote(delta.origin),
            delta: delta.clone(),
            tree: self.tree.clone(),
        });
        Ok(Integration::Applied)
    }

    // ─── State exchange ───────────────────────────────────────────────

    /// Complete, order-independent serialization.
    pub fn serialize(&self) -> Snapshot {
        let state = self
            .doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default());
        Snapshot {
            tree: (*self.tree).clone(),
            state: Some(state),
        }
    }

    /// Encoded state vector (the revision clock).
    pub fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    /// Everything this replica has that a peer with `state_vector` lacks.
    pub fn diff_since(&self, state_vector: &[u8]) -> Result<Vec<u8>, StoreError> {
        let remote = StateVector::decode_v1(state_vector)
            .map_err(|e| StoreError::MalformedDelta(e.to_string()))?;
        Ok(self.doc.transact().encode_diff_v1(&remote))
    }

    /// [`Self::diff_since`] wrapped as an unsequenced delta from this replica.
    pub fn catch_up(&self, state_vector: &[u8]) -> Result<UpdateDelta, StoreError> {
        Ok(UpdateDelta {
            doc_id: self.doc_id.clone(),
            origin: self.replica,
            seq: 0,
            payload: self.diff_since(state_vector)?,
        })
    }

    // ─── Listeners ────────────────────────────────────────────────────

    /// Registers a listener, run synchronously after every change.
    pub fn subscribe<F>(&mut self, listener: F) -> ListenerId
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(existing, _)| *existing != id);
        self.listeners.len() != before
    }

    fn notify(&self, event: &ChangeEvent) {
        for (_, listener) in &self.listeners {
            listener(event);
        }
    }
}

impl fmt::Debug for ReplicatedDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicatedDocument")
            .field("doc_id", &self.doc_id)
            .field("replica", &self.replica)
            .field("seq", &self.seq)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Block, Marks, MarkChange, Mark, TextRun};
    use std::sync::Mutex;
    use yrs::{XmlElementPrelim, XmlFragment};

    fn replica(id: u64) -> ReplicatedDocument {
        ReplicatedDocument::create("abc", ReplicaId::new(id).unwrap(), None).unwrap()
    }

    /// Decoded, so equal clocks compare equal whatever their encoding order.
    fn clock(doc: &ReplicatedDocument) -> StateVector {
        StateVector::decode_v1(&doc.state_vector()).unwrap()
    }

    fn type_text(doc: &mut ReplicatedDocument, offset: u32, text: &str) -> UpdateDelta {
        doc.apply_local_mutation(Mutation::insert_text(BlockPath::root(0), offset, text, Marks::plain()))
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_replica_id_reserves_seed_client() {
        assert!(ReplicaId::new(0).is_none());
        assert!(ReplicaId::new(1 << 53).is_none());
        for _ in 0..32 {
            let id = ReplicaId::random().get();
            assert!(id >= 1 && id <= MAX_REPLICA_ID);
        }
    }

    #[test]
    fn test_fresh_replicas_share_seed() {
        let a = replica(1);
        let b = replica(2);
        assert_eq!(*a.tree(), DocumentTree::empty());
        assert_eq!(clock(&a), clock(&b));
    }

    #[test]
    fn test_local_mutation_sequences_deltas() {
        let mut a = replica(1);
        let first = type_text(&mut a, 0, "Hel");
        let second = type_text(&mut a, 3, "lo");
        assert_eq!((first.seq, second.seq), (1, 2));
        assert_eq!(first.origin, a.replica_id());
        assert_eq!(a.tree().plain_text(), "Hello");
    }

    #[test]
    fn test_invalid_mutation_changes_nothing() {
        let mut a = replica(1);
        let sv = clock(&a);
        let err = a
            .apply_local_mutation(Mutation::insert_text(BlockPath::root(3), 0, "x", Marks::plain()))
            .unwrap_err();
        assert_eq!(err, StoreError::InvalidPath(BlockPath::root(3)));
        assert_eq!(clock(&a), sv);
    }

    #[test]
    fn test_remote_delta_applies_once() {
        let mut a = replica(1);
        let mut b = replica(2);
        let delta = type_text(&mut a, 0, "hi");

        assert_eq!(b.apply_remote_delta(&delta).unwrap(), ApplyOutcome::Applied);
        assert_eq!(b.apply_remote_delta(&delta).unwrap(), ApplyOutcome::Duplicate);
        assert_eq!(b.tree(), a.tree());

        let unsequenced = UpdateDelta { seq: 0, ..delta };
        assert_eq!(b.apply_remote_delta(&unsequenced).unwrap(), ApplyOutcome::Duplicate);
    }

    #[test]
    fn test_echo_and_foreign_document_rejected() {
        let mut a = replica(1);
        let delta = type_text(&mut a, 0, "x");
        assert_eq!(a.apply_remote_delta(&delta).unwrap_err(), StoreError::Echo);

        let mut b = replica(2);
        let foreign = UpdateDelta {
            doc_id: "other".into(),
            ..delta
        };
        assert!(matches!(
            b.apply_remote_delta(&foreign),
            Err(StoreError::WrongDocument { .. })
        ));
    }

    #[test]
    fn test_garbage_payload_rejected() {
        let mut b = replica(2);
        let delta = UpdateDelta {
            doc_id: "abc".into(),
            origin: ReplicaId::new(9).unwrap(),
            seq: 1,
            payload: vec![0xff, 0x13, 0x07],
        };
        assert!(matches!(
            b.apply_remote_delta(&delta),
            Err(StoreError::MalformedDelta(_))
        ));
        assert_eq!(*b.tree(), DocumentTree::empty());
    }

    #[test]
    fn test_schema_violating_delta_rejected() {
        let b = replica(2);
        let rogue = Doc::with_options(doc_options(77));
        let root = rogue.get_or_insert_xml_fragment(ROOT_FRAGMENT);
        let seed = Update::decode_v1(b.serialize().state.as_deref().unwrap()).unwrap();
        rogue.transact_mut().apply_update(seed).unwrap();
        let before = rogue.transact().state_vector();
        {
            let mut txn = rogue.transact_mut();
            root.insert(&mut txn, 1, XmlElementPrelim::empty("blockquote"));
        }
        let payload = rogue.transact().encode_state_as_update_v1(&before);

        let mut b = b;
        let delta = UpdateDelta {
            doc_id: "abc".into(),
            origin: ReplicaId::new(77).unwrap(),
            seq: 1,
            payload,
        };
        assert!(matches!(
            b.apply_remote_delta(&delta),
            Err(StoreError::MalformedDelta(_))
        ));
        assert_eq!(*b.tree(), DocumentTree::empty());
        assert_eq!(b.serialize().state, replica(3).serialize().state);
    }

    #[test]
    fn test_premature_delta_deferred_until_dependency_arrives() {
        let mut a = replica(1);
        let mut b = replica(2);
        let first = type_text(&mut a, 0, "ab");
        let second = type_text(&mut a, 2, "cd");

        assert_eq!(b.apply_remote_delta(&second).unwrap(), ApplyOutcome::Deferred);
        assert_eq!(b.pending_len(), 1);
        assert_eq!(b.apply_remote_delta(&second).unwrap(), ApplyOutcome::Duplicate);
        assert_eq!(b.tree().plain_text(), "");

        assert_eq!(b.apply_remote_delta(&first).unwrap(), ApplyOutcome::Applied);
        assert_eq!(b.pending_len(), 0);
        assert_eq!(b.tree().plain_text(), "abcd");
    }

    #[test]
    fn test_pending_buffer_is_bounded() {
        let mut a = replica(1);
        let mut b = ReplicatedDocument::with_config(
            "abc",
            ReplicaId::new(2).unwrap(),
            None,
            ReplicaConfig {
                max_pending_deltas: 2,
            },
        )
        .unwrap();
        let _first = type_text(&mut a, 0, "a");
        for i in 1..=3 {
            let delta = type_text(&mut a, i, "b");
            assert_eq!(b.apply_remote_delta(&delta).unwrap(), ApplyOutcome::Deferred);
        }
        assert_eq!(b.pending_len(), 2);
    }

    #[test]
    fn test_concurrent_inserts_order_by_replica_id() {
        let mut a = replica(1);
        let mut b = replica(2);
        let from_a = type_text(&mut a, 0, "foo");
        let from_b = type_text(&mut b, 0, "bar");
        a.apply_remote_delta(&from_b).unwrap();
        b.apply_remote_delta(&from_a).unwrap();
        assert_eq!(a.tree(), b.tree());
        assert_eq!(a.tree().plain_text(), "foobar");
    }

    #[test]
    fn test_undo_only_reverts_local_edits() {
        let mut a = replica(1);
        let mut b = replica(2);
        let local = type_text(&mut a, 0, "mine ");
        b.apply_remote_delta(&local).unwrap();
        let remote = type_text(&mut b, 5, "theirs");
        a.apply_remote_delta(&remote).unwrap();
        assert_eq!(a.tree().plain_text(), "mine theirs");

        let undo = a.undo().unwrap().unwrap();
        assert_eq!(a.tree().plain_text(), "theirs");
        assert!(a.can_redo());
        assert!(a.undo().unwrap().is_none());

        b.apply_remote_delta(&undo).unwrap();
        assert_eq!(b.tree().plain_text(), "theirs");

        let redo = a.redo().unwrap().unwrap();
        b.apply_remote_delta(&redo).unwrap();
        assert!(a.tree().plain_text().contains("mine "));
        assert_eq!(a.tree(), b.tree());
    }

    #[test]
    fn test_each_mutation_is_one_undo_step() {
        let mut a = replica(1);
        type_text(&mut a, 0, "one");
        type_text(&mut a, 3, " two");
        a.undo().unwrap();
        assert_eq!(a.tree().plain_text(), "one");
    }

    #[test]
    fn test_snapshot_hydrates_identical_replica() {
        let mut a = replica(1);
        type_text(&mut a, 0, "persisted");
        a.apply_local_mutation(Mutation::FormatText {
            path: BlockPath::root(0),
            offset: 0,
            len: 4,
            change: MarkChange::Set(Mark::Bold),
        })
        .unwrap();
        let snapshot = a.serialize();

        let b = ReplicatedDocument::create("abc", ReplicaId::new(2).unwrap(), Some(&snapshot)).unwrap();
        assert_eq!(b.tree(), a.tree());
        assert_eq!(clock(&b), clock(&a));
        assert_eq!(
            b.tree().blocks()[0].runs().unwrap()[0],
            TextRun::styled("pers", Marks::bold())
        );
    }

    #[test]
    fn test_tree_only_snapshots_seed_deterministically() {
        let tree = DocumentTree::new(vec![Block::paragraph("legacy")]).unwrap();
        let snapshot = Snapshot::from_tree(tree.clone());
        let mut a = ReplicatedDocument::create("abc", ReplicaId::new(1).unwrap(), Some(&snapshot)).unwrap();
        let mut b = ReplicatedDocument::create("abc", ReplicaId::new(2).unwrap(), Some(&snapshot)).unwrap();
        assert_eq!(*a.tree(), tree);

        let da = type_text(&mut a, 6, "!");
        let db = type_text(&mut b, 0, ">");
        a.apply_remote_delta(&db).unwrap();
        b.apply_remote_delta(&da).unwrap();
        assert_eq!(a.tree().plain_text(), ">legacy!");
        assert_eq!(a.tree(), b.tree());
    }

    #[test]
    fn test_catch_up_diff_converges() {
        let mut a = replica(1);
        let mut b = replica(2);
        type_text(&mut a, 0, "early");
        let diff = a.catch_up(&b.state_vector()).unwrap();
        assert_eq!(diff.seq, 0);
        assert_eq!(b.apply_remote_delta(&diff).unwrap(), ApplyOutcome::Applied);
        assert_eq!(b.tree(), a.tree());
        assert!(matches!(a.diff_since(&[0xff, 0xff]), Err(StoreError::MalformedDelta(_))));
    }

    #[test]
    fn test_listeners_receive_local_and_remote_events() {
        let mut a = replica(1);
        let mut b = replica(2);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let id = b.subscribe(move |event| sink.lock().unwrap().push(event.origin));

        let delta = type_text(&mut a, 0, "x");
        b.apply_remote_delta(&delta).unwrap();
        type_text(&mut b, 1, "y");
        assert_eq!(
            *seen.lock().unwrap(),
            vec![ChangeOrigin::Remote(a.replica_id()), ChangeOrigin::Local]
        );

        assert!(b.unsubscribe(id));
        type_text(&mut b, 2, "z");
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_seen_deltas_compact_to_watermark() {
        let origin = ReplicaId::new(5).unwrap();
        let mut seen = SeenDeltas::default();
        for seq in [1, 3, 4] {
            seen.insert(origin, seq);
        }
        assert!(seen.contains(origin, 1) && seen.contains(origin, 4));
        assert!(!seen.contains(origin, 2));
        assert_eq!(seen.ahead_len(), 2);

        seen.insert(origin, 2);
        assert_eq!(seen.ahead_len(), 0);
        assert_eq!(seen.contiguous[&origin], 4);
        assert!(!seen.contains(ReplicaId::new(6).unwrap(), 1));
    }

    #[test]
    fn test_long_session_keeps_no_per_delta_state() {
        let mut a = replica(1);
        let mut b = replica(2);
        for i in 0..2000 {
            let delta = type_text(&mut a, i, "x");
            assert_eq!(b.apply_remote_delta(&delta).unwrap(), ApplyOutcome::Applied);
        }
        assert_eq!(b.seen.ahead_len(), 0);
        assert_eq!(b.tree(), a.tree());
    }

    #[test]
    fn test_gap_in_sequence_stays_bounded() {
        let origin = ReplicaId::new(5).unwrap();
        let mut seen = SeenDeltas::default();
        for seq in 2..2000 {
            seen.insert(origin, seq);
        }
        assert_eq!(seen.ahead_len(), MAX_SEEN_AHEAD);
        assert!(seen.contains(origin, 1999));
    }

    #[test]
    fn test_valid_delta_applies_after_rejected_one() {
        let mut a = replica(1);
        let mut b = replica(2);
        let garbage = UpdateDelta {
            doc_id: "abc".into(),
            origin: ReplicaId::new(9).unwrap(),
            seq: 1,
            payload: vec![0xff, 0x13, 0x07],
        };
        assert!(b.apply_remote_delta(&garbage).is_err());

        type_text(&mut b, 0, "b");
        let first = type_text(&mut a, 0, "a");
        let second = type_text(&mut a, 1, "a");
        assert_eq!(b.apply_remote_delta(&second).unwrap(), ApplyOutcome::Deferred);
        assert_eq!(b.apply_remote_delta(&first).unwrap(), ApplyOutcome::Applied);
        assert_eq!(b.tree().plain_text(), "aab");
        assert_eq!(b.pending_len(), 0);
    }
}
