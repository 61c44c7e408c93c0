//! One open document: replica, editor, save scheduler and realtime channel.
//!
//! ```text
//!                 ┌────────────── Mutex<Editing> ───────────────┐
//! bind_command ──►│ EditorBinding ──► ReplicatedDocument         │◄── handle_inbound ◄── RealtimeChannel
//!                 └──────────────────────┬──────────────────────┘
//!                                        │ listener
//!                                        ▼
//!                        broadcast::Sender<ChangeEvent>
//!                          │                        │
//!                   persist_loop               publish_loop ──► RealtimeChannel
//!                 (local → mark_dirty)     (local → publish, outbox → catch-up)
//! ```
//!
//! The replica is only ever touched synchronously under the mutex; all I/O
//! happens in the pumps.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tandem_core::{
    ChangeEvent, ChangeOrigin, CommandOutcome, DocumentTree, EditorBinding, EditorCommand,
    ListenerId, Mutation, ReplicaConfig, ReplicaId, ReplicatedDocument, Selection, StoreError,
    UpdateDelta, ViewModel,
};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::CollabError;
use crate::identity::SessionContext;
use crate::persistence::{PersistenceBridge, SaveScheduler, SaveStatus};
use crate::presence::ConnectionState;
use crate::protocol::DocMessage;
use crate::transport::{RealtimeChannel, RealtimeTransport, TransportEvent};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Quiet time after the last local change before a save
    pub save_quiet_period: Duration,
    /// Delay before retrying a failed save
    pub save_retry_interval: Duration,
    /// Change events buffered per pump before it lags
    pub event_capacity: usize,
    pub replica: ReplicaConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            save_quiet_period: Duration::from_secs(1),
            save_retry_interval: Duration::from_secs(5),
            event_capacity: 1024,
            replica: ReplicaConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Short timers for tests.
    pub fn for_testing() -> Self {
        Self {
            save_quiet_period: Duration::from_millis(50),
            save_retry_interval: Duration::from_millis(200),
            ..Self::default()
        }
    }
}

struct Editing {
    doc: ReplicatedDocument,
    editor: EditorBinding,
}

fn lock(state: &Mutex<Editing>) -> MutexGuard<'_, Editing> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

enum Outgoing {
    SyncRequest(Vec<u8>),
    SyncResponse(Option<ReplicaId>, UpdateDelta),
}

/// What `close` releases; also released on drop.
struct Live {
    events: broadcast::Sender<ChangeEvent>,
    listener: ListenerId,
    publisher: JoinHandle<()>,
    persister: JoinHandle<()>,
}

/// An open document. Call [`DocumentSession::close`]; a session dropped
/// without it is torn down in the background.
pub struct DocumentSession {
    doc_id: String,
    replica: ReplicaId,
    title: Mutex<String>,
    state: Arc<Mutex<Editing>>,
    bridge: PersistenceBridge,
    saver: Arc<SaveScheduler>,
    channel: Arc<RealtimeChannel>,
    live: Option<Live>,
}

impl DocumentSession {
    /// Load `doc_id` for the signed-in identity and join its channel.
    ///
    /// Fails when the document is missing, the identity has no access, or
    /// the stored content cannot be read. A channel that cannot be opened
    /// only leaves the session local-only.
    pub async fn open(
        doc_id: &str,
        ctx: &SessionContext,
        bridge: &PersistenceBridge,
        transport: &RealtimeTransport,
        config: SessionConfig,
    ) -> Result<Self, CollabError> {
        let (record, snapshot) = bridge.load(doc_id, ctx.identity()).await?;
        let replica = ReplicaId::random();
        let mut doc = ReplicatedDocument::with_config(doc_id, replica, Some(&snapshot), config.replica.clone())?;

        let (events, _) = broadcast::channel(config.event_capacity);
        let sender = events.clone();
        let listener = doc.subscribe(move |event| {
            let _ = sender.send(event.clone());
        });
        let editor = EditorBinding::attach(&mut doc);
        let state = Arc::new(Mutex::new(Editing { doc, editor }));

        let source: Weak<Mutex<Editing>> = Arc::downgrade(&state);
        let saver = Arc::new(SaveScheduler::spawn(
            bridge.clone(),
            doc_id,
            move || {
                let state = source.upgrade()?;
                let snapshot = lock(&state).doc.serialize();
                Some(snapshot)
            },
            config.save_quiet_period,
            config.save_retry_interval,
        ));
        let persister = tokio::spawn(persist_loop(events.subscribe(), saver.clone()));
        let publisher_events = events.subscribe();

        let channel = Arc::new(transport.open(doc_id, replica).await);
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let inbound_state = Arc::downgrade(&state);
        channel.on_receive(move |event| handle_inbound(&inbound_state, &outbox, replica, event));
        let publisher = tokio::spawn(publish_loop(
            channel.clone(),
            publisher_events,
            outbox_rx,
            Arc::downgrade(&state),
        ));

        let state_vector = lock(&state).doc.state_vector();
        if let Err(e) = channel.request_sync(state_vector).await {
            log::warn!("Catch-up request for '{doc_id}' failed: {e}");
        }

        log::info!(
            "Opened '{doc_id}' as replica {replica} ({})",
            channel.status()
        );
        Ok(Self {
            doc_id: doc_id.to_string(),
            replica,
            title: Mutex::new(record.title),
            state,
            bridge: bridge.clone(),
            saver,
            channel,
            live: Some(Live {
                events,
                listener,
                publisher,
                persister,
            }),
        })
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica
    }

    pub fn title(&self) -> String {
        self.title
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub async fn rename(&self, title: &str) -> Result<(), CollabError> {
        self.bridge.update_title(&self.doc_id, title).await?;
        *self.title.lock().unwrap_or_else(PoisonError::into_inner) = title.to_string();
        Ok(())
    }

    /// Run one editor command. Its delta, if any, is also broadcast and saved.
    pub fn bind_command(&self, command: EditorCommand) -> Result<CommandOutcome, StoreError> {
        let mut guard = lock(&self.state);
        let Editing { doc, editor } = &mut *guard;
        editor.bind_command(doc, command)
    }

    pub fn apply_local_mutation(&self, mutation: Mutation) -> Result<Option<UpdateDelta>, StoreError> {
        lock(&self.state).doc.apply_local_mutation(mutation)
    }

    pub fn set_selection(&self, selection: Selection) {
        lock(&self.state).editor.set_selection(selection);
    }

    pub fn render_view(&self) -> ViewModel {
        let guard = lock(&self.state);
        guard.editor.render_view(&guard.doc)
    }

    /// Changes whenever the tree does, whatever the origin.
    pub fn watch_view(&self) -> watch::Receiver<Arc<DocumentTree>> {
        lock(&self.state).editor.watch()
    }

    pub fn tree(&self) -> Arc<DocumentTree> {
        lock(&self.state).doc.tree()
    }

    pub fn state_vector(&self) -> Vec<u8> {
        lock(&self.state).doc.state_vector()
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEvent> {
        match &self.live {
            Some(live) => live.events.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    pub fn connection_status(&self) -> ConnectionState {
        self.channel.status()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.channel.presence().watch()
    }

    pub fn save_status(&self) -> watch::Receiver<SaveStatus> {
        self.saver.status()
    }

    /// Write the current state now instead of waiting for the quiet period.
    pub async fn save(&self) -> Result<(), CollabError> {
        self.saver.mark_dirty();
        self.saver.flush().await
    }

    /// Publish pending deltas, write once more, leave the channel.
    ///
    /// The channel is released even when the final write fails; the write
    /// error is returned.
    pub async fn close(mut self) -> Result<(), CollabError> {
        let Some(live) = self.live.take() else {
            return Ok(());
        };
        let teardown = Teardown {
            doc_id: self.doc_id.clone(),
            state: self.state.clone(),
            saver: self.saver.clone(),
            channel: self.channel.clone(),
        };
        drop(self);
        teardown.run(live).await
    }
}

impl Drop for DocumentSession {
    fn drop(&mut self) {
        let Some(live) = self.live.take() else {
            return;
        };
        log::warn!("Session for '{}' dropped without close", self.doc_id);
        let teardown = Teardown {
            doc_id: self.doc_id.clone(),
            state: self.state.clone(),
            saver: self.saver.clone(),
            channel: self.channel.clone(),
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    let _ = teardown.run(live).await;
                });
            }
            Err(_) => {
                // No runtime left to drive the pumps; stop them here.
                teardown.release(live.listener);
                live.publisher.abort();
                live.persister.abort();
            }
        }
    }
}

struct Teardown {
    doc_id: String,
    state: Arc<Mutex<Editing>>,
    saver: Arc<SaveScheduler>,
    channel: Arc<RealtimeChannel>,
}

impl Teardown {
    /// Detach the editor and drop the replica listener.
    fn release(&self, listener: ListenerId) {
        let mut guard = lock(&self.state);
        let Editing { doc, editor } = &mut *guard;
        editor.detach(doc);
        doc.unsubscribe(listener);
    }

    async fn run(self, live: Live) -> Result<(), CollabError> {
        let Live {
            events,
            listener,
            publisher,
            persister,
        } = live;
        self.release(listener);
        let Self {
            doc_id,
            saver,
            channel,
            ..
        } = self;

        // Both pumps drain what is buffered and stop once the last sender is gone.
        drop(events);
        if let Err(e) = publisher.await {
            log::error!("Publish task of '{doc_id}' failed: {e}");
        }
        if let Err(e) = persister.await {
            log::error!("Persist task of '{doc_id}' failed: {e}");
        }

        let flushed = saver.flush().await;
        if let Ok(saver) = Arc::try_unwrap(saver) {
            saver.shutdown().await;
        }
        channel.close().await;

        match &flushed {
            Ok(()) => log::info!("Closed '{doc_id}'"),
            Err(e) => log::warn!("Closed '{doc_id}' with unsaved changes: {e}"),
        }
        flushed
    }
}

/// Runs on the channel pump, which must not keep the session alive.
fn handle_inbound(
    state: &Weak<Mutex<Editing>>,
    outbox: &mpsc::UnboundedSender<Outgoing>,
    replica: ReplicaId,
    event: TransportEvent,
) {
    let Some(state) = state.upgrade() else {
        return;
    };
    let state = &*state;
    match event {
        TransportEvent::Message(DocMessage::Update(delta)) => apply(state, &delta),
        TransportEvent::Message(DocMessage::SyncRequest { from, state_vector }) => {
            if from == replica {
                return;
            }
            match lock(state).doc.catch_up(&state_vector) {
                Ok(diff) => {
                    let _ = outbox.send(Outgoing::SyncResponse(Some(from), diff));
                }
                Err(e) => log::warn!("Ignoring catch-up request from {from}: {e}"),
            }
        }
        TransportEvent::Message(DocMessage::SyncResponse { to, diff }) => {
            if to.map_or(true, |to| to == replica) {
                apply(state, &diff);
            }
        }
        TransportEvent::Lagged(n) => {
            log::warn!("Replica {replica} missed {n} messages, requesting catch-up");
            let state_vector = lock(state).doc.state_vector();
            let _ = outbox.send(Outgoing::SyncRequest(state_vector));
        }
        TransportEvent::Disconnected => {
            log::info!("Replica {replica} continues local-only");
        }
    }
}

fn apply(state: &Mutex<Editing>, delta: &UpdateDelta) {
    match lock(state).doc.apply_remote_delta(delta) {
        Ok(outcome) => log::trace!("Delta {}#{}: {outcome:?}", delta.origin, delta.seq),
        Err(StoreError::Echo) => log::trace!("Ignoring own delta #{}", delta.seq),
        Err(e) => log::warn!("Dropping delta {}#{}: {e}", delta.origin, delta.seq),
    }
}

async fn persist_loop(mut events: broadcast::Receiver<ChangeEvent>, saver: Arc<SaveScheduler>) {
    loop {
        match events.recv().await {
            Ok(event) if event.origin == ChangeOrigin::Local => saver.mark_dirty(),
            Ok(_) => {}
            // Lost events may have been local.
            Err(broadcast::error::RecvError::Lagged(_)) => saver.mark_dirty(),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn publish_loop(
    channel: Arc<RealtimeChannel>,
    mut events: broadcast::Receiver<ChangeEvent>,
    mut outbox: mpsc::UnboundedReceiver<Outgoing>,
    state: Weak<Mutex<Editing>>,
) {
    loop {
        let sent = tokio::select! {
            biased;
            received = events.recv() => match received {
                Ok(event) if event.origin == ChangeOrigin::Local => channel.publish(&event.delta).await,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    // Some local deltas never went out; push the whole state instead.
                    log::warn!("Publisher for '{}' lagged by {n} changes", channel.doc_id());
                    let Some(state) = state.upgrade() else { break };
                    let full = {
                        let guard = lock(&state);
                        UpdateDelta {
                            doc_id: guard.doc.doc_id().to_string(),
                            origin: guard.doc.replica_id(),
                            seq: 0,
                            payload: guard.doc.serialize().state.unwrap_or_default(),
                        }
                    };
                    channel.respond_sync(None, full).await
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            Some(outgoing) = outbox.recv() => match outgoing {
                Outgoing::SyncRequest(state_vector) => channel.request_sync(state_vector).await,
                Outgoing::SyncResponse(to, diff) => channel.respond_sync(to, diff).await,
            },
        };
        if let Err(e) = sent {
            log::debug!("Dropped outgoing message for '{}': {e}", channel.doc_id());
        }
    }
}
