//! Per-document realtime transport.
//!
//! ```text
//! RealtimeTransport::open("abc")
//!     │  topic "doc-abc" on the ChannelProvider
//!     ▼
//! RealtimeChannel ── publish(Update | SyncRequest | SyncResponse) ──► peers
//!     ▲
//!     └── on_receive(handler) ◄── DocMessage from peers (own traffic never arrives)
//! ```
//!
//! A channel that fails to open, or drops later, leaves the document in
//! local-only mode: publishing becomes a no-op and the status reads
//! `Disconnected`. There is no reconnect.

use std::sync::{Arc, Mutex};

use tandem_core::{ReplicaId, UpdateDelta};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::channel::{ChannelEvent, ChannelProvider, ChannelSink};
use crate::error::CollabError;
use crate::presence::{ConnectionState, Presence};
use crate::protocol::DocMessage;

/// Topic a document's replicas meet on.
pub fn topic_for(doc_id: &str) -> String {
    format!("doc-{doc_id}")
}

/// What a receive handler is called with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message(DocMessage),
    /// Some inbound messages were lost; a catch-up is due.
    Lagged(u64),
    Disconnected,
}

pub struct RealtimeTransport {
    provider: Arc<dyn ChannelProvider>,
}

impl RealtimeTransport {
    pub fn new(provider: Arc<dyn ChannelProvider>) -> Self {
        Self { provider }
    }

    /// Subscribe `replica` to the document's topic.
    ///
    /// Never fails: an unreachable provider yields a `Disconnected` channel.
    pub async fn open(&self, doc_id: &str, replica: ReplicaId) -> RealtimeChannel {
        let topic = topic_for(doc_id);
        let member = Uuid::new_v4();
        let presence = Presence::new();

        let (sink, inbound) = match self.provider.open_channel(&topic, member).await {
            Ok(channel) => {
                presence.set_subscribed();
                log::info!("Replica {replica} subscribed to '{topic}'");
                let (sink, inbound) = channel.split();
                (Some(sink), Some(inbound))
            }
            Err(e) => {
                presence.set_disconnected();
                log::warn!("Could not subscribe to '{topic}', editing locally only: {e}");
                (None, None)
            }
        };

        RealtimeChannel {
            doc_id: doc_id.to_string(),
            replica,
            topic,
            presence,
            sink,
            inbound: Mutex::new(inbound),
            pump: Mutex::new(None),
        }
    }
}

pub struct RealtimeChannel {
    doc_id: String,
    replica: ReplicaId,
    topic: String,
    presence: Presence,
    sink: Option<Arc<dyn ChannelSink>>,
    inbound: Mutex<Option<mpsc::Receiver<ChannelEvent>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl RealtimeChannel {
    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn presence(&self) -> &Presence {
        &self.presence
    }

    pub fn status(&self) -> ConnectionState {
        self.presence.get_status()
    }

    /// Broadcast a local delta of this replica.
    ///
    /// Returns whether it went out. Deltas of other replicas and unsequenced
    /// catch-up diffs are never re-broadcast.
    pub async fn publish(&self, delta: &UpdateDelta) -> Result<bool, CollabError> {
        if delta.origin != self.replica || delta.seq == 0 {
            log::trace!("Not re-broadcasting {}#{}", delta.origin, delta.seq);
            return Ok(false);
        }
        self.send(DocMessage::Update(delta.clone())).await
    }

    /// Ask peers for whatever is missing relative to `state_vector`.
    pub async fn request_sync(&self, state_vector: Vec<u8>) -> Result<bool, CollabError> {
        self.send(DocMessage::SyncRequest {
            from: self.replica,
            state_vector,
        })
        .await
    }

    /// Answer a catch-up request, or push state to everyone with `to = None`.
    pub async fn respond_sync(&self, to: Option<ReplicaId>, diff: UpdateDelta) -> Result<bool, CollabError> {
        self.send(DocMessage::SyncResponse { to, diff }).await
    }

    async fn send(&self, msg: DocMessage) -> Result<bool, CollabError> {
        let Some(sink) = &self.sink else {
            return Ok(false);
        };
        if self.status() != ConnectionState::Subscribed {
            return Ok(false);
        }
        let payload = msg.encode()?;
        match sink.publish(msg.event(), payload).await {
            Ok(()) => Ok(true),
            Err(e) => {
                log::warn!("Publishing on '{}' failed, going local-only: {e}", self.topic);
                self.presence.set_disconnected();
                Err(e.into())
            }
        }
    }

    /// Start delivering inbound events to `handler`, once each, in order.
    ///
    /// Only the first call installs a handler; later calls return false.
    pub fn on_receive<F>(&self, mut handler: F) -> bool
    where
        F: FnMut(TransportEvent) + Send + 'static,
    {
        let Some(mut inbound) = self.inbound.lock().ok().and_then(|mut slot| slot.take()) else {
            return false;
        };
        let presence = self.presence.clone();
        let topic = self.topic.clone();
        let replica = self.replica;

        let pump = tokio::spawn(async move {
            while let Some(event) = inbound.recv().await {
                match event {
                    ChannelEvent::Message {
                        event,
                        sender,
                        payload,
                    } => match DocMessage::decode(&event, &payload) {
                        Ok(msg) => handler(TransportEvent::Message(msg)),
                        Err(e) => log::warn!("Dropping '{event}' from {sender} on '{topic}': {e}"),
                    },
                    ChannelEvent::Lagged(n) => handler(TransportEvent::Lagged(n)),
                    ChannelEvent::Closed => break,
                }
            }
            if presence.set_disconnected() {
                log::warn!("Channel '{topic}' of replica {replica} dropped");
            }
            handler(TransportEvent::Disconnected);
        });
        if let Ok(mut slot) = self.pump.lock() {
            *slot = Some(pump);
        }
        true
    }

    /// Unsubscribe and release the channel.
    pub async fn close(&self) {
        if let Some(sink) = &self.sink {
            sink.close().await;
        }
        let pump = self.pump.lock().ok().and_then(|mut slot| slot.take());
        if let Some(pump) = pump {
            pump.abort();
        }
        self.presence.set_disconnected();
        log::debug!("Replica {} left '{}'", self.replica, self.topic);
    }
}
