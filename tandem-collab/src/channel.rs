//! Broadcast channel seam.
//!
//! A [`ChannelProvider`] opens a [`Channel`] on a topic for one member. The
//! channel publishes `(event, payload)` pairs to the other members and
//! yields theirs, in per-sender order, as [`ChannelEvent`]s. A member never
//! receives its own broadcasts.
//!
//! [`LocalHub`] is the in-process provider; the WebSocket one lives in
//! [`crate::client`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use uuid::Uuid;

use crate::broadcast::{Envelope, RoomManager};
use crate::protocol::ProtocolError;

/// Inbound buffer per channel before the forwarder waits on the consumer.
pub const INBOUND_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("could not connect: {0}")]
    Connect(String),
    #[error("subscription to '{topic}' rejected: {reason}")]
    Rejected { topic: String, reason: String },
    #[error("channel closed")]
    Closed,
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Message {
        event: String,
        sender: Uuid,
        payload: Vec<u8>,
    },
    /// `n` broadcasts from other members were lost.
    Lagged(u64),
    /// The channel is gone; nothing follows.
    Closed,
}

/// Outbound half of a channel.
#[async_trait]
pub trait ChannelSink: Send + Sync {
    async fn publish(&self, event: &str, payload: Vec<u8>) -> Result<(), ChannelError>;

    /// Leave the topic. Idempotent.
    async fn close(&self);
}

#[async_trait]
pub trait ChannelProvider: Send + Sync {
    async fn open_channel(&self, topic: &str, member: Uuid) -> Result<Channel, ChannelError>;
}

/// One member's subscription to one topic.
pub struct Channel {
    topic: String,
    member: Uuid,
    sink: Arc<dyn ChannelSink>,
    inbound: mpsc::Receiver<ChannelEvent>,
}

impl Channel {
    pub fn new(
        topic: impl Into<String>,
        member: Uuid,
        sink: Arc<dyn ChannelSink>,
        inbound: mpsc::Receiver<ChannelEvent>,
    ) -> Self {
        Self {
            topic: topic.into(),
            member,
            sink,
            inbound,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn member(&self) -> Uuid {
        self.member
    }

    pub async fn publish(&self, event: &str, payload: Vec<u8>) -> Result<(), ChannelError> {
        self.sink.publish(event, payload).await
    }

    /// Next inbound event; `None` once the provider side is gone.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        self.inbound.recv().await
    }

    pub async fn close(&self) {
        self.sink.close().await
    }

    /// Separate the halves so receiving can move into its own task.
    pub fn split(self) -> (Arc<dyn ChannelSink>, mpsc::Receiver<ChannelEvent>) {
        (self.sink, self.inbound)
    }
}

// ─── In-process provider ──────────────────────────────────────────────

/// Rooms shared by every channel opened from clones of the same hub.
#[derive(Clone)]
pub struct LocalHub {
    rooms: Arc<RoomManager>,
    offline: Arc<AtomicBool>,
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new(256)
    }
}

impl LocalHub {
    /// `capacity` bounds how far a member may fall behind before it lags.
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: Arc::new(RoomManager::new(capacity)),
            offline: Arc::new(AtomicBool::new(false)),
        }
    }

    /// While offline, opening a channel fails as an unreachable server would.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.room_count().await
    }

    pub async fn member_count(&self, topic: &str) -> usize {
        match self.rooms.get(topic).await {
            Some(room) => room.member_count().await,
            None => 0,
        }
    }
}

#[async_trait]
impl ChannelProvider for LocalHub {
    async fn open_channel(&self, topic: &str, member: Uuid) -> Result<Channel, ChannelError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(ChannelError::Connect("hub is offline".into()));
        }
        let room = self.rooms.get_or_create(topic).await;
        let rx = room.add_member(member).await;
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (stop_tx, stop_rx) = oneshot::channel();
        tokio::spawn(forward(
            self.rooms.clone(),
            topic.to_string(),
            member,
            rx,
            inbound_tx,
            stop_rx,
        ));
        log::debug!("Member {member} joined '{topic}' on the local hub");

        let sink = LocalSink {
            topic: topic.to_string(),
            member,
            rooms: self.rooms.clone(),
            stop: Mutex::new(Some(stop_tx)),
            closed: AtomicBool::new(false),
        };
        Ok(Channel::new(topic, member, Arc::new(sink), inbound_rx))
    }
}

/// Room receiver → member inbound queue, skipping the member's own envelopes.
/// Leaves the room on exit, also when the sink was dropped without closing.
async fn forward(
    rooms: Arc<RoomManager>,
    topic: String,
    member: Uuid,
    mut rx: broadcast::Receiver<Envelope>,
    inbound: mpsc::Sender<ChannelEvent>,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        let event = tokio::select! {
            _ = &mut stop => ChannelEvent::Closed,
            received = rx.recv() => match received {
                Ok(envelope) if envelope.sender == member => continue,
                Ok(envelope) => ChannelEvent::Message {
                    event: envelope.event.to_string(),
                    sender: envelope.sender,
                    payload: envelope.payload.to_vec(),
                },
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Member {member} lagged by {n} messages");
                    ChannelEvent::Lagged(n)
                }
                Err(broadcast::error::RecvError::Closed) => ChannelEvent::Closed,
            },
        };
        let done = event == ChannelEvent::Closed;
        if inbound.send(event).await.is_err() || done {
            break;
        }
    }
    leave(&rooms, &topic, member).await;
}

async fn leave(rooms: &RoomManager, topic: &str, member: Uuid) {
    if let Some(room) = rooms.get(topic).await {
        room.remove_member(&member).await;
    }
    rooms.remove_if_empty(topic).await;
}

struct LocalSink {
    topic: String,
    member: Uuid,
    rooms: Arc<RoomManager>,
    stop: Mutex<Option<oneshot::Sender<()>>>,
    closed: AtomicBool,
}

#[async_trait]
impl ChannelSink for LocalSink {
    async fn publish(&self, event: &str, payload: Vec<u8>) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        let room = self.rooms.get(&self.topic).await.ok_or(ChannelError::Closed)?;
        room.broadcast(Envelope::new(self.member, event, payload));
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(stop) = self.stop.lock().await.take() {
            let _ = stop.send(());
        }
        leave(&self.rooms, &self.topic, self.member).await;
        log::debug!("Member {} left '{}'", self.member, self.topic);
    }
}
