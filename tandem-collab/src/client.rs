//! WebSocket channel provider speaking the relay [`Frame`] protocol.
//!
//! ```text
//! open_channel ──► connect ──► Join ──► (Joined | Error | timeout)
//!                                │
//!          writer task ◄── mpsc ◄┴── WsSink::publish / close
//!          reader task ──► Broadcast from others ──► ChannelEvent::Message
//!                       ──► Lagged ──► ChannelEvent::Lagged
//!                       ──► Ping ──► Pong
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use uuid::Uuid;

use crate::channel::{Channel, ChannelError, ChannelEvent, ChannelProvider, ChannelSink, INBOUND_CAPACITY};
use crate::protocol::{Frame, FrameKind};

/// Opens channels on a relay at `url` (e.g. `ws://127.0.0.1:9090`).
#[derive(Debug, Clone)]
pub struct WsChannelProvider {
    url: String,
    join_timeout: Duration,
}

impl WsChannelProvider {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            join_timeout: Duration::from_secs(5),
        }
    }

    /// How long to wait for the relay to acknowledge a subscription.
    pub fn with_join_timeout(mut self, join_timeout: Duration) -> Self {
        self.join_timeout = join_timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

fn binary(frame: &Frame) -> Result<Message, ChannelError> {
    Ok(Message::Binary(frame.encode()?.into()))
}

/// Wait for the relay's answer to a Join.
async fn await_joined<S>(reader: &mut S, topic: &str) -> Result<(), ChannelError>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    while let Some(msg) = reader.next().await {
        match msg {
            Ok(Message::Binary(data)) => match Frame::decode(&data)?.kind {
                FrameKind::Joined { .. } => return Ok(()),
                FrameKind::Error { reason } => {
                    return Err(ChannelError::Rejected {
                        topic: topic.to_string(),
                        reason,
                    })
                }
                _ => {}
            },
            Ok(Message::Close(_)) | Err(_) => break,
            _ => {}
        }
    }
    Err(ChannelError::Closed)
}

#[async_trait]
impl ChannelProvider for WsChannelProvider {
    async fn open_channel(&self, topic: &str, member: Uuid) -> Result<Channel, ChannelError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| ChannelError::Connect(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        ws_writer
            .send(binary(&Frame::join(member, topic))?)
            .await
            .map_err(|e| ChannelError::Connect(e.to_string()))?;

        match tokio::time::timeout(self.join_timeout, await_joined(&mut ws_reader, topic)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ChannelError::Connect(format!(
                    "no acknowledgement for '{topic}' within {:?}",
                    self.join_timeout
                )))
            }
        }

        // Writer task: forward outgoing queue to the socket
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(INBOUND_CAPACITY);
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if ws_writer.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        // Reader task: relay frames to the inbound queue
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let pong_tx = out_tx.clone();
        let reader_topic = topic.to_string();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let data = match msg {
                    Ok(Message::Binary(data)) => data,
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => continue,
                };
                let frame = match Frame::decode(&data) {
                    Ok(frame) => frame,
                    Err(e) => {
                        log::warn!("Undecodable frame on '{reader_topic}': {e}");
                        continue;
                    }
                };
                let event = match frame.kind {
                    FrameKind::Broadcast { event, payload, .. } if frame.sender != member => {
                        ChannelEvent::Message {
                            event,
                            sender: frame.sender,
                            payload,
                        }
                    }
                    FrameKind::Lagged { missed } => ChannelEvent::Lagged(missed),
                    FrameKind::Ping => {
                        if let Ok(pong) = binary(&Frame::pong(member)) {
                            let _ = pong_tx.send(pong).await;
                        }
                        continue;
                    }
                    FrameKind::Error { reason } => {
                        log::warn!("Relay error on '{reader_topic}': {reason}");
                        continue;
                    }
                    _ => continue,
                };
                if inbound_tx.send(event).await.is_err() {
                    break;
                }
            }
            let _ = inbound_tx.send(ChannelEvent::Closed).await;
            log::debug!("Connection for '{reader_topic}' ended");
        });

        log::info!("Member {member} joined '{topic}' at {}", self.url);
        let sink = WsSink {
            topic: topic.to_string(),
            member,
            out: out_tx,
            closed: AtomicBool::new(false),
        };
        Ok(Channel::new(topic, member, Arc::new(sink), inbound_rx))
    }
}

struct WsSink {
    topic: String,
    member: Uuid,
    out: mpsc::Sender<Message>,
    closed: AtomicBool,
}

#[async_trait]
impl ChannelSink for WsSink {
    async fn publish(&self, event: &str, payload: Vec<u8>) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        let frame = Frame::broadcast(self.member, self.topic.as_str(), event, payload);
        self.out
            .send(binary(&frame)?)
            .await
            .map_err(|_| ChannelError::Closed)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(leave) = binary(&Frame::leave(self.member)) {
            let _ = self.out.send(leave).await;
        }
        let _ = self.out.send(Message::Close(None)).await;
    }
}
