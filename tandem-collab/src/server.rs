//! WebSocket relay with topic-based fan-out.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room ("doc-abc") ── BroadcastGroup
//! Client B ──┘                            │
//!                          ┌──────────────┼───────────────┐
//!                          ▼              ▼               ▼
//!                       Client A       Client B        Client C
//!                       (skipped)
//! ```
//!
//! The relay holds no document state. It forwards each `Broadcast` frame,
//! byte for byte, to every other member of the frame's topic, in the order
//! it received them. A member that falls behind gets a `Lagged` frame and is
//! expected to catch up through its peers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio::time::{interval_at, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::{Envelope, RoomManager};
use crate::protocol::{Frame, FrameKind};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum members per topic
    pub max_members_per_room: usize,
    /// Broadcast channel capacity per topic
    pub room_capacity: usize,
    /// Heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_members_per_room: 100,
            room_capacity: 256,
            heartbeat_interval_secs: 30,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

type ConnectionResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// The relay server.
pub struct RelayServer {
    config: ServerConfig,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<RelayStats>>,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Self {
        let rooms = Arc::new(RoomManager::new(config.room_capacity));
        Self {
            config,
            rooms,
            stats: Arc::new(RwLock::new(RelayStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", self.config.bind_addr);
        self.serve(listener).await?;
        Ok(())
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, rooms, stats.clone(), config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
                stats.write().await.active_connections -= 1;
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Arc<RoomManager>,
        stats: Arc<RwLock<RelayStats>>,
        config: ServerConfig,
    ) -> ConnectionResult {
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        log::info!("WebSocket connection established from {addr}");

        let mut joined: Option<(Uuid, String)> = None;
        let outcome = Self::relay(ws_stream, addr, &rooms, &stats, &config, &mut joined).await;

        // Cleanup: leave the room whatever ended the connection
        if let Some((member, topic)) = joined {
            leave(&rooms, &topic, member).await;
        }
        stats.write().await.active_rooms = rooms.room_count().await;
        outcome
    }

    /// Serve one upgraded connection until it closes. `joined` holds its
    /// subscription on return so the caller can clean up.
    async fn relay(
        ws_stream: WebSocketStream<TcpStream>,
        addr: SocketAddr,
        rooms: &RoomManager,
        stats: &RwLock<RelayStats>,
        config: &ServerConfig,
        joined: &mut Option<(Uuid, String)>,
    ) -> ConnectionResult {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let mut room_rx: Option<broadcast::Receiver<Envelope>> = None;

        let period = Duration::from_secs(config.heartbeat_interval_secs.max(1));
        let mut heartbeat = interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    let data = match msg {
                        Some(Ok(Message::Binary(data))) => data,
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                            continue;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }
                        Some(Ok(_)) => continue,
                    };
                    let frame = match Frame::decode(&data) {
                        Ok(frame) => frame,
                        Err(e) => {
                            log::warn!("Failed to decode frame from {addr}: {e}");
                            continue;
                        }
                    };
                    {
                        let mut s = stats.write().await;
                        s.total_messages += 1;
                        s.total_bytes += data.len() as u64;
                    }

                    match frame.kind {
                        FrameKind::Join { topic } => {
                            if let Some((member, previous)) = joined.take() {
                                room_rx = None;
                                leave(rooms, &previous, member).await;
                            }
                            let room = rooms.get_or_create(&topic).await;
                            if room.member_count().await >= config.max_members_per_room {
                                rooms.remove_if_empty(&topic).await;
                                let reply = Frame::error(format!("room '{topic}' is full"));
                                ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                continue;
                            }
                            room_rx = Some(room.add_member(frame.sender).await);
                            ws_sender
                                .send(Message::Binary(Frame::joined(topic.as_str()).encode()?.into()))
                                .await?;
                            log::info!("Member {} joined '{topic}'", frame.sender);
                            *joined = Some((frame.sender, topic));
                            stats.write().await.active_rooms = rooms.room_count().await;
                        }

                        FrameKind::Broadcast { ref topic, ref event, .. } => {
                            let room = match joined.as_ref() {
                                Some((member, current)) if *member == frame.sender && current == topic => {
                                    rooms.get(topic).await
                                }
                                _ => None,
                            };
                            match room {
                                // Forward the frame as received
                                Some(room) => {
                                    room.broadcast(Envelope::new(frame.sender, event, data.to_vec()));
                                }
                                None => {
                                    let reply = Frame::error(format!("not subscribed to '{topic}'"));
                                    ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                }
                            }
                        }

                        FrameKind::Leave => {
                            if let Some((member, topic)) = joined.take() {
                                room_rx = None;
                                leave(rooms, &topic, member).await;
                                log::info!("Member {member} left '{topic}'");
                            }
                        }

                        FrameKind::Ping => {
                            let pong = Frame::pong(Uuid::nil());
                            ws_sender.send(Message::Binary(pong.encode()?.into())).await?;
                        }

                        other => {
                            log::debug!("Unhandled frame from {addr}: {other:?}");
                        }
                    }
                }

                // Outgoing broadcast
                msg = async {
                    match room_rx.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match msg {
                        Ok(envelope) => {
                            // Don't echo back to sender
                            if joined.as_ref().is_some_and(|(member, _)| *member == envelope.sender) {
                                continue;
                            }
                            ws_sender.send(Message::Binary(envelope.payload.to_vec().into())).await?;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Connection {addr} lagged by {n} messages");
                            ws_sender.send(Message::Binary(Frame::lagged(n).encode()?.into())).await?;
                        }
                        Err(broadcast::error::RecvError::Closed) => room_rx = None,
                    }
                }

                _ = heartbeat.tick() => {
                    ws_sender.send(Message::Ping(Vec::new().into())).await?;
                }
            }
        }
    Ok(())

    }

    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }
}

async fn leave(rooms: &RoomManager, topic: &str, member: Uuid) {
    if let Some(room) = rooms.get(topic).await {
        room.remove_member(&member).await;
    }
    if rooms.remove_if_empty(topic).await {
        log::info!("Room '{topic}' removed (empty)");
    }
}
