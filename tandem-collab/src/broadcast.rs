//! Topic-keyed fan-out rooms.
//!
//! Shared by the relay server (payload = raw frame bytes) and the in-process
//! [`LocalHub`](crate::channel::LocalHub) (payload = document message).
//! Every member gets every envelope; dropping the sender's own envelopes is
//! the receiving side's job.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// One broadcast, cheap to clone per receiver.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub sender: Uuid,
    pub event: Arc<str>,
    pub payload: Arc<Vec<u8>>,
}

impl Envelope {
    pub fn new(sender: Uuid, event: &str, payload: Vec<u8>) -> Self {
        Self {
            sender,
            event: Arc::from(event),
            payload: Arc::new(payload),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemberInfo {
    pub member_id: Uuid,
    pub joined_at: Instant,
}

/// Broadcast statistics.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub active_members: usize,
}

/// A room: one tokio broadcast channel plus its member list.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Envelope>,
    members: RwLock<HashMap<Uuid, MemberInfo>>,
    capacity: usize,
    messages_sent: AtomicU64,
    bytes_sent: AtomicU64,
}

impl BroadcastGroup {
    /// Create a group whose receivers lag after `capacity` unread envelopes.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            members: RwLock::new(HashMap::new()),
            capacity,
            messages_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
        }
    }

    /// Register a member and hand back its receiver.
    pub async fn add_member(&self, member_id: Uuid) -> broadcast::Receiver<Envelope> {
        self.members.write().await.insert(
            member_id,
            MemberInfo {
                member_id,
                joined_at: Instant::now(),
            },
        );
        self.sender.subscribe()
    }

    pub async fn remove_member(&self, member_id: &Uuid) -> bool {
        self.members.write().await.remove(member_id).is_some()
    }

    pub async fn has_member(&self, member_id: &Uuid) -> bool {
        self.members.read().await.contains_key(member_id)
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn members(&self) -> Vec<MemberInfo> {
        self.members.read().await.values().cloned().collect()
    }

    /// Send to every live receiver; returns how many there were.
    pub fn broadcast(&self, envelope: Envelope) -> usize {
        let bytes = envelope.payload.len() as u64;
        match self.sender.send(envelope) {
            Ok(receivers) => {
                self.messages_sent.fetch_add(1, Ordering::Relaxed);
                self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
                receivers
            }
            // No receivers left.
            Err(_) => 0,
        }
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            active_members: self.member_count().await,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Maps topics to rooms so traffic never crosses documents.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Get or create the room for `topic`.
    pub async fn get_or_create(&self, topic: &str) -> Arc<BroadcastGroup> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(topic) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(topic) {
            return room.clone();
        }
        let room = Arc::new(BroadcastGroup::new(self.default_capacity));
        rooms.insert(topic.to_string(), room.clone());
        log::debug!("Room '{topic}' created");
        room
    }

    pub async fn get(&self, topic: &str) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(topic).cloned()
    }

    /// Drop the room if nobody is left in it.
    pub async fn remove_if_empty(&self, topic: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(topic) {
            if room.member_count().await == 0 {
                rooms.remove(topic);
                log::debug!("Room '{topic}' removed (empty)");
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_topics(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_group_add_remove() {
        let group = BroadcastGroup::new(16);
        let member = Uuid::new_v4();

        let _rx = group.add_member(member).await;
        assert_eq!(group.member_count().await, 1);
        assert!(group.has_member(&member).await);

        assert!(group.remove_member(&member).await);
        assert!(!group.remove_member(&member).await);
        assert_eq!(group.member_count().await, 0);
    }

    #[tokio::test]
    async fn test_fan_out_reaches_everyone() {
        let group = BroadcastGroup::new(16);
        let alice = Uuid::new_v4();
        let mut rx1 = group.add_member(alice).await;
        let mut rx2 = group.add_member(Uuid::new_v4()).await;

        let count = group.broadcast(Envelope::new(alice, "doc-update", vec![1, 2, 3]));
        // Sender included; filtering is the caller's job.
        assert_eq!(count, 2);

        let got = rx1.recv().await.unwrap();
        assert_eq!(got.sender, alice);
        assert_eq!(&*got.event, "doc-update");
        assert_eq!(*rx2.recv().await.unwrap().payload, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_broadcast_without_receivers() {
        let group = BroadcastGroup::new(4);
        assert_eq!(group.broadcast(Envelope::new(Uuid::nil(), "e", vec![])), 0);
        assert_eq!(group.stats().await.messages_sent, 0);
    }

    #[tokio::test]
    async fn test_stats() {
        let group = BroadcastGroup::new(16);
        let member = Uuid::new_v4();
        let _rx = group.add_member(member).await;

        group.broadcast(Envelope::new(member, "e", vec![0; 10]));
        group.broadcast(Envelope::new(member, "e", vec![0; 5]));

        let stats = group.stats().await;
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.bytes_sent, 15);
        assert_eq!(stats.active_members, 1);
    }

    #[tokio::test]
    async fn test_slow_receiver_lags() {
        let group = BroadcastGroup::new(2);
        let mut rx = group.add_member(Uuid::new_v4()).await;
        for i in 0..5u8 {
            group.broadcast(Envelope::new(Uuid::nil(), "e", vec![i]));
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
    }

    #[tokio::test]
    async fn test_room_manager_get_or_create() {
        let manager = RoomManager::new(16);
        let room1 = manager.get_or_create("doc-a").await;
        let room2 = manager.get_or_create("doc-a").await;

        assert!(Arc::ptr_eq(&room1, &room2));
        assert_eq!(manager.room_count().await, 1);
        assert_eq!(room1.capacity(), 16);
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let manager = RoomManager::new(16);
        let a = manager.get_or_create("doc-a").await;
        let b = manager.get_or_create("doc-b").await;
        let mut rx_b = b.add_member(Uuid::new_v4()).await;

        a.broadcast(Envelope::new(Uuid::nil(), "e", vec![1]));
        assert!(rx_b.try_recv().is_err());

        let topics = manager.active_topics().await;
        assert!(topics.contains(&"doc-a".to_string()));
        assert!(topics.contains(&"doc-b".to_string()));
    }

    #[tokio::test]
    async fn test_room_manager_cleanup() {
        let manager = RoomManager::new(16);
        let room = manager.get_or_create("doc-a").await;
        let member = Uuid::new_v4();
        let _rx = room.add_member(member).await;

        assert!(!manager.remove_if_empty("doc-a").await);
        room.remove_member(&member).await;
        assert!(manager.remove_if_empty("doc-a").await);
        assert_eq!(manager.room_count().await, 0);
        assert!(manager.get("doc-a").await.is_none());
    }
}
