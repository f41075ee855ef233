//! In-process message store.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{MessageStore, StoreError, StoredMessage};
use crate::protocol::RoomId;

/// Rooms kept in memory, each sorted by timestamp.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rooms: RwLock<HashMap<RoomId, Vec<StoredMessage>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages stored for `room`.
    pub async fn message_count(&self, room: RoomId) -> usize {
        self.rooms.read().await.get(&room).map_or(0, Vec::len)
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn load(&self, room: RoomId) -> Result<Vec<StoredMessage>, StoreError> {
        Ok(self
            .rooms
            .read()
            .await
            .get(&room)
            .cloned()
            .unwrap_or_default())
    }

    async fn append(&self, room: RoomId, message: StoredMessage) -> Result<(), StoreError> {
        let mut rooms = self.rooms.write().await;
        let messages = rooms.entry(room).or_default();
        if messages.iter().any(|m| m.id == message.id) {
            return Ok(());
        }
        // equal timestamps keep insertion order
        let at = messages.partition_point(|m| m.timestamp <= message.timestamp);
        messages.insert(at, message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, timestamp: u64) -> StoredMessage {
        StoredMessage {
            id: id.into(),
            sender: "alice".into(),
            text: format!("text {id}"),
            timestamp,
        }
    }

    #[tokio::test]
    async fn test_load_is_chronological() {
        let store = MemoryStore::new();
        let room = RoomId::new(1).unwrap();
        store.append(room, record("c", 30)).await.unwrap();
        store.append(room, record("a", 10)).await.unwrap();
        store.append(room, record("b", 20)).await.unwrap();
        store.append(room, record("b2", 20)).await.unwrap();

        let ids: Vec<String> = store
            .load(room)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id.to_string())
            .collect();
        assert_eq!(ids, vec!["a", "b", "b2", "c"]);
    }

    #[tokio::test]
    async fn test_append_same_id_once() {
        let store = MemoryStore::new();
        let room = RoomId::new(1).unwrap();
        store.append(room, record("a", 10)).await.unwrap();
        store.append(room, record("a", 10)).await.unwrap();
        assert_eq!(store.message_count(room).await, 1);
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let store = MemoryStore::new();
        let one = RoomId::new(1).unwrap();
        let two = RoomId::new(2).unwrap();
        store.append(one, record("a", 10)).await.unwrap();

        assert_eq!(store.load(one).await.unwrap().len(), 1);
        assert!(store.load(two).await.unwrap().is_empty());
    }
}
