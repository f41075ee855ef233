//! Message persistence.
//!
//! ```text
//! ┌────────────────┐  load(room)   ┌──────────────────────────────┐
//! │ HistoryFetcher │ ────────────► │ dyn MessageStore             │
//! │                │ ◄──────────── │  ├─ MemoryStore (in-process) │
//! │                │  append(..)   │  └─ RocksStore  (on disk)    │
//! └────────────────┘               └──────────────────────────────┘
//! ```
//!
//! A store is an append-only collection per room, read back in ascending
//! timestamp order. Writes are independent of the live relay.

pub mod memory;
pub mod rocks;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::protocol::{Message, MessageId, RoomId, Timestamp};

pub use memory::MemoryStore;
pub use rocks::{RocksConfig, RocksStore};

/// One persisted message. The room is the storage key, not a field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: MessageId,
    pub sender: String,
    pub text: String,
    pub timestamp: Timestamp,
}

impl StoredMessage {
    pub fn into_message(self, room: RoomId) -> Message {
        Message {
            id: self.id,
            text: self.text,
            sender: self.sender,
            room,
            timestamp: self.timestamp,
        }
    }
}

impl From<&Message> for StoredMessage {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id.clone(),
            sender: message.sender.clone(),
            text: message.text.clone(),
            timestamp: message.timestamp,
        }
    }
}

/// The durable message store consumed by the history fetcher.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// All messages of `room`, ascending by timestamp.
    async fn load(&self, room: RoomId) -> Result<Vec<StoredMessage>, StoreError>;

    /// Persist one message. Appending an id that is already stored is a no-op.
    async fn append(&self, room: RoomId, message: StoredMessage) -> Result<(), StoreError>;
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}
