//! History fetcher: the client's read/write path to the message store.

use std::sync::Arc;

use crate::protocol::{Message, RoomId};
use crate::storage::{MessageStore, StoreError, StoredMessage};

/// Loads room backlogs and persists sent messages.
///
/// Cheap to clone; clones share the store.
#[derive(Clone)]
pub struct HistoryFetcher {
    store: Arc<dyn MessageStore>,
}

impl HistoryFetcher {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }

    /// The room's stored messages, oldest first.
    ///
    /// A store failure is logged and yields an empty backlog.
    pub async fn fetch_history(&self, room: RoomId) -> Vec<Message> {
        match self.store.load(room).await {
            Ok(records) => {
                let mut messages: Vec<Message> = records
                    .into_iter()
                    .map(|record| record.into_message(room))
                    .collect();
                messages.sort_by_key(|m| m.timestamp);
                log::debug!("Fetched {} messages for room {room}", messages.len());
                messages
            }
            Err(e) => {
                log::warn!("History fetch for room {room} failed: {e}");
                Vec::new()
            }
        }
    }

    /// Persist one message under its room.
    pub async fn submit_message(&self, message: &Message) -> Result<(), StoreError> {
        self.store
            .append(message.room, StoredMessage::from(message))
            .await
    }
}

impl std::fmt::Debug for HistoryFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryFetcher").finish_non_exhaustive()
    }
}
