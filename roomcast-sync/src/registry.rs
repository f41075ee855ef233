//! Room membership and fan-out.
//!
//! Each connection owns a bounded outbound queue; the registry keeps the
//! sending halves grouped by room. Broadcast is a synchronous `try_send`
//! over the room's members, so a slow or dead peer only loses its own copy.
//!
//! ```text
//! room #7 ──┬── conn A  [queue] ──► writer task A
//!           ├── conn B  [queue] ──► writer task B
//!           └── conn C  [full ] ──✗ dropped, counted
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use crate::protocol::{RoomId, ServerEvent};

/// Server-assigned connection identifier.
pub type ConnectionId = Uuid;

/// Events are shared between all recipients of one broadcast.
pub type Outbound = Arc<ServerEvent>;

/// The registry's handle on one live connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::Sender<Outbound>,
}

impl ConnectionHandle {
    pub fn new(tx: mpsc::Sender<Outbound>) -> Self {
        Self::with_id(Uuid::new_v4(), tx)
    }

    pub fn with_id(id: ConnectionId, tx: mpsc::Sender<Outbound>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

/// Outcome of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: usize,
}

/// Registry-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub messages_delivered: u64,
    pub messages_dropped: u64,
    pub active_rooms: usize,
    pub active_members: usize,
}

/// In-memory room membership: room → members, connection → room.
///
/// A connection is in at most one room; [`RoomRegistry::join`] leaves the
/// previous room first. Rooms exist only while they have members.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: HashMap<RoomId, HashMap<ConnectionId, ConnectionHandle>>,
    memberships: HashMap<ConnectionId, RoomId>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put `handle` into `room`, leaving its previous room if any.
    ///
    /// Returns the room that was left. Re-joining the current room only
    /// refreshes the handle.
    pub fn join(&mut self, handle: ConnectionHandle, room: RoomId) -> Option<RoomId> {
        let id = handle.id;
        let previous = match self.memberships.get(&id).copied() {
            Some(current) if current == room => None,
            Some(_) => self.leave(id),
            None => None,
        };

        self.rooms.entry(room).or_default().insert(id, handle);
        self.memberships.insert(id, room);
        previous
    }

    /// Remove a connection from its room. Empty rooms are dropped.
    pub fn leave(&mut self, id: ConnectionId) -> Option<RoomId> {
        let room = self.memberships.remove(&id)?;
        if let Some(members) = self.rooms.get_mut(&room) {
            members.remove(&id);
            if members.is_empty() {
                self.rooms.remove(&room);
                log::debug!("Room {room} is empty, dropped");
            }
        }
        Some(room)
    }

    /// Deliver `event` to every current member of `room` except `except`.
    pub fn broadcast(
        &self,
        room: RoomId,
        event: Outbound,
        except: Option<ConnectionId>,
    ) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let Some(members) = self.rooms.get(&room) else {
            return report;
        };

        for (id, handle) in members {
            if Some(*id) == except {
                continue;
            }
            match handle.tx.try_send(event.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    log::warn!("Peer {id} in room {room} is lagging, event dropped");
                    report.dropped += 1;
                }
                Err(TrySendError::Closed(_)) => {
                    log::debug!("Peer {id} in room {room} is gone, event dropped");
                    report.dropped += 1;
                }
            }
        }

        self.delivered
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.dropped.fetch_add(report.dropped as u64, Ordering::Relaxed);
        report
    }

    pub fn room_of(&self, id: ConnectionId) -> Option<RoomId> {
        self.memberships.get(&id).copied()
    }

    pub fn contains(&self, room: RoomId, id: ConnectionId) -> bool {
        self.rooms
            .get(&room)
            .is_some_and(|members| members.contains_key(&id))
    }

    pub fn members(&self, room: RoomId) -> Vec<ConnectionId> {
        self.rooms
            .get(&room)
            .map(|members| members.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn member_count(&self, room: RoomId) -> usize {
        self.rooms.get(&room).map_or(0, HashMap::len)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            messages_delivered: self.delivered.load(Ordering::Relaxed),
            messages_dropped: self.dropped.load(Ordering::Relaxed),
            active_rooms: self.rooms.len(),
            active_members: self.memberships.len(),
        }
    }
}
