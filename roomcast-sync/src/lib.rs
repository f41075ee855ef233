//! # roomcast-sync: Room-scoped real-time chat relay
//!
//! A WebSocket relay that fans chat messages out to the members of numbered
//! rooms, and the client pieces that turn that stream plus a stored backlog
//! into one consistent view.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐    WebSocket     ┌─────────────┐
//! │ ChatSession      │ ◄──────────────► │ RelayServer │
//! │  ├ Connection    │  bincode / JSON  │  (central)  │
//! │  ├ Reconciler    │                  └──────┬──────┘
//! │  └ HistoryFetcher│                         │
//! └────────┬─────────┘                  ┌──────┴───────┐
//!          │                            │ RoomRegistry │
//!          ▼                            │ (fan-out)    │
//! ┌──────────────────┐                  └──────────────┘
//! │ MessageStore     │
//! │ (Memory / Rocks) │
//! └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Events, framings and message validation
//! - [`registry`]: Room membership with non-blocking fan-out
//! - [`server`]: WebSocket relay server
//! - [`client`]: Reconnecting connection manager
//! - [`history`]: Backlog loading and message persistence
//! - [`reconcile`]: Backlog/live/optimistic merge with rate limiting
//! - [`session`]: The client's room-entry and send logic
//! - [`storage`]: Message stores

pub mod protocol;
pub mod registry;
pub mod server;
pub mod client;
pub mod history;
pub mod reconcile;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use protocol::{
    ClientEvent, Frame, Framing, Message, MessageId, ProtocolError, RoomId, ServerEvent,
    Timestamp, ANONYMOUS, MAX_FRAME_LEN, MAX_MESSAGE_LEN,
};
pub use registry::{BroadcastReport, ConnectionHandle, ConnectionId, RegistryStats, RoomRegistry};
pub use server::{
    ConfigError, ConnectionPhase, Environment, RelayServer, ServerConfig, ServerError, ServerStats,
};
pub use client::{
    Backoff, ConnectionConfig, ConnectionError, ConnectionManager, ConnectionState, HandlerId,
};
pub use history::HistoryFetcher;
pub use reconcile::{
    FetchTicket, HistoryOutcome, LiveOutcome, RateLimiter, Reconciler, SendError,
    MIN_SEND_INTERVAL,
};
pub use session::{ChatSession, IdentityProvider, SessionConfig, SessionEvent, StaticIdentity};
pub use storage::{MemoryStore, MessageStore, RocksConfig, RocksStore, StoreError, StoredMessage};
