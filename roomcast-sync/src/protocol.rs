//! Wire protocol for the room relay.
//!
//! One event model, two framings:
//! ```text
//! ┌──────────────┬──────────────────────────────────────────────┐
//! │ frame kind   │ payload                                      │
//! ├──────────────┼──────────────────────────────────────────────┤
//! │ binary       │ bincode-encoded ClientEvent / ServerEvent    │
//! │ text         │ JSON, externally tagged: {"join_room":{..}}  │
//! └──────────────┴──────────────────────────────────────────────┘
//! ```
//!
//! Event names follow the browser clients already in the wild, including
//! the `recieved_message` spelling.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio_tungstenite::tungstenite;
use uuid::Uuid;

/// Maximum message length, in characters, after trimming.
pub const MAX_MESSAGE_LEN: usize = 500;

/// Upper bound on a decoded binary frame. Length prefixes claiming more
/// than this are rejected before anything is allocated.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Display name used when no identity is available.
pub const ANONYMOUS: &str = "Anonymous";

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

/// Current wall-clock time in milliseconds.
pub fn now_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Timestamp
}

/// Room number. Always ≥ 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct RoomId(u64);

impl RoomId {
    pub fn new(value: u64) -> Result<Self, ProtocolError> {
        if value == 0 {
            return Err(ProtocolError::InvalidRoom(value.to_string()));
        }
        Ok(Self(value))
    }

    pub fn get(self) -> u64 {
        self.0
    }

    /// Big-endian key prefix used by storage backends.
    pub fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl TryFrom<u64> for RoomId {
    type Error = ProtocolError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RoomId> for u64 {
    fn from(room: RoomId) -> Self {
        room.0
    }
}

impl FromStr for RoomId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s
            .trim()
            .parse::<u64>()
            .map_err(|_| ProtocolError::InvalidRoom(s.to_string()))?;
        Self::new(value)
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Client-generated message identifier; the deduplication key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for MessageId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A chat message as it travels between clients, relay and store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub text: String,
    pub sender: String,
    pub room: RoomId,
    pub timestamp: Timestamp,
}

impl Message {
    pub fn new(
        id: impl Into<MessageId>,
        text: impl Into<String>,
        sender: impl Into<String>,
        room: RoomId,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            sender: sender.into(),
            room,
            timestamp,
        }
    }
}

/// Returns the trimmed text if it is non-empty and within [`MAX_MESSAGE_LEN`].
pub fn validate_text(text: &str) -> Result<&str, ProtocolError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ProtocolError::EmptyText);
    }
    let len = trimmed.chars().count();
    if len > MAX_MESSAGE_LEN {
        return Err(ProtocolError::TooLong {
            len,
            max: MAX_MESSAGE_LEN,
        });
    }
    Ok(trimmed)
}

/// Normalise a display name, falling back to [`ANONYMOUS`].
pub fn display_name_or_anonymous(name: &str) -> String {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        ANONYMOUS.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Events sent by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientEvent {
    JoinRoom { room: RoomId, identity: String },
    SendMessage(Message),
}

/// Events sent by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerEvent {
    /// Informational: someone joined the room.
    UserJoin { identity: String, room: RoomId },
    /// A chat message broadcast to the room, sender included.
    #[serde(rename = "recieved_message")]
    ReceivedMessage(Message),
    /// Informational: someone left the room or disconnected.
    UserLeave { identity: String, room: RoomId },
}

/// Frame encoding used on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    #[default]
    Binary,
    Json,
}

impl fmt::Display for Framing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Framing::Binary => f.write_str("binary"),
            Framing::Json => f.write_str("json"),
        }
    }
}

/// An encoded event, ready to hand to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Binary(Vec<u8>),
    Text(String),
}

impl Frame {
    pub fn len(&self) -> usize {
        match self {
            Frame::Binary(bytes) => bytes.len(),
            Frame::Text(text) => text.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Frame> for tungstenite::Message {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Binary(bytes) => tungstenite::Message::Binary(bytes.into()),
            Frame::Text(text) => tungstenite::Message::Text(text.into()),
        }
    }
}

impl Framing {
    pub fn encode<T: Serialize>(self, value: &T) -> Result<Frame, ProtocolError> {
        match self {
            Framing::Binary => bincode::serde::encode_to_vec(value, bincode::config::standard())
                .map(Frame::Binary)
                .map_err(|e| ProtocolError::Serialization(e.to_string())),
            Framing::Json => serde_json::to_string(value)
                .map(Frame::Text)
                .map_err(|e| ProtocolError::Serialization(e.to_string())),
        }
    }
}

fn decode_binary<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let config = bincode::config::standard().with_limit::<MAX_FRAME_LEN>();
    let (value, _) = bincode::serde::decode_from_slice(bytes, config)
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

fn decode_text<T: DeserializeOwned>(text: &str) -> Result<T, ProtocolError> {
    serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
}

impl ClientEvent {
    pub fn encode(&self, framing: Framing) -> Result<Frame, ProtocolError> {
        framing.encode(self)
    }

    pub fn decode_binary(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_binary(bytes)
    }

    pub fn decode_text(text: &str) -> Result<Self, ProtocolError> {
        decode_text(text)
    }
}

impl ServerEvent {
    pub fn encode(&self, framing: Framing) -> Result<Frame, ProtocolError> {
        framing.encode(self)
    }

    pub fn decode_binary(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_binary(bytes)
    }

    pub fn decode_text(text: &str) -> Result<Self, ProtocolError> {
        decode_text(text)
    }

    /// The room this event concerns.
    pub fn room(&self) -> RoomId {
        match self {
            ServerEvent::UserJoin { room, .. } | ServerEvent::UserLeave { room, .. } => *room,
            ServerEvent::ReceivedMessage(message) => message.room,
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("invalid room number: {0:?}")]
    InvalidRoom(String),
    #[error("message text is empty")]
    EmptyText,
    #[error("message text is {len} characters, limit is {max}")]
    TooLong { len: usize, max: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room(n: u64) -> RoomId {
        RoomId::new(n).unwrap()
    }

    #[test]
    fn test_room_id_parse() {
        assert_eq!("7".parse::<RoomId>().unwrap(), room(7));
        assert_eq!(" 42 ".parse::<RoomId>().unwrap().get(), 42);
        assert!("0".parse::<RoomId>().is_err());
        assert!("-3".parse::<RoomId>().is_err());
        assert!("lobby".parse::<RoomId>().is_err());
        assert!(RoomId::new(0).is_err());
    }

    #[test]
    fn test_room_zero_rejected_on_the_wire() {
        let json = r#"{"join_room":{"room":0,"identity":"alice"}}"#;
        assert!(ClientEvent::decode_text(json).is_err());
    }

    #[test]
    fn test_validate_text() {
        assert_eq!(validate_text("  hello  ").unwrap(), "hello");
        assert_eq!(validate_text("   "), Err(ProtocolError::EmptyText));
        assert_eq!(validate_text(""), Err(ProtocolError::EmptyText));

        let limit = "x".repeat(MAX_MESSAGE_LEN);
        assert!(validate_text(&limit).is_ok());

        let over = "x".repeat(MAX_MESSAGE_LEN + 1);
        assert_eq!(
            validate_text(&over),
            Err(ProtocolError::TooLong { len: 501, max: 500 })
        );
    }

    #[test]
    fn test_validate_counts_characters_not_bytes() {
        // 500 two-byte characters are within the limit
        let text = "é".repeat(MAX_MESSAGE_LEN);
        assert!(text.len() > MAX_MESSAGE_LEN);
        assert!(validate_text(&text).is_ok());
    }

    #[test]
    fn test_display_name_fallback() {
        assert_eq!(display_name_or_anonymous(""), ANONYMOUS);
        assert_eq!(display_name_or_anonymous("   "), ANONYMOUS);
        assert_eq!(display_name_or_anonymous(" alice "), "alice");
    }

    #[test]
    fn test_received_message_json_shape() {
        let msg = Message::new("a1", "hello", "alice", room(7), 10);
        let frame = ServerEvent::ReceivedMessage(msg).encode(Framing::Json).unwrap();
        let Frame::Text(text) = frame else {
            panic!("json framing must produce a text frame");
        };
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        let inner = &value["recieved_message"];
        assert_eq!(inner["id"], "a1");
        assert_eq!(inner["text"], "hello");
        assert_eq!(inner["sender"], "alice");
        assert_eq!(inner["room"], 7);
        assert_eq!(inner["timestamp"], 10);
    }

    #[test]
    fn test_client_event_from_browser_json() {
        let join =
            ClientEvent::decode_text(r#"{"join_room":{"room":7,"identity":"bob"}}"#).unwrap();
        assert_eq!(
            join,
            ClientEvent::JoinRoom {
                room: room(7),
                identity: "bob".into()
            }
        );

        let send = ClientEvent::decode_text(
            r#"{"send_message":{"id":"b1","text":"yo","sender":"bob","room":7,"timestamp":15}}"#,
        )
        .unwrap();
        match send {
            ClientEvent::SendMessage(m) => {
                assert_eq!(m.id.as_str(), "b1");
                assert_eq!(m.text, "yo");
                assert_eq!(m.timestamp, 15);
            }
            other => panic!("expected send_message, got {other:?}"),
        }
    }

    #[test]
    fn test_binary_frame_decodes() {
        let event = ClientEvent::JoinRoom {
            room: room(99),
            identity: "carol".into(),
        };
        let Frame::Binary(bytes) = event.encode(Framing::Binary).unwrap() else {
            panic!("binary framing must produce a binary frame");
        };
        assert_eq!(ClientEvent::decode_binary(&bytes).unwrap(), event);
    }

    #[test]
    fn test_decode_garbage() {
        assert!(ClientEvent::decode_binary(&[0xFF, 0xFE, 0xFD]).is_err());
        assert!(ServerEvent::decode_text("{not json").is_err());
        assert!(ClientEvent::decode_text(r#"{"shout":{}}"#).is_err());
    }

    #[test]
    fn test_oversized_length_prefix_rejected() {
        // JoinRoom, room 7, identity claiming 2^46 bytes
        let mut bytes = vec![0, 7, 253];
        bytes.extend_from_slice(&(1u64 << 46).to_le_bytes());
        bytes.extend_from_slice(b"abc");
        assert!(matches!(
            ClientEvent::decode_binary(&bytes),
            Err(ProtocolError::Deserialization(_))
        ));

        // ReceivedMessage with an id claiming 2^40 bytes
        let mut bytes = vec![1, 253];
        bytes.extend_from_slice(&(1u64 << 40).to_le_bytes());
        assert!(matches!(
            ServerEvent::decode_binary(&bytes),
            Err(ProtocolError::Deserialization(_))
        ));
    }

    #[test]
    fn test_largest_legal_message_fits_frame_limit() {
        let text = "é".repeat(MAX_MESSAGE_LEN);
        let event = ClientEvent::SendMessage(Message::new("a1", text, "alice", room(7), 1));
        let Frame::Binary(bytes) = event.encode(Framing::Binary).unwrap() else {
            panic!("binary framing must produce a binary frame");
        };
        assert!(bytes.len() < MAX_FRAME_LEN);
        assert_eq!(ClientEvent::decode_binary(&bytes).unwrap(), event);
    }

    #[test]
    fn test_server_event_room() {
        let msg = Message::new("m", "hi", "alice", room(3), 1);
        assert_eq!(ServerEvent::ReceivedMessage(msg).room(), room(3));
        let join = ServerEvent::UserJoin {
            identity: "bob".into(),
            room: room(4),
        };
        assert_eq!(join.room(), room(4));
    }

    #[test]
    fn test_message_ids_are_unique() {
        let a = MessageId::generate();
        let b = MessageId::generate();
        assert_ne!(a, b);
        assert_eq!(MessageId::from("a1").to_string(), "a1");
    }
}
