//! WebSocket relay server with room-scoped fan-out.
//!
//! Architecture:
//! ```text
//! Client A ──┐                       ┌──► queue A ──► writer A
//!             ├── connection tasks ──┤
//! Client B ──┘    │                  └──► queue B ──► writer B
//!                 ▼
//!          RoomRegistry (RwLock, owned by RelayServer)
//!            room #7 → {A, B}
//! ```
//!
//! Each accepted socket is served on its own task:
//! - `GET /health` requests get a plain HTTP 200 and are closed
//! - everything else goes through the WebSocket handshake, with an origin
//!   check in production
//! - `join_room` moves the connection into a room, `send_message` is
//!   broadcast to the message's room, sender included
//!
//! Nothing is persisted here. Clients store their own messages.

use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header::ORIGIN, StatusCode};
use tokio_tungstenite::tungstenite::{self, Message};

use crate::protocol::{
    display_name_or_anonymous, validate_text, ClientEvent, Framing, ProtocolError, RoomId,
    ServerEvent, ANONYMOUS,
};
use crate::registry::{ConnectionHandle, RoomRegistry};

/// Paths answered by the health probe.
const HEALTH_REQUESTS: [&[u8]; 2] = [b"GET /health ", b"GET /healthz "];

/// How long a partial request line may take to show whether it is a probe.
const HEALTH_PEEK_TIMEOUT: Duration = Duration::from_millis(500);

/// `None` while `head` could still grow into a probe request line.
fn classify_request_head(head: &[u8]) -> Option<bool> {
    if HEALTH_REQUESTS.iter().any(|probe| head.starts_with(probe)) {
        Some(true)
    } else if HEALTH_REQUESTS.iter().any(|probe| probe.starts_with(head)) {
        None
    } else {
        Some(false)
    }
}

/// Upper bound on the health request we read before answering.
const MAX_HEALTH_REQUEST: usize = 8 * 1024;

/// Deployment mode; decides the origin policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Development,
    Production,
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "production" | "prod" => Ok(Environment::Production),
            _ => Err(ConfigError::InvalidEnvironment(s.to_string())),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Browser origins accepted in production
    pub allowed_origins: Vec<String>,
    /// Deployment mode
    pub environment: Environment,
    /// Per-connection outbound queue capacity
    pub outbound_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:5000".to_string(),
            allowed_origins: vec!["http://localhost:3000".to_string()],
            environment: Environment::Development,
            outbound_capacity: 256,
        }
    }
}

impl ServerConfig {
    /// Read the configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unset keys keep their defaults.
    ///
    /// | key                          | default                 |
    /// |------------------------------|-------------------------|
    /// | `ROOMCAST_BIND`              | `0.0.0.0`               |
    /// | `PORT`                       | `5000`                  |
    /// | `ROOMCAST_ALLOWED_ORIGINS`   | `http://localhost:3000` |
    /// | `ROOMCAST_ENV`               | `development`           |
    /// | `ROOMCAST_OUTBOUND_CAPACITY` | `256`                   |
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let host = lookup("ROOMCAST_BIND").unwrap_or_else(|| "0.0.0.0".to_string());
        let port = match lookup("PORT") {
            Some(raw) => raw
                .trim()
                .parse::<u16>()
                .map_err(|_| ConfigError::InvalidPort(raw.clone()))?,
            None => 5000,
        };

        let allowed_origins = match lookup("ROOMCAST_ALLOWED_ORIGINS") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .map(str::to_string)
                .collect(),
            None => defaults.allowed_origins,
        };

        let environment = match lookup("ROOMCAST_ENV") {
            Some(raw) => raw.parse()?,
            None => defaults.environment,
        };

        let outbound_capacity = match lookup("ROOMCAST_OUTBOUND_CAPACITY") {
            Some(raw) => match raw.trim().parse::<usize>() {
                Ok(capacity) if capacity > 0 => capacity,
                _ => return Err(ConfigError::InvalidCapacity(raw)),
            },
            None => defaults.outbound_capacity,
        };

        Ok(Self {
            bind_addr: format!("{}:{port}", host.trim()),
            allowed_origins,
            environment,
            outbound_capacity,
        })
    }

    /// Whether a handshake carrying `origin` may proceed.
    ///
    /// Requests without an `Origin` header come from non-browser clients
    /// and are always accepted.
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        match (self.environment, origin) {
            (_, None) | (Environment::Development, _) => true,
            (Environment::Production, Some(origin)) => {
                self.allowed_origins.iter().any(|allowed| allowed == origin)
            }
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid PORT: {0:?}")]
    InvalidPort(String),
    #[error("invalid ROOMCAST_ENV: {0:?} (expected development or production)")]
    InvalidEnvironment(String),
    #[error("invalid ROOMCAST_OUTBOUND_CAPACITY: {0:?}")]
    InvalidCapacity(String),
}

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub health_checks: u64,
    pub rejected_handshakes: u64,
}

/// Where a connection is in its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Open,
    Joined(RoomId),
    Closed,
}

/// Per-connection state owned by its task.
struct Peer {
    addr: SocketAddr,
    handle: ConnectionHandle,
    phase: ConnectionPhase,
    identity: String,
    /// Framing of the last frame received; replies use it.
    framing: Option<Framing>,
}

impl Peer {
    fn note_framing(&mut self, seen: Framing) {
        match self.framing {
            Some(current) if current != seen => {
                log::info!("Peer {} switched framing {current} -> {seen}", self.addr);
            }
            None => log::debug!("Peer {} speaks {seen}", self.addr),
            _ => {}
        }
        self.framing = Some(seen);
    }
}

/// The relay server.
pub struct RelayServer {
    config: ServerConfig,
    registry: Arc<RwLock<RoomRegistry>>,
    stats: Arc<RwLock<ServerStats>>,
}

impl RelayServer {
    /// Create a server that owns `registry`.
    pub fn new(config: ServerConfig, registry: RoomRegistry) -> Self {
        Self {
            config,
            registry: Arc::new(RwLock::new(registry)),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Create with default configuration and an empty registry.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default(), RoomRegistry::new())
    }

    /// Bind and serve forever.
    pub async fn run(&self) -> Result<(), ServerError> {
        self.run_until(std::future::pending()).await
    }

    /// Bind the configured address and serve until `shutdown` resolves.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!(
            "Relay server listening on {} ({:?})",
            listener.local_addr()?,
            self.config.environment
        );
        self.serve(listener, shutdown).await
    }

    /// Accept connections from `listener` until `shutdown` resolves.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("Relay server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        log::debug!("New TCP connection from {addr}");
                        let config = self.config.clone();
                        let registry = self.registry.clone();
                        let stats = self.stats.clone();

                        tokio::spawn(async move {
                            if let Err(e) =
                                Self::handle_stream(stream, addr, config, registry, stats).await
                            {
                                log::error!("Connection error from {addr}: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        log::error!("Accept failed: {e}");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
            }
        }
    }

    /// Route a fresh socket to the health probe or the WebSocket path.
    async fn handle_stream(
        stream: TcpStream,
        addr: SocketAddr,
        config: ServerConfig,
        registry: Arc<RwLock<RoomRegistry>>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), ServerError> {
        if Self::is_health_probe(&stream).await? {
            stats.write().await.health_checks += 1;
            return Self::respond_health(stream).await;
        }
        Self::handle_connection(stream, addr, config, registry, stats).await
    }

    /// Peek until the request line is known to be, or not to be, a probe.
    async fn is_health_probe(stream: &TcpStream) -> std::io::Result<bool> {
        let mut head = [0u8; 16];
        let deadline = tokio::time::Instant::now() + HEALTH_PEEK_TIMEOUT;
        loop {
            let n = stream.peek(&mut head).await?;
            match classify_request_head(&head[..n]) {
                Some(probe) => return Ok(probe),
                None if n == 0 || tokio::time::Instant::now() >= deadline => return Ok(false),
                None => tokio::time::sleep(Duration::from_millis(5)).await,
            }
        }
    }

    async fn respond_health(mut stream: TcpStream) -> Result<(), ServerError> {
        let mut request = Vec::with_capacity(512);
        let mut chunk = [0u8; 512];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") && request.len() < MAX_HEALTH_REQUEST {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            request.extend_from_slice(&chunk[..n]);
        }

        let body = r#"{"status":"ok"}"#;
        let response = format!(
            "HTTP/1.1 200 OK\r\n\
             Content-Type: application/json\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(response.as_bytes()).await?;
        stream.shutdown().await?;
        Ok(())
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        config: ServerConfig,
        registry: Arc<RwLock<RoomRegistry>>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), ServerError> {
        let mut rejected_origin = None;
        let check_origin = |request: &Request,
                            response: Response|
         -> Result<Response, ErrorResponse> {
            let origin = request
                .headers()
                .get(ORIGIN)
                .map(|value| value.to_str().unwrap_or_default());
            if config.origin_allowed(origin) {
                return Ok(response);
            }
            rejected_origin = origin.map(str::to_string);
            let mut rejection = ErrorResponse::new(Some("origin not allowed".to_string()));
            *rejection.status_mut() = StatusCode::FORBIDDEN;
            Err(rejection)
        };

        let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, check_origin).await {
            Ok(ws_stream) => ws_stream,
            Err(e) => {
                if let Some(origin) = rejected_origin {
                    log::warn!("Rejected handshake from {addr}: origin {origin:?} not allowed");
                    stats.write().await.rejected_handshakes += 1;
                    return Ok(());
                }
                return Err(e.into());
            }
        };
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let (tx, mut outbound) = mpsc::channel(config.outbound_capacity.max(1));
        let mut peer = Peer {
            addr,
            handle: ConnectionHandle::new(tx),
            phase: ConnectionPhase::Open,
            identity: ANONYMOUS.to_string(),
            framing: None,
        };

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    let decoded = match msg {
                        Some(Ok(Message::Binary(data))) => {
                            Self::count_frame(&stats, data.len()).await;
                            peer.note_framing(Framing::Binary);
                            ClientEvent::decode_binary(&data)
                        }
                        Some(Ok(Message::Text(text))) => {
                            Self::count_frame(&stats, text.len()).await;
                            peer.note_framing(Framing::Json);
                            ClientEvent::decode_text(text.as_str())
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                                log::debug!("Pong to {addr} failed: {e}");
                            }
                            continue;
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            if Self::is_fatal(&e) {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }
                            log::warn!("WebSocket error from {addr}, continuing: {e}");
                            continue;
                        }
                    };

                    match decoded {
                        Ok(event) => Self::handle_event(event, &mut peer, &registry, &stats).await,
                        Err(e) => log::warn!("Failed to decode frame from {addr}: {e}"),
                    }
                }

                event = outbound.recv() => {
                    // the peer's own handle keeps the queue open
                    let Some(event) = event else { break };
                    let framing = peer.framing.unwrap_or_default();
                    match event.encode(framing) {
                        Ok(frame) => {
                            if let Err(e) = ws_sender.send(Message::from(frame)).await {
                                log::error!("Send to {addr} failed: {e}");
                                break;
                            }
                        }
                        Err(e) => log::error!("Encoding event for {addr} failed: {e}"),
                    }
                }
            }
        }

        // Cleanup: leave the room and tell the others
        if let ConnectionPhase::Joined(room) = peer.phase {
            let room_count = {
                let mut registry = registry.write().await;
                registry.leave(peer.handle.id());
                registry.broadcast(
                    room,
                    Arc::new(ServerEvent::UserLeave {
                        identity: peer.identity.clone(),
                        room,
                    }),
                    None,
                );
                registry.room_count()
            };
            stats.write().await.active_rooms = room_count;
            log::info!("{} ({addr}) left room {room}", peer.identity);
        }
        peer.phase = ConnectionPhase::Closed;

        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        log::debug!("Connection {addr} is {:?}", peer.phase);
        Ok(())
    }

    /// Errors after which the socket is unusable.
    fn is_fatal(error: &tungstenite::Error) -> bool {
        matches!(
            error,
            tungstenite::Error::ConnectionClosed
                | tungstenite::Error::AlreadyClosed
                | tungstenite::Error::Io(_)
        )
    }

    async fn count_frame(stats: &RwLock<ServerStats>, len: usize) {
        let mut s = stats.write().await;
        s.total_frames += 1;
        s.total_bytes += len as u64;
    }

    async fn handle_event(
        event: ClientEvent,
        peer: &mut Peer,
        registry: &RwLock<RoomRegistry>,
        stats: &RwLock<ServerStats>,
    ) {
        match event {
            ClientEvent::JoinRoom { room, identity } => {
                let identity = display_name_or_anonymous(&identity);
                let room_count = {
                    let mut registry = registry.write().await;
                    if let Some(previous) = registry.join(peer.handle.clone(), room) {
                        registry.broadcast(
                            previous,
                            Arc::new(ServerEvent::UserLeave {
                                identity: peer.identity.clone(),
                                room: previous,
                            }),
                            None,
                        );
                    }
                    registry.broadcast(
                        room,
                        Arc::new(ServerEvent::UserJoin {
                            identity: identity.clone(),
                            room,
                        }),
                        Some(peer.handle.id()),
                    );
                    registry.room_count()
                };
                stats.write().await.active_rooms = room_count;

                log::info!("{identity} ({}) joined room {room}", peer.addr);
                peer.identity = identity;
                peer.phase = ConnectionPhase::Joined(room);
            }

            ClientEvent::SendMessage(mut message) => {
                message.text = match validate_text(&message.text) {
                    Ok(text) => text.to_string(),
                    Err(e) => {
                        Self::log_invalid(peer.addr, &e);
                        return;
                    }
                };
                if message.sender.trim().is_empty() {
                    message.sender = peer.identity.clone();
                }
                let room = message.room;
                let id = message.id.clone();
                let report = registry
                    .read()
                    .await
                    .broadcast(room, Arc::new(ServerEvent::ReceivedMessage(message)), None);
                log::debug!(
                    "Message {id} relayed to room {room}: {} delivered, {} dropped",
                    report.delivered,
                    report.dropped
                );
            }
        }
    }

    fn log_invalid(addr: SocketAddr, error: &ProtocolError) {
        log::debug!("Ignoring invalid message from {addr}: {error}");
    }

    /// Get current server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// The room registry this server owns.
    pub fn registry(&self) -> &Arc<RwLock<RoomRegistry>> {
        &self.registry
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}
