//! Connection manager: the client's single link to the relay.
//!
//! Provides:
//! - Connection lifecycle (connect, automatic reconnect with backoff, dispose)
//! - Non-blocking connectivity state backed by a watch channel
//! - Handler registration for inbound events and connectivity changes
//! - A bounded outbound queue that survives reconnects
//!
//! ```text
//! send() ──try_send──► [outbound queue] ──► driver task ──► WebSocket
//!                                               │
//!                 on_message handlers ◄─────────┤ decoded ServerEvent
//!                 on_connectivity     ◄─────────┘ Connected / Disconnected
//! ```
//!
//! The manager never re-joins rooms on its own. Owners re-issue
//! `join_room` when they observe `Connected`.

use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::protocol::{ClientEvent, Framing, ProtocolError, ServerEvent};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connectivity as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// Connection manager configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Encoding for outbound frames (default: binary)
    pub framing: Framing,
    /// Outbound queue capacity (default: 256)
    pub outbound_capacity: usize,
    /// First reconnect delay (default: 250ms)
    pub initial_backoff: Duration,
    /// Reconnect delay ceiling (default: 5s)
    pub max_backoff: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            framing: Framing::Binary,
            outbound_capacity: 256,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(5),
        }
    }
}

/// Exponential reconnect delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay before the next attempt; doubles up to the ceiling.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Connection manager errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("connect was already called")]
    AlreadyStarted,
    #[error("connection manager is disposed")]
    Disposed,
}

/// Returned by handler registration; pass to [`ConnectionManager::remove_handler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type MessageHandler = Box<dyn FnMut(&ServerEvent) + Send>;
type ConnectivityHandler = Box<dyn FnMut(ConnectionState) + Send>;

#[derive(Default)]
struct Handlers {
    next_id: u64,
    disposed: bool,
    message: Vec<(HandlerId, MessageHandler)>,
    connectivity: Vec<(HandlerId, ConnectivityHandler)>,
}

impl Handlers {
    fn next_id(&mut self) -> HandlerId {
        self.next_id += 1;
        HandlerId(self.next_id)
    }
}

type SharedHandlers = Arc<Mutex<Handlers>>;

// A handler that panicked leaves the table usable.
fn lock(handlers: &SharedHandlers) -> MutexGuard<'_, Handlers> {
    handlers.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Client-side WebSocket connection with automatic reconnect.
///
/// Handlers run on the driver task while the handler table is locked, so
/// they must not register or remove handlers themselves. Once
/// [`ConnectionManager::dispose`] returns no handler runs again.
pub struct ConnectionManager {
    config: ConnectionConfig,
    handlers: SharedHandlers,
    state: Arc<watch::Sender<ConnectionState>>,
    outbound_tx: mpsc::Sender<ClientEvent>,
    /// Taken by the driver on `connect`.
    outbound_rx: Option<mpsc::Receiver<ClientEvent>>,
    shutdown: Option<oneshot::Sender<()>>,
    endpoint: Option<String>,
    disposed: bool,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity.max(1));
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            handlers: Arc::new(Mutex::new(Handlers::default())),
            state: Arc::new(state),
            outbound_tx,
            outbound_rx: Some(outbound_rx),
            shutdown: None,
            endpoint: None,
            disposed: false,
        }
    }

    /// Open the connection to `endpoint` (e.g. `ws://127.0.0.1:5000`).
    ///
    /// The first attempt is awaited and its error returned. Either way a
    /// background driver is left running that reconnects whenever the
    /// link drops, until [`ConnectionManager::dispose`].
    pub async fn connect(&mut self, endpoint: impl Into<String>) -> Result<(), ConnectionError> {
        if self.disposed {
            return Err(ConnectionError::Disposed);
        }
        let outbound = self
            .outbound_rx
            .take()
            .ok_or(ConnectionError::AlreadyStarted)?;
        let endpoint = endpoint.into();
        self.endpoint = Some(endpoint.clone());

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.shutdown = Some(shutdown_tx);

        let driver = Driver {
            backoff: Backoff::new(self.config.initial_backoff, self.config.max_backoff),
            framing: self.config.framing,
            handlers: self.handlers.clone(),
            state: self.state.clone(),
            outbound,
            shutdown: shutdown_rx,
            endpoint,
        };

        match tokio_tungstenite::connect_async(driver.endpoint.as_str()).await {
            Ok((stream, _)) => {
                log::info!("Connected to {}", driver.endpoint);
                driver.transition(ConnectionState::Connected);
                tokio::spawn(driver.run(Some(stream)));
                Ok(())
            }
            Err(e) => {
                log::error!("Connection to {} failed: {e}", driver.endpoint);
                driver.transition(ConnectionState::Disconnected);
                tokio::spawn(driver.run(None));
                Err(ConnectionError::Transport(e.to_string()))
            }
        }
    }

    /// Queue `event` for the relay. Never waits.
    ///
    /// Events queued while disconnected are flushed after the next
    /// successful connect. Returns `false` if the event was dropped.
    pub fn send(&self, event: ClientEvent) -> bool {
        match self.outbound_tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("Outbound queue full, event dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::debug!("Connection manager stopped, event dropped");
                false
            }
        }
    }

    pub fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// A receiver for awaiting state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Invoke `handler` once for every decoded inbound event.
    pub fn on_message<F>(&self, handler: F) -> HandlerId
    where
        F: FnMut(&ServerEvent) + Send + 'static,
    {
        let mut handlers = lock(&self.handlers);
        let id = handlers.next_id();
        if !handlers.disposed {
            handlers.message.push((id, Box::new(handler)));
        }
        id
    }

    /// Invoke `handler` on every connectivity transition.
    pub fn on_connectivity<F>(&self, handler: F) -> HandlerId
    where
        F: FnMut(ConnectionState) + Send + 'static,
    {
        let mut handlers = lock(&self.handlers);
        let id = handlers.next_id();
        if !handlers.disposed {
            handlers.connectivity.push((id, Box::new(handler)));
        }
        id
    }

    /// Returns whether a handler was removed.
    pub fn remove_handler(&self, id: HandlerId) -> bool {
        let mut handlers = lock(&self.handlers);
        let before = handlers.message.len() + handlers.connectivity.len();
        handlers.message.retain(|(h, _)| *h != id);
        handlers.connectivity.retain(|(h, _)| *h != id);
        before != handlers.message.len() + handlers.connectivity.len()
    }

    pub fn handler_count(&self) -> usize {
        let handlers = lock(&self.handlers);
        handlers.message.len() + handlers.connectivity.len()
    }

    /// Drop all handlers, stop reconnecting and close the transport.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        {
            let mut handlers = lock(&self.handlers);
            handlers.disposed = true;
            handlers.message.clear();
            handlers.connectivity.clear();
        }
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.outbound_rx = None;
        self.state.send_if_modified(|state| {
            let changed = *state != ConnectionState::Disconnected;
            *state = ConnectionState::Disconnected;
            changed
        });
        log::debug!("Connection manager disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Why a served connection ended.
#[derive(Debug, PartialEq, Eq)]
enum Ended {
    Lost,
    Shutdown,
}

/// Background task that owns the socket.
struct Driver {
    endpoint: String,
    framing: Framing,
    backoff: Backoff,
    handlers: SharedHandlers,
    state: Arc<watch::Sender<ConnectionState>>,
    outbound: mpsc::Receiver<ClientEvent>,
    shutdown: oneshot::Receiver<()>,
}

impl Driver {
    async fn run(mut self, mut initial: Option<WsStream>) {
        loop {
            let stream = match initial.take() {
                Some(stream) => stream,
                None => match self.reconnect().await {
                    Some(stream) => stream,
                    None => return,
                },
            };
            self.backoff.reset();

            let ended = self.serve(stream).await;
            self.transition(ConnectionState::Disconnected);
            if ended == Ended::Shutdown {
                log::debug!("Driver for {} stopped", self.endpoint);
                return;
            }
            log::warn!("Connection to {} lost, reconnecting", self.endpoint);
        }
    }

    /// Retry until connected. `None` on shutdown.
    async fn reconnect(&mut self) -> Option<WsStream> {
        loop {
            let delay = self.backoff.next_delay();
            log::debug!("Reconnecting to {} in {delay:?}", self.endpoint);
            tokio::select! {
                _ = &mut self.shutdown => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            let attempt = tokio::select! {
                _ = &mut self.shutdown => return None,
                attempt = tokio_tungstenite::connect_async(self.endpoint.as_str()) => attempt,
            };
            match attempt {
                Ok((stream, _)) => {
                    log::info!("Reconnected to {}", self.endpoint);
                    self.transition(ConnectionState::Connected);
                    return Some(stream);
                }
                Err(e) => log::debug!("Reconnect to {} failed: {e}", self.endpoint),
            }
        }
    }

    async fn serve(&mut self, stream: WsStream) -> Ended {
        let (mut sink, mut source) = stream.split();

        loop {
            tokio::select! {
                _ = &mut self.shutdown => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    return Ended::Shutdown;
                }
                event = self.outbound.recv() => {
                    let Some(event) = event else {
                        return Ended::Shutdown;
                    };
                    match event.encode(self.framing) {
                        Ok(frame) => {
                            if let Err(e) = sink.send(WsMessage::from(frame)).await {
                                log::warn!("Send to {} failed, event dropped: {e}", self.endpoint);
                                return Ended::Lost;
                            }
                        }
                        Err(e) => log::warn!("Encoding outbound event failed: {e}"),
                    }
                }
                incoming = source.next() => match incoming {
                    Some(Ok(WsMessage::Binary(bytes))) => {
                        self.dispatch(ServerEvent::decode_binary(&bytes));
                    }
                    Some(Ok(WsMessage::Text(text))) => {
                        self.dispatch(ServerEvent::decode_text(text.as_str()));
                    }
                    Some(Ok(WsMessage::Close(_))) | None => return Ended::Lost,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::warn!("Transport error from {}: {e}", self.endpoint);
                        return Ended::Lost;
                    }
                },
            }
        }
    }

    fn dispatch(&self, decoded: Result<ServerEvent, ProtocolError>) {
        let event = match decoded {
            Ok(event) => event,
            Err(e) => {
                log::warn!("Dropping undecodable frame: {e}");
                return;
            }
        };
        let mut handlers = lock(&self.handlers);
        if handlers.disposed {
            return;
        }
        for (_, handler) in handlers.message.iter_mut() {
            handler(&event);
        }
    }

    /// Publish `next` and notify handlers if it differs from the current state.
    fn transition(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            *state = next;
            true
        });
        if !changed {
            return;
        }

        let mut handlers = lock(&self.handlers);
        if handlers.disposed {
            return;
        }
        for (_, handler) in handlers.connectivity.iter_mut() {
            handler(next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Message, RoomId};
    use tokio::net::TcpListener;

    fn fast_config() -> ConnectionConfig {
        ConnectionConfig {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            ..ConnectionConfig::default()
        }
    }

    async fn refused_endpoint() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        format!("ws://127.0.0.1:{port}")
    }

    async fn wait_for(rx: &mut watch::Receiver<ConnectionState>, want: ConnectionState) {
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == want))
            .await
            .expect("state transition timed out")
            .unwrap();
    }

    #[test]
    fn test_backoff_doubles_to_ceiling() {
        let mut backoff = Backoff::new(Duration::from_millis(250), Duration::from_secs(5));
        let delays: Vec<u128> = (0..7).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![250, 500, 1000, 2000, 4000, 5000, 5000]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(250));
    }

    #[test]
    fn test_initial_state() {
        let manager = ConnectionManager::new(ConnectionConfig::default());
        assert_eq!(manager.current_state(), ConnectionState::Disconnected);
        assert_eq!(manager.handler_count(), 0);
        assert!(manager.endpoint().is_none());
        assert_eq!(manager.config().outbound_capacity, 256);
    }

    #[test]
    fn test_handler_registration() {
        let manager = ConnectionManager::new(ConnectionConfig::default());
        let a = manager.on_message(|_| {});
        let b = manager.on_connectivity(|_| {});
        assert_ne!(a, b);
        assert_eq!(manager.handler_count(), 2);

        assert!(manager.remove_handler(a));
        assert!(!manager.remove_handler(a));
        assert_eq!(manager.handler_count(), 1);
    }

    #[test]
    fn test_send_queues_until_full() {
        let config = ConnectionConfig {
            outbound_capacity: 2,
            ..ConnectionConfig::default()
        };
        let manager = ConnectionManager::new(config);
        let join = ClientEvent::JoinRoom {
            room: RoomId::new(1).unwrap(),
            identity: "alice".into(),
        };

        assert!(manager.send(join.clone()));
        assert!(manager.send(join.clone()));
        assert!(!manager.send(join));
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let mut manager = ConnectionManager::new(ConnectionConfig::default());
        manager.on_message(|_| {});
        manager.dispose();
        manager.dispose();

        assert!(manager.is_disposed());
        assert_eq!(manager.handler_count(), 0);
        manager.on_connectivity(|_| {});
        assert_eq!(manager.handler_count(), 0);
        assert_eq!(
            manager.connect("ws://127.0.0.1:1").await,
            Err(ConnectionError::Disposed)
        );
    }

    #[tokio::test]
    async fn test_failed_connect_returns_error_once() {
        let endpoint = refused_endpoint().await;
        let mut manager = ConnectionManager::new(fast_config());

        let result = manager.connect(endpoint.clone()).await;
        assert!(matches!(result, Err(ConnectionError::Transport(_))));
        assert_eq!(manager.current_state(), ConnectionState::Disconnected);
        assert_eq!(manager.endpoint(), Some(endpoint.as_str()));

        assert_eq!(
            manager.connect(endpoint).await,
            Err(ConnectionError::AlreadyStarted)
        );
        manager.dispose();
    }

    #[tokio::test]
    async fn test_delivers_events_and_reconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("ws://{}", listener.local_addr().unwrap());
        let room = RoomId::new(7).unwrap();

        // first connection: push one event then hang up; second: stay open
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let event = ServerEvent::ReceivedMessage(Message::new("m1", "hi", "bob", room, 1));
            ws.send(event.encode(Framing::Binary).unwrap().into())
                .await
                .unwrap();
            ws.close(None).await.unwrap();
            drop(ws);

            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            // the event queued while disconnected arrives here
            let frame = ws.next().await.unwrap().unwrap();
            (ClientEvent::decode_binary(&frame.into_data()).unwrap(), ws)
        });

        let mut manager = ConnectionManager::new(fast_config());
        let (msg_tx, mut msg_rx) = mpsc::unbounded_channel();
        manager.on_message(move |event| {
            let _ = msg_tx.send(event.clone());
        });
        let (conn_tx, mut conn_rx) = mpsc::unbounded_channel();
        manager.on_connectivity(move |state| {
            let _ = conn_tx.send(state);
        });
        let mut state = manager.watch_state();

        manager.connect(endpoint).await.unwrap();
        assert_eq!(manager.current_state(), ConnectionState::Connected);
        assert_eq!(conn_rx.recv().await, Some(ConnectionState::Connected));

        let received = msg_rx.recv().await.unwrap();
        assert_eq!(received.room(), room);

        wait_for(&mut state, ConnectionState::Disconnected).await;
        let join = ClientEvent::JoinRoom {
            room,
            identity: "alice".into(),
        };
        assert!(manager.send(join.clone()));

        wait_for(&mut state, ConnectionState::Connected).await;
        let (echoed, _ws) = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(echoed, join);

        assert_eq!(conn_rx.recv().await, Some(ConnectionState::Disconnected));
        assert_eq!(conn_rx.recv().await, Some(ConnectionState::Connected));
        // exactly one inbound event was delivered
        assert!(msg_rx.try_recv().is_err());

        manager.dispose();
        assert_eq!(manager.current_state(), ConnectionState::Disconnected);
        assert!(conn_rx.try_recv().is_err());
    }
}
