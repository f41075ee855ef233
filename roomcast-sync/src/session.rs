//! Chat session: the client's room-entry and send logic.
//!
//! One actor task owns the [`Reconciler`]. Everything that can change the
//! view arrives on that task as an input and is handled to completion
//! before the next one:
//!
//! ```text
//! ChatSession handle ──commands──┐
//!                                ├──► actor task ──► Reconciler
//! connection handlers ──inputs───┤         │
//! history / cooldown tasks ──────┘         └──► SessionEvent stream
//! ```

use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use crate::client::{ConnectionManager, ConnectionState};
use crate::history::HistoryFetcher;
use crate::protocol::{
    display_name_or_anonymous, ClientEvent, Message, RoomId, ServerEvent, ANONYMOUS,
};
use crate::reconcile::{
    FetchTicket, HistoryOutcome, LiveOutcome, RateLimiter, Reconciler, SendError, MIN_SEND_INTERVAL,
};

/// Source of the local user's display name.
pub trait IdentityProvider: Send + Sync {
    /// `None` when the user is not signed in.
    fn display_name(&self) -> Option<String>;
}

/// A fixed display name.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity(Option<String>);

impl StaticIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        Self(Some(name.into()))
    }

    pub fn anonymous() -> Self {
        Self(None)
    }
}

impl IdentityProvider for StaticIdentity {
    fn display_name(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Relay endpoint, e.g. `ws://127.0.0.1:5000`
    pub endpoint: String,
    /// Minimum spacing between sends (default: 500ms)
    pub min_send_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://127.0.0.1:5000".to_string(),
            min_send_interval: MIN_SEND_INTERVAL,
        }
    }
}

/// What the session reports to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connectivity(ConnectionState),
    /// The backlog for `room` is in place; `count` entries are displayed.
    HistoryLoaded { room: RoomId, count: usize },
    MessageAppended(Message),
    UserJoined { identity: String, room: RoomId },
    UserLeft { identity: String, room: RoomId },
    /// Sending is blocked for `retry_after`.
    InputBlocked { retry_after: Duration },
    InputReady,
}

enum Command {
    EnterRoom(RoomId),
    Send {
        text: String,
        reply: oneshot::Sender<Result<Message, SendError>>,
    },
    Snapshot(oneshot::Sender<Vec<Message>>),
    Shutdown(oneshot::Sender<()>),
}

enum Input {
    Live(ServerEvent),
    Connectivity(ConnectionState),
    History {
        ticket: FetchTicket,
        messages: Vec<Message>,
    },
    CooldownElapsed(u64),
}

/// Handle to a running chat session. Clones talk to the same session.
#[derive(Clone)]
pub struct ChatSession {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl ChatSession {
    /// Wire `connection` to a new session task and connect it.
    ///
    /// A failed first connect is logged; the connection keeps retrying in
    /// the background and the session re-joins its room once it is up.
    pub async fn start(
        config: SessionConfig,
        mut connection: ConnectionManager,
        fetcher: HistoryFetcher,
        identity: &dyn IdentityProvider,
    ) -> (ChatSession, mpsc::UnboundedReceiver<SessionEvent>) {
        let (input_tx, input_rx) = mpsc::unbounded_channel();

        let tx = input_tx.clone();
        connection.on_message(move |event| {
            let _ = tx.send(Input::Live(event.clone()));
        });
        let tx = input_tx.clone();
        connection.on_connectivity(move |state| {
            let _ = tx.send(Input::Connectivity(state));
        });

        let state = connection.watch_state();
        if let Err(e) = connection.connect(config.endpoint.clone()).await {
            log::warn!("Relay at {} unreachable, retrying in background: {e}", config.endpoint);
        }

        let identity = identity
            .display_name()
            .map(|name| display_name_or_anonymous(&name))
            .unwrap_or_else(|| ANONYMOUS.to_string());

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let actor = SessionActor {
            reconciler: Reconciler::with_rate_limiter(RateLimiter::new(config.min_send_interval)),
            connection,
            fetcher,
            identity,
            joined: None,
            cooldown_seq: 0,
            inputs: input_tx,
            events: event_tx,
        };
        tokio::spawn(actor.run(command_rx, input_rx));

        (
            ChatSession {
                commands: command_tx,
                state,
            },
            event_rx,
        )
    }

    /// Switch to `room`: reset the view, join, and load the backlog.
    pub fn enter_room(&self, room: RoomId) {
        if self.commands.send(Command::EnterRoom(room)).is_err() {
            log::debug!("Session closed, cannot enter room {room}");
        }
    }

    /// Send `text` to the active room.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<Message, SendError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Send {
                text: text.into(),
                reply,
            })
            .map_err(|_| SendError::SessionClosed)?;
        rx.await.map_err(|_| SendError::SessionClosed)?
    }

    /// The displayed messages, in order. Empty once the session is closed.
    pub async fn snapshot(&self) -> Vec<Message> {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Snapshot(reply)).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Dispose the connection and stop the session task.
    pub async fn shutdown(&self) {
        let (ack, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(ack)).is_ok() {
            let _ = rx.await;
        }
    }
}

struct SessionActor {
    reconciler: Reconciler,
    connection: ConnectionManager,
    fetcher: HistoryFetcher,
    identity: String,
    /// Room joined on the current link, if any.
    joined: Option<RoomId>,
    cooldown_seq: u64,
    inputs: mpsc::UnboundedSender<Input>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut inputs: mpsc::UnboundedReceiver<Input>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown(ack)) => {
                        self.connection.dispose();
                        let _ = ack.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(input) = inputs.recv() => self.handle_input(input),
            }
        }
        self.connection.dispose();
        log::debug!("Chat session for {} stopped", self.identity);
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::EnterRoom(room) => self.enter_room(room),
            Command::Send { text, reply } => {
                let _ = reply.send(self.send(&text));
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.reconciler.view().to_vec());
            }
            Command::Shutdown(_) => {}
        }
    }

    fn handle_input(&mut self, input: Input) {
        match input {
            Input::Live(event) => self.receive(event),
            Input::Connectivity(state) => {
                match state {
                    ConnectionState::Connected => self.join_active_room(),
                    ConnectionState::Disconnected => self.joined = None,
                }
                self.emit(SessionEvent::Connectivity(state));
            }
            Input::History { ticket, messages } => {
                if let HistoryOutcome::Applied { backlog, live } =
                    self.reconciler.apply_history(ticket, messages)
                {
                    log::debug!(
                        "Room {} loaded: {backlog} stored, {live} live",
                        ticket.room()
                    );
                    self.emit(SessionEvent::HistoryLoaded {
                        room: ticket.room(),
                        count: self.reconciler.len(),
                    });
                }
            }
            Input::CooldownElapsed(seq) => {
                if seq == self.cooldown_seq {
                    self.emit(SessionEvent::InputReady);
                }
            }
        }
    }

    fn enter_room(&mut self, room: RoomId) {
        let ticket = self.reconciler.enter_room(room);
        self.joined = None;
        if self.connection.current_state() == ConnectionState::Connected {
            self.join_active_room();
        }

        let fetcher = self.fetcher.clone();
        let inputs = self.inputs.clone();
        tokio::spawn(async move {
            let messages = fetcher.fetch_history(room).await;
            let _ = inputs.send(Input::History { ticket, messages });
        });
    }

    fn join_active_room(&mut self) {
        let Some(room) = self.reconciler.active_room() else {
            return;
        };
        if self.joined == Some(room) {
            return;
        }
        self.connection.send(ClientEvent::JoinRoom {
            room,
            identity: self.identity.clone(),
        });
        self.joined = Some(room);
        log::info!("Joining room {room} as {}", self.identity);
    }

    fn receive(&mut self, event: ServerEvent) {
        let active = self.reconciler.active_room();
        match event {
            ServerEvent::ReceivedMessage(message) => {
                let id = message.id.clone();
                match self.reconciler.receive_live(message.clone()) {
                    LiveOutcome::Appended => self.emit(SessionEvent::MessageAppended(message)),
                    outcome => log::debug!("Live message {id}: {outcome:?}"),
                }
            }
            ServerEvent::UserJoin { identity, room } if active == Some(room) => {
                self.emit(SessionEvent::UserJoined { identity, room });
            }
            ServerEvent::UserLeave { identity, room } if active == Some(room) => {
                self.emit(SessionEvent::UserLeft { identity, room });
            }
            _ => {}
        }
    }

    fn send(&mut self, text: &str) -> Result<Message, SendError> {
        let now = Instant::now();
        let message = self.reconciler.compose(text, &self.identity, now)?;

        self.connection
            .send(ClientEvent::SendMessage(message.clone()));

        let fetcher = self.fetcher.clone();
        let stored = message.clone();
        tokio::spawn(async move {
            if let Err(e) = fetcher.submit_message(&stored).await {
                log::warn!("Persisting message {} failed: {e}", stored.id);
            }
        });

        self.emit(SessionEvent::MessageAppended(message.clone()));
        self.start_cooldown(self.reconciler.cooldown_remaining(now));
        Ok(message)
    }

    fn start_cooldown(&mut self, retry_after: Duration) {
        self.cooldown_seq += 1;
        let seq = self.cooldown_seq;
        self.emit(SessionEvent::InputBlocked { retry_after });

        let inputs = self.inputs.clone();
        tokio::spawn(async move {
            tokio::time::sleep(retry_after).await;
            let _ = inputs.send(Input::CooldownElapsed(seq));
        });
    }

    fn emit(&self, event: SessionEvent) {
        // the owner may have stopped listening
        let _ = self.events.send(event);
    }
}
