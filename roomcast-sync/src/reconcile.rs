//! Stream reconciler: merges the stored backlog, live relay events and
//! optimistic local sends into one deduplicated, ordered view.
//!
//! ```text
//! enter_room ──► loading ──apply_history──► live
//!                   │                         │
//!      receive_live: queued           receive_live: appended / duplicate
//! ```
//!
//! The reconciler is a plain state machine. It never awaits and takes the
//! current time as an argument, so the owner decides where it runs and
//! tests drive the clock directly.

use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;

use crate::protocol::{
    display_name_or_anonymous, now_millis, validate_text, Message, MessageId, ProtocolError,
    RoomId,
};

/// Minimum spacing between two accepted sends.
pub const MIN_SEND_INTERVAL: Duration = Duration::from_millis(500);

/// Rejects sends that follow the previous accepted send too closely.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    interval: Duration,
    last_send: Option<Instant>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(MIN_SEND_INTERVAL)
    }
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_send: None,
        }
    }

    /// `Err(retry_after)` if a send at `now` is too early.
    pub fn check(&self, now: Instant) -> Result<(), Duration> {
        match self.cooldown_remaining(now) {
            remaining if remaining.is_zero() => Ok(()),
            remaining => Err(remaining),
        }
    }

    /// Record an accepted send. Rejected attempts are never recorded.
    pub fn record(&mut self, now: Instant) {
        self.last_send = Some(now);
    }

    /// Time until the next send is allowed; zero when unblocked.
    pub fn cooldown_remaining(&self, now: Instant) -> Duration {
        self.last_send.map_or(Duration::ZERO, |last| {
            self.interval
                .saturating_sub(now.saturating_duration_since(last))
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

/// Identifies one history request. Only the ticket of the latest
/// [`Reconciler::enter_room`] is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchTicket {
    room: RoomId,
    generation: u64,
}

impl FetchTicket {
    pub fn room(&self) -> RoomId {
        self.room
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryOutcome {
    /// The ticket belongs to a room that is no longer active.
    Stale,
    /// Number of backlog entries and queued live events added to the view.
    Applied { backlog: usize, live: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveOutcome {
    Appended,
    Duplicate,
    /// Held until the backlog arrives.
    Queued,
    /// No active room, or the message belongs to another room.
    Ignored,
}

/// Why a local send was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("no active room")]
    NoActiveRoom,
    #[error(transparent)]
    Invalid(#[from] ProtocolError),
    #[error("sending too fast, retry in {retry_after:?}")]
    RateLimited { retry_after: Duration },
    #[error("chat session is closed")]
    SessionClosed,
}

/// The client's view of the active room.
#[derive(Debug, Default)]
pub struct Reconciler {
    active: Option<RoomId>,
    generation: u64,
    loading: bool,
    view: Vec<Message>,
    /// Ids of everything in `view`.
    seen: HashSet<MessageId>,
    /// Live events received while the backlog is loading.
    pending: Vec<Message>,
    limiter: RateLimiter,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rate_limiter(limiter: RateLimiter) -> Self {
        Self {
            limiter,
            ..Self::default()
        }
    }

    /// Switch to `room`, discarding the previous view.
    pub fn enter_room(&mut self, room: RoomId) -> FetchTicket {
        self.generation = self.generation.wrapping_add(1);
        self.active = Some(room);
        self.loading = true;
        self.view.clear();
        self.seen.clear();
        self.pending.clear();
        log::debug!("Entered room {room} (generation {})", self.generation);

        FetchTicket {
            room,
            generation: self.generation,
        }
    }

    /// Install the backlog for `ticket`.
    ///
    /// Resulting order: backlog by timestamp, then anything already shown
    /// (optimistic sends made while loading), then queued live events in
    /// arrival order. Each id appears once.
    pub fn apply_history(
        &mut self,
        ticket: FetchTicket,
        mut backlog: Vec<Message>,
    ) -> HistoryOutcome {
        if !self.loading
            || self.active != Some(ticket.room)
            || self.generation != ticket.generation
        {
            log::debug!("Discarding stale history for room {}", ticket.room);
            return HistoryOutcome::Stale;
        }

        backlog.sort_by_key(|m| m.timestamp);
        let displayed = std::mem::take(&mut self.view);
        let pending = std::mem::take(&mut self.pending);
        let mut view = Vec::with_capacity(backlog.len() + displayed.len() + pending.len());

        // `seen` still holds the displayed ids, so a backlog copy of an
        // optimistic send is skipped here and the original keeps its place.
        let mut backlog_added = 0;
        for message in backlog {
            if self.seen.insert(message.id.clone()) {
                view.push(message);
                backlog_added += 1;
            }
        }
        view.extend(displayed);

        let mut live_added = 0;
        for message in pending {
            if self.seen.insert(message.id.clone()) {
                view.push(message);
                live_added += 1;
            }
        }

        self.view = view;
        self.loading = false;
        HistoryOutcome::Applied {
            backlog: backlog_added,
            live: live_added,
        }
    }

    /// Handle one relayed chat message.
    pub fn receive_live(&mut self, message: Message) -> LiveOutcome {
        if self.active != Some(message.room) {
            return LiveOutcome::Ignored;
        }

        if self.loading {
            if self.seen.contains(&message.id) || self.pending.iter().any(|m| m.id == message.id) {
                return LiveOutcome::Duplicate;
            }
            self.pending.push(message);
            return LiveOutcome::Queued;
        }

        if !self.seen.insert(message.id.clone()) {
            return LiveOutcome::Duplicate;
        }
        self.view.push(message);
        LiveOutcome::Appended
    }

    /// Build a local message and show it immediately.
    pub fn compose(
        &mut self,
        text: &str,
        sender: &str,
        now: Instant,
    ) -> Result<Message, SendError> {
        let room = self.active.ok_or(SendError::NoActiveRoom)?;
        let text = validate_text(text)?;
        self.limiter
            .check(now)
            .map_err(|retry_after| SendError::RateLimited { retry_after })?;

        let message = Message::new(
            MessageId::generate(),
            text,
            display_name_or_anonymous(sender),
            room,
            now_millis(),
        );
        self.limiter.record(now);
        self.seen.insert(message.id.clone());
        self.view.push(message.clone());
        Ok(message)
    }

    pub fn cooldown_remaining(&self, now: Instant) -> Duration {
        self.limiter.cooldown_remaining(now)
    }

    pub fn view(&self) -> &[Message] {
        &self.view
    }

    pub fn len(&self) -> usize {
        self.view.len()
    }

    pub fn is_empty(&self) -> bool {
        self.view.is_empty()
    }

    pub fn active_room(&self) -> Option<RoomId> {
        self.active
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.seen.contains(id)
    }
}
