//! Connection lifecycle and frame dispatch, independent of any I/O.
//!
//! [`Session`] owns the conversation store, the presence roster, and the
//! reconnect state. Every input (socket opened, frame received, socket
//! closed, timer fired, snapshot fetched, user command) is a method call that
//! mutates the session and returns the [`Action`]s the driver in
//! [`crate::connection`] must perform. Keeping the core synchronous makes every
//! ordering rule testable without sockets or timers.
//!
//! # Generations
//!
//! Each connection attempt gets a new generation number. Socket events and
//! snapshot results carry the generation they belong to, and anything tagged
//! with an older generation is discarded. A late close from a replaced
//! socket therefore can never schedule a second reconnect, and a slow history
//! response can never overwrite state from a newer connection.

use std::time::Duration;

use chatsync_proto::codec;
use chatsync_proto::message::{Content, Envelope, Inbound, MessageKind};
use chatsync_proto::presence::PresenceUser;

use crate::bootstrap::{
    BootstrapWindow, FetchError, LiveMutation, PresenceChange, build_history_index, reconcile,
    reconcile_presence,
};
use crate::chat::ack::AckTracker;
use crate::chat::store::{ConversationStore, StoreLimits};
use crate::chat::ChatMessage;
use crate::config::ReconnectConfig;
use crate::roster::PresenceRoster;

/// Observable lifecycle of the duplex connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Created but not started.
    Idle,
    /// A connection attempt is in progress.
    Connecting,
    /// The socket is open; sends are accepted.
    Open,
    /// The socket closed; a reconnect is about to be scheduled.
    Closed,
    /// Waiting for the reconnect timer.
    Reconnecting,
    /// Disconnected by the user. Terminal.
    Stopped,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Open => write!(f, "open"),
            Self::Closed => write!(f, "closed"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Exponential reconnect delay: `min(base * 2^(attempt - 1), max)`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    /// Creates a backoff with no failed attempts.
    #[must_use]
    pub const fn new(config: &ReconnectConfig) -> Self {
        Self {
            base: config.base_delay,
            max: config.max_delay,
            attempt: 0,
        }
    }

    /// Counts one more failed attempt and returns the delay before retrying.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        let factor = 1_u32.checked_shl(self.attempt - 1).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Resets the attempt counter after a successful open.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Number of consecutive failed attempts.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Side effect requested by the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Open a socket for `generation`, authenticating with `token`.
    Connect {
        /// Generation the new socket belongs to.
        generation: u64,
        /// Bearer token for the handshake.
        token: String,
    },
    /// Write a text frame on the socket of `generation`.
    SendFrame {
        /// Generation of the socket to write to.
        generation: u64,
        /// Encoded envelope.
        frame: String,
    },
    /// Start the reconnect timer.
    ScheduleReconnect {
        /// Delay before the timer fires.
        delay: Duration,
    },
    /// Cancel the pending reconnect timer.
    CancelReconnect,
    /// Fetch the presence and history snapshots for `generation`.
    FetchSnapshots {
        /// Generation the results must be tagged with.
        generation: u64,
        /// Bearer token for the requests.
        token: String,
    },
    /// Close the socket of `generation`.
    CloseSocket {
        /// Generation of the socket to close.
        generation: u64,
    },
}

/// Which observable values changed since the last [`Session::take_changes`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Changes {
    /// The conversation index changed.
    pub conversations: bool,
    /// The presence roster changed.
    pub presence: bool,
    /// The connection state changed.
    pub state: bool,
}

impl Changes {
    /// Whether anything changed.
    #[must_use]
    pub const fn any(&self) -> bool {
        self.conversations || self.presence || self.state
    }
}

/// Session settings that do not depend on the transport.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Id of the authenticated local user.
    pub user_id: String,
    /// IANA timezone stamped on outbound envelopes.
    pub sender_timezone: Option<String>,
    /// Reconnect delays.
    pub reconnect: ReconnectConfig,
    /// Store retention limits.
    pub limits: StoreLimits,
}

impl SessionConfig {
    /// Creates a config for `user_id` with default delays and limits.
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            sender_timezone: None,
            reconnect: ReconnectConfig::default(),
            limits: StoreLimits::default(),
        }
    }
}

/// The synchronization state machine for one authenticated session.
#[derive(Debug)]
pub struct Session {
    config: SessionConfig,
    token: String,
    state: ConnectionState,
    generation: u64,
    backoff: Backoff,
    reconnect_pending: bool,
    store: ConversationStore,
    roster: PresenceRoster,
    acks: AckTracker,
    bootstrap: Option<BootstrapWindow>,
    changes: Changes,
}

impl Session {
    /// Creates an idle session.
    pub fn new(config: SessionConfig, token: impl Into<String>) -> Self {
        Self {
            backoff: Backoff::new(&config.reconnect),
            store: ConversationStore::new(config.limits),
            acks: AckTracker::new(config.user_id.clone(), config.sender_timezone.clone()),
            token: token.into(),
            state: ConnectionState::Idle,
            generation: 0,
            reconnect_pending: false,
            roster: PresenceRoster::new(),
            bootstrap: None,
            changes: Changes::default(),
            config,
        }
    }

    /// Current connection state.
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Generation of the current (or most recent) socket.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// The conversation store.
    #[must_use]
    pub const fn store(&self) -> &ConversationStore {
        &self.store
    }

    /// The presence roster.
    #[must_use]
    pub const fn roster(&self) -> &PresenceRoster {
        &self.roster
    }

    /// The reconnect backoff.
    #[must_use]
    pub const fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Whether a reconnect timer is outstanding.
    #[must_use]
    pub const fn reconnect_pending(&self) -> bool {
        self.reconnect_pending
    }

    /// Returns and clears the change flags.
    pub fn take_changes(&mut self) -> Changes {
        std::mem::take(&mut self.changes)
    }

    /// Starts the first connection attempt. Has no effect unless idle.
    pub fn start(&mut self) -> Vec<Action> {
        if self.state != ConnectionState::Idle {
            return Vec::new();
        }
        vec![self.begin_attempt()]
    }

    /// Handles a successful handshake of socket `generation`.
    pub fn on_opened(&mut self, generation: u64) -> Vec<Action> {
        if !self.is_live(generation) {
            tracing::debug!(generation, "ignoring open from stale socket");
            return Vec::new();
        }

        let mut actions = Vec::new();
        if self.reconnect_pending {
            self.reconnect_pending = false;
            actions.push(Action::CancelReconnect);
        }
        self.backoff.reset();
        self.set_state(ConnectionState::Open);
        self.bootstrap = Some(BootstrapWindow::new(generation));
        tracing::info!(generation, user = %self.config.user_id, "connected");

        actions.push(Action::FetchSnapshots {
            generation,
            token: self.token.clone(),
        });
        actions
    }

    /// Handles the close (or failed handshake) of socket `generation`.
    ///
    /// Schedules at most one reconnect, however many close notifications
    /// arrive before it fires.
    pub fn on_closed(&mut self, generation: u64) -> Vec<Action> {
        if !self.is_live(generation) {
            tracing::debug!(generation, "ignoring close from stale socket");
            return Vec::new();
        }
        self.set_state(ConnectionState::Closed);
        if self.reconnect_pending {
            return Vec::new();
        }

        let delay = self.backoff.next_delay();
        self.reconnect_pending = true;
        self.set_state(ConnectionState::Reconnecting);
        tracing::warn!(
            attempt = self.backoff.attempt(),
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "connection closed, scheduling reconnect"
        );
        vec![Action::ScheduleReconnect { delay }]
    }

    /// Handles the reconnect timer firing.
    pub fn on_reconnect_due(&mut self) -> Vec<Action> {
        if !self.reconnect_pending || self.state == ConnectionState::Stopped {
            return Vec::new();
        }
        self.reconnect_pending = false;
        vec![self.begin_attempt()]
    }

    /// Handles a text frame received on socket `generation`.
    pub fn on_frame(&mut self, generation: u64, text: &str) -> Vec<Action> {
        if !self.is_live(generation) {
            tracing::debug!(generation, "dropping frame from stale socket");
            return Vec::new();
        }
        match codec::decode_inbound(text) {
            Ok(inbound) => self.dispatch(inbound),
            Err(e) => {
                tracing::warn!(err = %e, "dropping undecodable frame");
                Vec::new()
            }
        }
    }

    /// Applies the presence snapshot fetched for `generation`.
    pub fn on_presence_snapshot(
        &mut self,
        generation: u64,
        result: Result<Vec<PresenceUser>, FetchError>,
    ) {
        let Some(window) = self.current_window(generation) else {
            tracing::debug!(generation, "discarding stale presence snapshot");
            return;
        };
        let buffered = window.finish_presence();
        match result {
            Ok(users) => {
                tracing::debug!(
                    users = users.len(),
                    replayed = buffered.len(),
                    "presence snapshot loaded"
                );
                reconcile_presence(&mut self.roster, users, buffered);
                self.changes.presence = true;
            }
            Err(e) => tracing::warn!(err = %e, "presence snapshot failed"),
        }
        self.log_bootstrap_complete();
    }

    /// Applies the history snapshot fetched for `generation`.
    ///
    /// On success the store is rebuilt from the snapshot, then local pending
    /// sends and live mutations recorded since the socket opened are
    /// re-applied. On failure the live state is kept as is.
    pub fn on_history_snapshot(
        &mut self,
        generation: u64,
        result: Result<Vec<Envelope>, FetchError>,
    ) {
        let Some(window) = self.current_window(generation) else {
            tracing::debug!(generation, "discarding stale history snapshot");
            return;
        };
        let buffered = window.finish_history();
        match result {
            Ok(envelopes) => {
                tracing::debug!(
                    envelopes = envelopes.len(),
                    replayed = buffered.len(),
                    "history snapshot loaded"
                );
                let index = build_history_index(
                    envelopes,
                    &self.config.user_id,
                    self.config.limits.max_messages_per_peer,
                );
                reconcile(&mut self.store, index, buffered);
                self.changes.conversations = true;
            }
            Err(e) => tracing::warn!(err = %e, "history snapshot failed"),
        }
        self.log_bootstrap_complete();
    }

    /// Sends a text message to `recipient_id`.
    ///
    /// Ignored unless the socket is open, the recipient is non-empty and the
    /// text is not blank. The message is stored as pending immediately.
    pub fn send(&mut self, recipient_id: &str, text: &str) -> Vec<Action> {
        if self.state != ConnectionState::Open {
            tracing::debug!(state = %self.state, "not connected, dropping send");
            return Vec::new();
        }
        if recipient_id.is_empty() || text.trim().is_empty() {
            tracing::debug!("empty recipient or text, dropping send");
            return Vec::new();
        }

        let envelope = Envelope::chat(
            self.config.user_id.as_str(),
            recipient_id,
            text,
            self.config.sender_timezone.clone(),
        );
        let frame = match codec::encode(&envelope) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(err = %e, "failed to encode outbound message");
                return Vec::new();
            }
        };

        let message = ChatMessage::pending(&envelope);
        self.record(LiveMutation::Upsert(message.clone()));
        self.store.upsert(recipient_id, message);
        self.changes.conversations = true;
        tracing::debug!(message_id = %envelope.message_id, to = recipient_id, "message sent");

        vec![Action::SendFrame {
            generation: self.generation,
            frame,
        }]
    }

    /// Ensures a conversation with `peer_id` exists.
    pub fn open_chat(&mut self, peer_id: &str) {
        if peer_id.is_empty() {
            return;
        }
        self.record(LiveMutation::OpenChat(peer_id.to_string()));
        self.store.open_chat(peer_id);
        self.changes.conversations = true;
    }

    /// Replaces the token used for future handshakes and snapshot fetches.
    pub fn update_token(&mut self, token: impl Into<String>) {
        self.token = token.into();
    }

    /// Stops the session: cancels any reconnect and closes the socket.
    pub fn disconnect(&mut self) -> Vec<Action> {
        if self.state == ConnectionState::Stopped {
            return Vec::new();
        }
        let mut actions = Vec::new();
        if self.reconnect_pending {
            self.reconnect_pending = false;
            actions.push(Action::CancelReconnect);
        }
        if self.state != ConnectionState::Idle {
            actions.push(Action::CloseSocket {
                generation: self.generation,
            });
        }
        self.bootstrap = None;
        self.set_state(ConnectionState::Stopped);
        tracing::info!("session stopped");
        actions
    }

    fn begin_attempt(&mut self) -> Action {
        self.generation += 1;
        self.set_state(ConnectionState::Connecting);
        tracing::debug!(generation = self.generation, "connecting");
        Action::Connect {
            generation: self.generation,
            token: self.token.clone(),
        }
    }

    fn dispatch(&mut self, inbound: Inbound) -> Vec<Action> {
        let Inbound { envelope, content } = inbound;
        match (envelope.kind, content) {
            (MessageKind::PresenceInit, Content::PresenceBatch(users)) => {
                self.record_presence(PresenceChange::Replace(users.clone()));
                self.roster.replace_all(users);
                self.changes.presence = true;
                Vec::new()
            }
            (MessageKind::PresenceJoin, Content::Presence(user)) => {
                self.record_presence(PresenceChange::Join(user.clone()));
                if self.roster.add_one(user) {
                    self.changes.presence = true;
                }
                Vec::new()
            }
            (MessageKind::PresenceLeave, Content::Presence(user)) => {
                self.record_presence(PresenceChange::Leave(user.id.clone()));
                if self.roster.remove_one(&user.id) {
                    self.changes.presence = true;
                }
                Vec::new()
            }
            (MessageKind::Ack, _) => {
                if let Some(id) = &envelope.correlation_id {
                    self.record(LiveMutation::Ack(id.clone()));
                }
                if self.acks.apply(&mut self.store, &envelope) {
                    self.changes.conversations = true;
                }
                Vec::new()
            }
            (MessageKind::Chat, content) => self.receive_chat(&envelope, content),
            (kind, _) => {
                tracing::trace!(%kind, "ignoring frame");
                Vec::new()
            }
        }
    }

    fn receive_chat(&mut self, envelope: &Envelope, content: Content) -> Vec<Action> {
        let mut actions = Vec::new();
        if let Some(ack) = self.acks.ack_for(envelope) {
            match codec::encode(&ack) {
                Ok(frame) => actions.push(Action::SendFrame {
                    generation: self.generation,
                    frame,
                }),
                Err(e) => tracing::warn!(err = %e, "failed to encode ack"),
            }
        }

        match content {
            Content::Text(text) => {
                let peer = envelope.peer_of(&self.config.user_id).to_string();
                if peer.is_empty() {
                    tracing::warn!(message_id = %envelope.message_id, "chat without peer, dropping");
                    return actions;
                }
                let message = ChatMessage::from_envelope(envelope, text, &self.config.user_id);
                self.record(LiveMutation::Upsert(message.clone()));
                self.store.upsert(&peer, message);
                self.changes.conversations = true;
            }
            Content::Other { kind } => {
                tracing::debug!(%kind, message_id = %envelope.message_id, "unsupported chat content, not stored");
            }
            _ => {}
        }
        actions
    }

    fn record(&mut self, mutation: LiveMutation) {
        if let Some(window) = self.bootstrap.as_mut() {
            window.record(mutation);
        }
    }

    fn record_presence(&mut self, change: PresenceChange) {
        if let Some(window) = self.bootstrap.as_mut() {
            window.record_presence(change);
        }
    }

    fn is_live(&self, generation: u64) -> bool {
        generation == self.generation && self.state != ConnectionState::Stopped
    }

    fn current_window(&mut self, generation: u64) -> Option<&mut BootstrapWindow> {
        if !self.is_live(generation) {
            return None;
        }
        self.bootstrap
            .as_mut()
            .filter(|window| window.generation() == generation)
    }

    fn log_bootstrap_complete(&self) {
        if self.bootstrap.as_ref().is_some_and(BootstrapWindow::is_complete) {
            tracing::info!(
                peers = self.store.peer_count(),
                online = self.roster.len(),
                "bootstrap complete"
            );
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            tracing::trace!(from = %self.state, to = %state, "connection state");
            self.state = state;
            self.changes.state = true;
        }
    }
}
