//! Connection manager: runs a [`Session`] against real sockets, timers and
//! HTTP fetches.
//!
//! [`ConnectionManager::connect`] spawns one driver task per session and
//! returns a [`SessionHandle`]. All state lives inside the driver task, which
//! serializes every input (user command, socket event, timer, fetch result)
//! through the sans-IO [`Session`] and performs the [`Action`]s it returns.
//!
//! # Architecture
//!
//! ```text
//! SessionHandle ── Command ──→ driver task ──→ socket task (per generation)
//!               ←─ watch ────              ←── DriverEvent ──  timer / fetch tasks
//! ```
//!
//! Observers read the conversation index, the presence list and the
//! connection state through `tokio::sync::watch` receivers.

pub mod socket;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use chatsync_proto::message::Envelope;
use chatsync_proto::presence::PresenceUser;

use crate::bootstrap::{FetchError, HttpSnapshotSource, SnapshotSource};
use crate::chat::ConversationIndex;
use crate::chat::store::StoreLimits;
use crate::config::ReconnectConfig;
use crate::session::{Action, ConnectionState, Session, SessionConfig};

pub use socket::{Outgoing, SocketWriter, TransportError};

/// Default capacity of the command channel.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// How long a closing socket may take to flush its close frame on shutdown.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Identity used for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Bearer token for the handshake and the snapshot requests.
    pub token: String,
    /// Id of the authenticated user.
    pub user_id: String,
}

/// Configuration for the networking layer.
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// WebSocket URL of the messenger server (e.g. `wss://host/chat/ws`).
    pub socket_url: String,
    /// Origin of the REST API (e.g. `https://host`).
    pub api_origin: String,
    /// Capacity of the command channel into the driver.
    pub channel_capacity: usize,
    /// Reconnect delays.
    pub reconnect: ReconnectConfig,
    /// Store retention limits.
    pub limits: StoreLimits,
    /// IANA timezone stamped on outbound envelopes.
    pub sender_timezone: Option<String>,
}

impl NetConfig {
    /// Creates a `NetConfig` with default delays, limits and capacity.
    #[must_use]
    pub fn new(socket_url: impl Into<String>, api_origin: impl Into<String>) -> Self {
        Self {
            socket_url: socket_url.into(),
            api_origin: api_origin.into(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            reconnect: ReconnectConfig::default(),
            limits: StoreLimits::default(),
            sender_timezone: None,
        }
    }

    fn session_config(&self, user_id: String) -> SessionConfig {
        SessionConfig {
            user_id,
            sender_timezone: self.sender_timezone.clone(),
            reconnect: self.reconnect,
            limits: self.limits,
        }
    }
}

/// Commands sent from a [`SessionHandle`] to its driver task.
#[derive(Debug)]
enum Command {
    Send { recipient_id: String, text: String },
    OpenChat(String),
    UpdateToken(String),
}

/// Inputs produced by the socket, timer and fetch tasks.
#[derive(Debug)]
pub enum DriverEvent {
    /// The socket of `generation` completed its handshake.
    Opened {
        /// Socket generation.
        generation: u64,
        /// Handle for writing to the socket.
        writer: SocketWriter,
    },
    /// A text frame arrived on the socket of `generation`.
    Frame {
        /// Socket generation.
        generation: u64,
        /// Raw frame text.
        text: String,
    },
    /// The socket of `generation` closed or failed to open.
    Closed {
        /// Socket generation.
        generation: u64,
    },
    /// The reconnect timer fired.
    ReconnectDue,
    /// The presence snapshot for `generation` finished.
    Presence {
        /// Generation the fetch was started for.
        generation: u64,
        /// Fetch outcome.
        result: Result<Vec<PresenceUser>, FetchError>,
    },
    /// The history snapshot for `generation` finished.
    History {
        /// Generation the fetch was started for.
        generation: u64,
        /// Fetch outcome.
        result: Result<Vec<Envelope>, FetchError>,
    },
}

/// Factory for sessions sharing one configuration and snapshot source.
#[derive(Debug)]
pub struct ConnectionManager<S = HttpSnapshotSource> {
    config: NetConfig,
    source: Arc<S>,
}

impl ConnectionManager<HttpSnapshotSource> {
    /// Creates a manager fetching snapshots from `config.api_origin`.
    ///
    /// # Errors
    ///
    /// Returns `FetchError::InvalidUrl` if the API origin is not a URL.
    pub fn new(config: NetConfig) -> Result<Self, FetchError> {
        let source = HttpSnapshotSource::new(&config.api_origin)?;
        Ok(Self::with_source(config, source))
    }
}

impl<S: SnapshotSource + 'static> ConnectionManager<S> {
    /// Creates a manager using a custom snapshot source.
    pub fn with_source(config: NetConfig, source: S) -> Self {
        Self {
            config,
            source: Arc::new(source),
        }
    }

    /// Spawns a session for `credentials` and starts its first connection
    /// attempt.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn connect(&self, credentials: Credentials) -> SessionHandle {
        let Credentials { token, user_id } = credentials;
        tracing::info!(user = %user_id, url = %self.config.socket_url, "starting session");

        let session = Session::new(self.config.session_config(user_id), token);
        let (command_tx, command_rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let (stop_tx, stop_rx) = watch::channel(false);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (conversations_tx, conversations) = watch::channel(ConversationIndex::new());
        let (presence_tx, presence) = watch::channel(Vec::new());
        let (state_tx, state) = watch::channel(ConnectionState::Idle);

        let driver = Driver {
            session,
            socket_url: self.config.socket_url.clone(),
            source: Arc::clone(&self.source),
            events: event_tx,
            writer: None,
            socket_task: None,
            reconnect_timer: None,
            conversations_tx,
            presence_tx,
            state_tx,
        };
        let task = tokio::spawn(driver.run(command_rx, stop_rx, event_rx));

        SessionHandle {
            commands: command_tx,
            stop: stop_tx,
            conversations,
            presence,
            state,
            task,
        }
    }
}

/// Caller-side handle of a running session.
///
/// Dropping the handle disconnects the session.
#[derive(Debug)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    stop: watch::Sender<bool>,
    conversations: watch::Receiver<ConversationIndex>,
    presence: watch::Receiver<Vec<PresenceUser>>,
    state: watch::Receiver<ConnectionState>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Sends `text` to `recipient_id`.
    ///
    /// Returns immediately. The message appears in the conversation index as
    /// pending once the driver has processed it; it is silently dropped if
    /// the connection is not open or either argument is blank.
    pub fn send(&self, recipient_id: &str, text: &str) {
        self.command(Command::Send {
            recipient_id: recipient_id.to_string(),
            text: text.to_string(),
        });
    }

    /// Ensures a conversation with `peer_id` exists in the index.
    pub fn open_chat(&self, peer_id: &str) {
        self.command(Command::OpenChat(peer_id.to_string()));
    }

    /// Replaces the token used for future reconnects and snapshot fetches.
    pub fn update_token(&self, token: &str) {
        self.command(Command::UpdateToken(token.to_string()));
    }

    /// Stops the session. Cancels any pending reconnect and closes the
    /// socket; no further reconnect is attempted.
    pub fn disconnect(&self) {
        self.stop.send_replace(true);
    }

    /// Waits for the driver task to finish after [`disconnect`](Self::disconnect).
    pub async fn join(self) {
        let Self { task, .. } = self;
        if let Err(e) = task.await {
            tracing::warn!(err = %e, "session driver task failed");
        }
    }

    /// Receiver for the conversation index.
    #[must_use]
    pub fn conversations(&self) -> watch::Receiver<ConversationIndex> {
        self.conversations.clone()
    }

    /// Receiver for the online-user list, in display order.
    #[must_use]
    pub fn presence(&self) -> watch::Receiver<Vec<PresenceUser>> {
        self.presence.clone()
    }

    /// Receiver for the connection state.
    #[must_use]
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    fn command(&self, command: Command) {
        match self.commands.try_send(command) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(cmd)) => {
                tracing::warn!(?cmd, "session command channel full, dropping command");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("session already stopped");
            }
        }
    }
}

/// Owner of one session's state and I/O tasks.
struct Driver<S> {
    session: Session,
    socket_url: String,
    source: Arc<S>,
    events: mpsc::UnboundedSender<DriverEvent>,
    writer: Option<(u64, SocketWriter)>,
    socket_task: Option<JoinHandle<()>>,
    reconnect_timer: Option<JoinHandle<()>>,
    conversations_tx: watch::Sender<ConversationIndex>,
    presence_tx: watch::Sender<Vec<PresenceUser>>,
    state_tx: watch::Sender<ConnectionState>,
}

impl<S: SnapshotSource + 'static> Driver<S> {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut stop: watch::Receiver<bool>,
        mut events: mpsc::UnboundedReceiver<DriverEvent>,
    ) {
        let actions = self.session.start();
        self.execute(actions);
        self.publish();

        loop {
            let actions = tokio::select! {
                // Either a disconnect request or the handle was dropped.
                _ = stop.changed() => break,
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = events.recv() => self.handle_event(event),
            };
            self.execute(actions);
            self.publish();
        }

        let actions = self.session.disconnect();
        self.execute(actions);
        self.publish();

        if let Some(mut task) = self.socket_task.take()
            && tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err()
        {
            task.abort();
        }
        tracing::info!("session driver exiting");
    }

    fn handle_command(&mut self, command: Command) -> Vec<Action> {
        match command {
            Command::Send { recipient_id, text } => self.session.send(&recipient_id, &text),
            Command::OpenChat(peer_id) => {
                self.session.open_chat(&peer_id);
                Vec::new()
            }
            Command::UpdateToken(token) => {
                self.session.update_token(token);
                Vec::new()
            }
        }
    }

    fn handle_event(&mut self, event: DriverEvent) -> Vec<Action> {
        match event {
            DriverEvent::Opened { generation, writer } => {
                let actions = self.session.on_opened(generation);
                if self.session.generation() == generation
                    && self.session.state() == ConnectionState::Open
                {
                    self.writer = Some((generation, writer));
                }
                actions
            }
            DriverEvent::Frame { generation, text } => self.session.on_frame(generation, &text),
            DriverEvent::Closed { generation } => {
                if self.writer.as_ref().is_some_and(|(g, _)| *g == generation) {
                    self.writer = None;
                }
                self.session.on_closed(generation)
            }
            DriverEvent::ReconnectDue => {
                self.reconnect_timer = None;
                self.session.on_reconnect_due()
            }
            DriverEvent::Presence { generation, result } => {
                self.session.on_presence_snapshot(generation, result);
                Vec::new()
            }
            DriverEvent::History { generation, result } => {
                self.session.on_history_snapshot(generation, result);
                Vec::new()
            }
        }
    }

    fn execute(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Connect { generation, token } => {
                    if let Some(task) = self.socket_task.take() {
                        task.abort();
                    }
                    self.writer = None;
                    self.socket_task = Some(tokio::spawn(socket::run_socket(
                        generation,
                        self.socket_url.clone(),
                        token,
                        self.events.clone(),
                    )));
                }
                Action::SendFrame { generation, frame } => match &self.writer {
                    Some((open, writer)) if *open == generation => {
                        if writer.send(Outgoing::Frame(frame)).is_err() {
                            tracing::warn!(generation, "socket writer gone, frame dropped");
                        }
                    }
                    _ => tracing::debug!(generation, "no open socket, frame dropped"),
                },
                Action::ScheduleReconnect { delay } => {
                    if let Some(timer) = self.reconnect_timer.take() {
                        timer.abort();
                    }
                    let events = self.events.clone();
                    self.reconnect_timer = Some(tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = events.send(DriverEvent::ReconnectDue);
                    }));
                }
                Action::CancelReconnect => {
                    if let Some(timer) = self.reconnect_timer.take() {
                        timer.abort();
                    }
                }
                Action::FetchSnapshots { generation, token } => self.fetch_snapshots(generation, token),
                Action::CloseSocket { generation } => match self.writer.take() {
                    Some((open, writer)) if open == generation => {
                        let _ = writer.send(Outgoing::Close);
                    }
                    _ => {
                        if let Some(task) = self.socket_task.take() {
                            task.abort();
                        }
                    }
                },
            }
        }
    }

    fn fetch_snapshots(&self, generation: u64, token: String) {
        let source = Arc::clone(&self.source);
        let events = self.events.clone();
        let presence_token = token.clone();
        tokio::spawn(async move {
            let result = source.fetch_presence(&presence_token).await;
            let _ = events.send(DriverEvent::Presence { generation, result });
        });

        let source = Arc::clone(&self.source);
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = source.fetch_history(&token).await;
            let _ = events.send(DriverEvent::History { generation, result });
        });
    }

    fn publish(&mut self) {
        let changes = self.session.take_changes();
        if changes.conversations {
            self.conversations_tx.send_replace(self.session.store().snapshot());
        }
        if changes.presence {
            self.presence_tx
                .send_replace(self.session.roster().users().to_vec());
        }
        if changes.state {
            self.state_tx.send_replace(self.session.state());
        }
    }
}
