//! Snapshot fetching and reconciliation after a connection opens.
//!
//! Each time the socket opens, the current presence roster and the recent
//! chat history are fetched over HTTP through a [`SnapshotSource`]. Live
//! frames keep flowing while the history request is in flight, so every live
//! store mutation made during that window is recorded in a
//! [`BootstrapWindow`] and re-applied on top of the snapshot by
//! [`reconcile`]. Pending local sends the snapshot does not know about are
//! re-applied too. Roster changes pushed while the presence request is in
//! flight are replayed over the presence snapshot by [`reconcile_presence`].

use std::future::Future;

use chatsync_proto::codec;
use chatsync_proto::message::{Content, Envelope, MessageId, MessageKind};
use chatsync_proto::presence::PresenceUser;
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, StatusCode};
use url::Url;

use crate::chat::store::{ConversationStore, build_index};
use crate::chat::{ChatMessage, ConversationIndex, Direction};
use crate::roster::PresenceRoster;

/// Path of the presence snapshot endpoint, relative to the API origin.
pub const PRESENCE_PATH: &str = "/chat/api/presence";

/// Path of the history snapshot endpoint, relative to the API origin.
pub const HISTORY_PATH: &str = "/chat/api/history";

/// Errors from a snapshot request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// The server answered with a status other than 200.
    #[error("unexpected status {0}")]
    Status(u16),
    /// The request could not be sent or the response not read.
    #[error("network error: {0}")]
    Network(String),
    /// The response body is not the expected JSON document.
    #[error("decode error: {0}")]
    Decode(String),
    /// The API origin cannot be combined with an endpoint path.
    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

/// Provider of the presence and history snapshots.
///
/// Implementations include:
/// - [`HttpSnapshotSource`]: the REST endpoints of the messenger server
/// - test doubles returning canned snapshots
pub trait SnapshotSource: Send + Sync {
    /// Fetches the users currently online.
    fn fetch_presence(
        &self,
        token: &str,
    ) -> impl Future<Output = Result<Vec<PresenceUser>, FetchError>> + Send;

    /// Fetches recent envelopes involving the authenticated user.
    fn fetch_history(
        &self,
        token: &str,
    ) -> impl Future<Output = Result<Vec<Envelope>, FetchError>> + Send;
}

/// [`SnapshotSource`] backed by the server's REST API.
#[derive(Debug, Clone)]
pub struct HttpSnapshotSource {
    client: Client,
    presence_url: Url,
    history_url: Url,
}

impl HttpSnapshotSource {
    /// Creates a source for the API served at `api_origin`.
    ///
    /// # Errors
    ///
    /// Returns `FetchError::InvalidUrl` if `api_origin` is not an absolute
    /// URL.
    pub fn new(api_origin: &str) -> Result<Self, FetchError> {
        let origin = Url::parse(api_origin).map_err(|e| FetchError::InvalidUrl(e.to_string()))?;
        let join = |path: &str| {
            origin
                .join(path)
                .map_err(|e| FetchError::InvalidUrl(e.to_string()))
        };
        Ok(Self {
            client: Client::new(),
            presence_url: join(PRESENCE_PATH)?,
            history_url: join(HISTORY_PATH)?,
        })
    }

    async fn get_body(&self, url: &Url, token: &str) -> Result<String, FetchError> {
        let response = self
            .client
            .get(url.clone())
            .header(AUTHORIZATION, format!("Bearer {}", token.trim()))
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(FetchError::Status(status.as_u16()));
        }

        response
            .text()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))
    }
}

impl SnapshotSource for HttpSnapshotSource {
    async fn fetch_presence(&self, token: &str) -> Result<Vec<PresenceUser>, FetchError> {
        let body = self.get_body(&self.presence_url, token).await?;
        serde_json::from_str(&body).map_err(|e| FetchError::Decode(e.to_string()))
    }

    async fn fetch_history(&self, token: &str) -> Result<Vec<Envelope>, FetchError> {
        let body = self.get_body(&self.history_url, token).await?;
        codec::decode_batch(&body).map_err(|e| FetchError::Decode(e.to_string()))
    }
}

/// Builds a conversation index from a history snapshot.
///
/// Only text chat envelopes are kept. Each one is filed under the peer it
/// involves from `local_user`'s point of view; envelopes with no peer are
/// skipped. Duplicate ids keep their last occurrence.
#[must_use]
pub fn build_history_index(envelopes: Vec<Envelope>, local_user: &str, cap: usize) -> ConversationIndex {
    let messages = envelopes.into_iter().filter_map(|envelope| {
        if envelope.kind != MessageKind::Chat || envelope.peer_of(local_user).is_empty() {
            return None;
        }
        match codec::decode_content(&envelope) {
            Ok(Content::Text(text)) => Some(ChatMessage::from_envelope(&envelope, text, local_user)),
            _ => None,
        }
    });
    build_index(messages, cap)
}

/// A live store mutation recorded while a history snapshot is in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveMutation {
    /// A chat message was inserted or replaced.
    Upsert(ChatMessage),
    /// A pending message was acknowledged.
    Ack(MessageId),
    /// An empty conversation was opened.
    OpenChat(String),
}

/// A live roster change recorded while a presence snapshot is in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceChange {
    /// The server pushed a full roster.
    Replace(Vec<PresenceUser>),
    /// A user came online.
    Join(PresenceUser),
    /// The user with this id went offline.
    Leave(String),
}

/// Bookkeeping for one connection's bootstrap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapWindow {
    generation: u64,
    history_pending: bool,
    presence_pending: bool,
    buffered: Vec<LiveMutation>,
    presence_buffered: Vec<PresenceChange>,
}

impl BootstrapWindow {
    /// Opens a window for the connection with `generation`.
    #[must_use]
    pub const fn new(generation: u64) -> Self {
        Self {
            generation,
            history_pending: true,
            presence_pending: true,
            buffered: Vec::new(),
            presence_buffered: Vec::new(),
        }
    }

    /// Connection generation this window belongs to.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether both snapshots have been settled.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        !self.history_pending && !self.presence_pending
    }

    /// Records `mutation` if the history snapshot has not landed yet.
    pub fn record(&mut self, mutation: LiveMutation) {
        if self.history_pending {
            self.buffered.push(mutation);
        }
    }

    /// Records `change` if the presence snapshot has not landed yet.
    pub fn record_presence(&mut self, change: PresenceChange) {
        if self.presence_pending {
            self.presence_buffered.push(change);
        }
    }

    /// Marks the presence snapshot as settled and hands back the recorded
    /// roster changes.
    pub fn finish_presence(&mut self) -> Vec<PresenceChange> {
        self.presence_pending = false;
        std::mem::take(&mut self.presence_buffered)
    }

    /// Marks the history snapshot as settled and hands back the recorded
    /// mutations.
    pub fn finish_history(&mut self) -> Vec<LiveMutation> {
        self.history_pending = false;
        std::mem::take(&mut self.buffered)
    }
}

/// Replaces the store with a history snapshot and re-applies local state.
///
/// Local sends missing from `index` are kept (still pending ones, and those
/// acknowledged during the window), then `buffered` live mutations are
/// applied in their original order.
pub fn reconcile(store: &mut ConversationStore, index: ConversationIndex, buffered: Vec<LiveMutation>) {
    let mut carried = store.pending_outbound();
    for mutation in &buffered {
        if let LiveMutation::Ack(id) = mutation
            && let Some(message) = store.find(id)
            && message.direction == Direction::Outbound
        {
            carried.push(message.clone());
        }
    }
    store.replace_all(index);

    for message in carried {
        if !store.contains(&message.id) {
            let peer = message.peer_id.clone();
            store.upsert(&peer, message);
        }
    }

    for mutation in buffered {
        match mutation {
            // The snapshot already confirmed this send.
            LiveMutation::Upsert(message)
                if message.is_pending()
                    && store
                        .find(&message.id)
                        .is_some_and(|m| m.acknowledged == Some(true)) => {}
            LiveMutation::Upsert(message) => {
                let peer = message.peer_id.clone();
                store.upsert(&peer, message);
            }
            LiveMutation::Ack(id) => {
                store.apply_ack(&id);
            }
            LiveMutation::OpenChat(peer) => store.open_chat(&peer),
        }
    }
}

/// Replaces the roster with a presence snapshot, then re-applies the roster
/// changes observed live while the snapshot was in flight, in order.
pub fn reconcile_presence(
    roster: &mut PresenceRoster,
    snapshot: Vec<PresenceUser>,
    buffered: Vec<PresenceChange>,
) {
    roster.replace_all(snapshot);
    for change in buffered {
        match change {
            PresenceChange::Replace(users) => roster.replace_all(users),
            PresenceChange::Join(user) => {
                roster.add_one(user);
            }
            PresenceChange::Leave(id) => {
                roster.remove_one(&id);
            }
        }
    }
}
