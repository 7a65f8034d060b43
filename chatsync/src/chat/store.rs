//! Per-peer conversation store.
//!
//! [`ConversationStore`] keeps one ordered message list per peer. Lists are
//! sorted by sender timestamp (ties keep arrival order), hold at most one
//! message per id, and are capped to the newest
//! [`StoreLimits::max_messages_per_peer`] entries.

use std::collections::{BTreeMap, HashMap};

use chatsync_proto::message::{MessageId, Timestamp};

use super::{ChatMessage, ConversationIndex};

/// Default number of messages retained per peer.
pub const DEFAULT_MAX_MESSAGES_PER_PEER: usize = 50;

/// Retention limits for the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreLimits {
    /// Messages kept per peer; older ones are dropped first.
    pub max_messages_per_peer: usize,
    /// Maximum number of peers tracked. `None` means unbounded. When the
    /// limit is exceeded the peer with the oldest latest message is evicted.
    pub max_peers: Option<usize>,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            max_messages_per_peer: DEFAULT_MAX_MESSAGES_PER_PEER,
            max_peers: None,
        }
    }
}

/// In-memory mapping from peer id to that peer's conversation.
#[derive(Debug, Clone, Default)]
pub struct ConversationStore {
    conversations: ConversationIndex,
    limits: StoreLimits,
}

impl ConversationStore {
    /// Creates an empty store with the given limits.
    #[must_use]
    pub fn new(limits: StoreLimits) -> Self {
        Self {
            conversations: BTreeMap::new(),
            limits,
        }
    }

    /// Inserts or replaces `message` in the conversation with `peer_id`.
    ///
    /// A message whose id is already present replaces the existing entry in
    /// place, so repeating an upsert leaves the list unchanged.
    pub fn upsert(&mut self, peer_id: &str, message: ChatMessage) {
        let cap = self.limits.max_messages_per_peer;
        let list = self.conversations.entry(peer_id.to_string()).or_default();
        merge_message(list, message, cap);
        self.evict_idle_peers(peer_id);
    }

    /// Ensures a (possibly empty) conversation exists for `peer_id`.
    pub fn open_chat(&mut self, peer_id: &str) {
        if self.conversations.contains_key(peer_id) {
            return;
        }
        self.conversations.insert(peer_id.to_string(), Vec::new());
        self.evict_idle_peers(peer_id);
    }

    /// Marks the outbound message with `id` as delivered.
    ///
    /// Returns `true` if a pending message was flipped. Unknown ids, inbound
    /// messages and already acknowledged messages are left alone.
    pub fn apply_ack(&mut self, id: &MessageId) -> bool {
        for list in self.conversations.values_mut() {
            if let Some(message) = list.iter_mut().find(|m| &m.id == id) {
                if message.is_pending() {
                    message.acknowledged = Some(true);
                    return true;
                }
                return false;
            }
        }
        false
    }

    /// Replaces the whole store with `index`, as produced from a history
    /// snapshot. Lists are re-capped to the store's limit.
    pub fn replace_all(&mut self, index: ConversationIndex) {
        let cap = self.limits.max_messages_per_peer;
        self.conversations = index;
        for list in self.conversations.values_mut() {
            truncate_oldest(list, cap);
        }
        if let Some(max) = self.limits.max_peers {
            while self.conversations.len() > max {
                let Some(peer) = self.least_recent_peer(None) else {
                    break;
                };
                self.conversations.remove(&peer);
            }
        }
    }

    /// Messages exchanged with `peer_id`, oldest first.
    #[must_use]
    pub fn get(&self, peer_id: &str) -> Option<&[ChatMessage]> {
        self.conversations.get(peer_id).map(Vec::as_slice)
    }

    /// Whether any conversation holds a message with `id`.
    #[must_use]
    pub fn contains(&self, id: &MessageId) -> bool {
        self.find(id).is_some()
    }

    /// The message with `id`, wherever it is filed.
    #[must_use]
    pub fn find(&self, id: &MessageId) -> Option<&ChatMessage> {
        self.conversations
            .values()
            .find_map(|list| list.iter().find(|m| &m.id == id))
    }

    /// Locally sent messages that have not been acknowledged yet.
    #[must_use]
    pub fn pending_outbound(&self) -> Vec<ChatMessage> {
        self.conversations
            .values()
            .flat_map(|list| list.iter().filter(|m| m.is_pending()).cloned())
            .collect()
    }

    /// Number of tracked peers.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.conversations.len()
    }

    /// Whether no conversation is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    /// A copy of the full index for publication to observers.
    #[must_use]
    pub fn snapshot(&self) -> ConversationIndex {
        self.conversations.clone()
    }

    fn evict_idle_peers(&mut self, keep: &str) {
        let Some(max) = self.limits.max_peers else {
            return;
        };
        while self.conversations.len() > max {
            let Some(peer) = self.least_recent_peer(Some(keep)) else {
                break;
            };
            tracing::debug!(peer = %peer, "evicting idle conversation");
            self.conversations.remove(&peer);
        }
    }

    /// Peer whose newest message is the oldest; empty conversations count as
    /// oldest. Ties go to the lowest peer id.
    fn least_recent_peer(&self, keep: Option<&str>) -> Option<String> {
        self.conversations
            .iter()
            .filter(|(peer, _)| Some(peer.as_str()) != keep)
            .min_by_key(|(_, list)| latest_activity(list))
            .map(|(peer, _)| peer.clone())
    }
}

/// Merges `message` into `list` by id, re-sorts stably, and caps the length.
pub fn merge_message(list: &mut Vec<ChatMessage>, message: ChatMessage, cap: usize) {
    if let Some(existing) = list.iter_mut().find(|m| m.id == message.id) {
        *existing = message;
    } else {
        list.push(message);
    }
    list.sort_by_key(|m| m.sender_timestamp);
    truncate_oldest(list, cap);
}

/// Groups `messages` by peer into a fresh index.
///
/// Duplicate ids keep the position of their first occurrence and the content
/// of their last. Each list is sorted and capped to `cap`.
#[must_use]
pub fn build_index(messages: impl IntoIterator<Item = ChatMessage>, cap: usize) -> ConversationIndex {
    let mut index = ConversationIndex::new();
    let mut positions: HashMap<(String, MessageId), usize> = HashMap::new();

    for message in messages {
        let list = index.entry(message.peer_id.clone()).or_default();
        let key = (message.peer_id.clone(), message.id.clone());
        if let Some(&pos) = positions.get(&key) {
            list[pos] = message;
        } else {
            positions.insert(key, list.len());
            list.push(message);
        }
    }

    for list in index.values_mut() {
        list.sort_by_key(|m| m.sender_timestamp);
        truncate_oldest(list, cap);
    }
    index
}

fn truncate_oldest(list: &mut Vec<ChatMessage>, cap: usize) {
    if list.len() > cap {
        let excess = list.len() - cap;
        list.drain(..excess);
    }
}

/// Newest sender timestamp in `list`, if any.
#[must_use]
pub fn latest_activity(list: &[ChatMessage]) -> Option<Timestamp> {
    list.last().map(|m| m.sender_timestamp)
}
