//! Chat state for `ChatSync`.
//!
//! Contains the local [`ChatMessage`] model, the per-peer
//! [`store::ConversationStore`], and the [`ack::AckTracker`] that emits and
//! applies delivery acknowledgements.

pub mod ack;
pub mod store;

use std::collections::BTreeMap;

use chatsync_proto::message::{Envelope, MessageId, Timestamp};

/// Mapping from peer id to that peer's ordered message list.
pub type ConversationIndex = BTreeMap<String, Vec<ChatMessage>>;

/// Which side of the conversation produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Received from the peer.
    Inbound,
    /// Sent by the local user.
    Outbound,
    /// Generated locally for display (never sent or acknowledged).
    System,
}

/// A message as held in the conversation store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    /// Envelope `messageId`.
    pub id: MessageId,
    /// Message text.
    pub text: String,
    /// Who produced the message.
    pub direction: Direction,
    /// Delivery flag. `None` for inbound and system messages, since
    /// acknowledgement only applies to messages this client sent.
    pub acknowledged: Option<bool>,
    /// The other party of the conversation.
    pub peer_id: String,
    /// Sender clock at creation time; the list ordering key.
    pub sender_timestamp: Timestamp,
}

impl ChatMessage {
    /// Converts a chat envelope observed from the server (live or history).
    ///
    /// Envelopes sent by `local_user` become outbound messages that are
    /// already acknowledged, since the server holds them; everything else is
    /// inbound.
    #[must_use]
    pub fn from_envelope(envelope: &Envelope, text: String, local_user: &str) -> Self {
        let outbound = envelope.sender_id == local_user;
        Self {
            id: envelope.message_id.clone(),
            text,
            direction: if outbound {
                Direction::Outbound
            } else {
                Direction::Inbound
            },
            acknowledged: outbound.then_some(true),
            peer_id: envelope.peer_of(local_user).to_string(),
            sender_timestamp: envelope.sender_timestamp,
        }
    }

    /// Builds the optimistic local copy of an envelope this client just sent.
    #[must_use]
    pub fn pending(envelope: &Envelope) -> Self {
        Self {
            id: envelope.message_id.clone(),
            text: envelope.payload.body.clone(),
            direction: Direction::Outbound,
            acknowledged: Some(false),
            peer_id: envelope.recipient_id.clone(),
            sender_timestamp: envelope.sender_timestamp,
        }
    }

    /// Whether this is a locally sent message still waiting for its ack.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.direction == Direction::Outbound && self.acknowledged == Some(false)
    }
}
