//! Delivery acknowledgements.
//!
//! [`AckTracker`] answers every chat envelope addressed to the local user
//! with a `CHAT_ACK` whose correlation id is the original message id, and
//! applies incoming acks to the matching pending outbound message.

use chatsync_proto::message::{Envelope, MessageId, MessageKind, Payload, Timestamp};

use super::store::ConversationStore;

/// Prefix of the informational ack body; the message id follows.
pub const ACK_BODY_PREFIX: &str = "Ack for message";

/// Emits and applies delivery acks on behalf of one local user.
#[derive(Debug, Clone)]
pub struct AckTracker {
    local_user: String,
    sender_timezone: Option<String>,
}

impl AckTracker {
    /// Creates a tracker for `local_user`.
    pub fn new(local_user: impl Into<String>, sender_timezone: Option<String>) -> Self {
        Self {
            local_user: local_user.into(),
            sender_timezone,
        }
    }

    /// Builds the ack for `original`, or `None` if no ack is owed.
    ///
    /// Only chat envelopes addressed to the local user are acknowledged. The
    /// ack goes back to the original sender.
    #[must_use]
    pub fn ack_for(&self, original: &Envelope) -> Option<Envelope> {
        if original.kind != MessageKind::Chat || original.recipient_id != self.local_user {
            return None;
        }
        Some(Envelope {
            message_id: MessageId::generate(),
            correlation_id: Some(original.message_id.clone()),
            sender_id: self.local_user.clone(),
            recipient_id: original.sender_id.clone(),
            kind: MessageKind::Ack,
            payload: Payload::text(format!("{ACK_BODY_PREFIX} {}", original.message_id)),
            sender_timestamp: Timestamp::now(),
            sender_timezone: self.sender_timezone.clone(),
            conversation_id: original.conversation_id.clone(),
        })
    }

    /// Applies an incoming ack envelope to `store`.
    ///
    /// Returns `true` if a pending outbound message became acknowledged. Acks
    /// without a correlation id, or for unknown ids, change nothing.
    pub fn apply(&self, store: &mut ConversationStore, ack: &Envelope) -> bool {
        let Some(correlation_id) = &ack.correlation_id else {
            tracing::warn!(sender = %ack.sender_id, "ack without correlation id, dropping");
            return false;
        };
        let applied = store.apply_ack(correlation_id);
        if !applied {
            tracing::debug!(message_id = %correlation_id, "ack for unknown or settled message");
        }
        applied
    }
}
