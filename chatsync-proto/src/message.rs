//! Wire format envelope types for the `ChatSync` protocol.
//!
//! Every frame exchanged over the duplex channel, and every entry of the
//! history snapshot, is one JSON-encoded [`Envelope`]. Field names follow the
//! messenger server's camelCase convention.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::presence::PresenceUser;

/// Payload kind used for plain-text chat bodies.
pub const CONTENT_KIND_TEXT: &str = "text";

/// Alternate payload kind some server builds emit for chat bodies.
pub const CONTENT_KIND_CHAT: &str = "chat";

/// Identifier of a single logical message.
///
/// Locally generated ids are UUID v7 strings; ids received from the server
/// are treated as opaque.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Creates a new time-ordered message identifier (UUID v7).
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Wraps an existing identifier string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the identifier is empty (server presence events carry none).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Millisecond-precision UTC timestamp.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp for the current instant.
    #[must_use]
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Creates a timestamp from milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Message-kind taxonomy carried in the envelope's `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// A chat message. The server distinguishes inbound/outbound legs; the
    /// client treats both the same.
    #[serde(rename = "CHAT_IN", alias = "CHAT_OUT")]
    Chat,
    /// Delivery acknowledgement of a chat envelope.
    #[serde(rename = "CHAT_ACK")]
    Ack,
    /// Full roster of online users, sent once after the handshake.
    #[serde(rename = "PRESENT_INIT")]
    PresenceInit,
    /// A single user came online.
    #[serde(rename = "PRESENT_JOIN")]
    PresenceJoin,
    /// A single user went offline.
    #[serde(rename = "PRESENT_LEAVE")]
    PresenceLeave,
    /// Any server type this client does not handle (signalling, watermarks).
    #[serde(rename = "UNSUPPORTED", other)]
    Unsupported,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Chat => write!(f, "chat"),
            Self::Ack => write!(f, "ack"),
            Self::PresenceInit => write!(f, "presence-init"),
            Self::PresenceJoin => write!(f, "presence-join"),
            Self::PresenceLeave => write!(f, "presence-leave"),
            Self::Unsupported => write!(f, "unsupported"),
        }
    }
}

/// Raw envelope payload as it appears on the wire.
///
/// `body` is text for chat envelopes and a JSON document for presence
/// envelopes; [`crate::codec::decode_content`] turns it into [`Content`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    /// Content kind (`text`, `presence`, ...).
    #[serde(default)]
    pub kind: String,
    /// Body string.
    #[serde(default)]
    pub body: String,
}

impl Payload {
    /// Creates a plain-text payload.
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            kind: CONTENT_KIND_TEXT.to_string(),
            body: body.into(),
        }
    }
}

/// One wire-level message unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Unique id of this envelope. Empty for server presence events.
    #[serde(default)]
    pub message_id: MessageId,
    /// For acks: the `message_id` of the acknowledged chat envelope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<MessageId>,
    /// Originating user id.
    #[serde(default)]
    pub sender_id: String,
    /// Addressed user id.
    #[serde(default)]
    pub recipient_id: String,
    /// Message kind.
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Raw payload.
    #[serde(default)]
    pub payload: Payload,
    /// Sender clock at creation time.
    #[serde(default)]
    pub sender_timestamp: Timestamp,
    /// Sender's IANA timezone name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_timezone: Option<String>,
    /// Server-side conversation id, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

impl Envelope {
    /// Builds an outbound chat envelope with a fresh id and the current time.
    pub fn chat(
        sender_id: impl Into<String>,
        recipient_id: impl Into<String>,
        text: impl Into<String>,
        sender_timezone: Option<String>,
    ) -> Self {
        Self {
            message_id: MessageId::generate(),
            correlation_id: None,
            sender_id: sender_id.into(),
            recipient_id: recipient_id.into(),
            kind: MessageKind::Chat,
            payload: Payload::text(text),
            sender_timestamp: Timestamp::now(),
            sender_timezone,
            conversation_id: None,
        }
    }

    /// Returns the id of the other party from the point of view of `local_user`.
    ///
    /// This is the sender when the local user is not the sender, and the
    /// recipient otherwise.
    #[must_use]
    pub fn peer_of(&self, local_user: &str) -> &str {
        if self.sender_id == local_user {
            &self.recipient_id
        } else {
            &self.sender_id
        }
    }
}

/// Payload decoded according to the envelope kind and content kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    /// Chat text.
    Text(String),
    /// Chat envelope with a content kind other than text.
    Other {
        /// The unrecognised content kind.
        kind: String,
    },
    /// Acknowledgement; the body is informational only.
    Ack,
    /// Full presence roster.
    PresenceBatch(Vec<PresenceUser>),
    /// A single presence record (join or leave).
    Presence(PresenceUser),
    /// Envelope of an unsupported kind.
    Ignored,
}

/// A decoded inbound frame: the envelope header plus its validated content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    /// The envelope as received.
    pub envelope: Envelope,
    /// Payload decoded once at receive time.
    pub content: Content,
}
