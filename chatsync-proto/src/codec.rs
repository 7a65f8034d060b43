//! Serialization and deserialization for the `ChatSync` wire protocol.
//!
//! Frames are JSON text, one [`Envelope`] per frame. Decoding validates the
//! payload once, producing an [`Inbound`] whose [`Content`] consumers can
//! match on without re-parsing the body.

use crate::message::{
    CONTENT_KIND_CHAT, CONTENT_KIND_TEXT, Content, Envelope, Inbound, MessageKind,
};
use crate::presence::PresenceUser;

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The frame is not a valid JSON envelope.
    #[error("serialization error: {0}")]
    Json(String),
    /// The envelope parsed but its payload body does not match its kind.
    #[error("malformed {kind} payload: {reason}")]
    MalformedPayload {
        /// Envelope kind whose body failed to parse.
        kind: MessageKind,
        /// Parser error description.
        reason: String,
    },
}

/// Encodes an [`Envelope`] as a JSON text frame.
///
/// # Errors
///
/// Returns `CodecError::Json` if the envelope cannot be serialized.
pub fn encode(envelope: &Envelope) -> Result<String, CodecError> {
    serde_json::to_string(envelope).map_err(|e| CodecError::Json(e.to_string()))
}

/// Decodes an [`Envelope`] from a JSON text frame without inspecting its body.
///
/// # Errors
///
/// Returns `CodecError::Json` if the text is not a valid envelope.
pub fn decode(text: &str) -> Result<Envelope, CodecError> {
    serde_json::from_str(text).map_err(|e| CodecError::Json(e.to_string()))
}

/// Decodes a JSON array of envelopes, as returned by the history endpoint.
///
/// # Errors
///
/// Returns `CodecError::Json` if the text is not an array of envelopes.
pub fn decode_batch(text: &str) -> Result<Vec<Envelope>, CodecError> {
    serde_json::from_str(text).map_err(|e| CodecError::Json(e.to_string()))
}

/// Interprets the payload of `envelope` according to its kind.
///
/// Presence bodies are JSON documents embedded in the body string: an array
/// of users for `PresenceInit`, a single user for join and leave.
///
/// # Errors
///
/// Returns `CodecError::MalformedPayload` if a presence body does not parse.
pub fn decode_content(envelope: &Envelope) -> Result<Content, CodecError> {
    let body = envelope.payload.body.as_str();
    let malformed = |e: serde_json::Error| CodecError::MalformedPayload {
        kind: envelope.kind,
        reason: e.to_string(),
    };

    let content = match envelope.kind {
        MessageKind::Chat => match envelope.payload.kind.as_str() {
            CONTENT_KIND_TEXT | CONTENT_KIND_CHAT => Content::Text(body.to_string()),
            other => Content::Other {
                kind: other.to_string(),
            },
        },
        MessageKind::Ack => Content::Ack,
        MessageKind::PresenceInit => {
            Content::PresenceBatch(serde_json::from_str::<Vec<PresenceUser>>(body).map_err(malformed)?)
        }
        MessageKind::PresenceJoin | MessageKind::PresenceLeave => {
            Content::Presence(serde_json::from_str::<PresenceUser>(body).map_err(malformed)?)
        }
        MessageKind::Unsupported => Content::Ignored,
    };
    Ok(content)
}

/// Decodes a text frame into an envelope and its validated content.
///
/// # Errors
///
/// Returns `CodecError::Json` for invalid frames and
/// `CodecError::MalformedPayload` for bodies that do not match their kind.
pub fn decode_inbound(text: &str) -> Result<Inbound, CodecError> {
    let envelope = decode(text)?;
    let content = decode_content(&envelope)?;
    Ok(Inbound { envelope, content })
}
