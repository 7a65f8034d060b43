//! WebSocket task for one connection generation.
//!
//! The messenger server authenticates the upgrade through the
//! `Sec-WebSocket-Protocol` header: the client offers the
//! `bearer-token-carrier` protocol together with a second, percent-encoded
//! entry carrying `quarkus-http-upgrade#Authorization#Bearer <token>`, which
//! the server turns back into an `Authorization` header.
//!
//! [`run_socket`] owns the socket for its whole life. It reports
//! [`DriverEvent::Opened`] with a writer handle once the handshake succeeds,
//! one [`DriverEvent::Frame`] per text frame, and exactly one
//! [`DriverEvent::Closed`] when the socket ends or the handshake fails.

use futures_util::{SinkExt, StreamExt};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;

use super::DriverEvent;

/// Sub-protocol the server selects for authenticated upgrades.
pub const TOKEN_CARRIER_PROTOCOL: &str = "bearer-token-carrier";

/// Prefix of the sub-protocol entry that carries the bearer token.
pub const AUTH_PROTOCOL_PREFIX: &str = "quarkus-http-upgrade#Authorization#Bearer ";

/// Characters left unescaped by JavaScript's `encodeURIComponent`.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Errors from connecting to or talking over the socket.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The upgrade was rejected or the handshake could not be built.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The socket URL is not a valid WebSocket URL.
    #[error("invalid socket url: {0}")]
    InvalidUrl(String),

    /// The connection was closed while writing.
    #[error("connection closed")]
    ConnectionClosed,

    /// An underlying I/O error occurred.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Message from the driver to the socket task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    /// Write a text frame.
    Frame(String),
    /// Send a close frame and end the task.
    Close,
}

/// Handle for writing to an open socket.
pub type SocketWriter = mpsc::UnboundedSender<Outgoing>;

/// Builds the upgrade request for `url`, carrying `token` in the
/// sub-protocol header.
///
/// # Errors
///
/// Returns `TransportError::InvalidUrl` if `url` is not a WebSocket URL and
/// `TransportError::Handshake` if the header value cannot be built.
pub fn handshake_request(url: &str, token: &str) -> Result<Request, TransportError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
    let credential = format!("{AUTH_PROTOCOL_PREFIX}{}", token.trim());
    let carrier = utf8_percent_encode(&credential, URI_COMPONENT);
    let value = HeaderValue::from_str(&format!("{TOKEN_CARRIER_PROTOCOL}, {carrier}"))
        .map_err(|e| TransportError::Handshake(e.to_string()))?;
    request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
    Ok(request)
}

/// Runs the socket of `generation` until it closes.
///
/// Always finishes by reporting [`DriverEvent::Closed`], whether the
/// handshake failed or an open socket ended.
pub async fn run_socket(
    generation: u64,
    url: String,
    token: String,
    events: mpsc::UnboundedSender<DriverEvent>,
) {
    match drive_socket(generation, &url, &token, &events).await {
        Ok(()) => tracing::info!(generation, "socket closed"),
        Err(e) => tracing::warn!(generation, url = %url, err = %e, "socket failed"),
    }
    let _ = events.send(DriverEvent::Closed { generation });
}

async fn drive_socket(
    generation: u64,
    url: &str,
    token: &str,
    events: &mpsc::UnboundedSender<DriverEvent>,
) -> Result<(), TransportError> {
    let request = handshake_request(url, token)?;
    let (ws_stream, _response) = connect_async(request).await.map_err(map_ws_connect_error)?;
    tracing::debug!(generation, url, "socket handshake complete");

    let (mut ws_sender, mut ws_reader) = ws_stream.split();
    let (writer, mut outgoing) = mpsc::unbounded_channel();
    if events
        .send(DriverEvent::Opened {
            generation,
            writer,
        })
        .is_err()
    {
        return Ok(());
    }

    loop {
        tokio::select! {
            next = outgoing.recv() => match next {
                Some(Outgoing::Frame(text)) => {
                    ws_sender.send(Message::text(text)).await.map_err(|e| {
                        tracing::warn!(generation, err = %e, "socket send failed");
                        TransportError::ConnectionClosed
                    })?;
                }
                // A dropped writer means the driver moved on from this socket.
                Some(Outgoing::Close) | None => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    return Ok(());
                }
            },
            incoming = ws_reader.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let frame = DriverEvent::Frame {
                        generation,
                        text: text.as_str().to_owned(),
                    };
                    if events.send(frame).is_err() {
                        return Ok(());
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    tracing::info!(generation, "socket closed by server");
                    return Ok(());
                }
                Some(Ok(Message::Binary(data))) => {
                    tracing::debug!(generation, len = data.len(), "ignoring binary frame");
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(TransportError::Io(std::io::Error::other(e))),
            },
        }
    }
}

/// Map a `tokio_tungstenite` connection error to a [`TransportError`].
fn map_ws_connect_error(err: tokio_tungstenite::tungstenite::Error) -> TransportError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err) => TransportError::Io(io_err),
        WsError::Url(e) => TransportError::InvalidUrl(e.to_string()),
        WsError::Http(response) => {
            TransportError::Handshake(format!("server answered status {}", response.status()))
        }
        other => TransportError::Handshake(other.to_string()),
    }
}
