//! In-process fake messenger server for integration tests.
//!
//! Serves the WebSocket endpoint at `/chat/ws` (selecting the
//! `bearer-token-carrier` sub-protocol like the real server) and the
//! presence/history snapshot endpoints under `/chat/api`. Tests script it by
//! setting snapshots, pushing frames to connected clients, dropping
//! connections, and inspecting what clients sent.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::header::{AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Json;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use chatsync_proto::codec;
use chatsync_proto::message::{Envelope, MessageKind, Payload, Timestamp};
use chatsync_proto::presence::PresenceUser;

pub const TOKEN: &str = "tok";

enum ServerCommand {
    Push(String),
    Drop,
}

#[derive(Default)]
pub struct Inner {
    pub presence: Vec<PresenceUser>,
    pub history: Vec<Envelope>,
    pub history_delay: Duration,
    pub reject_upgrades: bool,
    pub received: Vec<Envelope>,
    pub offered_protocols: Vec<String>,
    pub upgrade_attempts: Vec<Instant>,
    pub handshakes: usize,
    pub history_requests: usize,
    pub presence_requests: usize,
    connections: Vec<mpsc::UnboundedSender<ServerCommand>>,
}

type Shared = Arc<Mutex<Inner>>;

pub struct FakeServer {
    addr: SocketAddr,
    state: Shared,
    handle: tokio::task::JoinHandle<()>,
}

impl FakeServer {
    pub async fn start() -> Self {
        let state: Shared = Arc::new(Mutex::new(Inner::default()));
        let app = Router::new()
            .route("/chat/ws", get(ws_handler))
            .route("/chat/api/presence", get(presence_handler))
            .route("/chat/api/history", get(history_handler))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            state,
            handle,
        }
    }

    pub fn socket_url(&self) -> String {
        format!("ws://{}/chat/ws", self.addr)
    }

    pub fn api_origin(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        f(&mut self.state.lock())
    }

    /// Sends `frame` to every connected client.
    pub fn push_raw(&self, frame: &str) {
        self.with(|inner| {
            inner
                .connections
                .retain(|tx| tx.send(ServerCommand::Push(frame.to_string())).is_ok());
        });
    }

    pub fn push(&self, envelope: &Envelope) {
        self.push_raw(&codec::encode(envelope).unwrap());
    }

    /// Drops every open connection without a close frame.
    pub fn drop_connections(&self) {
        self.with(|inner| {
            for tx in inner.connections.drain(..) {
                let _ = tx.send(ServerCommand::Drop);
            }
        });
    }

    /// Polls until `condition` holds, panicking after five seconds.
    pub async fn wait_until(&self, what: &str, condition: impl Fn(&Inner) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if condition(&self.state.lock()) {
                return;
            }
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Chat envelopes received from clients.
    pub fn received_chats(&self) -> Vec<Envelope> {
        self.received_of(MessageKind::Chat)
    }

    /// Ack envelopes received from clients.
    pub fn received_acks(&self) -> Vec<Envelope> {
        self.received_of(MessageKind::Ack)
    }

    fn received_of(&self, kind: MessageKind) -> Vec<Envelope> {
        self.with(|inner| {
            inner
                .received
                .iter()
                .filter(|e| e.kind == kind)
                .cloned()
                .collect()
        })
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A presence frame as the server broadcasts it.
pub fn presence_frame(kind: &str, body: &str) -> String {
    serde_json::json!({
        "type": kind,
        "senderId": "server",
        "recipientId": "BROADCAST",
        "payload": { "kind": "presence", "body": body },
    })
    .to_string()
}

/// A chat envelope with a fixed timestamp.
pub fn chat_at(from: &str, to: &str, text: &str, millis: u64) -> Envelope {
    let mut envelope = Envelope::chat(from, to, text, None);
    envelope.sender_timestamp = Timestamp::from_millis(millis);
    envelope
}

/// The ack a peer would send for `original`.
pub fn ack_for(original: &Envelope) -> Envelope {
    let mut ack = Envelope::chat(
        original.recipient_id.as_str(),
        original.sender_id.as_str(),
        "",
        None,
    );
    ack.kind = MessageKind::Ack;
    ack.correlation_id = Some(original.message_id.clone());
    ack.payload = Payload::text(format!("Ack for message {}", original.message_id));
    ack
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {TOKEN}"))
}

async fn ws_handler(
    State(state): State<Shared>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let offered = headers
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let reject = {
        let mut inner = state.lock();
        inner.upgrade_attempts.push(Instant::now());
        inner.offered_protocols.push(offered);
        inner.reject_upgrades
    };
    if reject {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    ws.protocols(["bearer-token-carrier"])
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Shared) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel();
    {
        let mut inner = state.lock();
        inner.handshakes += 1;
        inner.connections.push(tx);
    }

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(ServerCommand::Push(text)) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(ServerCommand::Drop) | None => break,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(envelope) = codec::decode(text.as_str()) {
                        state.lock().received.push(envelope);
                    }
                }
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}

async fn presence_handler(State(state): State<Shared>, headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let presence = {
        let mut inner = state.lock();
        inner.presence_requests += 1;
        inner.presence.clone()
    };
    Json(presence).into_response()
}

async fn history_handler(State(state): State<Shared>, headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let (history, delay) = {
        let mut inner = state.lock();
        inner.history_requests += 1;
        (inner.history.clone(), inner.history_delay)
    };
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    Json(history).into_response()
}
