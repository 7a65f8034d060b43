#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::needless_continue,
    clippy::match_same_arms,
    clippy::doc_markdown,
    clippy::manual_let_else,
    clippy::future_not_send,
    clippy::redundant_pub_crate,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::missing_docs_in_private_items
)]
//! Integration tests for reconnect behavior.
//!
//! Verifies that a dropped connection is retried with growing delays, that
//! every reconnect re-fetches the snapshots, that unacknowledged sends
//! survive the reconnect, and that `disconnect` ends the retry loop.

#[allow(dead_code)]
#[path = "../support/fake_server.rs"]
mod fake_server;

use std::time::Duration;

use tokio::sync::watch;

use chatsync::chat::ConversationIndex;
use chatsync::config::ReconnectConfig;
use chatsync::connection::{ConnectionManager, Credentials, NetConfig, SessionHandle};
use chatsync::session::ConnectionState;
use chatsync_proto::message::MessageKind;

use fake_server::{FakeServer, TOKEN, ack_for, chat_at};

const LOCAL_USER: &str = "u1";

fn fast_reconnect() -> ReconnectConfig {
    ReconnectConfig {
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(1),
    }
}

fn connect(server: &FakeServer) -> SessionHandle {
    let mut config = NetConfig::new(server.socket_url(), server.api_origin());
    config.reconnect = fast_reconnect();
    let manager = ConnectionManager::new(config).unwrap();
    manager.connect(Credentials {
        token: TOKEN.to_string(),
        user_id: LOCAL_USER.to_string(),
    })
}

async fn wait_for<T>(rx: &mut watch::Receiver<T>, what: &str, condition: impl FnMut(&T) -> bool) {
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(condition))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
        .expect("session dropped its watch sender");
}

fn pending_count(index: &ConversationIndex, peer: &str) -> usize {
    index
        .get(peer)
        .map_or(0, |list| list.iter().filter(|m| m.is_pending()).count())
}

#[tokio::test]
async fn reconnects_after_server_drop() {
    let server = FakeServer::start().await;
    let handle = connect(&server);
    let mut state = handle.connection_state();
    wait_for(&mut state, "first open", |s| *s == ConnectionState::Open).await;
    server.wait_until("first connection", |inner| inner.handshakes == 1).await;

    server.drop_connections();
    wait_for(&mut state, "connection lost", |s| *s != ConnectionState::Open).await;
    wait_for(&mut state, "second open", |s| *s == ConnectionState::Open).await;

    server.wait_until("second connection", |inner| inner.handshakes == 2).await;
    server
        .wait_until("snapshots refetched", |inner| {
            inner.history_requests == 2 && inner.presence_requests == 2
        })
        .await;

    // Frames on the new socket are applied.
    server.push(&chat_at("u2", LOCAL_USER, "after", 10));
    let mut conversations = handle.conversations();
    wait_for(&mut conversations, "chat on new socket", |index| {
        index.get("u2").is_some_and(|list| list.len() == 1)
    })
    .await;

    handle.disconnect();
    handle.join().await;
}

#[tokio::test]
async fn unacknowledged_send_survives_reconnect() {
    let server = FakeServer::start().await;
    let handle = connect(&server);
    let mut state = handle.connection_state();
    let mut conversations = handle.conversations();
    wait_for(&mut state, "open", |s| *s == ConnectionState::Open).await;
    server.wait_until("history", |inner| inner.history_requests == 1).await;

    handle.send("u2", "are you there");
    server
        .wait_until("chat frame", |inner| {
            inner.received.iter().any(|e| e.kind == MessageKind::Chat)
        })
        .await;
    let sent = server.received_chats().remove(0);

    server.drop_connections();
    wait_for(&mut state, "connection lost", |s| *s != ConnectionState::Open).await;
    wait_for(&mut state, "reopen", |s| *s == ConnectionState::Open).await;
    server
        .wait_until("history refetched", |inner| inner.history_requests == 2)
        .await;
    // Let the empty snapshot land.
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(pending_count(&conversations.borrow(), "u2"), 1);

    server.wait_until("new connection", |inner| inner.handshakes == 2).await;
    server.push(&ack_for(&sent));
    wait_for(&mut conversations, "ack after reconnect", |index| {
        index.get("u2").is_some_and(|list| {
            list.len() == 1 && list[0].id == sent.message_id && list[0].acknowledged == Some(true)
        })
    })
    .await;

    handle.disconnect();
    handle.join().await;
}

#[tokio::test]
async fn disconnect_cancels_pending_reconnect() {
    let server = FakeServer::start().await;
    let handle = connect(&server);
    let mut state = handle.connection_state();
    wait_for(&mut state, "open", |s| *s == ConnectionState::Open).await;
    server.wait_until("connection", |inner| inner.handshakes == 1).await;

    server.with(|inner| inner.reject_upgrades = true);
    server.drop_connections();
    wait_for(&mut state, "connection lost", |s| *s != ConnectionState::Open).await;

    handle.disconnect();
    wait_for(&mut state, "stopped", |s| *s == ConnectionState::Stopped).await;
    let attempts = server.with(|inner| inner.upgrade_attempts.len());

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(server.with(|inner| inner.upgrade_attempts.len()), attempts);
    assert_eq!(*state.borrow(), ConnectionState::Stopped);
    handle.join().await;
}

#[tokio::test]
async fn retry_delays_grow_while_upgrades_fail() {
    let server = FakeServer::start().await;
    server.with(|inner| inner.reject_upgrades = true);
    let handle = connect(&server);

    server
        .wait_until("four attempts", |inner| inner.upgrade_attempts.len() >= 4)
        .await;
    let attempts = server.with(|inner| inner.upgrade_attempts.clone());
    let gaps: Vec<Duration> = attempts.windows(2).map(|w| w[1] - w[0]).collect();
    assert!(gaps[0] >= Duration::from_millis(100), "gaps: {gaps:?}");
    assert!(gaps[1] >= Duration::from_millis(200), "gaps: {gaps:?}");
    assert!(gaps[2] >= Duration::from_millis(400), "gaps: {gaps:?}");
    assert!(gaps[2] > gaps[0], "gaps: {gaps:?}");
    assert_eq!(
        server.with(|inner| inner.handshakes),
        0,
        "rejected upgrades never open"
    );

    server.with(|inner| inner.reject_upgrades = false);
    let mut state = handle.connection_state();
    wait_for(&mut state, "open after recovery", |s| *s == ConnectionState::Open).await;

    handle.disconnect();
    handle.join().await;
}
