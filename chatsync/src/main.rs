//! Command-line messaging client built on the `chatsync` engine.
//!
//! Connects to a messenger server, prints conversation and presence changes
//! to stdout, and sends messages typed on stdin. Configuration via CLI flags,
//! environment variables, or config file (`~/.config/chatsync/config.toml`).
//!
//! ```bash
//! CHATSYNC_TOKEN=... cargo run --bin chatsync -- \
//!     --socket-url wss://chat.example.com/chat/ws \
//!     --api-origin https://chat.example.com --user-id alice
//! ```
//!
//! Input lines:
//! - `<peer> <text>` sends `text` to `peer`
//! - `/open <peer>` opens an empty conversation
//! - `/quit` disconnects and exits

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing_appender::non_blocking::WorkerGuard;

use chatsync::chat::{ConversationIndex, Direction};
use chatsync::config::{CliArgs, ClientConfig};
use chatsync::connection::{ConnectionManager, SessionHandle};
use chatsync::session::ConnectionState;
use chatsync_proto::presence::PresenceUser;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::default()
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());

    let Some(net_config) = config.to_session_config() else {
        eprintln!("socket url, api origin and user id are required (see --help)");
        return ExitCode::from(2);
    };
    let credentials = match config.credentials() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(2);
        }
    };
    let manager = match ConnectionManager::new(net_config) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            return ExitCode::from(2);
        }
    };

    tracing::info!("chatsync starting");
    let handle = manager.connect(credentials);
    let printer = tokio::spawn(print_updates(
        handle.conversations(),
        handle.presence(),
        handle.connection_state(),
    ));

    read_commands(&handle).await;

    handle.disconnect();
    handle.join().await;
    printer.abort();
    tracing::info!("chatsync exiting");
    ExitCode::SUCCESS
}

/// Initialize logging.
///
/// Logs go to stderr, or to `file_path` when given so they do not interleave
/// with the conversation output. Returns a [`WorkerGuard`] that must be held
/// until shutdown to ensure all buffered log entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let Some(log_path) = file_path else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(env_filter)
            .init();
        return None;
    };

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

/// A parsed stdin line.
#[derive(Debug, PartialEq, Eq)]
enum Input<'a> {
    Send { peer: &'a str, text: &'a str },
    Open(&'a str),
    Quit,
    Invalid,
}

fn parse_input(line: &str) -> Input<'_> {
    let line = line.trim();
    if line == "/quit" {
        return Input::Quit;
    }
    if let Some(peer) = line.strip_prefix("/open ") {
        let peer = peer.trim();
        return if peer.is_empty() {
            Input::Invalid
        } else {
            Input::Open(peer)
        };
    }
    match line.split_once(char::is_whitespace) {
        Some((peer, text)) if !line.starts_with('/') && !text.trim().is_empty() => Input::Send {
            peer,
            text: text.trim(),
        },
        _ => Input::Invalid,
    }
}

async fn read_commands(handle: &SessionHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(err = %e, "stdin read failed");
                break;
            }
        };
        match parse_input(&line) {
            Input::Send { peer, text } => handle.send(peer, text),
            Input::Open(peer) => handle.open_chat(peer),
            Input::Quit => break,
            Input::Invalid => {
                if !line.trim().is_empty() {
                    eprintln!("usage: <peer> <text> | /open <peer> | /quit");
                }
            }
        }
    }
}

async fn print_updates(
    mut conversations: watch::Receiver<ConversationIndex>,
    mut presence: watch::Receiver<Vec<PresenceUser>>,
    mut state: watch::Receiver<ConnectionState>,
) {
    let mut seen: HashMap<String, Option<bool>> = HashMap::new();
    loop {
        tokio::select! {
            changed = conversations.changed() => {
                if changed.is_err() {
                    break;
                }
                let index = conversations.borrow_and_update().clone();
                for line in render_conversation_changes(&index, &mut seen) {
                    println!("{line}");
                }
            }
            changed = presence.changed() => {
                if changed.is_err() {
                    break;
                }
                let users = presence.borrow_and_update().clone();
                let names: Vec<String> = users.iter().map(ToString::to_string).collect();
                println!("* online: {}", names.join(", "));
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                println!("* {current}");
            }
        }
    }
}

/// Lines describing messages that are new or whose delivery flag changed
/// since the last call.
///
/// `seen` is pruned to the ids still present in `index`.
fn render_conversation_changes(
    index: &ConversationIndex,
    seen: &mut HashMap<String, Option<bool>>,
) -> Vec<String> {
    let mut lines = Vec::new();
    let mut present = HashSet::new();
    for (peer, messages) in index {
        for message in messages {
            let id = message.id.to_string();
            present.insert(id.clone());
            let previous = seen.insert(id, message.acknowledged);
            match (previous, message.direction) {
                (None, Direction::Inbound) => lines.push(format!("[{peer}] < {}", message.text)),
                (None, _) => lines.push(format!(
                    "[{peer}] > {}{}",
                    message.text,
                    if message.acknowledged == Some(true) { " ✓" } else { "" }
                )),
                (Some(before), _) if before != message.acknowledged => {
                    lines.push(format!("[{peer}] ✓ {}", message.text));
                }
                _ => {}
            }
        }
    }
    seen.retain(|id, _| present.contains(id));
    lines
}
