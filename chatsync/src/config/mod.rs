//! Configuration system for the `ChatSync` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/chatsync/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error. The bearer token is
//! accepted from the CLI or environment only, never from the file.

use std::path::PathBuf;
use std::time::Duration;

use crate::chat::store::{DEFAULT_MAX_MESSAGES_PER_PEER, StoreLimits};
use crate::connection::{Credentials, NetConfig};

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// A setting required to connect is not configured anywhere.
    #[error("missing required setting: {0}")]
    Missing(&'static str),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    network: NetworkFileConfig,
    reconnect: ReconnectFileConfig,
    store: StoreFileConfig,
    chat: ChatFileConfig,
}

/// `[network]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct NetworkFileConfig {
    socket_url: Option<String>,
    api_origin: Option<String>,
    user_id: Option<String>,
    channel_capacity: Option<usize>,
}

/// `[reconnect]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ReconnectFileConfig {
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
}

/// `[store]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct StoreFileConfig {
    max_messages_per_peer: Option<usize>,
    max_peers: Option<usize>,
}

/// `[chat]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ChatFileConfig {
    sender_timezone: Option<String>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Reconnect backoff delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Delay before the first retry; doubles on every further failure.
    pub base_delay: Duration,
    /// Upper bound on the delay.
    pub max_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Network --
    /// WebSocket URL of the messenger server.
    pub socket_url: Option<String>,
    /// Origin of the REST API serving presence and history snapshots.
    pub api_origin: Option<String>,
    /// Authenticated user id.
    pub user_id: Option<String>,
    /// Bearer token (CLI / environment only).
    pub token: Option<String>,
    /// Capacity of the command channel into the session driver.
    pub channel_capacity: usize,

    // -- Reconnect --
    /// Backoff delays.
    pub reconnect: ReconnectConfig,

    // -- Store --
    /// Retention limits of the conversation store.
    pub limits: StoreLimits,

    // -- Chat --
    /// IANA timezone stamped on outbound envelopes.
    pub sender_timezone: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_url: None,
            api_origin: None,
            user_id: None,
            token: None,
            channel_capacity: 256,
            reconnect: ReconnectConfig::default(),
            limits: StoreLimits {
                max_messages_per_peer: DEFAULT_MAX_MESSAGES_PER_PEER,
                max_peers: None,
            },
            sender_timezone: "UTC".to_string(),
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// If no `--config` is given, the default path
    /// (`~/.config/chatsync/config.toml`) is tried and silently ignored if
    /// missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            socket_url: cli
                .socket_url
                .clone()
                .or_else(|| file.network.socket_url.clone()),
            api_origin: cli
                .api_origin
                .clone()
                .or_else(|| file.network.api_origin.clone()),
            user_id: cli.user_id.clone().or_else(|| file.network.user_id.clone()),
            token: cli.token.clone(),
            channel_capacity: file
                .network
                .channel_capacity
                .unwrap_or(defaults.channel_capacity),
            reconnect: ReconnectConfig {
                base_delay: file
                    .reconnect
                    .base_delay_ms
                    .map_or(defaults.reconnect.base_delay, Duration::from_millis),
                max_delay: file
                    .reconnect
                    .max_delay_ms
                    .map_or(defaults.reconnect.max_delay, Duration::from_millis),
            },
            limits: StoreLimits {
                max_messages_per_peer: file
                    .store
                    .max_messages_per_peer
                    .unwrap_or(defaults.limits.max_messages_per_peer),
                max_peers: file.store.max_peers.or(defaults.limits.max_peers),
            },
            sender_timezone: cli
                .timezone
                .clone()
                .or_else(|| file.chat.sender_timezone.clone())
                .unwrap_or(defaults.sender_timezone),
        }
    }

    /// Build a [`NetConfig`] from this configuration, if all required
    /// networking fields are present.
    ///
    /// Returns `None` if `socket_url`, `api_origin`, or `user_id` is missing
    /// or empty.
    #[must_use]
    pub fn to_session_config(&self) -> Option<NetConfig> {
        let socket_url = self.socket_url.clone().filter(|s| !s.is_empty())?;
        let api_origin = self.api_origin.clone().filter(|s| !s.is_empty())?;
        self.user_id.as_deref().filter(|s| !s.is_empty())?;

        Some(NetConfig {
            socket_url,
            api_origin,
            channel_capacity: self.channel_capacity,
            reconnect: self.reconnect,
            limits: self.limits,
            sender_timezone: Some(self.sender_timezone.clone()),
        })
    }

    /// The identity to connect as.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Missing` if the user id or token is absent.
    pub fn credentials(&self) -> Result<Credentials, ConfigError> {
        let user_id = self
            .user_id
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::Missing("user id"))?;
        let token = self
            .token
            .clone()
            .filter(|s| !s.trim().is_empty())
            .ok_or(ConfigError::Missing("token"))?;
        Ok(Credentials { token, user_id })
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Real-time messaging sync client")]
pub struct CliArgs {
    /// WebSocket URL of the messenger server.
    #[arg(long, env = "CHATSYNC_SOCKET_URL")]
    pub socket_url: Option<String>,

    /// Origin of the REST API (e.g. `https://chat.example.com`).
    #[arg(long, env = "CHATSYNC_API_ORIGIN")]
    pub api_origin: Option<String>,

    /// Your user id.
    #[arg(long, env = "CHATSYNC_USER_ID")]
    pub user_id: Option<String>,

    /// Bearer token for the socket handshake and REST calls.
    #[arg(long, env = "CHATSYNC_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// IANA timezone stamped on outbound messages.
    #[arg(long)]
    pub timezone: Option<String>,

    /// Path to config file (default: `~/.config/chatsync/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "CHATSYNC_LOG")]
    pub log_level: String,

    /// Path to log file (default: stderr).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    }

    let Some(config_dir) = dirs::config_dir() else {
        return Ok(ConfigFile::default());
    };
    let path = config_dir.join("chatsync").join("config.toml");

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
