//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `PUSHGATE_LISTEN` (comma-separated),
//!    `PUSHGATE_DOCUMENT_ROOT`, `HOST_MACHINE_IP`
//! 2. **Config file** — path via `--config <path>`, or `pushgate.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = ["0.0.0.0:8080"]         # add "[::]:8080" for dual stack
//! document_root = "public"
//! post_max_size = "8M"
//! max_connections = 1000
//! max_connections_per_ip = 10
//!
//! [websocket]
//! check_origin = true
//! allowed_origins = []              # appended to the built-in allow-list
//! client_queue_size = 256
//! send_timeout_ms = 1000
//! max_message_size = 1048576
//! heartbeat_interval_ms = 1000
//!
//! [sse]
//! event_count = 30
//! interval_ms = 500
//! max_connections = 64
//!
//! [logging]
//! level = "info"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::util::{expand_tilde, ByteSize};

/// Config file looked up in the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "pushgate.toml";

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub websocket: WebSocketConfig,
    #[serde(default)]
    pub sse: SseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener, admission and HTTP settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket addresses to bind (default `["0.0.0.0:8080"]`).
    #[serde(default = "default_listen")]
    pub listen: Vec<String>,
    /// Directory served by the static fallback (default `public`). Created at
    /// startup if missing.
    #[serde(default = "default_document_root")]
    pub document_root: String,
    /// Maximum request body for `POST /` (default `8M`).
    #[serde(default = "default_post_max_size")]
    pub post_max_size: ByteSize,
    /// Maximum concurrent TCP connections across all listeners (default 1000).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Maximum concurrent TCP connections from one source IP (default 10).
    #[serde(default = "default_max_connections_per_ip")]
    pub max_connections_per_ip: usize,
}

/// WebSocket endpoint and broadcast settings.
#[derive(Debug, Clone, Deserialize)]
pub struct WebSocketConfig {
    /// Reject upgrades whose `Origin` is not allow-listed (default true).
    #[serde(default = "default_check_origin")]
    pub check_origin: bool,
    /// Extra origins accepted in addition to the built-in local ones.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    /// Host address used to build one allowed origin. Set from
    /// `HOST_MACHINE_IP`; falls back to `127.0.0.1`.
    #[serde(default)]
    pub host_machine_ip: Option<String>,
    /// Outbound messages buffered per client before broadcasts wait (default 256).
    #[serde(default = "default_client_queue_size")]
    pub client_queue_size: usize,
    /// How long a broadcast waits on one slow client (default 1000 ms).
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    /// Largest inbound message accepted, in bytes (default 1 MiB).
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// Period of the timestamp heartbeat broadcast (default 1000 ms).
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
}

/// `GET /events` stream settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SseConfig {
    /// Events emitted per request before the stream ends (default 30).
    #[serde(default = "default_sse_event_count")]
    pub event_count: u32,
    /// Delay before each event (default 500 ms).
    #[serde(default = "default_sse_interval_ms")]
    pub interval_ms: u64,
    /// Concurrent streams before answering 429 (default 64).
    #[serde(default = "default_sse_max_connections")]
    pub max_connections: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> Vec<String> {
    vec!["0.0.0.0:8080".to_string()]
}
fn default_document_root() -> String {
    "public".to_string()
}
fn default_post_max_size() -> ByteSize {
    ByteSize(8 * 1024 * 1024)
}
fn default_max_connections() -> usize {
    1000
}
fn default_max_connections_per_ip() -> usize {
    10
}
fn default_check_origin() -> bool {
    true
}
fn default_client_queue_size() -> usize {
    256
}
fn default_send_timeout_ms() -> u64 {
    1000
}
fn default_max_message_size() -> usize {
    1024 * 1024
}
fn default_heartbeat_interval_ms() -> u64 {
    1000
}
fn default_sse_event_count() -> u32 {
    30
}
fn default_sse_interval_ms() -> u64 {
    500
}
fn default_sse_max_connections() -> u32 {
    64
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            document_root: default_document_root(),
            post_max_size: default_post_max_size(),
            max_connections: default_max_connections(),
            max_connections_per_ip: default_max_connections_per_ip(),
        }
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            check_origin: default_check_origin(),
            allowed_origins: Vec::new(),
            host_machine_ip: None,
            client_queue_size: default_client_queue_size(),
            send_timeout_ms: default_send_timeout_ms(),
            max_message_size: default_max_message_size(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
        }
    }
}

impl Default for SseConfig {
    fn default() -> Self {
        Self {
            event_count: default_sse_event_count(),
            interval_ms: default_sse_interval_ms(),
            max_connections: default_sse_max_connections(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ServerConfig {
    /// Document root with `~` expanded.
    pub fn document_root_path(&self) -> PathBuf {
        PathBuf::from(expand_tilde(&self.document_root).as_ref())
    }

    /// Port of the first listen address, used to build the default origins.
    pub fn primary_port(&self) -> u16 {
        self.listen
            .first()
            .and_then(|addr| addr.rsplit_once(':'))
            .and_then(|(_, port)| port.parse().ok())
            .unwrap_or(8080)
    }
}

impl WebSocketConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

impl SseConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist and parse. Otherwise
    /// `pushgate.toml` in the current directory is used when present, falling
    /// back to compiled defaults.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(Path::new(p))?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Config::default(),
        };

        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML config file without applying env overrides.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;
        Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: display,
            source,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(listen) = var("PUSHGATE_LISTEN") {
            let addrs: Vec<String> = listen
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
                .collect();
            if !addrs.is_empty() {
                self.server.listen = addrs;
            }
        }
        if let Some(root) = var("PUSHGATE_DOCUMENT_ROOT") {
            self.server.document_root = root;
        }
        if let Some(ip) = var("HOST_MACHINE_IP") {
            if !ip.trim().is_empty() {
                self.websocket.host_machine_ip = Some(ip.trim().to_string());
            }
        }
    }

    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.listen.is_empty() {
            return Err(ConfigError::Invalid(
                "server.listen must name at least one address".into(),
            ));
        }
        if self.server.max_connections == 0 || self.server.max_connections_per_ip == 0 {
            return Err(ConfigError::Invalid(
                "server.max_connections and server.max_connections_per_ip must be positive".into(),
            ));
        }
        if self.websocket.client_queue_size == 0 {
            return Err(ConfigError::Invalid(
                "websocket.client_queue_size must be positive".into(),
            ));
        }
        if self.websocket.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "websocket.heartbeat_interval_ms must be positive".into(),
            ));
        }
        if self.websocket.send_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "websocket.send_timeout_ms must be positive".into(),
            ));
        }
        if self.sse.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "sse.max_connections must be positive".into(),
            ));
        }
        Ok(())
    }
}
