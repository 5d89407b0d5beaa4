//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `HTTPTUN_ADDRESS`, `HTTPTUN_PORT`,
//!    `HTTPTUN_PATH_PREFIX`, `HTTPTUN_TUNNEL_KEY`, `HTTPTUN_KEY`,
//!    `HTTPTUN_SERVER_URL`, `HTTPTUN_FORWARD_TO`, `HTTPTUN_REQUEST_TIMEOUT`,
//!    `HTTPTUN_HEARTBEAT_TIMEOUT`, `HTTPTUN_VERBOSITY`
//! 2. **Config file**: path via `--config <path>`, or `httptun.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [gateway]
//! listen = "localhost:8090"
//! path_prefix = "/"
//! request_timeout_ms = 30000
//! tunnel_key = "shared-secret"             # omit to admit any agent key
//! heartbeat_timeout_secs = 90              # evict agents silent this long
//!
//! [agent]
//! key = "client-1"
//! server_url = "ws://localhost:8090"
//! forward_to = "http://prusa3d.local"
//! tunnel_key = "shared-secret"
//! request_timeout_ms = 30000
//! reconnect_delay_secs = 5                 # initial backoff
//! reconnect_max_delay_secs = 60            # max backoff
//! heartbeat_interval_secs = 30             # ping interval
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "httptun.toml";

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Public gateway settings.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Socket address to bind (default `localhost:8090`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Mount point of tunneled requests (default `/`).
    #[serde(default = "default_path_prefix")]
    pub path_prefix: String,
    /// Bound on each wait for an agent, in milliseconds (default 30 000).
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Shared secret agents must present. `None` admits any valid key.
    pub tunnel_key: Option<String>,
    /// Seconds before a silent agent is evicted (default 90).
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,
}

/// Tunnel agent settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Routing key this agent registers under (default `client-1`).
    #[serde(default = "default_agent_key")]
    pub key: String,
    /// Gateway base URL (default `ws://localhost:8090`).
    #[serde(default = "default_server_url")]
    pub server_url: String,
    /// Base URL of the local service requests are forwarded to.
    #[serde(default = "default_forward_to")]
    pub forward_to: Option<String>,
    /// Shared secret sent as `?token=`.
    pub tunnel_key: Option<String>,
    /// Local request timeout in milliseconds (default 30 000).
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Seconds between reconnect attempts (default 5).
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    /// Max seconds between reconnect attempts (default 60).
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_secs: u64,
    /// Seconds between heartbeat pings (default 30).
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "localhost:8090".to_string()
}
fn default_path_prefix() -> String {
    "/".to_string()
}
fn default_request_timeout_ms() -> u64 {
    30000
}
fn default_agent_key() -> String {
    "client-1".to_string()
}
fn default_server_url() -> String {
    "ws://localhost:8090".to_string()
}
#[allow(clippy::unnecessary_wraps)]
fn default_forward_to() -> Option<String> {
    Some("http://prusa3d.local".to_string())
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_reconnect_delay() -> u64 {
    5
}
fn default_reconnect_max_delay() -> u64 {
    60
}
fn default_heartbeat_interval() -> u64 {
    30
}
fn default_heartbeat_timeout() -> u64 {
    90
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            path_prefix: default_path_prefix(),
            request_timeout_ms: default_request_timeout_ms(),
            tunnel_key: None,
            heartbeat_timeout_secs: default_heartbeat_timeout(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            key: default_agent_key(),
            server_url: default_server_url(),
            forward_to: default_forward_to(),
            tunnel_key: None,
            request_timeout_ms: default_request_timeout_ms(),
            reconnect_delay_secs: default_reconnect_delay(),
            reconnect_max_delay_secs: default_reconnect_max_delay(),
            heartbeat_interval_secs: default_heartbeat_interval(),
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

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `httptun.toml` in
    /// the current directory is used when present.
    pub fn load(path: Option<&str>) -> Result<Self, String> {
        let mut config = if let Some(p) = path {
            Self::from_file(p)?
        } else if Path::new(DEFAULT_CONFIG_FILE).exists() {
            Self::from_file(DEFAULT_CONFIG_FILE)?
        } else {
            Self::default()
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {path}: {e}"))?;
        toml::from_str(&content).map_err(|e| format!("Failed to parse config file {path}: {e}"))
    }

    /// Apply `HTTPTUN_*` overrides read through `var`.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), String> {
        if let Some(address) = var("HTTPTUN_ADDRESS") {
            let port = split_listen(&self.gateway.listen).1.to_string();
            self.gateway.listen = format!("{address}:{port}");
        }
        if let Some(port) = var("HTTPTUN_PORT") {
            port.parse::<u16>()
                .map_err(|_| format!("HTTPTUN_PORT: invalid port '{port}'"))?;
            let host = split_listen(&self.gateway.listen).0.to_string();
            self.gateway.listen = format!("{host}:{port}");
        }
        if let Some(prefix) = var("HTTPTUN_PATH_PREFIX") {
            self.gateway.path_prefix = prefix;
        }
        if let Some(tunnel_key) = var("HTTPTUN_TUNNEL_KEY") {
            self.gateway.tunnel_key = Some(tunnel_key.clone());
            self.agent.tunnel_key = Some(tunnel_key);
        }
        if let Some(key) = var("HTTPTUN_KEY") {
            self.agent.key = key;
        }
        if let Some(server_url) = var("HTTPTUN_SERVER_URL") {
            self.agent.server_url = server_url;
        }
        if let Some(forward_to) = var("HTTPTUN_FORWARD_TO") {
            self.agent.forward_to = Some(forward_to).filter(|s| !s.is_empty());
        }
        if let Some(timeout) = var("HTTPTUN_REQUEST_TIMEOUT") {
            let ms = timeout
                .parse::<u64>()
                .map_err(|_| format!("HTTPTUN_REQUEST_TIMEOUT: invalid milliseconds '{timeout}'"))?;
            self.gateway.request_timeout_ms = ms;
            self.agent.request_timeout_ms = ms;
        }
        if let Some(secs) = var("HTTPTUN_HEARTBEAT_TIMEOUT") {
            self.gateway.heartbeat_timeout_secs = secs
                .parse::<u64>()
                .map_err(|_| format!("HTTPTUN_HEARTBEAT_TIMEOUT: invalid seconds '{secs}'"))?;
        }
        if let Some(verbosity) = var("HTTPTUN_VERBOSITY") {
            self.logging.level = verbosity_level(&verbosity)
                .ok_or_else(|| format!("HTTPTUN_VERBOSITY: expected 1-5, got '{verbosity}'"))?
                .to_string();
        }
        Ok(())
    }
}

/// `host:port` split at the last colon; a missing port yields `8090`.
fn split_listen(listen: &str) -> (&str, &str) {
    listen.rsplit_once(':').unwrap_or((listen, "8090"))
}

/// Numeric verbosity (1 = error … 5 = trace) as a tracing level name.
pub fn verbosity_level(verbosity: &str) -> Option<&'static str> {
    match verbosity.trim() {
        "1" => Some("error"),
        "2" => Some("warn"),
        "3" => Some("info"),
        "4" => Some("debug"),
        "5" => Some("trace"),
        _ => None,
    }
}
