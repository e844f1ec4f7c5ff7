//! Configuration management for mcpconn
//!
//! This module handles loading, parsing, validating, and managing
//! configuration from files, environment variables, and CLI overrides.
//! It also owns the per-server [`ServerConfig`] record, transport type
//! inference, and `${VAR}` / `{{USER_ID}}` placeholder substitution.

use crate::error::{McpConnError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

/// Placeholder replaced with the owning user's id.
pub const USER_ID_PLACEHOLDER: &str = "{{USER_ID}}";

/// Main configuration structure for mcpconn
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Timeouts and reconnection policy shared by every connection
    #[serde(default)]
    pub connection: ConnectionSettings,

    /// Connector token platform; absent when no provider refresh applies
    #[serde(default)]
    pub connector: Option<ConnectorConfig>,

    /// Tool servers keyed by name
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,
}

/// Connection-wide timeouts and retry budget
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionSettings {
    /// Bound on transport construction plus the initialize handshake
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,

    /// Bound on waiting for an out-of-band OAuth outcome
    #[serde(default = "default_oauth_timeout")]
    pub oauth_timeout_seconds: u64,

    /// Automatic reconnection attempts after an error
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Bound on the liveness ping
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_seconds: u64,

    /// Default bound on a single RPC request
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

fn default_connect_timeout() -> u64 {
    120
}

fn default_oauth_timeout() -> u64 {
    60
}

fn default_max_reconnect_attempts() -> u32 {
    3
}

fn default_ping_timeout() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout_seconds: default_connect_timeout(),
            oauth_timeout_seconds: default_oauth_timeout(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            ping_timeout_seconds: default_ping_timeout(),
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

impl ConnectionSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn oauth_timeout(&self) -> Duration {
        Duration::from_secs(self.oauth_timeout_seconds)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

/// Connector token platform configuration
///
/// Servers whose URL host matches one of `host_patterns` get provider-issued
/// bearer tokens, refreshed proactively before each connect.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectorConfig {
    /// Host names or `*.suffix` wildcards identifying connector servers
    #[serde(default)]
    pub host_patterns: Vec<String>,

    /// OAuth token endpoint used for the client-credentials grant
    pub token_url: String,

    /// Client id, may contain `${VAR}` placeholders
    pub client_id: String,

    /// Client secret, may contain `${VAR}` placeholders
    pub client_secret: String,

    /// Optional scope sent with the grant
    #[serde(default)]
    pub scope: Option<String>,
}

/// Transport used to reach a tool server
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// Child process speaking newline-delimited JSON
    Stdio,
    /// `ws://` or `wss://` endpoint, one message per text frame
    #[serde(alias = "ws")]
    WebSocket,
    /// Long-lived event stream plus POST endpoint
    Sse,
    /// POST per message, JSON or event-stream responses
    #[serde(alias = "http", alias = "streamableHttp")]
    StreamableHttp,
}

impl TransportKind {
    /// Network transports that carry an `Authorization` header.
    pub fn is_http(self) -> bool {
        matches!(self, TransportKind::Sse | TransportKind::StreamableHttp)
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransportKind::Stdio => "stdio",
            TransportKind::WebSocket => "websocket",
            TransportKind::Sse => "sse",
            TransportKind::StreamableHttp => "streamable-http",
        };
        f.write_str(name)
    }
}

/// Static OAuth parameters forwarded with an OAuth-required event
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OAuthSettings {
    #[serde(default)]
    pub authorization_url: Option<String>,
    #[serde(default)]
    pub token_url: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub redirect_uri: Option<String>,
}

/// Configuration of a single tool server
///
/// Either `command` (stdio) or `url` (network) must be set. When `type` is
/// omitted the transport is inferred from the target.
///
/// # Examples
///
/// ```
/// use mcpconn::config::{ServerConfig, TransportKind};
///
/// let cfg: ServerConfig = serde_yaml::from_str("url: wss://tools.example.com/ws").unwrap();
/// assert_eq!(cfg.transport_kind().unwrap(), TransportKind::WebSocket);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Explicit transport type
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportKind>,

    /// Executable for stdio servers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Arguments for stdio servers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Extra environment for stdio servers; wins over the inherited defaults
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,

    /// Working directory for stdio servers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,

    /// Endpoint for network servers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Extra headers for network servers
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,

    /// Per-server override of the connect timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_timeout_seconds: Option<u64>,

    /// Per-server override of the request timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,

    /// Static OAuth parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth: Option<OAuthSettings>,
}

impl ServerConfig {
    /// Config for a stdio server.
    pub fn stdio(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: Some(command.into()),
            args,
            ..Self::default()
        }
    }

    /// Config for a network server with an inferred transport.
    pub fn remote(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    /// Resolve the transport, inferring it when `type` is absent.
    ///
    /// `command` wins over `url`; a `ws`/`wss` URL selects WebSocket and any
    /// other URL selects SSE. A declared type that contradicts the target is
    /// a [`McpConnError::TransportConstruction`] error.
    pub fn transport_kind(&self) -> std::result::Result<TransportKind, McpConnError> {
        let kind = match (self.transport, &self.command, &self.url) {
            (Some(kind), _, _) => kind,
            (None, Some(_), _) => TransportKind::Stdio,
            (None, None, Some(url)) => {
                if is_websocket_url(&parse_url(url)?) {
                    TransportKind::WebSocket
                } else {
                    TransportKind::Sse
                }
            }
            (None, None, None) => {
                return Err(McpConnError::TransportConstruction(
                    "server needs either `command` or `url`".to_string(),
                ))
            }
        };

        match kind {
            TransportKind::Stdio => {
                if self.command.as_deref().map_or(true, str::is_empty) {
                    return Err(McpConnError::TransportConstruction(
                        "stdio transport requires `command`".to_string(),
                    ));
                }
            }
            TransportKind::WebSocket => {
                let url = self.parsed_url()?;
                if !is_websocket_url(&url) {
                    return Err(McpConnError::TransportConstruction(format!(
                        "websocket transport requires a ws:// or wss:// URL, got `{}`",
                        url.scheme()
                    )));
                }
            }
            TransportKind::Sse | TransportKind::StreamableHttp => {
                let url = self.parsed_url()?;
                if is_websocket_url(&url) {
                    return Err(McpConnError::TransportConstruction(format!(
                        "{kind} transport cannot use a {} URL",
                        url.scheme()
                    )));
                }
            }
        }
        Ok(kind)
    }

    /// The endpoint URL, parsed.
    pub fn parsed_url(&self) -> std::result::Result<url::Url, McpConnError> {
        let raw = self.url.as_deref().ok_or_else(|| {
            McpConnError::TransportConstruction("network transport requires `url`".to_string())
        })?;
        parse_url(raw)
    }

    /// Copy of this config with every placeholder substituted.
    ///
    /// `${NAME}` is taken from the process environment and `{{USER_ID}}`
    /// from `user_id`. Applies to args, env values, url and header values.
    pub fn resolved(&self, user_id: Option<&str>) -> Self {
        let mut out = self.clone();
        out.args = self
            .args
            .iter()
            .map(|a| resolve_placeholders(a, user_id))
            .collect();
        out.env = self
            .env
            .iter()
            .map(|(k, v)| (k.clone(), resolve_placeholders(v, user_id)))
            .collect();
        out.url = self.url.as_deref().map(|u| resolve_placeholders(u, user_id));
        out.headers = self
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), resolve_placeholders(v, user_id)))
            .collect();
        out
    }
}

fn parse_url(raw: &str) -> std::result::Result<url::Url, McpConnError> {
    url::Url::parse(raw)
        .map_err(|e| McpConnError::TransportConstruction(format!("invalid URL `{raw}`: {e}")))
}

fn is_websocket_url(url: &url::Url) -> bool {
    matches!(url.scheme(), "ws" | "wss")
}

fn env_placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // SAFETY: the pattern is a constant and known to compile.
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder regex is valid")
    })
}

/// Substitute `${NAME}` from the environment and `{{USER_ID}}` from `user_id`.
///
/// Unset variables are left verbatim so the failure is visible downstream.
///
/// # Examples
///
/// ```
/// use mcpconn::config::resolve_placeholders;
///
/// let out = resolve_placeholders("/users/{{USER_ID}}/files", Some("u-42"));
/// assert_eq!(out, "/users/u-42/files");
/// ```
pub fn resolve_placeholders(value: &str, user_id: Option<&str>) -> String {
    let substituted = env_placeholder().replace_all(value, |caps: &regex::Captures<'_>| {
        match std::env::var(&caps[1]) {
            Ok(v) => v,
            Err(_) => {
                tracing::debug!(variable = &caps[1], "Placeholder variable is not set");
                caps[0].to_string()
            }
        }
    });
    match user_id {
        Some(user) => substituted.replace(USER_ID_PLACEHOLDER, user),
        None => substituted.into_owned(),
    }
}

impl Config {
    /// Load configuration from file with environment and CLI overrides
    ///
    /// # Arguments
    ///
    /// * `path` - Path to configuration file
    /// * `cli` - CLI arguments for overrides
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed
    pub fn load(path: &str, cli: &crate::cli::Cli) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            Self::from_file(path)?
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path);
            Self::default()
        };

        config.apply_env_vars();
        config.apply_cli_overrides(cli);
        config.resolve_connector_secrets();

        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| McpConnError::Config(format!("Failed to read config file: {}", e)))?;
        serde_yaml::from_str(&contents)
            .map_err(|e| McpConnError::Config(format!("Failed to parse config: {}", e)).into())
    }

    fn apply_env_vars(&mut self) {
        if let Ok(timeout) = std::env::var("MCPCONN_CONNECT_TIMEOUT_SECONDS") {
            if let Ok(value) = timeout.parse() {
                self.connection.connect_timeout_seconds = value;
            } else {
                tracing::warn!("Invalid MCPCONN_CONNECT_TIMEOUT_SECONDS: {}", timeout);
            }
        }

        if let Ok(timeout) = std::env::var("MCPCONN_OAUTH_TIMEOUT_SECONDS") {
            if let Ok(value) = timeout.parse() {
                self.connection.oauth_timeout_seconds = value;
            } else {
                tracing::warn!("Invalid MCPCONN_OAUTH_TIMEOUT_SECONDS: {}", timeout);
            }
        }

        if let Ok(attempts) = std::env::var("MCPCONN_MAX_RECONNECT_ATTEMPTS") {
            if let Ok(value) = attempts.parse() {
                self.connection.max_reconnect_attempts = value;
            } else {
                tracing::warn!("Invalid MCPCONN_MAX_RECONNECT_ATTEMPTS: {}", attempts);
            }
        }

        if let Ok(token_url) = std::env::var("MCPCONN_CONNECTOR_TOKEN_URL") {
            match self.connector.as_mut() {
                Some(connector) => connector.token_url = token_url,
                None => tracing::warn!(
                    "MCPCONN_CONNECTOR_TOKEN_URL set but no connector is configured; ignoring"
                ),
            }
        }
    }

    fn apply_cli_overrides(&mut self, cli: &crate::cli::Cli) {
        if let Some(timeout) = cli.connect_timeout {
            self.connection.connect_timeout_seconds = timeout;
        }
        if cli.verbose {
            tracing::debug!("Verbose mode enabled");
        }
    }

    fn resolve_connector_secrets(&mut self) {
        if let Some(connector) = self.connector.as_mut() {
            connector.client_id = resolve_placeholders(&connector.client_id, None);
            connector.client_secret = resolve_placeholders(&connector.client_secret, None);
        }
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns error if any validation check fails
    pub fn validate(&self) -> Result<()> {
        let conn = &self.connection;
        if conn.connect_timeout_seconds == 0 {
            return Err(McpConnError::Config(
                "connection.connect_timeout_seconds must be greater than 0".to_string(),
            )
            .into());
        }
        if conn.oauth_timeout_seconds == 0 {
            return Err(McpConnError::Config(
                "connection.oauth_timeout_seconds must be greater than 0".to_string(),
            )
            .into());
        }
        if conn.ping_timeout_seconds == 0 {
            return Err(McpConnError::Config(
                "connection.ping_timeout_seconds must be greater than 0".to_string(),
            )
            .into());
        }
        if conn.request_timeout_seconds == 0 {
            return Err(McpConnError::Config(
                "connection.request_timeout_seconds must be greater than 0".to_string(),
            )
            .into());
        }

        if let Some(connector) = &self.connector {
            if connector.host_patterns.is_empty() {
                return Err(McpConnError::Config(
                    "connector.host_patterns must list at least one host".to_string(),
                )
                .into());
            }
            url::Url::parse(&connector.token_url).map_err(|e| {
                McpConnError::Config(format!(
                    "connector.token_url is not a valid URL: {}",
                    e
                ))
            })?;
        }

        for (name, server) in &self.servers {
            if name.trim().is_empty() {
                return Err(
                    McpConnError::Config("Server names cannot be empty".to_string()).into(),
                );
            }
            if server.command.is_none() && server.url.is_none() {
                return Err(McpConnError::Config(format!(
                    "Server `{}` needs either `command` or `url`",
                    name
                ))
                .into());
            }
            if matches!(server.init_timeout_seconds, Some(0))
                || matches!(server.timeout_seconds, Some(0))
            {
                return Err(McpConnError::Config(format!(
                    "Server `{}` timeouts must be greater than 0",
                    name
                ))
                .into());
            }
            server.transport_kind().map_err(|e| {
                McpConnError::Config(format!("Server `{}`: {}", name, e))
            })?;
        }

        Ok(())
    }
}
