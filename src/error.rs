//! Error types for mcpconn
//!
//! This module defines the error taxonomy used by the connection manager,
//! using `thiserror` for ergonomic error handling. Fallible functions return
//! the [`Result`] alias (an `anyhow::Result`) and attach an [`McpConnError`]
//! so that callers can classify failures with `downcast_ref`.
//!
//! [`McpConnError`] is `Clone` because a single connect attempt may be
//! awaited by many callers, and every one of them receives the same outcome.

use thiserror::Error;

/// Substring that marks a provider-side idle termination of a stream.
///
/// Best-effort classifier: streaming transports report an idle timeout only
/// as an unstructured close or error message, so this is the one place where
/// message text decides the classification.
pub const IDLE_CLOSE_MARKER: &str = "terminated";

/// Main error type for connection manager operations
///
/// Variants map onto the recovery policy applied by
/// [`crate::mcp::connection::Connection`]:
///
/// - [`McpConnError::TransportConstruction`] is fatal and never retried.
/// - [`McpConnError::AuthChallenge`] starts the OAuth challenge flow.
/// - [`McpConnError::PotentialToken`] triggers refresh-then-retry.
/// - [`McpConnError::IdleTimeoutClose`] is a normal disconnect.
/// - Everything else counts against the reconnect budget.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum McpConnError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transport options do not match the declared or inferred type
    #[error("Transport construction error: {0}")]
    TransportConstruction(String),

    /// The server demanded authentication (HTTP 401/403)
    #[error("Authentication required{}: {message}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    AuthChallenge {
        /// HTTP status when the transport exposed one
        status: Option<u16>,
        /// Server-supplied detail (often the `WWW-Authenticate` header)
        message: String,
    },

    /// Connector-provider failure that is probably a stale token
    #[error("Potential token error: {0}")]
    PotentialToken(String),

    /// Stream closed by the provider after an idle period
    #[error("Idle timeout close: {0}")]
    IdleTimeoutClose(String),

    /// Non-success HTTP status other than 401/403
    #[error("HTTP {status}: {body}")]
    HttpStatus {
        /// Response status code
        status: u16,
        /// Response body, possibly truncated
        body: String,
    },

    /// Any other transport-level failure
    #[error("Transport error: {0}")]
    GenericTransport(String),

    /// Initialize handshake did not finish within the connect timeout
    #[error("Connection to {server} timed out after {seconds}s")]
    ConnectTimeout {
        /// Server name
        server: String,
        /// Configured timeout in seconds
        seconds: u64,
    },

    /// No OAuth outcome arrived within the OAuth timeout
    #[error("OAuth for {server} was not completed within {seconds}s")]
    OAuthTimeout {
        /// Server name
        server: String,
        /// Configured timeout in seconds
        seconds: u64,
    },

    /// Handshake or message-shape errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The server answered a request with a JSON-RPC error object
    #[error("RPC error {code}: {message}")]
    Rpc {
        /// JSON-RPC error code
        code: i64,
        /// JSON-RPC error message
        message: String,
    },

    /// A request did not receive a response in time
    #[error("Request {method} timed out")]
    RequestTimeout {
        /// JSON-RPC method name
        method: String,
    },

    /// The operation needs a live session and there is none
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// The token provider could not produce a token
    #[error("Token provider error: {0}")]
    TokenProvider(String),
}

impl McpConnError {
    /// Normalize an arbitrary error into the connection manager taxonomy.
    ///
    /// Errors that already carry an [`McpConnError`] are returned as-is.
    /// Transport library errors become [`McpConnError::GenericTransport`];
    /// unstructured messages are inspected for the idle-close marker and
    /// the `401` marker, which is the only information some transports
    /// give about an authentication failure.
    ///
    /// # Examples
    ///
    /// ```
    /// use mcpconn::error::McpConnError;
    ///
    /// let err = anyhow::anyhow!("SSE error: Non-200 status code (401)");
    /// assert!(McpConnError::classify(&err).is_auth_challenge());
    /// ```
    pub fn classify(err: &anyhow::Error) -> Self {
        if let Some(known) = err.downcast_ref::<McpConnError>() {
            return known.clone();
        }
        if let Some(json) = err.downcast_ref::<serde_json::Error>() {
            return McpConnError::Protocol(json.to_string());
        }
        Self::from_message(format!("{err:#}"))
    }

    /// Classify a bare message using the unstructured heuristics only.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        if message.contains(IDLE_CLOSE_MARKER) {
            McpConnError::IdleTimeoutClose(message)
        } else if message.contains("401") {
            McpConnError::AuthChallenge {
                status: None,
                message,
            }
        } else {
            McpConnError::GenericTransport(message)
        }
    }

    /// Returns `true` for 401/403 style challenges.
    pub fn is_auth_challenge(&self) -> bool {
        matches!(self, McpConnError::AuthChallenge { .. })
    }

    /// Returns `true` for errors that should refresh the provider token.
    pub fn is_potential_token(&self) -> bool {
        matches!(self, McpConnError::PotentialToken(_))
    }

    /// Returns `true` for benign idle closes.
    pub fn is_idle_close(&self) -> bool {
        matches!(self, McpConnError::IdleTimeoutClose(_))
    }

    /// Returns `true` when retrying can never help.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            McpConnError::TransportConstruction(_) | McpConnError::Config(_)
        )
    }

    /// Returns `true` when the failure consumes one reconnect attempt.
    pub fn counts_against_reconnect_budget(&self) -> bool {
        !(self.is_auth_challenge() || self.is_potential_token() || self.is_idle_close())
    }
}

/// Result type alias for mcpconn operations
///
/// This is a convenience alias that uses `anyhow::Error` as the error type,
/// allowing for rich error context and easy error propagation.
pub type Result<T> = anyhow::Result<T>;
