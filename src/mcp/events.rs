//! Connection lifecycle events
//!
//! Every [`crate::mcp::connection::Connection`] publishes [`ConnectionEvent`]s
//! on a broadcast channel; the registry re-publishes them tagged with the
//! server name and user id.

use std::fmt;

use serde::Serialize;

use crate::config::OAuthSettings;
use crate::error::McpConnError;

/// Connection state.
///
/// `Disconnected -> Connecting -> Connected -> (Error | Disconnected)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No transport held
    #[default]
    Disconnected,
    /// A connect attempt is in flight
    Connecting,
    /// Handshake complete
    Connected,
    /// The last attempt or the live session failed
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Payload of [`ConnectionEvent::OAuthRequired`].
#[derive(Debug, Clone)]
pub struct OAuthRequiredEvent {
    /// Server that demanded authentication
    pub server_name: String,
    /// Owning user, for per-user connections
    pub user_id: Option<String>,
    /// URL of the server, for network transports
    pub server_url: Option<String>,
    /// Static OAuth parameters from the server config
    pub oauth: Option<OAuthSettings>,
    /// The challenge that triggered the flow
    pub error: McpConnError,
}

/// Something that happened to a connection.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The state changed
    ConnectionChange(ConnectionState),
    /// A failure worth surfacing
    Error(McpConnError),
    /// An OAuth flow must be completed out of band
    OAuthRequired(OAuthRequiredEvent),
    /// The OAuth flow completed
    OAuthHandled,
    /// The OAuth flow failed or timed out
    OAuthFailed(McpConnError),
    /// The server sent `notifications/resources/list_changed`
    ResourcesChanged,
    /// The server sent `notifications/tools/list_changed`
    ToolsChanged,
    /// The server sent `notifications/prompts/list_changed`
    PromptsChanged,
}

impl ConnectionEvent {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionEvent::ConnectionChange(_) => "connectionChange",
            ConnectionEvent::Error(_) => "error",
            ConnectionEvent::OAuthRequired(_) => "oauthRequired",
            ConnectionEvent::OAuthHandled => "oauthHandled",
            ConnectionEvent::OAuthFailed(_) => "oauthFailed",
            ConnectionEvent::ResourcesChanged => "resourcesChanged",
            ConnectionEvent::ToolsChanged => "toolsChanged",
            ConnectionEvent::PromptsChanged => "promptsChanged",
        }
    }
}
