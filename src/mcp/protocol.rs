//! Typed MCP lifecycle wrapper over [`JsonRpcClient`]
//!
//! Two types represent the two phases of an MCP client session:
//!
//! - [`McpProtocol`] -- an uninitialized client. Call [`McpProtocol::initialize`]
//!   to perform the `initialize` / `notifications/initialized` handshake and
//!   receive an [`InitializedMcpProtocol`].
//! - [`InitializedMcpProtocol`] -- a negotiated session exposing `tools/*`,
//!   `resources/list`, `prompts/list` and `ping` as typed async methods.
//!
//! `list_tools`, `list_resources` and `list_prompts` follow `nextCursor`
//! until the server stops returning one.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::error::{McpConnError, Result};
use crate::mcp::client::JsonRpcClient;
use crate::mcp::types::{
    CallToolParams, CallToolResponse, ClientCapabilities, Implementation, InitializeParams,
    InitializeResponse, ListPromptsResponse, ListResourcesResponse, ListToolsResponse, McpTool,
    PaginatedParams, Prompt, Resource, LATEST_PROTOCOL_VERSION, METHOD_INITIALIZE,
    METHOD_INITIALIZED, METHOD_PING, METHOD_PROMPTS_LIST, METHOD_RESOURCES_LIST,
    METHOD_TOOLS_CALL, METHOD_TOOLS_LIST, SUPPORTED_PROTOCOL_VERSIONS,
};

/// Identifies a capability a server may advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerCapabilityFlag {
    /// `tools/list` and `tools/call`
    Tools,
    /// `resources/list`
    Resources,
    /// `prompts/list`
    Prompts,
    /// Log notifications
    Logging,
    /// Anything under `experimental`
    Experimental,
}

/// An uninitialized MCP client session.
#[derive(Debug)]
pub struct McpProtocol {
    client: Arc<JsonRpcClient>,
}

impl McpProtocol {
    /// Wrap a client whose read loop is already running.
    pub fn new(client: Arc<JsonRpcClient>) -> Self {
        Self { client }
    }

    /// Perform the MCP handshake.
    ///
    /// Sends `initialize`, checks that the server picked a version in
    /// [`SUPPORTED_PROTOCOL_VERSIONS`], then sends
    /// `notifications/initialized`.
    ///
    /// # Errors
    ///
    /// - Any error from the `initialize` request itself, unchanged (a 401
    ///   surfaces here as [`McpConnError::AuthChallenge`]).
    /// - [`McpConnError::Protocol`] for an unsupported protocol version.
    pub async fn initialize(
        self,
        client_info: Implementation,
        capabilities: ClientCapabilities,
        timeout: Option<Duration>,
    ) -> Result<InitializedMcpProtocol> {
        let response: InitializeResponse = self
            .client
            .request(
                METHOD_INITIALIZE,
                InitializeParams {
                    protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
                    capabilities,
                    client_info,
                },
                timeout,
            )
            .await?;

        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&response.protocol_version.as_str()) {
            return Err(McpConnError::Protocol(format!(
                "server selected unsupported protocol version {} (supported: {})",
                response.protocol_version,
                SUPPORTED_PROTOCOL_VERSIONS.join(", ")
            ))
            .into());
        }

        if let Err(e) = self
            .client
            .notify(METHOD_INITIALIZED, serde_json::json!({}))
            .await
        {
            tracing::debug!("initialized notification failed: {e}");
        }

        tracing::debug!(
            server = %response.server_info.name,
            version = %response.protocol_version,
            "MCP session initialized"
        );

        Ok(InitializedMcpProtocol {
            client: self.client,
            initialize_response: response,
        })
    }
}

/// A negotiated MCP client session.
#[derive(Debug)]
pub struct InitializedMcpProtocol {
    /// The underlying JSON-RPC client.
    pub client: Arc<JsonRpcClient>,
    /// The server's response to the `initialize` request.
    pub initialize_response: InitializeResponse,
}

impl InitializedMcpProtocol {
    /// Check whether the server advertised `capability`.
    pub fn capable(&self, capability: ServerCapabilityFlag) -> bool {
        let caps = &self.initialize_response.capabilities;
        match capability {
            ServerCapabilityFlag::Tools => caps.tools.is_some(),
            ServerCapabilityFlag::Resources => caps.resources.is_some(),
            ServerCapabilityFlag::Prompts => caps.prompts.is_some(),
            ServerCapabilityFlag::Logging => caps.logging.is_some(),
            ServerCapabilityFlag::Experimental => caps.experimental.is_some(),
        }
    }

    /// List every tool, following pagination.
    pub async fn list_tools(&self) -> Result<Vec<McpTool>> {
        self.paginate(METHOD_TOOLS_LIST, |page: ListToolsResponse| {
            (page.tools, page.next_cursor)
        })
        .await
    }

    /// List every resource, following pagination.
    pub async fn list_resources(&self) -> Result<Vec<Resource>> {
        self.paginate(METHOD_RESOURCES_LIST, |page: ListResourcesResponse| {
            (page.resources, page.next_cursor)
        })
        .await
    }

    /// List every prompt, following pagination.
    pub async fn list_prompts(&self) -> Result<Vec<Prompt>> {
        self.paginate(METHOD_PROMPTS_LIST, |page: ListPromptsResponse| {
            (page.prompts, page.next_cursor)
        })
        .await
    }

    /// Invoke a named tool.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server answers with a
    /// JSON-RPC error. A tool-level failure is reported through
    /// [`CallToolResponse::is_error`] instead.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<serde_json::Value>,
        timeout: Option<Duration>,
    ) -> Result<CallToolResponse> {
        self.client
            .request(
                METHOD_TOOLS_CALL,
                CallToolParams {
                    name: name.to_string(),
                    arguments,
                },
                timeout,
            )
            .await
    }

    /// Send `ping` and wait for the empty result.
    pub async fn ping(&self, timeout: Option<Duration>) -> Result<()> {
        let _: serde_json::Value = self
            .client
            .request(METHOD_PING, serde_json::json!({}), timeout)
            .await?;
        Ok(())
    }

    async fn paginate<Page, Item>(
        &self,
        method: &str,
        split: impl Fn(Page) -> (Vec<Item>, Option<String>),
    ) -> Result<Vec<Item>>
    where
        Page: DeserializeOwned,
    {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let page: Page = self
                .client
                .request(method, PaginatedParams { cursor }, None)
                .await?;
            let (batch, next) = split(page);
            items.extend(batch);

            match next {
                Some(c) if !c.is_empty() => cursor = Some(c),
                _ => break,
            }
        }

        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::client::start_read_loop;
    use crate::mcp::transport::fake::{default_responder, FakeTransport, FakeTransportHandle, Responder};
    use crate::mcp::transport::Transport;
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn protocol_over(transport: FakeTransport) -> McpProtocol {
        let transport: Arc<dyn Transport> = Arc::new(transport);
        let client = Arc::new(JsonRpcClient::new(Arc::clone(&transport)));
        let (lifecycle_tx, _lifecycle_rx) = mpsc::unbounded_channel();
        start_read_loop(
            transport.receive(),
            CancellationToken::new(),
            Arc::clone(&client),
            lifecycle_tx,
        );
        McpProtocol::new(client)
    }

    async fn initialize(transport: FakeTransport) -> Result<InitializedMcpProtocol> {
        protocol_over(transport)
            .initialize(
                Implementation::this_client(),
                ClientCapabilities::default(),
                None,
            )
            .await
    }

    fn with_version(version: &'static str) -> (FakeTransport, FakeTransportHandle) {
        let fallback = default_responder();
        let responder: Responder = Arc::new(move |method, params| {
            if method == "initialize" {
                return Some(Ok(json!({
                    "protocolVersion": version,
                    "capabilities": {},
                    "serverInfo": { "name": "v", "version": "1" }
                })));
            }
            fallback(method, params)
        });
        FakeTransport::with_responder(responder)
    }

    #[tokio::test]
    async fn test_initialize_succeeds_and_sends_initialized() {
        let (transport, mut handle) = FakeTransport::new();
        let session = initialize(transport).await.unwrap();
        assert!(session.capable(ServerCapabilityFlag::Tools));
        assert!(!session.capable(ServerCapabilityFlag::Prompts));
        assert_eq!(
            handle.sent_methods(),
            vec!["initialize".to_string(), "notifications/initialized".to_string()]
        );
    }

    #[tokio::test]
    async fn test_initialize_accepts_older_supported_version() {
        let (transport, _handle) = with_version("2024-11-05");
        assert!(initialize(transport).await.is_ok());
    }

    #[tokio::test]
    async fn test_initialize_rejects_unsupported_protocol_version() {
        let (transport, _handle) = with_version("1999-01-01");
        let err = initialize(transport).await.unwrap_err();
        assert!(matches!(
            McpConnError::classify(&err),
            McpConnError::Protocol(msg) if msg.contains("1999-01-01")
        ));
    }

    #[tokio::test]
    async fn test_initialize_surfaces_auth_challenge() {
        let (transport, _handle) = FakeTransport::failing(McpConnError::AuthChallenge {
            status: Some(401),
            message: "Bearer".into(),
        });
        let err = initialize(transport).await.unwrap_err();
        assert!(McpConnError::classify(&err).is_auth_challenge());
    }

    #[tokio::test]
    async fn test_list_tools_follows_cursor_pagination() {
        let fallback = default_responder();
        let responder: Responder = Arc::new(move |method, params| {
            if method != "tools/list" {
                return fallback(method, params);
            }
            let page = match params.get("cursor").and_then(|c| c.as_str()) {
                None => json!({
                    "tools": [{ "name": "a" }],
                    "nextCursor": "p2"
                }),
                Some("p2") => json!({
                    "tools": [{ "name": "b" }, { "name": "c" }],
                    "nextCursor": ""
                }),
                Some(_) => json!({ "tools": [] }),
            };
            Some(Ok(page))
        });
        let (transport, _handle) = FakeTransport::with_responder(responder);
        let session = initialize(transport).await.unwrap();

        let names: Vec<_> = session
            .list_tools()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_lists_resources_prompts_and_calls_tool() {
        let (transport, _handle) = FakeTransport::new();
        let session = initialize(transport).await.unwrap();

        assert_eq!(session.list_resources().await.unwrap()[0].name, "readme");
        assert_eq!(session.list_prompts().await.unwrap()[0].name, "greet");
        let result = session
            .call_tool("echo", Some(json!({ "text": "hi" })), None)
            .await
            .unwrap();
        assert_eq!(result.text(), "hi");
        session.ping(None).await.unwrap();
    }
}
