//! Streamable HTTP connections against a wiremock tool server
//!
//! Covers configured headers, the OAuth challenge round trip, and the
//! connector token provider (proactive fetch plus refresh-and-retry after a
//! probable token error).

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use mcpconn::config::{Config, ConnectorConfig, ServerConfig, TransportKind};
use mcpconn::mcp::auth::token::TokenRecord;
use mcpconn::mcp::connection::{Connection, ConnectionDeps, ConnectionOptions};
use mcpconn::mcp::events::{ConnectionEvent, ConnectionState};
use mcpconn::mcp::registry::ConnectionRegistry;
use mcpconn::mcp::transport::DefaultTransportFactory;
use mcpconn::McpConnError;

use common::McpResponder;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn remote(server: &MockServer) -> ServerConfig {
    ServerConfig {
        transport: Some(TransportKind::StreamableHttp),
        url: Some(format!("{}/mcp", server.uri())),
        ..ServerConfig::default()
    }
}

fn connection(config: &ServerConfig, oauth_timeout: Duration) -> Arc<Connection> {
    Connection::new(
        "remote",
        Some("u1".into()),
        config,
        ConnectionOptions {
            connect_timeout: Duration::from_secs(10),
            oauth_timeout,
            ..ConnectionOptions::default()
        },
        ConnectionDeps::new(Arc::new(DefaultTransportFactory)),
    )
}

async fn mount_unauthorized(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .respond_with(
            ResponseTemplate::new(401).insert_header("WWW-Authenticate", "Bearer realm=\"tools\""),
        )
        .mount(server)
        .await;
}

fn connector_config(tool_server: &MockServer, token_server: &MockServer) -> Config {
    let mut config = Config::default();
    config.connector = Some(ConnectorConfig {
        host_patterns: vec!["127.0.0.1".into()],
        token_url: format!("{}/oauth/token", token_server.uri()),
        client_id: "cid".into(),
        client_secret: "csecret".into(),
        scope: None,
    });
    config.servers = BTreeMap::from([("remote".to_string(), remote(tool_server))]);
    config
}

async fn mount_token_endpoint(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "connector-token",
            "token_type": "bearer",
            "expires_in": 3600
        })))
        .mount(server)
        .await;
}

async fn token_requests(server: &MockServer) -> usize {
    server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == "/oauth/token")
        .count()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_http_connect_sends_configured_headers() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(header("X-Api-Key", "k-123"))
        .respond_with(McpResponder)
        .mount(&server)
        .await;

    let mut config = remote(&server);
    config.headers.insert("X-Api-Key".into(), "k-123".into());
    let conn = connection(&config, Duration::from_secs(5));

    conn.connect().await.unwrap();
    let tools = conn.fetch_tools().await;
    assert_eq!(tools[0].name, "search");
    let result = conn.call_tool("search", None).await.unwrap();
    assert_eq!(result.text(), "found");
    conn.disconnect().await;
}

#[tokio::test]
async fn test_http_oauth_challenge_then_handled() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(header("Authorization", "Bearer user-token"))
        .respond_with(McpResponder)
        .mount(&server)
        .await;
    mount_unauthorized(&server).await;

    let conn = connection(&remote(&server), Duration::from_secs(10));
    let mut events = conn.subscribe();
    let pending = {
        let conn = Arc::clone(&conn);
        tokio::spawn(async move { conn.connect().await })
    };

    let required = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(ConnectionEvent::OAuthRequired(event)) = events.recv().await {
                return event;
            }
        }
    })
    .await
    .expect("oauthRequired event");
    assert_eq!(required.user_id.as_deref(), Some("u1"));
    assert_eq!(
        required.error,
        McpConnError::AuthChallenge {
            status: Some(401),
            message: "Bearer realm=\"tools\"".into()
        }
    );

    conn.oauth_handled(Some(TokenRecord::new("user-token", "Bearer", Some(3600))))
        .await;
    pending.await.unwrap().unwrap();
    assert_eq!(conn.state(), ConnectionState::Connected);
    conn.disconnect().await;
}

#[tokio::test]
async fn test_http_oauth_timeout() {
    let server = MockServer::start().await;
    mount_unauthorized(&server).await;

    let conn = connection(&remote(&server), Duration::from_millis(200));
    let mut events = conn.subscribe();
    let err = conn.connect().await.unwrap_err();
    assert!(matches!(
        McpConnError::classify(&err),
        McpConnError::AuthChallenge {
            status: Some(401),
            ..
        }
    ));
    let mut timed_out = false;
    while let Ok(event) = events.try_recv() {
        if let ConnectionEvent::OAuthFailed(McpConnError::OAuthTimeout { .. }) = event {
            timed_out = true;
        }
    }
    assert!(timed_out);
    assert!(!conn.oauth_required());
    assert_eq!(conn.state(), ConnectionState::Error);
}

#[tokio::test]
async fn test_connector_token_injected() {
    let tool_server = MockServer::start().await;
    let token_server = MockServer::start().await;
    mount_token_endpoint(&token_server).await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(header("Authorization", "Bearer connector-token"))
        .respond_with(McpResponder)
        .mount(&tool_server)
        .await;

    let config = connector_config(&tool_server, &token_server);
    let registry = ConnectionRegistry::from_config(&config).unwrap();
    let outcomes = registry.connect_global(&config.servers).await;

    assert_eq!(outcomes["remote"], Ok(()));
    assert_eq!(token_requests(&token_server).await, 1);
    registry.disconnect_all(None).await;
}

#[tokio::test]
async fn test_connector_potential_token_error_retries_once() {
    let tool_server = MockServer::start().await;
    let token_server = MockServer::start().await;
    mount_token_endpoint(&token_server).await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(body_partial_json(serde_json::json!({ "method": "initialize" })))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream rejected token"))
        .up_to_n_times(1)
        .mount(&tool_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .respond_with(McpResponder)
        .mount(&tool_server)
        .await;

    let config = connector_config(&tool_server, &token_server);
    let registry = ConnectionRegistry::from_config(&config).unwrap();
    let outcomes = registry.connect_global(&config.servers).await;

    assert_eq!(outcomes["remote"], Ok(()));
    assert_eq!(token_requests(&token_server).await, 2);
    registry.disconnect_all(None).await;
}

#[tokio::test]
async fn test_server_error_without_connector_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .respond_with(ResponseTemplate::new(500).set_body_string("invalid token"))
        .mount(&server)
        .await;

    let conn = connection(&remote(&server), Duration::from_secs(5));
    let err = conn.connect().await.unwrap_err();
    assert_eq!(
        McpConnError::classify(&err),
        McpConnError::HttpStatus {
            status: 500,
            body: "invalid token".into()
        }
    );
}
