//! Client-credentials token provider for the connector platform
//!
//! [`HttpTokenProvider`] exchanges the configured client id and secret for
//! an access token at the connector's token endpoint and caches it until it
//! is within the refresh buffer of expiry.

use chrono::Utc;
use tokio::sync::Mutex;

use crate::config::ConnectorConfig;
use crate::error::{McpConnError, Result};
use crate::mcp::auth::token::{RefreshPolicy, TokenProvider, TokenRecord};

/// Raw JSON response from the token endpoint.
#[derive(Debug, serde::Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

impl TokenResponse {
    fn into_record(self) -> TokenRecord {
        TokenRecord::new(
            self.access_token,
            self.token_type.unwrap_or_else(|| "Bearer".to_string()),
            self.expires_in,
        )
    }
}

/// Token provider backed by an OAuth `client_credentials` grant.
///
/// # Examples
///
/// ```no_run
/// use mcpconn::config::ConnectorConfig;
/// use mcpconn::mcp::auth::provider::HttpTokenProvider;
/// use mcpconn::mcp::auth::token::TokenProvider;
///
/// # async fn example() -> mcpconn::error::Result<()> {
/// let provider = HttpTokenProvider::new(&ConnectorConfig {
///     host_patterns: vec!["remote.mcp.pipedream.net".into()],
///     token_url: "https://api.pipedream.com/v1/oauth/token".into(),
///     client_id: "id".into(),
///     client_secret: "secret".into(),
///     scope: None,
/// })?;
/// let token = provider.get_access_token().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct HttpTokenProvider {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    scope: Option<String>,
    policy: RefreshPolicy,
    cache: Mutex<Option<TokenRecord>>,
}

impl HttpTokenProvider {
    /// Build a provider from the connector section of the config.
    ///
    /// # Errors
    ///
    /// [`McpConnError::Config`] if the HTTP client cannot be built.
    pub fn new(config: &ConnectorConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| McpConnError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            token_url: config.token_url.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            scope: config.scope.clone(),
            policy: RefreshPolicy::default(),
            cache: Mutex::new(None),
        })
    }

    async fn fetch(&self) -> Result<TokenRecord> {
        let mut params = vec![
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];
        if let Some(scope) = &self.scope {
            params.push(("scope", scope.as_str()));
        }

        let resp = self
            .http
            .post(&self.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| McpConnError::TokenProvider(format!("token request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(McpConnError::TokenProvider(format!(
                "token endpoint returned {status}: {body}"
            ))
            .into());
        }

        let raw: TokenResponse = resp.json().await.map_err(|e| {
            McpConnError::TokenProvider(format!("failed to parse token response: {e}"))
        })?;
        Ok(raw.into_record())
    }
}

#[async_trait::async_trait]
impl TokenProvider for HttpTokenProvider {
    async fn get_access_token(&self) -> Result<Option<TokenRecord>> {
        let mut cache = self.cache.lock().await;
        if let Some(token) = cache.as_ref() {
            let usable = token
                .remaining(Utc::now())
                .map_or(true, |left| left >= self.policy.expiry_buffer);
            if usable {
                return Ok(Some(token.clone()));
            }
        }

        let token = self.fetch().await?;
        tracing::debug!(token_url = %self.token_url, expires_in = ?token.expires_in, "Fetched connector token");
        *cache = Some(token.clone());
        Ok(Some(token))
    }

    async fn clear_token_cache(&self) {
        self.cache.lock().await.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider_for(server: &MockServer) -> HttpTokenProvider {
        HttpTokenProvider::new(&ConnectorConfig {
            host_patterns: vec!["remote.example.com".into()],
            token_url: format!("{}/oauth/token", server.uri()),
            client_id: "cid".into(),
            client_secret: "csecret".into(),
            scope: None,
        })
        .unwrap()
    }

    async fn mount_token(server: &MockServer, token: &str, expires_in: u64) {
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(body_string_contains("grant_type=client_credentials"))
            .and(body_string_contains("client_id=cid"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": token,
                "token_type": "bearer",
                "expires_in": expires_in
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_fetches_and_caches_token() {
        let server = MockServer::start().await;
        mount_token(&server, "tok-1", 3600).await;
        let provider = provider_for(&server);

        let first = provider.get_access_token().await.unwrap().unwrap();
        let second = provider.get_access_token().await.unwrap().unwrap();
        assert_eq!(first.access_token, "tok-1");
        assert_eq!(first, second);
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_clear_cache_forces_refetch() {
        let server = MockServer::start().await;
        mount_token(&server, "tok-1", 3600).await;
        let provider = provider_for(&server);

        provider.get_access_token().await.unwrap();
        provider.clear_token_cache().await;
        provider.get_access_token().await.unwrap();
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_token_inside_buffer_is_refetched() {
        let server = MockServer::start().await;
        mount_token(&server, "short", 60).await;
        let provider = provider_for(&server);

        provider.get_access_token().await.unwrap();
        provider.get_access_token().await.unwrap();
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_endpoint_failure_is_token_provider_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad client"))
            .mount(&server)
            .await;
        let provider = provider_for(&server);

        let err = provider.get_access_token().await.unwrap_err();
        assert!(matches!(
            McpConnError::classify(&err),
            McpConnError::TokenProvider(msg) if msg.contains("bad client")
        ));
    }
}
