//! Access tokens, the token-provider capability and the refresh policy
//!
//! A [`TokenRecord`] is owned by a connection. It comes either from the
//! connector [`TokenProvider`] ([`TokenSource::Provider`]) or from an
//! interactive OAuth flow completed out of band ([`TokenSource::OAuth`]).
//! Only the latter is discarded on disconnect.

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{McpConnError, Result};

/// Refresh when less than this much lifetime remains.
pub const EXPIRY_BUFFER_MINUTES: i64 = 5;

/// Refresh when the last refresh is older than this.
pub const MAX_TOKEN_AGE_MINUTES: i64 = 50;

/// An access token as issued by a token endpoint.
///
/// # Examples
///
/// ```
/// use mcpconn::mcp::auth::token::TokenRecord;
///
/// let token = TokenRecord::new("abc", "bearer", Some(3600));
/// assert_eq!(token.authorization_header(), "Bearer abc");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    /// The access token string
    pub access_token: String,

    /// Token type, normally `Bearer`
    #[serde(default = "default_token_type")]
    pub token_type: String,

    /// When the token was obtained
    pub obtained_at: DateTime<Utc>,

    /// Lifetime in seconds from `obtained_at`; `None` means unknown
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl TokenRecord {
    /// Token obtained now.
    pub fn new(
        access_token: impl Into<String>,
        token_type: impl Into<String>,
        expires_in: Option<u64>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            token_type: token_type.into(),
            obtained_at: Utc::now(),
            expires_in,
        }
    }

    /// Value for the `Authorization` header.
    ///
    /// The scheme is normalized to `Bearer` regardless of the case the
    /// token endpoint used.
    pub fn authorization_header(&self) -> String {
        let scheme = if self.token_type.is_empty() || self.token_type.eq_ignore_ascii_case("bearer")
        {
            "Bearer"
        } else {
            self.token_type.as_str()
        };
        format!("{} {}", scheme, self.access_token)
    }

    /// Absolute expiry, when the lifetime is known.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let secs = i64::try_from(self.expires_in?).unwrap_or(i64::MAX);
        self.obtained_at.checked_add_signed(Duration::seconds(secs))
    }

    /// Lifetime remaining at `now` (negative once expired).
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.expires_at().map(|at| at - now)
    }
}

/// Where a cached token came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    /// The connector token provider; survives disconnect
    Provider,
    /// An interactive OAuth flow; discarded on disconnect
    OAuth,
}

/// Capability that issues access tokens for the connector platform.
///
/// Injected by the registry so connections never look a provider up at
/// runtime.
#[async_trait::async_trait]
pub trait TokenProvider: Send + Sync + std::fmt::Debug {
    /// Current access token. `None` when the provider has no credentials.
    ///
    /// # Errors
    ///
    /// [`McpConnError::TokenProvider`] when the token endpoint fails.
    async fn get_access_token(&self) -> Result<Option<TokenRecord>>;

    /// Forget any cached token so the next call fetches a new one.
    async fn clear_token_cache(&self);
}

/// Decides when a connector token must be refreshed.
#[derive(Debug, Clone, Copy)]
pub struct RefreshPolicy {
    /// Refresh when less than this lifetime remains
    pub expiry_buffer: Duration,
    /// Refresh when the last refresh is older than this
    pub max_age: Duration,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            expiry_buffer: Duration::minutes(EXPIRY_BUFFER_MINUTES),
            max_age: Duration::minutes(MAX_TOKEN_AGE_MINUTES),
        }
    }
}

impl RefreshPolicy {
    /// Returns `true` when a refresh is due.
    ///
    /// A connection that has never refreshed always refreshes, even when a
    /// token was supplied externally.
    ///
    /// # Examples
    ///
    /// ```
    /// use chrono::{Duration, Utc};
    /// use mcpconn::mcp::auth::token::{RefreshPolicy, TokenRecord};
    ///
    /// let policy = RefreshPolicy::default();
    /// let now = Utc::now();
    /// let mut token = TokenRecord::new("t", "Bearer", Some(3600));
    /// token.obtained_at = now - Duration::minutes(56);
    ///
    /// assert!(policy.should_refresh(Some(&token), Some(now), now));
    /// assert!(policy.should_refresh(None, None, now));
    /// ```
    pub fn should_refresh(
        &self,
        token: Option<&TokenRecord>,
        last_refresh: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(last_refresh) = last_refresh else {
            return true;
        };
        if now - last_refresh > self.max_age {
            return true;
        }
        match token.and_then(|t| t.remaining(now)) {
            Some(remaining) => remaining < self.expiry_buffer,
            None => token.is_none(),
        }
    }
}

/// Recognizes URLs served by the connector platform.
///
/// Patterns are host names; a leading `*.` matches exactly one extra label.
#[derive(Debug, Clone)]
pub struct ConnectorMatcher {
    patterns: Vec<Regex>,
}

impl ConnectorMatcher {
    /// Compile `host_patterns`.
    ///
    /// # Errors
    ///
    /// [`McpConnError::Config`] for an empty pattern.
    pub fn new(host_patterns: &[String]) -> Result<Self> {
        let patterns = host_patterns
            .iter()
            .map(|pattern| {
                let pattern = pattern.trim();
                if pattern.is_empty() {
                    return Err(McpConnError::Config("empty connector host pattern".into()).into());
                }
                let body = match pattern.strip_prefix("*.") {
                    Some(rest) => format!(r"[^.]+\.{}", regex::escape(rest)),
                    None => regex::escape(pattern),
                };
                Regex::new(&format!("(?i)^{body}$")).map_err(|e| {
                    McpConnError::Config(format!("invalid connector host pattern '{pattern}': {e}"))
                        .into()
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    /// Returns `true` if the host of `url` matches any pattern.
    pub fn matches(&self, url: &url::Url) -> bool {
        url.host_str()
            .is_some_and(|host| self.patterns.iter().any(|p| p.is_match(host)))
    }
}
