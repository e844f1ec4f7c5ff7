//! Streamable HTTP transport
//!
//! This module implements [`HttpTransport`]. Every outbound JSON-RPC message
//! is sent as an HTTP POST. The server may reply with:
//!
//! - `application/json` -- a direct JSON response body
//! - `text/event-stream` -- an event stream carrying one or more JSON-RPC
//!   messages
//! - `202 Accepted` -- an acknowledgement with no body (notifications)
//!
//! # Session management
//!
//! The server MAY return an `Mcp-Session-Id` header on the `initialize`
//! response. When present it is attached to every subsequent POST and a
//! `DELETE` is issued on [`Transport::close`]. A `404` while a session is
//! active clears the session and fails the request.
//!
//! # Authentication
//!
//! Headers are read from the shared map on every request. `401` and `403`
//! become [`McpConnError::AuthChallenge`]; every other non-success status
//! becomes [`McpConnError::HttpStatus`] with the (truncated) body.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, RwLock};

use crate::config::TransportKind;
use crate::error::{McpConnError, Result};
use crate::mcp::transport::event_stream::forward_message_events;
use crate::mcp::transport::{
    shared_receiver_stream, EventStream, SharedHeaders, Transport, TransportEvent,
};

/// Protocol version header sent on every POST.
const MCP_PROTOCOL_VERSION: &str = crate::mcp::types::LATEST_PROTOCOL_VERSION;

/// Session header name.
const SESSION_HEADER: &str = "Mcp-Session-Id";

/// Longest response body carried inside an error.
const MAX_ERROR_BODY: usize = 512;

/// Build the shared reqwest client used by the HTTP-based transports.
pub(crate) fn build_client(timeout: Option<Duration>) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder();
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    builder.build().map_err(|e| {
        McpConnError::TransportConstruction(format!("failed to build HTTP client: {e}")).into()
    })
}

/// Apply every shared header to `req`.
pub(crate) async fn apply_headers(
    mut req: reqwest::RequestBuilder,
    headers: &SharedHeaders,
) -> reqwest::RequestBuilder {
    for (k, v) in headers.read().await.iter() {
        req = req.header(k.as_str(), v.as_str());
    }
    req
}

/// Map a non-success response onto the error taxonomy.
///
/// `401`/`403` carry the `WWW-Authenticate` header (or the body when the
/// header is absent) so the OAuth flow can inspect it.
pub(crate) async fn error_for_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let code = status.as_u16();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        let www_auth = response
            .headers()
            .get("WWW-Authenticate")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let message = match www_auth {
            Some(value) => value,
            None => truncate(response.text().await.unwrap_or_default()),
        };
        return Err(McpConnError::AuthChallenge {
            status: Some(code),
            message,
        }
        .into());
    }

    let body = truncate(response.text().await.unwrap_or_default());
    Err(McpConnError::HttpStatus { status: code, body }.into())
}

fn truncate(mut body: String) -> String {
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    body
}

/// Streamable HTTP transport.
///
/// # Examples
///
/// ```no_run
/// use std::time::Duration;
/// use mcpconn::mcp::transport::http::HttpTransport;
///
/// let transport = HttpTransport::new(
///     url::Url::parse("http://localhost:3000/mcp").unwrap(),
///     Default::default(),
///     Duration::from_secs(30),
/// )
/// .unwrap();
/// ```
#[derive(Debug)]
pub struct HttpTransport {
    http_client: reqwest::Client,
    /// POST target
    endpoint: url::Url,
    /// Headers read on every request (carries `Authorization`)
    headers: SharedHeaders,
    /// Active session id, populated after `initialize`
    session_id: Arc<RwLock<Option<String>>>,
    /// Last event id seen on any event-stream body
    last_event_id: Arc<RwLock<Option<String>>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Arc<Mutex<mpsc::UnboundedReceiver<TransportEvent>>>,
}

impl HttpTransport {
    /// Construct a transport targeting `endpoint`. No network I/O happens
    /// until the first `send`.
    ///
    /// # Errors
    ///
    /// Returns [`McpConnError::TransportConstruction`] if the HTTP client
    /// cannot be built.
    pub fn new(endpoint: url::Url, headers: SharedHeaders, timeout: Duration) -> Result<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Self {
            http_client: build_client(Some(timeout))?,
            endpoint,
            headers,
            session_id: Arc::new(RwLock::new(None)),
            last_event_id: Arc::new(RwLock::new(None)),
            events_tx,
            events_rx: Arc::new(Mutex::new(events_rx)),
        })
    }

    /// The active session id, if the server issued one.
    pub async fn session_id(&self) -> Option<String> {
        self.session_id.read().await.clone()
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::StreamableHttp
    }

    async fn send(&self, message: String) -> Result<()> {
        let mut req = self
            .http_client
            .post(self.endpoint.as_str())
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .header("MCP-Protocol-Version", MCP_PROTOCOL_VERSION)
            .body(message);

        if let Some(id) = self.session_id.read().await.as_deref() {
            req = req.header(SESSION_HEADER, id);
        }
        if let Some(id) = self.last_event_id.read().await.as_deref() {
            req = req.header("Last-Event-ID", id);
        }
        req = apply_headers(req, &self.headers).await;

        let response = req.send().await.map_err(|e| {
            McpConnError::from_message(format!("HTTP POST to {} failed: {}", self.endpoint, e))
        })?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            let had_session = self.session_id.write().await.take().is_some();
            if had_session {
                return Err(McpConnError::GenericTransport("session expired".into()).into());
            }
        }

        if response.status() == reqwest::StatusCode::ACCEPTED {
            return Ok(());
        }

        let response = error_for_status(response).await?;

        if let Some(new_session_id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let mut sid = self.session_id.write().await;
            if sid.is_none() {
                *sid = Some(new_session_id.to_string());
            }
        }

        let content_type = response
            .headers()
            .get("Content-Type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.contains("text/event-stream") {
            let events_tx = self.events_tx.clone();
            let last_event_id = Arc::clone(&self.last_event_id);
            tokio::spawn(forward_message_events(
                response.bytes_stream(),
                events_tx,
                last_event_id,
            ));
        } else {
            let body = response.text().await.map_err(|e| {
                McpConnError::from_message(format!("failed to read response body: {}", e))
            })?;
            if !body.trim().is_empty() {
                let _ = self.events_tx.send(TransportEvent::Message(body));
            }
        }

        Ok(())
    }

    fn receive(&self) -> EventStream {
        shared_receiver_stream(Arc::clone(&self.events_rx))
    }

    /// Terminate the server session, if any, with a `DELETE`.
    async fn close(&self) -> Result<()> {
        let Some(session_id) = self.session_id.write().await.take() else {
            return Ok(());
        };
        let req = self
            .http_client
            .delete(self.endpoint.as_str())
            .header(SESSION_HEADER, session_id);
        let req = apply_headers(req, &self.headers).await;
        if let Err(e) = req.send().await {
            tracing::debug!(endpoint = %self.endpoint, "Session DELETE failed: {}", e);
        }
        Ok(())
    }
}
