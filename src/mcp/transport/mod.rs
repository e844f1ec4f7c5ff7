//! Tool-server transport abstraction and implementations
//!
//! This module defines the [`Transport`] trait that every wire protocol
//! implements, the [`TransportEvent`] stream it produces, and the
//! [`TransportFactory`] seam through which connections obtain transports.
//! Concrete implementations live in submodules:
//!
//! - [`stdio::StdioTransport`] -- spawns a child process and talks
//!   newline-delimited JSON over its stdin/stdout pipes.
//! - [`websocket::WebSocketTransport`] -- one JSON-RPC message per text
//!   frame over `ws://` / `wss://`.
//! - [`sse::SseTransport`] -- long-lived `GET` event stream plus a POST
//!   endpoint announced by the server.
//! - [`http::HttpTransport`] -- streamable HTTP: every message is POSTed and
//!   replies come back as JSON or as an event-stream body.
//! - [`fake::FakeTransport`] -- scripted in-process server (cfg(test) only).
//!
//! # Events
//!
//! [`Transport::receive`] yields [`TransportEvent::Message`] for inbound
//! JSON-RPC text, [`TransportEvent::Error`] for failures observed outside of
//! a `send` call, and [`TransportEvent::Closed`] when the peer goes away.
//! A close or error whose text carries [`IDLE_CLOSE_MARKER`] is an expected
//! idle termination; see [`TransportEvent::is_idle_close`].
//!
//! # Canonical Import Path
//!
//! ```no_run
//! use mcpconn::mcp::transport::{Transport, TransportEvent};
//! ```

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::config::{ServerConfig, TransportKind};
use crate::error::{McpConnError, Result, IDLE_CLOSE_MARKER};

pub mod event_stream;
pub mod http;
pub mod sse;
pub mod stdio;
pub mod websocket;

#[cfg(test)]
pub mod fake;

/// Header map shared between a connection and its network transport.
///
/// Transports read it on every request, so a refreshed `Authorization`
/// value is picked up by the next request without rebuilding the transport.
pub type SharedHeaders = Arc<RwLock<HashMap<String, String>>>;

/// Pinned stream of transport events.
pub type EventStream = Pin<Box<dyn Stream<Item = TransportEvent> + Send + 'static>>;

/// Pinned stream of diagnostic lines.
pub type DiagnosticStream = Pin<Box<dyn Stream<Item = String> + Send + 'static>>;

/// Something a transport observed on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A complete inbound JSON-RPC message
    Message(String),
    /// A failure outside of a `send` call (stream error, decode error)
    Error(McpConnError),
    /// The peer closed the channel
    Closed {
        /// Close reason reported by the peer, if any
        reason: Option<String>,
    },
}

impl TransportEvent {
    /// Closed event carrying `reason`.
    pub fn closed(reason: impl Into<String>) -> Self {
        TransportEvent::Closed {
            reason: Some(reason.into()),
        }
    }

    /// Returns `true` when the event is a provider-side idle termination.
    ///
    /// Best-effort: transports report idle timeouts only as free text.
    pub fn is_idle_close(&self) -> bool {
        match self {
            TransportEvent::Closed { reason: Some(r) } => is_idle_termination(r),
            TransportEvent::Error(err) => {
                err.is_idle_close() || is_idle_termination(&err.to_string())
            }
            _ => false,
        }
    }
}

/// Returns `true` if `message` carries the idle-termination marker.
pub fn is_idle_termination(message: &str) -> bool {
    message.contains(IDLE_CLOSE_MARKER)
}

/// Abstraction over tool-server transports.
///
/// Used polymorphically through `Arc<dyn Transport>`. `send` failures are
/// returned to the caller as typed errors (for example
/// [`McpConnError::AuthChallenge`] on HTTP 401/403), so the initialize
/// handshake sees them directly.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Which wire protocol this transport speaks.
    fn kind(&self) -> TransportKind;

    /// Send one complete JSON-RPC message.
    ///
    /// The transport is responsible for framing (newline for stdio, a text
    /// frame for WebSocket, an HTTP POST for SSE and streamable HTTP).
    async fn send(&self, message: String) -> Result<()>;

    /// Stream of inbound events.
    ///
    /// Single consumer: the stream shares one underlying receiver, so a
    /// second stream competes with the first for items.
    fn receive(&self) -> EventStream;

    /// Stream of diagnostic lines (child stderr for stdio).
    ///
    /// Diagnostic output is never an error condition.
    fn receive_err(&self) -> DiagnosticStream {
        Box::pin(futures::stream::empty())
    }

    /// Release the underlying process or connection.
    async fn close(&self) -> Result<()>;
}

/// Turn a shared receiver into a stream that ends when the channel closes.
pub(crate) fn shared_receiver_stream<T: Send + 'static>(
    rx: Arc<Mutex<mpsc::UnboundedReceiver<T>>>,
) -> Pin<Box<dyn Stream<Item = T> + Send + 'static>> {
    Box::pin(futures::stream::unfold(rx, |rx| async move {
        let mut guard = rx.lock().await;
        let item = guard.recv().await?;
        drop(guard);
        Some((item, rx))
    }))
}

/// Everything a factory needs to build one transport.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    /// Server name, for logs and error messages
    pub server_name: String,
    /// Server config with placeholders already resolved
    pub config: ServerConfig,
    /// Headers the network transports read on every request
    pub headers: SharedHeaders,
    /// Bound on a single HTTP request
    pub request_timeout: Duration,
}

/// Builds transports for connections.
///
/// Owned by the registry and injected into every connection so tests can
/// substitute scripted transports and count constructions.
#[async_trait::async_trait]
pub trait TransportFactory: Send + Sync + std::fmt::Debug {
    /// Build and open a transport for `request`.
    ///
    /// # Errors
    ///
    /// [`McpConnError::TransportConstruction`] when the options do not match
    /// the declared or inferred transport type; any other error when the
    /// transport could not be opened.
    async fn create(&self, request: TransportRequest) -> Result<Arc<dyn Transport>>;
}

/// Factory producing the four real transports.
#[derive(Debug, Default, Clone)]
pub struct DefaultTransportFactory;

#[async_trait::async_trait]
impl TransportFactory for DefaultTransportFactory {
    async fn create(&self, request: TransportRequest) -> Result<Arc<dyn Transport>> {
        let kind = request.config.transport_kind()?;
        tracing::debug!(server = %request.server_name, transport = %kind, "Creating transport");

        let transport: Arc<dyn Transport> = match kind {
            TransportKind::Stdio => {
                let command = request.config.command.clone().unwrap_or_default();
                Arc::new(stdio::StdioTransport::spawn(
                    command.into(),
                    request.config.args.clone(),
                    stdio::build_environment(&request.config.env),
                    request.config.working_dir.clone(),
                )?)
            }
            TransportKind::WebSocket => {
                let url = request.config.parsed_url()?;
                let headers = request.headers.read().await.clone();
                Arc::new(websocket::WebSocketTransport::connect(url, &headers).await?)
            }
            TransportKind::Sse => {
                let url = request.config.parsed_url()?;
                Arc::new(
                    sse::SseTransport::connect(url, request.headers, request.request_timeout)
                        .await?,
                )
            }
            TransportKind::StreamableHttp => {
                let url = request.config.parsed_url()?;
                Arc::new(http::HttpTransport::new(
                    url,
                    request.headers,
                    request.request_timeout,
                )?)
            }
        };
        Ok(transport)
    }
}
