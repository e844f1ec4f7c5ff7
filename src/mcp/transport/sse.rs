//! Server-sent events transport
//!
//! The client opens a long-lived `GET` event stream. The server's first
//! `endpoint` event names the URL (usually relative) that client messages
//! are POSTed to; every later `message` event carries one JSON-RPC message.
//!
//! When the stream ends the transport reports a close whose reason carries
//! the idle-termination marker: providers close idle event streams without
//! any further signal.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};

use crate::config::TransportKind;
use crate::error::{McpConnError, Result};
use crate::mcp::transport::event_stream::{SseEvent, SseParser};
use crate::mcp::transport::http::{apply_headers, build_client, error_for_status};
use crate::mcp::transport::{
    shared_receiver_stream, EventStream, SharedHeaders, Transport, TransportEvent,
};

/// Close reason reported when the server ends the event stream.
pub const STREAM_END_REASON: &str = "SSE stream terminated";

/// SSE transport with a separate POST endpoint.
#[derive(Debug)]
pub struct SseTransport {
    http_client: reqwest::Client,
    stream_url: url::Url,
    post_url: url::Url,
    headers: SharedHeaders,
    request_timeout: Duration,
    events_rx: Arc<Mutex<mpsc::UnboundedReceiver<TransportEvent>>>,
    reader: std::sync::Mutex<Option<tokio::task::AbortHandle>>,
}

impl SseTransport {
    /// Open the event stream and wait for the `endpoint` event.
    ///
    /// # Errors
    ///
    /// - [`McpConnError::AuthChallenge`] when the stream request is
    ///   rejected with 401/403.
    /// - [`McpConnError::HttpStatus`] for any other non-success status.
    /// - [`McpConnError::GenericTransport`] when the stream cannot be opened
    ///   or no endpoint is announced within `request_timeout`.
    pub async fn connect(
        stream_url: url::Url,
        headers: SharedHeaders,
        request_timeout: Duration,
    ) -> Result<Self> {
        // The GET stream is long-lived, so only individual POSTs carry a timeout.
        let http_client = build_client(None)?;

        let req = http_client
            .get(stream_url.as_str())
            .header("Accept", "text/event-stream")
            .header("Cache-Control", "no-cache");
        let req = apply_headers(req, &headers).await;

        let response = tokio::time::timeout(request_timeout, req.send())
            .await
            .map_err(|_| {
                McpConnError::GenericTransport(format!(
                    "opening SSE stream {stream_url} timed out"
                ))
            })?
            .map_err(|e| {
                McpConnError::from_message(format!("SSE request to {stream_url} failed: {e}"))
            })?;
        let response = error_for_status(response).await?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let task = tokio::spawn(read_stream(
            response.bytes_stream(),
            stream_url.clone(),
            events_tx,
            endpoint_tx,
        ));
        let abort = task.abort_handle();

        let post_url = match tokio::time::timeout(request_timeout, endpoint_rx).await {
            Ok(Ok(url)) => url,
            Ok(Err(_)) => {
                return Err(McpConnError::GenericTransport(format!(
                    "SSE stream {stream_url} closed before announcing an endpoint"
                ))
                .into())
            }
            Err(_) => {
                abort.abort();
                return Err(McpConnError::GenericTransport(format!(
                    "SSE stream {stream_url} did not announce an endpoint within {}s",
                    request_timeout.as_secs()
                ))
                .into());
            }
        };
        tracing::debug!(stream = %stream_url, endpoint = %post_url, "SSE endpoint announced");

        Ok(Self {
            http_client,
            stream_url,
            post_url,
            headers,
            request_timeout,
            events_rx: Arc::new(Mutex::new(events_rx)),
            reader: std::sync::Mutex::new(Some(abort)),
        })
    }

    /// URL client messages are POSTed to.
    pub fn post_url(&self) -> &url::Url {
        &self.post_url
    }
}

async fn read_stream<S>(
    byte_stream: S,
    base: url::Url,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    endpoint_tx: oneshot::Sender<url::Url>,
) where
    S: futures::Stream<Item = reqwest::Result<bytes::Bytes>>,
{
    let mut parser = SseParser::default();
    let mut endpoint_tx = Some(endpoint_tx);
    let last_event_id: RwLock<Option<String>> = RwLock::new(None);
    tokio::pin!(byte_stream);

    while let Some(chunk) = byte_stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                let _ = events_tx.send(TransportEvent::Error(McpConnError::from_message(
                    format!("SSE stream error: {e}"),
                )));
                return;
            }
        };
        let Ok(text) = std::str::from_utf8(&chunk) else {
            tracing::debug!("Dropping non UTF-8 SSE chunk");
            continue;
        };
        for event in parser.push(text) {
            handle_event(event, &base, &events_tx, &mut endpoint_tx, &last_event_id).await;
        }
    }

    if let Some(event) = parser.finish() {
        handle_event(event, &base, &events_tx, &mut endpoint_tx, &last_event_id).await;
    }
    let _ = events_tx.send(TransportEvent::closed(STREAM_END_REASON));
}

async fn handle_event(
    event: SseEvent,
    base: &url::Url,
    events_tx: &mpsc::UnboundedSender<TransportEvent>,
    endpoint_tx: &mut Option<oneshot::Sender<url::Url>>,
    last_event_id: &RwLock<Option<String>>,
) {
    if let Some(id) = &event.id {
        *last_event_id.write().await = Some(id.clone());
    }
    match event.event_type() {
        "endpoint" => {
            let Some(tx) = endpoint_tx.take() else {
                tracing::debug!("Ignoring repeated SSE endpoint event");
                return;
            };
            match base.join(event.data.trim()) {
                Ok(url) => {
                    let _ = tx.send(url);
                }
                Err(e) => {
                    let _ = events_tx.send(TransportEvent::Error(McpConnError::Protocol(
                        format!("invalid SSE endpoint '{}': {e}", event.data),
                    )));
                }
            }
        }
        "message" => {
            if !event.data.is_empty() {
                let _ = events_tx.send(TransportEvent::Message(event.data));
            }
        }
        other => tracing::trace!(event = other, "Ignoring SSE event"),
    }
}

#[async_trait::async_trait]
impl Transport for SseTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }

    async fn send(&self, message: String) -> Result<()> {
        let req = self
            .http_client
            .post(self.post_url.as_str())
            .timeout(self.request_timeout)
            .header("Content-Type", "application/json")
            .body(message);
        let req = apply_headers(req, &self.headers).await;

        let response = req.send().await.map_err(|e| {
            McpConnError::from_message(format!("SSE POST to {} failed: {e}", self.post_url))
        })?;
        error_for_status(response).await?;
        Ok(())
    }

    fn receive(&self) -> EventStream {
        shared_receiver_stream(Arc::clone(&self.events_rx))
    }

    async fn close(&self) -> Result<()> {
        let handle = match self.reader.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            handle.abort();
            tracing::debug!(stream = %self.stream_url, "SSE stream closed");
        }
        Ok(())
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.reader.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}
