//! Transport-agnostic async JSON-RPC 2.0 client
//!
//! [`JsonRpcClient`] writes requests through an `Arc<dyn Transport>` and
//! correlates responses by id. [`start_read_loop`] consumes the transport's
//! event stream:
//!
//! - Responses resolve the matching pending request.
//! - Server requests are answered by a registered handler (`ping` is
//!   answered with `{}` when no handler is registered, anything else with
//!   `-32601`).
//! - Notifications call the registered handler, if any.
//! - [`TransportEvent::Error`] and [`TransportEvent::Closed`] are forwarded
//!   to the owner's lifecycle channel. A close also drops every pending
//!   request so awaiting callers fail instead of waiting for the timeout.
//!
//! Send failures are returned from [`JsonRpcClient::request`] directly, so a
//! 401 raised while POSTing `initialize` reaches the handshake caller as an
//! [`McpConnError::AuthChallenge`].

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{McpConnError, Result};
use crate::mcp::transport::{EventStream, Transport, TransportEvent};
use crate::mcp::types::{
    JsonRpcError, JsonRpcRequest, JsonRpcResponse, INTERNAL_ERROR, METHOD_NOT_FOUND, METHOD_PING,
};

/// Default timeout applied to every request when the caller does not specify one.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Convenience alias for a boxed, `Send`-safe async future.
pub type BoxFuture<'a, T> = Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

type NotificationHandler = Arc<dyn Fn(serde_json::Value) + Send + Sync + 'static>;

type ServerRequestHandler = Arc<
    dyn Fn(serde_json::Value) -> BoxFuture<'static, serde_json::Value> + Send + Sync + 'static,
>;

type PendingMap =
    HashMap<u64, oneshot::Sender<std::result::Result<serde_json::Value, JsonRpcError>>>;

/// Async JSON-RPC 2.0 client bound to one transport.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use tokio::sync::mpsc;
/// use tokio_util::sync::CancellationToken;
/// use mcpconn::mcp::client::{start_read_loop, JsonRpcClient};
/// use mcpconn::mcp::transport::Transport;
///
/// async fn wire(transport: Arc<dyn Transport>) {
///     let client = Arc::new(JsonRpcClient::new(Arc::clone(&transport)));
///     let (lifecycle_tx, _lifecycle_rx) = mpsc::unbounded_channel();
///     let _loop = start_read_loop(
///         transport.receive(),
///         CancellationToken::new(),
///         Arc::clone(&client),
///         lifecycle_tx,
///     );
/// }
/// ```
pub struct JsonRpcClient {
    transport: Arc<dyn Transport>,
    next_id: AtomicU64,
    pending: Mutex<PendingMap>,
    notification_handlers: RwLock<HashMap<String, NotificationHandler>>,
    server_request_handlers: RwLock<HashMap<String, ServerRequestHandler>>,
    default_timeout: Duration,
}

impl std::fmt::Debug for JsonRpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonRpcClient")
            .field("transport", &self.transport.kind())
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl JsonRpcClient {
    /// Create a client writing to `transport` with [`DEFAULT_REQUEST_TIMEOUT`].
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_timeout(transport, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Create a client whose requests time out after `default_timeout`.
    pub fn with_timeout(transport: Arc<dyn Transport>, default_timeout: Duration) -> Self {
        Self {
            transport,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            notification_handlers: RwLock::new(HashMap::new()),
            server_request_handlers: RwLock::new(HashMap::new()),
            default_timeout,
        }
    }

    /// The transport this client writes to.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Send a JSON-RPC request and await the typed response.
    ///
    /// # Errors
    ///
    /// - Whatever the transport returned from `send` (for example
    ///   [`McpConnError::AuthChallenge`]).
    /// - [`McpConnError::RequestTimeout`] if no response arrives in time.
    /// - [`McpConnError::NotConnected`] if the transport closed first.
    /// - [`McpConnError::Rpc`] for a JSON-RPC error response.
    /// - [`McpConnError::Protocol`] if the result has an unexpected shape.
    pub async fn request<P, R>(
        &self,
        method: &str,
        params: P,
        timeout: Option<Duration>,
    ) -> Result<R>
    where
        P: serde::Serialize + Send,
        R: serde::de::DeserializeOwned,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        // Register before sending so a fast response always finds its slot.
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let message = serde_json::to_string(&JsonRpcRequest::new(
            Some(serde_json::json!(id)),
            method,
            Some(serde_json::to_value(params)?),
        ))?;

        if let Err(e) = self.transport.send(message).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        let deadline = timeout.unwrap_or(self.default_timeout);
        let outcome = match tokio::time::timeout(deadline, rx).await {
            Ok(outcome) => outcome,
            Err(_) => {
                self.pending.lock().await.remove(&id);
                return Err(McpConnError::RequestTimeout {
                    method: method.to_string(),
                }
                .into());
            }
        };

        let rpc_result = outcome.map_err(|_| {
            McpConnError::NotConnected(format!("transport closed before {method} completed"))
        })?;

        let value = rpc_result.map_err(|e| McpConnError::Rpc {
            code: e.code,
            message: e.message,
        })?;

        serde_json::from_value(value).map_err(|e| {
            McpConnError::Protocol(format!("unexpected {method} result: {e}")).into()
        })
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn notify<P: serde::Serialize + Send>(&self, method: &str, params: P) -> Result<()> {
        let message = serde_json::to_string(&serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": serde_json::to_value(params)?
        }))?;
        self.transport.send(message).await
    }

    /// Register a handler for a server-sent notification.
    ///
    /// Registering a second handler for the same method replaces the first.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use mcpconn::mcp::client::JsonRpcClient;
    /// use mcpconn::mcp::types::NOTIF_TOOLS_LIST_CHANGED;
    ///
    /// fn watch(client: &JsonRpcClient) {
    ///     client.on_notification(NOTIF_TOOLS_LIST_CHANGED, |_params| {
    ///         // refresh tool list
    ///     });
    /// }
    /// ```
    pub fn on_notification(
        &self,
        method: impl Into<String>,
        f: impl Fn(serde_json::Value) + Send + Sync + 'static,
    ) {
        let mut handlers = match self.notification_handlers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        handlers.insert(method.into(), Arc::new(f));
    }

    /// Register a handler for a server-initiated request.
    ///
    /// The handler's return value is sent back as the `result` member.
    pub fn on_server_request(
        &self,
        method: impl Into<String>,
        f: impl Fn(serde_json::Value) -> BoxFuture<'static, serde_json::Value>
            + Send
            + Sync
            + 'static,
    ) {
        let mut handlers = match self.server_request_handlers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        handlers.insert(method.into(), Arc::new(f));
    }

    async fn fail_all_pending(&self) {
        self.pending.lock().await.clear();
    }

    fn notification_handler(&self, method: &str) -> Option<NotificationHandler> {
        match self.notification_handlers.read() {
            Ok(guard) => guard.get(method).cloned(),
            Err(poisoned) => poisoned.into_inner().get(method).cloned(),
        }
    }

    fn server_request_handler(&self, method: &str) -> Option<ServerRequestHandler> {
        match self.server_request_handlers.read() {
            Ok(guard) => guard.get(method).cloned(),
            Err(poisoned) => poisoned.into_inner().get(method).cloned(),
        }
    }
}

/// Start the JSON-RPC read loop as a background Tokio task.
///
/// Errors and closes observed on `events` are forwarded to `lifecycle_tx`.
/// The loop ends on cancellation, on a close, or when the stream ends; in
/// every case pending requests are dropped. Cancellation forwards nothing.
pub fn start_read_loop(
    mut events: EventStream,
    cancellation: CancellationToken,
    client: Arc<JsonRpcClient>,
    lifecycle_tx: mpsc::UnboundedSender<TransportEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;

                _ = cancellation.cancelled() => {
                    client.fail_all_pending().await;
                    break;
                }

                next = events.next() => {
                    match next {
                        Some(TransportEvent::Message(raw)) => dispatch_message(&raw, &client).await,
                        Some(TransportEvent::Error(err)) => {
                            let _ = lifecycle_tx.send(TransportEvent::Error(err));
                        }
                        Some(closed @ TransportEvent::Closed { .. }) => {
                            client.fail_all_pending().await;
                            let _ = lifecycle_tx.send(closed);
                            break;
                        }
                        None => {
                            client.fail_all_pending().await;
                            let _ = lifecycle_tx.send(TransportEvent::Closed { reason: None });
                            break;
                        }
                    }
                }
            }
        }
    })
}

async fn dispatch_message(raw: &str, client: &Arc<JsonRpcClient>) {
    let value: serde_json::Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("MCP read loop: failed to parse inbound JSON: {e}");
            return;
        }
    };

    // Batched messages are dispatched one by one.
    if let serde_json::Value::Array(items) = value {
        for item in items {
            dispatch_value(item, client).await;
        }
        return;
    }
    dispatch_value(value, client).await;
}

async fn dispatch_value(value: serde_json::Value, client: &Arc<JsonRpcClient>) {
    let has_id = value.get("id").is_some_and(|id| !id.is_null());
    let has_method = value.get("method").is_some();
    let has_result = value.get("result").is_some();
    let has_error = value.get("error").is_some();

    if has_id && (has_result || has_error) && !has_method {
        handle_response(value, client).await;
    } else if has_id && has_method {
        handle_server_request(value, client).await;
    } else if has_method {
        handle_notification(value, client);
    } else {
        tracing::debug!(
            "MCP read loop: unclassifiable message ignored (has_id={has_id} has_method={has_method})"
        );
    }
}

async fn handle_response(value: serde_json::Value, client: &Arc<JsonRpcClient>) {
    let id_val = &value["id"];
    let id = match id_val
        .as_u64()
        .or_else(|| id_val.as_str().and_then(|s| s.parse().ok()))
    {
        Some(id) => id,
        None => {
            tracing::warn!("MCP read loop: response has non-integer id: {id_val}");
            return;
        }
    };

    let Some(tx) = client.pending.lock().await.remove(&id) else {
        tracing::debug!("MCP read loop: response for unknown id {id} ignored");
        return;
    };

    let outcome = match value.get("error") {
        Some(error_val) => Err(serde_json::from_value::<JsonRpcError>(error_val.clone())
            .unwrap_or_else(|_| JsonRpcError {
                code: INTERNAL_ERROR,
                message: format!("malformed error object: {error_val}"),
                data: None,
            })),
        None => Ok(value
            .get("result")
            .cloned()
            .unwrap_or(serde_json::Value::Null)),
    };

    // The caller may already have timed out.
    let _ = tx.send(outcome);
}

async fn handle_server_request(value: serde_json::Value, client: &Arc<JsonRpcClient>) {
    let Some(method) = value.get("method").and_then(|m| m.as_str()) else {
        return;
    };
    let id = value.get("id").cloned().unwrap_or(serde_json::Value::Null);
    let params = value
        .get("params")
        .cloned()
        .unwrap_or(serde_json::Value::Null);

    let response = match client.server_request_handler(method) {
        Some(handler) => JsonRpcResponse::success(id, handler(params).await),
        None if method == METHOD_PING => JsonRpcResponse::success(id, serde_json::json!({})),
        None => JsonRpcResponse::failure(id, METHOD_NOT_FOUND, format!("Method not found: {method}")),
    };

    match serde_json::to_string(&response) {
        Ok(serialized) => {
            if let Err(e) = client.transport.send(serialized).await {
                tracing::debug!("MCP read loop: failed to answer {method}: {e}");
            }
        }
        Err(e) => tracing::warn!("MCP read loop: failed to serialize response: {e}"),
    }
}

fn handle_notification(value: serde_json::Value, client: &Arc<JsonRpcClient>) {
    let Some(method) = value.get("method").and_then(|m| m.as_str()) else {
        return;
    };
    let params = value
        .get("params")
        .cloned()
        .unwrap_or(serde_json::Value::Null);

    match client.notification_handler(method) {
        Some(handler) => handler(params),
        None => tracing::trace!("MCP read loop: no handler for notification {method}"),
    }
}
