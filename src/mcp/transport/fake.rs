//! In-process fake transport and factory for unit tests
//!
//! [`FakeTransport`] answers JSON-RPC requests through a responder closure
//! so the connection state machine can run a full handshake without any
//! process or network I/O. [`FakeTransportHandle`] lets a test observe what
//! the client sent and inject events (notifications, errors, closes).
//!
//! [`FakeTransportFactory`] hands out queued transports or errors and
//! records every request it receives, including a snapshot of the shared
//! headers at creation time.
//!
//! ```text
//! client send() --> responder --> inbound (client receive())
//!              \--> outbound_rx (handle reads)
//! handle.inbound_tx ------------> inbound (client receive())
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};

use crate::config::TransportKind;
use crate::error::{McpConnError, Result};
use crate::mcp::transport::{
    shared_receiver_stream, EventStream, Transport, TransportEvent, TransportFactory,
    TransportRequest,
};
use crate::mcp::types::{JsonRpcError, JsonRpcResponse, LATEST_PROTOCOL_VERSION};

/// Maps `(method, params)` to a reply. `None` means "never answer".
pub type Responder =
    Arc<dyn Fn(&str, &Value) -> Option<std::result::Result<Value, JsonRpcError>> + Send + Sync>;

/// Responder for a small well-behaved tool server.
///
/// Exposes one `echo` tool, one resource and one prompt, and answers
/// `ping` with an empty object.
pub fn default_responder() -> Responder {
    Arc::new(|method, params| match method {
        "initialize" => Some(Ok(json!({
            "protocolVersion": LATEST_PROTOCOL_VERSION,
            "capabilities": { "tools": { "listChanged": true } },
            "serverInfo": { "name": "fake", "version": "0.0.1" }
        }))),
        "ping" => Some(Ok(json!({}))),
        "tools/list" => Some(Ok(json!({
            "tools": [{
                "name": "echo",
                "description": "Echo the input",
                "inputSchema": { "type": "object" }
            }]
        }))),
        "resources/list" => Some(Ok(json!({
            "resources": [{ "uri": "file:///readme", "name": "readme" }]
        }))),
        "prompts/list" => Some(Ok(json!({
            "prompts": [{ "name": "greet" }]
        }))),
        "tools/call" if params.get("name").and_then(Value::as_str) != Some("echo") => {
            Some(Err(JsonRpcError {
                code: -32602,
                message: format!("Unknown tool: {}", params["name"]),
                data: None,
            }))
        }
        "tools/call" => {
            let text = params
                .get("arguments")
                .and_then(|a| a.get("text"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            Some(Ok(json!({ "content": [{ "type": "text", "text": text }] })))
        }
        other => Some(Err(JsonRpcError {
            code: crate::mcp::types::METHOD_NOT_FOUND,
            message: format!("Method not found: {other}"),
            data: None,
        })),
    })
}

/// Scripted in-process transport.
pub struct FakeTransport {
    kind: TransportKind,
    responder: Responder,
    send_error: Option<McpConnError>,
    outbound_tx: mpsc::UnboundedSender<String>,
    inbound_tx: mpsc::UnboundedSender<TransportEvent>,
    inbound_rx: Arc<Mutex<mpsc::UnboundedReceiver<TransportEvent>>>,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for FakeTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeTransport")
            .field("kind", &self.kind)
            .field("send_error", &self.send_error)
            .finish_non_exhaustive()
    }
}

/// Test-side end of a [`FakeTransport`].
#[derive(Debug)]
pub struct FakeTransportHandle {
    /// Every message the client sent
    pub outbound_rx: mpsc::UnboundedReceiver<String>,
    /// Inject events the client will receive
    pub inbound_tx: mpsc::UnboundedSender<TransportEvent>,
    closed: Arc<AtomicBool>,
}

impl FakeTransportHandle {
    /// Push a JSON value as an inbound message.
    pub fn inject(&self, message: Value) {
        let _ = self
            .inbound_tx
            .send(TransportEvent::Message(message.to_string()));
    }

    /// Simulate the peer closing the channel.
    pub fn close(&self, reason: Option<&str>) {
        let _ = self.inbound_tx.send(TransportEvent::Closed {
            reason: reason.map(str::to_string),
        });
    }

    /// Returns `true` once the client called [`Transport::close`].
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Methods of every request and notification sent so far.
    pub fn sent_methods(&mut self) -> Vec<String> {
        let mut methods = Vec::new();
        while let Ok(raw) = self.outbound_rx.try_recv() {
            if let Some(m) = serde_json::from_str::<Value>(&raw)
                .ok()
                .and_then(|v| v.get("method").and_then(Value::as_str).map(str::to_string))
            {
                methods.push(m);
            }
        }
        methods
    }
}

impl FakeTransport {
    /// Healthy fake speaking streamable HTTP with [`default_responder`].
    pub fn new() -> (Self, FakeTransportHandle) {
        Self::with_responder(default_responder())
    }

    /// Fake whose replies come from `responder`.
    pub fn with_responder(responder: Responder) -> (Self, FakeTransportHandle) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let transport = Self {
            kind: TransportKind::StreamableHttp,
            responder,
            send_error: None,
            outbound_tx,
            inbound_tx: inbound_tx.clone(),
            inbound_rx: Arc::new(Mutex::new(inbound_rx)),
            closed: Arc::clone(&closed),
        };
        let handle = FakeTransportHandle {
            outbound_rx,
            inbound_tx,
            closed,
        };
        (transport, handle)
    }

    /// Fake whose every `send` fails with `err`.
    pub fn failing(err: McpConnError) -> (Self, FakeTransportHandle) {
        let (mut transport, handle) = Self::new();
        transport.send_error = Some(err);
        (transport, handle)
    }

    /// Report a different transport kind.
    pub fn with_kind(mut self, kind: TransportKind) -> Self {
        self.kind = kind;
        self
    }
}

#[async_trait::async_trait]
impl Transport for FakeTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn send(&self, message: String) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(McpConnError::GenericTransport("fake transport closed".into()).into());
        }
        if let Some(err) = &self.send_error {
            return Err(err.clone().into());
        }
        let _ = self.outbound_tx.send(message.clone());

        let value: Value = serde_json::from_str(&message)?;
        let (Some(id), Some(method)) = (
            value.get("id").cloned(),
            value.get("method").and_then(Value::as_str),
        ) else {
            return Ok(());
        };
        let params = value.get("params").cloned().unwrap_or(Value::Null);
        let response = match (self.responder)(method, &params) {
            Some(Ok(result)) => JsonRpcResponse::success(id, result),
            Some(Err(err)) => JsonRpcResponse::failure(id, err.code, err.message),
            None => return Ok(()),
        };
        let _ = self
            .inbound_tx
            .send(TransportEvent::Message(serde_json::to_string(&response)?));
        Ok(())
    }

    fn receive(&self) -> EventStream {
        shared_receiver_stream(Arc::clone(&self.inbound_rx))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// One queued factory result.
#[derive(Debug)]
pub enum FakeOutcome {
    /// Hand out this transport
    Transport(FakeTransport),
    /// Fail creation with this error
    Error(McpConnError),
}

/// What the factory saw on one `create` call.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// Server name from the request
    pub server_name: String,
    /// Shared headers at creation time
    pub headers: HashMap<String, String>,
    /// When `create` was called
    pub at: tokio::time::Instant,
}

/// Factory returning queued outcomes, then healthy fakes.
#[derive(Debug, Default)]
pub struct FakeTransportFactory {
    queue: std::sync::Mutex<VecDeque<FakeOutcome>>,
    requests: std::sync::Mutex<Vec<RecordedRequest>>,
    handles: std::sync::Mutex<Vec<FakeTransportHandle>>,
    failing_servers: std::sync::Mutex<HashMap<String, McpConnError>>,
    create_delay: Option<Duration>,
}

impl FakeTransportFactory {
    /// Factory that sleeps for `delay` inside every `create`.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            create_delay: Some(delay),
            ..Self::default()
        }
    }

    /// Queue a transport for the next `create`.
    pub fn push_transport(&self, transport: FakeTransport) {
        self.queue
            .lock()
            .unwrap()
            .push_back(FakeOutcome::Transport(transport));
    }

    /// Queue a creation failure for the next `create`.
    pub fn push_error(&self, err: McpConnError) {
        self.queue.lock().unwrap().push_back(FakeOutcome::Error(err));
    }

    /// Fail every `create` for `server_name` with `err`.
    pub fn fail_server(&self, server_name: &str, err: McpConnError) {
        self.failing_servers
            .lock()
            .unwrap()
            .insert(server_name.to_string(), err);
    }

    /// Number of `create` calls so far.
    pub fn create_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Every recorded request, in order.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Remove and return the handle of the most recent default fake.
    pub fn take_last_handle(&self) -> Option<FakeTransportHandle> {
        self.handles.lock().unwrap().pop()
    }
}

#[async_trait::async_trait]
impl TransportFactory for FakeTransportFactory {
    async fn create(&self, request: TransportRequest) -> Result<Arc<dyn Transport>> {
        let headers = request.headers.read().await.clone();
        self.requests.lock().unwrap().push(RecordedRequest {
            server_name: request.server_name.clone(),
            headers,
            at: tokio::time::Instant::now(),
        });
        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(err) = self
            .failing_servers
            .lock()
            .unwrap()
            .get(&request.server_name)
            .cloned()
        {
            return Err(err.into());
        }
        let next = self.queue.lock().unwrap().pop_front();
        match next {
            Some(FakeOutcome::Transport(t)) => Ok(Arc::new(t)),
            Some(FakeOutcome::Error(e)) => Err(e.into()),
            None => {
                let (t, handle) = FakeTransport::new();
                self.handles.lock().unwrap().push(handle);
                Ok(Arc::new(t))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_fake_answers_requests() {
        let (transport, mut handle) = FakeTransport::new();
        transport
            .send(r#"{"jsonrpc":"2.0","id":1,"method":"ping","params":{}}"#.to_string())
            .await
            .unwrap();
        let TransportEvent::Message(raw) = transport.receive().next().await.unwrap() else {
            panic!("expected message");
        };
        let value: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["id"], 1);
        assert_eq!(value["result"], json!({}));
        assert_eq!(handle.sent_methods(), vec!["ping".to_string()]);
    }

    #[tokio::test]
    async fn test_failing_fake_returns_error() {
        let (transport, _handle) = FakeTransport::failing(McpConnError::AuthChallenge {
            status: Some(401),
            message: "denied".into(),
        });
        let err = transport.send("{}".to_string()).await.unwrap_err();
        assert!(McpConnError::classify(&err).is_auth_challenge());
    }
}
