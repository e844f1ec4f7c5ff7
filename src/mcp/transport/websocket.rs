//! WebSocket transport
//!
//! One JSON-RPC message per text frame over `ws://` or `wss://`. Connection
//! headers (including `Authorization`) are sent on the upgrade request; a
//! handshake rejected with 401/403 becomes [`McpConnError::AuthChallenge`].

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::config::TransportKind;
use crate::error::{McpConnError, Result};
use crate::mcp::transport::{shared_receiver_stream, EventStream, Transport, TransportEvent};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = Arc<Mutex<SplitSink<WsStream, Message>>>;

/// WebSocket transport.
#[derive(Debug)]
pub struct WebSocketTransport {
    url: url::Url,
    sink: WsSink,
    events_rx: Arc<Mutex<mpsc::UnboundedReceiver<TransportEvent>>>,
    reader: tokio::task::AbortHandle,
}

impl WebSocketTransport {
    /// Perform the upgrade handshake and start the frame reader.
    ///
    /// # Errors
    ///
    /// [`McpConnError::AuthChallenge`] for a 401/403 handshake response,
    /// [`McpConnError::TransportConstruction`] for a header that is not a
    /// valid HTTP header, [`McpConnError::GenericTransport`] otherwise.
    pub async fn connect(url: url::Url, headers: &HashMap<String, String>) -> Result<Self> {
        let mut request = url.as_str().into_client_request().map_err(|e| {
            McpConnError::TransportConstruction(format!("invalid WebSocket URL {url}: {e}"))
        })?;
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                McpConnError::TransportConstruction(format!("invalid header name '{name}': {e}"))
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                McpConnError::TransportConstruction(format!("invalid header value: {e}"))
            })?;
            request.headers_mut().insert(name, value);
        }

        let (stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| handshake_error(&url, e))?;
        tracing::debug!(url = %url, "WebSocket connected");

        let (sink, source) = stream.split();
        let sink: WsSink = Arc::new(Mutex::new(sink));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_frames(source, Arc::clone(&sink), events_tx)).abort_handle();

        Ok(Self {
            url,
            sink,
            events_rx: Arc::new(Mutex::new(events_rx)),
            reader,
        })
    }
}

fn handshake_error(url: &url::Url, err: WsError) -> McpConnError {
    match err {
        WsError::Http(response) => {
            let status = response.status().as_u16();
            if status == 401 || status == 403 {
                let message = response
                    .headers()
                    .get("WWW-Authenticate")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("WebSocket handshake to {url} rejected"));
                McpConnError::AuthChallenge {
                    status: Some(status),
                    message,
                }
            } else {
                let body = response
                    .body()
                    .as_ref()
                    .map(|b| String::from_utf8_lossy(b).into_owned())
                    .unwrap_or_default();
                McpConnError::HttpStatus { status, body }
            }
        }
        other => McpConnError::from_message(format!("WebSocket connect to {url} failed: {other}")),
    }
}

async fn read_frames(
    mut source: SplitStream<WsStream>,
    sink: WsSink,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
) {
    while let Some(frame) = source.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                let _ = events_tx.send(TransportEvent::Message(text));
            }
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => {
                    let _ = events_tx.send(TransportEvent::Message(text));
                }
                Err(_) => tracing::debug!("Dropping non UTF-8 binary frame"),
            },
            Ok(Message::Ping(payload)) => {
                if sink.lock().await.send(Message::Pong(payload)).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(frame)) => {
                let reason = frame
                    .map(|f| f.reason.into_owned())
                    .filter(|r| !r.is_empty());
                let _ = events_tx.send(TransportEvent::Closed { reason });
                return;
            }
            Ok(_) => {}
            Err(e) => {
                let _ = events_tx.send(TransportEvent::Error(McpConnError::from_message(
                    format!("WebSocket error: {e}"),
                )));
                return;
            }
        }
    }
    let _ = events_tx.send(TransportEvent::Closed { reason: None });
}

#[async_trait::async_trait]
impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    async fn send(&self, message: String) -> Result<()> {
        self.sink
            .lock()
            .await
            .send(Message::Text(message))
            .await
            .map_err(|e| {
                McpConnError::from_message(format!("WebSocket send to {} failed: {e}", self.url))
                    .into()
            })
    }

    fn receive(&self) -> EventStream {
        shared_receiver_stream(Arc::clone(&self.events_rx))
    }

    async fn close(&self) -> Result<()> {
        self.reader.abort();
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.close().await {
            tracing::debug!(url = %self.url, "WebSocket close failed: {}", e);
        }
        Ok(())
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
    use tokio_tungstenite::tungstenite::http::StatusCode;

    /// Start a server that echoes text frames and returns its URL.
    async fn echo_server() -> url::Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if msg.is_text() {
                    ws.send(msg).await.unwrap();
                }
            }
        });
        url::Url::parse(&format!("ws://{addr}")).unwrap()
    }

    #[tokio::test]
    async fn test_text_frames_round_trip() {
        let url = echo_server().await;
        let transport = WebSocketTransport::connect(url, &HashMap::new())
            .await
            .unwrap();
        transport
            .send(r#"{"jsonrpc":"2.0","id":1}"#.to_string())
            .await
            .unwrap();
        let mut stream = transport.receive();
        assert_eq!(
            stream.next().await.unwrap(),
            TransportEvent::Message(r#"{"jsonrpc":"2.0","id":1}"#.to_string())
        );
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_handshake_is_auth_challenge() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let reject = |_req: &Request, _resp: Response| -> std::result::Result<Response, ErrorResponse> {
                let mut err = ErrorResponse::new(None);
                *err.status_mut() = StatusCode::UNAUTHORIZED;
                Err(err)
            };
            let _ = tokio_tungstenite::accept_hdr_async(stream, reject).await;
        });

        let url = url::Url::parse(&format!("ws://{addr}")).unwrap();
        let err = WebSocketTransport::connect(url, &HashMap::new())
            .await
            .unwrap_err();
        assert_eq!(
            McpConnError::classify(&err),
            McpConnError::AuthChallenge {
                status: Some(401),
                message: format!("WebSocket handshake to ws://{addr}/ rejected")
            }
        );
    }

    #[tokio::test]
    async fn test_invalid_header_is_construction_error() {
        let url = url::Url::parse("ws://127.0.0.1:9").unwrap();
        let mut headers = HashMap::new();
        headers.insert("bad header".to_string(), "x".to_string());
        let err = WebSocketTransport::connect(url, &headers).await.unwrap_err();
        assert!(McpConnError::classify(&err).is_fatal());
    }

    #[tokio::test]
    async fn test_server_close_reports_reason() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let frame = tokio_tungstenite::tungstenite::protocol::CloseFrame {
                code: tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode::Normal,
                reason: "session terminated".into(),
            };
            ws.close(Some(frame)).await.unwrap();
        });

        let url = url::Url::parse(&format!("ws://{addr}")).unwrap();
        let transport = WebSocketTransport::connect(url, &HashMap::new())
            .await
            .unwrap();
        let event = transport.receive().next().await.unwrap();
        assert_eq!(event, TransportEvent::closed("session terminated"));
        assert!(event.is_idle_close());
    }
}
