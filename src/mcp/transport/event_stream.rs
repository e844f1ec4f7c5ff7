//! Incremental `text/event-stream` parser shared by the SSE and streamable
//! HTTP transports
//!
//! Events are separated by a blank line. Within an event:
//!
//! - `event:` sets the event type (default `message`)
//! - `data:` lines are joined with `\n`
//! - `id:` records the last event id for resumption
//! - `retry:` and `:` comment lines are ignored
//!
//! `event: ping` and `data: [PING]` keepalives are dropped.

use std::sync::Arc;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, RwLock};

use crate::mcp::transport::TransportEvent;

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event type; `None` means the default `message` type
    pub event: Option<String>,
    /// Joined `data:` payload
    pub data: String,
    /// Event id, when present
    pub id: Option<String>,
}

impl SseEvent {
    /// Event type with the `message` default applied.
    pub fn event_type(&self) -> &str {
        self.event.as_deref().unwrap_or("message")
    }

    fn is_keepalive(&self) -> bool {
        self.event_type().eq_ignore_ascii_case("ping") || self.data.eq_ignore_ascii_case("[ping]")
    }
}

/// Buffers partial chunks until complete events are available.
///
/// # Examples
///
/// ```
/// use mcpconn::mcp::transport::event_stream::SseParser;
///
/// let mut parser = SseParser::default();
/// assert!(parser.push("event: endpoint\ndata: /messages?s").is_empty());
/// let events = parser.push("=1\n\n");
/// assert_eq!(events[0].event_type(), "endpoint");
/// assert_eq!(events[0].data, "/messages?s=1");
/// ```
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
}

impl SseParser {
    /// Feed a chunk and return every event it completed.
    pub fn push(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(&chunk.replace("\r\n", "\n"));

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..pos + 2).collect();
            if let Some(event) = parse_block(&block[..pos]) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a trailing event that was not terminated by a blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        parse_block(rest.trim_end_matches('\n'))
    }
}

fn parse_block(block: &str) -> Option<SseEvent> {
    let mut data_lines: Vec<&str> = Vec::new();
    let mut event = None;
    let mut id = None;

    for line in block.lines() {
        if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.strip_prefix(' ').unwrap_or(value));
        } else if let Some(value) = line.strip_prefix("event:") {
            event = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("id:") {
            id = Some(value.trim().to_string());
        }
    }

    if data_lines.is_empty() && event.is_none() {
        return None;
    }

    let parsed = SseEvent {
        event,
        data: data_lines.join("\n"),
        id,
    };
    if parsed.is_keepalive() {
        return None;
    }
    Some(parsed)
}

/// Drain an event-stream response body, forwarding `message` events.
///
/// Used for streamable HTTP POST responses: the end of the body is normal
/// and produces no event, a body error is forwarded as
/// [`TransportEvent::Error`].
pub async fn forward_message_events<S>(
    byte_stream: S,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    last_event_id: Arc<RwLock<Option<String>>>,
) where
    S: Stream<Item = reqwest::Result<Bytes>>,
{
    let mut parser = SseParser::default();
    tokio::pin!(byte_stream);

    while let Some(chunk) = byte_stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                let _ = events_tx.send(TransportEvent::Error(
                    crate::error::McpConnError::from_message(format!(
                        "event stream body error: {e}"
                    )),
                ));
                return;
            }
        };
        let Ok(text) = std::str::from_utf8(&chunk) else {
            tracing::debug!("Dropping non UTF-8 event-stream chunk");
            continue;
        };
        for event in parser.push(text) {
            dispatch(event, &events_tx, &last_event_id).await;
        }
    }

    if let Some(event) = parser.finish() {
        dispatch(event, &events_tx, &last_event_id).await;
    }
}

async fn dispatch(
    event: SseEvent,
    events_tx: &mpsc::UnboundedSender<TransportEvent>,
    last_event_id: &Arc<RwLock<Option<String>>>,
) {
    if let Some(id) = &event.id {
        *last_event_id.write().await = Some(id.clone());
    }
    if event.event_type() == "message" && !event.data.is_empty() {
        let _ = events_tx.send(TransportEvent::Message(event.data));
    }
}
