//! Stdio transport for tool servers running as child processes
//!
//! This module implements [`StdioTransport`], which spawns a child process
//! and communicates with it over its stdin/stdout pipes using
//! newline-delimited JSON framing.
//!
//! # Protocol
//!
//! - Outbound messages are written to the child's stdin as a single JSON
//!   object followed by a newline (`\n`).
//! - Inbound messages are read from the child's stdout, one JSON object per
//!   line, and surfaced as [`TransportEvent::Message`].
//! - When stdout reaches end-of-file a [`TransportEvent::Closed`] is
//!   emitted.
//! - The child's stderr is diagnostic only and never an error condition.
//!
//! # Environment
//!
//! The child does not inherit the full parent environment. It receives a
//! small allow-list of inherited variables (see [`DEFAULT_INHERITED_ENV`])
//! merged with the server's configured variables, configured values winning.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};

use crate::config::TransportKind;
use crate::error::{McpConnError, Result};
use crate::mcp::transport::{
    shared_receiver_stream, DiagnosticStream, EventStream, Transport, TransportEvent,
};

/// Variables inherited from the parent process.
#[cfg(unix)]
pub const DEFAULT_INHERITED_ENV: &[&str] = &["HOME", "LOGNAME", "PATH", "SHELL", "TERM", "USER"];

/// Variables inherited from the parent process.
#[cfg(not(unix))]
pub const DEFAULT_INHERITED_ENV: &[&str] = &[
    "APPDATA",
    "HOMEDRIVE",
    "HOMEPATH",
    "LOCALAPPDATA",
    "PATH",
    "PROCESSOR_ARCHITECTURE",
    "SYSTEMDRIVE",
    "SYSTEMROOT",
    "TEMP",
    "USERNAME",
    "USERPROFILE",
];

/// Build the child environment: inherited allow-list overlaid with `extra`.
///
/// # Examples
///
/// ```
/// use std::collections::HashMap;
/// use mcpconn::mcp::transport::stdio::build_environment;
///
/// let mut extra = HashMap::new();
/// extra.insert("PATH".to_string(), "/opt/tools/bin".to_string());
/// let env = build_environment(&extra);
/// assert_eq!(env["PATH"], "/opt/tools/bin");
/// ```
pub fn build_environment(extra: &HashMap<String, String>) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = DEFAULT_INHERITED_ENV
        .iter()
        .filter_map(|key| std::env::var(key).ok().map(|v| (key.to_string(), v)))
        // Shell functions exported by bash are never forwarded.
        .filter(|(_, v)| !v.starts_with("()"))
        .collect();
    env.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}

/// Stdio-based transport that drives a child process.
///
/// # Examples
///
/// ```no_run
/// use mcpconn::mcp::transport::stdio::{build_environment, StdioTransport};
///
/// # #[tokio::main]
/// # async fn main() -> anyhow::Result<()> {
/// let transport = StdioTransport::spawn(
///     "npx".into(),
///     vec!["-y".into(), "@modelcontextprotocol/server-filesystem".into(), "/tmp".into()],
///     build_environment(&Default::default()),
///     None,
/// )?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct StdioTransport {
    /// Sender side of the stdin channel; `send()` writes here.
    stdin_tx: mpsc::UnboundedSender<String>,
    /// Inbound events from the stdout reader.
    events_rx: Arc<Mutex<mpsc::UnboundedReceiver<TransportEvent>>>,
    /// Lines written to stderr.
    stderr_rx: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
    /// Handle to the spawned child; used by `close` and `Drop`.
    child: Arc<Mutex<Child>>,
    /// Set once `close()` runs so the reader reports a clean close.
    closing: Arc<AtomicBool>,
}

impl StdioTransport {
    /// Spawn a child process and wire up its stdio pipes.
    ///
    /// The child's environment is cleared and replaced by `env`; callers
    /// normally build it with [`build_environment`].
    ///
    /// # Errors
    ///
    /// Returns [`McpConnError::GenericTransport`] if the process cannot be
    /// spawned or its pipes are unavailable.
    pub fn spawn(
        executable: PathBuf,
        args: Vec<String>,
        env: HashMap<String, String>,
        working_dir: Option<PathBuf>,
    ) -> Result<Self> {
        let mut cmd = Command::new(&executable);
        cmd.args(&args);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.env_clear().envs(&env);
        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            McpConnError::GenericTransport(format!(
                "failed to spawn tool server `{}`: {}",
                executable.display(),
                e
            ))
        })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            McpConnError::GenericTransport("child stdin unavailable after spawn".into())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            McpConnError::GenericTransport("child stdout unavailable after spawn".into())
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            McpConnError::GenericTransport("child stderr unavailable after spawn".into())
        })?;

        let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<String>();
        let (events_tx, events_rx) = mpsc::unbounded_channel::<TransportEvent>();
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel::<String>();
        let closing = Arc::new(AtomicBool::new(false));

        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(msg) = stdin_rx.recv().await {
                let line = format!("{}\n", msg);
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        let reader_closing = Arc::clone(&closing);
        let program = executable.display().to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let reason = loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        if events_tx
                            .send(TransportEvent::Message(line.to_string()))
                            .is_err()
                        {
                            return;
                        }
                    }
                    Ok(None) => break format!("tool server `{program}` closed stdout"),
                    Err(e) => break format!("reading stdout of `{program}` failed: {e}"),
                }
            };
            let event = if reader_closing.load(Ordering::SeqCst) {
                TransportEvent::Closed { reason: None }
            } else {
                TransportEvent::closed(reason)
            };
            let _ = events_tx.send(event);
        });

        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(
                    target: "mcpconn::mcp::transport::stdio",
                    "tool server stderr: {}",
                    line
                );
                if stderr_tx.send(line).is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            stdin_tx,
            events_rx: Arc::new(Mutex::new(events_rx)),
            stderr_rx: Arc::new(Mutex::new(stderr_rx)),
            child: Arc::new(Mutex::new(child)),
            closing,
        })
    }
}

#[async_trait::async_trait]
impl Transport for StdioTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    async fn send(&self, message: String) -> Result<()> {
        self.stdin_tx.send(message).map_err(|e| {
            anyhow::anyhow!(McpConnError::GenericTransport(format!(
                "stdin channel closed: {}",
                e
            )))
        })
    }

    fn receive(&self) -> EventStream {
        shared_receiver_stream(Arc::clone(&self.events_rx))
    }

    fn receive_err(&self) -> DiagnosticStream {
        shared_receiver_stream(Arc::clone(&self.stderr_rx))
    }

    /// Kill the child and reap it.
    async fn close(&self) -> Result<()> {
        self.closing.store(true, Ordering::SeqCst);
        let mut child = self.child.lock().await;
        if child.try_wait()?.is_none() {
            child.start_kill()?;
            child.wait().await?;
        }
        Ok(())
    }
}

impl Drop for StdioTransport {
    /// Best-effort termination of the child process on drop.
    ///
    /// On Unix, sends SIGTERM to the child PID via `libc::kill`. On
    /// non-Unix platforms, calls `start_kill()` on the child handle. This
    /// method MUST NOT block.
    fn drop(&mut self) {
        if let Ok(child) = self.child.try_lock() {
            #[cfg(unix)]
            {
                if let Some(pid) = child.id() {
                    // SAFETY: pid is a valid process ID obtained from tokio::process::Child.
                    unsafe {
                        libc::kill(pid as libc::pid_t, libc::SIGTERM);
                    }
                }
            }
            #[cfg(not(unix))]
            {
                let mut child = child;
                let _ = child.start_kill();
            }
        }
    }
}
