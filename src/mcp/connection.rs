//! Supervised connection to one tool server
//!
//! A [`Connection`] owns at most one transport and the MCP session running
//! over it. It drives the state machine
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> (Error | Disconnected)
//! ```
//!
//! and layers the recovery policy on top:
//!
//! - Concurrent [`Connection::connect`] calls share one in-flight attempt.
//!   The attempt runs on its own task, so a caller that gives up does not
//!   abandon it.
//! - An authentication challenge suspends the attempt until the OAuth flow
//!   is reported through [`Connection::oauth_handled`] or
//!   [`Connection::oauth_failed`], bounded by the OAuth timeout.
//! - Connector tokens are refreshed before building an SSE or streamable
//!   HTTP transport, and once more after a probable token error.
//! - A session that fails while connected enters `Error`, which starts a
//!   bounded reconnection loop with capped exponential backoff. An idle close
//!   only disconnects.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared};
use futures::{FutureExt, StreamExt};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::{ConnectionSettings, ServerConfig, TransportKind};
use crate::error::{McpConnError, Result};
use crate::mcp::auth::oauth::{OAuthOutcome, OAuthSignal, OAuthWait};
use crate::mcp::auth::token::{ConnectorMatcher, RefreshPolicy, TokenProvider, TokenRecord, TokenSource};
use crate::mcp::client::{start_read_loop, JsonRpcClient};
use crate::mcp::events::{ConnectionEvent, ConnectionState, OAuthRequiredEvent};
use crate::mcp::protocol::{InitializedMcpProtocol, McpProtocol};
use crate::mcp::transport::{SharedHeaders, Transport, TransportEvent, TransportFactory, TransportRequest};
use crate::mcp::types::{
    CallToolResponse, ClientCapabilities, Implementation, McpTool, Prompt, Resource,
    NOTIF_PROMPTS_LIST_CHANGED, NOTIF_RESOURCES_LIST_CHANGED, NOTIF_TOOLS_LIST_CHANGED,
};

/// Delay before the first reconnect attempt.
pub const BASE_BACKOFF_MS: u64 = 1_000;

/// Upper bound on the reconnect delay.
pub const MAX_BACKOFF_MS: u64 = 30_000;

const AUTHORIZATION: &str = "Authorization";
const EVENT_CAPACITY: usize = 64;

/// Delay before reconnect attempt `attempt` (0-based):
/// `min(1000 * 2^attempt, 30000)` milliseconds.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use mcpconn::mcp::connection::backoff_delay;
///
/// assert_eq!(backoff_delay(0), Duration::from_millis(1000));
/// assert_eq!(backoff_delay(3), Duration::from_millis(8000));
/// assert_eq!(backoff_delay(10), Duration::from_millis(30000));
/// ```
pub fn backoff_delay(attempt: u32) -> Duration {
    let ms = 2u64
        .checked_pow(attempt)
        .and_then(|factor| factor.checked_mul(BASE_BACKOFF_MS))
        .map_or(MAX_BACKOFF_MS, |ms| ms.min(MAX_BACKOFF_MS));
    Duration::from_millis(ms)
}

/// Timeouts and limits applied to one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Bound on transport construction plus the initialize handshake
    pub connect_timeout: Duration,
    /// Bound on the OAuth suspension
    pub oauth_timeout: Duration,
    /// Reconnect attempts before giving up
    pub max_reconnect_attempts: u32,
    /// Bound on a liveness ping
    pub ping_timeout: Duration,
    /// Bound on a single RPC
    pub request_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self::from_settings(&ConnectionSettings::default(), &ServerConfig::default())
    }
}

impl ConnectionOptions {
    /// Global settings with the server's own overrides applied.
    pub fn from_settings(settings: &ConnectionSettings, server: &ServerConfig) -> Self {
        Self {
            connect_timeout: server
                .init_timeout_seconds
                .map_or_else(|| settings.connect_timeout(), Duration::from_secs),
            oauth_timeout: settings.oauth_timeout(),
            max_reconnect_attempts: settings.max_reconnect_attempts,
            ping_timeout: settings.ping_timeout(),
            request_timeout: server
                .timeout_seconds
                .map_or_else(|| settings.request_timeout(), Duration::from_secs),
        }
    }
}

/// Collaborators injected into every connection.
#[derive(Debug, Clone)]
pub struct ConnectionDeps {
    /// Builds transports
    pub factory: Arc<dyn TransportFactory>,
    /// Issues connector tokens
    pub token_provider: Option<Arc<dyn TokenProvider>>,
    /// Recognizes connector URLs
    pub connector: Option<ConnectorMatcher>,
}

impl ConnectionDeps {
    /// Dependencies with no token provider.
    pub fn new(factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            factory,
            token_provider: None,
            connector: None,
        }
    }

    /// Attach a token provider used for URLs matching `connector`.
    pub fn with_token_provider(
        mut self,
        provider: Arc<dyn TokenProvider>,
        connector: ConnectorMatcher,
    ) -> Self {
        self.token_provider = Some(provider);
        self.connector = Some(connector);
        self
    }
}

type SharedConnect = Shared<BoxFuture<'static, std::result::Result<(), McpConnError>>>;

struct Session {
    protocol: Arc<InitializedMcpProtocol>,
    transport: Arc<dyn Transport>,
    cancel: CancellationToken,
    generation: u64,
}

#[derive(Default)]
struct Inner {
    state: ConnectionState,
    session: Option<Session>,
    pending_connect: Option<SharedConnect>,
    token: Option<(TokenRecord, TokenSource)>,
    last_refresh: Option<DateTime<Utc>>,
    last_liveness_check: Option<DateTime<Utc>>,
}

/// How a connect attempt failed.
enum AttemptError {
    /// Reported through an `Error` event
    Plain(McpConnError),
    /// Already reported through the OAuth events
    OAuth(McpConnError),
}

impl AttemptError {
    fn into_inner(self) -> McpConnError {
        match self {
            AttemptError::Plain(err) | AttemptError::OAuth(err) => err,
        }
    }
}

/// Supervised connection to one tool server.
pub struct Connection {
    server_name: String,
    user_id: Option<String>,
    config: ServerConfig,
    kind: Option<TransportKind>,
    options: ConnectionOptions,
    factory: Arc<dyn TransportFactory>,
    token_provider: Option<Arc<dyn TokenProvider>>,
    uses_connector: bool,
    refresh_policy: RefreshPolicy,
    headers: SharedHeaders,
    inner: Mutex<Inner>,
    events: broadcast::Sender<ConnectionEvent>,
    oauth_signal: OAuthSignal,
    oauth_required: AtomicBool,
    initializing: AtomicBool,
    reconnecting: AtomicBool,
    stop_reconnecting: AtomicBool,
    reconnect_attempts: AtomicU32,
    generation: AtomicU64,
    /// Bumped by `disconnect`; an attempt started under an older value may
    /// not install its session.
    connect_epoch: AtomicU64,
    weak_self: Weak<Connection>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("server_name", &self.server_name)
            .field("user_id", &self.user_id)
            .field("state", &self.state())
            .field("reconnect_attempts", &self.reconnect_attempts())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Create a disconnected connection.
    ///
    /// Placeholders in `config` are resolved here, with `user_id` standing
    /// in for `{{USER_ID}}`.
    pub fn new(
        server_name: impl Into<String>,
        user_id: Option<String>,
        config: &ServerConfig,
        options: ConnectionOptions,
        deps: ConnectionDeps,
    ) -> Arc<Self> {
        let config = config.resolved(user_id.as_deref());
        let uses_connector = deps.token_provider.is_some()
            && match (&deps.connector, config.parsed_url()) {
                (Some(matcher), Ok(url)) => matcher.matches(&url),
                _ => false,
            };
        let headers = Arc::new(RwLock::new(config.headers.clone()));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Arc::new_cyclic(|weak_self| Self {
            server_name: server_name.into(),
            user_id,
            kind: config.transport_kind().ok(),
            config,
            options,
            factory: deps.factory,
            token_provider: deps.token_provider,
            uses_connector,
            refresh_policy: RefreshPolicy::default(),
            headers,
            inner: Mutex::new(Inner::default()),
            events,
            oauth_signal: OAuthSignal::default(),
            oauth_required: AtomicBool::new(false),
            initializing: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            stop_reconnecting: AtomicBool::new(false),
            reconnect_attempts: AtomicU32::new(0),
            generation: AtomicU64::new(0),
            connect_epoch: AtomicU64::new(0),
            weak_self: weak_self.clone(),
        })
    }

    /// Server name.
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Owning user, for per-user connections.
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// Resolved server config.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.inner().state
    }

    /// Reconnect attempts since the last successful connect.
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::SeqCst)
    }

    /// Returns `true` while an OAuth flow is pending.
    pub fn oauth_required(&self) -> bool {
        self.oauth_required.load(Ordering::SeqCst)
    }

    /// Cached token, if any.
    pub fn token(&self) -> Option<TokenRecord> {
        self.inner().token.as_ref().map(|(t, _)| t.clone())
    }

    /// When [`Connection::is_connected`] last ran.
    pub fn last_liveness_check(&self) -> Option<DateTime<Utc>> {
        self.inner().last_liveness_check
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Connect, or join the attempt already in flight.
    ///
    /// A no-op when already connected. Clears a stop requested by
    /// [`Connection::disconnect`].
    ///
    /// # Errors
    ///
    /// The classified [`McpConnError`] of the attempt. Every concurrent
    /// caller receives the same error.
    pub async fn connect(&self) -> Result<()> {
        self.stop_reconnecting.store(false, Ordering::SeqCst);
        self.connect_once().await.map_err(Into::into)
    }

    /// Tear down the session. Safe to call with no session.
    ///
    /// Stops a running reconnection loop, abandons a connect in flight
    /// (including one waiting for OAuth) and discards a token obtained
    /// through OAuth. Emits `ConnectionChange(Disconnected)` only when the
    /// state actually changes.
    pub async fn disconnect(&self) {
        self.stop_reconnecting.store(true, Ordering::SeqCst);
        self.connect_epoch.fetch_add(1, Ordering::SeqCst);
        self.inner().pending_connect = None;
        self.initializing.store(false, Ordering::SeqCst);
        self.oauth_required.store(false, Ordering::SeqCst);
        self.oauth_signal.disarm();
        self.close_session().await;
        self.discard_oauth_token().await;
        self.set_state(ConnectionState::Disconnected);
    }

    /// Ping the server. Records the check time and never changes state.
    pub async fn is_connected(&self) -> bool {
        let protocol = self.current_protocol();
        let alive = match protocol {
            Some(protocol) => protocol.ping(Some(self.options.ping_timeout)).await.is_ok(),
            None => false,
        };
        self.inner().last_liveness_check = Some(Utc::now());
        alive
    }

    /// Every tool the server offers; empty on failure.
    pub async fn fetch_tools(&self) -> Vec<McpTool> {
        self.fetch_list("tools", |p| async move { p.list_tools().await })
            .await
    }

    /// Every resource the server offers; empty on failure.
    pub async fn fetch_resources(&self) -> Vec<Resource> {
        self.fetch_list("resources", |p| async move { p.list_resources().await })
            .await
    }

    /// Every prompt the server offers; empty on failure.
    pub async fn fetch_prompts(&self) -> Vec<Prompt> {
        self.fetch_list("prompts", |p| async move { p.list_prompts().await })
            .await
    }

    /// Invoke a tool, connecting first if needed.
    ///
    /// # Errors
    ///
    /// The classified [`McpConnError`] of the connect or the call.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<serde_json::Value>,
    ) -> Result<CallToolResponse> {
        let protocol = self.ensure_session().await?;
        protocol
            .call_tool(name, arguments, Some(self.options.request_timeout))
            .await
            .map_err(|e| self.classify(&e).into())
    }

    /// Report a completed OAuth flow.
    ///
    /// A supplied token is installed as the `Authorization` header. The
    /// suspended connect, if any, retries once. Returns `true` when a
    /// connect was waiting.
    pub async fn oauth_handled(&self, token: Option<TokenRecord>) -> bool {
        if let Some(token) = token {
            self.install_token(token, TokenSource::OAuth).await;
        }
        let delivered = self.oauth_signal.resolve(OAuthOutcome::Handled);
        tracing::info!(server = %self.server_name, user = ?self.user_id, delivered, "OAuth handled");
        self.emit(ConnectionEvent::OAuthHandled);
        delivered
    }

    /// Report a failed OAuth flow.
    ///
    /// `error` is published as `OAuthFailed`; the suspended connect fails
    /// with the challenge that started the flow.
    pub fn oauth_failed(&self, error: McpConnError) -> bool {
        let delivered = self
            .oauth_signal
            .resolve(OAuthOutcome::Failed(error.clone()));
        tracing::warn!(server = %self.server_name, user = ?self.user_id, "OAuth failed: {}", error);
        self.emit(ConnectionEvent::OAuthFailed(error));
        delivered
    }

    /// Refresh the connector token now.
    ///
    /// With `force` the provider cache is cleared first; otherwise the
    /// refresh policy decides. A connected session is moved to
    /// `Disconnected` so the next RPC reconnects with the new token.
    /// Failures are logged and reported as `false`.
    pub async fn refresh_token(&self, force: bool) -> bool {
        self.refresh_connector_token(force).await
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn set_state(&self, state: ConnectionState) {
        let changed = {
            let mut inner = self.inner();
            let changed = inner.state != state;
            inner.state = state;
            changed
        };
        if changed {
            self.announce_state(state);
        }
    }

    fn announce_state(&self, state: ConnectionState) {
        tracing::debug!(server = %self.server_name, user = ?self.user_id, state = %state, "Connection state changed");
        self.emit(ConnectionEvent::ConnectionChange(state));
        if state == ConnectionState::Error {
            self.maybe_start_reconnect();
        }
    }

    fn current_protocol(&self) -> Option<Arc<InitializedMcpProtocol>> {
        self.inner()
            .session
            .as_ref()
            .map(|s| Arc::clone(&s.protocol))
    }

    async fn connect_once(&self) -> std::result::Result<(), McpConnError> {
        let attempt = {
            let mut inner = self.inner();
            if inner.state == ConnectionState::Connected && inner.session.is_some() {
                return Ok(());
            }
            match &inner.pending_connect {
                Some(pending) => pending.clone(),
                None => {
                    let Some(this) = self.weak_self.upgrade() else {
                        return Err(McpConnError::NotConnected(self.server_name.clone()));
                    };
                    let epoch = self.connect_epoch.load(Ordering::SeqCst);
                    let task = tokio::spawn(async move { this.run_connect(epoch).await });
                    let attempt = async move {
                        task.await.unwrap_or_else(|e| {
                            Err(McpConnError::GenericTransport(format!(
                                "connect task failed: {e}"
                            )))
                        })
                    }
                    .boxed()
                    .shared();
                    inner.pending_connect = Some(attempt.clone());
                    attempt
                }
            }
        };
        attempt.await
    }

    async fn run_connect(self: Arc<Self>, epoch: u64) -> std::result::Result<(), McpConnError> {
        self.initializing.store(true, Ordering::SeqCst);
        self.set_state(ConnectionState::Connecting);

        let outcome = self.connect_with_recovery(epoch).await;
        if self.connect_epoch.load(Ordering::SeqCst) != epoch {
            // Disconnected meanwhile; state and flags belong to `disconnect`.
            tracing::debug!(server = %self.server_name, user = ?self.user_id, "Connect attempt abandoned");
            return outcome.map_err(AttemptError::into_inner);
        }

        let result = match outcome {
            Ok(()) => Ok(()),
            Err(AttemptError::Plain(err)) => {
                tracing::error!(server = %self.server_name, user = ?self.user_id, "Connection failed: {}", err);
                self.set_state(ConnectionState::Error);
                self.emit(ConnectionEvent::Error(err.clone()));
                Err(err)
            }
            Err(AttemptError::OAuth(err)) => {
                self.set_state(ConnectionState::Error);
                Err(err)
            }
        };

        self.initializing.store(false, Ordering::SeqCst);
        self.inner().pending_connect = None;
        result
    }

    async fn connect_with_recovery(&self, epoch: u64) -> std::result::Result<(), AttemptError> {
        let mut err = match self.establish(epoch).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        if err.is_potential_token() {
            tracing::warn!(server = %self.server_name, "Probable token error, refreshing and retrying: {}", err);
            self.refresh_connector_token(true).await;
            err = match self.establish(epoch).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
        }

        if err.is_auth_challenge() {
            return self.await_oauth(err, epoch).await;
        }
        Err(AttemptError::Plain(err))
    }

    async fn await_oauth(
        &self,
        challenge: McpConnError,
        epoch: u64,
    ) -> std::result::Result<(), AttemptError> {
        self.oauth_required.store(true, Ordering::SeqCst);
        let waiter = self.oauth_signal.arm();
        tracing::info!(server = %self.server_name, user = ?self.user_id, "OAuth required: {}", challenge);
        self.emit(ConnectionEvent::OAuthRequired(OAuthRequiredEvent {
            server_name: self.server_name.clone(),
            user_id: self.user_id.clone(),
            server_url: self.config.url.clone(),
            oauth: self.config.oauth.clone(),
            error: challenge.clone(),
        }));

        let outcome = waiter.wait(self.options.oauth_timeout).await;
        if self.connect_epoch.load(Ordering::SeqCst) == epoch {
            self.oauth_required.store(false, Ordering::SeqCst);
        }

        match outcome {
            OAuthWait::Resolved(OAuthOutcome::Handled) => {
                self.establish(epoch).await.map_err(AttemptError::Plain)
            }
            OAuthWait::Resolved(OAuthOutcome::Failed(_)) => Err(AttemptError::OAuth(challenge)),
            OAuthWait::TimedOut => {
                self.oauth_signal.disarm();
                let err = McpConnError::OAuthTimeout {
                    server: self.server_name.clone(),
                    seconds: self.options.oauth_timeout.as_secs(),
                };
                tracing::warn!(server = %self.server_name, "{}", err);
                self.emit(ConnectionEvent::OAuthFailed(err));
                Err(AttemptError::OAuth(challenge))
            }
            OAuthWait::Abandoned => Err(AttemptError::OAuth(challenge)),
        }
    }

    /// One transport construction plus handshake.
    ///
    /// The session is installed only while `epoch` is current.
    async fn establish(&self, epoch: u64) -> std::result::Result<(), McpConnError> {
        self.close_session().await;

        if self.kind.is_some_and(TransportKind::is_http) {
            self.refresh_connector_token(false).await;
        }

        let request = TransportRequest {
            server_name: self.server_name.clone(),
            config: self.config.clone(),
            headers: Arc::clone(&self.headers),
            request_timeout: self.options.request_timeout,
        };
        let transport = self
            .factory
            .create(request)
            .await
            .map_err(|e| self.classify(&e))?;

        let client = Arc::new(JsonRpcClient::with_timeout(
            Arc::clone(&transport),
            self.options.request_timeout,
        ));
        self.register_notifications(&client);

        let cancel = CancellationToken::new();
        let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();
        start_read_loop(
            transport.receive(),
            cancel.clone(),
            Arc::clone(&client),
            lifecycle_tx,
        );
        self.forward_diagnostics(&transport, cancel.clone());

        let handshake = McpProtocol::new(client).initialize(
            Implementation::this_client(),
            ClientCapabilities::default(),
            Some(self.options.connect_timeout),
        );
        let outcome = match tokio::time::timeout(self.options.connect_timeout, handshake).await {
            Ok(Ok(protocol)) => Ok(protocol),
            Ok(Err(e)) => Err(self.classify(&e)),
            Err(_) => Err(self.connect_timeout()),
        };
        let protocol = match outcome {
            Ok(protocol) => protocol,
            Err(err) => {
                cancel.cancel();
                let _ = transport.close().await;
                return Err(match err {
                    McpConnError::RequestTimeout { .. } => self.connect_timeout(),
                    other => other,
                });
            }
        };

        let server_info = protocol.initialize_response.server_info.name.clone();
        let committed = {
            let mut inner = self.inner();
            if self.connect_epoch.load(Ordering::SeqCst) == epoch {
                let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                inner.session = Some(Session {
                    protocol: Arc::new(protocol),
                    transport: Arc::clone(&transport),
                    cancel: cancel.clone(),
                    generation,
                });
                let previous = std::mem::replace(&mut inner.state, ConnectionState::Connected);
                Some((generation, previous != ConnectionState::Connected))
            } else {
                None
            }
        };
        let Some((generation, changed)) = committed else {
            tracing::debug!(server = %self.server_name, "Disconnected during handshake, closing transport");
            cancel.cancel();
            let _ = transport.close().await;
            return Err(McpConnError::NotConnected(self.server_name.clone()));
        };

        tracing::info!(
            server = %self.server_name,
            user = ?self.user_id,
            transport = %transport.kind(),
            "Connected to {}",
            server_info
        );
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        if changed {
            self.announce_state(ConnectionState::Connected);
        }

        tokio::spawn(watch_lifecycle(
            self.weak_self.clone(),
            generation,
            lifecycle_rx,
        ));
        Ok(())
    }

    fn connect_timeout(&self) -> McpConnError {
        McpConnError::ConnectTimeout {
            server: self.server_name.clone(),
            seconds: self.options.connect_timeout.as_secs(),
        }
    }

    fn register_notifications(&self, client: &JsonRpcClient) {
        for (method, event) in [
            (NOTIF_TOOLS_LIST_CHANGED, ConnectionEvent::ToolsChanged),
            (NOTIF_RESOURCES_LIST_CHANGED, ConnectionEvent::ResourcesChanged),
            (NOTIF_PROMPTS_LIST_CHANGED, ConnectionEvent::PromptsChanged),
        ] {
            let events = self.events.clone();
            client.on_notification(method, move |_| {
                let _ = events.send(event.clone());
            });
        }
    }

    fn forward_diagnostics(&self, transport: &Arc<dyn Transport>, cancel: CancellationToken) {
        let mut lines = transport.receive_err();
        let server = self.server_name.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    line = lines.next() => match line {
                        Some(line) => tracing::debug!(server = %server, "stderr: {}", line),
                        None => break,
                    },
                }
            }
        });
    }

    /// Typed classification plus the connector's probable-token rule.
    fn classify(&self, err: &anyhow::Error) -> McpConnError {
        match McpConnError::classify(err) {
            McpConnError::HttpStatus { status: 500, body }
                if self.uses_connector && body.to_ascii_lowercase().contains("token") =>
            {
                McpConnError::PotentialToken(body)
            }
            other => other,
        }
    }

    async fn close_session(&self) -> bool {
        let session = self.inner().session.take();
        let Some(session) = session else {
            return false;
        };
        session.cancel.cancel();
        if let Err(e) = session.transport.close().await {
            tracing::debug!(server = %self.server_name, "Transport close failed: {}", e);
        }
        true
    }

    /// Drop the session with `generation` (if still current) and move to `state`.
    async fn drop_session(&self, generation: u64, state: ConnectionState) {
        let session = {
            let mut inner = self.inner();
            match &inner.session {
                Some(s) if s.generation == generation => inner.session.take(),
                _ => None,
            }
        };
        let Some(session) = session else {
            return;
        };
        session.cancel.cancel();
        if let Err(e) = session.transport.close().await {
            tracing::debug!(server = %self.server_name, "Transport close failed: {}", e);
        }
        self.set_state(state);
    }

    async fn ensure_session(&self) -> std::result::Result<Arc<InitializedMcpProtocol>, McpConnError> {
        if let Some(protocol) = self.current_protocol() {
            return Ok(protocol);
        }
        self.stop_reconnecting.store(false, Ordering::SeqCst);
        self.connect_once().await?;
        self.current_protocol()
            .ok_or_else(|| McpConnError::NotConnected(self.server_name.clone()))
    }

    async fn fetch_list<T, F, Fut>(&self, what: &str, list: F) -> Vec<T>
    where
        F: FnOnce(Arc<InitializedMcpProtocol>) -> Fut,
        Fut: Future<Output = Result<Vec<T>>>,
    {
        let protocol = match self.ensure_session().await {
            Ok(protocol) => protocol,
            Err(e) => {
                tracing::debug!(server = %self.server_name, "Cannot fetch {}: {}", what, e);
                return Vec::new();
            }
        };
        match list(protocol).await {
            Ok(items) => items,
            Err(e) => {
                let err = self.classify(&e);
                tracing::warn!(server = %self.server_name, "Failed to fetch {}: {}", what, err);
                self.emit(ConnectionEvent::Error(err));
                Vec::new()
            }
        }
    }

    async fn install_token(&self, token: TokenRecord, source: TokenSource) {
        self.headers
            .write()
            .await
            .insert(AUTHORIZATION.to_string(), token.authorization_header());
        self.inner().token = Some((token, source));
    }

    async fn discard_oauth_token(&self) {
        let discarded = {
            let mut inner = self.inner();
            if matches!(inner.token, Some((_, TokenSource::OAuth))) {
                inner.token = None;
                true
            } else {
                false
            }
        };
        if !discarded {
            return;
        }
        let mut headers = self.headers.write().await;
        match self.config.headers.get(AUTHORIZATION) {
            Some(configured) => {
                headers.insert(AUTHORIZATION.to_string(), configured.clone());
            }
            None => {
                headers.remove(AUTHORIZATION);
            }
        }
    }

    fn refresh_due(&self, force: bool) -> bool {
        if force {
            return true;
        }
        let inner = self.inner();
        self.refresh_policy.should_refresh(
            inner.token.as_ref().map(|(t, _)| t),
            inner.last_refresh,
            Utc::now(),
        )
    }

    async fn refresh_connector_token(&self, force: bool) -> bool {
        let Some(provider) = self.token_provider.as_ref().filter(|_| self.uses_connector) else {
            return false;
        };
        if !self.refresh_due(force) {
            return false;
        }
        if force {
            provider.clear_token_cache().await;
        }

        match provider.get_access_token().await {
            Ok(Some(token)) => {
                self.install_token(token, TokenSource::Provider).await;
                self.inner().last_refresh = Some(Utc::now());
                tracing::info!(server = %self.server_name, user = ?self.user_id, "Refreshed connector token");
                let live = self.inner().session.as_ref().map(|s| s.generation);
                if let Some(generation) = live {
                    self.drop_session(generation, ConnectionState::Disconnected)
                        .await;
                }
                true
            }
            Ok(None) => {
                tracing::debug!(server = %self.server_name, "Token provider returned no token");
                false
            }
            Err(e) => {
                tracing::warn!(server = %self.server_name, "Token refresh failed: {}", e);
                false
            }
        }
    }

    fn maybe_start_reconnect(&self) {
        if self.initializing.load(Ordering::SeqCst)
            || self.oauth_required.load(Ordering::SeqCst)
            || self.stop_reconnecting.load(Ordering::SeqCst)
        {
            return;
        }
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let Some(this) = self.weak_self.upgrade() else {
            self.reconnecting.store(false, Ordering::SeqCst);
            return;
        };
        tokio::spawn(async move {
            this.reconnect_loop().await;
            this.reconnecting.store(false, Ordering::SeqCst);
        });
    }

    fn reconnect_halted(&self) -> bool {
        self.stop_reconnecting.load(Ordering::SeqCst) || self.oauth_required.load(Ordering::SeqCst)
    }

    async fn reconnect_loop(&self) {
        let max = self.options.max_reconnect_attempts;
        loop {
            if self.reconnect_halted() {
                tracing::debug!(server = %self.server_name, "Reconnection stopped");
                return;
            }
            let attempt = self.reconnect_attempts.load(Ordering::SeqCst);
            if attempt >= max {
                tracing::error!(server = %self.server_name, user = ?self.user_id, attempts = attempt, "Reconnection attempts exhausted");
                return;
            }

            let delay = backoff_delay(attempt);
            tracing::warn!(
                server = %self.server_name,
                attempt = attempt + 1,
                max,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting"
            );
            tokio::time::sleep(delay).await;
            if self.reconnect_halted() {
                return;
            }

            self.reconnect_attempts.fetch_add(1, Ordering::SeqCst);
            match self.connect_once().await {
                Ok(()) => {
                    tracing::info!(server = %self.server_name, "Reconnected");
                    return;
                }
                Err(e) if e.is_fatal() || !e.counts_against_reconnect_budget() => {
                    tracing::warn!(server = %self.server_name, "Reconnection halted: {}", e);
                    return;
                }
                Err(e) => {
                    tracing::warn!(server = %self.server_name, "Reconnect attempt failed: {}", e);
                }
            }
        }
    }

    #[cfg(test)]
    fn seed_token(&self, token: TokenRecord, source: TokenSource, last_refresh: Option<DateTime<Utc>>) {
        let mut inner = self.inner();
        inner.token = Some((token, source));
        inner.last_refresh = last_refresh;
    }

    #[cfg(test)]
    async fn header(&self, name: &str) -> Option<String> {
        self.headers.read().await.get(name).cloned()
    }
}

async fn watch_lifecycle(
    connection: Weak<Connection>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(conn) = connection.upgrade() else {
            return;
        };
        if conn.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        if event.is_idle_close() {
            tracing::debug!(server = %conn.server_name, "Idle close, disconnecting");
            conn.drop_session(generation, ConnectionState::Disconnected)
                .await;
            return;
        }
        match event {
            TransportEvent::Message(_) => {}
            TransportEvent::Error(err) => {
                tracing::warn!(server = %conn.server_name, "Transport error: {}", err);
                conn.emit(ConnectionEvent::Error(err));
                conn.drop_session(generation, ConnectionState::Error).await;
                return;
            }
            TransportEvent::Closed { reason } => {
                tracing::warn!(
                    server = %conn.server_name,
                    reason = reason.as_deref().unwrap_or("none"),
                    "Transport closed unexpectedly"
                );
                conn.drop_session(generation, ConnectionState::Error).await;
                return;
            }
        }
    }
}
