//! Connection registry
//!
//! Indexes [`Connection`]s by server name (global servers) and by
//! `(user, server)` (per-user servers). The registry owns the shared
//! transport factory and token provider and hands them to every connection
//! it creates, so there is no process-wide singleton.
//!
//! Every connection's events are re-published on one registry-wide broadcast
//! channel as [`RegistryEvent`]s.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::broadcast;

use crate::config::{Config, ConnectionSettings, ServerConfig};
use crate::error::{McpConnError, Result};
use crate::mcp::auth::provider::HttpTokenProvider;
use crate::mcp::auth::token::ConnectorMatcher;
use crate::mcp::connection::{Connection, ConnectionDeps, ConnectionOptions};
use crate::mcp::events::ConnectionEvent;
use crate::mcp::transport::DefaultTransportFactory;

const REGISTRY_EVENT_CAPACITY: usize = 256;

/// A connection event tagged with its origin.
#[derive(Debug, Clone)]
pub struct RegistryEvent {
    /// Server the event came from
    pub server_name: String,
    /// Owning user, for per-user connections
    pub user_id: Option<String>,
    /// The event itself
    pub event: ConnectionEvent,
}

/// Outcome of a bulk connect, keyed by server name.
pub type ConnectOutcomes = BTreeMap<String, std::result::Result<(), McpConnError>>;

/// Global and per-user connections.
#[derive(Debug)]
pub struct ConnectionRegistry {
    global: DashMap<String, Arc<Connection>>,
    per_user: DashMap<(String, String), Arc<Connection>>,
    settings: ConnectionSettings,
    deps: ConnectionDeps,
    events: broadcast::Sender<RegistryEvent>,
}

impl ConnectionRegistry {
    /// Empty registry using `deps` for every connection.
    pub fn new(settings: ConnectionSettings, deps: ConnectionDeps) -> Self {
        let (events, _) = broadcast::channel(REGISTRY_EVENT_CAPACITY);
        Self {
            global: DashMap::new(),
            per_user: DashMap::new(),
            settings,
            deps,
            events,
        }
    }

    /// Registry backed by the real transports.
    ///
    /// When `config.connector` is set, an [`HttpTokenProvider`] is attached
    /// for URLs matching its host patterns.
    ///
    /// # Errors
    ///
    /// [`McpConnError::Config`] when the connector section is unusable.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut deps = ConnectionDeps::new(Arc::new(DefaultTransportFactory));
        if let Some(connector) = &config.connector {
            let provider = HttpTokenProvider::new(connector)?;
            let matcher = ConnectorMatcher::new(&connector.host_patterns)?;
            deps = deps.with_token_provider(Arc::new(provider), matcher);
            tracing::debug!(
                patterns = ?connector.host_patterns,
                "Connector token provider enabled"
            );
        }
        Ok(Self::new(config.connection.clone(), deps))
    }

    /// Subscribe to events from every connection.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// The connection for `server_name`, creating it if absent.
    ///
    /// Concurrent callers for the same key receive the same connection.
    /// The returned connection is not connected yet.
    pub fn get_or_create(
        &self,
        server_name: &str,
        config: &ServerConfig,
        user_id: Option<&str>,
    ) -> Arc<Connection> {
        match user_id {
            None => self
                .global
                .entry(server_name.to_string())
                .or_insert_with(|| self.build(server_name, config, None))
                .clone(),
            Some(user) => self
                .per_user
                .entry((user.to_string(), server_name.to_string()))
                .or_insert_with(|| self.build(server_name, config, Some(user)))
                .clone(),
        }
    }

    /// Look up an existing connection.
    pub fn get(&self, server_name: &str, user_id: Option<&str>) -> Option<Arc<Connection>> {
        match user_id {
            None => self.global.get(server_name).map(|c| Arc::clone(c.value())),
            Some(user) => self
                .per_user
                .get(&(user.to_string(), server_name.to_string()))
                .map(|c| Arc::clone(c.value())),
        }
    }

    /// Disconnect and forget one connection.
    ///
    /// Returns `false` when there was nothing to remove.
    pub async fn remove(&self, server_name: &str, user_id: Option<&str>) -> bool {
        let removed = match user_id {
            None => self.global.remove(server_name).map(|(_, c)| c),
            Some(user) => self
                .per_user
                .remove(&(user.to_string(), server_name.to_string()))
                .map(|(_, c)| c),
        };
        match removed {
            Some(connection) => {
                connection.disconnect().await;
                true
            }
            None => false,
        }
    }

    /// Disconnect and forget every global connection (`None`) or every
    /// connection of one user.
    pub async fn disconnect_all(&self, user_id: Option<&str>) {
        let connections: Vec<Arc<Connection>> = match user_id {
            None => {
                let names: Vec<String> = self.global.iter().map(|e| e.key().clone()).collect();
                names
                    .iter()
                    .filter_map(|name| self.global.remove(name).map(|(_, c)| c))
                    .collect()
            }
            Some(user) => {
                let keys: Vec<(String, String)> = self
                    .per_user
                    .iter()
                    .filter(|e| e.key().0 == user)
                    .map(|e| e.key().clone())
                    .collect();
                keys.iter()
                    .filter_map(|key| self.per_user.remove(key).map(|(_, c)| c))
                    .collect()
            }
        };
        tracing::info!(user = ?user_id, count = connections.len(), "Disconnecting connections");
        join_all(connections.iter().map(|c| c.disconnect())).await;
    }

    /// Create and connect one connection per server for `user_id`.
    ///
    /// Servers connect concurrently and every outcome is reported; one
    /// failure does not prevent the others.
    pub async fn initialize_user_connections(
        &self,
        user_id: &str,
        configs: &BTreeMap<String, ServerConfig>,
    ) -> ConnectOutcomes {
        self.connect_many(configs, Some(user_id)).await
    }

    /// Create and connect the global connection of every server.
    pub async fn connect_global(&self, configs: &BTreeMap<String, ServerConfig>) -> ConnectOutcomes {
        self.connect_many(configs, None).await
    }

    /// Snapshot of the global connections, sorted by server name.
    pub fn global_connections(&self) -> Vec<Arc<Connection>> {
        let mut connections: Vec<_> = self.global.iter().map(|e| Arc::clone(e.value())).collect();
        connections.sort_by(|a, b| a.server_name().cmp(b.server_name()));
        connections
    }

    /// Snapshot of one user's connections, sorted by server name.
    pub fn user_connections(&self, user_id: &str) -> Vec<Arc<Connection>> {
        let mut connections: Vec<_> = self
            .per_user
            .iter()
            .filter(|e| e.key().0 == user_id)
            .map(|e| Arc::clone(e.value()))
            .collect();
        connections.sort_by(|a, b| a.server_name().cmp(b.server_name()));
        connections
    }

    async fn connect_many(
        &self,
        configs: &BTreeMap<String, ServerConfig>,
        user_id: Option<&str>,
    ) -> ConnectOutcomes {
        let connections: Vec<Arc<Connection>> = configs
            .iter()
            .map(|(name, config)| self.get_or_create(name, config, user_id))
            .collect();

        let results = join_all(connections.iter().map(|c| c.connect())).await;

        let mut outcomes = ConnectOutcomes::new();
        for (connection, result) in connections.iter().zip(results) {
            let outcome = result.map_err(|e| McpConnError::classify(&e));
            if let Err(err) = &outcome {
                tracing::warn!(
                    server = %connection.server_name(),
                    user = ?user_id,
                    "Failed to initialize connection: {}",
                    err
                );
            }
            outcomes.insert(connection.server_name().to_string(), outcome);
        }
        let connected = outcomes.values().filter(|r| r.is_ok()).count();
        tracing::info!(user = ?user_id, connected, total = outcomes.len(), "Connections initialized");
        outcomes
    }

    fn build(&self, server_name: &str, config: &ServerConfig, user_id: Option<&str>) -> Arc<Connection> {
        let options = ConnectionOptions::from_settings(&self.settings, config);
        let connection = Connection::new(
            server_name,
            user_id.map(str::to_string),
            config,
            options,
            self.deps.clone(),
        );
        self.forward_events(&connection);
        tracing::debug!(server = %server_name, user = ?user_id, "Created connection");
        connection
    }

    fn forward_events(&self, connection: &Connection) {
        let mut rx = connection.subscribe();
        let tx = self.events.clone();
        let server_name = connection.server_name().to_string();
        let user_id = connection.user_id().map(str::to_string);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let _ = tx.send(RegistryEvent {
                            server_name: server_name.clone(),
                            user_id: user_id.clone(),
                            event,
                        });
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(server = %server_name, skipped, "Registry event forwarder lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportKind;
    use crate::mcp::events::ConnectionState;
    use crate::mcp::transport::fake::FakeTransportFactory;
    use crate::mcp::transport::TransportFactory;

    fn registry(factory: &Arc<FakeTransportFactory>) -> ConnectionRegistry {
        ConnectionRegistry::new(
            ConnectionSettings::default(),
            ConnectionDeps::new(Arc::clone(factory) as Arc<dyn TransportFactory>),
        )
    }

    fn remote(url: &str) -> ServerConfig {
        ServerConfig {
            transport: Some(TransportKind::StreamableHttp),
            url: Some(url.to_string()),
            ..ServerConfig::default()
        }
    }

    fn servers() -> BTreeMap<String, ServerConfig> {
        BTreeMap::from([
            ("alpha".to_string(), remote("https://alpha.example.com/mcp")),
            ("beta".to_string(), remote("https://beta.example.com/mcp")),
        ])
    }

    #[tokio::test]
    async fn test_get_or_create_returns_same_connection() {
        let factory = Arc::new(FakeTransportFactory::default());
        let registry = registry(&factory);
        let config = remote("https://alpha.example.com/mcp");

        let a = registry.get_or_create("alpha", &config, None);
        let b = registry.get_or_create("alpha", &config, None);
        assert!(Arc::ptr_eq(&a, &b));

        let per_user = registry.get_or_create("alpha", &config, Some("u1"));
        assert!(!Arc::ptr_eq(&a, &per_user));
        assert_eq!(per_user.user_id(), Some("u1"));
        assert!(registry.get("alpha", Some("u2")).is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_get_or_create_inserts_once() {
        let factory = Arc::new(FakeTransportFactory::default());
        let registry = Arc::new(registry(&factory));
        let config = remote("https://alpha.example.com/mcp");

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let config = config.clone();
                tokio::spawn(async move { registry.get_or_create("alpha", &config, Some("u1")) })
            })
            .collect();
        let connections: Vec<_> = join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert!(connections.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(registry.user_connections("u1").len(), 1);
    }

    #[tokio::test]
    async fn test_initialize_user_connections_settles_all() {
        let factory = Arc::new(FakeTransportFactory::default());
        factory.fail_server("beta", McpConnError::GenericTransport("refused".into()));
        let registry = registry(&factory);

        let outcomes = registry.initialize_user_connections("u1", &servers()).await;
        assert!(outcomes["alpha"].is_ok());
        assert_eq!(
            outcomes["beta"],
            Err(McpConnError::GenericTransport("refused".into()))
        );
        assert_eq!(
            registry.get("alpha", Some("u1")).unwrap().state(),
            ConnectionState::Connected
        );
        assert_eq!(
            registry.get("beta", Some("u1")).unwrap().state(),
            ConnectionState::Error
        );
    }

    #[tokio::test]
    async fn test_events_are_tagged_with_origin() {
        let factory = Arc::new(FakeTransportFactory::default());
        let registry = registry(&factory);
        let mut events = registry.subscribe();

        let connection = registry.get_or_create("alpha", &remote("https://alpha.example.com/mcp"), Some("u1"));
        connection.connect().await.unwrap();

        loop {
            let event = events.recv().await.unwrap();
            if let ConnectionEvent::ConnectionChange(ConnectionState::Connected) = event.event {
                assert_eq!(event.server_name, "alpha");
                assert_eq!(event.user_id.as_deref(), Some("u1"));
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_disconnect_all_scopes_to_user() {
        let factory = Arc::new(FakeTransportFactory::default());
        let registry = registry(&factory);
        registry.initialize_user_connections("u1", &servers()).await;
        registry.initialize_user_connections("u2", &servers()).await;
        registry.connect_global(&servers()).await;
        let kept = registry.get("alpha", Some("u2")).unwrap();

        registry.disconnect_all(Some("u1")).await;
        assert!(registry.user_connections("u1").is_empty());
        assert_eq!(registry.user_connections("u2").len(), 2);
        assert_eq!(registry.global_connections().len(), 2);
        assert_eq!(kept.state(), ConnectionState::Connected);

        registry.disconnect_all(None).await;
        assert!(registry.global_connections().is_empty());
    }

    #[tokio::test]
    async fn test_remove_disconnects() {
        let factory = Arc::new(FakeTransportFactory::default());
        let registry = registry(&factory);
        registry.connect_global(&servers()).await;
        let alpha = registry.get("alpha", None).unwrap();

        assert!(registry.remove("alpha", None).await);
        assert!(!registry.remove("alpha", None).await);
        assert_eq!(alpha.state(), ConnectionState::Disconnected);
        assert!(registry.get("alpha", None).is_none());
    }
}
