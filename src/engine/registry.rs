//! Connection registry.
//!
//! Single source of truth for all connection state. Connectors are selected
//! once per connection at setup time; the registry hands out `Connection`
//! handles whose state is only ever mutated through the reducer dispatch
//! path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, instrument};

use crate::engine::catalog::CatalogAction;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::state::{ConnectionState, QueryAction};
use crate::engine::traits::QueryConnector;
use crate::engine::types::{ConnectionHealth, ConnectionId};

/// A long-lived handle to one backend.
pub struct Connection {
    connection_id: ConnectionId,
    connector: Arc<dyn QueryConnector>,
    state: RwLock<ConnectionState>,
}

impl Connection {
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn connector(&self) -> &Arc<dyn QueryConnector> {
        &self.connector
    }

    /// Applies one query action. This is the single writer for the
    /// running/finished maps and the aggregated metrics.
    pub async fn dispatch_query(&self, action: QueryAction) {
        self.state.write().await.dispatch_query(action);
    }

    pub async fn dispatch_catalog(&self, action: CatalogAction) {
        self.state.write().await.dispatch_catalog(action);
    }

    /// Reads a snapshot of the connection state without blocking writers
    /// beyond the closure's runtime.
    pub async fn read<R>(&self, f: impl FnOnce(&ConnectionState) -> R) -> R {
        let state = self.state.read().await;
        f(&state)
    }

    pub async fn health(&self) -> ConnectionHealth {
        self.state.read().await.health
    }

    pub(crate) async fn set_health(&self, health: ConnectionHealth) {
        self.state.write().await.health = health;
    }

    /// Signals cancellation to every running query.
    pub async fn cancel_all_queries(&self) {
        let state = self.state.read().await;
        for query in state.queries_running.values() {
            query.cancellation.cancel();
        }
    }
}

/// Owns all active connections.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    next_connection_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            next_connection_id: AtomicU64::new(1),
        }
    }

    /// Registers a connection for the given connector and probes its health.
    ///
    /// The connection stays registered even when the probe fails, so the
    /// caller can observe the degraded health and retry queries later.
    #[instrument(skip(self, connector), fields(connector = connector.connector_id()))]
    pub async fn connect(&self, connector: Arc<dyn QueryConnector>) -> Arc<Connection> {
        let connection_id = ConnectionId(self.next_connection_id.fetch_add(1, Ordering::Relaxed));
        let mut state = ConnectionState::new(connection_id, connector.connector_id());
        state.health = ConnectionHealth::Connecting;
        let connection = Arc::new(Connection {
            connection_id,
            connector,
            state: RwLock::new(state),
        });

        self.connections
            .write()
            .await
            .insert(connection_id, Arc::clone(&connection));

        match connection.connector.health_check().await {
            Ok(()) => {
                connection.set_health(ConnectionHealth::Online).await;
                info!(%connection_id, "connection is online");
            }
            Err(err) => {
                connection.set_health(ConnectionHealth::Failed).await;
                info!(%connection_id, error = %err, "connection health check failed");
            }
        }
        connection
    }

    pub async fn get(&self, connection_id: ConnectionId) -> EngineResult<Arc<Connection>> {
        self.connections
            .read()
            .await
            .get(&connection_id)
            .cloned()
            .ok_or_else(|| EngineError::connection_not_found(connection_id.0))
    }

    /// Cancels running queries and removes the connection.
    #[instrument(skip(self))]
    pub async fn disconnect(&self, connection_id: ConnectionId) -> EngineResult<()> {
        let connection = {
            let mut connections = self.connections.write().await;
            connections
                .remove(&connection_id)
                .ok_or_else(|| EngineError::connection_not_found(connection_id.0))?
        };
        connection.cancel_all_queries().await;
        Ok(())
    }

    /// Resets a connection in place: cancels running queries and clears all
    /// per-connection state while keeping the handle registered.
    #[instrument(skip(self))]
    pub async fn reset(&self, connection_id: ConnectionId) -> EngineResult<()> {
        let connection = self.get(connection_id).await?;
        connection.cancel_all_queries().await;
        let connector_id = connection.connector.connector_id();
        let mut state = connection.state.write().await;
        *state = ConnectionState::new(connection_id, connector_id);
        Ok(())
    }

    pub async fn list(&self) -> Vec<(ConnectionId, String)> {
        let connections = self.connections.read().await;
        let mut entries: Vec<_> = connections
            .values()
            .map(|c| (c.connection_id, c.connector.connector_id().to_string()))
            .collect();
        entries.sort_by_key(|(id, _)| *id);
        entries
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::traits::ResultStream;
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    struct MockConnector {
        id: &'static str,
        healthy: bool,
    }

    #[async_trait]
    impl QueryConnector for MockConnector {
        fn connector_id(&self) -> &'static str {
            self.id
        }

        fn connector_name(&self) -> &'static str {
            "Mock Connector"
        }

        async fn health_check(&self) -> EngineResult<()> {
            if self.healthy {
                Ok(())
            } else {
                Err(EngineError::auth_failed("bad credentials"))
            }
        }

        async fn execute_query(
            &self,
            _query: &str,
            _cancel: &CancellationToken,
        ) -> EngineResult<Arc<dyn ResultStream>> {
            Err(EngineError::not_supported("mock"))
        }
    }

    #[tokio::test]
    async fn connect_and_disconnect() {
        let registry = ConnectionRegistry::new();
        assert!(registry.is_empty().await);

        let connection = registry
            .connect(Arc::new(MockConnector {
                id: "mock",
                healthy: true,
            }))
            .await;
        assert_eq!(connection.health().await, ConnectionHealth::Online);
        assert_eq!(registry.len().await, 1);

        registry.disconnect(connection.connection_id()).await.unwrap();
        assert!(registry.is_empty().await);
        assert!(registry.get(connection.connection_id()).await.is_err());
    }

    #[tokio::test]
    async fn failed_health_check_keeps_connection_with_degraded_health() {
        let registry = ConnectionRegistry::new();
        let connection = registry
            .connect(Arc::new(MockConnector {
                id: "mock",
                healthy: false,
            }))
            .await;
        assert_eq!(connection.health().await, ConnectionHealth::Failed);
        assert!(registry.get(connection.connection_id()).await.is_ok());
    }

    #[tokio::test]
    async fn connection_ids_are_unique() {
        let registry = ConnectionRegistry::new();
        let a = registry
            .connect(Arc::new(MockConnector {
                id: "a",
                healthy: true,
            }))
            .await;
        let b = registry
            .connect(Arc::new(MockConnector {
                id: "b",
                healthy: true,
            }))
            .await;
        assert_ne!(a.connection_id(), b.connection_id());

        let listed = registry.list().await;
        assert_eq!(listed.len(), 2);
        assert!(listed[0].0 < listed[1].0);
    }

    #[tokio::test]
    async fn reset_clears_state_in_place() {
        let registry = ConnectionRegistry::new();
        let connection = registry
            .connect(Arc::new(MockConnector {
                id: "mock",
                healthy: true,
            }))
            .await;
        registry.reset(connection.connection_id()).await.unwrap();
        assert_eq!(connection.health().await, ConnectionHealth::NotStarted);
        let totals = connection.read(|s| s.metrics.total_queries()).await;
        assert_eq!(totals, 0);
    }
}
