// BridgeQL - SQL client core over a host-local transport bridge
// Core library

pub mod connectors;
pub mod engine;
pub mod observability;
pub mod transport;

use std::sync::Arc;

use engine::{CatalogLoader, ConnectionRegistry, QueryExecutor};

/// The wired-up engine: registry, executor and catalog loader sharing one
/// connection set.
pub struct Client {
    pub registry: Arc<ConnectionRegistry>,
    pub executor: Arc<QueryExecutor>,
    pub catalog: Arc<CatalogLoader>,
}

impl Client {
    pub fn new() -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let executor = Arc::new(QueryExecutor::new(Arc::clone(&registry)));
        let catalog = Arc::new(CatalogLoader::new(Arc::clone(&executor)));

        Self {
            registry,
            executor,
            catalog,
        }
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}
