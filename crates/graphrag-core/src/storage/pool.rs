use dashmap::DashMap;
use std::sync::Arc;
use graphrag_common::config::Neo4jConfig;
use super::neo4j::{Neo4jConnection, Neo4jGraphStore};

/// Shares one `Neo4jConnection` per `url|user|database`. Owned by the
/// composition root and handed to whoever builds stores.
#[derive(Default)]
pub struct GraphConnectionPool {
    connections: DashMap<String, Arc<Neo4jConnection>>,
}

impl GraphConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection(&self, config: &Neo4jConfig) -> Arc<Neo4jConnection> {
        self.connections
            .entry(config.connection_string())
            .or_insert_with(|| {
                tracing::debug!("Opening graph database connection {}", config.connection_string());
                Arc::new(Neo4jConnection::new(config.clone()))
            })
            .clone()
    }

    pub fn open_store(&self, config: &Neo4jConfig, store_name: &str) -> Neo4jGraphStore {
        Neo4jGraphStore::new(self.connection(config), store_name)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
