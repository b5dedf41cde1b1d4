use anyhow::{anyhow, Context};
use graphrag_common::config::{AppConfig, GraphBackendConfig};
use graphrag_core::llm::create_llm_client;
use graphrag_core::{
    CachedEmbeddings, EmbeddingClient, GraphConnectionPool, GraphStore, InMemoryGraphStore,
    IndexingCoordinator, LLMClient,
};
use std::net::SocketAddr;
use std::sync::Arc;

mod routes;

use routes::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    match dotenvy::dotenv() {
        Ok(path) => tracing::info!("Loaded .env from: {:?}", path),
        Err(e) => tracing::warn!("Failed to load .env file: {}. Using system environment variables.", e),
    }

    let config = AppConfig::load().context("Failed to load configuration")?;
    config.validate()?;
    tracing::info!("Using LLM Provider: {:?}", config.llm.provider);
    tracing::info!("Using LLM Model: {}", config.llm.model);
    tracing::info!("Using Embedding Model: {}", config.llm.embedding_model);

    let client = create_llm_client(&config.llm)
        .ok_or_else(|| anyhow!("An API key for {:?} is required", config.llm.provider))?;
    let llm: Arc<dyn LLMClient> = client.clone();
    let embeddings: Arc<dyn EmbeddingClient> = Arc::new(CachedEmbeddings::new(
        client,
        config.indexing.query_embedding_cache_size,
    ));

    let coordinator = IndexingCoordinator::new(
        config.indexing.clone(),
        &config.storage.root_dir,
        llm,
        embeddings,
    );

    let pool = GraphConnectionPool::new();
    for store in &config.stores {
        let graph: Arc<dyn GraphStore> = match &store.graph {
            GraphBackendConfig::Memory => Arc::new(InMemoryGraphStore::new()),
            GraphBackendConfig::Neo4j(neo4j) => Arc::new(pool.open_store(neo4j, &store.name)),
        };
        coordinator.register(store.clone(), graph)?;
        tracing::info!("Registered knowledge store {} ({:?})", store.name, store.kind);
    }
    tracing::info!("{} stores share {} graph database connections", config.stores.len(), pool.len());

    coordinator.start().await.context("Failed to recover knowledge stores")?;

    let app = routes::router(Arc::new(AppState::new(coordinator)));

    let http_addr: SocketAddr = config.server.bind_addr.parse()
        .with_context(|| format!("Invalid server.bind_addr: {}", config.server.bind_addr))?;
    tracing::info!("HTTP API listening on {}", http_addr);
    let listener = tokio::net::TcpListener::bind(http_addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to install CTRL+C handler: {}", e);
            }
            tracing::info!("Shutdown signal received.");
        })
        .await?;

    tracing::info!("GraphRAG server stopped.");
    Ok(())
}
