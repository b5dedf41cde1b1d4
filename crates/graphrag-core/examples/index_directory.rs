//! Indexes a directory of text files into an in-memory graph and runs one query.
//!
//! ```text
//! OPENAI_API_KEY=... cargo run -p graphrag-core --example index_directory -- ./docs "What are the main themes?"
//! ```

use anyhow::{anyhow, Context};
use graphrag_common::config::{AppConfig, GraphBackendConfig, KnowledgeStoreConfig, SourceConfig};
use graphrag_common::{SearchMode, StoreKind};
use graphrag_core::llm::create_llm_client;
use graphrag_core::{CachedEmbeddings, InMemoryGraphStore, IndexingCoordinator, ProgressSink};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let dir = args.next().context("usage: index_directory <dir> [query]")?;
    let query = args.next().unwrap_or_else(|| "What are the main themes?".to_string());

    let config = AppConfig::load().context("Failed to load configuration")?;
    let client = create_llm_client(&config.llm).ok_or_else(|| anyhow!("Missing API key"))?;
    let embeddings = Arc::new(CachedEmbeddings::new(client.clone(), config.indexing.query_embedding_cache_size));

    let coordinator = IndexingCoordinator::new(config.indexing.clone(), &config.storage.root_dir, client, embeddings);
    coordinator.register(
        KnowledgeStoreConfig {
            name: "example".to_string(),
            kind: StoreKind::Graph,
            sources: vec![SourceConfig::new(dir)],
            graph: GraphBackendConfig::Memory,
        },
        Arc::new(InMemoryGraphStore::new()),
    )?;
    coordinator.start().await?;

    let sink: ProgressSink = Arc::new(|event| println!("[{:>3}%] {:?}: {}", event.progress, event.phase, event.message));
    let summary = coordinator.initialize("example", Some(sink)).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);

    for result in coordinator.search("example", &query, 5, SearchMode::Auto).await? {
        println!("--- score {:.3} source {:?}\n{}", result.score, result.source, result.content);
    }
    Ok(())
}
