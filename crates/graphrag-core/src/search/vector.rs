use anyhow::Result;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use graphrag_common::{SearchResult, TextChunk};
use crate::llm::EmbeddingClient;
use crate::storage::{cosine_similarity, GraphStore};

/// Plain embedding lookup over chunk nodes, used by vector-kind stores.
pub struct ChunkSearch {
    store: Arc<dyn GraphStore>,
    embeddings: Arc<dyn EmbeddingClient>,
}

impl ChunkSearch {
    pub fn new(store: Arc<dyn GraphStore>, embeddings: Arc<dyn EmbeddingClient>) -> Self {
        Self { store, embeddings }
    }

    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<SearchResult>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let query_vec = self.embeddings.embed_query(query).await?.data;
        let hits = self.store.find_nodes_by_embedding(&query_vec, k).await?;

        Ok(hits.into_iter()
            .map(|node| {
                let score = node.embedding.as_deref().map(|e| cosine_similarity(&query_vec, e)).unwrap_or(0.0);
                let mut metadata = HashMap::new();
                metadata.insert("chunkId".to_string(), json!(node.id));
                SearchResult {
                    source: Some(TextChunk::source_of(&node.id).to_string()),
                    content: node.description,
                    score,
                    metadata,
                }
            })
            .collect())
    }
}
