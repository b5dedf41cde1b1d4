use anyhow::Result;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use graphrag_common::{GraphNode, SearchResult, TextChunk};
use crate::llm::EmbeddingClient;
use crate::storage::{cosine_similarity, GraphStore, Neighborhood};

/// Score given to a seed node that carries no embedding.
const UNEMBEDDED_SCORE: f32 = 0.5;

/// Entity-centric retrieval: nearest nodes by embedding, expanded to their neighbourhoods.
pub struct LocalSearch {
    store: Arc<dyn GraphStore>,
    embeddings: Arc<dyn EmbeddingClient>,
    max_depth: usize,
}

impl LocalSearch {
    pub fn new(store: Arc<dyn GraphStore>, embeddings: Arc<dyn EmbeddingClient>, max_depth: usize) -> Self {
        Self { store, embeddings, max_depth }
    }

    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<SearchResult>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let query_vec = self.embeddings.embed_query(query).await?.data;
        let seeds = self.store.find_nodes_by_embedding(&query_vec, k).await?;

        let mut visited: HashSet<String> = HashSet::new();
        let mut results = Vec::new();

        for seed in seeds {
            if visited.contains(&seed.id) {
                continue;
            }
            let hood = self.store.get_neighbors(&seed.id, self.max_depth).await?;
            visited.insert(seed.id.clone());
            visited.extend(hood.nodes.iter().map(|n| n.id.clone()));

            let score = match &seed.embedding {
                Some(embedding) => cosine_similarity(&query_vec, embedding),
                None => UNEMBEDDED_SCORE,
            };

            let mut metadata = HashMap::new();
            metadata.insert("nodeId".to_string(), json!(seed.id));
            metadata.insert("entityType".to_string(), json!(seed.node_type));
            metadata.insert("neighborCount".to_string(), json!(hood.nodes.len().saturating_sub(1)));

            results.push(SearchResult {
                content: format_entity_block(&seed, &hood),
                score,
                source: seed.source_chunk_ids.first().map(|c| TextChunk::source_of(c).to_string()),
                metadata,
            });
        }

        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(k);
        Ok(results)
    }
}

fn format_entity_block(seed: &GraphNode, hood: &Neighborhood) -> String {
    let names: HashMap<&str, &str> = hood.nodes.iter()
        .map(|n| (n.id.as_str(), n.name.as_str()))
        .chain(std::iter::once((seed.id.as_str(), seed.name.as_str())))
        .collect();
    let name_of = |id: &str| names.get(id).map(|s| s.to_string()).unwrap_or_else(|| id.to_string());

    let mut block = format!("Entity: {} ({})", seed.name, seed.node_type);
    if !seed.description.is_empty() {
        block.push_str(&format!("\nDescription: {}", seed.description));
    }

    if !hood.edges.is_empty() {
        block.push_str("\nRelationships:");
        for edge in &hood.edges {
            block.push_str(&format!(
                "\n- {} -[{}]-> {}",
                name_of(&edge.source_id), edge.edge_type, name_of(&edge.target_id)
            ));
            if !edge.description.is_empty() {
                block.push_str(&format!(": {}", edge.description));
            }
        }
    }

    let connected: Vec<String> = hood.nodes.iter()
        .filter(|n| n.id != seed.id)
        .map(|n| {
            if n.description.is_empty() {
                n.name.clone()
            } else {
                format!("{} ({})", n.name, n.description)
            }
        })
        .collect();
    if !connected.is_empty() {
        block.push_str("\nConnected entities:");
        for c in connected {
            block.push_str(&format!("\n- {}", c));
        }
    }
    block
}
