pub mod memory;
pub mod neo4j;
pub mod pool;
pub mod metadata;

pub use memory::InMemoryGraphStore;
pub use neo4j::{GraphDbError, Neo4jGraphStore};
pub use pool::GraphConnectionPool;
pub use metadata::MetadataStore;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use graphrag_common::{Community, GraphEdge, GraphNode};

/// Nodes and edges reached from a start node, start node included.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Neighborhood {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Upserts by node id.
    async fn add_nodes(&self, nodes: Vec<GraphNode>) -> Result<()>;
    /// Upserts by edge id. Both endpoints must already exist.
    async fn add_edges(&self, edges: Vec<GraphEdge>) -> Result<()>;
    async fn get_node(&self, id: &str) -> Result<Option<GraphNode>>;
    /// Everything within `depth` hops of `id`, following edges in either direction.
    async fn get_neighbors(&self, id: &str, depth: usize) -> Result<Neighborhood>;
    async fn find_nodes_by_embedding(&self, vector: &[f32], k: usize) -> Result<Vec<GraphNode>>;
    async fn get_communities(&self) -> Result<Vec<Community>>;
    async fn set_communities(&self, communities: Vec<Community>) -> Result<()>;
    async fn get_all_nodes(&self) -> Result<Vec<GraphNode>>;
    async fn get_all_edges(&self) -> Result<Vec<GraphEdge>>;
    /// Drops the nodes and every edge touching them. Unknown ids are ignored.
    async fn remove_nodes(&self, ids: &[String]) -> Result<()>;
    async fn clear(&self) -> Result<()>;
}

/// `dot(a,b) / (|a|*|b|)`; 0 on empty input, dimension mismatch or a zero denominator.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    let denom = norm_a * norm_b;
    if denom == 0.0 {
        return 0.0;
    }
    dot / denom
}

/// Scores every node carrying an embedding and keeps the best `k`.
/// Non-finite scores are dropped.
pub(crate) fn rank_by_embedding<I>(nodes: I, vector: &[f32], k: usize) -> Vec<GraphNode>
where
    I: IntoIterator<Item = GraphNode>,
{
    let mut scored: Vec<(f32, GraphNode)> = nodes
        .into_iter()
        .filter_map(|node| {
            let score = cosine_similarity(vector, node.embedding.as_deref()?);
            score.is_finite().then_some((score, node))
        })
        .collect();

    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(k);
    scored.into_iter().map(|(_, node)| node).collect()
}
