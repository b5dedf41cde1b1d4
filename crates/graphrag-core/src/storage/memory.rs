use anyhow::{Result, anyhow};
use async_trait::async_trait;
use petgraph::stable_graph::{EdgeIndex, NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::RwLock;
use graphrag_common::{Community, GraphEdge, GraphNode};
use super::{rank_by_embedding, GraphStore, Neighborhood};

pub(crate) const COMMUNITY_ID_PROPERTY: &str = "communityId";

#[derive(Default)]
struct GraphState {
    graph: StableDiGraph<GraphNode, GraphEdge>,
    nodes: HashMap<String, NodeIndex>,
    edges: HashMap<String, EdgeIndex>,
    communities: Vec<Community>,
}

/// Process-local store over a petgraph `StableDiGraph`, so indices survive removals.
#[derive(Default)]
pub struct InMemoryGraphStore {
    state: RwLock<GraphState>,
}

impl InMemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn add_nodes(&self, nodes: Vec<GraphNode>) -> Result<()> {
        let mut state = self.state.write().await;
        for node in nodes {
            match state.nodes.get(&node.id).copied() {
                Some(ix) => state.graph[ix] = node,
                None => {
                    let id = node.id.clone();
                    let ix = state.graph.add_node(node);
                    state.nodes.insert(id, ix);
                }
            }
        }
        Ok(())
    }

    async fn add_edges(&self, edges: Vec<GraphEdge>) -> Result<()> {
        let mut state = self.state.write().await;
        for edge in edges {
            if let Some(ix) = state.edges.get(&edge.id).copied() {
                state.graph[ix] = edge;
                continue;
            }
            let src = *state.nodes.get(&edge.source_id)
                .ok_or_else(|| anyhow!("Edge {} references unknown source node {}", edge.id, edge.source_id))?;
            let tgt = *state.nodes.get(&edge.target_id)
                .ok_or_else(|| anyhow!("Edge {} references unknown target node {}", edge.id, edge.target_id))?;
            let id = edge.id.clone();
            let ix = state.graph.add_edge(src, tgt, edge);
            state.edges.insert(id, ix);
        }
        Ok(())
    }

    async fn get_node(&self, id: &str) -> Result<Option<GraphNode>> {
        let state = self.state.read().await;
        Ok(state.nodes.get(id).map(|ix| state.graph[*ix].clone()))
    }

    async fn get_neighbors(&self, id: &str, depth: usize) -> Result<Neighborhood> {
        let state = self.state.read().await;
        let Some(&start) = state.nodes.get(id) else {
            return Ok(Neighborhood::default());
        };

        let mut visited: HashSet<NodeIndex> = HashSet::from([start]);
        let mut order = vec![start];
        let mut seen_edges: HashSet<EdgeIndex> = HashSet::new();
        let mut edges = Vec::new();
        let mut queue = VecDeque::from([(start, 0usize)]);

        while let Some((ix, dist)) = queue.pop_front() {
            if dist >= depth {
                continue;
            }
            let incident = state.graph.edges_directed(ix, Direction::Outgoing)
                .chain(state.graph.edges_directed(ix, Direction::Incoming));
            for edge in incident {
                if seen_edges.insert(edge.id()) {
                    edges.push(edge.weight().clone());
                }
                let other = if edge.source() == ix { edge.target() } else { edge.source() };
                if visited.insert(other) {
                    order.push(other);
                    queue.push_back((other, dist + 1));
                }
            }
        }

        Ok(Neighborhood {
            nodes: order.into_iter().map(|ix| state.graph[ix].clone()).collect(),
            edges,
        })
    }

    async fn find_nodes_by_embedding(&self, vector: &[f32], k: usize) -> Result<Vec<GraphNode>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let state = self.state.read().await;
        let graph = &state.graph;
        let candidates = graph.node_indices()
            .map(|ix| &graph[ix])
            .filter(|n| n.embedding.is_some())
            .cloned();
        Ok(rank_by_embedding(candidates, vector, k))
    }

    async fn get_communities(&self) -> Result<Vec<Community>> {
        Ok(self.state.read().await.communities.clone())
    }

    async fn set_communities(&self, communities: Vec<Community>) -> Result<()> {
        let mut state = self.state.write().await;
        let indices: Vec<_> = state.graph.node_indices().collect();
        for ix in indices {
            state.graph[ix].properties.remove(COMMUNITY_ID_PROPERTY);
        }
        for community in &communities {
            for node_id in &community.node_ids {
                if let Some(ix) = state.nodes.get(node_id).copied() {
                    state.graph[ix].properties.insert(
                        COMMUNITY_ID_PROPERTY.to_string(),
                        serde_json::Value::String(community.id.clone()),
                    );
                }
            }
        }
        state.communities = communities;
        Ok(())
    }

    async fn get_all_nodes(&self) -> Result<Vec<GraphNode>> {
        let state = self.state.read().await;
        Ok(state.graph.node_indices().map(|ix| state.graph[ix].clone()).collect())
    }

    async fn get_all_edges(&self) -> Result<Vec<GraphEdge>> {
        let state = self.state.read().await;
        Ok(state.graph.edge_indices().map(|ix| state.graph[ix].clone()).collect())
    }

    async fn remove_nodes(&self, ids: &[String]) -> Result<()> {
        let mut state = self.state.write().await;
        for id in ids {
            if let Some(ix) = state.nodes.remove(id) {
                state.graph.remove_node(ix);
            }
        }
        let GraphState { graph, edges, .. } = &mut *state;
        edges.retain(|_, ix| graph.edge_weight(*ix).is_some());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.state.write().await = GraphState::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> GraphNode {
        GraphNode::new(id, "entity", id.to_uppercase(), "")
    }

    async fn chain_store() -> InMemoryGraphStore {
        // a -> b -> c -> d
        let store = InMemoryGraphStore::new();
        store.add_nodes(vec![node("a"), node("b"), node("c"), node("d")]).await.unwrap();
        store.add_edges(vec![
            GraphEdge::new("a", "b", "links", 1.0),
            GraphEdge::new("b", "c", "links", 1.0),
            GraphEdge::new("c", "d", "links", 1.0),
        ]).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_neighbors_bounded_by_depth() {
        let store = chain_store().await;

        let hood = store.get_neighbors("b", 1).await.unwrap();
        let mut ids: Vec<_> = hood.nodes.iter().map(|n| n.id.clone()).collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(hood.edges.len(), 2);
        assert_eq!(hood.nodes[0].id, "b");

        let hood = store.get_neighbors("a", 0).await.unwrap();
        assert_eq!(hood.nodes.len(), 1);
        assert!(hood.edges.is_empty());

        let hood = store.get_neighbors("a", 5).await.unwrap();
        assert_eq!(hood.nodes.len(), 4);
        assert_eq!(hood.edges.len(), 3);

        assert_eq!(store.get_neighbors("missing", 2).await.unwrap(), Neighborhood::default());
    }

    #[tokio::test]
    async fn test_upsert_replaces_node_and_edge() {
        let store = chain_store().await;
        store.add_nodes(vec![GraphNode::new("a", "entity", "A", "updated")]).await.unwrap();
        store.add_edges(vec![GraphEdge::new("a", "b", "LINKS", 0.25)]).await.unwrap();

        assert_eq!(store.get_node("a").await.unwrap().unwrap().description, "updated");
        let edges = store.get_all_edges().await.unwrap();
        assert_eq!(edges.len(), 3);
        assert!(edges.iter().any(|e| e.weight == 0.25));
        assert_eq!(store.get_all_nodes().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_edge_with_unknown_endpoint_is_rejected() {
        let store = InMemoryGraphStore::new();
        store.add_nodes(vec![node("a")]).await.unwrap();
        assert!(store.add_edges(vec![GraphEdge::new("a", "ghost", "links", 1.0)]).await.is_err());
    }

    #[tokio::test]
    async fn test_find_nodes_by_embedding_top_k() {
        let store = InMemoryGraphStore::new();
        store.add_nodes(vec![
            node("a").with_embedding(vec![1.0, 0.0]),
            node("b").with_embedding(vec![0.0, 1.0]),
            node("c"),
        ]).await.unwrap();

        let hits = store.find_nodes_by_embedding(&[1.0, 0.0], 1).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "a");
        assert_eq!(store.find_nodes_by_embedding(&[1.0, 0.0], 10).await.unwrap().len(), 2);
        assert!(store.find_nodes_by_embedding(&[1.0, 0.0], 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_nodes_drops_incident_edges() {
        let store = chain_store().await;
        store.remove_nodes(&["b".to_string(), "nope".to_string()]).await.unwrap();

        assert!(store.get_node("b").await.unwrap().is_none());
        let edges = store.get_all_edges().await.unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].source_id, "c");

        // Re-adding a removed edge id must not hit a stale index.
        store.add_nodes(vec![node("b")]).await.unwrap();
        store.add_edges(vec![GraphEdge::new("a", "b", "links", 1.0)]).await.unwrap();
        assert_eq!(store.get_all_edges().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_communities_annotate_members_and_clear_resets() {
        let store = chain_store().await;
        store.set_communities(vec![Community::new("community-0", vec!["a".into(), "b".into()])]).await.unwrap();

        assert_eq!(store.get_communities().await.unwrap().len(), 1);
        let a = store.get_node("a").await.unwrap().unwrap();
        assert_eq!(a.properties[COMMUNITY_ID_PROPERTY], "community-0");

        store.clear().await.unwrap();
        assert!(store.get_all_nodes().await.unwrap().is_empty());
        assert!(store.get_all_edges().await.unwrap().is_empty());
        assert!(store.get_communities().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reassigning_communities_drops_stale_annotations() {
        let store = chain_store().await;
        store.set_communities(vec![Community::new("community-0", vec!["a".into(), "b".into()])]).await.unwrap();
        store.set_communities(vec![Community::new("community-1", vec!["c".into(), "d".into()])]).await.unwrap();

        let a = store.get_node("a").await.unwrap().unwrap();
        assert!(!a.properties.contains_key(COMMUNITY_ID_PROPERTY));
        let c = store.get_node("c").await.unwrap().unwrap();
        assert_eq!(c.properties[COMMUNITY_ID_PROPERTY], "community-1");

        store.set_communities(Vec::new()).await.unwrap();
        let c = store.get_node("c").await.unwrap().unwrap();
        assert!(!c.properties.contains_key(COMMUNITY_ID_PROPERTY));
    }
}
