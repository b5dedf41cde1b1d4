use anyhow::Result;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::{BTreeMap, HashMap};
use graphrag_common::config::IndexingConfig;
use graphrag_common::{Community, GraphEdge};
use crate::storage::GraphStore;

/// Minimum modularity improvement for a level to count.
const EPSILON: f64 = 1e-7;
const MAX_LEVELS: usize = 32;
const MAX_PASSES: usize = 100;

#[derive(Debug, Clone)]
pub struct CommunityDetector {
    pub resolution: f64,
    pub min_size: usize,
    pub seed: u64,
}

impl CommunityDetector {
    pub fn new(resolution: f64, min_size: usize, seed: u64) -> Self {
        Self { resolution, min_size, seed }
    }

    pub fn from_config(config: &IndexingConfig) -> Self {
        Self::new(config.community_resolution, config.community_min_size, config.community_seed)
    }

    /// Clusters the whole store. Communities below `min_size` are dropped.
    pub async fn detect(&self, store: &dyn GraphStore) -> Result<Vec<Community>> {
        let nodes = store.get_all_nodes().await?;
        let edges = store.get_all_edges().await?;
        let node_ids: Vec<String> = nodes.into_iter().map(|n| n.id).collect();
        Ok(self.detect_from(&node_ids, &edges))
    }

    pub fn detect_from(&self, node_ids: &[String], edges: &[GraphEdge]) -> Vec<Community> {
        if node_ids.is_empty() {
            return Vec::new();
        }

        let graph = LouvainGraph::from_edges(node_ids, edges);
        let assignment = if graph.total_weight <= 0.0 {
            // Nothing to cluster on: every node stands alone.
            (0..graph.len()).collect()
        } else {
            louvain(graph.clone(), self.resolution, self.seed)
        };

        let mut groups: HashMap<usize, Vec<String>> = HashMap::new();
        for (idx, community) in assignment.into_iter().enumerate() {
            groups.entry(community).or_default().push(graph.ids[idx].clone());
        }

        let mut groups: Vec<Vec<String>> = groups.into_values()
            .filter(|members| members.len() >= self.min_size)
            .map(|mut members| {
                members.sort();
                members
            })
            .collect();
        groups.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a[0].cmp(&b[0])));

        let communities: Vec<Community> = groups.into_iter()
            .enumerate()
            .map(|(i, members)| Community::new(format!("community-{}", i), members))
            .collect();

        tracing::debug!(
            "Detected {} communities over {} nodes (resolution {}, min size {})",
            communities.len(), node_ids.len(), self.resolution, self.min_size
        );
        communities
    }
}

/// Undirected weighted simple graph; aggregated levels carry self loops.
#[derive(Debug, Clone)]
struct LouvainGraph {
    ids: Vec<String>,
    adjacency: Vec<Vec<(usize, f64)>>,
    self_loops: Vec<f64>,
    degrees: Vec<f64>,
    total_weight: f64,
}

impl LouvainGraph {
    /// Self edges are dropped and parallel edges summed, regardless of direction.
    fn from_edges(node_ids: &[String], edges: &[GraphEdge]) -> Self {
        let mut ids: Vec<String> = node_ids.to_vec();
        ids.sort();
        ids.dedup();
        let index: HashMap<&str, usize> = ids.iter().enumerate().map(|(i, id)| (id.as_str(), i)).collect();

        let mut pairs: BTreeMap<(usize, usize), f64> = BTreeMap::new();
        for edge in edges {
            let (Some(&s), Some(&t)) = (index.get(edge.source_id.as_str()), index.get(edge.target_id.as_str())) else {
                continue;
            };
            if s == t {
                continue;
            }
            let weight = edge.weight.max(0.0) as f64;
            *pairs.entry((s.min(t), s.max(t))).or_default() += weight;
        }

        let n = ids.len();
        Self::from_pairs(ids, n, pairs, vec![0.0; n])
    }

    fn from_pairs(ids: Vec<String>, n: usize, pairs: BTreeMap<(usize, usize), f64>, self_loops: Vec<f64>) -> Self {
        let mut adjacency = vec![Vec::new(); n];
        let mut degrees: Vec<f64> = self_loops.iter().map(|w| 2.0 * w).collect();
        let mut total_weight: f64 = self_loops.iter().sum();

        for ((s, t), w) in pairs {
            if w <= 0.0 {
                continue;
            }
            adjacency[s].push((t, w));
            adjacency[t].push((s, w));
            degrees[s] += w;
            degrees[t] += w;
            total_weight += w;
        }

        Self { ids, adjacency, self_loops, degrees, total_weight }
    }

    fn len(&self) -> usize {
        self.adjacency.len()
    }

    fn modularity(&self, communities: &[usize], resolution: f64) -> f64 {
        let m2 = 2.0 * self.total_weight;
        let mut internal: HashMap<usize, f64> = HashMap::new();
        let mut totals: HashMap<usize, f64> = HashMap::new();

        for node in 0..self.len() {
            let c = communities[node];
            *totals.entry(c).or_default() += self.degrees[node];
            *internal.entry(c).or_default() += 2.0 * self.self_loops[node];
            for &(other, w) in &self.adjacency[node] {
                if communities[other] == c {
                    *internal.entry(c).or_default() += w;
                }
            }
        }

        totals.iter()
            .map(|(c, tot)| internal.get(c).copied().unwrap_or(0.0) / m2 - resolution * (tot / m2).powi(2))
            .sum()
    }

    /// Greedily moves single nodes to the neighbouring community with the best
    /// gain until a full pass makes no move. Returns whether anything moved.
    fn local_moving(&self, communities: &mut [usize], resolution: f64, rng: &mut StdRng) -> bool {
        let n = self.len();
        let m2 = 2.0 * self.total_weight;
        let mut totals: Vec<f64> = vec![0.0; n];
        for node in 0..n {
            totals[communities[node]] += self.degrees[node];
        }

        let mut order: Vec<usize> = (0..n).collect();
        let mut neighbor_weight: Vec<f64> = vec![0.0; n];
        let mut touched: Vec<usize> = Vec::new();
        let mut any_move = false;

        for _ in 0..MAX_PASSES {
            order.shuffle(rng);
            let mut moved = false;

            for &node in &order {
                let current = communities[node];
                let k_i = self.degrees[node];

                for &(other, w) in &self.adjacency[node] {
                    let c = communities[other];
                    if neighbor_weight[c] == 0.0 {
                        touched.push(c);
                    }
                    neighbor_weight[c] += w;
                }

                totals[current] -= k_i;
                let mut best = current;
                let mut best_gain = neighbor_weight[current] - resolution * totals[current] * k_i / m2;
                for &c in &touched {
                    let gain = neighbor_weight[c] - resolution * totals[c] * k_i / m2;
                    if gain > best_gain + 1e-12 {
                        best_gain = gain;
                        best = c;
                    }
                }
                totals[best] += k_i;

                for &c in &touched {
                    neighbor_weight[c] = 0.0;
                }
                touched.clear();

                if best != current {
                    communities[node] = best;
                    moved = true;
                }
            }

            if !moved {
                break;
            }
            any_move = true;
        }
        any_move
    }

    /// Collapses each community into one node. Returns the new graph and the
    /// old community -> new node mapping.
    fn aggregate(&self, communities: &[usize]) -> (Self, Vec<usize>) {
        let mut renumber: HashMap<usize, usize> = HashMap::new();
        let mut mapping = vec![0; self.len()];
        for node in 0..self.len() {
            let next = renumber.len();
            mapping[node] = *renumber.entry(communities[node]).or_insert(next);
        }

        let n = renumber.len();
        let mut self_loops = vec![0.0; n];
        let mut pairs: BTreeMap<(usize, usize), f64> = BTreeMap::new();
        for node in 0..self.len() {
            let a = mapping[node];
            self_loops[a] += self.self_loops[node];
            for &(other, w) in &self.adjacency[node] {
                // Each undirected edge appears twice in the adjacency lists.
                if other < node {
                    continue;
                }
                let b = mapping[other];
                if a == b {
                    self_loops[a] += w;
                } else {
                    *pairs.entry((a.min(b), a.max(b))).or_default() += w;
                }
            }
        }

        let ids = (0..n).map(|i| i.to_string()).collect();
        (Self::from_pairs(ids, n, pairs, self_loops), mapping)
    }
}

/// Returns the community index of every node of `graph`.
fn louvain(mut graph: LouvainGraph, resolution: f64, seed: u64) -> Vec<usize> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut membership: Vec<usize> = (0..graph.len()).collect();

    for level in 0..MAX_LEVELS {
        let mut communities: Vec<usize> = (0..graph.len()).collect();
        let before = graph.modularity(&communities, resolution);
        let moved = graph.local_moving(&mut communities, resolution, &mut rng);
        let after = graph.modularity(&communities, resolution);

        if !moved || after - before <= EPSILON {
            tracing::trace!("Louvain converged at level {} (modularity {:.4})", level, before);
            break;
        }

        let (next, mapping) = graph.aggregate(&communities);
        for m in membership.iter_mut() {
            *m = mapping[*m];
        }
        graph = next;
    }
    membership
}
