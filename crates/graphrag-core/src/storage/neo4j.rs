use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OnceCell, RwLock};
use graphrag_common::config::Neo4jConfig;
use graphrag_common::{Community, GraphEdge, GraphNode, Properties};
use super::memory::COMMUNITY_ID_PROPERTY;
use super::{rank_by_embedding, GraphStore, Neighborhood};

#[derive(Debug, Error)]
pub enum GraphDbError {
    #[error("cannot reach graph database at {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("graph database returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("cypher error {code}: {message}")]
    Cypher { code: String, message: String },
    #[error("failed to decode graph database response: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Serialize)]
struct Statement {
    statement: String,
    parameters: Value,
}

impl Statement {
    fn new(statement: impl Into<String>, parameters: Value) -> Self {
        Self { statement: statement.into(), parameters }
    }
}

#[derive(Debug, Deserialize)]
struct TxResponse {
    #[serde(default)]
    results: Vec<StatementResult>,
    #[serde(default)]
    errors: Vec<TxError>,
}

#[derive(Debug, Deserialize)]
struct StatementResult {
    #[serde(default)]
    data: Vec<DataRow>,
}

#[derive(Debug, Deserialize)]
struct DataRow {
    row: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct TxError {
    code: String,
    message: String,
}

/// One HTTP client + credentials per database, shared by every store on it.
/// Connectivity is checked once, on first use.
pub struct Neo4jConnection {
    client: Client,
    config: Neo4jConfig,
    verified: OnceCell<()>,
}

impl Neo4jConnection {
    pub fn new(config: Neo4jConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self { client, config, verified: OnceCell::new() }
    }

    pub fn config(&self) -> &Neo4jConfig {
        &self.config
    }

    fn endpoint(&self) -> String {
        format!("{}/db/{}/tx/commit", self.config.url.trim_end_matches('/'), self.config.database)
    }

    async fn ensure_connected(&self) -> Result<(), GraphDbError> {
        self.verified
            .get_or_try_init(|| async {
                self.execute(vec![Statement::new("RETURN 1", json!({}))]).await?;
                tracing::info!("Connected to graph database at {}", self.config.url);
                Ok::<(), GraphDbError>(())
            })
            .await
            .map(|_| ())
    }

    async fn execute(&self, statements: Vec<Statement>) -> Result<Vec<Vec<Vec<Value>>>, GraphDbError> {
        let mut req = self.client.post(self.endpoint()).json(&json!({ "statements": statements }));
        if !self.config.username.is_empty() {
            req = req.basic_auth(&self.config.username, self.config.password.as_deref());
        }

        let res = req.send().await.map_err(|source| GraphDbError::Connect {
            url: self.config.url.clone(),
            source,
        })?;

        let status = res.status();
        let body = res.text().await.map_err(|e| GraphDbError::Decode(e.to_string()))?;
        if !status.is_success() {
            return Err(GraphDbError::Status { status: status.as_u16(), body });
        }

        let parsed: TxResponse = serde_json::from_str(&body)
            .map_err(|e| GraphDbError::Decode(format!("{} - body: {}", e, body)))?;
        if let Some(err) = parsed.errors.into_iter().next() {
            return Err(GraphDbError::Cypher { code: err.code, message: err.message });
        }

        Ok(parsed.results
            .into_iter()
            .map(|r| r.data.into_iter().map(|d| d.row).collect())
            .collect())
    }

    /// Runs `statements` in one transaction and returns the rows of each.
    async fn run(&self, statements: Vec<Statement>) -> Result<Vec<Vec<Vec<Value>>>, GraphDbError> {
        self.ensure_connected().await?;
        self.execute(statements).await
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeRecord {
    id: String,
    #[serde(rename = "type")]
    node_type: String,
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    properties: Option<String>,
    #[serde(default)]
    source_chunk_ids: Option<Vec<String>>,
    #[serde(default)]
    embedding: Option<Vec<f32>>,
    #[serde(default)]
    community_id: Option<String>,
}

impl NodeRecord {
    fn into_node(self) -> GraphNode {
        let mut properties: Properties = self.properties
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default();
        if let Some(community) = self.community_id {
            properties.insert(COMMUNITY_ID_PROPERTY.to_string(), Value::String(community));
        }
        GraphNode {
            id: self.id,
            node_type: self.node_type,
            name: self.name,
            description: self.description.unwrap_or_default(),
            properties,
            source_chunk_ids: self.source_chunk_ids.unwrap_or_default(),
            embedding: self.embedding,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EdgeRecord {
    id: String,
    #[serde(rename = "type")]
    edge_type: String,
    source_id: String,
    target_id: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    weight: Option<f32>,
    #[serde(default)]
    properties: Option<String>,
}

impl EdgeRecord {
    fn into_edge(self) -> GraphEdge {
        GraphEdge {
            id: self.id,
            edge_type: self.edge_type,
            source_id: self.source_id,
            target_id: self.target_id,
            description: self.description.unwrap_or_default(),
            weight: self.weight.unwrap_or(1.0),
            properties: self.properties
                .as_deref()
                .and_then(|raw| serde_json::from_str(raw).ok())
                .unwrap_or_default(),
        }
    }
}

const NODE_PROJECTION: &str =
    "{.id, .type, .name, .description, .properties, .sourceChunkIds, .embedding, .communityId}";
const EDGE_PROJECTION: &str =
    "{.id, .type, .sourceId, .targetId, .description, .weight, .properties}";

fn decode_column<T: DeserializeOwned>(rows: Vec<Vec<Value>>) -> Result<Vec<T>, GraphDbError> {
    rows.into_iter()
        .filter_map(|row| row.into_iter().next())
        .map(|v| serde_json::from_value(v).map_err(|e| GraphDbError::Decode(e.to_string())))
        .collect()
}

fn nth_result(results: &mut Vec<Vec<Vec<Value>>>, n: usize) -> Vec<Vec<Value>> {
    if n < results.len() { std::mem::take(&mut results[n]) } else { Vec::new() }
}

/// Neo4j-backed store. Every node carries the owning store name, so several
/// stores can share one database.
pub struct Neo4jGraphStore {
    conn: Arc<Neo4jConnection>,
    store: String,
    communities: RwLock<Vec<Community>>,
}

impl Neo4jGraphStore {
    pub fn new(conn: Arc<Neo4jConnection>, store: impl Into<String>) -> Self {
        Self {
            conn,
            store: store.into(),
            communities: RwLock::new(Vec::new()),
        }
    }

    async fn query_nodes(&self, cypher: String, params: Value) -> Result<Vec<GraphNode>> {
        let mut results = self.conn.run(vec![Statement::new(cypher, params)]).await?;
        let records: Vec<NodeRecord> = decode_column(nth_result(&mut results, 0))?;
        Ok(records.into_iter().map(NodeRecord::into_node).collect())
    }
}

#[async_trait]
impl GraphStore for Neo4jGraphStore {
    async fn add_nodes(&self, nodes: Vec<GraphNode>) -> Result<()> {
        if nodes.is_empty() {
            return Ok(());
        }
        let mut rows = Vec::with_capacity(nodes.len());
        for n in &nodes {
            rows.push(json!({
                "id": n.id,
                "type": n.node_type,
                "name": n.name,
                "description": n.description,
                "properties": serde_json::to_string(&n.properties)?,
                "sourceChunkIds": n.source_chunk_ids,
                "embedding": n.embedding,
            }));
        }
        let cypher = "UNWIND $nodes AS n \
            MERGE (e:Entity {store: $store, id: n.id}) \
            SET e.type = n.type, e.name = n.name, e.description = n.description, \
                e.properties = n.properties, e.sourceChunkIds = n.sourceChunkIds, e.embedding = n.embedding";
        self.conn
            .run(vec![Statement::new(cypher, json!({ "store": self.store, "nodes": rows }))])
            .await
            .with_context(|| format!("Failed to upsert {} nodes into {}", nodes.len(), self.store))?;
        Ok(())
    }

    async fn add_edges(&self, edges: Vec<GraphEdge>) -> Result<()> {
        if edges.is_empty() {
            return Ok(());
        }
        let mut rows = Vec::with_capacity(edges.len());
        for e in &edges {
            rows.push(json!({
                "id": e.id,
                "type": e.edge_type,
                "sourceId": e.source_id,
                "targetId": e.target_id,
                "description": e.description,
                "weight": e.weight,
                "properties": serde_json::to_string(&e.properties)?,
            }));
        }
        let cypher = "UNWIND $edges AS r \
            MATCH (s:Entity {store: $store, id: r.sourceId}) \
            MATCH (t:Entity {store: $store, id: r.targetId}) \
            MERGE (s)-[rel:RELATES {id: r.id}]->(t) \
            SET rel.type = r.type, rel.sourceId = r.sourceId, rel.targetId = r.targetId, \
                rel.description = r.description, rel.weight = r.weight, rel.properties = r.properties";
        self.conn
            .run(vec![Statement::new(cypher, json!({ "store": self.store, "edges": rows }))])
            .await
            .with_context(|| format!("Failed to upsert {} edges into {}", edges.len(), self.store))?;
        Ok(())
    }

    async fn get_node(&self, id: &str) -> Result<Option<GraphNode>> {
        let cypher = format!("MATCH (e:Entity {{store: $store, id: $id}}) RETURN e {} AS node", NODE_PROJECTION);
        let nodes = self.query_nodes(cypher, json!({ "store": self.store, "id": id })).await?;
        Ok(nodes.into_iter().next())
    }

    async fn get_neighbors(&self, id: &str, depth: usize) -> Result<Neighborhood> {
        // Path length bounds cannot be parameterized in Cypher.
        let mut statements = vec![Statement::new(
            format!(
                "MATCH p = (start:Entity {{store: $store, id: $id}})-[:RELATES*0..{}]-(m:Entity) \
                 RETURN m {} AS node, min(length(p)) AS dist ORDER BY dist",
                depth, NODE_PROJECTION
            ),
            json!({ "store": self.store, "id": id }),
        )];
        if depth > 0 {
            statements.push(Statement::new(
                format!(
                    "MATCH p = (start:Entity {{store: $store, id: $id}})-[:RELATES*1..{}]-(:Entity) \
                     UNWIND relationships(p) AS r \
                     RETURN DISTINCT r {} AS edge",
                    depth, EDGE_PROJECTION
                ),
                json!({ "store": self.store, "id": id }),
            ));
        }

        let mut results = self.conn.run(statements).await?;
        let nodes: Vec<NodeRecord> = decode_column(nth_result(&mut results, 0))?;
        let edges: Vec<EdgeRecord> = decode_column(nth_result(&mut results, 1))?;
        Ok(Neighborhood {
            nodes: nodes.into_iter().map(NodeRecord::into_node).collect(),
            edges: edges.into_iter().map(EdgeRecord::into_edge).collect(),
        })
    }

    async fn find_nodes_by_embedding(&self, vector: &[f32], k: usize) -> Result<Vec<GraphNode>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        // No native vector index: scan and score client side.
        let cypher = format!(
            "MATCH (e:Entity {{store: $store}}) WHERE e.embedding IS NOT NULL RETURN e {} AS node",
            NODE_PROJECTION
        );
        let candidates = self.query_nodes(cypher, json!({ "store": self.store })).await?;
        Ok(rank_by_embedding(candidates, vector, k))
    }

    async fn get_communities(&self) -> Result<Vec<Community>> {
        Ok(self.communities.read().await.clone())
    }

    async fn set_communities(&self, communities: Vec<Community>) -> Result<()> {
        let assignments: Vec<Value> = communities.iter()
            .flat_map(|c| c.node_ids.iter().map(move |n| json!({ "nodeId": n, "communityId": c.id })))
            .collect();
        let statements = vec![
            Statement::new(
                "MATCH (e:Entity {store: $store}) REMOVE e.communityId",
                json!({ "store": self.store }),
            ),
            Statement::new(
                "UNWIND $assignments AS a \
                 MATCH (e:Entity {store: $store, id: a.nodeId}) \
                 SET e.communityId = a.communityId",
                json!({ "store": self.store, "assignments": assignments }),
            ),
        ];
        self.conn.run(statements).await
            .with_context(|| format!("Failed to annotate communities in {}", self.store))?;
        *self.communities.write().await = communities;
        Ok(())
    }

    async fn get_all_nodes(&self) -> Result<Vec<GraphNode>> {
        let cypher = format!("MATCH (e:Entity {{store: $store}}) RETURN e {} AS node ORDER BY e.id", NODE_PROJECTION);
        self.query_nodes(cypher, json!({ "store": self.store })).await
    }

    async fn get_all_edges(&self) -> Result<Vec<GraphEdge>> {
        let cypher = format!(
            "MATCH (:Entity {{store: $store}})-[r:RELATES]->(:Entity {{store: $store}}) RETURN r {} AS edge ORDER BY r.id",
            EDGE_PROJECTION
        );
        let mut results = self.conn.run(vec![Statement::new(cypher, json!({ "store": self.store }))]).await?;
        let records: Vec<EdgeRecord> = decode_column(nth_result(&mut results, 0))?;
        Ok(records.into_iter().map(EdgeRecord::into_edge).collect())
    }

    async fn remove_nodes(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.conn
            .run(vec![Statement::new(
                "MATCH (e:Entity {store: $store}) WHERE e.id IN $ids DETACH DELETE e",
                json!({ "store": self.store, "ids": ids }),
            )])
            .await?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.conn
            .run(vec![Statement::new(
                "MATCH (e:Entity {store: $store}) DETACH DELETE e",
                json!({ "store": self.store }),
            )])
            .await
            .with_context(|| format!("Failed to clear {}", self.store))?;
        self.communities.write().await.clear();
        Ok(())
    }
}

#[cfg(test)]
#[path = "neo4j_tests.rs"]
mod neo4j_tests;
