use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};

pub mod config;
pub mod hashing;

/// Open, schema-less property bag attached to nodes and edges.
pub type Properties = HashMap<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub properties: Properties,
    /// Originating chunk ids, in first-seen order without duplicates.
    #[serde(default)]
    pub source_chunk_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl GraphNode {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>, name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            name: name.into(),
            description: description.into(),
            properties: Properties::new(),
            source_chunk_ids: Vec::new(),
            embedding: None,
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Text used when embedding this node.
    pub fn embedding_text(&self) -> String {
        if self.description.is_empty() {
            self.name.clone()
        } else {
            format!("{}: {}", self.name, self.description)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphEdge {
    pub id: String,
    #[serde(rename = "type")]
    pub edge_type: String,
    pub source_id: String,
    pub target_id: String,
    #[serde(default)]
    pub description: String,
    /// 0.0 - 1.0
    pub weight: f32,
    #[serde(default)]
    pub properties: Properties,
}

impl GraphEdge {
    pub fn new(source_id: impl Into<String>, target_id: impl Into<String>, edge_type: impl Into<String>, weight: f32) -> Self {
        let source_id = source_id.into();
        let target_id = target_id.into();
        let edge_type = edge_type.into();
        Self {
            id: Self::derive_id(&source_id, &edge_type, &target_id),
            edge_type,
            source_id,
            target_id,
            description: String::new(),
            weight,
            properties: Properties::new(),
        }
    }

    pub fn derive_id(source_id: &str, edge_type: &str, target_id: &str) -> String {
        format!("{} -> {} -> {}", source_id, edge_type.to_lowercase(), target_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Community {
    pub id: String,
    pub node_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl Community {
    pub fn new(id: impl Into<String>, node_ids: Vec<String>) -> Self {
        Self {
            id: id.into(),
            node_ids,
            title: None,
            summary: None,
        }
    }
}

/// Pre-graph entity produced by extraction, keyed by name + type for dedup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedEntity {
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub source_chunk_ids: Vec<String>,
}

impl ExtractedEntity {
    pub fn new(name: impl Into<String>, entity_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entity_type: entity_type.into(),
            description: description.into(),
            source_chunk_ids: Vec::new(),
        }
    }

    /// `lowercase(name)::lowercase(type)`; also used as the graph node id.
    pub fn key(&self) -> String {
        entity_key(&self.name, &self.entity_type)
    }
}

pub fn entity_key(name: &str, entity_type: &str) -> String {
    format!("{}::{}", name.trim().to_lowercase(), entity_type.trim().to_lowercase())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedRelationship {
    pub source: String,
    pub target: String,
    #[serde(rename = "type")]
    pub relationship_type: String,
    #[serde(default)]
    pub description: String,
    pub weight: f32,
    #[serde(default)]
    pub source_chunk_ids: Vec<String>,
}

impl ExtractedRelationship {
    pub fn new(source: impl Into<String>, target: impl Into<String>, relationship_type: impl Into<String>, weight: f32) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            relationship_type: relationship_type.into(),
            description: String::new(),
            weight,
            source_chunk_ids: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetadata {
    pub source_hash: String,
    pub extracted_at: DateTime<Utc>,
    pub config_version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexingStatus {
    NotIndexed,
    Indexing,
    Indexed,
    Error,
}

impl IndexingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexingStatus::NotIndexed => "not_indexed",
            IndexingStatus::Indexing => "indexing",
            IndexingStatus::Indexed => "indexed",
            IndexingStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// Entity extraction, communities, local and global search.
    #[default]
    Graph,
    /// Chunk embeddings only.
    Vector,
}

/// Persisted lifecycle record of one knowledge store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeStoreMetadata {
    pub name: String,
    #[serde(default)]
    pub store_kind: StoreKind,
    pub status: IndexingStatus,
    #[serde(default)]
    pub document_count: usize,
    #[serde(default)]
    pub chunk_count: usize,
    #[serde(default)]
    pub entity_count: usize,
    #[serde(default)]
    pub edge_count: usize,
    #[serde(default)]
    pub community_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub indexed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_duration_ms: Option<u64>,
    #[serde(default)]
    pub error_message: Option<String>,
    /// Content hash per source id, compared on incremental refresh.
    #[serde(default)]
    pub source_hashes: BTreeMap<String, String>,
    #[serde(default)]
    pub embedding_model: Option<String>,
    #[serde(default)]
    pub cache_version: Option<String>,
}

impl KnowledgeStoreMetadata {
    pub fn new(name: impl Into<String>, store_kind: StoreKind) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            store_kind,
            status: IndexingStatus::NotIndexed,
            document_count: 0,
            chunk_count: 0,
            entity_count: 0,
            edge_count: 0,
            community_count: 0,
            created_at: now,
            updated_at: now,
            indexed_at: None,
            last_duration_ms: None,
            error_message: None,
            source_hashes: BTreeMap::new(),
            embedding_model: None,
            cache_version: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexingPhase {
    Loading,
    Splitting,
    Embedding,
    Extracting,
    Building,
    Caching,
    Done,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexingProgressEvent {
    pub name: String,
    pub phase: IndexingPhase,
    /// 0 - 100
    pub progress: u8,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub source_id: String,
    #[serde(default)]
    pub path: Option<String>,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextChunk {
    pub id: String,
    pub source_id: String,
    pub content: String,
}

impl TextChunk {
    pub fn new(source_id: &str, index: usize, content: impl Into<String>) -> Self {
        Self {
            id: format!("{}#{}", source_id, index),
            source_id: source_id.to_string(),
            content: content.into(),
        }
    }

    /// Recovers the source id from a chunk id of the form `{source}#{index}`.
    pub fn source_of(chunk_id: &str) -> &str {
        chunk_id.rsplit_once('#').map(|(source, _)| source).unwrap_or(chunk_id)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Local,
    Global,
    #[default]
    Auto,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub content: String,
    pub score: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}
