use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use config::{Config, ConfigError, File, Environment};
use crate::StoreKind;

// --- Constants for Default Configuration ---
pub const DEFAULT_STORAGE_ROOT_DIR: &str = "./data";
pub const DEFAULT_SERVER_BIND_ADDR: &str = "127.0.0.1:3000";

pub const DEFAULT_CHUNK_SIZE: usize = 1000;
pub const DEFAULT_CHUNK_OVERLAP: usize = 200;
pub const DEFAULT_COMMUNITY_RESOLUTION: f64 = 1.0;
pub const DEFAULT_COMMUNITY_MIN_SIZE: usize = 3;
pub const DEFAULT_COMMUNITY_SEED: u64 = 42;
pub const DEFAULT_LOCAL_SEARCH_MAX_DEPTH: usize = 2;
pub const DEFAULT_GLOBAL_TOP_COMMUNITIES: usize = 5;
pub const DEFAULT_LLM_CONCURRENCY: usize = 5;
pub const DEFAULT_EMBEDDING_BATCH_SIZE: usize = 64;
pub const DEFAULT_QUERY_EMBEDDING_CACHE_SIZE: u64 = 10_000;
pub const DEFAULT_NEO4J_DATABASE: &str = "neo4j";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum LLMProvider {
    OpenAI,
    Gemini,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMConfig {
    pub provider: LLMProvider,
    pub openai_api_key: Option<String>,
    pub google_api_key: Option<String>,
    pub model: String,
    pub embedding_model: String,
    /// Overrides the provider's default OpenAI-compatible endpoint.
    #[serde(default)]
    pub base_url: Option<String>,
}

impl LLMConfig {
    pub fn get_active_key(&self) -> Option<String> {
        match self.provider {
            LLMProvider::OpenAI => self.openai_api_key.clone(),
            LLMProvider::Gemini => self.google_api_key.clone(),
        }
    }

    pub fn get_base_url(&self) -> Option<String> {
        if let Some(url) = &self.base_url {
            return Some(url.clone());
        }
        match self.provider {
            LLMProvider::OpenAI => None,
            LLMProvider::Gemini => Some("https://generativelanguage.googleapis.com/v1beta/openai/".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub root_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    /// Entity type vocabulary offered to the extractor. Empty means free-form.
    #[serde(default)]
    pub entity_types: Vec<String>,
    #[serde(default)]
    pub relationship_types: Vec<String>,
    pub community_resolution: f64,
    pub community_min_size: usize,
    pub community_seed: u64,
    pub local_search_max_depth: usize,
    pub global_top_communities: usize,
    pub llm_concurrency: usize,
    pub embedding_batch_size: usize,
    pub query_embedding_cache_size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Stable identifier used for per-source hashing; defaults to `path`.
    #[serde(default)]
    pub id: Option<String>,
    pub path: String,
}

impl SourceConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self { id: None, path: path.into() }
    }

    pub fn source_id(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.path)
    }
}

fn default_neo4j_database() -> String {
    DEFAULT_NEO4J_DATABASE.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Neo4jConfig {
    pub url: String,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_neo4j_database")]
    pub database: String,
}

impl Neo4jConfig {
    /// Key used by the connection pool; the password is deliberately not part of it.
    pub fn connection_string(&self) -> String {
        format!("{}|{}|{}", self.url.trim_end_matches('/'), self.username, self.database)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum GraphBackendConfig {
    #[default]
    Memory,
    Neo4j(Neo4jConfig),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeStoreConfig {
    pub name: String,
    #[serde(default)]
    pub kind: StoreKind,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub graph: GraphBackendConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub llm: LLMConfig,
    pub storage: StorageConfig,
    pub indexing: IndexingConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub stores: Vec<KnowledgeStoreConfig>,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigValidationError {
    #[error("knowledge store name must not be empty")]
    EmptyStoreName,
    #[error("duplicate knowledge store name: {0}")]
    DuplicateStore(String),
    #[error("knowledge store {0} has no sources")]
    NoSources(String),
    #[error("chunk_overlap ({overlap}) must be smaller than chunk_size ({size})")]
    InvalidChunking { size: usize, overlap: usize },
    #[error("knowledge store {0} uses neo4j without a url")]
    MissingNeo4jUrl(String),
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            provider: LLMProvider::OpenAI,
            openai_api_key: None,
            google_api_key: None,
            model: String::new(),
            embedding_model: String::new(),
            base_url: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root_dir: DEFAULT_STORAGE_ROOT_DIR.into(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_SERVER_BIND_ADDR.into(),
        }
    }
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            entity_types: Vec::new(),
            relationship_types: Vec::new(),
            community_resolution: DEFAULT_COMMUNITY_RESOLUTION,
            community_min_size: DEFAULT_COMMUNITY_MIN_SIZE,
            community_seed: DEFAULT_COMMUNITY_SEED,
            local_search_max_depth: DEFAULT_LOCAL_SEARCH_MAX_DEPTH,
            global_top_communities: DEFAULT_GLOBAL_TOP_COMMUNITIES,
            llm_concurrency: DEFAULT_LLM_CONCURRENCY,
            embedding_batch_size: DEFAULT_EMBEDDING_BATCH_SIZE,
            query_embedding_cache_size: DEFAULT_QUERY_EMBEDDING_CACHE_SIZE,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            llm: LLMConfig::default(),
            storage: StorageConfig::default(),
            indexing: IndexingConfig::default(),
            server: ServerConfig::default(),
            stores: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Loads `config.toml` (optional) from the working directory.
    pub fn load() -> Result<Self, ConfigError> {
        let path = env::var("GRAPHRAG_CONFIG").unwrap_or_else(|_| "config".to_string());
        Self::load_from(&path)
    }

    pub fn load_from(path: &str) -> Result<Self, ConfigError> {
        let s = Self::builder_with_defaults()?
            .add_source(File::with_name(path).required(false))

            // Environment: GRAPHRAG__LLM__PROVIDER=Gemini -> llm.provider=Gemini
            .add_source(Environment::with_prefix("GRAPHRAG").separator("__"))

            // Legacy ENV overrides
            .set_override_option("llm.openai_api_key", env::var("OPENAI_API_KEY").ok())?
            .set_override_option("llm.google_api_key", env::var("GOOGLE_API_KEY").ok())?
            .set_override_option("llm.model", env::var("LLM_MODEL").ok())?
            .set_override_option("llm.embedding_model", env::var("EMBEDDING_MODEL").ok())?

            .build()?;

        s.try_deserialize()
    }

    fn builder_with_defaults() -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        Config::builder()
            .set_default("llm.provider", "OpenAI")?
            .set_default("llm.model", "gpt-4o-mini")?
            .set_default("llm.embedding_model", "text-embedding-3-small")?
            .set_default("storage.root_dir", DEFAULT_STORAGE_ROOT_DIR)?
            .set_default("server.bind_addr", DEFAULT_SERVER_BIND_ADDR)?
            .set_default("indexing.chunk_size", DEFAULT_CHUNK_SIZE as i64)?
            .set_default("indexing.chunk_overlap", DEFAULT_CHUNK_OVERLAP as i64)?
            .set_default("indexing.community_resolution", DEFAULT_COMMUNITY_RESOLUTION)?
            .set_default("indexing.community_min_size", DEFAULT_COMMUNITY_MIN_SIZE as i64)?
            .set_default("indexing.community_seed", DEFAULT_COMMUNITY_SEED)?
            .set_default("indexing.local_search_max_depth", DEFAULT_LOCAL_SEARCH_MAX_DEPTH as i64)?
            .set_default("indexing.global_top_communities", DEFAULT_GLOBAL_TOP_COMMUNITIES as i64)?
            .set_default("indexing.llm_concurrency", DEFAULT_LLM_CONCURRENCY as i64)?
            .set_default("indexing.embedding_batch_size", DEFAULT_EMBEDDING_BATCH_SIZE as i64)?
            .set_default("indexing.query_embedding_cache_size", DEFAULT_QUERY_EMBEDDING_CACHE_SIZE)
    }

    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.indexing.chunk_overlap >= self.indexing.chunk_size {
            return Err(ConfigValidationError::InvalidChunking {
                size: self.indexing.chunk_size,
                overlap: self.indexing.chunk_overlap,
            });
        }

        let mut seen = HashSet::new();
        for store in &self.stores {
            if store.name.trim().is_empty() {
                return Err(ConfigValidationError::EmptyStoreName);
            }
            if !seen.insert(store.name.as_str()) {
                return Err(ConfigValidationError::DuplicateStore(store.name.clone()));
            }
            if store.sources.is_empty() {
                return Err(ConfigValidationError::NoSources(store.name.clone()));
            }
            if let GraphBackendConfig::Neo4j(neo) = &store.graph {
                if neo.url.trim().is_empty() {
                    return Err(ConfigValidationError::MissingNeo4jUrl(store.name.clone()));
                }
            }
        }
        Ok(())
    }

    pub fn store(&self, name: &str) -> Option<&KnowledgeStoreConfig> {
        self.stores.iter().find(|s| s.name == name)
    }
}
