pub mod llm;
pub mod storage;
pub mod extraction;
pub mod community;
pub mod cache;
pub mod search;
pub mod indexing;

pub use llm::{CachedEmbeddings, EmbeddingClient, LLMClient, OpenAIClient};
pub use storage::{GraphConnectionPool, GraphStore, InMemoryGraphStore, Neo4jGraphStore};
pub use extraction::EntityExtractor;
pub use community::{CommunityDetector, CommunitySummarizer};
pub use cache::ExtractionCache;
pub use search::{ChunkSearch, GlobalSearch, LocalSearch, SearchModeDetector};
pub use indexing::{IndexSummary, IndexingCoordinator, ProgressSink};

// Re-export common types for convenience
pub use graphrag_common::{Community, GraphEdge, GraphNode, SearchMode, SearchResult};
