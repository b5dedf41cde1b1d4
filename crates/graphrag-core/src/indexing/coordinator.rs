use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::RwLock;
use graphrag_common::config::{IndexingConfig, KnowledgeStoreConfig};
use graphrag_common::hashing::content_hash;
use graphrag_common::{
    Community, Document, ExtractedEntity, ExtractedRelationship, GraphNode, IndexingPhase,
    IndexingProgressEvent, IndexingStatus, KnowledgeStoreMetadata, SearchMode, SearchResult,
    StoreKind, TextChunk,
};
use crate::cache::{ExtractionCache, CONFIG_VERSION};
use crate::community::{CommunityDetector, CommunitySummarizer};
use crate::extraction::{deduplicate, to_graph, EntityExtractor, ExtractionResult};
use crate::llm::{EmbeddingClient, LLMClient};
use crate::search::{ChunkSearch, GlobalSearch, LocalSearch, SearchModeDetector};
use crate::storage::{GraphStore, MetadataStore};
use super::loader::{DocumentLoader, FileSystemLoader};
use super::splitter::TextSplitter;

/// Observer for build progress. Never influences the build itself.
pub type ProgressSink = Arc<dyn Fn(IndexingProgressEvent) + Send + Sync>;

const INTERRUPTED_MESSAGE: &str = "Indexing was interrupted before completion";
const CHUNK_NODE_TYPE: &str = "chunk";

type SharedOutcome = std::result::Result<IndexSummary, Arc<anyhow::Error>>;
type InFlightBuild = Shared<BoxFuture<'static, SharedOutcome>>;

/// Result of an index operation, as returned to every caller of the same build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexSummary {
    pub name: String,
    pub status: IndexingStatus,
    pub document_count: usize,
    pub chunk_count: usize,
    pub entity_count: usize,
    pub edge_count: usize,
    pub community_count: usize,
    pub duration_ms: Option<u64>,
    /// Extraction was served from the on-disk cache.
    pub from_cache: bool,
    /// Sources re-processed by this operation.
    pub changed_sources: usize,
}

impl IndexSummary {
    fn from_metadata(meta: &KnowledgeStoreMetadata, from_cache: bool, changed_sources: usize) -> Self {
        Self {
            name: meta.name.clone(),
            status: meta.status,
            document_count: meta.document_count,
            chunk_count: meta.chunk_count,
            entity_count: meta.entity_count,
            edge_count: meta.edge_count,
            community_count: meta.community_count,
            duration_ms: meta.last_duration_ms,
            from_cache,
            changed_sources,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BuildOp {
    Full { reuse_cache: bool },
    Refresh,
}

#[derive(Debug, Default)]
struct BuildOutcome {
    document_count: usize,
    chunk_count: usize,
    entity_count: usize,
    edge_count: usize,
    community_count: usize,
    source_hashes: BTreeMap<String, String>,
    from_cache: bool,
    changed_sources: usize,
    /// Refresh found nothing to do; metadata stays as it was.
    unchanged: bool,
}

#[derive(Debug, Default)]
struct GraphCounts {
    entity_count: usize,
    edge_count: usize,
    community_count: usize,
}

struct Progress<'a> {
    name: &'a str,
    sink: Option<&'a ProgressSink>,
}

impl Progress<'_> {
    fn emit(&self, phase: IndexingPhase, progress: u8, message: impl Into<String>) {
        let message = message.into();
        tracing::info!("[{}] {:?} {}%: {}", self.name, phase, progress, message);
        if let Some(sink) = self.sink {
            sink(IndexingProgressEvent {
                name: self.name.to_string(),
                phase,
                progress,
                message,
            });
        }
    }
}

/// Everything the coordinator keeps per registered knowledge store.
struct StoreRuntime {
    config: KnowledgeStoreConfig,
    graph: Arc<dyn GraphStore>,
    cache: ExtractionCache,
    metadata_store: MetadataStore,
    metadata: RwLock<KnowledgeStoreMetadata>,
    ready: AtomicBool,
}

impl StoreRuntime {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn snapshot(&self) -> KnowledgeStoreMetadata {
        self.metadata.read().await.clone()
    }

    async fn mark_indexing(&self) -> Result<()> {
        self.update(|m| {
            m.status = IndexingStatus::Indexing;
            m.error_message = None;
        })
        .await?;
        Ok(())
    }

    /// Applies `f` in memory, then persists the result outside the lock.
    async fn update<F>(&self, f: F) -> Result<KnowledgeStoreMetadata>
    where
        F: FnOnce(&mut KnowledgeStoreMetadata),
    {
        let snapshot = {
            let mut meta = self.metadata.write().await;
            f(&mut meta);
            meta.updated_at = Utc::now();
            meta.clone()
        };
        self.metadata_store.save(&snapshot).await?;
        Ok(snapshot)
    }
}

struct Inner {
    config: IndexingConfig,
    storage_root: PathBuf,
    llm: Arc<dyn LLMClient>,
    embeddings: Arc<dyn EmbeddingClient>,
    loader: Arc<dyn DocumentLoader>,
    stores: DashMap<String, Arc<StoreRuntime>>,
    in_flight: Mutex<HashMap<String, InFlightBuild>>,
}

/// Owns the lifecycle of every knowledge store: startup recovery, builds,
/// incremental refresh and search routing.
#[derive(Clone)]
pub struct IndexingCoordinator {
    inner: Arc<Inner>,
}

impl IndexingCoordinator {
    pub fn new(
        config: IndexingConfig,
        storage_root: impl Into<PathBuf>,
        llm: Arc<dyn LLMClient>,
        embeddings: Arc<dyn EmbeddingClient>,
    ) -> Self {
        Self::with_loader(config, storage_root, llm, embeddings, Arc::new(FileSystemLoader::new()))
    }

    pub fn with_loader(
        config: IndexingConfig,
        storage_root: impl Into<PathBuf>,
        llm: Arc<dyn LLMClient>,
        embeddings: Arc<dyn EmbeddingClient>,
        loader: Arc<dyn DocumentLoader>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                storage_root: storage_root.into(),
                llm,
                embeddings,
                loader,
                stores: DashMap::new(),
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Adds a store backed by an already constructed graph. Names must be unique.
    pub fn register(&self, config: KnowledgeStoreConfig, graph: Arc<dyn GraphStore>) -> Result<()> {
        match self.inner.stores.entry(config.name.clone()) {
            Entry::Occupied(_) => bail!("Knowledge store {} is already registered", config.name),
            Entry::Vacant(slot) => {
                let dir = self.inner.storage_root.join(&config.name);
                tracing::debug!("Registered knowledge store {} at {}", config.name, dir.display());
                slot.insert(Arc::new(StoreRuntime {
                    cache: ExtractionCache::new(&dir),
                    metadata_store: MetadataStore::new(&dir),
                    metadata: RwLock::new(KnowledgeStoreMetadata::new(&config.name, config.kind)),
                    ready: AtomicBool::new(false),
                    graph,
                    config,
                }));
                Ok(())
            }
        }
    }

    /// Loads persisted metadata for every registered store, marks interrupted
    /// builds as failed and restores indexed stores from their cache.
    pub async fn start(&self) -> Result<()> {
        let runtimes: Vec<Arc<StoreRuntime>> = self.inner.stores.iter().map(|e| e.value().clone()).collect();
        for rt in runtimes {
            self.inner.recover(&rt).await?;
        }
        Ok(())
    }

    /// Builds the store unless it is already ready.
    pub async fn initialize(&self, name: &str, sink: Option<ProgressSink>) -> Result<IndexSummary> {
        let rt = self.inner.runtime(name)?;
        if rt.is_ready() {
            return Ok(IndexSummary::from_metadata(&rt.snapshot().await, false, 0));
        }
        self.run_single_flight(rt, BuildOp::Full { reuse_cache: true }, sink).await
    }

    /// Full build that re-extracts even when the extraction cache is valid.
    pub async fn rebuild(&self, name: &str, sink: Option<ProgressSink>) -> Result<IndexSummary> {
        let rt = self.inner.runtime(name)?;
        self.run_single_flight(rt, BuildOp::Full { reuse_cache: false }, sink).await
    }

    /// Re-processes only sources whose content changed or disappeared.
    pub async fn refresh(&self, name: &str, sink: Option<ProgressSink>) -> Result<IndexSummary> {
        let rt = self.inner.runtime(name)?;
        self.run_single_flight(rt, BuildOp::Refresh, sink).await
    }

    pub async fn search(&self, name: &str, query: &str, k: usize, mode: SearchMode) -> Result<Vec<SearchResult>> {
        let rt = self.inner.runtime(name)?;
        if !rt.is_ready() {
            bail!("Knowledge store {} is not indexed", name);
        }
        let config = &self.inner.config;
        match rt.config.kind {
            StoreKind::Vector => {
                ChunkSearch::new(rt.graph.clone(), self.inner.embeddings.clone())
                    .search(query, k)
                    .await
            }
            StoreKind::Graph => match SearchModeDetector::new().resolve(mode, query) {
                SearchMode::Global => {
                    GlobalSearch::new(rt.graph.clone(), self.inner.llm.clone(), config.global_top_communities, config.llm_concurrency)
                        .search(query, k)
                        .await
                }
                _ => {
                    LocalSearch::new(rt.graph.clone(), self.inner.embeddings.clone(), config.local_search_max_depth)
                        .search(query, k)
                        .await
                }
            },
        }
    }

    /// True once a build or restore has completed and the store is searchable.
    pub fn is_ready(&self, name: &str) -> bool {
        self.inner.runtime(name).is_ok_and(|rt| rt.is_ready())
    }

    pub async fn status(&self, name: &str) -> Option<KnowledgeStoreMetadata> {
        let rt = self.inner.runtime(name).ok()?;
        Some(rt.snapshot().await)
    }

    /// All registered stores, sorted by name.
    pub async fn list(&self) -> Vec<KnowledgeStoreMetadata> {
        let runtimes: Vec<Arc<StoreRuntime>> = self.inner.stores.iter().map(|e| e.value().clone()).collect();
        let mut all = Vec::with_capacity(runtimes.len());
        for rt in runtimes {
            all.push(rt.snapshot().await);
        }
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Joins the running build for this store, or starts one on a spawned task.
    async fn run_single_flight(&self, rt: Arc<StoreRuntime>, op: BuildOp, sink: Option<ProgressSink>) -> Result<IndexSummary> {
        let build = {
            let mut in_flight = self.inner.in_flight();
            match in_flight.get(rt.name()) {
                Some(running) => {
                    tracing::info!("[{}] Joining in-flight build", rt.name());
                    running.clone()
                }
                None => {
                    let key = rt.name().to_string();
                    let task_key = key.clone();
                    let inner = self.inner.clone();
                    let handle = tokio::spawn(async move {
                        let outcome = inner.clone().execute(rt, op, sink).await.map_err(Arc::new);
                        inner.in_flight().remove(&task_key);
                        outcome
                    });
                    let build = async move {
                        match handle.await {
                            Ok(outcome) => outcome,
                            Err(e) => Err(Arc::new(anyhow!("Indexing task failed: {}", e))),
                        }
                    }
                    .boxed()
                    .shared();
                    in_flight.insert(key, build.clone());
                    build
                }
            }
        };
        build.await.map_err(|e| anyhow!("{:#}", e))
    }
}

impl Inner {
    fn in_flight(&self) -> MutexGuard<'_, HashMap<String, InFlightBuild>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn runtime(&self, name: &str) -> Result<Arc<StoreRuntime>> {
        self.stores
            .get(name)
            .map(|e| e.value().clone())
            .ok_or_else(|| anyhow!("Unknown knowledge store: {}", name))
    }

    fn splitter(&self) -> TextSplitter {
        TextSplitter::from_config(&self.config)
    }

    fn extractor(&self) -> EntityExtractor {
        EntityExtractor::new(self.llm.clone())
            .with_vocabulary(self.config.entity_types.clone(), self.config.relationship_types.clone())
    }

    async fn recover(&self, rt: &StoreRuntime) -> Result<()> {
        let mut meta = rt.metadata_store.load().await
            .unwrap_or_else(|| KnowledgeStoreMetadata::new(rt.name(), rt.config.kind));
        meta.store_kind = rt.config.kind;

        match meta.status {
            IndexingStatus::Indexing => {
                tracing::warn!("[{}] Found an interrupted build, marking it as failed", rt.name());
                meta.status = IndexingStatus::Error;
                meta.error_message = Some(INTERRUPTED_MESSAGE.to_string());
                meta.updated_at = Utc::now();
            }
            IndexingStatus::Indexed => match self.restore(rt).await {
                Ok(true) => {
                    rt.ready.store(true, Ordering::SeqCst);
                    tracing::info!("[{}] Restored from cache", rt.name());
                }
                Ok(false) => {
                    tracing::warn!("[{}] Marked indexed but no cache found, needs a rebuild", rt.name());
                    meta.status = IndexingStatus::NotIndexed;
                    meta.updated_at = Utc::now();
                }
                Err(e) => {
                    tracing::error!("[{}] Restore failed: {:?}", rt.name(), e);
                    meta.status = IndexingStatus::Error;
                    meta.error_message = Some(format!("Restore from cache failed: {:#}", e));
                    meta.updated_at = Utc::now();
                }
            },
            IndexingStatus::NotIndexed | IndexingStatus::Error => {}
        }

        *rt.metadata.write().await = meta.clone();
        rt.metadata_store.save(&meta).await
    }

    /// Reloads the graph from disk without any LLM or embedding calls.
    async fn restore(&self, rt: &StoreRuntime) -> Result<bool> {
        if !rt.cache.has_cache().await {
            return Ok(false);
        }
        let Some(cached) = rt.cache.load().await else {
            return Ok(false);
        };
        let saved_nodes = rt.cache.load_nodes().await.unwrap_or_default();

        rt.graph.clear().await?;
        match rt.config.kind {
            StoreKind::Graph => {
                let (mut nodes, edges) = to_graph(&cached.entities, &cached.relationships);
                reuse_embeddings(StoreKind::Graph, &mut nodes, &saved_nodes);
                rt.graph.add_nodes(nodes).await?;
                rt.graph.add_edges(edges).await?;
                rt.graph.set_communities(cached.communities).await?;
            }
            StoreKind::Vector => rt.graph.add_nodes(saved_nodes).await?,
        }
        Ok(true)
    }

    async fn execute(self: Arc<Self>, rt: Arc<StoreRuntime>, op: BuildOp, sink: Option<ProgressSink>) -> Result<IndexSummary> {
        let started = Instant::now();
        let progress = Progress { name: rt.name(), sink: sink.as_ref() };

        let result = async {
            let outcome = match op {
                BuildOp::Full { reuse_cache } => self.full_build(&rt, reuse_cache, &progress).await?,
                BuildOp::Refresh => self.refresh_build(&rt, &progress).await?,
            };
            if outcome.unchanged {
                return Ok((outcome, rt.snapshot().await));
            }

            let elapsed = started.elapsed().as_millis() as u64;
            let model = self.embeddings.model_name();
            let meta = rt.update(|m| {
                m.status = IndexingStatus::Indexed;
                m.document_count = outcome.document_count;
                m.chunk_count = outcome.chunk_count;
                m.entity_count = outcome.entity_count;
                m.edge_count = outcome.edge_count;
                m.community_count = outcome.community_count;
                m.source_hashes = outcome.source_hashes.clone();
                m.indexed_at = Some(Utc::now());
                m.last_duration_ms = Some(elapsed);
                m.embedding_model = (!model.is_empty()).then_some(model);
                m.cache_version = Some(CONFIG_VERSION.to_string());
            })
            .await?;
            Ok::<_, anyhow::Error>((outcome, meta))
        }
        .await;

        match result {
            Ok((outcome, meta)) => {
                rt.ready.store(true, Ordering::SeqCst);
                let message = if outcome.unchanged {
                    "No sources changed".to_string()
                } else {
                    format!(
                        "Indexed {} documents, {} chunks, {} entities in {}ms",
                        meta.document_count, meta.chunk_count, meta.entity_count,
                        meta.last_duration_ms.unwrap_or_default()
                    )
                };
                progress.emit(IndexingPhase::Done, 100, message);
                Ok(IndexSummary::from_metadata(&meta, outcome.from_cache, outcome.changed_sources))
            }
            Err(e) => {
                rt.ready.store(false, Ordering::SeqCst);
                let message = format!("{:#}", e);
                let elapsed = started.elapsed().as_millis() as u64;
                let failed = rt.update(|m| {
                    m.status = IndexingStatus::Error;
                    m.error_message = Some(message.clone());
                    m.last_duration_ms = Some(elapsed);
                })
                .await;
                if let Err(save_err) = failed {
                    tracing::warn!("[{}] Could not persist failure status: {:?}", rt.name(), save_err);
                }
                tracing::error!("[{}] Indexing failed: {:?}", rt.name(), e);
                progress.emit(IndexingPhase::Error, 100, message);
                Err(e)
            }
        }
    }

    async fn load_documents(&self, rt: &StoreRuntime) -> Result<Vec<Document>> {
        let mut documents = Vec::new();
        for source in &rt.config.sources {
            let loaded = self.loader.load(source).await
                .with_context(|| format!("Failed to load source {}", source.source_id()))?;
            documents.extend(loaded);
        }
        Ok(documents)
    }

    async fn full_build(&self, rt: &StoreRuntime, reuse_cache: bool, progress: &Progress<'_>) -> Result<BuildOutcome> {
        rt.mark_indexing().await?;
        progress.emit(IndexingPhase::Loading, 0, format!("Loading {} sources", rt.config.sources.len()));
        let documents = self.load_documents(rt).await?;

        progress.emit(IndexingPhase::Splitting, 10, format!("Splitting {} documents", documents.len()));
        let chunks = self.splitter().split_all(&documents);
        let source_hash = corpus_hash(&documents);
        let source_hashes = per_source_hashes(&documents);

        let mut outcome = BuildOutcome {
            document_count: documents.len(),
            chunk_count: chunks.len(),
            changed_sources: source_hashes.len(),
            source_hashes,
            ..Default::default()
        };

        match rt.config.kind {
            StoreKind::Graph => {
                let cached = if reuse_cache && rt.cache.is_valid(&source_hash).await {
                    rt.cache.load().await
                } else {
                    None
                };
                let (entities, relationships, communities) = match cached {
                    Some(cached) => {
                        progress.emit(
                            IndexingPhase::Extracting,
                            20,
                            format!("Reusing cached extraction of {} entities", cached.entities.len()),
                        );
                        outcome.from_cache = true;
                        (cached.entities, cached.relationships, Some(cached.communities))
                    }
                    None => {
                        progress.emit(IndexingPhase::Extracting, 20, format!("Extracting entities from {} chunks", chunks.len()));
                        let raw = self.extractor().extract_raw(&chunks).await;
                        rt.cache.save_raw(&raw).await?;
                        let (entities, relationships) = deduplicate(raw.entities, raw.relationships);
                        (entities, relationships, None)
                    }
                };
                let counts = self.assemble_graph(rt, &source_hash, entities, relationships, communities, progress).await?;
                outcome.entity_count = counts.entity_count;
                outcome.edge_count = counts.edge_count;
                outcome.community_count = counts.community_count;
            }
            StoreKind::Vector => {
                progress.emit(IndexingPhase::Embedding, 20, format!("Embedding {} chunks", chunks.len()));
                let mut nodes: Vec<GraphNode> = chunks.iter().map(chunk_node).collect();
                let previous = rt.cache.load_nodes().await.unwrap_or_default();
                self.embed_missing(StoreKind::Vector, &mut nodes, &previous).await?;

                progress.emit(IndexingPhase::Building, 60, format!("Storing {} chunk vectors", nodes.len()));
                rt.graph.clear().await?;
                rt.graph.add_nodes(nodes.clone()).await?;

                progress.emit(IndexingPhase::Caching, 90, "Persisting chunk vectors");
                rt.cache.save(&source_hash, &[], &[], &[]).await?;
                rt.cache.save_nodes(&nodes).await?;
            }
        }
        Ok(outcome)
    }

    async fn refresh_build(&self, rt: &StoreRuntime, progress: &Progress<'_>) -> Result<BuildOutcome> {
        let previous = rt.snapshot().await;
        if !rt.is_ready() || previous.source_hashes.is_empty() {
            tracing::info!("[{}] Nothing indexed yet, refresh runs a full build", rt.name());
            return self.full_build(rt, true, progress).await;
        }

        progress.emit(IndexingPhase::Loading, 0, format!("Loading {} sources", rt.config.sources.len()));
        let documents = self.load_documents(rt).await?;
        let current = per_source_hashes(&documents);
        let affected = changed_sources(&previous.source_hashes, &current);

        progress.emit(
            IndexingPhase::Splitting,
            10,
            format!("{} of {} sources changed", affected.len(), current.len()),
        );
        if affected.is_empty() {
            return Ok(BuildOutcome { unchanged: true, ..Default::default() });
        }

        let raw = match rt.config.kind {
            StoreKind::Graph => match rt.cache.load_raw().await {
                Some(raw) => Some(raw),
                None => {
                    tracing::warn!("[{}] Raw extraction records missing, refresh runs a full build", rt.name());
                    return self.full_build(rt, false, progress).await;
                }
            },
            StoreKind::Vector => None,
        };
        rt.mark_indexing().await?;

        let chunks = self.splitter().split_all(&documents);
        let fresh: Vec<TextChunk> = chunks.iter()
            .filter(|c| affected.contains(&c.source_id))
            .cloned()
            .collect();
        let source_hash = corpus_hash(&documents);

        let mut outcome = BuildOutcome {
            document_count: documents.len(),
            chunk_count: chunks.len(),
            source_hashes: current,
            changed_sources: affected.len(),
            ..Default::default()
        };

        // Graph stores carry raw records; vector stores only chunk vectors.
        match raw {
            Some(raw) => {
                let mut records = drop_sources(raw, &affected);

                progress.emit(
                    IndexingPhase::Extracting,
                    20,
                    format!("Extracting {} chunks from {} changed sources", fresh.len(), affected.len()),
                );
                let extracted = self.extractor().extract_raw(&fresh).await;
                records.entities.extend(extracted.entities);
                records.relationships.extend(extracted.relationships);
                let records = in_chunk_order(records, &chunks);
                rt.cache.save_raw(&records).await?;

                let (entities, relationships) = deduplicate(records.entities, records.relationships);

                let counts = self.assemble_graph(rt, &source_hash, entities, relationships, None, progress).await?;
                outcome.entity_count = counts.entity_count;
                outcome.edge_count = counts.edge_count;
                outcome.community_count = counts.community_count;
            }
            None => {
                progress.emit(IndexingPhase::Embedding, 20, format!("Embedding {} changed chunks", fresh.len()));
                let stale: Vec<String> = rt.graph.get_all_nodes().await?
                    .into_iter()
                    .filter(|n| affected.contains(TextChunk::source_of(&n.id)))
                    .map(|n| n.id)
                    .collect();
                rt.graph.remove_nodes(&stale).await?;

                let mut nodes: Vec<GraphNode> = fresh.iter().map(chunk_node).collect();
                self.embed_missing(StoreKind::Vector, &mut nodes, &[]).await?;

                progress.emit(
                    IndexingPhase::Building,
                    60,
                    format!("Replacing {} chunk vectors with {}", stale.len(), nodes.len()),
                );
                rt.graph.add_nodes(nodes).await?;

                progress.emit(IndexingPhase::Caching, 90, "Persisting chunk vectors");
                let all = rt.graph.get_all_nodes().await?;
                rt.cache.save(&source_hash, &[], &[], &[]).await?;
                rt.cache.save_nodes(&all).await?;
            }
        }
        Ok(outcome)
    }

    /// Replaces the graph with the given records, then persists them.
    /// Communities are detected and summarized unless supplied.
    async fn assemble_graph(
        &self,
        rt: &StoreRuntime,
        source_hash: &str,
        entities: Vec<ExtractedEntity>,
        relationships: Vec<ExtractedRelationship>,
        communities: Option<Vec<Community>>,
        progress: &Progress<'_>,
    ) -> Result<GraphCounts> {
        let (mut nodes, edges) = to_graph(&entities, &relationships);
        let counts = GraphCounts {
            entity_count: nodes.len(),
            edge_count: edges.len(),
            community_count: 0,
        };

        let (communities, summarized) = match communities {
            Some(c) => (c, true),
            None => {
                let node_ids: Vec<String> = nodes.iter().map(|n| n.id.clone()).collect();
                (CommunityDetector::from_config(&self.config).detect_from(&node_ids, &edges), false)
            }
        };

        progress.emit(
            IndexingPhase::Building,
            60,
            format!("Building graph with {} nodes, {} edges, {} communities", nodes.len(), edges.len(), communities.len()),
        );
        let previous = rt.cache.load_nodes().await.unwrap_or_default();
        let embedded = self.embed_missing(StoreKind::Graph, &mut nodes, &previous).await?;
        tracing::debug!("[{}] Embedded {} nodes, reused {}", rt.name(), embedded, nodes.len() - embedded);

        rt.graph.clear().await?;
        rt.graph.add_nodes(nodes.clone()).await?;
        rt.graph.add_edges(edges).await?;

        let communities = if summarized {
            communities
        } else {
            CommunitySummarizer::new(self.llm.clone(), self.config.llm_concurrency)
                .summarize(communities, rt.graph.as_ref())
                .await?
        };
        rt.graph.set_communities(communities.clone()).await?;

        progress.emit(IndexingPhase::Caching, 90, "Persisting extraction cache");
        rt.cache.save(source_hash, &entities, &relationships, &communities).await?;
        rt.cache.save_nodes(&nodes).await?;

        Ok(GraphCounts { community_count: communities.len(), ..counts })
    }

    /// Fills in embeddings, reusing persisted ones whose text is unchanged.
    /// Returns how many were computed.
    async fn embed_missing(&self, kind: StoreKind, nodes: &mut [GraphNode], previous: &[GraphNode]) -> Result<usize> {
        let missing = reuse_embeddings(kind, nodes, previous);
        for batch in missing.chunks(self.config.embedding_batch_size.max(1)) {
            let texts: Vec<String> = batch.iter().map(|&i| embedding_text(kind, &nodes[i])).collect();
            let response = self.embeddings.embed_documents(texts).await
                .context("Failed to embed graph nodes")?;
            if response.data.len() != batch.len() {
                bail!("Embedding count mismatch: sent {}, received {}", batch.len(), response.data.len());
            }
            for (&i, vector) in batch.iter().zip(response.data) {
                nodes[i].embedding = Some(vector);
            }
        }
        Ok(missing.len())
    }
}

fn chunk_node(chunk: &TextChunk) -> GraphNode {
    let mut node = GraphNode::new(chunk.id.clone(), CHUNK_NODE_TYPE, chunk.id.clone(), chunk.content.clone());
    node.source_chunk_ids.push(chunk.id.clone());
    node
}

fn embedding_text(kind: StoreKind, node: &GraphNode) -> String {
    match kind {
        StoreKind::Graph => node.embedding_text(),
        StoreKind::Vector => node.description.clone(),
    }
}

/// Copies embeddings over by node id when the embedded text is identical.
/// Returns the indices that still need one.
fn reuse_embeddings(kind: StoreKind, nodes: &mut [GraphNode], previous: &[GraphNode]) -> Vec<usize> {
    let by_id: HashMap<&str, &GraphNode> = previous.iter().map(|n| (n.id.as_str(), n)).collect();
    let mut missing = Vec::new();
    for (i, node) in nodes.iter_mut().enumerate() {
        if node.embedding.is_some() {
            continue;
        }
        let reused = by_id.get(node.id.as_str())
            .filter(|prev| embedding_text(kind, prev) == embedding_text(kind, node))
            .and_then(|prev| prev.embedding.clone());
        match reused {
            Some(embedding) => node.embedding = Some(embedding),
            None => missing.push(i),
        }
    }
    missing
}

fn per_source_hashes(documents: &[Document]) -> BTreeMap<String, String> {
    documents.iter()
        .map(|d| (d.source_id.clone(), content_hash([d.content.as_str()])))
        .collect()
}

fn corpus_hash(documents: &[Document]) -> String {
    let parts: Vec<&str> = documents.iter()
        .flat_map(|d| [d.source_id.as_str(), d.content.as_str()])
        .collect();
    ExtractionCache::compute_source_hash(&parts)
}

/// Sources whose hash differs, plus sources that disappeared.
fn changed_sources(previous: &BTreeMap<String, String>, current: &BTreeMap<String, String>) -> HashSet<String> {
    let modified = current.iter()
        .filter(|(id, hash)| previous.get(*id) != Some(*hash))
        .map(|(id, _)| id.clone());
    let removed = previous.keys()
        .filter(|id| !current.contains_key(*id))
        .cloned();
    modified.chain(removed).collect()
}

/// Drops raw records extracted from any of the given sources.
fn drop_sources(mut records: ExtractionResult, sources: &HashSet<String>) -> ExtractionResult {
    let untouched = |ids: &[String]| ids.iter().all(|id| !sources.contains(TextChunk::source_of(id)));
    records.entities.retain(|e| untouched(&e.source_chunk_ids));
    records.relationships.retain(|r| untouched(&r.source_chunk_ids));
    records
}

/// Stable sort by the position of each record's chunk, so merging sees
/// records in the same order a full extraction produces them.
fn in_chunk_order(mut records: ExtractionResult, chunks: &[TextChunk]) -> ExtractionResult {
    let position: HashMap<&str, usize> = chunks.iter()
        .enumerate()
        .map(|(i, c)| (c.id.as_str(), i))
        .collect();
    let rank = |ids: &[String]| ids.first()
        .and_then(|id| position.get(id.as_str()).copied())
        .unwrap_or(usize::MAX);
    records.entities.sort_by_key(|e| rank(&e.source_chunk_ids));
    records.relationships.sort_by_key(|r| rank(&r.source_chunk_ids));
    records
}

#[cfg(test)]
#[path = "coordinator_tests.rs"]
mod coordinator_tests;
