use anyhow::{Context, Result};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use graphrag_common::hashing::content_hash;
use graphrag_common::{CacheMetadata, Community, ExtractedEntity, ExtractedRelationship, GraphNode};
use crate::extraction::ExtractionResult;

/// Bump whenever prompts, dedup rules or the on-disk shape change.
pub const CONFIG_VERSION: &str = "extraction-v4";

const CACHE_METADATA_FILE: &str = "cache-metadata.json";
const ENTITIES_FILE: &str = "entities.json";
const RELATIONSHIPS_FILE: &str = "relationships.json";
const COMMUNITIES_FILE: &str = "communities.json";
const NODES_FILE: &str = "nodes.json";
const RAW_RECORDS_FILE: &str = "raw-records.json";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CachedExtraction {
    pub entities: Vec<ExtractedEntity>,
    pub relationships: Vec<ExtractedRelationship>,
    pub communities: Vec<Community>,
}

/// Writes through a sibling temp file so readers never see a half-written file.
pub(crate) async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    let json = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json).await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path).await
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

/// Missing or malformed files read as `None`.
async fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let raw = tokio::fs::read(path).await.ok()?;
    match serde_json::from_slice(&raw) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!("Ignoring malformed cache file {}: {}", path.display(), e);
            None
        }
    }
}

/// On-disk extraction results of one knowledge store, keyed by source content hash.
#[derive(Debug, Clone)]
pub struct ExtractionCache {
    dir: PathBuf,
}

impl ExtractionCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn compute_source_hash<S: AsRef<str>>(contents: &[S]) -> String {
        content_hash(contents.iter().map(|c| c.as_ref()))
    }

    pub async fn metadata(&self) -> Option<CacheMetadata> {
        read_json(&self.file(CACHE_METADATA_FILE)).await
    }

    /// True only if the stored hash and config version both match.
    pub async fn is_valid(&self, source_hash: &str) -> bool {
        match self.metadata().await {
            Some(meta) => meta.source_hash == source_hash && meta.config_version == CONFIG_VERSION,
            None => false,
        }
    }

    /// Existence check without hash comparison.
    pub async fn has_cache(&self) -> bool {
        tokio::fs::try_exists(self.file(CACHE_METADATA_FILE)).await.unwrap_or(false)
            && tokio::fs::try_exists(self.file(ENTITIES_FILE)).await.unwrap_or(false)
    }

    pub async fn load(&self) -> Option<CachedExtraction> {
        self.metadata().await?;
        let entities = read_json(&self.file(ENTITIES_FILE)).await?;
        let relationships = read_json(&self.file(RELATIONSHIPS_FILE)).await?;
        let communities = read_json(&self.file(COMMUNITIES_FILE)).await.unwrap_or_default();
        Some(CachedExtraction { entities, relationships, communities })
    }

    pub async fn save(
        &self,
        source_hash: &str,
        entities: &[ExtractedEntity],
        relationships: &[ExtractedRelationship],
        communities: &[Community],
    ) -> Result<()> {
        write_json(&self.file(ENTITIES_FILE), entities).await?;
        write_json(&self.file(RELATIONSHIPS_FILE), relationships).await?;
        write_json(&self.file(COMMUNITIES_FILE), communities).await?;
        // Metadata last: a crash mid-save leaves the cache invalid rather than inconsistent.
        let meta = CacheMetadata {
            source_hash: source_hash.to_string(),
            extracted_at: Utc::now(),
            config_version: CONFIG_VERSION.to_string(),
        };
        write_json(&self.file(CACHE_METADATA_FILE), &meta).await?;
        tracing::debug!(
            "Cached {} entities, {} relationships, {} communities in {}",
            entities.len(), relationships.len(), communities.len(), self.dir.display()
        );
        Ok(())
    }

    pub async fn save_nodes(&self, nodes: &[GraphNode]) -> Result<()> {
        write_json(&self.file(NODES_FILE), nodes).await
    }

    pub async fn load_nodes(&self) -> Option<Vec<GraphNode>> {
        read_json(&self.file(NODES_FILE)).await
    }

    /// Pre-merge records, one per chunk mention, used to re-merge after a refresh.
    pub async fn save_raw(&self, records: &ExtractionResult) -> Result<()> {
        write_json(&self.file(RAW_RECORDS_FILE), records).await
    }

    pub async fn load_raw(&self) -> Option<ExtractionResult> {
        read_json(&self.file(RAW_RECORDS_FILE)).await
    }

    pub async fn clear(&self) -> Result<()> {
        for name in [CACHE_METADATA_FILE, ENTITIES_FILE, RELATIONSHIPS_FILE, COMMUNITIES_FILE, NODES_FILE, RAW_RECORDS_FILE] {
            match tokio::fs::remove_file(self.file(name)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).with_context(|| format!("Failed to remove {}", name)),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (Vec<ExtractedEntity>, Vec<ExtractedRelationship>, Vec<Community>) {
        let mut acme = ExtractedEntity::new("Acme", "Org", "Rocket maker");
        acme.source_chunk_ids.push("doc#0".into());
        let wile = ExtractedEntity::new("Wile", "Person", "");
        let rel = ExtractedRelationship::new("Wile", "Acme", "buys_from", 0.75);
        let mut community = Community::new("community-0", vec!["acme::org".into(), "wile::person".into()]);
        community.title = Some("Acme customers".into());
        (vec![acme, wile], vec![rel], vec![community])
    }

    #[tokio::test]
    async fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ExtractionCache::new(dir.path());
        let (e, r, c) = sample();
        let hash = ExtractionCache::compute_source_hash(&["hello", "world"]);

        assert!(!cache.has_cache().await);
        assert!(!cache.is_valid(&hash).await);

        cache.save(&hash, &e, &r, &c).await.unwrap();
        let loaded = cache.load().await.expect("cache present");
        assert_eq!(loaded, CachedExtraction { entities: e, relationships: r, communities: c });
        assert!(cache.has_cache().await);
        assert!(cache.is_valid(&hash).await);
        assert!(!cache.is_valid("other-hash").await);
    }

    #[tokio::test]
    async fn test_clear_invalidates() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ExtractionCache::new(dir.path().join("kb1"));
        let (e, r, c) = sample();
        cache.save("h", &e, &r, &c).await.unwrap();
        cache.save_nodes(&[GraphNode::new("acme::org", "Org", "Acme", "").with_embedding(vec![1.0])]).await.unwrap();
        cache.save_raw(&ExtractionResult { entities: e, relationships: r }).await.unwrap();
        assert!(cache.load_raw().await.is_some());

        cache.clear().await.unwrap();
        assert!(cache.load_raw().await.is_none());
        assert!(!cache.is_valid("h").await);
        assert!(!cache.has_cache().await);
        assert!(cache.load().await.is_none());
        assert!(cache.load_nodes().await.is_none());
        // Clearing twice is fine.
        cache.clear().await.unwrap();
    }

    #[tokio::test]
    async fn test_version_mismatch_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ExtractionCache::new(dir.path());
        let (e, r, c) = sample();
        cache.save("h", &e, &r, &c).await.unwrap();

        let stale = CacheMetadata {
            source_hash: "h".into(),
            extracted_at: Utc::now(),
            config_version: "extraction-v0".into(),
        };
        write_json(&dir.path().join(CACHE_METADATA_FILE), &stale).await.unwrap();
        assert!(!cache.is_valid("h").await);
        // Still restorable by existence check.
        assert!(cache.has_cache().await);
    }

    #[tokio::test]
    async fn test_corrupt_files_read_as_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ExtractionCache::new(dir.path());
        let (e, r, c) = sample();
        cache.save("h", &e, &r, &c).await.unwrap();
        std::fs::write(dir.path().join(ENTITIES_FILE), "[{broken").unwrap();
        std::fs::write(dir.path().join(NODES_FILE), "nope").unwrap();

        assert!(cache.load().await.is_none());
        assert!(cache.load_nodes().await.is_none());
    }

    #[tokio::test]
    async fn test_nodes_keep_embeddings() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ExtractionCache::new(dir.path());
        let nodes = vec![GraphNode::new("a::t", "t", "a", "").with_embedding(vec![0.25, 0.5])];
        cache.save_nodes(&nodes).await.unwrap();
        assert_eq!(cache.load_nodes().await, Some(nodes));
    }
}
