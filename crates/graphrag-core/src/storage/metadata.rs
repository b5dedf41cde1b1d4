use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use graphrag_common::KnowledgeStoreMetadata;
use crate::cache::write_json;

pub const METADATA_FILE: &str = "metadata.json";

/// Persists the lifecycle record of one knowledge store as `metadata.json`.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    path: PathBuf,
}

impl MetadataStore {
    pub fn new(store_dir: impl AsRef<Path>) -> Self {
        Self { path: store_dir.as_ref().join(METADATA_FILE) }
    }

    /// `None` when the file is missing or unreadable.
    pub async fn load(&self) -> Option<KnowledgeStoreMetadata> {
        let raw = tokio::fs::read(&self.path).await.ok()?;
        match serde_json::from_slice(&raw) {
            Ok(meta) => Some(meta),
            Err(e) => {
                tracing::warn!("Ignoring malformed {}: {}", self.path.display(), e);
                None
            }
        }
    }

    pub async fn save(&self, meta: &KnowledgeStoreMetadata) -> Result<()> {
        write_json(&self.path, meta).await
            .with_context(|| format!("Failed to persist metadata of {}", meta.name))
    }
}
