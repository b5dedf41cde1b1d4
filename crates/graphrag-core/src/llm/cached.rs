use anyhow::Result;
use async_trait::async_trait;
use moka::future::Cache;
use std::sync::Arc;
use graphrag_common::TokenUsage;
use super::{EmbeddingClient, LLMResponse};

/// Memoizes `embed_query` results by exact text. Document batches pass through
/// uncached since indexing rarely embeds the same text twice.
pub struct CachedEmbeddings {
    inner: Arc<dyn EmbeddingClient>,
    cache: Cache<String, Arc<Vec<f32>>>,
}

impl CachedEmbeddings {
    pub fn new(inner: Arc<dyn EmbeddingClient>, capacity: u64) -> Self {
        Self {
            inner,
            cache: Cache::new(capacity),
        }
    }
}

#[async_trait]
impl EmbeddingClient for CachedEmbeddings {
    async fn embed_query(&self, text: &str) -> Result<LLMResponse<Vec<f32>>> {
        if let Some(hit) = self.cache.get(text).await {
            return Ok(LLMResponse { data: hit.as_ref().clone(), usage: TokenUsage::default() });
        }
        let res = self.inner.embed_query(text).await?;
        self.cache.insert(text.to_string(), Arc::new(res.data.clone())).await;
        Ok(res)
    }

    async fn embed_documents(&self, texts: Vec<String>) -> Result<LLMResponse<Vec<Vec<f32>>>> {
        self.inner.embed_documents(texts).await
    }

    fn model_name(&self) -> String {
        self.inner.model_name()
    }
}
