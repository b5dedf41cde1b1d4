pub mod openai;
pub mod cached;

pub use openai::OpenAIClient;
pub use cached::CachedEmbeddings;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use graphrag_common::TokenUsage;
use graphrag_common::config::LLMConfig;

pub fn create_llm_client(config: &LLMConfig) -> Option<Arc<OpenAIClient>> {
    let api_key = config.get_active_key()?;
    Some(Arc::new(OpenAIClient::new(
        api_key,
        config.model.clone(),
        config.embedding_model.clone(),
        config.get_base_url(),
    )))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LLMResponse<T> {
    pub data: T,
    pub usage: TokenUsage,
}

/// Text-completion collaborator used by extraction, summarization and global search.
#[async_trait]
pub trait LLMClient: Send + Sync {
    async fn invoke(&self, messages: Vec<ChatMessage>) -> Result<LLMResponse<String>>;
}

/// Embedding collaborator used by local search and by the indexing pipeline.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    async fn embed_query(&self, text: &str) -> Result<LLMResponse<Vec<f32>>>;

    /// Batch embed multiple texts. Returns embeddings in the same order as input.
    /// Default implementation falls back to individual embed_query() calls.
    async fn embed_documents(&self, texts: Vec<String>) -> Result<LLMResponse<Vec<Vec<f32>>>> {
        let mut results = Vec::with_capacity(texts.len());
        let mut total_usage = TokenUsage::default();

        for text in texts {
            let res = self.embed_query(&text).await?;
            results.push(res.data);
            total_usage.add(&res.usage);
        }
        Ok(LLMResponse { data: results, usage: total_usage })
    }

    fn model_name(&self) -> String {
        String::new()
    }
}

/// Keeps prompts within the context window of every supported model.
pub(crate) const MAX_CONTEXT_CHARS: usize = 60_000;

/// Joins entries until the next one would exceed `MAX_CONTEXT_CHARS`.
/// Returns the context plus (included, total) entry counts.
pub(crate) fn build_bounded_context(entries: impl IntoIterator<Item = String>, separator: &str) -> (String, usize, usize) {
    let mut context = String::new();
    let mut included = 0;
    let mut total = 0;
    let mut full = false;
    for entry in entries {
        total += 1;
        if full {
            continue;
        }
        let needed = if context.is_empty() { entry.len() } else { separator.len() + entry.len() };
        if context.len() + needed > MAX_CONTEXT_CHARS {
            full = true;
            continue;
        }
        if !context.is_empty() {
            context.push_str(separator);
        }
        context.push_str(&entry);
        included += 1;
    }
    (context, included, total)
}

/// Strips a markdown code fence around a JSON payload, if present.
pub(crate) fn strip_code_fence(raw: &str) -> &str {
    raw.trim()
        .trim_start_matches("```json")
        .trim_start_matches("```JSON")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_code_fence() {
        assert_eq!(strip_code_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("```\n[]\n```"), "[]");
        assert_eq!(strip_code_fence("  {\"a\":1} "), "{\"a\":1}");
    }

    #[test]
    fn test_bounded_context_counts_dropped_entries() {
        let big = "x".repeat(MAX_CONTEXT_CHARS - 10);
        let entries = vec![big.clone(), "y".repeat(20), "z".to_string()];
        let (context, included, total) = build_bounded_context(entries, "\n");
        assert_eq!(context, big);
        assert_eq!(included, 1);
        assert_eq!(total, 3);
    }

    #[test]
    fn test_chat_message_wire_format() {
        let msg = ChatMessage::system("be terse");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "system");
        assert_eq!(json["content"], "be terse");
    }

    #[test]
    fn test_create_llm_client_requires_key() {
        assert!(create_llm_client(&LLMConfig::default()).is_none());
        let config = LLMConfig { openai_api_key: Some("sk-test".into()), ..Default::default() };
        assert!(create_llm_client(&config).is_some());
    }
}
