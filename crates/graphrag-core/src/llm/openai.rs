use anyhow::{Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use graphrag_common::TokenUsage;
use super::{ChatMessage, EmbeddingClient, LLMClient, LLMResponse};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Clone, Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: Option<u32>,
    total_tokens: u32,
}

impl From<Usage> for TokenUsage {
    fn from(u: Usage) -> Self {
        TokenUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens.unwrap_or(0),
            total_tokens: u.total_tokens,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Clone, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedData>,
    usage: Option<Usage>,
}

#[derive(Debug, Clone, Deserialize)]
struct EmbedData {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

/// Client for any OpenAI-compatible `chat/completions` + `embeddings` endpoint.
pub struct OpenAIClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    embedding_model: String,
    temperature: f32,
}

impl OpenAIClient {
    pub fn new(api_key: String, model: String, embedding_model: String, base_url: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_default();

        Self {
            client,
            api_key,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            model,
            embedding_model,
            temperature: 0.0,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn post_json<T: Serialize + ?Sized>(&self, path: &str, body: &T, what: &str) -> Result<String> {
        let res = self.client.post(self.endpoint(path))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?;

        let status = res.status();
        let text = res.text().await?;

        if !status.is_success() {
            return Err(anyhow!("{} API error ({}): {}", what, status, text));
        }
        Ok(text)
    }
}

#[async_trait]
impl LLMClient for OpenAIClient {
    async fn invoke(&self, messages: Vec<ChatMessage>) -> Result<LLMResponse<String>> {
        let req = ChatRequest {
            model: &self.model,
            messages: &messages,
            temperature: self.temperature,
        };
        let body = self.post_json("chat/completions", &req, "Chat").await?;

        let parsed: ChatResponse = serde_json::from_str(&body)
            .map_err(|e| anyhow!("Failed to parse chat response: {} - body: {}", e, body))?;

        let content = parsed.choices.into_iter().next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| anyhow!("No content in chat response"))?;

        Ok(LLMResponse {
            data: content,
            usage: parsed.usage.map(TokenUsage::from).unwrap_or_default(),
        })
    }
}

#[async_trait]
impl EmbeddingClient for OpenAIClient {
    async fn embed_query(&self, text: &str) -> Result<LLMResponse<Vec<f32>>> {
        let results = self.embed_documents(vec![text.to_string()]).await?;
        let emb = results.data.into_iter().next().ok_or_else(|| anyhow!("Empty embedding response"))?;
        Ok(LLMResponse { data: emb, usage: results.usage })
    }

    async fn embed_documents(&self, texts: Vec<String>) -> Result<LLMResponse<Vec<Vec<f32>>>> {
        if texts.is_empty() {
            return Ok(LLMResponse { data: Vec::new(), usage: TokenUsage::default() });
        }
        let expected = texts.len();
        let req = EmbedRequest { model: &self.embedding_model, input: texts };
        let body = self.post_json("embeddings", &req, "Embedding").await?;

        let parsed: EmbedResponse = serde_json::from_str(&body)
            .map_err(|e| anyhow!("Failed to parse embedding response: {} - body: {}", e, body))?;

        if parsed.data.len() != expected {
            return Err(anyhow!("Embedding count mismatch: sent {}, got {}", expected, parsed.data.len()));
        }

        let mut data = parsed.data;
        // Servers may return items out of order; `index` is authoritative when present.
        if data.iter().all(|d| d.index.is_some()) {
            data.sort_by_key(|d| d.index);
        }

        Ok(LLMResponse {
            data: data.into_iter().map(|d| d.embedding).collect(),
            usage: parsed.usage.map(TokenUsage::from).unwrap_or_default(),
        })
    }

    fn model_name(&self) -> String {
        self.embedding_model.clone()
    }
}

#[cfg(test)]
#[path = "openai_tests.rs"]
mod openai_tests;
