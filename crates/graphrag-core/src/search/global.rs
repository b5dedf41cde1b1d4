use anyhow::Result;
use futures::stream::{self, StreamExt};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use graphrag_common::{Community, SearchResult};
use crate::llm::{build_bounded_context, ChatMessage, LLMClient};
use crate::storage::GraphStore;

const MAP_PROMPT: &str = "You answer questions using ONLY the community summary provided. \
    If the summary contains nothing relevant to the question, reply with an empty string. \
    Do not speculate beyond the summary.";

const REDUCE_PROMPT: &str = "You are given partial answers to one question, each derived from a \
    different topic community of a knowledge graph. Combine them into one coherent answer. \
    Reconcile conflicting statements and remove redundancy.";

/// Map-reduce over community summaries for broad, corpus-level questions.
pub struct GlobalSearch {
    store: Arc<dyn GraphStore>,
    llm: Arc<dyn LLMClient>,
    top_communities: usize,
    concurrency: usize,
}

struct PartialAnswer {
    community_id: String,
    title: String,
    answer: String,
}

impl GlobalSearch {
    pub fn new(store: Arc<dyn GraphStore>, llm: Arc<dyn LLMClient>, top_communities: usize, concurrency: usize) -> Self {
        Self {
            store,
            llm,
            top_communities,
            concurrency: concurrency.max(1),
        }
    }

    /// `_k` is ignored: the result is at most one synthesized answer.
    pub async fn search(&self, query: &str, _k: usize) -> Result<Vec<SearchResult>> {
        let mut communities = self.store.get_communities().await?;
        if communities.is_empty() {
            return Ok(Vec::new());
        }

        communities.sort_by(|a, b| b.node_ids.len().cmp(&a.node_ids.len()));
        communities.truncate(self.top_communities);

        let partials: Vec<PartialAnswer> = stream::iter(communities)
            .filter(|c| {
                let has_summary = c.summary.as_deref().is_some_and(|s| !s.trim().is_empty());
                async move { has_summary }
            })
            .map(|community| self.map_community(query, community))
            .buffered(self.concurrency)
            .filter_map(|answer| async move { answer })
            .collect()
            .await;

        if partials.is_empty() {
            return Ok(Vec::new());
        }

        let (context, included, total) = build_bounded_context(
            partials.iter().map(|p| format!("[{}]\n{}", p.title, p.answer)),
            "\n---\n",
        );
        if included < total {
            tracing::warn!("Global search: truncated reduce context to {}/{} partial answers", included, total);
        }

        let response = self.llm
            .invoke(vec![
                ChatMessage::system(REDUCE_PROMPT),
                ChatMessage::user(format!("Question: {}\n\nPartial answers:\n{}", query, context)),
            ])
            .await?;

        let community_ids: Vec<&str> = partials.iter().map(|p| p.community_id.as_str()).collect();
        let mut metadata = HashMap::new();
        metadata.insert("communityIds".to_string(), json!(community_ids));

        Ok(vec![SearchResult {
            content: response.data.trim().to_string(),
            score: 1.0,
            source: None,
            metadata,
        }])
    }

    /// `None` when the community is irrelevant or the call failed.
    async fn map_community(&self, query: &str, community: Community) -> Option<PartialAnswer> {
        let title = community.title.clone().unwrap_or_else(|| format!("Community {}", community.id));
        let summary = community.summary.as_deref().unwrap_or_default();
        let messages = vec![
            ChatMessage::system(MAP_PROMPT),
            ChatMessage::user(format!("Community: {}\nSummary: {}\n\nQuestion: {}", title, summary, query)),
        ];

        match self.llm.invoke(messages).await {
            Ok(res) => {
                let answer = res.data.trim().trim_matches('"').trim();
                if answer.is_empty() {
                    tracing::debug!("Community {} had nothing relevant", community.id);
                    None
                } else {
                    Some(PartialAnswer { community_id: community.id, title, answer: answer.to_string() })
                }
            }
            Err(e) => {
                tracing::warn!("Map query failed for community {}: {:?}", community.id, e);
                None
            }
        }
    }
}
