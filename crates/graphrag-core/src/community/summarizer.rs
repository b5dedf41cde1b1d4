use anyhow::Result;
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use graphrag_common::{Community, GraphEdge, GraphNode};
use crate::llm::{build_bounded_context, strip_code_fence, ChatMessage, LLMClient};
use crate::storage::GraphStore;

#[derive(Debug, Deserialize)]
struct CommunityReport {
    title: String,
    summary: String,
}

/// Gives each community a title and summary drawn from its members and internal edges.
pub struct CommunitySummarizer {
    llm: Arc<dyn LLMClient>,
    concurrency: usize,
}

impl CommunitySummarizer {
    pub fn new(llm: Arc<dyn LLMClient>, concurrency: usize) -> Self {
        Self { llm, concurrency: concurrency.max(1) }
    }

    /// Returns copies in input order. A failed community gets a fallback title and summary.
    pub async fn summarize(&self, communities: Vec<Community>, store: &dyn GraphStore) -> Result<Vec<Community>> {
        if communities.is_empty() {
            return Ok(communities);
        }
        let edges = Arc::new(store.get_all_edges().await?);

        let summarized: Vec<Community> = stream::iter(communities)
            .map(|community| {
                let edges = edges.clone();
                async move {
                    match self.summarize_one(&community, &edges, store).await {
                        Ok(report) => Community {
                            title: Some(report.title),
                            summary: Some(report.summary),
                            ..community
                        },
                        Err(e) => {
                            tracing::warn!("Summarizing {} failed, using fallback: {:?}", community.id, e);
                            fallback(community)
                        }
                    }
                }
            })
            .buffered(self.concurrency)
            .collect()
            .await;

        Ok(summarized)
    }

    async fn summarize_one(&self, community: &Community, edges: &[GraphEdge], store: &dyn GraphStore) -> Result<CommunityReport> {
        let mut members: Vec<GraphNode> = Vec::with_capacity(community.node_ids.len());
        for id in &community.node_ids {
            if let Some(node) = store.get_node(id).await? {
                members.push(node);
            }
        }

        let member_ids: HashSet<&str> = community.node_ids.iter().map(String::as_str).collect();
        let names: HashMap<&str, &str> = members.iter().map(|n| (n.id.as_str(), n.name.as_str())).collect();

        let entity_lines = members.iter().map(|n| {
            if n.description.is_empty() {
                format!("- {} ({})", n.name, n.node_type)
            } else {
                format!("- {} ({}): {}", n.name, n.node_type, n.description)
            }
        });
        let relationship_lines = edges.iter()
            .filter(|e| member_ids.contains(e.source_id.as_str()) && member_ids.contains(e.target_id.as_str()))
            .map(|e| {
                let src = names.get(e.source_id.as_str()).copied().unwrap_or(&e.source_id);
                let tgt = names.get(e.target_id.as_str()).copied().unwrap_or(&e.target_id);
                if e.description.is_empty() {
                    format!("- {} -[{}]-> {}", src, e.edge_type, tgt)
                } else {
                    format!("- {} -[{}]-> {}: {}", src, e.edge_type, tgt, e.description)
                }
            });

        let (context, included, total) = build_bounded_context(
            std::iter::once("Entities:".to_string())
                .chain(entity_lines)
                .chain(std::iter::once("Relationships:".to_string()))
                .chain(relationship_lines),
            "\n",
        );
        if included < total {
            tracing::warn!("Community {}: truncated context to {}/{} lines", community.id, included, total);
        }

        let system_prompt = "You are a Community Report Generator. \
            The following entities and relationships form one community of a knowledge graph. \
            Identify the theme that binds them together. \
            \
            Output ONLY valid JSON: \
            {\"title\": \"Short Title (3-8 words)\", \"summary\": \"2-4 sentence summary\"}";

        let response = self.llm
            .invoke(vec![ChatMessage::system(system_prompt), ChatMessage::user(context)])
            .await?;
        let report: CommunityReport = serde_json::from_str(strip_code_fence(&response.data))?;
        if report.title.trim().is_empty() {
            anyhow::bail!("empty title");
        }
        Ok(report)
    }
}

fn fallback(community: Community) -> Community {
    let count = community.node_ids.len();
    Community {
        title: Some(format!("Community {}", community.id)),
        summary: Some(format!("A group of {} related entities.", count)),
        ..community
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::MockLLM;
    use crate::storage::InMemoryGraphStore;

    async fn seeded_store() -> InMemoryGraphStore {
        let store = InMemoryGraphStore::new();
        store.add_nodes(vec![
            GraphNode::new("acme::org", "org", "Acme", "Rocket maker"),
            GraphNode::new("wile::person", "person", "Wile", "Customer"),
            GraphNode::new("roadrunner::animal", "animal", "Road Runner", ""),
        ]).await.unwrap();
        store.add_edges(vec![
            GraphEdge::new("wile::person", "acme::org", "buys_from", 1.0),
            GraphEdge::new("wile::person", "roadrunner::animal", "chases", 1.0),
        ]).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_summary_uses_internal_edges_only() {
        let store = seeded_store().await;
        let llm = Arc::new(MockLLM::new(r#"```json
{"title": "Acme customers", "summary": "Wile buys from Acme."}
```"#));
        let summarizer = CommunitySummarizer::new(llm.clone(), 2);

        let community = Community::new("community-0", vec!["acme::org".into(), "wile::person".into()]);
        let out = summarizer.summarize(vec![community], &store).await.unwrap();

        assert_eq!(out[0].title.as_deref(), Some("Acme customers"));
        assert_eq!(out[0].summary.as_deref(), Some("Wile buys from Acme."));

        let prompts = llm.prompts.lock().unwrap();
        let context = &prompts[0][1].content;
        assert!(context.contains("Wile -[buys_from]-> Acme"));
        assert!(!context.contains("chases"));
        assert!(context.contains("Acme (org): Rocket maker"));
    }

    #[tokio::test]
    async fn test_failures_fall_back_per_community() {
        let store = seeded_store().await;
        let llm = Arc::new(MockLLM::with_replies(vec![
            Ok(r#"{"title": "First", "summary": "ok"}"#),
            Err("timeout"),
            Ok("not json at all"),
        ]));
        // Sequential so replies line up with communities.
        let summarizer = CommunitySummarizer::new(llm, 1);

        let communities = vec![
            Community::new("community-0", vec!["acme::org".into()]),
            Community::new("community-1", vec!["wile::person".into(), "acme::org".into()]),
            Community::new("community-2", vec!["roadrunner::animal".into()]),
        ];
        let out = summarizer.summarize(communities, &store).await.unwrap();

        assert_eq!(out.len(), 3);
        assert_eq!(out[0].title.as_deref(), Some("First"));
        assert_eq!(out[1].title.as_deref(), Some("Community community-1"));
        assert_eq!(out[1].summary.as_deref(), Some("A group of 2 related entities."));
        assert_eq!(out[2].title.as_deref(), Some("Community community-2"));
        assert_eq!(out[2].node_ids, vec!["roadrunner::animal"]);
    }

    #[tokio::test]
    async fn test_empty_input_skips_llm() {
        let store = InMemoryGraphStore::new();
        let llm = Arc::new(MockLLM::new("{}"));
        let out = CommunitySummarizer::new(llm.clone(), 4).summarize(Vec::new(), &store).await.unwrap();
        assert!(out.is_empty());
        assert_eq!(llm.call_count(), 0);
    }
}
