use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use graphrag_common::{ExtractedEntity, ExtractedRelationship, GraphEdge, GraphNode, TextChunk};
use crate::llm::{strip_code_fence, ChatMessage, LLMClient};

const DEFAULT_RELATIONSHIP_TYPE: &str = "related_to";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub entities: Vec<ExtractedEntity>,
    pub relationships: Vec<ExtractedRelationship>,
}

impl ExtractionResult {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relationships.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct RawExtraction {
    #[serde(default)]
    entities: Vec<RawEntity>,
    #[serde(default)]
    relationships: Vec<RawRelationship>,
}

#[derive(Debug, Deserialize)]
struct RawEntity {
    name: String,
    #[serde(rename = "type", default)]
    entity_type: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct RawRelationship {
    source: String,
    target: String,
    #[serde(rename = "type", default)]
    relationship_type: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    weight: Option<f64>,
}

fn normalize_weight(weight: Option<f64>) -> f32 {
    match weight {
        Some(w) if w.is_finite() => w.clamp(0.0, 1.0) as f32,
        _ => 1.0,
    }
}

/// Turns chunks into entities and relationships through the LLM, one chunk at a time.
pub struct EntityExtractor {
    llm: Arc<dyn LLMClient>,
    entity_types: Vec<String>,
    relationship_types: Vec<String>,
}

impl EntityExtractor {
    pub fn new(llm: Arc<dyn LLMClient>) -> Self {
        Self {
            llm,
            entity_types: Vec::new(),
            relationship_types: Vec::new(),
        }
    }

    pub fn with_vocabulary(mut self, entity_types: Vec<String>, relationship_types: Vec<String>) -> Self {
        self.entity_types = entity_types;
        self.relationship_types = relationship_types;
        self
    }

    fn system_prompt(&self) -> String {
        let entity_rule = if self.entity_types.is_empty() {
            "Identify the salient entities (people, organizations, places, concepts, events, products) and give each a short type label.".to_string()
        } else {
            format!("Only extract entities of these types: {}.", self.entity_types.join(", "))
        };
        let relationship_rule = if self.relationship_types.is_empty() {
            "Describe how entities relate using short snake_case relationship types.".to_string()
        } else {
            format!("Only use these relationship types: {}.", self.relationship_types.join(", "))
        };

        format!(
            "You are a knowledge graph extraction system. \
            Read the text and extract entities and the relationships between them. \
            {} {} \
            Relationship endpoints must be entity names exactly as extracted. \
            Weight is your confidence between 0 and 1. \
            \
            Output ONLY valid JSON: \
            {{\"entities\": [{{\"name\": \"...\", \"type\": \"...\", \"description\": \"...\"}}], \
            \"relationships\": [{{\"source\": \"...\", \"target\": \"...\", \"type\": \"...\", \"description\": \"...\", \"weight\": 0.8}}]}}",
            entity_rule, relationship_rule
        )
    }

    /// Extracts one chunk. LLM failures propagate; an unparseable reply yields an empty result.
    pub async fn extract_chunk(&self, chunk: &TextChunk) -> Result<ExtractionResult> {
        let messages = vec![
            ChatMessage::system(self.system_prompt()),
            ChatMessage::user(format!("Text:\n{}", chunk.content)),
        ];
        let response = self.llm.invoke(messages).await?;
        let clean_json = strip_code_fence(&response.data);

        let raw: RawExtraction = match serde_json::from_str(clean_json) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("Unparseable extraction for chunk {}: {}", chunk.id, e);
                return Ok(ExtractionResult::default());
            }
        };

        let entities = raw.entities.into_iter()
            .filter(|e| !e.name.trim().is_empty())
            .map(|e| {
                let mut entity = ExtractedEntity::new(e.name.trim(), e.entity_type.trim(), e.description.trim());
                entity.source_chunk_ids.push(chunk.id.clone());
                entity
            })
            .collect();

        let relationships = raw.relationships.into_iter()
            .filter(|r| !r.source.trim().is_empty() && !r.target.trim().is_empty())
            .map(|r| {
                let rel_type = if r.relationship_type.trim().is_empty() {
                    DEFAULT_RELATIONSHIP_TYPE
                } else {
                    r.relationship_type.trim()
                };
                let mut rel = ExtractedRelationship::new(r.source.trim(), r.target.trim(), rel_type, normalize_weight(r.weight));
                rel.description = r.description.trim().to_string();
                rel.source_chunk_ids.push(chunk.id.clone());
                rel
            })
            .collect();

        Ok(ExtractionResult { entities, relationships })
    }

    /// Deduplicated extraction over all chunks.
    pub async fn extract_from_chunks(&self, chunks: &[TextChunk]) -> ExtractionResult {
        let raw = self.extract_raw(chunks).await;
        let (entities, relationships) = deduplicate(raw.entities, raw.relationships);
        ExtractionResult { entities, relationships }
    }

    /// Per-chunk records in chunk order, before any merging.
    /// Sequential on purpose: provider rate limits. Failed chunks are logged and skipped.
    pub async fn extract_raw(&self, chunks: &[TextChunk]) -> ExtractionResult {
        let mut combined = ExtractionResult::default();
        for (i, chunk) in chunks.iter().enumerate() {
            match self.extract_chunk(chunk).await {
                Ok(result) => {
                    tracing::debug!(
                        "Chunk {}/{} ({}): {} entities, {} relationships",
                        i + 1, chunks.len(), chunk.id, result.entities.len(), result.relationships.len()
                    );
                    combined.entities.extend(result.entities);
                    combined.relationships.extend(result.relationships);
                }
                Err(e) => tracing::warn!("Extraction failed for chunk {}: {:?}", chunk.id, e),
            }
        }
        combined
    }
}

fn keep_longer(current: &mut String, candidate: &str) {
    if candidate.len() > current.len() {
        *current = candidate.to_string();
    }
}

fn append_unique(ids: &mut Vec<String>, more: &[String]) {
    for id in more {
        if !ids.contains(id) {
            ids.push(id.clone());
        }
    }
}

/// Lowercased name -> (canonical name, entity key), first occurrence wins.
fn name_index(entities: &[ExtractedEntity]) -> HashMap<String, (String, String)> {
    let mut index = HashMap::new();
    for e in entities {
        index.entry(e.name.trim().to_lowercase())
            .or_insert_with(|| (e.name.clone(), e.key()));
    }
    index
}

fn endpoint_key(index: &HashMap<String, (String, String)>, name: &str) -> String {
    index.get(&name.trim().to_lowercase())
        .map(|(_, key)| key.clone())
        .unwrap_or_else(|| name.trim().to_lowercase())
}

/// Merges entities by `name::type` and relationships by `source -> type -> target`,
/// rewriting relationship endpoints to the canonical entity spelling.
/// Applying it to its own output changes nothing.
pub fn deduplicate(
    entities: Vec<ExtractedEntity>,
    relationships: Vec<ExtractedRelationship>,
) -> (Vec<ExtractedEntity>, Vec<ExtractedRelationship>) {
    let mut merged: Vec<ExtractedEntity> = Vec::new();
    let mut by_key: HashMap<String, usize> = HashMap::new();

    for entity in entities {
        match by_key.get(&entity.key()) {
            Some(&i) => {
                let canonical = &mut merged[i];
                keep_longer(&mut canonical.description, &entity.description);
                append_unique(&mut canonical.source_chunk_ids, &entity.source_chunk_ids);
            }
            None => {
                by_key.insert(entity.key(), merged.len());
                merged.push(entity);
            }
        }
    }

    let names = name_index(&merged);
    let mut merged_rels: Vec<ExtractedRelationship> = Vec::new();
    let mut rel_by_key: HashMap<String, usize> = HashMap::new();

    for mut rel in relationships {
        if let Some((canonical, _)) = names.get(&rel.source.trim().to_lowercase()) {
            rel.source = canonical.clone();
        }
        if let Some((canonical, _)) = names.get(&rel.target.trim().to_lowercase()) {
            rel.target = canonical.clone();
        }
        let key = format!(
            "{} -> {} -> {}",
            endpoint_key(&names, &rel.source),
            rel.relationship_type.trim().to_lowercase(),
            endpoint_key(&names, &rel.target)
        );

        match rel_by_key.get(&key) {
            Some(&i) => {
                let existing = &mut merged_rels[i];
                existing.weight = (existing.weight + rel.weight) / 2.0;
                keep_longer(&mut existing.description, &rel.description);
                append_unique(&mut existing.source_chunk_ids, &rel.source_chunk_ids);
            }
            None => {
                rel_by_key.insert(key, merged_rels.len());
                merged_rels.push(rel);
            }
        }
    }

    (merged, merged_rels)
}

/// Maps deduplicated records onto graph nodes/edges. Relationships whose
/// endpoints match no entity are dropped.
pub fn to_graph(
    entities: &[ExtractedEntity],
    relationships: &[ExtractedRelationship],
) -> (Vec<GraphNode>, Vec<GraphEdge>) {
    let nodes: Vec<GraphNode> = entities.iter()
        .map(|e| {
            let mut node = GraphNode::new(e.key(), e.entity_type.clone(), e.name.clone(), e.description.clone());
            node.source_chunk_ids = e.source_chunk_ids.clone();
            node
        })
        .collect();

    let names = name_index(entities);
    let mut edges = Vec::with_capacity(relationships.len());
    for rel in relationships {
        let lookup = |name: &str| names.get(&name.trim().to_lowercase()).map(|(_, key)| key.clone());
        let (Some(src), Some(tgt)) = (lookup(&rel.source), lookup(&rel.target)) else {
            tracing::debug!("Dropping relationship {} -> {} with unknown endpoint", rel.source, rel.target);
            continue;
        };
        let mut edge = GraphEdge::new(src, tgt, rel.relationship_type.clone(), rel.weight);
        edge.description = rel.description.clone();
        edge.properties.insert("sourceChunkIds".into(), serde_json::json!(rel.source_chunk_ids));
        edges.push(edge);
    }
    (nodes, edges)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::MockLLM;
    use graphrag_common::entity_key;

    fn entity(name: &str, ty: &str, desc: &str, chunk: &str) -> ExtractedEntity {
        let mut e = ExtractedEntity::new(name, ty, desc);
        e.source_chunk_ids.push(chunk.into());
        e
    }

    fn rel(src: &str, tgt: &str, ty: &str, weight: f32, chunk: &str) -> ExtractedRelationship {
        let mut r = ExtractedRelationship::new(src, tgt, ty, weight);
        r.source_chunk_ids.push(chunk.into());
        r
    }

    #[test]
    fn test_canonical_rewriting() {
        let entities = vec![
            entity("Acme Corp", "Org", "A company", "doc#0"),
            entity("ACME CORP", "Org", "A rocket company in Texas", "doc#1"),
            entity("Wile", "Person", "", "doc#1"),
        ];
        let relationships = vec![rel("Wile", "ACME CORP", "buys_from", 0.8, "doc#1")];

        let (entities, relationships) = deduplicate(entities, relationships);
        assert_eq!(entities.len(), 2);
        let acme = &entities[0];
        assert_eq!(acme.name, "Acme Corp");
        assert_eq!(acme.description, "A rocket company in Texas");
        assert_eq!(acme.source_chunk_ids, vec!["doc#0", "doc#1"]);
        assert_eq!(relationships[0].target, "Acme Corp");

        let (nodes, edges) = to_graph(&entities, &relationships);
        assert_eq!(nodes.iter().filter(|n| n.node_type == "Org").count(), 1);
        assert_eq!(edges[0].target_id, "acme corp::org");
        assert_eq!(edges[0].id, "wile::person -> buys_from -> acme corp::org");
    }

    #[test]
    fn test_relationship_merge_averages_weight() {
        let entities = vec![entity("A", "t", "", "c#0"), entity("B", "t", "", "c#0")];
        let relationships = vec![
            rel("A", "B", "Knows", 1.0, "c#0"),
            rel("a", "b", "knows", 0.5, "c#1"),
        ];
        let (_, rels) = deduplicate(entities, relationships);
        assert_eq!(rels.len(), 1);
        assert!((rels[0].weight - 0.75).abs() < 1e-6);
        assert_eq!(rels[0].source_chunk_ids, vec!["c#0", "c#1"]);
        assert_eq!(rels[0].source, "A");
    }

    #[test]
    fn test_deduplicate_is_idempotent() {
        let entities = vec![
            entity("Acme", "Org", "x", "c#0"),
            entity("acme", "org", "longer", "c#1"),
            entity("Road Runner", "Animal", "fast", "c#1"),
        ];
        let relationships = vec![
            rel("acme", "Road Runner", "chases", 0.4, "c#0"),
            rel("ACME", "road runner", "CHASES", 0.6, "c#1"),
        ];
        let once = deduplicate(entities, relationships);
        let twice = deduplicate(once.0.clone(), once.1.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_same_name_different_type_stays_distinct() {
        let entities = vec![entity("Mercury", "Planet", "", "c#0"), entity("Mercury", "Element", "", "c#0")];
        let (merged, _) = deduplicate(entities, Vec::new());
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].key(), entity_key("mercury", "planet"));
    }

    #[test]
    fn test_to_graph_drops_dangling_relationships() {
        let entities = vec![entity("A", "t", "", "c#0")];
        let relationships = vec![rel("A", "Ghost", "haunts", 1.0, "c#0")];
        let (nodes, edges) = to_graph(&entities, &relationships);
        assert_eq!(nodes.len(), 1);
        assert!(edges.is_empty());
    }

    #[tokio::test]
    async fn test_extract_tolerates_fences_and_clamps_weight() {
        let reply = "```json\n{\"entities\":[{\"name\":\"Acme\",\"type\":\"Org\",\"description\":\"maker\"},{\"name\":\"Wile\",\"type\":\"Person\"}],\
            \"relationships\":[{\"source\":\"Wile\",\"target\":\"Acme\",\"type\":\"buys_from\",\"weight\":7},\
            {\"source\":\"Acme\",\"target\":\"Wile\",\"type\":\"\"}]}\n```";
        let llm = Arc::new(MockLLM::new(reply));
        let extractor = EntityExtractor::new(llm);

        let chunk = TextChunk::new("doc", 0, "Wile buys from Acme.");
        let result = extractor.extract_chunk(&chunk).await.unwrap();
        assert_eq!(result.entities.len(), 2);
        assert_eq!(result.entities[0].source_chunk_ids, vec!["doc#0"]);
        assert_eq!(result.relationships[0].weight, 1.0);
        assert_eq!(result.relationships[1].weight, 1.0);
        assert_eq!(result.relationships[1].relationship_type, DEFAULT_RELATIONSHIP_TYPE);
    }

    #[tokio::test]
    async fn test_bad_chunks_are_skipped_not_fatal() {
        let llm = Arc::new(MockLLM::with_replies(vec![
            Err("rate limited"),
            Ok("this is not json"),
            Ok(r#"{"entities":[{"name":"Acme","type":"Org"}],"relationships":[]}"#),
        ]));
        let extractor = EntityExtractor::new(llm.clone());
        let chunks = vec![
            TextChunk::new("doc", 0, "one"),
            TextChunk::new("doc", 1, "two"),
            TextChunk::new("doc", 2, "three"),
        ];

        let result = extractor.extract_from_chunks(&chunks).await;
        assert_eq!(llm.call_count(), 3);
        assert_eq!(result.entities.len(), 1);
        assert_eq!(result.entities[0].source_chunk_ids, vec!["doc#2"]);
    }

    #[tokio::test]
    async fn test_raw_extraction_keeps_per_chunk_records() {
        let reply = r#"{"entities":[{"name":"Acme","type":"Org","description":"maker"}],"relationships":[]}"#;
        let extractor = EntityExtractor::new(Arc::new(MockLLM::new(reply)));
        let chunks = vec![TextChunk::new("a", 0, "one"), TextChunk::new("b", 0, "two")];

        let raw = extractor.extract_raw(&chunks).await;
        assert_eq!(raw.entities.len(), 2);
        assert_eq!(raw.entities[0].source_chunk_ids, vec!["a#0"]);
        assert_eq!(raw.entities[1].source_chunk_ids, vec!["b#0"]);

        let merged = extractor.extract_from_chunks(&chunks).await;
        assert_eq!(merged.entities.len(), 1);
        assert_eq!(merged.entities[0].source_chunk_ids, vec!["a#0", "b#0"]);
    }

    #[tokio::test]
    async fn test_prompt_lists_vocabulary() {
        let llm = Arc::new(MockLLM::new("{}"));
        let extractor = EntityExtractor::new(llm.clone())
            .with_vocabulary(vec!["Person".into(), "Org".into()], vec!["works_for".into()]);
        extractor.extract_chunk(&TextChunk::new("doc", 0, "text")).await.unwrap();

        let prompts = llm.prompts.lock().unwrap();
        let system = &prompts[0][0].content;
        assert!(system.contains("Person, Org"));
        assert!(system.contains("works_for"));
    }
}
