//! Vector embeddings for graph nodes and relationship edges.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::graph::{Edge, EntityNode, FactNode, KnowledgeGraph, Node};
use crate::error::Result;
use crate::integrations::Embedder;
use crate::metrics;

/// Cosine similarity in [-1, 1]; 0 for empty, mismatched or zero-norm vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    let similarity = dot / (norm_a.sqrt() * norm_b.sqrt());
    if similarity.is_finite() {
        similarity
    } else {
        0.0
    }
}

pub fn normalize(vec: &mut [f32]) {
    let norm = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vec.iter_mut() {
            *v /= norm;
        }
    }
}

pub fn entity_embedding_text(entity: &EntityNode) -> String {
    format!(
        "Type: {} | Name: {} | Description: {}",
        entity.primary_type, entity.name, entity.primary_description
    )
}

pub fn fact_embedding_text(fact: &FactNode) -> String {
    fact.content.clone()
}

pub fn edge_embedding_text(edge: &Edge) -> String {
    format!(
        "Edge Type: {} | Relationship: {}",
        edge.kind.label(),
        edge.kind.relationship_type().unwrap_or("mention")
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerKind {
    Entity,
    Fact,
    Edge,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingVector {
    pub owner_id: String,
    pub owner_kind: OwnerKind,
    pub vector: Vec<f32>,
    pub dimension: usize,
}

/// Outcome of one generation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationReport {
    pub total: usize,
    pub embedded: usize,
    pub failed: usize,
    /// Percentage of embeddable items that received a vector
    pub coverage: f32,
}

/// Embeddings for one clustered graph, keyed by node id or edge key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingStore {
    pub model: String,
    pub dimension: usize,
    pub vectors: BTreeMap<String, EmbeddingVector>,
    #[serde(default)]
    pub generated_at: Option<DateTime<Utc>>,
}

impl EmbeddingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&EmbeddingVector> {
        self.vectors.get(id)
    }

    /// Every embeddable item: entities, facts and edges of both kinds.
    fn embeddable_items(graph: &KnowledgeGraph) -> Vec<(String, OwnerKind, String)> {
        let mut items = Vec::new();
        for node in graph.nodes.values() {
            match node {
                Node::Entity(e) => items.push((e.id.clone(), OwnerKind::Entity, entity_embedding_text(e))),
                Node::Fact(f) => items.push((f.id.clone(), OwnerKind::Fact, fact_embedding_text(f))),
            }
        }
        for (key, edge) in &graph.edges {
            items.push((key.clone(), OwnerKind::Edge, edge_embedding_text(edge)));
        }
        items
    }

    /// Rebuild all vectors for `graph`. Per-item failures are logged and skipped;
    /// the report carries the resulting coverage.
    pub async fn generate(
        &mut self,
        graph: &KnowledgeGraph,
        embedder: &dyn Embedder,
        batch_size: usize,
    ) -> GenerationReport {
        let started = Instant::now();
        let items = Self::embeddable_items(graph);

        self.vectors.clear();
        self.model = embedder.name().to_string();
        self.dimension = embedder.dimension();
        self.generated_at = Some(Utc::now());

        let mut failed = 0;
        for batch in items.chunks(batch_size.max(1)) {
            let texts: Vec<String> = batch.iter().map(|(_, _, text)| text.clone()).collect();
            match embedder.embed_batch(&texts).await {
                Ok(vectors) if vectors.len() == batch.len() => {
                    for ((id, kind, _), vector) in batch.iter().zip(vectors) {
                        if !self.insert(id, *kind, vector) {
                            warn!("Empty or invalid embedding for {}, skipping", id);
                            failed += 1;
                        }
                    }
                }
                Ok(vectors) => {
                    warn!(
                        "Embedding batch returned {} vectors for {} texts, retrying one by one",
                        vectors.len(),
                        batch.len()
                    );
                    failed += self.embed_individually(batch, embedder).await;
                }
                Err(err) => {
                    warn!("Embedding batch failed, retrying one by one: {}", err);
                    failed += self.embed_individually(batch, embedder).await;
                }
            }
        }

        let total = items.len();
        let embedded = self.vectors.len();
        let report = GenerationReport {
            total,
            embedded,
            failed,
            coverage: if total == 0 {
                100.0
            } else {
                embedded as f32 / total as f32 * 100.0
            },
        };

        if failed > 0 {
            metrics::record_fallback("embedding");
        }
        metrics::observe_stage("embedding", started.elapsed());
        info!(
            "Embedded {}/{} items with {} ({:.1}% coverage)",
            embedded, total, self.model, report.coverage
        );
        report
    }

    async fn embed_individually(
        &mut self,
        batch: &[(String, OwnerKind, String)],
        embedder: &dyn Embedder,
    ) -> usize {
        let mut failed = 0;
        for (id, kind, text) in batch {
            match embedder.embed_batch(std::slice::from_ref(text)).await {
                Ok(mut vectors) if vectors.len() == 1 => {
                    if !self.insert(id, *kind, vectors.remove(0)) {
                        warn!("Empty or invalid embedding for {}, skipping", id);
                        failed += 1;
                    }
                }
                Ok(_) => {
                    warn!("No embedding returned for {}, skipping", id);
                    failed += 1;
                }
                Err(err) => {
                    warn!("Embedding failed for {}, skipping: {}", id, err);
                    failed += 1;
                }
            }
        }
        failed
    }

    fn insert(&mut self, id: &str, kind: OwnerKind, vector: Vec<f32>) -> bool {
        if vector.is_empty() || vector.iter().any(|v| !v.is_finite()) {
            return false;
        }
        self.vectors.insert(
            id.to_string(),
            EmbeddingVector {
                owner_id: id.to_string(),
                owner_kind: kind,
                dimension: vector.len(),
                vector,
            },
        );
        true
    }

    /// Percentage of the graph's embeddable items that have a vector.
    pub fn coverage(&self, graph: &KnowledgeGraph) -> f32 {
        let items = Self::embeddable_items(graph);
        if items.is_empty() {
            return 100.0;
        }
        let covered = items
            .iter()
            .filter(|(id, _, _)| self.vectors.contains_key(id))
            .count();
        covered as f32 / items.len() as f32 * 100.0
    }

    /// Similarity of item `id` to an external query vector; 0 when `id` has none.
    pub fn similarity(&self, id: &str, query: &[f32]) -> f32 {
        self.vectors
            .get(id)
            .map(|v| cosine_similarity(&v.vector, query))
            .unwrap_or(0.0)
    }

    /// Top-k items most similar to item `id`, excluding itself.
    pub fn nearest(&self, id: &str, k: usize) -> Vec<(String, f32)> {
        let Some(anchor) = self.vectors.get(id) else {
            return Vec::new();
        };
        let mut scored: Vec<(String, f32)> = self
            .vectors
            .iter()
            .filter(|(other, _)| other.as_str() != id)
            .map(|(other, v)| (other.clone(), cosine_similarity(&anchor.vector, &v.vector)))
            .collect();
        sort_scored(&mut scored);
        scored.truncate(k);
        scored
    }

    /// Top-k items most similar to an external query vector.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(String, f32)> {
        let mut scored: Vec<(String, f32)> = self
            .vectors
            .iter()
            .map(|(id, v)| (id.clone(), cosine_similarity(&v.vector, query)))
            .collect();
        sort_scored(&mut scored);
        scored.truncate(k);
        scored
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec(self)?;
        std::fs::write(path, json)?;
        debug!("Saved {} embeddings to {}", self.len(), path.display());
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Descending by score, ascending by id on ties.
fn sort_scored(scored: &mut [(String, f32)]) {
    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrations::HashingEmbedder;
    use crate::knowledge::graph::{ChunkRef, EdgeKind};
    use crate::{Error, Result};
    use async_trait::async_trait;
    use tempfile::tempdir;

    fn sample_graph() -> KnowledgeGraph {
        let mut graph = KnowledgeGraph::new();
        let mut acme = EntityNode::new("Acme Corp", "Organization", "Technology company");
        acme.chunks.insert(ChunkRef::new("a.txt", 0));
        let mut q3 = EntityNode::new("Q3", "Period", "Third quarter");
        q3.chunks.insert(ChunkRef::new("a.txt", 0));
        let (acme_id, q3_id) = (acme.id.clone(), q3.id.clone());
        graph.upsert_entity(acme);
        graph.upsert_entity(q3);

        let fact = FactNode::new("Acme Corp revenue grew 12% in Q3");
        let fact_id = fact.id.clone();
        graph.upsert_fact(fact);

        graph.upsert_edge(Edge::new(
            &acme_id,
            &q3_id,
            EdgeKind::Relationship {
                relationship_type: "reported_in".to_string(),
            },
        ));
        graph.upsert_edge(Edge::mention(&fact_id, &acme_id));
        graph
    }

    /// Fails whole batches, and any single text containing "Q3".
    struct FlakyEmbedder {
        inner: HashingEmbedder,
    }

    #[async_trait]
    impl Embedder for FlakyEmbedder {
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            if texts.len() > 1 || texts.iter().any(|t| t.contains("Q3")) {
                return Err(Error::EmbeddingError("flaky".to_string()));
            }
            self.inner.embed_batch(texts).await
        }

        fn dimension(&self) -> usize {
            self.inner.dimension()
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    #[test]
    fn cosine_similarity_edge_cases() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 2.0], &[2.0, 4.0]) - 1.0).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn embedding_texts_follow_format() {
        let entity = EntityNode::new("Acme Corp", "Organization", "Technology company");
        assert_eq!(
            entity_embedding_text(&entity),
            "Type: Organization | Name: Acme Corp | Description: Technology company"
        );
        let edge = Edge::new(
            "a",
            "b",
            EdgeKind::Relationship {
                relationship_type: "owns".to_string(),
            },
        );
        assert_eq!(
            edge_embedding_text(&edge),
            "Edge Type: relationship | Relationship: owns"
        );
        assert_eq!(
            edge_embedding_text(&Edge::mention("f", "e")),
            "Edge Type: mention | Relationship: mention"
        );
    }

    #[tokio::test]
    async fn generate_embeds_every_node_and_edge() {
        let graph = sample_graph();
        let mut store = EmbeddingStore::new();
        let report = store.generate(&graph, &HashingEmbedder::new(64), 2).await;

        // 2 entities + 1 fact + 1 relationship edge + 1 mention edge
        assert_eq!(report.total, 5);
        assert_eq!(report.embedded, 5);
        for (key, edge) in &graph.edges {
            let vector = store.get(key).unwrap();
            assert_eq!(vector.owner_kind, OwnerKind::Edge);
            assert_eq!(edge.is_relationship(), key.contains("reported_in"));
        }
        assert_eq!(report.failed, 0);
        assert!((report.coverage - 100.0).abs() < f32::EPSILON);
        assert_eq!(store.dimension, 64);
        assert!((store.coverage(&graph) - 100.0).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn generate_is_rerunnable() {
        let graph = sample_graph();
        let embedder = HashingEmbedder::new(32);
        let mut store = EmbeddingStore::new();
        store.generate(&graph, &embedder, 8).await;
        let first = store.vectors.clone();
        store.generate(&graph, &embedder, 8).await;

        assert_eq!(first, store.vectors);
    }

    #[tokio::test]
    async fn per_item_failures_are_skipped() {
        let graph = sample_graph();
        let embedder = FlakyEmbedder {
            inner: HashingEmbedder::new(32),
        };
        let mut store = EmbeddingStore::new();
        let report = store.generate(&graph, &embedder, 4).await;

        // "Q3" entity text and the Acme fact mention Q3
        assert_eq!(report.failed, 2);
        assert_eq!(report.embedded, 3);
        assert!((report.coverage - 60.0).abs() < 1e-3);
    }

    #[tokio::test]
    async fn save_load_round_trip() {
        let graph = sample_graph();
        let mut store = EmbeddingStore::new();
        store.generate(&graph, &HashingEmbedder::new(48), 16).await;

        let dir = tempdir().unwrap();
        let path = dir.path().join("embeddings.json");
        store.save(&path).unwrap();
        let loaded = EmbeddingStore::load(&path).unwrap();

        assert_eq!(loaded.len(), store.len());
        for (id, vector) in &store.vectors {
            let other = loaded.get(id).unwrap();
            assert_eq!(other.dimension, vector.dimension);
            for (a, b) in vector.vector.iter().zip(&other.vector) {
                assert!((a - b).abs() < 1e-6);
            }
        }
    }

    #[tokio::test]
    async fn nearest_and_search_rank_by_similarity() {
        let graph = sample_graph();
        let embedder = HashingEmbedder::new(128);
        let mut store = EmbeddingStore::new();
        store.generate(&graph, &embedder, 16).await;

        let acme_id = crate::knowledge::graph::entity_id("Acme Corp");
        let nearest = store.nearest(&acme_id, 2);
        assert_eq!(nearest.len(), 2);
        assert!(nearest.iter().all(|(id, _)| id != &acme_id));
        assert!(nearest[0].1 >= nearest[1].1);

        let query = embedder.embed("Type: Organization | Name: Acme Corp | Description: Technology company");
        let hits = store.search(&query, 1);
        assert_eq!(hits[0].0, acme_id);
        assert!((store.similarity(&acme_id, &query) - 1.0).abs() < 1e-5);
        assert_eq!(store.similarity("missing", &query), 0.0);
        assert!(store.nearest("missing", 3).is_empty());
    }
}
