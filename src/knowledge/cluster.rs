//! Cross-document entity clustering.
//!
//! Document graphs are first union-merged (identical ids fold together). Entities
//! are then vectorized as TF-IDF over "name + description", grouped with DBSCAN
//! under cosine distance, and each cluster collapses into its most important
//! member. Any clustering error leaves the union-merged graph as the result.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::graph::{Edge, EntityNode, KnowledgeGraph, Node};
use super::text::content_words;
use crate::config::ClusteringSettings;
use crate::error::{Error, Result};
use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusteringMethod {
    /// No input graphs
    Empty,
    /// Single document, returned unchanged
    SingleDocument,
    /// Union merge followed by TF-IDF + DBSCAN
    Dbscan,
    /// Union merge only, clustering failed
    UnionFallback,
}

/// Summary of one clustering pass; stored with the clustered graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusteringReport {
    pub method: ClusteringMethod,
    pub documents: usize,
    pub entities_before: usize,
    pub entities_after: usize,
    pub clusters: usize,
    pub clustered_entities: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
    pub clustered_at: DateTime<Utc>,
}

impl ClusteringReport {
    fn new(method: ClusteringMethod, documents: usize, before: usize, after: usize) -> Self {
        Self {
            method,
            documents,
            entities_before: before,
            entities_after: after,
            clusters: 0,
            clustered_entities: 0,
            fallback_reason: None,
            clustered_at: Utc::now(),
        }
    }
}

/// Sparse, L2-normalized term vector: (term index, weight) sorted by index.
type SparseVector = Vec<(usize, f32)>;

#[derive(Debug, Clone)]
pub struct Clusterer {
    eps: f32,
    min_samples: usize,
}

impl Default for Clusterer {
    fn default() -> Self {
        Self::new(&ClusteringSettings::default())
    }
}

impl Clusterer {
    pub fn new(settings: &ClusteringSettings) -> Self {
        Self {
            eps: settings.eps,
            min_samples: settings.min_samples.max(1),
        }
    }

    /// Unify a client's document graphs into one graph.
    pub fn cluster(&self, graphs: &[KnowledgeGraph]) -> (KnowledgeGraph, ClusteringReport) {
        let started = Instant::now();
        let entities_before: usize = graphs.iter().map(|g| g.entity_count()).sum();

        match graphs {
            [] => {
                let report = ClusteringReport::new(ClusteringMethod::Empty, 0, 0, 0);
                return (KnowledgeGraph::new(), report);
            }
            [single] => {
                let report = ClusteringReport::new(
                    ClusteringMethod::SingleDocument,
                    1,
                    entities_before,
                    entities_before,
                );
                return (single.clone(), report);
            }
            _ => {}
        }

        let union = union_merge(graphs);
        let (graph, report) = match self.cluster_entities(&union) {
            Ok((clustered, clusters, members)) => {
                let mut report = ClusteringReport::new(
                    ClusteringMethod::Dbscan,
                    graphs.len(),
                    entities_before,
                    clustered.entity_count(),
                );
                report.clusters = clusters;
                report.clustered_entities = members;
                (clustered, report)
            }
            Err(err) => {
                warn!("Clustering failed, using union merge: {}", err);
                metrics::record_fallback("clustering");
                let mut report = ClusteringReport::new(
                    ClusteringMethod::UnionFallback,
                    graphs.len(),
                    entities_before,
                    union.entity_count(),
                );
                report.fallback_reason = Some(err.to_string());
                (union, report)
            }
        };

        metrics::observe_stage("clustering", started.elapsed());
        info!(
            "Clustered {} documents: {} -> {} entities, {} clusters ({:?})",
            report.documents,
            report.entities_before,
            report.entities_after,
            report.clusters,
            report.method
        );
        (graph, report)
    }

    /// Returns the clustered graph, cluster count, and number of entities that were
    /// folded into a cluster.
    fn cluster_entities(&self, graph: &KnowledgeGraph) -> Result<(KnowledgeGraph, usize, usize)> {
        let entities: Vec<&EntityNode> = graph.entities().collect();
        if entities.len() < 2 {
            return Ok((graph.clone(), 0, 0));
        }

        let vectors = tfidf_vectors(&entities)?;
        let labels = dbscan(&vectors, self.eps, self.min_samples);

        let mut clusters: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (i, label) in labels.iter().enumerate() {
            if let Some(cluster) = label {
                clusters.entry(*cluster).or_default().push(i);
            }
        }
        clusters.retain(|_, members| members.len() >= 2);
        if clusters.is_empty() {
            debug!("No entity clusters found");
            return Ok((graph.clone(), 0, 0));
        }

        let degrees = graph.relationship_degrees();
        let fact_counts = graph.mention_counts();
        let importance = |e: &EntityNode| {
            2.0 * e.frequency as f32
                + 1.5 * degrees.get(e.id.as_str()).copied().unwrap_or(0) as f32
                + fact_counts.get(e.id.as_str()).copied().unwrap_or(0) as f32
        };

        let mut result = graph.clone();
        let mut redirect: HashMap<String, String> = HashMap::new();
        let mut folded = 0;

        for members in clusters.values() {
            let mut members: Vec<&EntityNode> = members.iter().map(|&i| entities[i]).collect();
            // Highest importance first, lowest id on ties.
            members.sort_by(|a, b| {
                importance(b)
                    .partial_cmp(&importance(a))
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.id.cmp(&b.id))
            });

            let mut representative = members[0].clone();
            for member in &members[1..] {
                representative.absorb(member);
                redirect.insert(member.id.clone(), representative.id.clone());
                result.nodes.remove(&member.id);
            }
            representative.clustered = true;
            representative.cluster_size = members
                .iter()
                .map(|m| m.cluster_size.max(1))
                .sum();
            folded += members.len();

            debug!(
                "Cluster of {} -> {:?}",
                members.len(),
                representative.aliases
            );
            result
                .nodes
                .insert(representative.id.clone(), Node::Entity(representative));
        }

        result.edges = repoint_edges(&graph.edges, &redirect);
        Ok((result, clusters.len(), folded))
    }
}

/// Union of all graphs: identical entity/fact ids fold together with additive
/// frequency and unioned provenance, repeated edges accumulate.
pub fn union_merge(graphs: &[KnowledgeGraph]) -> KnowledgeGraph {
    let mut merged = KnowledgeGraph::new();
    for graph in graphs {
        merged.documents.extend(graph.documents.iter().cloned());
        for node in graph.nodes.values() {
            match node {
                Node::Entity(e) => {
                    merged.upsert_entity(e.clone());
                }
                Node::Fact(f) => {
                    merged.upsert_fact(f.clone());
                }
            }
        }
        for edge in graph.edges.values() {
            merged.upsert_edge(edge.clone());
        }
    }
    merged
}

fn tfidf_vectors(entities: &[&EntityNode]) -> Result<Vec<SparseVector>> {
    let docs: Vec<Vec<String>> = entities
        .iter()
        .map(|e| content_words(&format!("{} {}", e.name, e.primary_description)))
        .collect();

    let mut vocabulary: HashMap<&str, usize> = HashMap::new();
    let mut document_frequency: Vec<usize> = Vec::new();
    for doc in &docs {
        let mut seen: Vec<usize> = Vec::new();
        for word in doc {
            let next = vocabulary.len();
            let idx = *vocabulary.entry(word.as_str()).or_insert(next);
            if idx == document_frequency.len() {
                document_frequency.push(0);
            }
            if !seen.contains(&idx) {
                seen.push(idx);
                document_frequency[idx] += 1;
            }
        }
    }

    if vocabulary.is_empty() {
        return Err(Error::ClusteringError(
            "empty vocabulary: no entity has descriptive terms".to_string(),
        ));
    }

    let n = docs.len() as f32;
    let idf: Vec<f32> = document_frequency
        .iter()
        .map(|&df| ((1.0 + n) / (1.0 + df as f32)).ln() + 1.0)
        .collect();

    let vectors = docs
        .iter()
        .map(|doc| {
            let mut tf: BTreeMap<usize, f32> = BTreeMap::new();
            for word in doc {
                *tf.entry(vocabulary[word.as_str()]).or_insert(0.0) += 1.0;
            }
            let mut vector: SparseVector = tf.into_iter().map(|(i, c)| (i, c * idf[i])).collect();
            let norm = vector.iter().map(|(_, w)| w * w).sum::<f32>().sqrt();
            if norm > 0.0 {
                for (_, w) in vector.iter_mut() {
                    *w /= norm;
                }
            }
            vector
        })
        .collect();

    Ok(vectors)
}

fn sparse_cosine(a: &SparseVector, b: &SparseVector) -> f32 {
    let (mut i, mut j, mut dot) = (0, 0, 0.0f32);
    while i < a.len() && j < b.len() {
        match a[i].0.cmp(&b[j].0) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                dot += a[i].1 * b[j].1;
                i += 1;
                j += 1;
            }
        }
    }
    dot
}

/// DBSCAN under cosine distance. `None` marks noise. Neighborhoods include the
/// point itself, so `min_samples = 2` means "at least one neighbor".
fn dbscan(vectors: &[SparseVector], eps: f32, min_samples: usize) -> Vec<Option<usize>> {
    let n = vectors.len();
    let neighbors: Vec<Vec<usize>> = (0..n)
        .map(|i| {
            (0..n)
                .filter(|&j| {
                    i == j
                        || (!vectors[i].is_empty()
                            && !vectors[j].is_empty()
                            && 1.0 - sparse_cosine(&vectors[i], &vectors[j]) <= eps)
                })
                .collect()
        })
        .collect();

    let mut labels: Vec<Option<usize>> = vec![None; n];
    let mut visited = vec![false; n];
    let mut next_cluster = 0;

    for i in 0..n {
        if visited[i] {
            continue;
        }
        visited[i] = true;
        if neighbors[i].len() < min_samples {
            continue;
        }

        let cluster = next_cluster;
        next_cluster += 1;
        labels[i] = Some(cluster);

        let mut queue: Vec<usize> = neighbors[i].clone();
        while let Some(j) = queue.pop() {
            if labels[j].is_none() {
                labels[j] = Some(cluster);
            }
            if visited[j] {
                continue;
            }
            visited[j] = true;
            if neighbors[j].len() >= min_samples {
                queue.extend(neighbors[j].iter().copied());
            }
        }
    }

    labels
}

/// Point edges at cluster representatives. Relationship self-loops are dropped;
/// edges that collapse onto the same key merge (union provenance, max weight).
fn repoint_edges(
    edges: &BTreeMap<String, Edge>,
    redirect: &HashMap<String, String>,
) -> BTreeMap<String, Edge> {
    let mut result: BTreeMap<String, Edge> = BTreeMap::new();

    for edge in edges.values() {
        let source = redirect.get(&edge.source);
        let target = redirect.get(&edge.target);
        let mut edge = edge.clone();

        if source.is_some() || target.is_some() {
            if let Some(source) = source {
                edge.original_source.get_or_insert_with(|| edge.source.clone());
                edge.source = source.clone();
            }
            if let Some(target) = target {
                edge.original_target.get_or_insert_with(|| edge.target.clone());
                edge.target = target.clone();
            }
            edge.clustered = true;
        }

        if edge.source == edge.target && edge.is_relationship() {
            debug!("Dropping self-loop on {} after clustering", edge.source);
            continue;
        }

        let key = edge.key();
        match result.get_mut(&key) {
            Some(existing) => {
                existing.weight = existing.weight.max(edge.weight);
                existing.confidence = existing.confidence.max(edge.confidence);
                existing.chunks.extend(edge.chunks);
                existing.clustered = true;
                existing.merged = true;
            }
            None => {
                result.insert(key, edge);
            }
        }
    }

    result
}
