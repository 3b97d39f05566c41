use std::time::Instant;

use tracing::{debug, info};

use super::graph::{ChunkRef, Edge, EdgeKind, EntityNode, FactNode, KnowledgeGraph};
use super::merger::MergedGraphData;
use crate::metrics;

/// Names shorter than this never produce mention edges ("a", "I").
const MIN_MENTION_NAME_CHARS: usize = 2;

/// Turns one document's merged data into a typed graph.
#[derive(Debug, Clone, Copy, Default)]
pub struct DocumentGraphBuilder;

impl DocumentGraphBuilder {
    pub fn new() -> Self {
        Self
    }

    pub fn build(&self, merged: &MergedGraphData, filename: &str, file_path: &str) -> KnowledgeGraph {
        let started = Instant::now();
        let mut graph = KnowledgeGraph::new();
        graph.documents.insert(filename.to_string());

        for merged_entity in &merged.entities {
            let mut node = EntityNode::new(
                &merged_entity.name,
                merged_entity.types.first().map(String::as_str).unwrap_or(""),
                merged_entity
                    .descriptions
                    .first()
                    .map(String::as_str)
                    .unwrap_or(""),
            );
            node.all_types = merged_entity.types.clone();
            node.all_descriptions = merged_entity.descriptions.clone();
            node.frequency = merged_entity.frequency;
            node.confidence = merged_entity.confidence;
            node.chunks = merged_entity
                .chunk_indices
                .iter()
                .map(|&i| ChunkRef::new(filename, i))
                .collect();
            node.source_files = merged_entity.source_files.iter().cloned().collect();
            node.source_files.insert(filename.to_string());
            graph.upsert_entity(node);
        }

        let mut relationship_edges = 0;
        for rel in &merged.relationships {
            let mut edge = Edge::new(
                &rel.source_entity_id,
                &rel.target_entity_id,
                EdgeKind::Relationship {
                    relationship_type: rel.relationship_type.clone(),
                },
            );
            edge.description = rel.description.clone();
            edge.weight = rel.weight;
            edge.confidence = rel.confidence;
            edge.chunks = rel
                .chunk_indices
                .iter()
                .map(|&i| ChunkRef::new(filename, i))
                .collect();
            if graph.upsert_edge(edge) {
                relationship_edges += 1;
            }
        }

        // Lowercased entity names, computed once for mention matching.
        let entity_names: Vec<(String, Vec<String>)> = graph
            .entities()
            .map(|e| {
                let names = e
                    .names()
                    .filter(|n| n.chars().count() >= MIN_MENTION_NAME_CHARS)
                    .collect();
                (e.id.clone(), names)
            })
            .collect();

        let mut mention_edges = 0;
        for merged_fact in &merged.facts {
            let mut fact = FactNode::new(&merged_fact.text);
            fact.confidence = merged_fact.confidence;
            fact.chunks = merged_fact
                .chunk_indices
                .iter()
                .map(|&i| ChunkRef::new(filename, i))
                .collect();
            fact.source_files = merged_fact.source_files.iter().cloned().collect();
            fact.source_files.insert(filename.to_string());

            let lowered = fact.content.to_lowercase();
            let fact_id = fact.id.clone();
            let chunks = fact.chunks.clone();
            graph.upsert_fact(fact);

            for (entity_id, names) in &entity_names {
                if names.iter().any(|n| lowered.contains(n.as_str())) {
                    let mut edge = Edge::mention(&fact_id, entity_id);
                    edge.chunks = chunks.clone();
                    if graph.upsert_edge(edge) {
                        mention_edges += 1;
                    }
                }
            }
        }

        metrics::observe_stage("build", started.elapsed());
        debug!("Document graph for {} ({})", filename, file_path);
        info!(
            "Built graph for {}: {} entities, {} facts, {} relationship edges, {} mention edges",
            filename,
            graph.entity_count(),
            graph.fact_count(),
            relationship_edges,
            mention_edges
        );
        graph
    }
}
