//! Combine the chunk-level extraction records of one document into one dataset.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::extractor::ExtractionRecord;
use super::graph::{entity_id, normalize_text};

/// Confidence assigned to facts synthesized from a failed extraction.
pub const FALLBACK_CONFIDENCE: f32 = 0.5;

const DEFAULT_RELATIONSHIP_TYPE: &str = "related_to";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedEntity {
    pub id: String,
    pub name: String,
    pub types: Vec<String>,
    pub descriptions: Vec<String>,
    pub frequency: u32,
    pub chunk_indices: Vec<usize>,
    pub confidence: f32,
    pub source_files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedRelationship {
    pub source_entity_id: String,
    pub target_entity_id: String,
    pub source_name: String,
    pub target_name: String,
    pub relationship_type: String,
    pub description: String,
    pub weight: f32,
    pub confidence: f32,
    pub chunk_indices: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedFact {
    pub text: String,
    pub chunk_indices: Vec<usize>,
    pub confidence: f32,
    pub source_files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeMetadata {
    pub merged_at: DateTime<Utc>,
    pub chunk_count: usize,
    pub fallback_chunks: usize,
    pub total_entities: usize,
    pub total_relationships: usize,
    pub total_facts: usize,
    pub dropped_relationships: usize,
}

/// Per-document merge result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedGraphData {
    pub entities: Vec<MergedEntity>,
    pub relationships: Vec<MergedRelationship>,
    pub facts: Vec<MergedFact>,
    pub metadata: MergeMetadata,
}

fn push_index(indices: &mut Vec<usize>, index: usize) {
    if let Err(pos) = indices.binary_search(&index) {
        indices.insert(pos, index);
    }
}

fn push_unique(list: &mut Vec<String>, value: &str) {
    let value = value.trim();
    if !value.is_empty() && !list.iter().any(|v| v == value) {
        list.push(value.to_string());
    }
}

/// Merge all extraction records of one document.
///
/// Records are ordered by chunk index first, so the result does not depend on the
/// order in which extraction finished.
pub fn merge(records: &[ExtractionRecord]) -> MergedGraphData {
    let mut ordered: Vec<&ExtractionRecord> = records.iter().collect();
    ordered.sort_by_key(|r| r.metadata.chunk_index);

    // 1. name -> frequency, case-insensitive
    let mut frequency: HashMap<String, u32> = HashMap::new();
    for record in &ordered {
        for entity in &record.entities {
            *frequency
                .entry(entity.name.trim().to_lowercase())
                .or_insert(0) += 1;
        }
    }

    // 2. one entity per distinct name, first spelling wins
    let mut entities: Vec<MergedEntity> = Vec::new();
    let mut entity_by_name: HashMap<String, usize> = HashMap::new();
    for record in &ordered {
        let chunk_index = record.metadata.chunk_index;
        for extracted in &record.entities {
            let key = extracted.name.trim().to_lowercase();
            if key.is_empty() {
                continue;
            }
            let idx = *entity_by_name.entry(key.clone()).or_insert_with(|| {
                entities.push(MergedEntity {
                    id: entity_id(&key),
                    name: extracted.name.trim().to_string(),
                    types: Vec::new(),
                    descriptions: Vec::new(),
                    frequency: frequency.get(&key).copied().unwrap_or(1),
                    chunk_indices: Vec::new(),
                    confidence: 0.0,
                    source_files: Vec::new(),
                });
                entities.len() - 1
            });

            let entity = &mut entities[idx];
            push_index(&mut entity.chunk_indices, chunk_index);
            push_unique(&mut entity.types, &extracted.entity_type);
            push_unique(&mut entity.descriptions, &extracted.description);
            push_unique(&mut entity.source_files, &record.metadata.filename);
            entity.confidence = entity.confidence.max(extracted.confidence.unwrap_or(1.0));
        }
    }

    // 3. relationships resolved by entity name, deduped by (source, target, type)
    let mut relationships: Vec<MergedRelationship> = Vec::new();
    let mut relationship_by_key: HashMap<(usize, usize, String), usize> = HashMap::new();
    let mut dropped_relationships = 0;
    for record in &ordered {
        let chunk_index = record.metadata.chunk_index;
        for rel in &record.relationships {
            let source = entity_by_name.get(&rel.source.trim().to_lowercase());
            let target = entity_by_name.get(&rel.target.trim().to_lowercase());
            let (Some(&source), Some(&target)) = (source, target) else {
                warn!(
                    "Dropping relationship {:?} -> {:?} in chunk {}: unresolved endpoint",
                    rel.source, rel.target, chunk_index
                );
                dropped_relationships += 1;
                continue;
            };

            let rel_type = match rel.relationship_type.trim() {
                "" => DEFAULT_RELATIONSHIP_TYPE.to_string(),
                t => t.to_string(),
            };
            let key = (source, target, rel_type.to_lowercase());
            let weight = rel.weight.unwrap_or(1.0);
            let confidence = rel.confidence.unwrap_or(1.0);

            match relationship_by_key.get(&key) {
                Some(&idx) => {
                    let existing = &mut relationships[idx];
                    existing.weight += weight;
                    existing.confidence = existing.confidence.max(confidence);
                    push_index(&mut existing.chunk_indices, chunk_index);
                    if existing.description.is_empty() {
                        existing.description = rel.description.trim().to_string();
                    }
                }
                None => {
                    relationship_by_key.insert(key, relationships.len());
                    relationships.push(MergedRelationship {
                        source_entity_id: entities[source].id.clone(),
                        target_entity_id: entities[target].id.clone(),
                        source_name: entities[source].name.clone(),
                        target_name: entities[target].name.clone(),
                        relationship_type: rel_type,
                        description: rel.description.trim().to_string(),
                        weight,
                        confidence,
                        chunk_indices: vec![chunk_index],
                    });
                }
            }
        }
    }

    // 4. facts deduped by case-insensitive text
    let mut facts: Vec<MergedFact> = Vec::new();
    let mut fact_by_text: HashMap<String, usize> = HashMap::new();
    for record in &ordered {
        let chunk_index = record.metadata.chunk_index;
        for extracted in &record.facts {
            let key = normalize_text(extracted.text());
            if key.is_empty() {
                continue;
            }
            let confidence = if record.fallback {
                FALLBACK_CONFIDENCE
            } else {
                extracted.confidence().unwrap_or(1.0)
            };

            match fact_by_text.get(&key) {
                Some(&idx) => {
                    let fact = &mut facts[idx];
                    push_index(&mut fact.chunk_indices, chunk_index);
                    push_unique(&mut fact.source_files, &record.metadata.filename);
                    fact.confidence = fact.confidence.max(confidence);
                }
                None => {
                    fact_by_text.insert(key, facts.len());
                    facts.push(MergedFact {
                        text: extracted.text().trim().to_string(),
                        chunk_indices: vec![chunk_index],
                        confidence,
                        source_files: vec![record.metadata.filename.clone()],
                    });
                }
            }
        }
    }

    let chunk_count = ordered
        .iter()
        .map(|r| r.metadata.chunk_index)
        .collect::<BTreeSet<_>>()
        .len();
    let metadata = MergeMetadata {
        merged_at: Utc::now(),
        chunk_count,
        fallback_chunks: ordered.iter().filter(|r| r.fallback).count(),
        total_entities: entities.len(),
        total_relationships: relationships.len(),
        total_facts: facts.len(),
        dropped_relationships,
    };

    debug!(
        "Merged {} records: {} entities, {} relationships, {} facts",
        records.len(),
        metadata.total_entities,
        metadata.total_relationships,
        metadata.total_facts
    );

    MergedGraphData {
        entities,
        relationships,
        facts,
        metadata,
    }
}
