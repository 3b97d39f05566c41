//! Multi-signal retrieval over a clustered graph.
//!
//! A request is analysed into concepts, then entities, facts, chunks and
//! relationships are scored independently and cut to top-k. Every signal degrades
//! to zero on its own: no query embedding means lexical and graph signals only.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::chunker::Chunk;
use super::concepts::{ConceptAnalysis, ConceptAnalyzer};
use super::embeddings::EmbeddingStore;
use super::graph::{ChunkRef, EntityNode, KnowledgeGraph};
use super::insights::{InsightReport, InsightSynthesizer};
use super::llm_json::ResponseSource;
use super::text::{contains_phrase, content_words};
use crate::config::QuerySettings;
use crate::integrations::{Embedder, LanguageModel};
use crate::metrics;

const DIRECT_MATCH_WEIGHT: f32 = 3.0;
const PARTIAL_MATCH_WEIGHT: f32 = 2.0;
const ENTITY_EMBEDDING_WEIGHT: f32 = 2.0;
const IMPORTANCE_WEIGHT: f32 = 0.3;

const FACT_MENTION_WEIGHT: f32 = 2.5;
const FACT_EMBEDDING_WEIGHT: f32 = 1.5;
const FACT_CHUNK_WEIGHT: f32 = 0.2;

const CHUNK_ENTITY_WEIGHT: f32 = 1.0;
const CHUNK_FACT_WEIGHT: f32 = 0.5;
const MULTI_ENTITY_BONUS: f32 = 0.5;
const MULTI_FACT_BONUS: f32 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QueryOptions {
    pub top_k: usize,
    /// Minimum score for a result, and minimum embedding similarity that counts
    pub threshold: f32,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self::from(&QuerySettings::default())
    }
}

impl From<&QuerySettings> for QueryOptions {
    fn from(settings: &QuerySettings) -> Self {
        Self {
            top_k: settings.top_k,
            threshold: settings.threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedEntity {
    pub id: String,
    pub name: String,
    pub entity_type: String,
    pub description: String,
    pub all_types: Vec<String>,
    pub aliases: Vec<String>,
    pub frequency: u32,
    pub degree: usize,
    pub fact_count: usize,
    pub clustered: bool,
    pub cluster_size: usize,
    pub relevance_score: f32,
    pub chunks: Vec<ChunkRef>,
    pub source_files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedFact {
    pub id: String,
    pub content: String,
    pub confidence: f32,
    /// Names of selected entities the fact mentions
    pub mentioned_entities: Vec<String>,
    pub relevance_score: f32,
    pub chunks: Vec<ChunkRef>,
    pub source_files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedChunk {
    pub source_file: String,
    pub index: usize,
    pub text: String,
    /// Text was assembled from entities and facts because the chunk is not stored
    pub synthesized: bool,
    pub entities: Vec<String>,
    pub facts: Vec<String>,
    pub relevance_score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedRelationship {
    pub source_id: String,
    pub target_id: String,
    pub source_name: String,
    pub target_name: String,
    pub relationship_type: String,
    pub description: String,
    pub weight: f32,
    pub confidence: f32,
    pub relevance_score: f32,
    pub chunks: Vec<ChunkRef>,
    pub source_files: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResults {
    pub entities: Vec<RankedEntity>,
    pub facts: Vec<RankedFact>,
    pub chunks: Vec<RankedChunk>,
    pub relationships: Vec<RankedRelationship>,
}

impl RetrievalResults {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
            && self.facts.is_empty()
            && self.chunks.is_empty()
            && self.relationships.is_empty()
    }
}

/// How much of the answer came from the degraded paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryQuality {
    /// Percentage of graph items with an embedding
    pub embedding_coverage: f32,
    pub query_embedding: bool,
    pub concept_source: ResponseSource,
    pub insight_source: ResponseSource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub slide_description: String,
    pub concept_analysis: ConceptAnalysis,
    pub results: RetrievalResults,
    pub insights: InsightReport,
    pub quality: QueryQuality,
}

/// Terminal "no graph" result or a best-effort answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum QueryOutcome {
    NoGraph,
    Results(Box<QueryResponse>),
}

/// Everything a query reads for one client.
#[derive(Debug, Clone, Copy)]
pub struct QueryContext<'a> {
    pub graph: &'a KnowledgeGraph,
    pub embeddings: &'a EmbeddingStore,
    pub chunks: &'a [Chunk],
}

pub struct QueryEngine {
    concepts: ConceptAnalyzer,
    insights: InsightSynthesizer,
    embedder: Option<Arc<dyn Embedder>>,
}

impl QueryEngine {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        embedder: Option<Arc<dyn Embedder>>,
        timeout: Duration,
    ) -> Self {
        Self {
            concepts: ConceptAnalyzer::new(model.clone(), timeout),
            insights: InsightSynthesizer::new(model, timeout),
            embedder,
        }
    }

    pub async fn query(
        &self,
        ctx: QueryContext<'_>,
        request: &str,
        options: &QueryOptions,
    ) -> QueryOutcome {
        if ctx.graph.is_empty() {
            info!("No knowledge graph to query");
            return QueryOutcome::NoGraph;
        }
        let started = Instant::now();

        let (analysis, concept_source) = self.concepts.analyze(request).await;
        let query_vector = self.embed_query(request, ctx.embeddings).await;

        let results = rank(ctx, &analysis, request, query_vector.as_deref(), options);
        let (insights, insight_source) = self
            .insights
            .synthesize(request, &analysis, &results)
            .await;

        metrics::observe_stage("query", started.elapsed());
        info!(
            "Query returned {} entities, {} facts, {} chunks, {} relationships in {:.2?}",
            results.entities.len(),
            results.facts.len(),
            results.chunks.len(),
            results.relationships.len(),
            started.elapsed()
        );

        QueryOutcome::Results(Box::new(QueryResponse {
            slide_description: request.to_string(),
            concept_analysis: analysis,
            results,
            insights,
            quality: QueryQuality {
                embedding_coverage: ctx.embeddings.coverage(ctx.graph),
                query_embedding: query_vector.is_some(),
                concept_source,
                insight_source,
            },
        }))
    }

    async fn embed_query(&self, request: &str, store: &EmbeddingStore) -> Option<Vec<f32>> {
        if store.is_empty() {
            return None;
        }
        let embedder = self.embedder.as_ref()?;
        match embedder.embed_batch(&[request.to_string()]).await {
            Ok(mut vectors) if vectors.len() == 1 && !vectors[0].is_empty() => {
                Some(vectors.remove(0))
            }
            Ok(_) => {
                warn!("Query embedding came back empty, using lexical signals only");
                metrics::record_fallback("query_embedding");
                None
            }
            Err(err) => {
                warn!("Query embedding failed, using lexical signals only: {}", err);
                metrics::record_fallback("query_embedding");
                None
            }
        }
    }
}

/// Score and cut every result list. Deterministic for identical inputs.
pub fn rank(
    ctx: QueryContext<'_>,
    analysis: &ConceptAnalysis,
    request: &str,
    query_vector: Option<&[f32]>,
    options: &QueryOptions,
) -> RetrievalResults {
    let degrees = ctx.graph.relationship_degrees();
    let mention_counts = ctx.graph.mention_counts();
    let terms = analysis.terms();
    let mut request_words: Vec<String> = Vec::new();
    for word in content_words(request) {
        if !request_words.contains(&word) {
            request_words.push(word);
        }
    }
    let similarity = |id: &str| -> f32 {
        query_vector
            .map(|q| ctx.embeddings.similarity(id, q))
            .unwrap_or(0.0)
    };

    let entities = rank_entities(
        ctx.graph,
        &terms,
        &request_words,
        &similarity,
        &degrees,
        &mention_counts,
        options,
    );
    let facts = rank_facts(ctx.graph, &entities, &similarity, options);
    let chunks = rank_chunks(ctx.chunks, &entities, &facts, options);
    let relationships = rank_relationships(ctx.graph, &entities, options);

    debug!(
        "Ranked with {} concept terms, query vector: {}",
        terms.len(),
        query_vector.is_some()
    );
    RetrievalResults {
        entities,
        facts,
        chunks,
        relationships,
    }
}

/// 0.3 x frequency + 0.4 x degree + 0.3 x fact count.
fn importance(entity: &EntityNode, degree: usize, facts: usize) -> f32 {
    0.3 * entity.frequency as f32 + 0.4 * degree as f32 + 0.3 * facts as f32
}

fn rank_entities(
    graph: &KnowledgeGraph,
    terms: &[String],
    request_words: &[String],
    similarity: &dyn Fn(&str) -> f32,
    degrees: &HashMap<&str, usize>,
    mention_counts: &HashMap<&str, usize>,
    options: &QueryOptions,
) -> Vec<RankedEntity> {
    let mut ranked = Vec::new();

    for entity in graph.entities() {
        let names: Vec<String> = entity.names().collect();
        let direct = terms
            .iter()
            .any(|t| names.iter().any(|n| contains_phrase(n, t) || contains_phrase(t, n)));

        let searchable = format!(
            "{} {} {}",
            names.join(" "),
            entity.all_types.join(" "),
            entity.all_descriptions.join(" ")
        )
        .to_lowercase();
        let partial = if request_words.is_empty() {
            0.0
        } else {
            request_words
                .iter()
                .filter(|w| searchable.contains(w.as_str()))
                .count() as f32
                / request_words.len() as f32
        };

        let raw_similarity = similarity(&entity.id);
        let embedding = if raw_similarity > options.threshold {
            raw_similarity
        } else {
            0.0
        };

        // Importance alone never makes an entity relevant.
        if !direct && partial == 0.0 && embedding == 0.0 {
            continue;
        }

        let degree = degrees.get(entity.id.as_str()).copied().unwrap_or(0);
        let fact_count = mention_counts.get(entity.id.as_str()).copied().unwrap_or(0);
        let score = DIRECT_MATCH_WEIGHT * if direct { 1.0 } else { 0.0 }
            + PARTIAL_MATCH_WEIGHT * partial
            + ENTITY_EMBEDDING_WEIGHT * embedding
            + IMPORTANCE_WEIGHT * importance(entity, degree, fact_count);
        if score <= options.threshold {
            continue;
        }

        ranked.push(RankedEntity {
            id: entity.id.clone(),
            name: entity.name.clone(),
            entity_type: entity.primary_type.clone(),
            description: entity.primary_description.clone(),
            all_types: entity.all_types.clone(),
            aliases: entity.aliases.iter().cloned().collect(),
            frequency: entity.frequency,
            degree,
            fact_count,
            clustered: entity.clustered,
            cluster_size: entity.cluster_size,
            relevance_score: score,
            chunks: entity.chunks.iter().cloned().collect(),
            source_files: entity.source_files.iter().cloned().collect(),
        });
    }

    sort_by_score(&mut ranked, |e| (e.relevance_score, e.id.as_str()));
    ranked.truncate(options.top_k);
    ranked
}

fn rank_facts(
    graph: &KnowledgeGraph,
    entities: &[RankedEntity],
    similarity: &dyn Fn(&str) -> f32,
    options: &QueryOptions,
) -> Vec<RankedFact> {
    let selected: HashSet<&str> = entities.iter().map(|e| e.id.as_str()).collect();
    let mut linked: HashMap<&str, HashSet<&str>> = HashMap::new();
    for edge in graph.edges().filter(|e| !e.is_relationship()) {
        if selected.contains(edge.target.as_str()) {
            linked
                .entry(edge.source.as_str())
                .or_default()
                .insert(edge.target.as_str());
        }
    }

    let mut ranked = Vec::new();
    for fact in graph.facts() {
        let lowered = fact.content.to_lowercase();
        let mut mentioned: Vec<String> = Vec::new();
        for entity in entities {
            let by_edge = linked
                .get(fact.id.as_str())
                .is_some_and(|targets| targets.contains(entity.id.as_str()));
            let by_name = std::iter::once(&entity.name)
                .chain(&entity.aliases)
                .any(|n| n.chars().count() >= 2 && lowered.contains(&n.to_lowercase()));
            if by_edge || by_name {
                mentioned.push(entity.name.clone());
            }
        }

        let raw_similarity = similarity(&fact.id);
        if mentioned.is_empty() && raw_similarity <= options.threshold {
            continue;
        }

        let score = FACT_MENTION_WEIGHT * mentioned.len() as f32
            + FACT_EMBEDDING_WEIGHT * raw_similarity.max(0.0)
            + FACT_CHUNK_WEIGHT * fact.chunks.len() as f32;
        if score <= options.threshold {
            continue;
        }

        ranked.push(RankedFact {
            id: fact.id.clone(),
            content: fact.content.clone(),
            confidence: fact.confidence,
            mentioned_entities: mentioned,
            relevance_score: score,
            chunks: fact.chunks.iter().cloned().collect(),
            source_files: fact.source_files.iter().cloned().collect(),
        });
    }

    sort_by_score(&mut ranked, |f| (f.relevance_score, f.id.as_str()));
    ranked.truncate(options.top_k);
    ranked
}

fn rank_chunks(
    stored: &[Chunk],
    entities: &[RankedEntity],
    facts: &[RankedFact],
    options: &QueryOptions,
) -> Vec<RankedChunk> {
    #[derive(Default)]
    struct Refs<'a> {
        entities: Vec<&'a str>,
        facts: Vec<&'a str>,
    }

    let mut refs: BTreeMap<&ChunkRef, Refs<'_>> = BTreeMap::new();
    for entity in entities {
        for chunk in &entity.chunks {
            refs.entry(chunk).or_default().entities.push(&entity.name);
        }
    }
    for fact in facts {
        for chunk in &fact.chunks {
            refs.entry(chunk).or_default().facts.push(&fact.content);
        }
    }

    let texts: HashMap<(&str, usize), &str> = stored
        .iter()
        .map(|c| ((c.source_file.as_str(), c.index), c.text.as_str()))
        .collect();

    let mut ranked: Vec<RankedChunk> = refs
        .into_iter()
        .map(|(chunk, r)| {
            let mut score = CHUNK_ENTITY_WEIGHT * r.entities.len() as f32
                + CHUNK_FACT_WEIGHT * r.facts.len() as f32;
            if r.entities.len() > 1 {
                score += MULTI_ENTITY_BONUS;
            }
            if r.facts.len() > 1 {
                score += MULTI_FACT_BONUS;
            }

            let (text, synthesized) = match texts.get(&(chunk.source_file.as_str(), chunk.index)) {
                Some(text) => (text.to_string(), false),
                None => (synthesize_chunk_text(&r.entities, &r.facts), true),
            };
            RankedChunk {
                source_file: chunk.source_file.clone(),
                index: chunk.index,
                text,
                synthesized,
                entities: r.entities.iter().map(|s| s.to_string()).collect(),
                facts: r.facts.iter().map(|s| s.to_string()).collect(),
                relevance_score: score,
            }
        })
        .collect();

    // BTreeMap order makes (source_file, index) the tie-breaker.
    ranked.sort_by(|a, b| {
        b.relevance_score
            .partial_cmp(&a.relevance_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    ranked.truncate(options.top_k);
    ranked
}

fn synthesize_chunk_text(entities: &[&str], facts: &[&str]) -> String {
    let mut parts = Vec::new();
    if !entities.is_empty() {
        parts.push(format!("Entities: {}.", entities.join(", ")));
    }
    if !facts.is_empty() {
        parts.push(format!("Facts: {}", facts.join(" ")));
    }
    parts.join(" ")
}

fn rank_relationships(
    graph: &KnowledgeGraph,
    entities: &[RankedEntity],
    options: &QueryOptions,
) -> Vec<RankedRelationship> {
    let names: HashMap<&str, &str> = entities
        .iter()
        .map(|e| (e.id.as_str(), e.name.as_str()))
        .collect();

    let mut ranked: Vec<RankedRelationship> = graph
        .edges()
        .filter(|e| e.is_relationship())
        .filter_map(|edge| {
            let source_name = names.get(edge.source.as_str())?;
            let target_name = names.get(edge.target.as_str())?;
            let source_files: Vec<String> = edge
                .chunks
                .iter()
                .map(|c| c.source_file.clone())
                .collect::<std::collections::BTreeSet<_>>()
                .into_iter()
                .collect();
            Some(RankedRelationship {
                source_id: edge.source.clone(),
                target_id: edge.target.clone(),
                source_name: source_name.to_string(),
                target_name: target_name.to_string(),
                relationship_type: edge.kind.relationship_type().unwrap_or_default().to_string(),
                description: edge.description.clone(),
                weight: edge.weight,
                confidence: edge.confidence,
                relevance_score: edge.weight,
                chunks: edge.chunks.iter().cloned().collect(),
                source_files,
            })
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.weight
            .partial_cmp(&a.weight)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.source_id.cmp(&b.source_id))
            .then_with(|| a.target_id.cmp(&b.target_id))
            .then_with(|| a.relationship_type.cmp(&b.relationship_type))
    });
    ranked.truncate(options.top_k);
    ranked
}

/// Descending score, ascending id on ties.
fn sort_by_score<T>(items: &mut [T], key: impl Fn(&T) -> (f32, &str)) {
    items.sort_by(|a, b| {
        let (score_a, id_a) = key(a);
        let (score_b, id_b) = key(b);
        score_b
            .partial_cmp(&score_a)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| id_a.cmp(id_b))
    });
}
