//! Document knowledge graph engine
//!
//! Pipeline: chunk -> extract (per chunk, via LLM) -> merge (per document) ->
//! build document graph -> cluster (per client) -> embed -> query.

pub mod builder;
pub mod chunker;
pub mod cluster;
pub mod concepts;
pub mod embeddings;
pub mod extractor;
pub mod graph;
pub mod insights;
pub mod llm_json;
pub mod merger;
pub mod query;
pub mod text;
pub mod tokenizer;

use uuid::Uuid;

/// Namespace for name-derived ids (chunks, entities, facts).
pub(crate) const ID_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a4e_93d7_4b1f_8e52_0c7a_d4b9_3e61);

pub use builder::DocumentGraphBuilder;
pub use chunker::{Chunk, Chunker, ChunkingStrategy};
pub use cluster::{ClusteringMethod, ClusteringReport, Clusterer};
pub use embeddings::{cosine_similarity, EmbeddingStore, EmbeddingVector, GenerationReport, OwnerKind};
pub use extractor::{DocumentMeta, ExtractionRecord, Extractor};
pub use graph::{ChunkRef, Edge, EdgeKind, EntityNode, FactNode, GraphStats, KnowledgeGraph, Node};
pub use merger::{merge, MergedGraphData};
pub use concepts::ConceptAnalysis;
pub use insights::InsightReport;
pub use query::{QueryContext, QueryEngine, QueryOptions, QueryOutcome, QueryResponse, RetrievalResults};
