//! Document knowledge graphs for slide content retrieval
//!
//! This library provides tools to:
//! - Chunk documents and extract entities, relationships and facts with an LLM
//! - Merge per-chunk extractions into one graph per document
//! - Cluster a client's document graphs into one unified graph
//! - Embed graph nodes and edges for similarity search
//! - Answer free-text content requests with ranked, cited results and insights

pub mod config;
pub mod error;
pub mod integrations;
pub mod knowledge;
pub mod lock;
pub mod metrics;
pub mod prompts;
pub mod service;
pub mod storage;

// Re-export common types
pub use config::Config;
pub use error::{Error, Result};
pub use integrations::{Embedder, LanguageModel};
pub use prompts::{load_prompt, Prompt};
pub use service::{ClientKnowledgeGraph, DocumentSummary, KnowledgeService};

// Commands module uses re-exported types, so it must be declared after the re-exports
pub mod commands;
