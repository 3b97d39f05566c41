//! Per-chunk entity / relationship / fact extraction through the LLM.
//!
//! Extraction fails closed: a chunk whose request errors, times out or returns
//! unusable output yields a fallback record whose single fact is the (truncated)
//! chunk text, so every chunk stays represented in the graph.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::chunker::Chunk;
use super::llm_json::parse_llm_json;
use crate::config::ExtractionSettings;
use crate::integrations::LanguageModel;
use crate::metrics;
use crate::prompts::Prompt;

/// Document a chunk belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMeta {
    pub filename: String,
    pub file_path: String,
}

impl DocumentMeta {
    pub fn new(filename: impl Into<String>, file_path: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            file_path: file_path.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ExtractedEntity {
    pub name: String,
    #[serde(rename = "type", alias = "entity_type", default)]
    pub entity_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ExtractedRelationship {
    #[serde(alias = "source_entity", default)]
    pub source: String,
    #[serde(alias = "target_entity", default)]
    pub target: String,
    #[serde(rename = "type", alias = "relationship_type", alias = "relation", default)]
    pub relationship_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

/// Facts arrive either as bare strings or as objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum ExtractedFact {
    Text(String),
    Detailed {
        #[serde(alias = "fact", alias = "content")]
        text: String,
        #[serde(default)]
        confidence: Option<f32>,
    },
}

impl ExtractedFact {
    pub fn text(&self) -> &str {
        match self {
            ExtractedFact::Text(text) => text,
            ExtractedFact::Detailed { text, .. } => text,
        }
    }

    pub fn confidence(&self) -> Option<f32> {
        match self {
            ExtractedFact::Text(_) => None,
            ExtractedFact::Detailed { confidence, .. } => *confidence,
        }
    }
}

/// Structured answer expected from the extraction prompt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ExtractionResponse {
    #[serde(default)]
    pub entities: Vec<ExtractedEntity>,
    #[serde(default)]
    pub relationships: Vec<ExtractedRelationship>,
    #[serde(default)]
    pub facts: Vec<ExtractedFact>,
}

impl ExtractionResponse {
    fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.facts.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub chunk_index: usize,
    pub filename: String,
    pub file_path: String,
    pub chunk_text: String,
    pub timestamp: DateTime<Utc>,
}

/// Extraction output for one chunk; consumed by the merger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRecord {
    pub entities: Vec<ExtractedEntity>,
    pub relationships: Vec<ExtractedRelationship>,
    pub facts: Vec<ExtractedFact>,
    pub metadata: ChunkMetadata,
    /// Set when this record was synthesized because extraction failed
    #[serde(default)]
    pub fallback: bool,
}

impl ExtractionRecord {
    pub fn from_response(response: ExtractionResponse, chunk: &Chunk, meta: &DocumentMeta) -> Self {
        Self {
            entities: response
                .entities
                .into_iter()
                .filter(|e| !e.name.trim().is_empty())
                .collect(),
            relationships: response.relationships,
            facts: response
                .facts
                .into_iter()
                .filter(|f| !f.text().trim().is_empty())
                .collect(),
            metadata: chunk_metadata(chunk, meta),
            fallback: false,
        }
    }

    /// Empty entities/relationships, one fact holding the truncated chunk text.
    pub fn fallback(chunk: &Chunk, meta: &DocumentMeta, max_chars: usize) -> Self {
        let mut text: String = chunk.text.chars().take(max_chars).collect();
        if text.len() < chunk.text.len() {
            text.push_str("...");
        }

        Self {
            entities: Vec::new(),
            relationships: Vec::new(),
            facts: vec![ExtractedFact::Text(text)],
            metadata: chunk_metadata(chunk, meta),
            fallback: true,
        }
    }
}

fn chunk_metadata(chunk: &Chunk, meta: &DocumentMeta) -> ChunkMetadata {
    ChunkMetadata {
        chunk_index: chunk.index,
        filename: meta.filename.clone(),
        file_path: meta.file_path.clone(),
        chunk_text: chunk.text.clone(),
        timestamp: Utc::now(),
    }
}

/// LLM-backed extractor with bounded fan-out.
#[derive(Clone)]
pub struct Extractor {
    model: Arc<dyn LanguageModel>,
    settings: ExtractionSettings,
    system_prompt: String,
}

impl Extractor {
    pub fn new(model: Arc<dyn LanguageModel>, settings: ExtractionSettings) -> Self {
        Self {
            model,
            settings,
            system_prompt: Prompt::Extraction.system_prompt(),
        }
    }

    /// Extract one chunk. Never fails; see module docs.
    pub async fn extract(&self, chunk: &Chunk, meta: &DocumentMeta) -> ExtractionRecord {
        let prompt = build_prompt(chunk, meta);
        let call = self.model.complete(&self.system_prompt, &prompt);

        let failure = match tokio::time::timeout(self.settings.timeout, call).await {
            Ok(Ok(raw)) => match parse_llm_json::<ExtractionResponse>(&raw) {
                Ok(response) if !response.is_empty() => {
                    debug!(
                        "Chunk {} of {}: {} entities, {} relationships, {} facts",
                        chunk.index,
                        meta.filename,
                        response.entities.len(),
                        response.relationships.len(),
                        response.facts.len()
                    );
                    return ExtractionRecord::from_response(response, chunk, meta);
                }
                Ok(_) => "empty extraction".to_string(),
                Err(raw) => raw.to_string(),
            },
            Ok(Err(err)) => err.to_string(),
            Err(_) => format!("timed out after {:?}", self.settings.timeout),
        };

        warn!(
            "Extraction failed for chunk {} of {}, using fallback: {}",
            chunk.index, meta.filename, failure
        );
        metrics::record_fallback("extraction");
        ExtractionRecord::fallback(chunk, meta, self.settings.fallback_fact_chars)
    }

    /// Extract every chunk of one document, at most `max_concurrency` requests in
    /// flight. Records come back in completion order.
    pub async fn extract_all(&self, chunks: &[Chunk], meta: &DocumentMeta) -> Vec<ExtractionRecord> {
        if chunks.is_empty() {
            return Vec::new();
        }

        let started = Instant::now();
        if !self.model.is_available().await {
            warn!(
                "Language model {} unavailable, {} chunks of {} use fallback records",
                self.model.name(),
                chunks.len(),
                meta.filename
            );
            metrics::record_fallback("extraction_unavailable");
            return chunks
                .iter()
                .map(|c| ExtractionRecord::fallback(c, meta, self.settings.fallback_fact_chars))
                .collect();
        }

        let records: Vec<ExtractionRecord> = stream::iter(chunks)
            .map(|chunk| self.extract(chunk, meta))
            .buffer_unordered(self.settings.max_concurrency.max(1))
            .collect()
            .await;

        let fallbacks = records.iter().filter(|r| r.fallback).count();
        metrics::observe_stage("extraction", started.elapsed());
        info!(
            "Extracted {} chunks of {} ({} fallbacks) in {:.2?}",
            records.len(),
            meta.filename,
            fallbacks,
            started.elapsed()
        );
        records
    }
}

fn build_prompt(chunk: &Chunk, meta: &DocumentMeta) -> String {
    format!(
        "## Document\n{}\n\n## Chunk {}\n{}\n\nReturn the entities, relationships and facts as JSON.",
        meta.filename, chunk.index, chunk.text
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrations::OfflineModel;
    use crate::{Error, Result};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct ScriptedModel {
        reply: fn(&str) -> Result<String>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        delay: Duration,
    }

    impl ScriptedModel {
        fn new(reply: fn(&str) -> Result<String>) -> Self {
            Self {
                reply,
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                delay: Duration::from_millis(0),
            }
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        async fn complete(&self, _system: &str, prompt: &str) -> Result<String> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            (self.reply)(prompt)
        }

        async fn is_available(&self) -> bool {
            true
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn settings() -> ExtractionSettings {
        ExtractionSettings {
            max_concurrency: 2,
            timeout: Duration::from_secs(5),
            fallback_fact_chars: 20,
        }
    }

    fn chunks(n: usize) -> Vec<Chunk> {
        (0..n)
            .map(|i| {
                Chunk::new(
                    i,
                    format!("Chunk {} mentions Acme Corp and its quarterly results", i),
                    "doc.txt",
                    0..10,
                )
            })
            .collect()
    }

    fn meta() -> DocumentMeta {
        DocumentMeta::new("doc.txt", "/tmp/doc.txt")
    }

    #[test]
    fn response_accepts_alternate_spellings() {
        let raw = r#"{
            "entities": [{"name": "Acme Corp", "entity_type": "Organization", "description": "A company"}],
            "relationships": [{"source_entity": "Acme Corp", "target_entity": "Q3", "relationship_type": "reported_in"}],
            "facts": ["Revenue grew 12%", {"fact": "Q3 was strong", "confidence": 0.8}]
        }"#;
        let response: ExtractionResponse = parse_llm_json(raw).unwrap();

        assert_eq!(response.entities[0].entity_type, "Organization");
        assert_eq!(response.relationships[0].source, "Acme Corp");
        assert_eq!(response.relationships[0].target, "Q3");
        assert_eq!(response.relationships[0].relationship_type, "reported_in");
        assert_eq!(response.facts[0].text(), "Revenue grew 12%");
        assert_eq!(response.facts[1].text(), "Q3 was strong");
        assert_eq!(response.facts[1].confidence(), Some(0.8));
    }

    #[test]
    fn fallback_record_truncates_chunk_text() {
        let chunk = &chunks(1)[0];
        let record = ExtractionRecord::fallback(chunk, &meta(), 20);

        assert!(record.fallback);
        assert!(record.entities.is_empty());
        assert!(record.relationships.is_empty());
        assert_eq!(record.facts.len(), 1);
        assert_eq!(record.facts[0].text(), "Chunk 0 mentions Acm...");
        assert_eq!(record.metadata.chunk_index, 0);
        assert_eq!(record.metadata.filename, "doc.txt");
    }

    #[tokio::test]
    async fn extract_parses_valid_response() {
        let model = ScriptedModel::new(|_| {
            Ok(r#"```json
{"entities": [{"name": "Acme Corp", "type": "Organization"}, {"name": "  "}], "facts": ["Acme grew"]}
```"#
                .to_string())
        });
        let extractor = Extractor::new(Arc::new(model), settings());
        let record = extractor.extract(&chunks(1)[0], &meta()).await;

        assert!(!record.fallback);
        assert_eq!(record.entities.len(), 1);
        assert_eq!(record.entities[0].name, "Acme Corp");
        assert_eq!(record.facts.len(), 1);
    }

    #[tokio::test]
    async fn extract_falls_back_on_error() {
        let model = ScriptedModel::new(|_| Err(Error::LlmError("boom".to_string())));
        let extractor = Extractor::new(Arc::new(model), settings());
        let record = extractor.extract(&chunks(1)[0], &meta()).await;

        assert!(record.fallback);
        assert_eq!(record.facts.len(), 1);
    }

    #[tokio::test]
    async fn extract_falls_back_on_garbage_and_empty_output() {
        let garbage = ScriptedModel::new(|_| Ok("I could not find anything".to_string()));
        let extractor = Extractor::new(Arc::new(garbage), settings());
        assert!(extractor.extract(&chunks(1)[0], &meta()).await.fallback);

        let empty = ScriptedModel::new(|_| Ok("{}".to_string()));
        let extractor = Extractor::new(Arc::new(empty), settings());
        assert!(extractor.extract(&chunks(1)[0], &meta()).await.fallback);
    }

    #[tokio::test]
    async fn extract_falls_back_on_timeout() {
        let mut model = ScriptedModel::new(|_| Ok(r#"{"facts": ["late"]}"#.to_string()));
        model.delay = Duration::from_millis(200);
        let mut settings = settings();
        settings.timeout = Duration::from_millis(20);
        let extractor = Extractor::new(Arc::new(model), settings);

        assert!(extractor.extract(&chunks(1)[0], &meta()).await.fallback);
    }

    #[tokio::test]
    async fn failing_chunk_does_not_affect_siblings() {
        let model = ScriptedModel::new(|prompt| {
            if prompt.contains("## Chunk 1\n") {
                Err(Error::LlmError("chunk 1 fails".to_string()))
            } else {
                Ok(r#"{"entities": [{"name": "Acme Corp"}]}"#.to_string())
            }
        });
        let extractor = Extractor::new(Arc::new(model), settings());
        let mut records = extractor.extract_all(&chunks(4), &meta()).await;
        records.sort_by_key(|r| r.metadata.chunk_index);

        assert_eq!(records.len(), 4);
        assert!(records[1].fallback);
        assert!(records.iter().filter(|r| !r.fallback).count() == 3);
    }

    #[tokio::test]
    async fn extract_all_respects_concurrency_bound() {
        let mut model = ScriptedModel::new(|_| Ok(r#"{"facts": ["ok"]}"#.to_string()));
        model.delay = Duration::from_millis(20);
        let model = Arc::new(model);
        let extractor = Extractor::new(model.clone(), settings());

        let records = extractor.extract_all(&chunks(8), &meta()).await;

        assert_eq!(records.len(), 8);
        assert!(model.max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn unavailable_model_yields_fallbacks_for_all_chunks() {
        let extractor = Extractor::new(Arc::new(OfflineModel), settings());
        let records = extractor.extract_all(&chunks(3), &meta()).await;

        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.fallback));
    }
}
