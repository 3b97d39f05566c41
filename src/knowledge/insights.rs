//! High-level insights over retrieved results.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::concepts::ConceptAnalysis;
use super::llm_json::{parse_llm_json_with_source, ResponseSource};
use super::query::RetrievalResults;
use crate::integrations::LanguageModel;
use crate::metrics;
use crate::prompts::Prompt;

const MAX_ITEMS: usize = 5;
const SUMMARY_FACTS: usize = 3;
const PROMPT_ITEMS: usize = 15;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct InsightReport {
    #[serde(default, alias = "mainThemes")]
    pub main_themes: Vec<String>,
    #[serde(default, alias = "keyRelationships")]
    pub key_relationships: Vec<String>,
    #[serde(default, alias = "centralEntities")]
    pub central_entities: Vec<String>,
    #[serde(default, alias = "supportingEvidence")]
    pub supporting_evidence: Vec<String>,
    #[serde(default, alias = "contentSummary")]
    pub content_summary: String,
    #[serde(default, alias = "slideStructureSuggestions")]
    pub slide_structure_suggestions: Vec<String>,
    #[serde(default, alias = "audienceFocus")]
    pub audience_focus: String,
}

impl InsightReport {
    fn is_empty(&self) -> bool {
        self.main_themes.is_empty()
            && self.central_entities.is_empty()
            && self.content_summary.trim().is_empty()
    }
}

#[derive(Clone)]
pub struct InsightSynthesizer {
    model: Arc<dyn LanguageModel>,
    timeout: Duration,
    system_prompt: String,
}

impl InsightSynthesizer {
    pub fn new(model: Arc<dyn LanguageModel>, timeout: Duration) -> Self {
        Self {
            model,
            timeout,
            system_prompt: Prompt::InsightSynthesis.system_prompt(),
        }
    }

    /// Never fails: malformed or missing LLM output yields [`fallback_insights`].
    pub async fn synthesize(
        &self,
        request: &str,
        analysis: &ConceptAnalysis,
        results: &RetrievalResults,
    ) -> (InsightReport, ResponseSource) {
        if results.is_empty() {
            debug!("Nothing retrieved, skipping insight synthesis");
            return (fallback_insights(request, analysis, results), ResponseSource::Heuristic);
        }

        let prompt = build_prompt(request, analysis, results);
        let call = self.model.complete(&self.system_prompt, &prompt);
        let failure = match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(raw)) => match parse_llm_json_with_source::<InsightReport>(&raw) {
                Ok((report, source)) if !report.is_empty() => return (report, source),
                Ok(_) => "empty insight report".to_string(),
                Err(raw) => raw.to_string(),
            },
            Ok(Err(err)) => err.to_string(),
            Err(_) => format!("timed out after {:?}", self.timeout),
        };

        warn!("Insight synthesis failed, using fallback: {}", failure);
        metrics::record_fallback("insights");
        (fallback_insights(request, analysis, results), ResponseSource::Heuristic)
    }
}

fn build_prompt(request: &str, analysis: &ConceptAnalysis, results: &RetrievalResults) -> String {
    let mut prompt = format!("## Request\n{}\n\n## Key concepts\n", request);
    prompt.push_str(&analysis.key_concepts.join(", "));

    prompt.push_str("\n\n## Entities\n");
    for entity in results.entities.iter().take(PROMPT_ITEMS) {
        prompt.push_str(&format!(
            "- {} ({}): {}\n",
            entity.name, entity.entity_type, entity.description
        ));
    }

    prompt.push_str("\n## Relationships\n");
    for rel in results.relationships.iter().take(PROMPT_ITEMS) {
        prompt.push_str(&format!(
            "- {} --{}--> {}\n",
            rel.source_name, rel.relationship_type, rel.target_name
        ));
    }

    prompt.push_str("\n## Facts\n");
    for fact in results.facts.iter().take(PROMPT_ITEMS) {
        prompt.push_str(&format!("- {}\n", fact.content));
    }
    prompt
}

/// Deterministic insights built from the results alone.
pub fn fallback_insights(
    request: &str,
    analysis: &ConceptAnalysis,
    results: &RetrievalResults,
) -> InsightReport {
    // Themes: entity names grouped by type, largest group first.
    let mut by_type: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for entity in &results.entities {
        let kind = if entity.entity_type.is_empty() {
            "Other"
        } else {
            entity.entity_type.as_str()
        };
        by_type.entry(kind).or_default().push(&entity.name);
    }
    let mut groups: Vec<(&str, Vec<&str>)> = by_type.into_iter().collect();
    groups.sort_by(|a, b| b.1.len().cmp(&a.1.len()));
    let main_themes: Vec<String> = groups
        .iter()
        .take(MAX_ITEMS)
        .map(|(kind, names)| format!("{}: {}", kind, names.join(", ")))
        .collect();

    let mut central: Vec<(&str, f32)> = results
        .entities
        .iter()
        .map(|e| (e.name.as_str(), e.relevance_score + e.degree as f32))
        .collect();
    central.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(b.0))
    });
    let central_entities: Vec<String> = central
        .iter()
        .take(MAX_ITEMS)
        .map(|(name, _)| name.to_string())
        .collect();

    let mut by_relationship: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for rel in &results.relationships {
        by_relationship
            .entry(rel.relationship_type.as_str())
            .or_default()
            .push(format!("{} -> {}", rel.source_name, rel.target_name));
    }
    let key_relationships: Vec<String> = by_relationship
        .into_iter()
        .take(MAX_ITEMS)
        .map(|(kind, pairs)| format!("{}: {}", kind, pairs.join("; ")))
        .collect();

    let supporting_evidence: Vec<String> = results
        .facts
        .iter()
        .take(MAX_ITEMS)
        .map(|f| f.content.clone())
        .collect();

    let content_summary = if !results.facts.is_empty() {
        results
            .facts
            .iter()
            .take(SUMMARY_FACTS)
            .map(|f| {
                let text = f.content.trim();
                if text.ends_with(['.', '!', '?']) {
                    text.to_string()
                } else {
                    format!("{}.", text)
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    } else if !central_entities.is_empty() {
        format!("Key entities: {}.", central_entities.join(", "))
    } else {
        format!("No relevant content found for: {}", request)
    };

    let title = analysis
        .main_topics
        .first()
        .cloned()
        .unwrap_or_else(|| request.to_string());
    let mut slide_structure_suggestions = vec![format!("Title: {}", title)];
    if !central_entities.is_empty() {
        slide_structure_suggestions.push(format!("Overview: {}", central_entities.join(", ")));
    }
    if !supporting_evidence.is_empty() {
        slide_structure_suggestions.push("Key facts as bullet points".to_string());
    }
    if !key_relationships.is_empty() {
        slide_structure_suggestions.push("Relationship diagram".to_string());
    }

    let audience_focus = match analysis.complexity_level.as_str() {
        "advanced" => "specialists",
        "basic" => "general audience",
        _ => "informed audience",
    };

    InsightReport {
        main_themes,
        key_relationships,
        central_entities,
        supporting_evidence,
        content_summary,
        slide_structure_suggestions,
        audience_focus: audience_focus.to_string(),
    }
}
