//! Concept analysis of a free-text content request.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::llm_json::{parse_llm_json_with_source, ResponseSource};
use super::text::{content_words, is_stopword};
use crate::integrations::LanguageModel;
use crate::metrics;
use crate::prompts::Prompt;

const MAX_CONCEPTS: usize = 8;
const MAX_FREQUENT_TERMS: usize = 5;

/// What a request is about.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ConceptAnalysis {
    #[serde(default, alias = "keyConcepts")]
    pub key_concepts: Vec<String>,
    #[serde(default, alias = "mainTopics")]
    pub main_topics: Vec<String>,
    #[serde(default, alias = "focusAreas")]
    pub focus_areas: Vec<String>,
    /// basic, intermediate or advanced
    #[serde(default, alias = "complexityLevel")]
    pub complexity_level: String,
    #[serde(default, alias = "slidePurpose")]
    pub slide_purpose: String,
}

impl ConceptAnalysis {
    /// Lowercased concepts, topics and focus areas without duplicates, in that order.
    pub fn terms(&self) -> Vec<String> {
        let mut terms: Vec<String> = Vec::new();
        for term in self
            .key_concepts
            .iter()
            .chain(&self.main_topics)
            .chain(&self.focus_areas)
        {
            let lowered = term.trim().to_lowercase();
            if !lowered.is_empty() && !terms.contains(&lowered) {
                terms.push(lowered);
            }
        }
        terms
    }

    fn is_empty(&self) -> bool {
        self.key_concepts.is_empty() && self.main_topics.is_empty() && self.focus_areas.is_empty()
    }
}

/// LLM-backed concept analysis with a heuristic fallback.
#[derive(Clone)]
pub struct ConceptAnalyzer {
    model: Arc<dyn LanguageModel>,
    timeout: Duration,
    system_prompt: String,
}

impl ConceptAnalyzer {
    pub fn new(model: Arc<dyn LanguageModel>, timeout: Duration) -> Self {
        Self {
            model,
            timeout,
            system_prompt: Prompt::ConceptAnalysis.system_prompt(),
        }
    }

    /// Never fails: any LLM problem yields the heuristic analysis.
    pub async fn analyze(&self, request: &str) -> (ConceptAnalysis, ResponseSource) {
        let prompt = format!("## Request\n{}", request);
        let call = self.model.complete(&self.system_prompt, &prompt);

        let failure = match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(raw)) => match parse_llm_json_with_source::<ConceptAnalysis>(&raw) {
                Ok((analysis, source)) if !analysis.is_empty() => {
                    debug!("Concept analysis: {:?}", analysis.key_concepts);
                    return (analysis, source);
                }
                Ok(_) => "empty concept analysis".to_string(),
                Err(raw) => raw.to_string(),
            },
            Ok(Err(err)) => err.to_string(),
            Err(_) => format!("timed out after {:?}", self.timeout),
        };

        warn!("Concept analysis failed, using heuristic: {}", failure);
        metrics::record_fallback("concept_analysis");
        (heuristic_concepts(request), ResponseSource::Heuristic)
    }
}

/// Capitalised words plus the most frequent content words.
pub fn heuristic_concepts(request: &str) -> ConceptAnalysis {
    let capitalized = capitalized_words(request);
    let words = content_words(request);

    let mut counts: HashMap<&str, usize> = HashMap::new();
    for word in &words {
        *counts.entry(word.as_str()).or_default() += 1;
    }
    // Most frequent first, first occurrence breaks ties.
    let mut frequent: Vec<&str> = Vec::new();
    for word in &words {
        if !frequent.contains(&word.as_str()) {
            frequent.push(word);
        }
    }
    frequent.sort_by(|a, b| counts[b].cmp(&counts[a]));
    frequent.truncate(MAX_FREQUENT_TERMS);

    let mut key_concepts = capitalized.clone();
    for term in &frequent {
        if !key_concepts.iter().any(|k| k.eq_ignore_ascii_case(term)) {
            key_concepts.push(term.to_string());
        }
    }
    key_concepts.truncate(MAX_CONCEPTS);

    let main_topics = if capitalized.is_empty() {
        frequent.iter().take(3).map(|t| t.to_string()).collect()
    } else {
        capitalized.clone()
    };
    let focus_areas: Vec<String> = frequent
        .iter()
        .filter(|t| !capitalized.iter().any(|c| c.eq_ignore_ascii_case(t)))
        .map(|t| t.to_string())
        .collect();

    let complexity_level = match words.len() {
        0..=4 => "basic",
        5..=10 => "intermediate",
        _ => "advanced",
    };

    ConceptAnalysis {
        key_concepts,
        main_topics,
        focus_areas,
        complexity_level: complexity_level.to_string(),
        slide_purpose: slide_purpose(&words).to_string(),
    }
}

fn capitalized_words(request: &str) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    for raw in request.split_whitespace() {
        let word = raw.trim_matches(|c: char| !c.is_alphanumeric());
        let word = word
            .strip_suffix("'s")
            .or_else(|| word.strip_suffix("\u{2019}s"))
            .unwrap_or(word);
        let starts_upper = word.chars().next().is_some_and(|c| c.is_uppercase());
        if !starts_upper || word.chars().count() < 2 || is_stopword(&word.to_lowercase()) {
            continue;
        }
        if !found.iter().any(|f| f.eq_ignore_ascii_case(word)) {
            found.push(word.to_string());
        }
    }
    found
}

fn slide_purpose(words: &[String]) -> &'static str {
    let has = |candidates: &[&str]| words.iter().any(|w| candidates.contains(&w.as_str()));
    if has(&["compare", "comparison", "versus", "vs"]) {
        "comparison"
    } else if has(&["overview", "summary", "summarize", "introduction"]) {
        "overview"
    } else if has(&["trend", "trends", "growth", "grew", "increase", "decline", "revenue"]) {
        "trend analysis"
    } else {
        "informational"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrations::OfflineModel;
    use crate::Result;
    use async_trait::async_trait;

    struct FixedModel(&'static str);

    #[async_trait]
    impl LanguageModel for FixedModel {
        async fn complete(&self, _system: &str, _prompt: &str) -> Result<String> {
            Ok(self.0.to_string())
        }

        async fn is_available(&self) -> bool {
            true
        }

        fn name(&self) -> &str {
            "fixed"
        }
    }

    #[test]
    fn heuristic_picks_capitalized_and_frequent_terms() {
        let analysis = heuristic_concepts("What happened to Acme's revenue in Q3?");

        assert_eq!(analysis.key_concepts, vec!["Acme", "Q3", "revenue"]);
        assert_eq!(analysis.main_topics, vec!["Acme", "Q3"]);
        assert_eq!(analysis.focus_areas, vec!["revenue"]);
        assert_eq!(analysis.complexity_level, "basic");
        assert_eq!(analysis.slide_purpose, "trend analysis");
    }

    #[test]
    fn heuristic_without_capitals_uses_frequent_terms() {
        let analysis = heuristic_concepts("compare cloud costs and cloud margins");

        assert_eq!(analysis.key_concepts[0], "cloud");
        assert_eq!(analysis.main_topics[0], "cloud");
        assert_eq!(analysis.slide_purpose, "comparison");
    }

    #[test]
    fn terms_are_lowercased_and_deduplicated() {
        let analysis = ConceptAnalysis {
            key_concepts: vec!["Acme".into(), "Q3".into()],
            main_topics: vec!["acme".into()],
            focus_areas: vec!["Revenue".into(), " ".into()],
            ..Default::default()
        };
        assert_eq!(analysis.terms(), vec!["acme", "q3", "revenue"]);
    }

    #[tokio::test]
    async fn analyze_parses_llm_json() {
        let model = FixedModel(
            r#"{"keyConcepts": ["Acme", "revenue"], "mainTopics": ["growth"], "focusAreas": [], "complexityLevel": "basic", "slidePurpose": "update"}"#,
        );
        let analyzer = ConceptAnalyzer::new(Arc::new(model), Duration::from_secs(5));
        let (analysis, source) = analyzer.analyze("Acme revenue").await;

        assert_eq!(source, ResponseSource::Llm);
        assert_eq!(analysis.key_concepts, vec!["Acme", "revenue"]);
        assert_eq!(analysis.slide_purpose, "update");
    }

    #[tokio::test]
    async fn analyze_recovers_json_from_prose() {
        let model = FixedModel(r#"Sure! {"key_concepts": ["Acme"]} Hope that helps."#);
        let analyzer = ConceptAnalyzer::new(Arc::new(model), Duration::from_secs(5));
        let (analysis, source) = analyzer.analyze("Acme").await;

        assert_eq!(source, ResponseSource::RecoveredJson);
        assert_eq!(analysis.key_concepts, vec!["Acme"]);
    }

    #[tokio::test]
    async fn analyze_falls_back_to_heuristic() {
        let analyzer = ConceptAnalyzer::new(Arc::new(OfflineModel), Duration::from_secs(5));
        let (analysis, source) = analyzer.analyze("Show Acme growth").await;
        assert_eq!(source, ResponseSource::Heuristic);
        assert!(analysis.key_concepts.contains(&"Acme".to_string()));

        let garbage = ConceptAnalyzer::new(Arc::new(FixedModel("no idea")), Duration::from_secs(5));
        let (_, source) = garbage.analyze("Acme").await;
        assert_eq!(source, ResponseSource::Heuristic);
    }
}
