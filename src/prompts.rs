//! System prompt loader.
//!
//! Templates are Markdown files in `prompts/` (or `$PROMPTS_DIR`); a missing file
//! falls back to the built-in template. The JSON Schema of the expected response is
//! appended to every system prompt.

use std::path::PathBuf;

use schemars::schema_for;
use tracing::debug;

use crate::knowledge::concepts::ConceptAnalysis;
use crate::knowledge::extractor::ExtractionResponse;
use crate::knowledge::insights::InsightReport;
use crate::{Error, Result};

const EXTRACTION_PROMPT: &str = r#"You extract a knowledge graph from one chunk of a document.

Return:
- entities: named real-world objects or concepts (companies, people, products, periods, metrics). Give each a short type and a one-sentence description.
- relationships: directed links between two of the entities above, named by a snake_case verb phrase (e.g. "reported_in", "acquired"). Use the entity names exactly as listed.
- facts: self-contained statements from the chunk, with numbers and dates kept verbatim.

Only use information present in the chunk. Respond with JSON only, no prose."#;

const CONCEPT_ANALYSIS_PROMPT: &str = r#"You analyse a request for presentation content.

Identify the key concepts (names, terms and metrics the request is about), the main topics, the focus areas, the complexity level (basic, intermediate or advanced) and the purpose of the requested slide.

Respond with JSON only, no prose."#;

const INSIGHT_SYNTHESIS_PROMPT: &str = r#"You turn retrieved knowledge into insights for one presentation slide.

You receive the request, the entities, relationships and facts retrieved for it. Identify the main themes, the key relationships, the central entities and the evidence supporting them. Write a short content summary, suggest a slide structure and describe the audience focus.

Use only the supplied material. Respond with JSON only, no prose."#;

/// Available prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prompt {
    /// Entity/relationship/fact extraction per chunk.
    Extraction,
    /// Concept analysis of a free-text request.
    ConceptAnalysis,
    /// Insight synthesis over retrieved results.
    InsightSynthesis,
}

impl Prompt {
    /// Prompt file name (Markdown).
    pub fn filename(&self) -> &'static str {
        match self {
            Prompt::Extraction => "extraction.md",
            Prompt::ConceptAnalysis => "concept_analysis.md",
            Prompt::InsightSynthesis => "insight_synthesis.md",
        }
    }

    pub fn builtin(&self) -> &'static str {
        match self {
            Prompt::Extraction => EXTRACTION_PROMPT,
            Prompt::ConceptAnalysis => CONCEPT_ANALYSIS_PROMPT,
            Prompt::InsightSynthesis => INSIGHT_SYNTHESIS_PROMPT,
        }
    }

    /// Load the prompt from its file.
    pub fn load(&self) -> Result<String> {
        load_prompt(self.filename())
    }

    /// File template if present, built-in template otherwise.
    pub fn template(&self) -> String {
        match self.load() {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => self.builtin().to_string(),
            Err(err) => {
                debug!("{}, using built-in template", err);
                self.builtin().to_string()
            }
        }
    }

    /// JSON Schema of the expected response.
    pub fn response_schema(&self) -> String {
        let schema = match self {
            Prompt::Extraction => schema_for!(ExtractionResponse),
            Prompt::ConceptAnalysis => schema_for!(ConceptAnalysis),
            Prompt::InsightSynthesis => schema_for!(InsightReport),
        };
        serde_json::to_string_pretty(&schema).unwrap_or_default()
    }

    /// Template plus response schema, ready to send as the system message.
    pub fn system_prompt(&self) -> String {
        format!(
            "{}\n\n## Response format\nRespond with a single JSON object matching this JSON Schema:\n```json\n{}\n```",
            self.template().trim_end(),
            self.response_schema()
        )
    }
}

/// Load a prompt by file name.
pub fn load_prompt(filename: &str) -> Result<String> {
    let path = prompts_dir().join(filename);
    std::fs::read_to_string(&path).map_err(|e| {
        Error::ConfigError(format!("Failed to load prompt {}: {}", filename, e))
    })
}

/// Prompt directory: `$PROMPTS_DIR`, else the first existing `prompts/` up the tree.
pub fn prompts_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("PROMPTS_DIR") {
        return PathBuf::from(dir);
    }
    for candidate in [
        PathBuf::from("prompts"),
        PathBuf::from("../prompts"),
        PathBuf::from("../../prompts"),
    ] {
        if candidate.exists() {
            return candidate;
        }
    }
    PathBuf::from("prompts")
}

/// All prompts.
pub fn list_prompts() -> Vec<Prompt> {
    vec![
        Prompt::Extraction,
        Prompt::ConceptAnalysis,
        Prompt::InsightSynthesis,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_prompt_filenames_are_md() {
        for prompt in list_prompts() {
            assert!(
                prompt.filename().ends_with(".md"),
                "Prompt {:?} should have .md extension",
                prompt
            );
        }
    }

    #[test]
    fn test_load_prompt_nonexistent_file() {
        let result = load_prompt("nonexistent_file_12345.md");
        assert!(result.is_err());
    }

    #[test]
    fn system_prompt_embeds_response_schema() {
        let prompt = Prompt::Extraction.system_prompt();
        assert!(prompt.contains("## Response format"));
        assert!(prompt.contains("\"entities\""));
        assert!(prompt.contains("\"relationships\""));
        assert!(prompt.contains("\"facts\""));

        let concepts = Prompt::ConceptAnalysis.system_prompt();
        assert!(concepts.contains("key_concepts"));

        let insights = Prompt::InsightSynthesis.system_prompt();
        assert!(insights.contains("central_entities"));
    }

    #[test]
    fn builtin_templates_are_not_empty() {
        for prompt in list_prompts() {
            assert!(!prompt.builtin().trim().is_empty());
            assert!(!prompt.template().trim().is_empty());
        }
    }
}
