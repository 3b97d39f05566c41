//! Parse-or-raw contract for structured LLM responses.
//!
//! Every LLM answer is treated as a strict schema: strip Markdown code fences and
//! parse; failing that, recover the outermost `{...}` block and parse that; failing
//! that, hand the raw text back so the caller can take its heuristic path.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

static JSON_BLOCK: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)\{.*\}").expect("valid regex"));

/// LLM output that did not match the expected schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawText(pub String);

impl std::fmt::Display for RawText {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let preview: String = self.0.chars().take(120).collect();
        write!(f, "unparsable LLM output: {}", preview)
    }
}

/// Where a structured value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseSource {
    /// LLM output parsed as-is
    Llm,
    /// JSON block recovered from surrounding prose
    RecoveredJson,
    /// LLM unavailable or unusable, heuristic result
    Heuristic,
}

/// Parse an LLM response into `T`.
pub fn parse_llm_json<T: DeserializeOwned>(raw: &str) -> Result<T, RawText> {
    parse_llm_json_with_source(raw).map(|(value, _)| value)
}

/// Like [`parse_llm_json`], also reporting whether the JSON had to be recovered.
pub fn parse_llm_json_with_source<T: DeserializeOwned>(
    raw: &str,
) -> Result<(T, ResponseSource), RawText> {
    let cleaned = strip_code_fences(raw);
    let strict_err = match serde_json::from_str::<T>(&cleaned) {
        Ok(value) => return Ok((value, ResponseSource::Llm)),
        Err(e) => e,
    };

    if let Some(block) = JSON_BLOCK.find(&cleaned) {
        match serde_json::from_str::<T>(block.as_str()) {
            Ok(value) => {
                debug!("Recovered JSON block from LLM output ({})", strict_err);
                return Ok((value, ResponseSource::RecoveredJson));
            }
            Err(e) => warn!("Failed to parse recovered LLM JSON: {}", e),
        }
    } else {
        warn!("Failed to parse LLM JSON: {}", strict_err);
    }

    Err(RawText(raw.to_string()))
}

pub fn strip_code_fences(text: &str) -> String {
    let mut trimmed = text.trim().to_string();
    if trimmed.starts_with("```json") {
        trimmed = trimmed.trim_start_matches("```json").to_string();
    } else if trimmed.starts_with("```") {
        trimmed = trimmed.trim_start_matches("```").to_string();
    }
    if trimmed.ends_with("```") {
        trimmed.truncate(trimmed.len().saturating_sub(3));
    }
    trimmed.trim().to_string()
}
