//! External integrations module.
//!
//! Provides clients for:
//! - OpenAI (chat completions, embeddings)
//! - Ollama (local LLM)
//! - Offline stand-ins (no LLM, hashing embeddings)

pub mod local;
pub mod ollama;
pub mod openai;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::{EmbeddingProvider, EmbeddingSettings, LlmProvider, LlmSettings};
use crate::Result;

pub use local::{HashingEmbedder, OfflineModel};
pub use ollama::{OllamaClient, OllamaModel};
pub use openai::{OpenAIClient, OpenAIEmbedder, OpenAIModel};

/// Opaque text-completion service.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Complete `prompt` under the given system instructions.
    async fn complete(&self, system: &str, prompt: &str) -> Result<String>;

    /// Cheap reachability check; callers skip the LLM path entirely when false.
    async fn is_available(&self) -> bool;

    fn name(&self) -> &str;
}

/// Opaque embedding service: text -> fixed-dimension vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// One vector per input text, in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn dimension(&self) -> usize;

    fn name(&self) -> &str;
}

/// Build the configured text-completion backend, degrading to [`OfflineModel`]
/// when the provider cannot be constructed.
pub fn language_model_from_settings(settings: &LlmSettings) -> Arc<dyn LanguageModel> {
    match settings.provider {
        LlmProvider::OpenAI => match OpenAIModel::from_settings(settings) {
            Ok(model) => {
                info!("Using OpenAI model {}", settings.model);
                Arc::new(model)
            }
            Err(err) => {
                warn!("OpenAI unavailable, running offline: {}", err);
                Arc::new(OfflineModel)
            }
        },
        LlmProvider::Ollama => {
            info!("Using Ollama model {}", settings.model);
            Arc::new(OllamaModel::from_settings(settings))
        }
        LlmProvider::Offline => {
            info!("LLM disabled, heuristic fallbacks only");
            Arc::new(OfflineModel)
        }
    }
}

/// Build the configured embedding backend, degrading to [`HashingEmbedder`].
pub fn embedder_from_settings(settings: &EmbeddingSettings) -> Arc<dyn Embedder> {
    match settings.provider {
        EmbeddingProvider::OpenAI => match OpenAIEmbedder::from_env(&settings.model) {
            Ok(embedder) => {
                info!("Using OpenAI embeddings ({})", settings.model);
                Arc::new(embedder)
            }
            Err(err) => {
                warn!("Falling back to local embeddings ({})", err);
                Arc::new(HashingEmbedder::new(settings.local_dimension))
            }
        },
        EmbeddingProvider::Local => Arc::new(HashingEmbedder::new(settings.local_dimension)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn llm_settings(provider: LlmProvider) -> LlmSettings {
        LlmSettings {
            provider,
            model: "test-model".to_string(),
            base_url: Some("http://127.0.0.1:9".to_string()),
            temperature: 0.1,
            max_tokens: 100,
            timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn offline_provider_builds_offline_model() {
        let model = language_model_from_settings(&llm_settings(LlmProvider::Offline));
        assert_eq!(model.name(), "offline");
    }

    #[test]
    fn ollama_provider_builds_ollama_model() {
        let model = language_model_from_settings(&llm_settings(LlmProvider::Ollama));
        assert_eq!(model.name(), "ollama");
    }

    #[test]
    fn local_embeddings_use_configured_dimension() {
        let settings = EmbeddingSettings {
            provider: EmbeddingProvider::Local,
            model: "unused".to_string(),
            local_dimension: 64,
            batch_size: 8,
        };
        let embedder = embedder_from_settings(&settings);
        assert_eq!(embedder.dimension(), 64);
        assert_eq!(embedder.name(), "local-hash");
    }
}
