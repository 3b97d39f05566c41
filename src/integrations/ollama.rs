//! Ollama Client for local LLM inference.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::LanguageModel;
use crate::config::LlmSettings;
use crate::{Error, Result};

const OLLAMA_URL: &str = "http://localhost:11434";

/// Ollama client for local LLM.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    http: Client,
    base_url: String,
}

impl Default for OllamaClient {
    fn default() -> Self {
        Self::new()
    }
}

impl OllamaClient {
    /// Create new client with default URL.
    pub fn new() -> Self {
        Self::with_url(OLLAMA_URL, Duration::from_secs(120))
    }

    /// Create client with custom URL.
    pub fn with_url(base_url: impl Into<String>, timeout: Duration) -> Self {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Check if Ollama server is running.
    pub async fn is_running(&self) -> bool {
        self.http
            .get(format!("{}/api/tags", self.base_url))
            .timeout(Duration::from_secs(2))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    /// Generate text.
    pub async fn generate(
        &self,
        prompt: &str,
        model: &str,
        system: Option<&str>,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String> {
        let request = GenerateRequest {
            model: model.to_string(),
            prompt: prompt.to_string(),
            system: system.map(|s| s.to_string()),
            stream: false,
            options: GenerateOptions {
                temperature,
                num_predict: max_tokens,
            },
        };

        let response = self
            .http
            .post(format!("{}/api/generate", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::LlmError(format!("Ollama request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::LlmError(format!("Ollama error {}: {}", status, text)));
        }

        let result: GenerateResponse = response
            .json()
            .await
            .map_err(|e| Error::LlmError(format!("Invalid response: {}", e)))?;

        Ok(result.response)
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest {
    model: String,
    prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

/// [`LanguageModel`] over Ollama's `/api/generate`.
#[derive(Debug, Clone)]
pub struct OllamaModel {
    client: OllamaClient,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl OllamaModel {
    pub fn new(client: OllamaClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            temperature: 0.1,
            max_tokens: 2000,
        }
    }

    pub fn from_settings(settings: &LlmSettings) -> Self {
        let base_url = settings.base_url.as_deref().unwrap_or(OLLAMA_URL);
        Self {
            client: OllamaClient::with_url(base_url, settings.timeout),
            model: settings.model.clone(),
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
        }
    }
}

#[async_trait]
impl LanguageModel for OllamaModel {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String> {
        self.client
            .generate(
                prompt,
                &self.model,
                Some(system),
                self.temperature,
                self.max_tokens,
            )
            .await
    }

    async fn is_available(&self) -> bool {
        self.client.is_running().await
    }

    fn name(&self) -> &str {
        "ollama"
    }
}
