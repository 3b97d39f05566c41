//! OpenAI API client: chat completions for extraction/analysis, embeddings for
//! the embedding store.

use std::env;
use std::time::Duration;

use async_openai::{
    config::OpenAIConfig,
    types::{CreateEmbeddingRequestArgs, EmbeddingInput},
    Client as AsyncOpenAIClient,
};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Embedder, LanguageModel};
use crate::config::LlmSettings;
use crate::{Error, Result};

const OPENAI_API_URL: &str = "https://api.openai.com/v1";

/// Longest text sent to the embeddings endpoint, in chars.
const MAX_EMBEDDING_CHARS: usize = 8000;

/// OpenAI client.
#[derive(Debug, Clone)]
pub struct OpenAIClient {
    http: Client,
    api_key: String,
    base_url: String,
}

impl OpenAIClient {
    /// Create client from environment variable.
    pub fn from_env() -> Result<Self> {
        let api_key = env::var("OPENAI_API_KEY")
            .map_err(|_| Error::ConfigError("OPENAI_API_KEY not set".to_string()))?;
        Self::new(api_key, Duration::from_secs(60))
    }

    /// Create client with API key.
    pub fn new<S: Into<String>>(api_key: S, timeout: Duration) -> Result<Self> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(Error::ConfigError("OPENAI_API_KEY is empty".to_string()));
        }

        let http = Client::builder()
            .user_agent(concat!("slidegraph/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| Error::LlmError(format!("HTTP client error: {}", e)))?;

        Ok(Self {
            http,
            api_key,
            base_url: OPENAI_API_URL.to_string(),
        })
    }

    /// Point the client at a compatible API (proxy, Azure gateway, test server).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Chat completion.
    pub async fn chat_completion(
        &self,
        messages: Vec<ChatMessage>,
        model: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String> {
        let request = ChatRequest {
            model: model.to_string(),
            messages,
            temperature,
            max_tokens,
        };

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::LlmError(format!("OpenAI request failed: {}", e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::LlmError(format!("Failed to read response: {}", e)))?;

        if !status.is_success() {
            return Err(Error::LlmError(format!("OpenAI error {}: {}", status, text)));
        }

        let chat_response: ChatResponse = serde_json::from_str(&text)
            .map_err(|e| Error::LlmError(format!("Invalid response: {}", e)))?;

        chat_response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| Error::LlmError("Empty response from OpenAI".to_string()))
    }

    /// Check that the API answers with our key.
    pub async fn is_reachable(&self) -> bool {
        self.http
            .get(format!("{}/models", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

/// Chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: Some(content.into()),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: Some(content.into()),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

/// [`LanguageModel`] over OpenAI chat completions.
#[derive(Debug, Clone)]
pub struct OpenAIModel {
    client: OpenAIClient,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl OpenAIModel {
    pub fn new(client: OpenAIClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            temperature: 0.1,
            max_tokens: 2000,
        }
    }

    pub fn from_settings(settings: &LlmSettings) -> Result<Self> {
        let api_key = env::var("OPENAI_API_KEY")
            .map_err(|_| Error::ConfigError("OPENAI_API_KEY not set".to_string()))?;
        let mut client = OpenAIClient::new(api_key, settings.timeout)?;
        if let Some(base_url) = &settings.base_url {
            client = client.with_base_url(base_url);
        }

        Ok(Self {
            client,
            model: settings.model.clone(),
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
        })
    }
}

#[async_trait]
impl LanguageModel for OpenAIModel {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String> {
        let messages = vec![ChatMessage::system(system), ChatMessage::user(prompt)];
        self.client
            .chat_completion(messages, &self.model, self.temperature, self.max_tokens)
            .await
    }

    async fn is_available(&self) -> bool {
        self.client.is_reachable().await
    }

    fn name(&self) -> &str {
        "openai"
    }
}

/// Embedding generation using the OpenAI embeddings endpoint.
pub struct OpenAIEmbedder {
    client: AsyncOpenAIClient<OpenAIConfig>,
    model: String,
}

impl OpenAIEmbedder {
    pub fn from_env(model: &str) -> Result<Self> {
        let api_key = env::var("OPENAI_API_KEY")
            .map_err(|_| Error::ConfigError("OPENAI_API_KEY not set".to_string()))?;
        Ok(Self::with_config(
            OpenAIConfig::new().with_api_key(api_key),
            model,
        ))
    }

    pub fn with_config(config: OpenAIConfig, model: &str) -> Self {
        Self {
            client: AsyncOpenAIClient::with_config(config),
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        debug!("Generating embeddings for {} texts", texts.len());

        // The endpoint rejects empty strings; those slots get empty vectors.
        let processed: Vec<String> = texts
            .iter()
            .map(|t| t.trim().chars().take(MAX_EMBEDDING_CHARS).collect::<String>())
            .filter(|t| !t.is_empty())
            .collect();

        if processed.is_empty() {
            return Ok(vec![Vec::new(); texts.len()]);
        }

        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.model)
            .input(EmbeddingInput::StringArray(processed))
            .build()
            .map_err(|e| Error::EmbeddingError(e.to_string()))?;

        let response = self
            .client
            .embeddings()
            .create(request)
            .await
            .map_err(|e| Error::EmbeddingError(e.to_string()))?;

        debug!(
            "Generated {} embeddings, tokens used: {}",
            response.data.len(),
            response.usage.total_tokens
        );

        let mut data = response.data;
        data.sort_by_key(|e| e.index);
        let mut embed_iter = data.into_iter();

        let mut result = Vec::with_capacity(texts.len());
        for text in texts {
            if text.trim().is_empty() {
                result.push(Vec::new());
            } else {
                let embedding = embed_iter.next().ok_or_else(|| {
                    Error::EmbeddingError("Fewer embeddings returned than requested".to_string())
                })?;
                result.push(embedding.embedding);
            }
        }

        Ok(result)
    }

    fn dimension(&self) -> usize {
        match self.model.as_str() {
            "text-embedding-3-small" => 1536,
            "text-embedding-3-large" => 3072,
            "text-embedding-ada-002" => 1536,
            _ => 1536,
        }
    }

    fn name(&self) -> &str {
        "openai"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    #[test]
    fn test_new_rejects_empty_key() {
        let err = OpenAIClient::new("   ", Duration::from_secs(5)).unwrap_err();
        assert!(err.to_string().contains("empty"));
    }

    fn client(server: &MockServer) -> OpenAIClient {
        OpenAIClient::new("test_key", Duration::from_secs(5))
            .expect("client")
            .with_base_url(server.base_url())
    }

    #[tokio::test]
    async fn chat_completion_returns_first_choice_content() {
        let server = MockServer::start_async().await;

        let completion_mock = server.mock(|when, then| {
            when.method(POST)
                .path("/chat/completions")
                .header("Authorization", "Bearer test_key");
            then.status(200).json_body(json!({
                "choices": [
                    { "message": { "role": "assistant", "content": "Hello!" } }
                ]
            }));
        });

        let reply = client(&server)
            .chat_completion(vec![ChatMessage::user("Hi")], "gpt-4o-mini", 0.2, 32)
            .await
            .unwrap();

        assert_eq!(reply, "Hello!");
        completion_mock.assert_calls(1);
    }

    #[tokio::test]
    async fn chat_completion_returns_error_on_non_success_status() {
        let server = MockServer::start_async().await;

        let completion_mock = server.mock(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(429).body("rate limited");
        });

        let err = client(&server)
            .chat_completion(vec![], "gpt-4o-mini", 0.2, 32)
            .await
            .unwrap_err();

        let msg = err.to_string();
        assert!(msg.contains("OpenAI error 429"));
        assert!(msg.contains("rate limited"));
        completion_mock.assert_calls(1);
    }

    #[tokio::test]
    async fn chat_completion_returns_error_on_invalid_json() {
        let server = MockServer::start_async().await;

        server.mock(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(200).body("not json");
        });

        let err = client(&server)
            .chat_completion(vec![], "gpt-4o-mini", 0.2, 32)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("Invalid response"));
    }

    #[tokio::test]
    async fn chat_completion_returns_error_on_missing_message_content() {
        let server = MockServer::start_async().await;

        server.mock(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(200).json_body(json!({
                "choices": [
                    { "message": { "role": "assistant", "content": null } }
                ]
            }));
        });

        let err = client(&server)
            .chat_completion(vec![], "gpt-4o-mini", 0.2, 32)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("Empty response from OpenAI"));
    }

    #[tokio::test]
    async fn model_complete_sends_system_and_user_messages() {
        let server = MockServer::start_async().await;

        let completion_mock = server.mock(|when, then| {
            when.method(POST).path("/chat/completions").is_true(|req| {
                let body: serde_json::Value =
                    serde_json::from_slice(req.body().as_ref()).unwrap();
                body["messages"][0]["role"] == "system"
                    && body["messages"][0]["content"] == "Extract entities"
                    && body["messages"][1]["content"] == "Acme Corp grew"
                    && body["model"] == "gpt-4o-mini"
            });
            then.status(200).json_body(json!({
                "choices": [
                    { "message": { "role": "assistant", "content": "{}" } }
                ]
            }));
        });

        let model = OpenAIModel::new(client(&server), "gpt-4o-mini");
        let reply = model.complete("Extract entities", "Acme Corp grew").await.unwrap();

        assert_eq!(reply, "{}");
        assert_eq!(model.name(), "openai");
        completion_mock.assert_calls(1);
    }

    #[tokio::test]
    async fn model_availability_follows_models_endpoint() {
        let healthy = MockServer::start_async().await;
        healthy.mock(|when, then| {
            when.method(GET).path("/models");
            then.status(200).json_body(json!({ "data": [] }));
        });

        let failing = MockServer::start_async().await;
        failing.mock(|when, then| {
            when.method(GET).path("/models");
            then.status(401);
        });

        assert!(OpenAIModel::new(client(&healthy), "m").is_available().await);
        assert!(!OpenAIModel::new(client(&failing), "m").is_available().await);
    }

    #[tokio::test]
    async fn embedder_maps_empty_inputs_to_empty_vectors() {
        let server = MockServer::start_async().await;

        let embed_mock = server.mock(|when, then| {
            when.method(POST).path("/embeddings");
            then.status(200).json_body(json!({
                "object": "list",
                "model": "text-embedding-3-small",
                "data": [
                    { "object": "embedding", "index": 1, "embedding": [0.0, 1.0] },
                    { "object": "embedding", "index": 0, "embedding": [1.0, 0.0] }
                ],
                "usage": { "prompt_tokens": 4, "total_tokens": 4 }
            }));
        });

        let config = OpenAIConfig::new()
            .with_api_key("test_key")
            .with_api_base(server.base_url());
        let embedder = OpenAIEmbedder::with_config(config, "text-embedding-3-small");

        let texts = vec!["Acme".to_string(), "  ".to_string(), "Q3".to_string()];
        let vectors = embedder.embed_batch(&texts).await.unwrap();

        assert_eq!(vectors, vec![vec![1.0, 0.0], Vec::new(), vec![0.0, 1.0]]);
        assert_eq!(embedder.dimension(), 1536);
        embed_mock.assert_calls(1);
    }
}
