//! Configuration for the knowledge graph pipeline
//!
//! Loads configuration from config.yml file; environment variables take precedence.

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default constants (fallback if config.yml not found)
pub const DEFAULT_TOKEN_WINDOW: usize = 512;
pub const DEFAULT_TOKEN_OVERLAP: usize = 50;
pub const DEFAULT_CHAR_WINDOW: usize = 1000;
pub const DEFAULT_CHAR_OVERLAP: usize = 100;
pub const DEFAULT_MAX_CONCURRENCY: usize = 8;
pub const DEFAULT_TOP_K: usize = 10;
pub const DEFAULT_THRESHOLD: f32 = 0.3;
pub const DEFAULT_STORAGE_ROOT: &str = "data/knowledge";

/// Text-completion backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProvider {
    OpenAI,
    Ollama,
    /// No service: every LLM step takes its fallback path.
    Offline,
}

impl LlmProvider {
    pub fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "openai" | "gpt" => LlmProvider::OpenAI,
            "ollama" | "local" => LlmProvider::Ollama,
            _ => LlmProvider::Offline,
        }
    }
}

/// Embedding backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingProvider {
    OpenAI,
    Local,
}

impl EmbeddingProvider {
    pub fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "openai" => EmbeddingProvider::OpenAI,
            _ => EmbeddingProvider::Local,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub provider: LlmProvider,
    pub model: String,
    pub base_url: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct EmbeddingSettings {
    pub provider: EmbeddingProvider,
    pub model: String,
    pub local_dimension: usize,
    pub batch_size: usize,
}

#[derive(Debug, Clone)]
pub struct ChunkingSettings {
    pub use_tokenizer: bool,
    pub token_window: usize,
    pub token_overlap: usize,
    pub char_window: usize,
    pub char_overlap: usize,
}

impl Default for ChunkingSettings {
    fn default() -> Self {
        Self {
            use_tokenizer: true,
            token_window: DEFAULT_TOKEN_WINDOW,
            token_overlap: DEFAULT_TOKEN_OVERLAP,
            char_window: DEFAULT_CHAR_WINDOW,
            char_overlap: DEFAULT_CHAR_OVERLAP,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExtractionSettings {
    pub max_concurrency: usize,
    pub timeout: Duration,
    pub fallback_fact_chars: usize,
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            timeout: Duration::from_secs(60),
            fallback_fact_chars: 500,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClusteringSettings {
    /// Neighborhood radius in cosine distance.
    pub eps: f32,
    pub min_samples: usize,
}

impl Default for ClusteringSettings {
    fn default() -> Self {
        Self {
            eps: 0.3,
            min_samples: 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QuerySettings {
    pub top_k: usize,
    pub threshold: f32,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

/// YAML config structures
#[derive(Debug, Default, Deserialize)]
struct YamlConfig {
    llm: Option<YamlLlm>,
    embeddings: Option<YamlEmbeddings>,
    chunking: Option<YamlChunking>,
    extraction: Option<YamlExtraction>,
    clustering: Option<YamlClustering>,
    query: Option<YamlQuery>,
    storage: Option<YamlStorage>,
}

#[derive(Debug, Default, Deserialize)]
struct YamlLlm {
    provider: Option<String>,
    model: Option<String>,
    base_url: Option<String>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct YamlEmbeddings {
    provider: Option<String>,
    model: Option<String>,
    local_dimension: Option<usize>,
    batch_size: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct YamlChunking {
    use_tokenizer: Option<bool>,
    token_window: Option<usize>,
    token_overlap: Option<usize>,
    char_window: Option<usize>,
    char_overlap: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct YamlExtraction {
    max_concurrency: Option<usize>,
    timeout_secs: Option<u64>,
    fallback_fact_chars: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct YamlClustering {
    eps: Option<f32>,
    min_samples: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct YamlQuery {
    top_k: Option<usize>,
    threshold: Option<f32>,
}

#[derive(Debug, Default, Deserialize)]
struct YamlStorage {
    root: Option<String>,
}

/// Main configuration struct
#[derive(Debug, Clone)]
pub struct Config {
    pub llm: LlmSettings,
    pub embeddings: EmbeddingSettings,
    pub chunking: ChunkingSettings,
    pub extraction: ExtractionSettings,
    pub clustering: ClusteringSettings,
    pub query: QuerySettings,
    pub storage_root: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    /// Load configuration from config.yml or use defaults
    /// Environment variables take precedence over config.yml values
    pub fn new() -> Self {
        Self::load_from_file("config.yml")
            .or_else(|_| Self::load_from_file("../config.yml"))
            .unwrap_or_else(|_| Self::from_yaml(YamlConfig::default()))
    }

    /// Resolve a value: prefer env var if config value looks like ${VAR}
    fn resolve_env_string(value: Option<String>, env_key: &str) -> Option<String> {
        if let Some(ref v) = value {
            if v.starts_with("${") && v.ends_with('}') {
                let var_name = &v[2..v.len() - 1];
                if let Ok(env_val) = std::env::var(var_name) {
                    return Some(env_val);
                }
            }
        }
        if let Ok(env_val) = std::env::var(env_key) {
            if !env_val.trim().is_empty() {
                return Some(env_val);
            }
        }
        value.filter(|v| !(v.starts_with("${") && v.ends_with('}')))
    }

    /// Resolve a numeric value from env var, falling back to the config value
    fn resolve_env_parsed<T: std::str::FromStr>(value: Option<T>, env_key: &str) -> Option<T> {
        std::env::var(env_key)
            .ok()
            .and_then(|raw| raw.trim().parse::<T>().ok())
            .or(value)
    }

    /// Load .env file into environment variables using dotenvy
    fn load_dotenv() {
        if dotenvy::dotenv().is_err() {
            let _ = dotenvy::from_filename("../.env");
        }
    }

    /// Load configuration from a specific file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        Self::load_dotenv();

        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| format!("Failed to read config file: {}", e))?;

        Self::from_yaml_str(&content)
    }

    /// Parse configuration from YAML text
    pub fn from_yaml_str(content: &str) -> Result<Self, String> {
        let yaml: YamlConfig = serde_yaml::from_str(content)
            .map_err(|e| format!("Failed to parse config file: {}", e))?;
        Ok(Self::from_yaml(yaml))
    }

    fn from_yaml(yaml: YamlConfig) -> Self {
        let llm = yaml.llm.unwrap_or_default();
        let embeddings = yaml.embeddings.unwrap_or_default();
        let chunking = yaml.chunking.unwrap_or_default();
        let extraction = yaml.extraction.unwrap_or_default();
        let clustering = yaml.clustering.unwrap_or_default();
        let query = yaml.query.unwrap_or_default();
        let storage = yaml.storage.unwrap_or_default();

        let has_openai_key = std::env::var("OPENAI_API_KEY")
            .map(|k| !k.trim().is_empty())
            .unwrap_or(false);

        let llm_provider = Self::resolve_env_string(llm.provider, "SLIDEGRAPH_LLM_PROVIDER")
            .map(|p| LlmProvider::parse(&p))
            .unwrap_or(if has_openai_key {
                LlmProvider::OpenAI
            } else {
                LlmProvider::Offline
            });

        let embedding_provider =
            Self::resolve_env_string(embeddings.provider, "SLIDEGRAPH_EMBEDDING_PROVIDER")
                .map(|p| EmbeddingProvider::parse(&p))
                .unwrap_or(if has_openai_key {
                    EmbeddingProvider::OpenAI
                } else {
                    EmbeddingProvider::Local
                });

        let defaults_chunking = ChunkingSettings::default();
        let defaults_extraction = ExtractionSettings::default();
        let defaults_clustering = ClusteringSettings::default();
        let defaults_query = QuerySettings::default();

        Self {
            llm: LlmSettings {
                provider: llm_provider,
                model: Self::resolve_env_string(llm.model, "SLIDEGRAPH_LLM_MODEL")
                    .unwrap_or_else(|| "gpt-4o-mini".to_string()),
                base_url: Self::resolve_env_string(llm.base_url, "SLIDEGRAPH_LLM_BASE_URL"),
                temperature: llm.temperature.unwrap_or(0.1),
                max_tokens: llm.max_tokens.unwrap_or(2000),
                timeout: Duration::from_secs(
                    Self::resolve_env_parsed(llm.timeout_secs, "SLIDEGRAPH_LLM_TIMEOUT")
                        .unwrap_or(60),
                ),
            },
            embeddings: EmbeddingSettings {
                provider: embedding_provider,
                model: Self::resolve_env_string(embeddings.model, "SLIDEGRAPH_EMBEDDING_MODEL")
                    .unwrap_or_else(|| "text-embedding-3-small".to_string()),
                local_dimension: embeddings.local_dimension.unwrap_or(256),
                batch_size: embeddings.batch_size.unwrap_or(64).max(1),
            },
            chunking: ChunkingSettings {
                use_tokenizer: chunking
                    .use_tokenizer
                    .unwrap_or(defaults_chunking.use_tokenizer),
                token_window: chunking
                    .token_window
                    .unwrap_or(defaults_chunking.token_window),
                token_overlap: chunking
                    .token_overlap
                    .unwrap_or(defaults_chunking.token_overlap),
                char_window: chunking.char_window.unwrap_or(defaults_chunking.char_window),
                char_overlap: chunking
                    .char_overlap
                    .unwrap_or(defaults_chunking.char_overlap),
            },
            extraction: ExtractionSettings {
                max_concurrency: Self::resolve_env_parsed(
                    extraction.max_concurrency,
                    "SLIDEGRAPH_MAX_CONCURRENCY",
                )
                .unwrap_or(defaults_extraction.max_concurrency)
                .max(1),
                timeout: extraction
                    .timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(defaults_extraction.timeout),
                fallback_fact_chars: extraction
                    .fallback_fact_chars
                    .unwrap_or(defaults_extraction.fallback_fact_chars),
            },
            clustering: ClusteringSettings {
                eps: clustering.eps.unwrap_or(defaults_clustering.eps),
                min_samples: clustering
                    .min_samples
                    .unwrap_or(defaults_clustering.min_samples),
            },
            query: QuerySettings {
                top_k: query.top_k.unwrap_or(defaults_query.top_k),
                threshold: query.threshold.unwrap_or(defaults_query.threshold),
            },
            storage_root: PathBuf::from(
                Self::resolve_env_string(storage.root, "SLIDEGRAPH_STORAGE_ROOT")
                    .unwrap_or_else(|| DEFAULT_STORAGE_ROOT.to_string()),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    static ENV_LOCK: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    struct EnvGuard {
        key: String,
        original: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &str, value: &str) -> Self {
            let original = std::env::var(key).ok();
            std::env::set_var(key, value);
            Self {
                key: key.to_string(),
                original,
            }
        }

        fn remove(key: &str) -> Self {
            let original = std::env::var(key).ok();
            std::env::remove_var(key);
            Self {
                key: key.to_string(),
                original,
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.original {
                Some(value) => std::env::set_var(&self.key, value),
                None => std::env::remove_var(&self.key),
            }
        }
    }

    #[test]
    fn defaults_without_yaml_sections() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _key = EnvGuard::remove("OPENAI_API_KEY");
        let _provider = EnvGuard::remove("SLIDEGRAPH_LLM_PROVIDER");
        let _embed = EnvGuard::remove("SLIDEGRAPH_EMBEDDING_PROVIDER");

        let config = Config::from_yaml_str("{}").unwrap();

        assert_eq!(config.llm.provider, LlmProvider::Offline);
        assert_eq!(config.embeddings.provider, EmbeddingProvider::Local);
        assert_eq!(config.chunking.token_window, 512);
        assert_eq!(config.chunking.token_overlap, 50);
        assert_eq!(config.chunking.char_window, 1000);
        assert_eq!(config.chunking.char_overlap, 100);
        assert_eq!(config.extraction.max_concurrency, DEFAULT_MAX_CONCURRENCY);
        assert!((config.clustering.eps - 0.3).abs() < f32::EPSILON);
        assert_eq!(config.clustering.min_samples, 2);
        assert_eq!(config.query.top_k, 10);
    }

    #[test]
    fn yaml_values_are_applied() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _concurrency = EnvGuard::remove("SLIDEGRAPH_MAX_CONCURRENCY");
        let _root = EnvGuard::remove("SLIDEGRAPH_STORAGE_ROOT");

        let yaml = r#"
llm:
  provider: ollama
  model: llama3.1:8b
  timeout_secs: 5
chunking:
  token_window: 128
  token_overlap: 16
extraction:
  max_concurrency: 3
clustering:
  eps: 0.25
query:
  top_k: 4
  threshold: 0.5
storage:
  root: /tmp/graphs
"#;
        let config = Config::from_yaml_str(yaml).unwrap();

        assert_eq!(config.llm.provider, LlmProvider::Ollama);
        assert_eq!(config.llm.model, "llama3.1:8b");
        assert_eq!(config.llm.timeout, Duration::from_secs(5));
        assert_eq!(config.chunking.token_window, 128);
        assert_eq!(config.extraction.max_concurrency, 3);
        assert!((config.clustering.eps - 0.25).abs() < f32::EPSILON);
        assert_eq!(config.query.top_k, 4);
        assert_eq!(config.storage_root, PathBuf::from("/tmp/graphs"));
    }

    #[test]
    fn env_overrides_yaml() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _concurrency = EnvGuard::set("SLIDEGRAPH_MAX_CONCURRENCY", "2");
        let _provider = EnvGuard::set("SLIDEGRAPH_LLM_PROVIDER", "offline");

        let yaml = "llm:\n  provider: openai\nextraction:\n  max_concurrency: 16\n";
        let config = Config::from_yaml_str(yaml).unwrap();

        assert_eq!(config.extraction.max_concurrency, 2);
        assert_eq!(config.llm.provider, LlmProvider::Offline);
    }

    #[test]
    fn placeholder_values_resolve_from_env() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _root = EnvGuard::remove("SLIDEGRAPH_STORAGE_ROOT");
        let _custom = EnvGuard::set("MY_GRAPH_ROOT", "/srv/graphs");

        let yaml = "storage:\n  root: ${MY_GRAPH_ROOT}\n";
        let config = Config::from_yaml_str(yaml).unwrap();

        assert_eq!(config.storage_root, PathBuf::from("/srv/graphs"));
    }

    #[test]
    fn zero_concurrency_is_clamped() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _concurrency = EnvGuard::remove("SLIDEGRAPH_MAX_CONCURRENCY");

        let config = Config::from_yaml_str("extraction:\n  max_concurrency: 0\n").unwrap();
        assert_eq!(config.extraction.max_concurrency, 1);
    }

    #[test]
    fn invalid_yaml_is_reported() {
        let err = Config::from_yaml_str("llm: [unclosed").unwrap_err();
        assert!(err.contains("Failed to parse config file"));
    }

    #[test]
    fn provider_parsing() {
        assert_eq!(LlmProvider::parse("OpenAI"), LlmProvider::OpenAI);
        assert_eq!(LlmProvider::parse("ollama"), LlmProvider::Ollama);
        assert_eq!(LlmProvider::parse("none"), LlmProvider::Offline);
        assert_eq!(EmbeddingProvider::parse("openai"), EmbeddingProvider::OpenAI);
        assert_eq!(EmbeddingProvider::parse("hash"), EmbeddingProvider::Local);
    }
}
