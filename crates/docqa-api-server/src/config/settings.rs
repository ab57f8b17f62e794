use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub auth: AuthConfig,
    pub embedding: EmbeddingConfig,
    pub llm: LlmConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub prompts: PromptsConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Slug served by `GET /api/documents` when no filter is given.
    pub default_document: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_max_size: u32,
    pub pool_timeout_seconds: u64,
}

/// Blob store holding uploaded PDFs, addressed by path.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StorageConfig {
    pub base_url: String,
    pub service_key: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EmbeddingConfig {
    pub remote: RemoteEmbeddingConfig,
    pub local: LocalEmbeddingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RemoteEmbeddingConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub dimension: usize,
    pub timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LocalEmbeddingConfig {
    pub dimension: usize,
    /// Optional on-disk model cache; defaults to the fastembed default.
    pub model_cache_dir: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: String,
    pub default_model: String,
    pub max_tokens: usize,
    pub timeout_seconds: u64,
    /// Providers that only offer buffered completion set this to false; the
    /// client then adapts by emitting the full text as a single delta.
    #[serde(default = "default_stream_response")]
    pub stream_response: bool,
}

fn default_stream_response() -> bool {
    true
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RetrievalConfig {
    /// Per-document retrieval depth when neither document nor owner override.
    pub default_chunk_limit: usize,
    /// Hard cap per document.
    pub max_chunk_limit: usize,
    /// Hard cap on the merged multi-document result.
    pub max_aggregate_chunks: usize,
    /// Weight applied to the full-text rank in hybrid scoring.
    pub text_match_boost: f32,
    pub search_timeout_seconds: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_chunk_limit: 40,
            max_chunk_limit: 100,
            max_aggregate_chunks: 200,
            text_match_boost: 0.5,
            search_timeout_seconds: 15,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct IngestConfig {
    /// Chunk window in tokens (stored as the char window / 4).
    pub chunk_tokens: usize,
    pub chunk_overlap_tokens: usize,
    /// Max chunks per embedding provider call.
    pub embed_batch_size: usize,
    /// In-flight embedding batches.
    pub embed_batch_parallelism: usize,
    /// Hard cap on PDF text extraction.
    pub extract_timeout_seconds: u64,
    /// Chunks seeding abstract/keyword synthesis.
    pub summary_seed_chunks: usize,
    /// Char budget for the synthesis seed.
    pub summary_seed_chars: usize,
    pub max_upload_bytes: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            chunk_tokens: 500,
            chunk_overlap_tokens: 100,
            embed_batch_size: 50,
            embed_batch_parallelism: 2,
            extract_timeout_seconds: 30,
            summary_seed_chunks: 30,
            summary_seed_chars: 24_000,
            max_upload_bytes: 50 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RegistryConfig {
    pub refresh_interval_seconds: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            refresh_interval_seconds: 120,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CacheConfig {
    pub cleanup_interval_seconds: u64,
    pub idle_ttl_seconds: u64,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_seconds: 3600,
            idle_ttl_seconds: 3600,
            max_entries: 10_000,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PromptsConfig {
    pub grounding_system_prompt: String,
}

impl Default for PromptsConfig {
    fn default() -> Self {
        Self {
            grounding_system_prompt: crate::generation::GROUNDING_SYSTEM_PROMPT.to_string(),
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config::builder()
            .add_source(File::with_name("config/settings").required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        settings.assert_credentials();
        Ok(settings)
    }

    /// Required credentials are a startup invariant, not a runtime error.
    fn assert_credentials(&self) {
        assert!(
            !self.database.url.is_empty(),
            "database.url is required (APP__DATABASE__URL)"
        );
        assert!(
            !self.storage.base_url.is_empty() && !self.storage.service_key.is_empty(),
            "storage.base_url and storage.service_key are required"
        );
        assert!(
            !self.llm.api_key.is_empty(),
            "llm.api_key is required (APP__LLM__API_KEY)"
        );
        assert!(
            !self.embedding.remote.api_key.is_empty(),
            "embedding.remote.api_key is required"
        );
    }
}
