use crate::config::LocalEmbeddingConfig;
use crate::database::EmbeddingProviderKind;
use crate::utils::error::ApiError;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use tracing::info;

/// Local 384-dim embedding backend (all-MiniLM-L6-v2 via fastembed).
/// The ONNX model is loaded lazily on first use and shared behind a mutex;
/// inference is pure CPU, runs on the blocking pool, and is never retried.
pub struct LocalEmbedder {
    config: LocalEmbeddingConfig,
    model: OnceCell<Arc<Mutex<TextEmbedding>>>,
}

impl LocalEmbedder {
    pub fn new(config: LocalEmbeddingConfig) -> Self {
        Self {
            config,
            model: OnceCell::new(),
        }
    }

    pub fn kind(&self) -> EmbeddingProviderKind {
        EmbeddingProviderKind::Local
    }

    pub fn dimension(&self) -> usize {
        self.config.dimension
    }

    async fn model(&self) -> Result<Arc<Mutex<TextEmbedding>>, ApiError> {
        let cache_dir = self.config.model_cache_dir.clone();

        self.model
            .get_or_try_init(|| async move {
                info!("Loading local embedding model (all-MiniLM-L6-v2)");
                let handle = tokio::task::spawn_blocking(move || {
                    let mut options = InitOptions::new(EmbeddingModel::AllMiniLML6V2)
                        .with_show_download_progress(false);
                    if let Some(dir) = cache_dir {
                        options = options.with_cache_dir(PathBuf::from(dir));
                    }
                    TextEmbedding::try_new(options)
                })
                .await
                .map_err(|e| ApiError::Internal(format!("model load task failed: {}", e)))?;

                let model = handle.map_err(|e| {
                    ApiError::Internal(format!("local embedding model init failed: {}", e))
                })?;

                Ok(Arc::new(Mutex::new(model)))
            })
            .await
            .cloned()
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, ApiError> {
        let mut batch = self.embed_batch(std::slice::from_ref(&text.to_string())).await?;
        batch
            .pop()
            .ok_or_else(|| ApiError::Internal("empty local embedding batch".to_string()))
    }

    /// Batch inference in one blocking call; result order matches input.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ApiError> {
        let model = self.model().await?;
        let inputs: Vec<String> = texts.to_vec();
        let expected = inputs.len();
        let dimension = self.config.dimension;

        let embeddings = tokio::task::spawn_blocking(move || {
            let mut guard = model
                .lock()
                .map_err(|_| "embedding model mutex poisoned".to_string())?;
            guard.embed(inputs, None).map_err(|e| e.to_string())
        })
        .await
        .map_err(|e| ApiError::Internal(format!("embedding task failed: {}", e)))?
        .map_err(ApiError::Internal)?;

        if embeddings.len() != expected {
            return Err(ApiError::Internal(format!(
                "local embedding count mismatch: expected {}, got {}",
                expected,
                embeddings.len()
            )));
        }
        for embedding in &embeddings {
            if embedding.len() != dimension {
                return Err(ApiError::Internal(format!(
                    "local embedding dimension mismatch: expected {}, got {}",
                    dimension,
                    embedding.len()
                )));
            }
        }

        Ok(embeddings)
    }
}
