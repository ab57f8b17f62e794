pub mod cache;
pub mod local;
pub mod remote;

pub use cache::EmbeddingCache;
pub use local::LocalEmbedder;
pub use remote::RemoteEmbedder;

use crate::database::EmbeddingProviderKind;
use crate::utils::error::ApiError;
use async_trait::async_trait;
use std::sync::Arc;

/// The one capability both embedding backends expose.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn kind(&self) -> EmbeddingProviderKind;
    fn dimension(&self) -> usize;
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ApiError>;
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ApiError>;
}

#[async_trait]
impl Embedder for RemoteEmbedder {
    fn kind(&self) -> EmbeddingProviderKind {
        RemoteEmbedder::kind(self)
    }

    fn dimension(&self) -> usize {
        RemoteEmbedder::dimension(self)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ApiError> {
        RemoteEmbedder::embed(self, text).await
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ApiError> {
        RemoteEmbedder::embed_batch(self, texts).await
    }
}

#[async_trait]
impl Embedder for LocalEmbedder {
    fn kind(&self) -> EmbeddingProviderKind {
        LocalEmbedder::kind(self)
    }

    fn dimension(&self) -> usize {
        LocalEmbedder::dimension(self)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ApiError> {
        LocalEmbedder::embed(self, text).await
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ApiError> {
        LocalEmbedder::embed_batch(self, texts).await
    }
}

/// The two interchangeable embedding backends plus the query cache, selected
/// per request by the document's `embedding_provider`.
#[derive(Clone)]
pub struct EmbedderSet {
    remote: Arc<RemoteEmbedder>,
    local: Arc<LocalEmbedder>,
    cache: Arc<EmbeddingCache>,
}

impl EmbedderSet {
    pub fn new(
        remote: Arc<RemoteEmbedder>,
        local: Arc<LocalEmbedder>,
        cache: Arc<EmbeddingCache>,
    ) -> Self {
        Self {
            remote,
            local,
            cache,
        }
    }

    pub fn provider(&self, kind: EmbeddingProviderKind) -> Arc<dyn Embedder> {
        match kind {
            EmbeddingProviderKind::Remote => Arc::clone(&self.remote) as Arc<dyn Embedder>,
            EmbeddingProviderKind::Local => Arc::clone(&self.local) as Arc<dyn Embedder>,
        }
    }

    pub fn dimension(&self, kind: EmbeddingProviderKind) -> usize {
        self.provider(kind).dimension()
    }

    /// Query-path embedding: cache-first with single-flight compute.
    pub async fn embed_query(
        &self,
        kind: EmbeddingProviderKind,
        text: &str,
    ) -> Result<Vec<f32>, ApiError> {
        let embedder = self.provider(kind);
        self.cache
            .get_or_compute(kind, text, || async move { embedder.embed(text).await })
            .await
    }

    /// Ingestion-path embedding: one provider call per batch, no cache.
    /// Chunk texts are effectively unique so caching them only displaces
    /// query entries.
    pub async fn embed_chunk_batch(
        &self,
        kind: EmbeddingProviderKind,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>, ApiError> {
        self.provider(kind).embed_batch(texts).await
    }
}
