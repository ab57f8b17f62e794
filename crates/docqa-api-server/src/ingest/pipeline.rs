use super::chunker::{AnchoredChunk, TextChunker};
use super::enrich;
use super::extract::{self, PDF_PROCESSOR_VERSION};
use super::storage::BlobStore;
use crate::config::IngestConfig;
use crate::database::{
    Document, EmbeddingProviderKind, IngestStatus, NewChunk, Repository,
};
use crate::embedding::EmbedderSet;
use crate::generation::LlmClient;
use crate::registry::DocumentRegistry;
use crate::utils::error::ApiError;
use chrono::Utc;
use dashmap::DashMap;
use futures::StreamExt;
use rand::distr::Alphanumeric;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Where the PDF comes from: an uploaded body or a blob-store path.
pub enum PdfSource {
    Bytes(Vec<u8>),
    BlobPath(String),
}

enum StoreTarget {
    Fresh {
        title: String,
        owner_id: Uuid,
        provider: EmbeddingProviderKind,
    },
    Retrain {
        document: Box<Document>,
    },
}

struct IngestFailure {
    kind: &'static str,
    error: ApiError,
}

impl IngestFailure {
    fn new(kind: &'static str, error: ApiError) -> Self {
        Self { kind, error }
    }
}

/// PDF → text → chunks → embeddings → abstract/keywords → transactional
/// store, with the phase persisted on the user-documents record throughout.
/// Ingestions of different documents run in parallel; a per-document lock
/// serializes the embedding-through-store phases so the same id is never
/// retrained concurrently.
pub struct IngestPipeline {
    repository: Arc<Repository>,
    registry: Arc<DocumentRegistry>,
    embedders: EmbedderSet,
    llm: Arc<LlmClient>,
    storage: Arc<BlobStore>,
    config: IngestConfig,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl IngestPipeline {
    pub fn new(
        repository: Arc<Repository>,
        registry: Arc<DocumentRegistry>,
        embedders: EmbedderSet,
        llm: Arc<LlmClient>,
        storage: Arc<BlobStore>,
        config: IngestConfig,
    ) -> Self {
        Self {
            repository,
            registry,
            embedders,
            llm,
            storage,
            config,
            locks: DashMap::new(),
        }
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.config.max_upload_bytes
    }

    /// Kick off a retrain in the background; the handler replies immediately
    /// with `processing` and the caller polls the status endpoint.
    pub fn spawn_retrain(self: &Arc<Self>, user_doc_id: Uuid, document_id: Uuid, source: PdfSource) {
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            pipeline.run_retrain(user_doc_id, document_id, source).await;
        });
    }

    pub fn spawn_ingest(
        self: &Arc<Self>,
        user_doc_id: Uuid,
        title: String,
        owner_id: Uuid,
        provider: EmbeddingProviderKind,
        source: PdfSource,
    ) {
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            pipeline
                .run_ingest(user_doc_id, title, owner_id, provider, source)
                .await;
        });
    }

    async fn run_retrain(&self, user_doc_id: Uuid, document_id: Uuid, source: PdfSource) {
        let document = match self.repository.get_document_by_id(document_id).await {
            Ok(Some(document)) => document,
            Ok(None) => {
                self.mark_error(user_doc_id, "DocumentNotFound", "unknown document id")
                    .await;
                return;
            }
            Err(e) => {
                self.mark_error(user_doc_id, "CatalogUnavailable", &e.to_string())
                    .await;
                return;
            }
        };

        let target = StoreTarget::Retrain {
            document: Box::new(document),
        };
        match self.process(user_doc_id, document_id, source, target).await {
            Ok(chunk_count) => {
                info!(
                    "Retrain of document {} completed ({} chunks)",
                    document_id, chunk_count
                );
            }
            Err(failure) => {
                error!(
                    "Retrain of document {} failed ({}): {}",
                    document_id, failure.kind, failure.error
                );
                self.mark_error(user_doc_id, failure.kind, &failure.error.to_string())
                    .await;
            }
        }
    }

    async fn run_ingest(
        &self,
        user_doc_id: Uuid,
        title: String,
        owner_id: Uuid,
        provider: EmbeddingProviderKind,
        source: PdfSource,
    ) {
        let document_id = Uuid::new_v4();
        let target = StoreTarget::Fresh {
            title,
            owner_id,
            provider,
        };
        match self.process(user_doc_id, document_id, source, target).await {
            Ok(chunk_count) => {
                info!(
                    "Ingested new document {} ({} chunks)",
                    document_id, chunk_count
                );
            }
            Err(failure) => {
                error!(
                    "Ingest {} failed ({}): {}",
                    user_doc_id, failure.kind, failure.error
                );
                self.mark_error(user_doc_id, failure.kind, &failure.error.to_string())
                    .await;
            }
        }
    }

    async fn process(
        &self,
        user_doc_id: Uuid,
        document_id: Uuid,
        source: PdfSource,
        target: StoreTarget,
    ) -> Result<usize, IngestFailure> {
        let provider = match &target {
            StoreTarget::Fresh { provider, .. } => *provider,
            StoreTarget::Retrain { document } => document.embedding_provider,
        };

        // Phase 1+2: download and page-anchored extraction, hard-capped.
        self.set_status(user_doc_id, IngestStatus::Extracting, "extracting text")
            .await;

        let bytes = match source {
            PdfSource::Bytes(bytes) => bytes,
            PdfSource::BlobPath(path) => self
                .storage
                .download(&path)
                .await
                .map_err(|e| IngestFailure::new("BlobDownloadFailed", e))?,
        };
        if bytes.len() > self.config.max_upload_bytes {
            return Err(IngestFailure::new(
                "FileTooLarge",
                ApiError::ValidationFailed(format!(
                    "PDF is {} bytes, max {}",
                    bytes.len(),
                    self.config.max_upload_bytes
                )),
            ));
        }

        let extraction = tokio::task::spawn_blocking(move || extract::extract_pdf(&bytes));
        let extracted = tokio::time::timeout(
            Duration::from_secs(self.config.extract_timeout_seconds),
            extraction,
        )
        .await
        .map_err(|_| {
            IngestFailure::new(
                "TimeoutDuringExtraction",
                ApiError::UpstreamTimeout("PDF text extraction exceeded its budget".to_string()),
            )
        })?
        .map_err(|e| IngestFailure::new("ExtractionFailed", ApiError::Internal(e.to_string())))?
        .map_err(|e| {
            IngestFailure::new("ExtractionFailed", ApiError::ValidationFailed(e.to_string()))
        })?;

        // Phase 3: chunking with page anchors.
        self.set_status(user_doc_id, IngestStatus::Chunking, "chunking text")
            .await;
        let chunker = TextChunker::new(self.config.chunk_tokens, self.config.chunk_overlap_tokens);
        let chunks = chunker
            .chunk(&extracted.text)
            .map_err(|e| IngestFailure::new("ChunkingFailed", ApiError::Internal(e.to_string())))?;
        if chunks.is_empty() {
            return Err(IngestFailure::new(
                "EmptyDocument",
                ApiError::ValidationFailed("document produced no chunks".to_string()),
            ));
        }

        // Phases 4-6 hold the per-document writer lock.
        let lock = self
            .locks
            .entry(document_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock_owned().await;

        // Phase 4: batched embeddings.
        self.set_status(
            user_doc_id,
            IngestStatus::Embedding,
            &format!("embedding {} chunks", chunks.len()),
        )
        .await;
        let embeddings = self
            .embed_all(provider, &chunks)
            .await
            .map_err(|e| IngestFailure::new("EmbeddingFailed", e))?;

        // Phase 5: abstract + keyword synthesis (best effort).
        self.set_status(user_doc_id, IngestStatus::Summarizing, "synthesizing summary")
            .await;
        let enrichment =
            enrich::synthesize(&self.llm, self.llm.default_model(), &chunks, &self.config).await;

        // Phase 6: transactional store.
        let new_chunks = build_chunk_records(&chunks, embeddings);
        let chunk_count = new_chunks.len();

        match target {
            StoreTarget::Fresh {
                title, owner_id, ..
            } => {
                let slug = generate_slug(&title);
                self.repository
                    .insert_document(
                        document_id,
                        &slug,
                        owner_id,
                        &title,
                        provider,
                        PDF_PROCESSOR_VERSION,
                    )
                    .await
                    .map_err(|e| {
                        IngestFailure::new("StoreFailed", ApiError::Internal(e.to_string()))
                    })?;
                self.repository
                    .store_chunks(document_id, provider, &new_chunks)
                    .await
                    .map_err(|e| {
                        IngestFailure::new("StoreFailed", ApiError::Internal(e.to_string()))
                    })?;
                self.repository
                    .attach_user_document(user_doc_id, document_id)
                    .await
                    .map_err(|e| {
                        IngestFailure::new("StoreFailed", ApiError::Internal(e.to_string()))
                    })?;
            }
            StoreTarget::Retrain { document } => {
                // Same id, replaced chunk set; prior chunks survive any
                // failure because the replacement is one transaction.
                self.repository
                    .replace_chunks(document.id, provider, &new_chunks)
                    .await
                    .map_err(|e| {
                        IngestFailure::new("StoreFailed", ApiError::Internal(e.to_string()))
                    })?;
            }
        }

        self.repository
            .update_document_enrichment(
                document_id,
                enrichment.abstract_text.as_deref(),
                enrichment.keywords.as_ref(),
                extracted.page_count as i32,
                PDF_PROCESSOR_VERSION,
            )
            .await
            .map_err(|e| IngestFailure::new("StoreFailed", ApiError::Internal(e.to_string())))?;

        self.set_status(
            user_doc_id,
            IngestStatus::Ready,
            &format!("ready ({} chunks)", chunk_count),
        )
        .await;
        self.registry.invalidate();

        Ok(chunk_count)
    }

    /// Embed every chunk in provider batches, with 1-2 batches in flight.
    /// Order is preserved.
    async fn embed_all(
        &self,
        provider: EmbeddingProviderKind,
        chunks: &[AnchoredChunk],
    ) -> Result<Vec<Vec<f32>>, ApiError> {
        let batch_size = self.config.embed_batch_size.max(1);
        let batches: Vec<Vec<String>> = chunks
            .chunks(batch_size)
            .map(|batch| batch.iter().map(|c| c.content.clone()).collect())
            .collect();

        let embedders = self.embedders.clone();
        let mut stream = futures::stream::iter(batches)
            .map(|batch| {
                let embedders = embedders.clone();
                async move { embedders.embed_chunk_batch(provider, &batch).await }
            })
            .buffered(self.config.embed_batch_parallelism.clamp(1, 2));

        let mut embeddings = Vec::with_capacity(chunks.len());
        while let Some(result) = stream.next().await {
            embeddings.extend(result?);
        }

        Ok(embeddings)
    }

    async fn set_status(&self, user_doc_id: Uuid, status: IngestStatus, message: &str) {
        if let Err(e) = self
            .repository
            .update_user_document_status(user_doc_id, status, None, message)
            .await
        {
            warn!(
                "Failed to persist ingest status {:?} for {}: {}",
                status, user_doc_id, e
            );
        }
    }

    async fn mark_error(&self, user_doc_id: Uuid, kind: &str, reason: &str) {
        if let Err(e) = self
            .repository
            .update_user_document_status(user_doc_id, IngestStatus::Error, Some(kind), reason)
            .await
        {
            warn!("Failed to persist ingest error for {}: {}", user_doc_id, e);
        }
    }
}

fn build_chunk_records(chunks: &[AnchoredChunk], embeddings: Vec<Vec<f32>>) -> Vec<NewChunk> {
    let extracted_at = Utc::now();

    chunks
        .iter()
        .zip(embeddings)
        .map(|(chunk, embedding)| NewChunk {
            index: chunk.index as i32,
            content: chunk.content.clone(),
            page_number: Some(chunk.page_number),
            embedding,
            metadata: serde_json::json!({
                "page_number": chunk.page_number,
                "pdf_processor": PDF_PROCESSOR_VERSION,
                "extracted_at": extracted_at,
            }),
        })
        .collect()
}

/// Slug for a fresh document: sanitized title plus a short random suffix so
/// title collisions never violate slug uniqueness.
fn generate_slug(title: &str) -> String {
    let base: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let base: String = base
        .split('-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    let base = if base.len() > 40 { &base[..40] } else { &base };
    let base = base.trim_end_matches('-');

    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect::<String>()
        .to_lowercase();

    if base.is_empty() {
        format!("document-{}", suffix)
    } else {
        format!("{}-{}", base, suffix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugs_are_sanitized_and_suffixed() {
        let slug = generate_slug("Kidney Donor Handbook (2024)!");
        assert!(slug.starts_with("kidney-donor-handbook-2024-"));
        let suffix = slug.rsplit('-').next().unwrap();
        assert_eq!(suffix.len(), 6);
        assert!(slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
    }

    #[test]
    fn empty_titles_still_get_a_slug() {
        let slug = generate_slug("!!!");
        assert!(slug.starts_with("document-"));
    }

    #[test]
    fn chunk_records_keep_dense_indices_and_metadata() {
        let chunks = vec![
            AnchoredChunk {
                index: 0,
                content: "first".to_string(),
                page_number: 1,
            },
            AnchoredChunk {
                index: 1,
                content: "second".to_string(),
                page_number: 3,
            },
        ];
        let records = build_chunk_records(&chunks, vec![vec![0.1; 4], vec![0.2; 4]]);

        assert_eq!(records.len(), 2);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.index, i as i32);
            assert_eq!(record.metadata["pdf_processor"], PDF_PROCESSOR_VERSION);
            assert_eq!(
                record.metadata["page_number"],
                serde_json::json!(record.page_number.unwrap())
            );
        }
        assert_eq!(records[1].page_number, Some(3));
    }
}
