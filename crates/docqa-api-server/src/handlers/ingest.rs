use crate::database::EmbeddingProviderKind;
use crate::ingest::PdfSource;
use crate::state::AppState;
use crate::utils::error::ApiError;
use axum::{
    extract::{Multipart, Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestAccepted {
    pub user_document_id: Uuid,
    pub status: String,
}

struct UploadForm {
    document_id: Option<Uuid>,
    title: Option<String>,
    owner: Option<String>,
    embedding_provider: Option<String>,
    file: Option<(String, Vec<u8>)>,
    blob_path: Option<String>,
}

async fn read_form(mut multipart: Multipart) -> Result<UploadForm, ApiError> {
    let mut form = UploadForm {
        document_id: None,
        title: None,
        owner: None,
        embedding_provider: None,
        file: None,
        blob_path: None,
    };

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::ValidationFailed(format!("failed to read form field: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "document_id" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::ValidationFailed(format!("bad document_id: {}", e)))?;
                let id = Uuid::parse_str(text.trim()).map_err(|_| {
                    ApiError::ValidationFailed("document_id must be a UUID".to_string())
                })?;
                form.document_id = Some(id);
            }
            "title" => {
                form.title = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| ApiError::ValidationFailed(format!("bad title: {}", e)))?,
                );
            }
            "owner" => {
                form.owner = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| ApiError::ValidationFailed(format!("bad owner: {}", e)))?,
                );
            }
            "embedding_provider" => {
                form.embedding_provider = Some(field.text().await.map_err(|e| {
                    ApiError::ValidationFailed(format!("bad embedding_provider: {}", e))
                })?);
            }
            "blob_path" => {
                form.blob_path = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| ApiError::ValidationFailed(format!("bad blob_path: {}", e)))?,
                );
            }
            "file" => {
                let filename = field
                    .file_name()
                    .unwrap_or("upload.pdf")
                    .to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::ValidationFailed(format!("failed to read file: {}", e)))?
                    .to_vec();
                form.file = Some((filename, bytes));
            }
            _ => {}
        }
    }

    Ok(form)
}

fn pdf_source(form: &mut UploadForm, max_bytes: usize) -> Result<(String, PdfSource), ApiError> {
    if let Some((filename, bytes)) = form.file.take() {
        if bytes.len() > max_bytes {
            return Err(ApiError::ValidationFailed(format!(
                "file is {} bytes, max {}",
                bytes.len(),
                max_bytes
            )));
        }
        if !filename.to_lowercase().ends_with(".pdf") {
            return Err(ApiError::ValidationFailed(
                "only PDF uploads are supported".to_string(),
            ));
        }
        return Ok((filename, PdfSource::Bytes(bytes)));
    }
    if let Some(path) = form.blob_path.take() {
        let filename = path.rsplit('/').next().unwrap_or("blob.pdf").to_string();
        return Ok((filename, PdfSource::BlobPath(path)));
    }

    Err(ApiError::ValidationFailed(
        "either a file or a blob_path is required".to_string(),
    ))
}

/// Replace a document's chunks under the same id ("retraining"). Accepts
/// immediately; progress is polled via the processing-status endpoint.
/// POST /api/retrain-document
pub async fn retrain_handler(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<(StatusCode, Json<IngestAccepted>), ApiError> {
    let mut form = read_form(multipart).await?;

    let document_id = form.document_id.ok_or_else(|| {
        ApiError::ValidationFailed("document_id is required".to_string())
    })?;

    // Inactive documents keep their chunks and may be retrained, so this
    // resolves through the catalog rather than the registry.
    state
        .repository
        .get_document_by_id(document_id)
        .await
        .map_err(|e| ApiError::Internal(format!("document lookup failed: {}", e)))?
        .ok_or_else(|| ApiError::NotFound(format!("unknown document id {}", document_id)))?;

    let (filename, source) = pdf_source(&mut form, state.pipeline.max_upload_bytes())?;

    let user_document_id = state
        .repository
        .create_user_document(&filename, Some(document_id))
        .await
        .map_err(|e| ApiError::Internal(format!("failed to create status record: {}", e)))?;

    info!(
        "Accepted retrain of document {} as {}",
        document_id, user_document_id
    );
    state
        .pipeline
        .spawn_retrain(user_document_id, document_id, source);

    Ok((
        StatusCode::ACCEPTED,
        Json(IngestAccepted {
            user_document_id,
            status: "processing".to_string(),
        }),
    ))
}

/// Fresh ingest: creates a new document under the named owner.
/// POST /api/upload-document
pub async fn upload_handler(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<(StatusCode, Json<IngestAccepted>), ApiError> {
    let mut form = read_form(multipart).await?;

    let title = form
        .title
        .clone()
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| ApiError::ValidationFailed("title is required".to_string()))?;
    let owner_slug = form
        .owner
        .clone()
        .ok_or_else(|| ApiError::ValidationFailed("owner is required".to_string()))?;

    let owner = state
        .repository
        .get_owner_by_slug(&owner_slug)
        .await
        .map_err(|e| ApiError::Internal(format!("owner lookup failed: {}", e)))?
        .ok_or_else(|| ApiError::NotFound(format!("unknown owner '{}'", owner_slug)))?;

    let provider = match form.embedding_provider.as_deref() {
        Some(raw) => EmbeddingProviderKind::parse(raw)
            .map_err(|e| ApiError::ValidationFailed(e.to_string()))?,
        None => EmbeddingProviderKind::Remote,
    };

    let (filename, source) = pdf_source(&mut form, state.pipeline.max_upload_bytes())?;

    let user_document_id = state
        .repository
        .create_user_document(&filename, None)
        .await
        .map_err(|e| ApiError::Internal(format!("failed to create status record: {}", e)))?;

    info!(
        "Accepted upload '{}' for owner {} as {}",
        title, owner.slug, user_document_id
    );
    state
        .pipeline
        .spawn_ingest(user_document_id, title, owner.id, provider, source);

    Ok((
        StatusCode::ACCEPTED,
        Json(IngestAccepted {
            user_document_id,
            status: "processing".to_string(),
        }),
    ))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingStatus {
    pub user_document_id: Uuid,
    pub document_id: Option<Uuid>,
    pub status: String,
    pub error_kind: Option<String>,
    pub log: Vec<String>,
}

/// Current ingestion phase plus the tail of its log.
/// GET /api/processing-status/{user_document_id}
pub async fn processing_status_handler(
    State(state): State<Arc<AppState>>,
    Path(user_document_id): Path<Uuid>,
) -> Result<Json<ProcessingStatus>, ApiError> {
    let record = state
        .repository
        .get_user_document(user_document_id)
        .await
        .map_err(|e| ApiError::Internal(format!("status lookup failed: {}", e)))?
        .ok_or_else(|| {
            ApiError::NotFound(format!("unknown processing record {}", user_document_id))
        })?;

    let mut log: Vec<String> = record
        .log
        .as_array()
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default();
    // Only the log tail travels back to the client.
    let tail_start = log.len().saturating_sub(20);
    let log = log.split_off(tail_start);

    Ok(Json(ProcessingStatus {
        user_document_id: record.id,
        document_id: record.document_id,
        status: record.status,
        error_kind: record.error_kind,
        log,
    }))
}
