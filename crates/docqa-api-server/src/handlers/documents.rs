use crate::database::Document;
use crate::models::chat::{validate_slugs, DocSelector};
use crate::state::AppState;
use crate::utils::error::ApiError;
use axum::{
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct DocumentsParams {
    pub doc: Option<String>,
    pub owner: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentInfo {
    pub id: Uuid,
    pub slug: String,
    pub owner_id: Uuid,
    pub title: String,
    pub subtitle: Option<String>,
    pub access_level: String,
    pub embedding_provider: String,
    pub intro_message: Option<String>,
    #[serde(rename = "abstract")]
    pub abstract_text: Option<String>,
    pub keywords: Option<serde_json::Value>,
    pub pages: Option<i32>,
}

impl DocumentInfo {
    fn from_document(document: &Document) -> Self {
        Self {
            id: document.id,
            slug: document.slug.clone(),
            owner_id: document.owner_id,
            title: document.title.clone(),
            subtitle: document.subtitle.clone(),
            access_level: document.access_level.as_str().to_string(),
            embedding_provider: document.embedding_provider.as_str().to_string(),
            intro_message: document.intro_message.clone(),
            abstract_text: document.abstract_text.clone(),
            keywords: document.keywords.clone(),
            pages: document.page_count,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DocumentsResponse {
    pub documents: Vec<DocumentInfo>,
    pub total: usize,
}

/// Registry lookup, returning only the requested subset. With no filter the
/// default landing document is returned alone.
/// GET /api/documents?doc=<slug>[+<slug>…] | ?owner=<slug>
pub async fn list_documents_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<DocumentsParams>,
) -> Result<Json<DocumentsResponse>, ApiError> {
    let snapshot = state.registry.snapshot()?;

    let documents: Vec<DocumentInfo> = if let Some(doc_param) = params.doc {
        let slugs = DocSelector::One(doc_param).slugs();
        validate_slugs(&slugs)?;

        let mut infos = Vec::with_capacity(slugs.len());
        for slug in &slugs {
            let document = snapshot
                .get_by_slug(slug)
                .ok_or_else(|| ApiError::NotFound(format!("unknown document '{}'", slug)))?;
            infos.push(DocumentInfo::from_document(&document));
        }
        infos
    } else if let Some(owner_slug) = params.owner {
        let owner = state
            .repository
            .get_owner_by_slug(&owner_slug)
            .await
            .map_err(|e| ApiError::Internal(format!("owner lookup failed: {}", e)))?
            .ok_or_else(|| ApiError::NotFound(format!("unknown owner '{}'", owner_slug)))?;

        snapshot
            .active_slugs
            .iter()
            .filter_map(|slug| snapshot.get_by_slug(slug))
            .filter(|document| document.owner_id == owner.id)
            .map(|document| DocumentInfo::from_document(&document))
            .collect()
    } else {
        let default_slug = &state.settings.server.default_document;
        snapshot
            .get_by_slug(default_slug)
            .map(|document| vec![DocumentInfo::from_document(&document)])
            .unwrap_or_default()
    };

    let total = documents.len();
    Ok(Json(DocumentsResponse { documents, total }))
}

#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    pub status: String,
}

/// Webhook target that schedules an immediate registry refresh.
/// POST /api/refresh-registry
pub async fn refresh_registry_handler(
    State(state): State<Arc<AppState>>,
) -> Json<RefreshResponse> {
    info!("Registry refresh requested");
    state.registry.invalidate();

    Json(RefreshResponse {
        status: "scheduled".to_string(),
    })
}
