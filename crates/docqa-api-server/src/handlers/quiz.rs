use crate::state::AppState;
use crate::utils::error::ApiError;
use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct QuizParams {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizResponse {
    pub document_id: Uuid,
    pub document_slug: String,
    pub questions: serde_json::Value,
    pub generated_at: DateTime<Utc>,
}

/// The document's auto-generated multiple-choice quiz. Regeneration is
/// throttled to once per week unless `?force=true`.
/// GET /api/quiz/{slug}
pub async fn quiz_handler(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
    Query(params): Query<QuizParams>,
) -> Result<Json<QuizResponse>, ApiError> {
    let document = state
        .registry
        .get_by_slug(&slug)?
        .ok_or_else(|| ApiError::NotFound(format!("unknown document '{}'", slug)))?;

    let quiz = state.quiz.get_or_generate(&document, params.force).await?;

    Ok(Json(QuizResponse {
        document_id: quiz.document_id,
        document_slug: document.slug.clone(),
        questions: quiz.questions,
        generated_at: quiz.generated_at,
    }))
}
