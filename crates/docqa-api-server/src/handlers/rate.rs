use crate::state::AppState;
use crate::utils::error::ApiError;
use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateRequest {
    pub conversation_id: Uuid,
    pub rating: String, // "up" | "down"
}

#[derive(Debug, Serialize)]
pub struct RateResponse {
    pub status: String,
}

/// Thumbs-up/down on a conversation. Fire-and-forget: the write happens off
/// the response path and failures are only logged.
/// POST /api/rate
pub async fn rate_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RateRequest>,
) -> Result<Json<RateResponse>, ApiError> {
    let rating: i16 = match request.rating.as_str() {
        "up" => 1,
        "down" => -1,
        other => {
            return Err(ApiError::ValidationFailed(format!(
                "rating must be 'up' or 'down', got '{}'",
                other
            )))
        }
    };

    let repository = Arc::clone(&state.repository);
    let conversation_id = request.conversation_id;
    tokio::spawn(async move {
        if let Err(e) = repository
            .set_conversation_rating(conversation_id, rating)
            .await
        {
            warn!("Failed to rate conversation {}: {}", conversation_id, e);
        }
    });

    Ok(Json(RateResponse {
        status: "ok".to_string(),
    }))
}
