use crate::models::chat::{ChatRequest, ChatResponse};
use crate::state::AppState;
use crate::utils::error::ApiError;
use axum::{
    extract::State,
    http::{header, HeaderMap},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::Stream;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::info;

/// Buffered RAG reply.
/// POST /api/chat
pub async fn chat_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    info!(
        session_id = %request.session_id,
        docs = ?request.doc.slugs(),
        "chat request"
    );

    let prepared = state.coordinator.prepare(&headers, &request).await?;
    let response = state.coordinator.answer(prepared).await?;

    Ok(Json(response))
}

/// Streaming RAG reply over SSE: a `data: {delta}` frame per token group, a
/// final metadata frame, then `data: [DONE]`.
/// POST /api/chat/stream
pub async fn chat_stream_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Result<
    (
        [(header::HeaderName, &'static str); 1],
        Sse<impl Stream<Item = Result<Event, Infallible>>>,
    ),
    ApiError,
> {
    info!(
        session_id = %request.session_id,
        docs = ?request.doc.slugs(),
        "chat stream request"
    );

    // All resolution errors surface as plain HTTP before the stream opens.
    let prepared = state.coordinator.prepare(&headers, &request).await?;
    let stream = Arc::clone(&state.coordinator).stream_events(prepared);

    Ok((
        [(header::CACHE_CONTROL, "no-cache")],
        Sse::new(stream).keep_alive(KeepAlive::default()),
    ))
}
