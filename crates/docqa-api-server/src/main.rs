use anyhow::Result;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};
use tracing::info;

mod auth;
mod chat;
mod config;
mod database;
mod embedding;
mod generation;
mod handlers;
mod ingest;
mod models;
mod quiz;
mod registry;
mod retrieval;
mod state;
mod utils;

use auth::IdentityAdapter;
use chat::ChatCoordinator;
use config::Settings;
use database::{ConversationLogger, DbPool, LoggerConfig, Repository};
use embedding::{EmbedderSet, EmbeddingCache, LocalEmbedder, RemoteEmbedder};
use generation::LlmClient;
use ingest::{BlobStore, IngestPipeline};
use quiz::QuizService;
use registry::DocumentRegistry;
use retrieval::RetrievalEngine;
use state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,docqa_api_server=debug".to_string()),
        )
        .with_target(true)
        .json()
        .init();

    info!("🚀 Starting document QA API server...");

    // Load configuration (panics on missing credentials)
    let settings = Settings::load()?;
    info!("✅ Configuration loaded");

    // Database pool + repository
    let db_pool = DbPool::new(&settings.database).await?;
    let repository = Arc::new(Repository::new(db_pool));
    info!("✅ Catalog store connection established");

    // Fire-and-forget conversation logger
    let conversation_logger =
        ConversationLogger::new(Arc::clone(&repository), LoggerConfig::default());

    // Embedding providers + query cache
    let remote_embedder = Arc::new(RemoteEmbedder::new(settings.embedding.remote.clone())?);
    let local_embedder = Arc::new(LocalEmbedder::new(settings.embedding.local.clone()));
    let embedding_cache = Arc::new(EmbeddingCache::new(settings.cache.clone()));
    embedding_cache.spawn_cleanup();
    let embedders = EmbedderSet::new(remote_embedder, local_embedder, Arc::clone(&embedding_cache));

    // Document registry. The server accepts connections right away and
    // answers 503 until the initial load lands; the refresh timer starts
    // after it.
    let registry = Arc::new(DocumentRegistry::new(
        Arc::clone(&repository),
        Duration::from_secs(settings.registry.refresh_interval_seconds),
    ));
    {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            while let Err(e) = registry.load().await {
                tracing::error!("Initial registry load failed, retrying in 5s: {}", e);
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            info!("✅ Document registry ready");
            registry.spawn_refresh_task();
        });
    }

    // Generation + retrieval
    let llm = Arc::new(LlmClient::new(settings.llm.clone())?);
    let retrieval_engine = Arc::new(RetrievalEngine::new(
        Arc::clone(&repository),
        settings.retrieval.clone(),
    ));

    let identity = Arc::new(IdentityAdapter::new(&settings.auth.jwt_secret));

    let coordinator = Arc::new(ChatCoordinator::new(
        Arc::clone(&registry),
        Arc::clone(&repository),
        embedders.clone(),
        retrieval_engine,
        Arc::clone(&llm),
        conversation_logger,
        identity,
        settings.retrieval.clone(),
        settings.prompts.grounding_system_prompt.clone(),
    ));

    // Ingestion pipeline + quiz service
    let blob_store = Arc::new(BlobStore::new(settings.storage.clone())?);
    let pipeline = Arc::new(IngestPipeline::new(
        Arc::clone(&repository),
        Arc::clone(&registry),
        embedders,
        Arc::clone(&llm),
        blob_store,
        settings.ingest.clone(),
    ));
    let quiz_service = Arc::new(QuizService::new(Arc::clone(&repository), llm));

    let max_body = settings.ingest.max_upload_bytes + 1024 * 1024;
    let addr = SocketAddr::from((
        settings.server.host.parse::<std::net::IpAddr>()?,
        settings.server.port,
    ));

    let app_state = Arc::new(AppState {
        settings,
        repository,
        registry,
        coordinator,
        pipeline,
        quiz: quiz_service,
    });

    let app = build_router(app_state, max_body);

    info!("🎯 Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn build_router(state: Arc<AppState>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/api/health", get(handlers::health::health_check))
        .route("/api/ready", get(handlers::health::readiness_check))
        .route("/api/chat", post(handlers::chat::chat_handler))
        .route("/api/chat/stream", post(handlers::chat::chat_stream_handler))
        .route("/api/documents", get(handlers::documents::list_documents_handler))
        .route(
            "/api/refresh-registry",
            post(handlers::documents::refresh_registry_handler),
        )
        .route("/api/retrain-document", post(handlers::ingest::retrain_handler))
        .route("/api/upload-document", post(handlers::ingest::upload_handler))
        .route(
            "/api/processing-status/{user_document_id}",
            get(handlers::ingest::processing_status_handler),
        )
        .route("/api/quiz/{slug}", get(handlers::quiz::quiz_handler))
        .route("/api/rate", post(handlers::rate::rate_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default().include_headers(false)),
        )
        .layer(DefaultBodyLimit::max(max_body_bytes))
}
