use std::sync::Arc;

use crate::chat::ChatCoordinator;
use crate::config::Settings;
use crate::database::Repository;
use crate::ingest::IngestPipeline;
use crate::quiz::QuizService;
use crate::registry::DocumentRegistry;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub settings: Settings,
    pub repository: Arc<Repository>,
    pub registry: Arc<DocumentRegistry>,
    pub coordinator: Arc<ChatCoordinator>,
    pub pipeline: Arc<IngestPipeline>,
    pub quiz: Arc<QuizService>,
}
