pub mod conversation_log;
pub mod models;
pub mod pool;
pub mod repository;

pub use conversation_log::{ConversationLogger, LoggerConfig};
pub use models::*;
pub use pool::DbPool;
pub use repository::{Repository, SearchMode};
