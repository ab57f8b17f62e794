pub mod prompt;
pub mod provider;

pub use prompt::{build_messages, resolve_model, ModelSource, ResolvedModel, GROUNDING_SYSTEM_PROMPT};
pub use provider::{ChatMessage, DeltaStream, LlmClient};
