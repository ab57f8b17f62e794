use crate::generation::ModelSource;
use crate::retrieval::{RetrievedChunk, SimilaritySummary};
use crate::utils::error::ApiError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const MAX_SLUGS_PER_REQUEST: usize = 5;

// ===== request models =====

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    pub doc: DocSelector,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub history: Vec<HistoryMessage>,
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(rename = "embeddingType", default)]
    pub embedding_type: Option<String>,
    #[serde(default)]
    pub passcode: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: String,
    pub content: String,
}

/// The `doc` field accepts a single slug, a `+`-joined list (the URL grammar,
/// where `+` decodes to space), or a JSON array of slugs.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DocSelector {
    One(String),
    Many(Vec<String>),
}

impl DocSelector {
    pub fn slugs(&self) -> Vec<String> {
        let raw: Vec<&str> = match self {
            DocSelector::One(s) => vec![s.as_str()],
            DocSelector::Many(list) => list.iter().map(String::as_str).collect(),
        };

        let mut slugs = Vec::new();
        for entry in raw {
            for slug in entry.split(['+', ' ']) {
                let slug = slug.trim();
                if !slug.is_empty() && !slugs.iter().any(|s| s == slug) {
                    slugs.push(slug.to_string());
                }
            }
        }
        slugs
    }
}

/// Shared request-shape validation for the chat and document-lookup paths.
pub fn validate_slugs(slugs: &[String]) -> Result<(), ApiError> {
    if slugs.is_empty() {
        return Err(ApiError::ValidationFailed(
            "at least one document slug is required".to_string(),
        ));
    }
    if slugs.len() > MAX_SLUGS_PER_REQUEST {
        return Err(ApiError::ValidationFailed(format!(
            "too many document slugs: {} (max {})",
            slugs.len(),
            MAX_SLUGS_PER_REQUEST
        )));
    }
    Ok(())
}

pub fn validate_session_id(session_id: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(session_id)
        .map_err(|_| ApiError::ValidationFailed("sessionId must be a valid UUID".to_string()))
}

// ===== response models =====

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Citation {
    pub document_id: Uuid,
    pub document_slug: String,
    pub chunk_index: i32,
    pub page_number: Option<i32>,
    pub similarity: Option<f32>,
    pub excerpt: String,
}

impl Citation {
    pub fn from_chunk(chunk: &RetrievedChunk) -> Self {
        let excerpt: String = chunk.content.chars().take(150).collect();
        Self {
            document_id: chunk.document_id,
            document_slug: chunk.document_slug.clone(),
            chunk_index: chunk.chunk_index,
            page_number: chunk.page_number,
            similarity: chunk.similarity,
            excerpt,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMetadata {
    pub retrieval_ms: u64,
    pub generation_ms: u64,
    pub total_ms: u64,
    pub document_ids: Vec<Uuid>,
    pub document_slugs: Vec<String>,
    pub model: String,
    pub model_source: ModelSource,
    pub override_reason: String,
    pub chunks_retrieved: usize,
    pub similarity: SimilaritySummary,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub response: String,
    pub citations: Vec<Citation>,
    pub model: String,
    pub metadata: ChatMetadata,
}

/// One SSE delta frame payload.
#[derive(Debug, Serialize)]
pub struct DeltaFrame<'a> {
    pub delta: &'a str,
}

/// Terminating SSE frame payload, sent before `[DONE]`.
#[derive(Debug, Serialize)]
pub struct FinalFrame {
    pub done: bool,
    pub metadata: ChatMetadata,
    pub citations: Vec<Citation>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_slug_parses() {
        let sel = DocSelector::One("smh".to_string());
        assert_eq!(sel.slugs(), vec!["smh"]);
    }

    #[test]
    fn plus_joined_slugs_split() {
        let sel = DocSelector::One("smh+uhn".to_string());
        assert_eq!(sel.slugs(), vec!["smh", "uhn"]);
    }

    #[test]
    fn url_decoded_spaces_split_too() {
        let sel = DocSelector::One("smh uhn".to_string());
        assert_eq!(sel.slugs(), vec!["smh", "uhn"]);
    }

    #[test]
    fn array_form_parses_and_dedups() {
        let sel = DocSelector::Many(vec![
            "smh".to_string(),
            "uhn".to_string(),
            "smh".to_string(),
        ]);
        assert_eq!(sel.slugs(), vec!["smh", "uhn"]);
    }

    #[test]
    fn six_slugs_fail_validation() {
        let sel = DocSelector::One("a+b+c+d+e+f".to_string());
        let err = validate_slugs(&sel.slugs()).unwrap_err();
        assert!(matches!(err, ApiError::ValidationFailed(_)));
    }

    #[test]
    fn five_slugs_pass_validation() {
        let sel = DocSelector::One("a+b+c+d+e".to_string());
        assert!(validate_slugs(&sel.slugs()).is_ok());
    }

    #[test]
    fn empty_selector_fails_validation() {
        let sel = DocSelector::One("  ".to_string());
        assert!(validate_slugs(&sel.slugs()).is_err());
    }

    #[test]
    fn session_id_must_be_uuid() {
        assert!(validate_session_id("not-a-uuid").is_err());
        assert!(validate_session_id("8f2e9a04-8a9f-4ec1-bb8c-5ac0a2f1b1de").is_ok());
    }
}
