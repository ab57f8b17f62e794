use super::provider::ChatMessage;
use crate::database::{Document, Owner};
use crate::retrieval::RetrievedChunk;
use crate::utils::error::ApiError;
use serde::Serialize;
use std::fmt::Write;

pub const GROUNDING_SYSTEM_PROMPT: &str = "Answer only from the provided passages. Cite page \
     numbers inline using bracketed numeric markers. If the passages do not answer the \
     question, say so.";

/// Where the resolved model came from, echoed into response metadata and the
/// conversation log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelSource {
    Document,
    Owner,
    Request,
    Default,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolvedModel {
    pub model: String,
    pub source: ModelSource,
    pub reason: String,
}

/// Override resolution: any document's `forced_model` wins, then the owner's,
/// then the caller's request, then the configured default. Documents that
/// disagree about their forced model reject the request.
pub fn resolve_model(
    documents: &[&Document],
    owner: Option<&Owner>,
    requested: Option<&str>,
    default_model: &str,
) -> Result<ResolvedModel, ApiError> {
    let mut forced: Option<(&str, &str)> = None; // (model, document slug)

    for doc in documents {
        if let Some(model) = doc.forced_model.as_deref() {
            match forced {
                None => forced = Some((model, &doc.slug)),
                Some((existing, _)) if existing != model => {
                    return Err(ApiError::ConflictingModelOverride(format!(
                        "documents disagree on forced model: {} vs {}",
                        existing, model
                    )));
                }
                Some(_) => {}
            }
        }
    }

    if let Some((model, slug)) = forced {
        return Ok(ResolvedModel {
            model: model.to_string(),
            source: ModelSource::Document,
            reason: format!("forced by document '{}'", slug),
        });
    }

    if let Some(model) = owner.and_then(|o| o.forced_model.as_deref()) {
        let slug = owner.map(|o| o.slug.as_str()).unwrap_or_default();
        return Ok(ResolvedModel {
            model: model.to_string(),
            source: ModelSource::Owner,
            reason: format!("forced by owner '{}'", slug),
        });
    }

    if let Some(model) = requested.filter(|m| !m.trim().is_empty()) {
        return Ok(ResolvedModel {
            model: model.to_string(),
            source: ModelSource::Request,
            reason: "caller-requested model".to_string(),
        });
    }

    Ok(ResolvedModel {
        model: default_model.to_string(),
        source: ModelSource::Default,
        reason: "configured default model".to_string(),
    })
}

/// Assemble the grounded message list: system discipline, prior turns, then
/// the question followed by one delimited block per retrieved chunk in rank
/// order.
pub fn build_messages(
    system_prompt: &str,
    question: &str,
    chunks: &[RetrievedChunk],
    history: &[ChatMessage],
) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(ChatMessage::system(system_prompt));
    messages.extend(history.iter().cloned());

    let mut body = String::with_capacity(1024 + chunks.iter().map(|c| c.content.len()).sum::<usize>());
    body.push_str("Question: ");
    body.push_str(question);
    body.push_str("\n\nPassages:\n");

    for (rank, chunk) in chunks.iter().enumerate() {
        let _ = write!(
            body,
            "\n[{}] document: {} (page {})\n{}\n---\n",
            rank + 1,
            chunk.document_slug,
            chunk.page_number.unwrap_or(0),
            chunk.content.trim()
        );
    }

    if chunks.is_empty() {
        body.push_str("\n(no passages were retrieved)\n");
    }

    messages.push(ChatMessage::user(body));
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{AccessLevel, EmbeddingProviderKind};
    use chrono::Utc;
    use uuid::Uuid;

    fn doc(slug: &str, forced_model: Option<&str>) -> Document {
        Document {
            id: Uuid::new_v4(),
            slug: slug.to_string(),
            owner_id: Uuid::new_v4(),
            title: slug.to_string(),
            subtitle: None,
            access_level: AccessLevel::Public,
            embedding_provider: EmbeddingProviderKind::Remote,
            chunk_limit: None,
            forced_model: forced_model.map(String::from),
            intro_message: None,
            passcode: None,
            abstract_text: None,
            keywords: None,
            page_count: None,
            processor_version: None,
            active: true,
            updated_at: Utc::now(),
        }
    }

    fn owner(forced_model: Option<&str>) -> Owner {
        Owner {
            id: Uuid::new_v4(),
            slug: "ukidney".to_string(),
            name: "UKidney".to_string(),
            forced_model: forced_model.map(String::from),
            default_chunk_limit: None,
            cover_image: None,
        }
    }

    #[test]
    fn document_override_beats_caller_request() {
        let d = doc("smh", Some("model-g"));
        let resolved =
            resolve_model(&[&d], Some(&owner(None)), Some("model-a"), "fallback").unwrap();

        assert_eq!(resolved.model, "model-g");
        assert_eq!(resolved.source, ModelSource::Document);
        assert!(resolved.reason.contains("smh"));
    }

    #[test]
    fn owner_override_applies_when_documents_are_silent() {
        let d = doc("smh", None);
        let resolved =
            resolve_model(&[&d], Some(&owner(Some("model-o"))), Some("model-a"), "fb").unwrap();

        assert_eq!(resolved.model, "model-o");
        assert_eq!(resolved.source, ModelSource::Owner);
    }

    #[test]
    fn caller_request_wins_over_default() {
        let d = doc("smh", None);
        let resolved = resolve_model(&[&d], Some(&owner(None)), Some("model-a"), "fb").unwrap();
        assert_eq!(resolved.model, "model-a");
        assert_eq!(resolved.source, ModelSource::Request);
    }

    #[test]
    fn default_model_is_the_last_resort() {
        let d = doc("smh", None);
        let resolved = resolve_model(&[&d], None, None, "fallback").unwrap();
        assert_eq!(resolved.model, "fallback");
        assert_eq!(resolved.source, ModelSource::Default);
    }

    #[test]
    fn agreeing_document_overrides_are_fine() {
        let d1 = doc("smh", Some("model-g"));
        let d2 = doc("uhn", Some("model-g"));
        let resolved = resolve_model(&[&d1, &d2], None, None, "fb").unwrap();
        assert_eq!(resolved.model, "model-g");
    }

    #[test]
    fn disagreeing_document_overrides_are_rejected() {
        let d1 = doc("smh", Some("model-g"));
        let d2 = doc("uhn", Some("model-h"));
        let err = resolve_model(&[&d1, &d2], None, None, "fb").unwrap_err();
        assert!(matches!(err, ApiError::ConflictingModelOverride(_)));
    }

    #[test]
    fn blank_requested_model_falls_through() {
        let d = doc("smh", None);
        let resolved = resolve_model(&[&d], None, Some("   "), "fallback").unwrap();
        assert_eq!(resolved.model, "fallback");
    }

    #[test]
    fn messages_carry_chunks_in_rank_order() {
        let chunks = vec![
            RetrievedChunk {
                document_id: Uuid::new_v4(),
                document_slug: "smh".to_string(),
                chunk_index: 4,
                content: "First passage.".to_string(),
                page_number: Some(12),
                similarity: Some(0.9),
                score: 0.9,
            },
            RetrievedChunk {
                document_id: Uuid::new_v4(),
                document_slug: "uhn".to_string(),
                chunk_index: 2,
                content: "Second passage.".to_string(),
                page_number: None,
                similarity: None,
                score: 0.4,
            },
        ];

        let messages = build_messages(GROUNDING_SYSTEM_PROMPT, "What is GFR?", &chunks, &[]);

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "system");
        let body = &messages[1].content;
        assert!(body.contains("Question: What is GFR?"));
        let first = body.find("[1] document: smh (page 12)").unwrap();
        let second = body.find("[2] document: uhn (page 0)").unwrap();
        assert!(first < second);
    }

    #[test]
    fn history_precedes_the_grounded_turn() {
        let history = vec![
            ChatMessage::user("earlier question"),
            ChatMessage::assistant("earlier answer"),
        ];
        let messages = build_messages(GROUNDING_SYSTEM_PROMPT, "follow-up", &[], &history);

        assert_eq!(messages.len(), 4);
        assert_eq!(messages[1].content, "earlier question");
        assert_eq!(messages[2].content, "earlier answer");
        assert!(messages[3].content.contains("no passages were retrieved"));
    }
}
