use crate::database::{Document, QuizRecord, Repository};
use crate::generation::{ChatMessage, LlmClient};
use crate::utils::error::ApiError;
use crate::utils::json_repair;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{info, warn};

const REGEN_INTERVAL_DAYS: i64 = 7;
const QUIZ_SEED_CHUNKS: i64 = 20;
const QUIZ_SEED_CHARS: usize = 16_000;

// JSON mode: the system message must name JSON.
const QUIZ_SYSTEM_PROMPT: &str = "You write multiple-choice quizzes from document excerpts. \
     Reply with JSON only, shaped {\"questions\": [{\"question\": \"...\", \"options\": \
     [\"...\", \"...\", \"...\", \"...\", \"...\"], \"answer_index\": 0}]}. Write 5 to 10 \
     questions; every question has exactly five options, one correct, four plausible \
     distractors, and answer_index points at the correct option.";

/// Auto-generated multiple-choice quiz per document, regenerated at most
/// once per week unless forced.
pub struct QuizService {
    repository: Arc<Repository>,
    llm: Arc<LlmClient>,
}

impl QuizService {
    pub fn new(repository: Arc<Repository>, llm: Arc<LlmClient>) -> Self {
        Self { repository, llm }
    }

    pub async fn get_or_generate(
        &self,
        document: &Document,
        force: bool,
    ) -> Result<QuizRecord, ApiError> {
        let existing = self
            .repository
            .get_quiz(document.id)
            .await
            .map_err(|e| ApiError::Internal(format!("quiz lookup failed: {}", e)))?;

        if let Some(quiz) = &existing {
            if !needs_regeneration(quiz.generated_at, force, Utc::now()) {
                return Ok(quiz.clone());
            }
        }

        match self.generate(document).await {
            Ok(questions) => {
                self.repository
                    .upsert_quiz(document.id, &questions)
                    .await
                    .map_err(|e| ApiError::Internal(format!("quiz store failed: {}", e)))?;
                info!("Generated quiz for document {}", document.slug);
                Ok(QuizRecord {
                    document_id: document.id,
                    questions,
                    generated_at: Utc::now(),
                })
            }
            // A stale-but-valid quiz beats a failed regeneration.
            Err(e) => match existing {
                Some(quiz) => {
                    warn!(
                        "Quiz regeneration for {} failed, serving previous: {}",
                        document.slug, e
                    );
                    Ok(quiz)
                }
                None => Err(e),
            },
        }
    }

    async fn generate(&self, document: &Document) -> Result<serde_json::Value, ApiError> {
        let chunks = self
            .repository
            .get_leading_chunks(document.id, document.embedding_provider, QUIZ_SEED_CHUNKS)
            .await
            .map_err(|e| ApiError::Internal(format!("chunk fetch failed: {}", e)))?;

        if chunks.is_empty() {
            return Err(ApiError::NotFound(format!(
                "document '{}' has no indexed content",
                document.slug
            )));
        }

        let seed: String = chunks
            .join("\n\n")
            .chars()
            .take(QUIZ_SEED_CHARS)
            .collect();

        let reply = self
            .llm
            .complete(
                self.llm.default_model(),
                &[
                    ChatMessage::system(QUIZ_SYSTEM_PROMPT),
                    ChatMessage::user(seed),
                ],
            )
            .await?;

        validate_quiz(&reply).ok_or_else(|| {
            ApiError::ProviderRejected("quiz reply held no valid questions".to_string())
        })
    }
}

pub fn needs_regeneration(generated_at: DateTime<Utc>, force: bool, now: DateTime<Utc>) -> bool {
    force || now - generated_at > Duration::days(REGEN_INTERVAL_DAYS)
}

/// Repair and validate the model reply: keep only questions with exactly
/// five string options and an in-range answer index.
fn validate_quiz(reply: &str) -> Option<serde_json::Value> {
    let value = json_repair::parse_lenient(reply)?;
    let questions = value.get("questions")?.as_array()?;

    let valid: Vec<serde_json::Value> = questions
        .iter()
        .filter(|q| {
            let has_question = q
                .get("question")
                .and_then(|v| v.as_str())
                .map(|s| !s.trim().is_empty())
                .unwrap_or(false);
            let options_ok = q
                .get("options")
                .and_then(|v| v.as_array())
                .map(|opts| opts.len() == 5 && opts.iter().all(|o| o.is_string()))
                .unwrap_or(false);
            let answer_ok = q
                .get("answer_index")
                .and_then(|v| v.as_u64())
                .map(|i| i < 5)
                .unwrap_or(false);
            has_question && options_ok && answer_ok
        })
        .cloned()
        .collect();

    if valid.is_empty() {
        return None;
    }

    Some(serde_json::json!({ "questions": valid }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_quizzes_are_not_regenerated() {
        let now = Utc::now();
        assert!(!needs_regeneration(now - Duration::days(2), false, now));
    }

    #[test]
    fn week_old_quizzes_are_regenerated() {
        let now = Utc::now();
        assert!(needs_regeneration(now - Duration::days(8), false, now));
    }

    #[test]
    fn force_always_regenerates() {
        let now = Utc::now();
        assert!(needs_regeneration(now - Duration::hours(1), true, now));
    }

    #[test]
    fn valid_questions_survive_validation() {
        let reply = serde_json::json!({
            "questions": [{
                "question": "Which organ filters blood?",
                "options": ["Kidney", "Liver", "Heart", "Lung", "Spleen"],
                "answer_index": 0
            }]
        })
        .to_string();

        let quiz = validate_quiz(&reply).unwrap();
        assert_eq!(quiz["questions"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn malformed_questions_are_dropped() {
        let reply = serde_json::json!({
            "questions": [
                {
                    "question": "Too few options",
                    "options": ["a", "b"],
                    "answer_index": 0
                },
                {
                    "question": "Answer out of range",
                    "options": ["a", "b", "c", "d", "e"],
                    "answer_index": 9
                },
                {
                    "question": "Valid",
                    "options": ["a", "b", "c", "d", "e"],
                    "answer_index": 2
                }
            ]
        })
        .to_string();

        let quiz = validate_quiz(&reply).unwrap();
        let questions = quiz["questions"].as_array().unwrap();
        assert_eq!(questions.len(), 1);
        assert_eq!(questions[0]["question"], "Valid");
    }

    #[test]
    fn entirely_invalid_replies_are_none() {
        assert!(validate_quiz("not json at all").is_none());
        assert!(validate_quiz("{\"questions\": []}").is_none());
    }

    #[test]
    fn fenced_quiz_replies_parse() {
        let reply = "```json\n{\"questions\": [{\"question\": \"Q?\", \"options\": \
                     [\"a\",\"b\",\"c\",\"d\",\"e\"], \"answer_index\": 1}]}\n```";
        assert!(validate_quiz(reply).is_some());
    }
}
