use super::chunker::AnchoredChunk;
use crate::config::IngestConfig;
use crate::generation::{ChatMessage, LlmClient};
use crate::utils::json_repair;
use tracing::warn;

const ABSTRACT_SYSTEM_PROMPT: &str = "You summarize documents. Write a single-paragraph \
     abstract (3-5 sentences) of the document excerpt you are given. Plain text only.";

// The provider's JSON mode requires the word JSON in the system message.
const KEYWORDS_SYSTEM_PROMPT: &str = "You extract keywords from documents. Reply with JSON \
     only, in the exact shape {\"keywords\": [\"...\"]}, listing 10 to 20 short keywords or \
     key phrases ranked by importance.";

/// AI-written abstract and keyword cloud for a freshly ingested document.
/// Either side may be absent: the abstract on provider failure, the keywords
/// additionally when the reply cannot be repaired into JSON.
#[derive(Debug, Default)]
pub struct Enrichment {
    pub abstract_text: Option<String>,
    pub keywords: Option<serde_json::Value>,
}

/// Seed text for synthesis: the leading chunks joined, truncated to the
/// character budget on a char boundary.
pub fn synthesis_seed(chunks: &[AnchoredChunk], config: &IngestConfig) -> String {
    let joined = chunks
        .iter()
        .take(config.summary_seed_chunks)
        .map(|c| c.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");

    if joined.len() <= config.summary_seed_chars {
        return joined;
    }
    joined.chars().take(config.summary_seed_chars).collect()
}

pub async fn synthesize(
    llm: &LlmClient,
    model: &str,
    chunks: &[AnchoredChunk],
    config: &IngestConfig,
) -> Enrichment {
    let seed = synthesis_seed(chunks, config);
    if seed.trim().is_empty() {
        return Enrichment::default();
    }

    let abstract_text = match llm
        .complete(
            model,
            &[
                ChatMessage::system(ABSTRACT_SYSTEM_PROMPT),
                ChatMessage::user(seed.clone()),
            ],
        )
        .await
    {
        Ok(text) => Some(text.trim().to_string()).filter(|t| !t.is_empty()),
        Err(e) => {
            warn!("Abstract synthesis failed: {}", e);
            None
        }
    };

    let keywords = match llm
        .complete(
            model,
            &[
                ChatMessage::system(KEYWORDS_SYSTEM_PROMPT),
                ChatMessage::user(seed),
            ],
        )
        .await
    {
        Ok(reply) => parse_keywords(&reply),
        Err(e) => {
            warn!("Keyword synthesis failed: {}", e);
            None
        }
    };

    Enrichment {
        abstract_text,
        keywords,
    }
}

/// Validate the keyword reply: repaired parse, then require a non-empty
/// string array under "keywords". Anything else is logged and skipped.
fn parse_keywords(reply: &str) -> Option<serde_json::Value> {
    let value = json_repair::parse_lenient(reply)?;
    let keywords = value.get("keywords")?.as_array()?;

    let cleaned: Vec<serde_json::Value> = keywords
        .iter()
        .filter(|k| k.as_str().map(|s| !s.trim().is_empty()).unwrap_or(false))
        .cloned()
        .collect();

    if cleaned.is_empty() {
        warn!("Keyword reply parsed but held no usable keywords, skipping");
        return None;
    }

    Some(serde_json::Value::Array(cleaned))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(content: &str) -> AnchoredChunk {
        AnchoredChunk {
            index: 0,
            content: content.to_string(),
            page_number: 1,
        }
    }

    fn config() -> IngestConfig {
        IngestConfig {
            summary_seed_chunks: 2,
            summary_seed_chars: 30,
            ..IngestConfig::default()
        }
    }

    #[test]
    fn seed_takes_leading_chunks_only() {
        let chunks = vec![chunk("one"), chunk("two"), chunk("three")];
        let seed = synthesis_seed(&chunks, &config());
        assert!(seed.contains("one") && seed.contains("two"));
        assert!(!seed.contains("three"));
    }

    #[test]
    fn seed_respects_the_char_budget() {
        let chunks = vec![chunk(&"x".repeat(100))];
        let seed = synthesis_seed(&chunks, &config());
        assert_eq!(seed.chars().count(), 30);
    }

    #[test]
    fn keyword_system_prompt_mentions_json() {
        assert!(KEYWORDS_SYSTEM_PROMPT.contains("JSON"));
    }

    #[test]
    fn fenced_keyword_replies_parse() {
        let reply = "```json\n{\"keywords\": [\"dialysis\", \"transplant\"]}\n```";
        let parsed = parse_keywords(reply).unwrap();
        assert_eq!(parsed.as_array().unwrap().len(), 2);
    }

    #[test]
    fn non_json_keyword_replies_are_skipped() {
        assert!(parse_keywords("kidneys, dialysis, nephrons").is_none());
    }

    #[test]
    fn empty_keyword_arrays_are_skipped() {
        assert!(parse_keywords("{\"keywords\": []}").is_none());
        assert!(parse_keywords("{\"keywords\": [\"  \"]}").is_none());
    }
}
