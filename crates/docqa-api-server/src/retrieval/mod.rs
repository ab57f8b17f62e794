use crate::config::RetrievalConfig;
use crate::database::{ChunkMatch, Repository, SearchMode};
use crate::database::EmbeddingProviderKind;
use crate::utils::error::ApiError;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// A document targeted by retrieval: durable id plus the human-readable slug
/// carried through for citations.
#[derive(Debug, Clone)]
pub struct DocRef {
    pub id: Uuid,
    pub slug: String,
}

/// One retrieved chunk with provenance. `similarity` is absent for hybrid
/// text-only matches; `score` always orders the result.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedChunk {
    pub document_id: Uuid,
    pub document_slug: String,
    pub chunk_index: i32,
    pub content: String,
    pub page_number: Option<i32>,
    pub similarity: Option<f32>,
    #[serde(skip)]
    pub score: f32,
}

/// Similarity distribution for observability. Text-only matches contribute
/// nothing here.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SimilaritySummary {
    pub min: Option<f32>,
    pub max: Option<f32>,
    pub mean: Option<f32>,
    pub top_k: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct RetrievalResult {
    pub chunks: Vec<RetrievedChunk>,
    pub summary: SimilaritySummary,
}

pub struct RetrievalEngine {
    repository: Arc<Repository>,
    config: RetrievalConfig,
}

impl RetrievalEngine {
    pub fn new(repository: Arc<Repository>, config: RetrievalConfig) -> Self {
        Self { repository, config }
    }

    /// Ranked chunks for a query across one or several documents.
    ///
    /// Multi-document selection is balanced: per-document top-k, then a
    /// round-robin take of each document's next-best chunk until the
    /// aggregate budget fills, so a large document cannot starve a small
    /// one. The selected set is returned in score-descending order.
    pub async fn retrieve(
        &self,
        provider: EmbeddingProviderKind,
        query_vec: &[f32],
        query_text: &str,
        documents: &[DocRef],
        mode: SearchMode,
        per_doc_limit: usize,
    ) -> Result<RetrievalResult, ApiError> {
        if documents.is_empty() {
            return Ok(RetrievalResult {
                chunks: Vec::new(),
                summary: SimilaritySummary::default(),
            });
        }

        let per_doc = per_doc_limit.min(self.config.max_chunk_limit).max(1);
        let timeout = Duration::from_secs(self.config.search_timeout_seconds);

        let chunks = if documents.len() == 1 {
            let doc = &documents[0];
            let matches = tokio::time::timeout(
                timeout,
                self.repository.match_chunks(
                    doc.id,
                    provider,
                    query_vec,
                    per_doc as i64,
                    mode,
                    query_text,
                    self.config.text_match_boost,
                ),
            )
            .await
            .map_err(|_| {
                warn!("Chunk search timed out for document {}", doc.slug);
                ApiError::UpstreamTimeout("chunk retrieval timed out".to_string())
            })?
            .map_err(store_error)?;

            with_provenance(matches, doc)
        } else {
            let ids: Vec<Uuid> = documents.iter().map(|d| d.id).collect();
            let groups = tokio::time::timeout(
                timeout,
                self.repository.match_chunks_multi(
                    &ids,
                    provider,
                    query_vec,
                    per_doc as i64,
                    mode,
                    query_text,
                    self.config.text_match_boost,
                ),
            )
            .await
            .map_err(|_| ApiError::UpstreamTimeout("chunk retrieval timed out".to_string()))?
            .map_err(store_error)?;

            let budget = (per_doc * documents.len()).min(self.config.max_aggregate_chunks);
            let groups: Vec<Vec<RetrievedChunk>> = groups
                .into_iter()
                .zip(documents.iter())
                .map(|(matches, doc)| with_provenance(matches, doc))
                .collect();

            interleave_balanced(groups, budget)
        };

        let summary = summarize(&chunks);

        debug!(
            "Retrieved {} chunks across {} documents (mode {:?})",
            chunks.len(),
            documents.len(),
            mode
        );

        Ok(RetrievalResult { chunks, summary })
    }
}

fn store_error(err: anyhow::Error) -> ApiError {
    match err.downcast::<sqlx::Error>() {
        Ok(sqlx_err) => ApiError::from_store(sqlx_err),
        Err(other) => ApiError::Internal(other.to_string()),
    }
}

fn with_provenance(matches: Vec<ChunkMatch>, doc: &DocRef) -> Vec<RetrievedChunk> {
    matches
        .into_iter()
        .map(|m| RetrievedChunk {
            document_id: m.document_id,
            document_slug: doc.slug.clone(),
            chunk_index: m.chunk_index,
            content: m.content,
            page_number: m.page_number,
            similarity: m.similarity,
            score: m.score,
        })
        .collect()
}

/// Round-robin take of each document's next-best remaining chunk until the
/// budget fills or every document is exhausted; within a round, ties break
/// by raw similarity. The balanced selection is then ordered by score
/// descending.
fn interleave_balanced(groups: Vec<Vec<RetrievedChunk>>, budget: usize) -> Vec<RetrievedChunk> {
    let mut cursors: Vec<std::vec::IntoIter<RetrievedChunk>> =
        groups.into_iter().map(|g| g.into_iter()).collect();
    let mut selected = Vec::with_capacity(budget);

    'rounds: loop {
        let mut round: Vec<RetrievedChunk> = Vec::with_capacity(cursors.len());
        for cursor in cursors.iter_mut() {
            if let Some(chunk) = cursor.next() {
                round.push(chunk);
            }
        }
        if round.is_empty() {
            break;
        }

        round.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    b.similarity
                        .unwrap_or(f32::MIN)
                        .partial_cmp(&a.similarity.unwrap_or(f32::MIN))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
        });

        for chunk in round {
            if selected.len() >= budget {
                break 'rounds;
            }
            selected.push(chunk);
        }
    }

    selected.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    selected
}

fn summarize(chunks: &[RetrievedChunk]) -> SimilaritySummary {
    let mut sims: Vec<f32> = chunks.iter().filter_map(|c| c.similarity).collect();
    if sims.is_empty() {
        return SimilaritySummary::default();
    }

    let sum: f32 = sims.iter().sum();
    let mean = sum / sims.len() as f32;
    let min = sims.iter().cloned().fold(f32::INFINITY, f32::min);
    let max = sims.iter().cloned().fold(f32::NEG_INFINITY, f32::max);

    sims.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    sims.truncate(5);

    SimilaritySummary {
        min: Some(min),
        max: Some(max),
        mean: Some(mean),
        top_k: sims,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(doc: &str, index: i32, score: f32) -> RetrievedChunk {
        RetrievedChunk {
            document_id: Uuid::new_v4(),
            document_slug: doc.to_string(),
            chunk_index: index,
            content: format!("{} chunk {}", doc, index),
            page_number: Some(index + 1),
            similarity: Some(score),
            score,
        }
    }

    fn group(doc: &str, scores: &[f32]) -> Vec<RetrievedChunk> {
        scores
            .iter()
            .enumerate()
            .map(|(i, s)| chunk(doc, i as i32, *s))
            .collect()
    }

    #[test]
    fn interleave_is_score_descending() {
        let merged = interleave_balanced(
            vec![group("a", &[0.9, 0.7, 0.5]), group("b", &[0.8, 0.6, 0.4])],
            6,
        );

        assert_eq!(merged.len(), 6);
        for window in merged.windows(2) {
            assert!(window[0].score >= window[1].score);
        }
    }

    #[test]
    fn no_document_dominates_the_selection() {
        // "a" has uniformly better scores; round-robin still takes from "b".
        let merged = interleave_balanced(
            vec![
                group("a", &[0.99, 0.98, 0.97, 0.96]),
                group("b", &[0.50, 0.49, 0.48, 0.47]),
            ],
            4,
        );

        let from_a = merged.iter().filter(|c| c.document_slug == "a").count();
        let from_b = merged.iter().filter(|c| c.document_slug == "b").count();
        assert_eq!(from_a, 2);
        assert_eq!(from_b, 2);
    }

    #[test]
    fn budget_caps_the_merge() {
        let merged = interleave_balanced(
            vec![group("a", &[0.9; 50]), group("b", &[0.8; 50])],
            10,
        );
        assert_eq!(merged.len(), 10);
    }

    #[test]
    fn exhausted_documents_cede_their_share() {
        let merged = interleave_balanced(
            vec![group("a", &[0.9]), group("b", &[0.8, 0.7, 0.6])],
            4,
        );

        assert_eq!(merged.len(), 4);
        assert_eq!(
            merged.iter().filter(|c| c.document_slug == "b").count(),
            3
        );
    }

    #[test]
    fn text_only_matches_survive_the_merge() {
        let mut g = group("a", &[0.9]);
        g.push(RetrievedChunk {
            similarity: None,
            score: 0.3,
            ..chunk("a", 7, 0.0)
        });

        let merged = interleave_balanced(vec![g, group("b", &[0.5])], 3);
        assert_eq!(merged.len(), 3);
        assert!(merged.iter().any(|c| c.similarity.is_none()));
    }

    #[test]
    fn summary_ignores_absent_similarities() {
        let mut chunks = group("a", &[0.9, 0.5]);
        chunks.push(RetrievedChunk {
            similarity: None,
            score: 0.2,
            ..chunk("a", 9, 0.0)
        });

        let summary = summarize(&chunks);
        assert_eq!(summary.min, Some(0.5));
        assert_eq!(summary.max, Some(0.9));
        assert!((summary.mean.unwrap() - 0.7).abs() < 1e-6);
        assert_eq!(summary.top_k, vec![0.9, 0.5]);
    }

    #[test]
    fn empty_result_has_empty_summary() {
        let summary = summarize(&[]);
        assert!(summary.min.is_none() && summary.max.is_none() && summary.mean.is_none());
        assert!(summary.top_k.is_empty());
    }
}
