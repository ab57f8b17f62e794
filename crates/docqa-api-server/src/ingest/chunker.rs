use crate::utils::token_estimator::chars_for_tokens;
use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use text_splitter::{ChunkConfig, TextSplitter};
use tracing::debug;

pub static MARKER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[\[page=(\d+)\]\]").expect("valid marker regex"));

/// A chunk ready for embedding: dense index, marker-free content, and the
/// page where the chunk begins (the most recent marker at its start).
#[derive(Debug, Clone)]
pub struct AnchoredChunk {
    pub index: usize,
    pub content: String,
    pub page_number: i32,
}

/// Splits page-anchored text into overlapping windows sized in tokens
/// (approximated as characters).
pub struct TextChunker {
    window_chars: usize,
    overlap_chars: usize,
}

impl TextChunker {
    pub fn new(chunk_tokens: usize, overlap_tokens: usize) -> Self {
        Self {
            window_chars: chars_for_tokens(chunk_tokens),
            overlap_chars: chars_for_tokens(overlap_tokens),
        }
    }

    pub fn chunk(&self, anchored_text: &str) -> Result<Vec<AnchoredChunk>> {
        if anchored_text.trim().is_empty() {
            return Ok(Vec::new());
        }

        // Page anchors by byte offset, in document order.
        let anchors: Vec<(usize, i32)> = MARKER_RE
            .captures_iter(anchored_text)
            .filter_map(|cap| {
                let m = cap.get(0)?;
                let page = cap.get(1)?.as_str().parse::<i32>().ok()?;
                Some((m.start(), page))
            })
            .collect();

        let config = ChunkConfig::new(self.window_chars)
            .with_overlap(self.overlap_chars)
            .map_err(|e| anyhow!("invalid chunk config: {}", e))?;
        let splitter = TextSplitter::new(config);

        let mut chunks = Vec::new();
        for (offset, window) in splitter.chunk_indices(anchored_text) {
            let content = MARKER_RE.replace_all(window, "").trim().to_string();
            if content.is_empty() {
                continue;
            }

            let page_number = anchors
                .iter()
                .take_while(|(anchor_offset, _)| *anchor_offset <= offset)
                .last()
                .map(|(_, page)| *page)
                .unwrap_or(1);

            chunks.push(AnchoredChunk {
                index: chunks.len(),
                content,
                page_number,
            });
        }

        debug!("Chunked anchored text into {} windows", chunks.len());

        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::extract::page_marker;

    fn anchored(pages: &[(u32, &str)]) -> String {
        let mut text = String::new();
        for (page, content) in pages {
            text.push_str(&page_marker(*page));
            text.push_str(content);
            text.push('\n');
        }
        text
    }

    #[test]
    fn indices_are_dense_from_zero() {
        let text = anchored(&[(1, &"alpha beta gamma ".repeat(200))]);
        let chunks = TextChunker::new(100, 20).chunk(&text).unwrap();

        assert!(chunks.len() > 1);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index, i);
        }
    }

    #[test]
    fn chunk_pages_follow_their_anchors() {
        let page_one = "first page sentence. ".repeat(30);
        let page_two = "second page sentence. ".repeat(30);
        let text = anchored(&[(1, &page_one), (2, &page_two)]);

        let chunks = TextChunker::new(120, 20).chunk(&text).unwrap();
        assert!(chunks.len() >= 2);
        assert_eq!(chunks.first().unwrap().page_number, 1);
        assert_eq!(chunks.last().unwrap().page_number, 2);

        // Page anchors never decrease through the chunk sequence.
        for window in chunks.windows(2) {
            assert!(window[0].page_number <= window[1].page_number);
        }
    }

    #[test]
    fn markers_never_leak_into_content() {
        let text = anchored(&[(1, "hello world"), (2, "more text here")]);
        let chunks = TextChunker::new(500, 100).chunk(&text).unwrap();

        assert!(!chunks.is_empty());
        for chunk in &chunks {
            assert!(!chunk.content.contains("[[page="));
        }
    }

    #[test]
    fn unanchored_text_defaults_to_page_one() {
        let chunks = TextChunker::new(500, 100)
            .chunk("plain text without any markers")
            .unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].page_number, 1);
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        assert!(TextChunker::new(500, 100).chunk("   ").unwrap().is_empty());
    }

    #[test]
    fn same_input_chunks_identically() {
        let text = anchored(&[(1, &"stable text. ".repeat(100)), (2, "tail page.")]);
        let chunker = TextChunker::new(80, 16);

        let first = chunker.chunk(&text).unwrap();
        let second = chunker.chunk(&text).unwrap();

        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.content, b.content);
            assert_eq!(a.page_number, b.page_number);
        }
    }
}
