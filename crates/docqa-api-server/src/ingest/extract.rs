use anyhow::{Context, Result};
use lopdf::Document;

/// Identifies the extraction code that produced a chunk set; stored in chunk
/// metadata and on the document record.
pub const PDF_PROCESSOR_VERSION: &str = "lopdf-pages-v1";

/// Extraction output: one text with inline page markers, so every character
/// maps back to a source page, plus the page count.
#[derive(Debug)]
pub struct ExtractedText {
    pub text: String,
    pub page_count: usize,
}

pub fn page_marker(page: u32) -> String {
    format!("\n[[page={}]]\n", page)
}

/// Extract PDF text page by page, prefixing each page's text with its
/// marker. Pages that yield no text still emit the marker so downstream
/// anchors stay monotonic.
pub fn extract_pdf(bytes: &[u8]) -> Result<ExtractedText> {
    let document = Document::load_mem(bytes).context("failed to parse PDF")?;
    let pages = document.get_pages();
    let page_count = pages.len();

    let mut text = String::new();
    for page_num in pages.keys() {
        text.push_str(&page_marker(*page_num));
        if let Ok(page_text) = document.extract_text(&[*page_num]) {
            text.push_str(&page_text);
            text.push('\n');
        }
    }

    if text_without_markers(&text).trim().is_empty() {
        anyhow::bail!("no extractable text in PDF ({} pages)", page_count);
    }

    Ok(ExtractedText { text, page_count })
}

/// The anchored text with all markers removed, for emptiness checks.
pub fn text_without_markers(anchored: &str) -> String {
    super::chunker::MARKER_RE.replace_all(anchored, "").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markers_carry_the_page_number() {
        assert_eq!(page_marker(12), "\n[[page=12]]\n");
    }

    #[test]
    fn marker_stripping_leaves_content() {
        let anchored = format!("{}hello{}world", page_marker(1), page_marker(2));
        let stripped = text_without_markers(&anchored);
        assert!(stripped.contains("hello") && stripped.contains("world"));
        assert!(!stripped.contains("[[page="));
    }

    #[test]
    fn garbage_bytes_fail_extraction() {
        assert!(extract_pdf(b"definitely not a pdf").is_err());
    }
}
