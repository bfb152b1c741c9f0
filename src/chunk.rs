//! Paragraph-boundary text chunker with offset tracking.
//!
//! Splits note content into [`Chunk`]s that respect a configurable
//! `max_tokens` limit. Splitting occurs on paragraph boundaries (`\n\n`)
//! to preserve semantic coherence within each chunk.
//!
//! Every chunk records the byte range it occupies in the source content,
//! so `chunk.text == content[chunk.start..chunk.end]` always holds at
//! indexing time. Each chunk also carries a SHA-256 hash of its text for
//! staleness detection.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::{Chunk, Document};

/// Approximate chars-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Split a document's content into chunks on paragraph boundaries,
/// respecting `max_tokens`. Returns chunks with contiguous indices
/// starting at 0; whitespace-only content yields no chunks.
pub fn chunk_document(doc: &Document, max_tokens: usize) -> Vec<Chunk> {
    let content = doc.content.as_str();
    let max_chars = max_tokens * CHARS_PER_TOKEN;

    let mut chunks: Vec<Chunk> = Vec::new();
    // Current merged span, trimmed at both ends.
    let mut current: Option<(usize, usize)> = None;

    let flush = |span: &mut Option<(usize, usize)>, chunks: &mut Vec<Chunk>| {
        if let Some((s, e)) = span.take() {
            chunks.push(make_chunk(&doc.id, chunks.len(), s, e, &content[s..e]));
        }
    };

    for (para_start, para_end) in paragraph_ranges(content) {
        let (ps, pe) = match trimmed_range(content, para_start, para_end) {
            Some(r) => r,
            None => continue,
        };

        // Oversized paragraph: flush and hard-split it.
        if pe - ps > max_chars {
            flush(&mut current, &mut chunks);
            hard_split(doc, content, ps, pe, max_chars, &mut chunks);
            continue;
        }

        match current {
            None => current = Some((ps, pe)),
            Some((cs, _)) if pe - cs > max_chars => {
                flush(&mut current, &mut chunks);
                current = Some((ps, pe));
            }
            // Extend the span through the separator; the chunk stays a
            // contiguous substring of the source.
            Some((cs, _)) => current = Some((cs, pe)),
        }
    }

    flush(&mut current, &mut chunks);
    chunks
}

/// Byte ranges of `\n\n`-separated paragraphs, untrimmed.
fn paragraph_ranges(content: &str) -> Vec<(usize, usize)> {
    let mut ranges = Vec::new();
    let mut offset = 0;
    for piece in content.split("\n\n") {
        ranges.push((offset, offset + piece.len()));
        offset += piece.len() + 2;
    }
    ranges
}

/// Shrink `[start, end)` to exclude leading/trailing whitespace.
/// Returns `None` for whitespace-only ranges.
fn trimmed_range(content: &str, start: usize, end: usize) -> Option<(usize, usize)> {
    let slice = &content[start..end];
    let stripped = slice.trim_start();
    let lead = slice.len() - stripped.len();
    let stripped = stripped.trim_end();
    if stripped.is_empty() {
        None
    } else {
        Some((start + lead, start + lead + stripped.len()))
    }
}

/// Split an oversized paragraph at `max_chars` boundaries, preferring
/// newline or space breakpoints and never splitting inside a UTF-8
/// character.
fn hard_split(
    doc: &Document,
    content: &str,
    start: usize,
    end: usize,
    max_chars: usize,
    chunks: &mut Vec<Chunk>,
) {
    let mut s = start;
    while s < end {
        let mut cut = floor_char_boundary(content, (s + max_chars.max(1)).min(end));
        if cut < end {
            if let Some(pos) = content[s..cut].rfind(['\n', ' ']) {
                if pos > 0 {
                    cut = s + pos + 1;
                }
            }
        }
        if cut <= s {
            cut = ceil_char_boundary(content, s + 1).min(end).max(s + 1);
            cut = ceil_char_boundary(content, cut);
        }
        if let Some((ps, pe)) = trimmed_range(content, s, cut) {
            chunks.push(make_chunk(&doc.id, chunks.len(), ps, pe, &content[ps..pe]));
        }
        s = cut;
    }
}

fn floor_char_boundary(s: &str, mut i: usize) -> usize {
    while i > 0 && i < s.len() && !s.is_char_boundary(i) {
        i -= 1;
    }
    i.min(s.len())
}

fn ceil_char_boundary(s: &str, mut i: usize) -> usize {
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i.min(s.len())
}

fn make_chunk(document_id: &str, index: usize, start: usize, end: usize, text: &str) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        id: Uuid::new_v4().to_string(),
        document_id: document_id.to_string(),
        chunk_index: index,
        start,
        end,
        text: text.to_string(),
        hash,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(content: &str) -> Document {
        Document::new("doc1", "notes/test.md", "Test", content)
    }

    fn assert_substring_invariant(d: &Document, chunks: &[Chunk]) {
        for c in chunks {
            assert_eq!(
                c.text,
                &d.content[c.start..c.end],
                "chunk {} is not a contiguous substring",
                c.chunk_index
            );
        }
    }

    #[test]
    fn test_small_text_single_chunk() {
        let d = doc("Hello, world!");
        let chunks = chunk_document(&d, 700);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].text, "Hello, world!");
        assert_substring_invariant(&d, &chunks);
    }

    #[test]
    fn test_empty_text_no_chunks() {
        let d = doc("");
        assert!(chunk_document(&d, 700).is_empty());
        let d = doc("  \n\n  \n");
        assert!(chunk_document(&d, 700).is_empty());
    }

    #[test]
    fn test_multiple_paragraphs_under_limit() {
        let d = doc("First paragraph.\n\nSecond paragraph.\n\nThird paragraph.");
        let chunks = chunk_document(&d, 700);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.contains("First paragraph."));
        assert!(chunks[0].text.contains("Third paragraph."));
        assert_substring_invariant(&d, &chunks);
    }

    #[test]
    fn test_multiple_paragraphs_exceed_limit() {
        // max_tokens=5 => max_chars=20
        let d = doc("This is paragraph one.\n\nThis is paragraph two.\n\nThis is paragraph three.");
        let chunks = chunk_document(&d, 5);
        assert!(chunks.len() > 1);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i);
        }
        assert_substring_invariant(&d, &chunks);
    }

    #[test]
    fn test_oversized_paragraph_hard_split() {
        let long = "word ".repeat(200);
        let d = doc(&long);
        let chunks = chunk_document(&d, 10);
        assert!(chunks.len() > 1);
        assert_substring_invariant(&d, &chunks);
    }

    #[test]
    fn test_multibyte_content_safe() {
        let long = "知识库笔记 ".repeat(100);
        let d = doc(&long);
        let chunks = chunk_document(&d, 8);
        assert!(!chunks.is_empty());
        assert_substring_invariant(&d, &chunks);
    }

    #[test]
    fn test_deterministic() {
        let d = doc("Alpha\n\nBeta\n\nGamma\n\nDelta");
        let c1 = chunk_document(&d, 5);
        let c2 = chunk_document(&d, 5);
        assert_eq!(c1.len(), c2.len());
        for (a, b) in c1.iter().zip(c2.iter()) {
            assert_eq!(a.text, b.text);
            assert_eq!(a.hash, b.hash);
            assert_eq!((a.start, a.end), (b.start, b.end));
        }
    }
}
