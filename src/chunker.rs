//! Token-aware text chunker.
//!
//! Splits a document body into overlapping windows of at most `max_tokens`
//! tokens with `overlap_tokens` of trailing context carried into the next
//! window. Tokenization is a provider-neutral approximation (whitespace plus
//! punctuation boundaries); the exact LLM tokenizer is not on this path.
//!
//! Chunks preserve the document's `title`, `url`, and `source`, and receive
//! contiguous ordinals starting at 0. Concatenating all windows of a document
//! minus the overlap reproduces the document's token sequence.

use uuid::Uuid;

use crate::models::{Chunk, Document};

/// Split `text` into approximate LLM tokens: runs of alphanumerics and
/// underscores, and single punctuation characters. Whitespace separates.
pub fn tokenize(text: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut start = None;

    for (i, ch) in text.char_indices() {
        if ch.is_alphanumeric() || ch == '_' {
            if start.is_none() {
                start = Some(i);
            }
        } else {
            if let Some(s) = start.take() {
                tokens.push(&text[s..i]);
            }
            if !ch.is_whitespace() {
                tokens.push(&text[i..i + ch.len_utf8()]);
            }
        }
    }
    if let Some(s) = start {
        tokens.push(&text[s..]);
    }
    tokens
}

/// Approximate token count of `text`.
pub fn count_tokens(text: &str) -> usize {
    tokenize(text).len()
}

/// Split a document into overlapping chunks of at most `max_tokens` tokens.
///
/// A body at or under the limit yields a single chunk. Ordinals are
/// contiguous from 0. `overlap` must be smaller than `max_tokens` (enforced
/// by config validation).
pub fn chunk_document(doc: &Document, max_tokens: usize, overlap: usize) -> Vec<Chunk> {
    let tokens = tokenize(&doc.body);

    if tokens.len() <= max_tokens {
        return vec![make_chunk(doc, 0, doc.body.trim(), tokens.len())];
    }

    let stride = max_tokens - overlap;
    let mut chunks = Vec::new();
    let mut ordinal: u32 = 0;
    let mut start = 0usize;

    while start < tokens.len() {
        let end = (start + max_tokens).min(tokens.len());
        let window = &tokens[start..end];
        let text = slice_spanning(&doc.body, window);
        chunks.push(make_chunk(doc, ordinal, text.trim(), window.len()));
        ordinal += 1;
        if end == tokens.len() {
            break;
        }
        start += stride;
    }

    chunks
}

/// The source substring spanning from the first to the last token of a
/// window, so chunk text keeps the original whitespace between tokens.
fn slice_spanning<'a>(body: &'a str, window: &[&'a str]) -> &'a str {
    let first = window[0];
    let last = window[window.len() - 1];
    let body_ptr = body.as_ptr() as usize;
    let start = first.as_ptr() as usize - body_ptr;
    let end = last.as_ptr() as usize - body_ptr + last.len();
    &body[start..end]
}

fn make_chunk(doc: &Document, ordinal: u32, text: &str, token_count: usize) -> Chunk {
    Chunk {
        id: Uuid::new_v4().to_string(),
        doc_id: doc.id.clone(),
        source: doc.source,
        title: doc.title.clone(),
        url: doc.url.clone(),
        text: text.to_string(),
        token_count,
        ordinal,
    }
}
