//! Sliding-window text chunker.
//!
//! Splits extracted document text into overlapping [`Chunk`]s of at most
//! `size` characters. Consecutive chunks share up to `overlap` characters
//! so a sentence cut at a window edge is still seen whole by one of them.
//!
//! # Algorithm
//!
//! 1. Clamp `overlap` to `size / 2`.
//! 2. Open a window `[start, start + size)`.
//! 3. If the window does not reach the end of the text, pull its end back
//!    to the last sentence boundary (`.`, `!`, `?` followed by whitespace)
//!    inside the last [`SENTENCE_LOOKBACK`] chars; failing that, to the
//!    last whitespace inside the last [`WORD_LOOKBACK`] chars; failing
//!    that, cut hard.
//! 4. Emit the trimmed window (whitespace-only windows are skipped).
//! 5. Advance `start` to `end - overlap`, always moving forward.
//!
//! Chunk ids are derived from the document id and ordinal, and each chunk
//! carries a SHA-256 hash of its text, so chunking the same text twice
//! yields identical chunks.
//!
//! # Example
//!
//! ```rust
//! use hearth_core::chunk::{chunk_text, ChunkParams};
//!
//! let chunks = chunk_text("doc-1", "Hello world. Second sentence.", ChunkParams::new(1000, 200));
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].ordinal, 0);
//! ```

use crate::models::{chunk_id_for, sha256_hex, Chunk};

/// How far back from a window's end to look for a sentence boundary.
pub const SENTENCE_LOOKBACK: usize = 100;
/// How far back from a window's end to look for a word boundary.
pub const WORD_LOOKBACK: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkParams {
    /// Maximum characters per chunk.
    pub size: usize,
    /// Characters shared between consecutive chunks.
    pub overlap: usize,
}

impl ChunkParams {
    pub fn new(size: usize, overlap: usize) -> Self {
        Self { size, overlap }
    }

    /// Overlap actually applied: never more than half a chunk.
    pub fn effective_overlap(&self) -> usize {
        self.overlap.min(self.size / 2)
    }
}

impl Default for ChunkParams {
    fn default() -> Self {
        Self::new(1000, 200)
    }
}

/// Split `text` into overlapping chunks owned by `document_id`.
///
/// Returns an empty vector for whitespace-only text. Ordinals are
/// contiguous from 0 and spans are character offsets into `text`.
pub fn chunk_text(document_id: &str, text: &str, params: ChunkParams) -> Vec<Chunk> {
    let size = params.size.max(1);
    let overlap = params.effective_overlap();
    let chars: Vec<char> = text.chars().collect();
    let n = chars.len();

    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < n {
        let mut end = (start + size).min(n);
        if end < n {
            if let Some(b) = sentence_boundary(&chars, start, end) {
                end = b;
            } else if let Some(b) = word_boundary(&chars, start, end) {
                end = b;
            }
        }

        let (lo, hi) = trim_span(&chars, start, end);
        if lo < hi {
            let piece: String = chars[lo..hi].iter().collect();
            let ordinal = chunks.len();
            chunks.push(Chunk {
                id: chunk_id_for(document_id, ordinal),
                document_id: document_id.to_string(),
                ordinal,
                hash: sha256_hex(piece.as_bytes()),
                text: piece,
                start: lo,
                end: hi,
            });
        }

        if end >= n {
            break;
        }
        let next = end.saturating_sub(overlap);
        start = if next > start { next } else { end };
    }

    chunks
}

/// Position just past the last `[.!?]\s+` run in the window's tail.
fn sentence_boundary(chars: &[char], start: usize, end: usize) -> Option<usize> {
    let lo = start.max(end.saturating_sub(SENTENCE_LOOKBACK));
    let mut found = None;
    let mut i = lo;
    while i + 1 < end {
        if matches!(chars[i], '.' | '!' | '?') && chars[i + 1].is_whitespace() {
            let mut j = i + 1;
            while j < end && chars[j].is_whitespace() {
                j += 1;
            }
            found = Some(j);
            i = j;
        } else {
            i += 1;
        }
    }
    found.filter(|&b| b > start)
}

/// Start of the last whitespace run in the window's tail.
fn word_boundary(chars: &[char], start: usize, end: usize) -> Option<usize> {
    let lo = start.max(end.saturating_sub(WORD_LOOKBACK));
    let mut k = (lo..end).rev().find(|&i| chars[i].is_whitespace())?;
    while k > lo && chars[k - 1].is_whitespace() {
        k -= 1;
    }
    Some(k).filter(|&b| b > start)
}

fn trim_span(chars: &[char], mut lo: usize, mut hi: usize) -> (usize, usize) {
    while lo < hi && chars[lo].is_whitespace() {
        lo += 1;
    }
    while hi > lo && chars[hi - 1].is_whitespace() {
        hi -= 1;
    }
    (lo, hi)
}
