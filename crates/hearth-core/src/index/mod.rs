//! Retrieval index abstraction.
//!
//! The [`VectorIndex`] trait is the single contract the context composer
//! and the resource governor talk to. [`flat::FlatIndex`] answers it with
//! an exact brute-force scan; an approximate nearest-neighbour index can
//! replace it without touching any caller.
//!
//! Implementations must be `Send + Sync`: the index is shared by every
//! worker and mutated through internally serialised single-writer
//! operations (`add`, `remove_document`, eviction).

pub mod flat;

use crate::error::Result;
use crate::models::{Chunk, Document, ScoredChunk};

/// A document currently held by the index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedDocument {
    pub id: String,
    pub name: String,
    pub chunk_count: usize,
    /// Running sum of positive query scores earned by this document's chunks.
    pub relevance: f64,
    /// Insertion order; older documents have smaller values.
    pub inserted: u64,
}

/// A document removed to free capacity.
#[derive(Debug, Clone, PartialEq)]
pub struct EvictedDocument {
    pub id: String,
    pub name: String,
    pub chunk_count: usize,
    pub relevance: f64,
}

/// Result of [`VectorIndex::add`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AddOutcome {
    /// Chunks newly embedded and stored. Zero when every chunk was already indexed.
    pub added: usize,
    /// Documents evicted to make room.
    pub evicted: Vec<EvictedDocument>,
}

/// Abstract retrieval index.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`add`](VectorIndex::add) | Embed and store a processed document's chunks (idempotent by chunk id) |
/// | [`query`](VectorIndex::query) | Top-k chunks by similarity, optionally scoped to documents |
/// | [`evict_lowest`](VectorIndex::evict_lowest) | Drop the lowest cumulative-relevance document |
/// | [`evict_to`](VectorIndex::evict_to) | Evict until at most `max_chunks` remain |
pub trait VectorIndex: Send + Sync {
    /// Embed and store `chunks`, which must all belong to `document`.
    ///
    /// Fails with `CorruptInput` when `document` is not processed or a
    /// chunk names another parent, and with `CapacityExceeded` when the
    /// document alone is larger than the index capacity.
    fn add(&self, document: &Document, chunks: &[Chunk]) -> Result<AddOutcome>;

    /// Return at most `k` chunks ordered by descending similarity to
    /// `text`. Ties are broken by chunk ordinal (earlier first). When
    /// `scope` is given, only chunks of those documents are considered.
    fn query(&self, text: &str, k: usize, scope: Option<&[String]>) -> Result<Vec<ScoredChunk>>;

    /// Remove a document and its chunks. Returns whether it was present.
    fn remove_document(&self, document_id: &str) -> bool;

    /// Evict the document with the lowest cumulative relevance.
    fn evict_lowest(&self) -> Option<EvictedDocument>;

    /// Evict lowest-relevance documents until at most `max_chunks` remain.
    fn evict_to(&self, max_chunks: usize) -> Vec<EvictedDocument> {
        let mut evicted = Vec::new();
        while self.chunk_count() > max_chunks {
            match self.evict_lowest() {
                Some(doc) => evicted.push(doc),
                None => break,
            }
        }
        evicted
    }

    fn contains_document(&self, document_id: &str) -> bool;

    /// Cumulative relevance recorded for a document, if indexed.
    fn relevance(&self, document_id: &str) -> Option<f64>;

    /// Documents currently indexed, oldest first.
    fn documents(&self) -> Vec<IndexedDocument>;

    fn chunk_count(&self) -> usize;

    /// Rough heap footprint of stored text and vectors.
    fn approx_bytes(&self) -> usize;

    /// Maximum number of chunks the index will hold.
    fn capacity(&self) -> usize;
}
