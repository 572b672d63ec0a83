//! Exact in-memory [`VectorIndex`].
//!
//! Uses `HashMap`s behind a `std::sync::RwLock`. Queries are brute-force
//! cosine similarity over every stored vector in scope, which is fast
//! enough for the few thousand chunks an offline assistant holds.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::embedding::{cosine_similarity, Embedder};
use crate::error::{Error, Result};
use crate::models::{Chunk, Document, DocumentStatus, Embedding, ScoredChunk};

use super::{AddOutcome, EvictedDocument, IndexedDocument, VectorIndex};

/// Fixed per-chunk bookkeeping overhead used by [`FlatIndex::approx_bytes`].
const ENTRY_OVERHEAD_BYTES: usize = 160;

struct StoredChunk {
    chunk: Chunk,
    embedding: Embedding,
}

struct StoredDoc {
    name: String,
    chunk_ids: Vec<String>,
    relevance: f64,
    inserted: u64,
}

#[derive(Default)]
struct Inner {
    chunks: HashMap<String, StoredChunk>,
    docs: HashMap<String, StoredDoc>,
    next_seq: u64,
    bytes: usize,
}

impl Inner {
    fn lowest_relevance(&self, exclude: Option<&str>) -> Option<String> {
        self.docs
            .iter()
            .filter(|(id, _)| Some(id.as_str()) != exclude)
            .min_by(|(a_id, a), (b_id, b)| {
                a.relevance
                    .total_cmp(&b.relevance)
                    .then(a.inserted.cmp(&b.inserted))
                    .then(a_id.cmp(b_id))
            })
            .map(|(id, _)| id.clone())
    }

    fn remove(&mut self, document_id: &str) -> Option<EvictedDocument> {
        let doc = self.docs.remove(document_id)?;
        for chunk_id in &doc.chunk_ids {
            if let Some(sc) = self.chunks.remove(chunk_id) {
                self.bytes = self.bytes.saturating_sub(entry_bytes(&sc));
            }
        }
        Some(EvictedDocument {
            id: document_id.to_string(),
            name: doc.name,
            chunk_count: doc.chunk_ids.len(),
            relevance: doc.relevance,
        })
    }
}

fn entry_bytes(sc: &StoredChunk) -> usize {
    sc.chunk.text.len() + sc.embedding.vector.len() * 4 + ENTRY_OVERHEAD_BYTES
}

/// Brute-force cosine index with relevance-ranked eviction.
pub struct FlatIndex {
    embedder: Arc<dyn Embedder>,
    capacity: usize,
    inner: RwLock<Inner>,
}

impl FlatIndex {
    pub fn new(embedder: Arc<dyn Embedder>, capacity: usize) -> Self {
        Self {
            embedder,
            capacity,
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    // A poisoned lock only means another worker panicked mid-operation;
    // the maps are still structurally valid, so keep serving.
    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl VectorIndex for FlatIndex {
    fn add(&self, document: &Document, chunks: &[Chunk]) -> Result<AddOutcome> {
        if document.status != DocumentStatus::Processed {
            return Err(Error::CorruptInput(format!(
                "document {} is not processed",
                document.id
            )));
        }
        if let Some(stray) = chunks.iter().find(|c| c.document_id != document.id) {
            return Err(Error::CorruptInput(format!(
                "chunk {} belongs to {}, not {}",
                stray.id, stray.document_id, document.id
            )));
        }

        let fresh: Vec<&Chunk> = {
            let inner = self.read();
            let existing = inner
                .docs
                .get(&document.id)
                .map(|d| d.chunk_ids.len())
                .unwrap_or(0);
            let fresh: Vec<&Chunk> = chunks
                .iter()
                .filter(|c| !inner.chunks.contains_key(&c.id))
                .collect();
            if existing + fresh.len() > self.capacity {
                return Err(Error::CapacityExceeded(format!(
                    "document {} needs {} chunks, index capacity is {}",
                    document.name,
                    existing + fresh.len(),
                    self.capacity
                )));
            }
            fresh
        };
        if fresh.is_empty() {
            return Ok(AddOutcome::default());
        }

        let texts: Vec<String> = fresh.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embedder.embed(&texts)?;
        if vectors.len() != fresh.len() {
            return Err(Error::ModelUnavailable(format!(
                "embedder returned {} vectors for {} chunks",
                vectors.len(),
                fresh.len()
            )));
        }

        // another add may have landed while embedding; check again
        let mut inner = self.write();
        let mut outcome = AddOutcome::default();
        let existing = inner
            .docs
            .get(&document.id)
            .map(|d| d.chunk_ids.len())
            .unwrap_or(0);
        let incoming = fresh
            .iter()
            .filter(|c| !inner.chunks.contains_key(&c.id))
            .count();
        if existing + incoming > self.capacity {
            return Err(Error::CapacityExceeded(format!(
                "document {} needs {} chunks, index capacity is {}",
                document.name,
                existing + incoming,
                self.capacity
            )));
        }
        while inner.chunks.len() + incoming > self.capacity {
            let Some(victim) = inner.lowest_relevance(Some(&document.id)) else {
                break;
            };
            if let Some(evicted) = inner.remove(&victim) {
                tracing::info!(
                    document_id = %evicted.id,
                    relevance = evicted.relevance,
                    chunks = evicted.chunk_count,
                    "evicted document to make room"
                );
                outcome.evicted.push(evicted);
            }
        }

        if !inner.docs.contains_key(&document.id) {
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.docs.insert(
                document.id.clone(),
                StoredDoc {
                    name: document.name.clone(),
                    chunk_ids: Vec::new(),
                    relevance: 0.0,
                    inserted: seq,
                },
            );
        }

        for (chunk, vector) in fresh.into_iter().zip(vectors) {
            if inner.chunks.contains_key(&chunk.id) {
                continue;
            }
            let stored = StoredChunk {
                embedding: Embedding {
                    chunk_id: chunk.id.clone(),
                    vector,
                    model: self.embedder.model_name().to_string(),
                },
                chunk: chunk.clone(),
            };
            inner.bytes += entry_bytes(&stored);
            inner.chunks.insert(chunk.id.clone(), stored);
            if let Some(doc) = inner.docs.get_mut(&document.id) {
                doc.chunk_ids.push(chunk.id.clone());
            }
            outcome.added += 1;
        }

        Ok(outcome)
    }

    fn query(&self, text: &str, k: usize, scope: Option<&[String]>) -> Result<Vec<ScoredChunk>> {
        if k == 0 || text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let query_vec = self.embedder.embed_one(text)?;

        let mut results: Vec<ScoredChunk> = {
            let inner = self.read();
            inner
                .chunks
                .values()
                .filter(|sc| match scope {
                    Some(ids) => ids.iter().any(|id| *id == sc.chunk.document_id),
                    None => true,
                })
                .map(|sc| ScoredChunk {
                    chunk: sc.chunk.clone(),
                    score: cosine_similarity(&query_vec, &sc.embedding.vector),
                })
                .collect()
        };

        results.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(a.chunk.ordinal.cmp(&b.chunk.ordinal))
                .then(a.chunk.document_id.cmp(&b.chunk.document_id))
                .then(a.chunk.id.cmp(&b.chunk.id))
        });
        results.truncate(k);

        if !results.is_empty() {
            let mut inner = self.write();
            for sc in &results {
                if let Some(doc) = inner.docs.get_mut(&sc.chunk.document_id) {
                    doc.relevance += f64::from(sc.score.max(0.0));
                }
            }
        }

        Ok(results)
    }

    fn remove_document(&self, document_id: &str) -> bool {
        self.write().remove(document_id).is_some()
    }

    fn evict_lowest(&self) -> Option<EvictedDocument> {
        let mut inner = self.write();
        let victim = inner.lowest_relevance(None)?;
        let evicted = inner.remove(&victim)?;
        tracing::info!(
            document_id = %evicted.id,
            relevance = evicted.relevance,
            chunks = evicted.chunk_count,
            "evicted lowest-relevance document"
        );
        Some(evicted)
    }

    fn contains_document(&self, document_id: &str) -> bool {
        self.read().docs.contains_key(document_id)
    }

    fn relevance(&self, document_id: &str) -> Option<f64> {
        self.read().docs.get(document_id).map(|d| d.relevance)
    }

    fn documents(&self) -> Vec<IndexedDocument> {
        let inner = self.read();
        let mut docs: Vec<IndexedDocument> = inner
            .docs
            .iter()
            .map(|(id, d)| IndexedDocument {
                id: id.clone(),
                name: d.name.clone(),
                chunk_count: d.chunk_ids.len(),
                relevance: d.relevance,
                inserted: d.inserted,
            })
            .collect();
        docs.sort_by_key(|d| d.inserted);
        docs
    }

    fn chunk_count(&self) -> usize {
        self.read().chunks.len()
    }

    fn approx_bytes(&self) -> usize {
        self.read().bytes
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{chunk_text, ChunkParams};
    use crate::embedding::HashingEmbedder;
    use crate::models::{chunk_id_for, DocumentFormat};

    /// Embedder that maps known texts to fixed vectors.
    struct TableEmbedder(Vec<(&'static str, Vec<f32>)>);

    impl Embedder for TableEmbedder {
        fn model_name(&self) -> &str {
            "table"
        }
        fn dims(&self) -> usize {
            2
        }
        fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| {
                    self.0
                        .iter()
                        .find(|(k, _)| *k == t.as_str())
                        .map(|(_, v)| v.clone())
                        .unwrap_or_else(|| vec![0.0, 0.0])
                })
                .collect())
        }
    }

    fn processed(name: &str, text: &str) -> Document {
        let mut doc = Document::pending(name, DocumentFormat::Text, text.as_bytes());
        doc.text = text.to_string();
        doc.status = DocumentStatus::Processed;
        doc
    }

    fn manual_chunks(doc: &Document, texts: &[&str]) -> Vec<Chunk> {
        texts
            .iter()
            .enumerate()
            .map(|(i, t)| Chunk {
                id: chunk_id_for(&doc.id, i),
                document_id: doc.id.clone(),
                ordinal: i,
                text: t.to_string(),
                start: 0,
                end: t.len(),
                hash: String::new(),
            })
            .collect()
    }

    fn unit(angle_cos: f32) -> Vec<f32> {
        vec![angle_cos, (1.0 - angle_cos * angle_cos).sqrt()]
    }

    #[test]
    fn top_hit_is_most_similar_chunk() {
        let embedder = TableEmbedder(vec![
            ("question", vec![1.0, 0.0]),
            ("chunk zero", unit(0.40)),
            ("chunk one", unit(0.10)),
            ("chunk two", unit(0.91)),
        ]);
        let index = FlatIndex::new(Arc::new(embedder), 100);
        let doc = processed("guide.txt", "whatever");
        let chunks = manual_chunks(&doc, &["chunk zero", "chunk one", "chunk two"]);
        index.add(&doc, &chunks).unwrap();

        let hits = index.query("question", 1, None).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.ordinal, 2);
        assert!((hits[0].score - 0.91).abs() < 1e-4);
    }

    #[test]
    fn ties_break_by_ordinal() {
        let embedder = TableEmbedder(vec![
            ("q", vec![1.0, 0.0]),
            ("a", vec![1.0, 0.0]),
            ("b", vec![1.0, 0.0]),
        ]);
        let index = FlatIndex::new(Arc::new(embedder), 100);
        let doc = processed("d.txt", "x");
        let chunks = manual_chunks(&doc, &["b", "a"]);
        index.add(&doc, &chunks).unwrap();
        let hits = index.query("q", 5, None).unwrap();
        let ordinals: Vec<usize> = hits.iter().map(|h| h.chunk.ordinal).collect();
        assert_eq!(ordinals, vec![0, 1]);
    }

    #[test]
    fn query_is_deterministic() {
        let index = FlatIndex::new(Arc::new(HashingEmbedder::new(256)), 1000);
        let text = "Water filters need cleaning. Solar panels need dusting. \
                    Batteries need checking. Water tanks need covers.";
        let doc = processed("chores.txt", text);
        let chunks = chunk_text(&doc.id, text, ChunkParams::new(30, 0));
        index.add(&doc, &chunks).unwrap();
        let a = index.query("water maintenance", 3, None).unwrap();
        let b = index.query("water maintenance", 3, None).unwrap();
        assert_eq!(a, b);
        assert!(a.len() <= 3);
    }

    #[test]
    fn add_is_idempotent_by_chunk_id() {
        let index = FlatIndex::new(Arc::new(HashingEmbedder::new(64)), 100);
        let doc = processed("a.txt", "alpha beta gamma");
        let chunks = manual_chunks(&doc, &["alpha", "beta", "gamma"]);
        assert_eq!(index.add(&doc, &chunks).unwrap().added, 3);
        assert_eq!(index.add(&doc, &chunks).unwrap().added, 0);
        assert_eq!(index.chunk_count(), 3);
        assert_eq!(index.documents().len(), 1);
    }

    #[test]
    fn rejects_unprocessed_or_foreign_chunks() {
        let index = FlatIndex::new(Arc::new(HashingEmbedder::new(64)), 100);
        let pending = Document::pending("p.txt", DocumentFormat::Text, b"p");
        assert!(matches!(
            index.add(&pending, &[]),
            Err(Error::CorruptInput(_))
        ));

        let doc = processed("a.txt", "a");
        let other = processed("b.txt", "b");
        let foreign = manual_chunks(&other, &["b"]);
        assert!(matches!(
            index.add(&doc, &foreign),
            Err(Error::CorruptInput(_))
        ));
    }

    #[test]
    fn scope_restricts_documents() {
        let index = FlatIndex::new(Arc::new(HashingEmbedder::new(128)), 100);
        let a = processed("a.txt", "goats");
        let b = processed("b.txt", "goats too");
        index.add(&a, &manual_chunks(&a, &["goats eat hay"])).unwrap();
        index.add(&b, &manual_chunks(&b, &["goats climb rocks"])).unwrap();

        let scope = vec![b.id.clone()];
        let hits = index.query("goats", 10, Some(&scope)).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.document_id, b.id);
        assert!(index.query("goats", 10, Some(&[])).unwrap().is_empty());
    }

    #[test]
    fn eviction_keeps_highest_relevance_documents() {
        let index = FlatIndex::new(Arc::new(HashingEmbedder::new(256)), 100);
        let docs: Vec<Document> = ["bees honey", "goats milk", "solar power"]
            .iter()
            .map(|t| processed(&format!("{t}.txt"), t))
            .collect();
        for d in &docs {
            index.add(d, &manual_chunks(d, &[d.text.as_str()])).unwrap();
        }
        index.query("goats milk", 1, None).unwrap();
        index.query("goats", 1, None).unwrap();
        index.query("solar", 1, None).unwrap();

        let evicted = index.evict_to(2);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id, docs[0].id);
        assert!(index.chunk_count() <= 2);

        let remaining: Vec<String> = index.documents().into_iter().map(|d| d.id).collect();
        assert_eq!(remaining, vec![docs[1].id.clone(), docs[2].id.clone()]);
        assert!(index.relevance(&docs[1].id).unwrap() > index.relevance(&docs[2].id).unwrap());
    }

    #[test]
    fn add_evicts_to_stay_within_capacity() {
        let index = FlatIndex::new(Arc::new(HashingEmbedder::new(64)), 3);
        let a = processed("a.txt", "a");
        let b = processed("b.txt", "b");
        index.add(&a, &manual_chunks(&a, &["one", "two"])).unwrap();
        let outcome = index.add(&b, &manual_chunks(&b, &["three", "four"])).unwrap();
        assert_eq!(outcome.added, 2);
        assert_eq!(outcome.evicted.len(), 1);
        assert_eq!(outcome.evicted[0].id, a.id);
        assert_eq!(index.chunk_count(), 2);
    }

    #[test]
    fn oversized_document_is_rejected() {
        let index = FlatIndex::new(Arc::new(HashingEmbedder::new(64)), 2);
        let a = processed("a.txt", "a");
        let err = index
            .add(&a, &manual_chunks(&a, &["one", "two", "three"]))
            .unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded(_)));
        assert_eq!(index.chunk_count(), 0);
    }

    /// Holds every caller inside `embed` until `n` of them arrived.
    struct GateEmbedder(std::sync::Barrier);

    impl Embedder for GateEmbedder {
        fn model_name(&self) -> &str {
            "gate"
        }
        fn dims(&self) -> usize {
            2
        }
        fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.0.wait();
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    #[test]
    fn concurrent_adds_of_one_document_respect_capacity() {
        let index = Arc::new(FlatIndex::new(
            Arc::new(GateEmbedder(std::sync::Barrier::new(2))),
            4,
        ));
        let doc = processed("big.txt", "big");
        let all = manual_chunks(&doc, &["c0", "c1", "c2", "c3", "c4"]);

        // each half fits on its own; both passed the first check before either wrote
        let halves = [all[..3].to_vec(), all[3..].to_vec()];
        let threads: Vec<_> = halves
            .into_iter()
            .map(|chunks| {
                let index = Arc::clone(&index);
                let doc = doc.clone();
                std::thread::spawn(move || index.add(&doc, &chunks))
            })
            .collect();
        let results: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();

        assert!(index.chunk_count() <= 4);
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(Error::CapacityExceeded(_)))));
    }

    #[test]
    fn approx_bytes_tracks_add_and_remove() {
        let index = FlatIndex::new(Arc::new(HashingEmbedder::new(64)), 10);
        let a = processed("a.txt", "a");
        index.add(&a, &manual_chunks(&a, &["hello"])).unwrap();
        assert_eq!(index.approx_bytes(), 5 + 64 * 4 + ENTRY_OVERHEAD_BYTES);
        assert!(index.remove_document(&a.id));
        assert_eq!(index.approx_bytes(), 0);
        assert!(!index.remove_document(&a.id));
    }
}
