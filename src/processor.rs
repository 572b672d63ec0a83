//! Document processing: raw bytes → processed [`Document`] + [`Chunk`]s.
//!
//! The processor validates size and format, runs the registered format
//! adapter, and chunks the extracted text. It is synchronous and
//! CPU-bound; the assistant runs it on a blocking worker thread.

use std::path::Path;

use hearth_core::chunk::{chunk_text, ChunkParams};
use hearth_core::models::{Chunk, Document, DocumentFormat, DocumentMeta, DocumentStatus};
use hearth_core::{Error, Result};

use crate::extract::ExtractorRegistry;

/// Largest accepted input, in bytes (50 MiB).
pub const MAX_DOCUMENT_BYTES: usize = 50 * 1024 * 1024;

/// A processed document together with its chunks.
#[derive(Debug, Clone)]
pub struct ProcessedDocument {
    pub document: Document,
    pub chunks: Vec<Chunk>,
}

impl ProcessedDocument {
    pub fn meta(&self, source_path: Option<&Path>) -> DocumentMeta {
        DocumentMeta {
            id: self.document.id.clone(),
            name: self.document.name.clone(),
            format: self.document.format,
            source_path: source_path.map(|p| p.display().to_string()),
            ingested_at: self.document.ingested_at,
            chunk_count: self.chunks.len(),
        }
    }
}

#[derive(Clone)]
pub struct DocumentProcessor {
    registry: ExtractorRegistry,
    params: ChunkParams,
    max_bytes: usize,
}

impl DocumentProcessor {
    pub fn new(registry: ExtractorRegistry, params: ChunkParams) -> Self {
        Self {
            registry,
            params,
            max_bytes: MAX_DOCUMENT_BYTES,
        }
    }

    /// Lower the size limit (tests).
    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Extract text from `raw` and return a processed document.
    ///
    /// Fails with `CorruptInput` for empty or oversized input, undecodable
    /// bytes, or extraction that yields no text.
    pub fn ingest(&self, name: &str, format: DocumentFormat, raw: &[u8]) -> Result<Document> {
        if raw.is_empty() {
            return Err(Error::CorruptInput(format!("{name} is empty")));
        }
        if raw.len() > self.max_bytes {
            return Err(Error::CorruptInput(format!(
                "{name} is {} bytes, the limit is {}",
                raw.len(),
                self.max_bytes
            )));
        }

        let mut document = Document::pending(name, format, raw);
        let text = self.registry.extract(format, raw)?;
        if text.trim().is_empty() {
            return Err(Error::CorruptInput(format!("{name}: no extractable text")));
        }
        document.text = text;
        document.status = DocumentStatus::Processed;
        Ok(document)
    }

    pub fn chunk(&self, document: &Document) -> Vec<Chunk> {
        chunk_text(&document.id, &document.text, self.params)
    }

    /// [`ingest`](Self::ingest) then [`chunk`](Self::chunk).
    pub fn process(&self, name: &str, format: DocumentFormat, raw: &[u8]) -> Result<ProcessedDocument> {
        let document = self.ingest(name, format, raw).inspect_err(|e| {
            tracing::warn!(document = name, %format, error = %e, "document failed");
        })?;
        let chunks = self.chunk(&document);
        tracing::debug!(
            document_id = %document.id,
            chars = document.text.chars().count(),
            chunks = chunks.len(),
            "document processed"
        );
        Ok(ProcessedDocument { document, chunks })
    }
}

impl Default for DocumentProcessor {
    fn default() -> Self {
        Self::new(ExtractorRegistry::with_defaults(), ChunkParams::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processes_plain_text() {
        let p = DocumentProcessor::default();
        let out = p
            .process("notes.txt", DocumentFormat::Text, b"Seeds need warmth. Water daily.")
            .unwrap();
        assert_eq!(out.document.status, DocumentStatus::Processed);
        assert_eq!(out.chunks.len(), 1);
        assert_eq!(out.chunks[0].document_id, out.document.id);
        assert_eq!(out.meta(None).chunk_count, 1);
    }

    #[test]
    fn same_bytes_same_document_and_chunks() {
        let p = DocumentProcessor::default();
        let text = "Long text. ".repeat(400);
        let a = p.process("a.md", DocumentFormat::Markdown, text.as_bytes()).unwrap();
        let b = p.process("b.md", DocumentFormat::Markdown, text.as_bytes()).unwrap();
        assert_eq!(a.document.id, b.document.id);
        assert_eq!(a.chunks, b.chunks);
    }

    #[test]
    fn empty_and_blank_inputs_are_corrupt() {
        let p = DocumentProcessor::default();
        assert!(matches!(
            p.ingest("e.txt", DocumentFormat::Text, b""),
            Err(Error::CorruptInput(_))
        ));
        let err = p
            .ingest("blank.txt", DocumentFormat::Text, b"   \n\n  ")
            .unwrap_err();
        assert!(err.to_string().contains("no extractable text"));
    }

    #[test]
    fn oversize_input_is_corrupt() {
        let p = DocumentProcessor::default().with_max_bytes(8);
        let err = p
            .ingest("big.txt", DocumentFormat::Text, b"more than eight bytes")
            .unwrap_err();
        assert!(matches!(err, Error::CorruptInput(_)));
    }
}
