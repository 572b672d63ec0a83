//! Core data models used throughout Hearth.
//!
//! These types represent the documents, chunks, conversation turns, and
//! task bookkeeping that flow between the processor, the index, the
//! composer, and the scheduler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Namespace for the name-based UUIDs Hearth derives for documents and chunks.
const ID_NAMESPACE: Uuid = Uuid::from_u128(0x6b1e_3a52_0c4f_4d8e_9a1f_52c7_d0e8_b913);

/// Supported document formats. Anything else is rejected up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    Text,
    Markdown,
    Pdf,
    Docx,
}

impl DocumentFormat {
    pub const ALL: [DocumentFormat; 4] = [
        DocumentFormat::Text,
        DocumentFormat::Markdown,
        DocumentFormat::Pdf,
        DocumentFormat::Docx,
    ];

    /// Map a file extension (without the dot, any case) to a format.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "txt" | "text" => Some(DocumentFormat::Text),
            "md" | "markdown" => Some(DocumentFormat::Markdown),
            "pdf" => Some(DocumentFormat::Pdf),
            "docx" => Some(DocumentFormat::Docx),
            _ => None,
        }
    }

    /// Map a filename to a format via its extension.
    pub fn from_filename(name: &str) -> Result<Self> {
        let ext = name
            .rsplit_once('.')
            .map(|(_, ext)| ext)
            .ok_or_else(|| Error::UnsupportedFormat(format!("{name}: no file extension")))?;
        Self::from_extension(ext)
            .ok_or_else(|| Error::UnsupportedFormat(format!("{name}: .{ext} is not supported")))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentFormat::Text => "text",
            DocumentFormat::Markdown => "markdown",
            DocumentFormat::Pdf => "pdf",
            DocumentFormat::Docx => "docx",
        }
    }
}

impl std::fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Processed,
    Failed,
}

/// A document after text extraction.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub name: String,
    pub format: DocumentFormat,
    pub text: String,
    pub ingested_at: DateTime<Utc>,
    pub status: DocumentStatus,
    /// SHA-256 of the raw bytes, hex encoded.
    pub content_hash: String,
}

impl Document {
    /// Create a pending document whose id is derived from its raw bytes.
    pub fn pending(name: &str, format: DocumentFormat, raw: &[u8]) -> Self {
        let content_hash = sha256_hex(raw);
        Self {
            id: document_id_for(&content_hash),
            name: name.to_string(),
            format,
            text: String::new(),
            ingested_at: Utc::now(),
            status: DocumentStatus::Pending,
            content_hash,
        }
    }
}

/// A bounded passage of a document's text, the unit of retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub ordinal: usize,
    pub text: String,
    /// Character offset of the span's first char in the extracted text.
    pub start: usize,
    /// Character offset one past the span's last char.
    pub end: usize,
    pub hash: String,
}

/// A vector associated 1:1 with a chunk.
#[derive(Debug, Clone)]
pub struct Embedding {
    pub chunk_id: String,
    pub vector: Vec<f32>,
    pub model: String,
}

/// A chunk paired with its relevance to a query.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f32,
}

impl ScoredChunk {
    pub fn to_ref(&self) -> ChunkRef {
        ChunkRef {
            chunk_id: self.chunk.id.clone(),
            document_id: self.chunk.document_id.clone(),
            ordinal: self.chunk.ordinal,
            score: self.score,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Provenance of an assistant answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRef {
    pub chunk_id: String,
    pub document_id: String,
    pub ordinal: usize,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub grounding: Vec<ChunkRef>,
    /// Set on assistant turns that report a failed generation.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub error: bool,
}

impl ConversationTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            timestamp: Utc::now(),
            grounding: Vec::new(),
            error: false,
        }
    }

    pub fn assistant(text: impl Into<String>, grounding: Vec<ChunkRef>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
            timestamp: Utc::now(),
            grounding,
            error: false,
        }
    }

    pub fn assistant_error(err: &Error) -> Self {
        Self {
            role: Role::Assistant,
            text: format!("Sorry, I could not answer that ({err})."),
            timestamp: Utc::now(),
            grounding: Vec::new(),
            error: true,
        }
    }
}

/// Persisted metadata of a document that is active in a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMeta {
    pub id: String,
    pub name: String,
    pub format: DocumentFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_path: Option<String>,
    pub ingested_at: DateTime<Utc>,
    pub chunk_count: usize,
}

/// An ordered, append-only conversation plus its active documents.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    turns: Vec<ConversationTurn>,
    pub documents: Vec<DocumentMeta>,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            created_at: Utc::now(),
            turns: Vec::new(),
            documents: Vec::new(),
        }
    }

    /// Rebuild a session from persisted parts, preserving turn order.
    pub fn restore(
        id: impl Into<String>,
        created_at: DateTime<Utc>,
        turns: Vec<ConversationTurn>,
        documents: Vec<DocumentMeta>,
    ) -> Self {
        Self {
            id: id.into(),
            created_at,
            turns,
            documents,
        }
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn push_turn(&mut self, turn: ConversationTurn) {
        self.turns.push(turn);
    }

    pub fn document_ids(&self) -> Vec<String> {
        self.documents.iter().map(|d| d.id.clone()).collect()
    }

    /// Insert or replace the metadata of an active document.
    pub fn upsert_document(&mut self, meta: DocumentMeta) {
        match self.documents.iter_mut().find(|d| d.id == meta.id) {
            Some(existing) => *existing = meta,
            None => self.documents.push(meta),
        }
    }

    /// Drop a document from the active set. Returns whether it was present.
    pub fn remove_document(&mut self, document_id: &str) -> bool {
        let before = self.documents.len();
        self.documents.retain(|d| d.id != document_id);
        self.documents.len() != before
    }
}

/// Unit in which context budgets are measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BudgetUnit {
    #[default]
    Chars,
    /// Approximate tokens at 4 chars per token, rounded up.
    Tokens,
}

impl BudgetUnit {
    pub fn measure(&self, text: &str) -> usize {
        let chars = text.chars().count();
        match self {
            BudgetUnit::Chars => chars,
            BudgetUnit::Tokens => chars.div_ceil(4),
        }
    }
}

/// The per-request selection of turns and chunks handed to a generator.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextWindow {
    pub message: String,
    /// Admitted turns in chronological order.
    pub turns: Vec<ConversationTurn>,
    /// Admitted chunks, most relevant first.
    pub chunks: Vec<ScoredChunk>,
    pub budget: usize,
    pub used: usize,
    pub unit: BudgetUnit,
}

impl ContextWindow {
    pub fn residual(&self) -> usize {
        self.budget - self.used
    }

    pub fn grounding(&self) -> Vec<ChunkRef> {
        self.chunks.iter().map(ScoredChunk::to_ref).collect()
    }

    /// Render the window as a single prompt string.
    pub fn render_prompt(&self) -> String {
        let mut out = String::new();
        if !self.chunks.is_empty() {
            out.push_str("### Reference passages\n");
            for (i, sc) in self.chunks.iter().enumerate() {
                out.push_str(&format!("[{}] {}\n", i + 1, sc.chunk.text));
            }
            out.push('\n');
        }
        if !self.turns.is_empty() {
            out.push_str("### Conversation\n");
            for turn in &self.turns {
                let who = match turn.role {
                    Role::User => "User",
                    Role::Assistant => "Assistant",
                };
                out.push_str(&format!("{}: {}\n", who, turn.text));
            }
            out.push('\n');
        }
        out.push_str(&format!("User: {}\nAssistant:", self.message));
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Ingest,
    Embed,
    Retrieve,
    Generate,
}

impl TaskKind {
    /// Cheap tasks may run ahead of queued expensive ones.
    pub fn is_cheap(&self) -> bool {
        matches!(self, TaskKind::Retrieve)
    }

    /// Ingestion work is what the governor defers and rejects.
    pub fn is_ingestion(&self) -> bool {
        matches!(self, TaskKind::Ingest | TaskKind::Embed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Ingest => "ingest",
            TaskKind::Embed => "embed",
            TaskKind::Retrieve => "retrieve",
            TaskKind::Generate => "generate",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Queued,
    Running,
    Done,
    Cancelled,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Done | TaskState::Cancelled | TaskState::Failed
        )
    }

    /// Whether `self → next` is a legal, forward-only transition.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (TaskState::Queued, TaskState::Running)
                | (TaskState::Queued, TaskState::Cancelled)
                | (TaskState::Running, TaskState::Done)
                | (TaskState::Running, TaskState::Failed)
                | (TaskState::Running, TaskState::Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Done => "done",
            TaskState::Cancelled => "cancelled",
            TaskState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

pub fn document_id_for(content_hash: &str) -> String {
    Uuid::new_v5(&ID_NAMESPACE, content_hash.as_bytes()).to_string()
}

pub fn chunk_id_for(document_id: &str, ordinal: usize) -> String {
    Uuid::new_v5(
        &ID_NAMESPACE,
        format!("{document_id}#{ordinal}").as_bytes(),
    )
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_from_filename() {
        assert_eq!(
            DocumentFormat::from_filename("notes.TXT").unwrap(),
            DocumentFormat::Text
        );
        assert_eq!(
            DocumentFormat::from_filename("a.b.docx").unwrap(),
            DocumentFormat::Docx
        );
        assert!(matches!(
            DocumentFormat::from_filename("image.png"),
            Err(Error::UnsupportedFormat(_))
        ));
        assert!(matches!(
            DocumentFormat::from_filename("README"),
            Err(Error::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn document_id_is_content_derived() {
        let a = Document::pending("a.txt", DocumentFormat::Text, b"same bytes");
        let b = Document::pending("b.txt", DocumentFormat::Text, b"same bytes");
        let c = Document::pending("a.txt", DocumentFormat::Text, b"other bytes");
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
        assert_eq!(a.status, DocumentStatus::Pending);
    }

    #[test]
    fn task_transitions_are_monotonic() {
        use TaskState::*;
        assert!(Queued.can_transition_to(Running));
        assert!(Queued.can_transition_to(Cancelled));
        assert!(Running.can_transition_to(Done));
        assert!(!Running.can_transition_to(Queued));
        assert!(!Done.can_transition_to(Running));
        assert!(!Cancelled.can_transition_to(Running));
        assert!(!Queued.can_transition_to(Done));
    }

    #[test]
    fn budget_units() {
        assert_eq!(BudgetUnit::Chars.measure("héllo"), 5);
        assert_eq!(BudgetUnit::Tokens.measure("héllo"), 2);
        assert_eq!(BudgetUnit::Tokens.measure(""), 0);
    }

    #[test]
    fn session_documents_upsert_and_remove() {
        let meta = |id: &str, chunks: usize| DocumentMeta {
            id: id.to_string(),
            name: format!("{id}.txt"),
            format: DocumentFormat::Text,
            source_path: None,
            ingested_at: Utc::now(),
            chunk_count: chunks,
        };
        let mut session = Session::new("s");
        session.upsert_document(meta("a", 1));
        session.upsert_document(meta("b", 1));
        session.upsert_document(meta("a", 4));
        assert_eq!(session.document_ids(), vec!["a", "b"]);
        assert_eq!(session.documents[0].chunk_count, 4);

        assert!(session.remove_document("a"));
        assert!(!session.remove_document("a"));
        assert_eq!(session.document_ids(), vec!["b"]);
    }

    #[test]
    fn turn_serde_skips_defaults() {
        let turn = ConversationTurn::user("hi");
        let json = serde_json::to_string(&turn).unwrap();
        assert!(!json.contains("grounding"));
        assert!(!json.contains("error"));
        let back: ConversationTurn = serde_json::from_str(&json).unwrap();
        assert_eq!(back, turn);
    }
}
