//! # Hearth
//!
//! The retrieval and resource-governed execution core of a fully offline
//! assistant.
//!
//! Hearth ingests local documents (text, Markdown, PDF, DOCX), chunks and
//! embeds them into an in-memory retrieval index, and answers chat
//! messages from a context window composed of recent conversation and the
//! most relevant passages, all within a fixed size budget. Expensive work
//! runs on a background scheduler; a resource governor keeps memory under
//! a ceiling by evicting low-relevance documents and refusing new
//! ingestion when it must.
//!
//! ## Architecture
//!
//! ```text
//!                    ┌──────────────┐
//!  interactive ────▶ │  Assistant   │ ──── TaskHandle / TaskEvent ────▶ caller
//!     thread         └──────┬───────┘
//!                           ▼
//!                    ┌──────────────┐     admit?     ┌──────────────┐
//!                    │  Scheduler   │ ◀────────────▶ │   Governor   │
//!                    └──────┬───────┘                └──────┬───────┘
//!            ┌──────────────┼──────────────┐                │ evict
//!            ▼              ▼              ▼                ▼
//!      ┌───────────┐  ┌───────────┐  ┌───────────┐   ┌───────────┐
//!      │ Processor │─▶│   Index   │◀─│ Composer  │   │   Index   │
//!      └───────────┘  └───────────┘  └─────┬─────┘   └───────────┘
//!                                          ▼
//!                                    ┌───────────┐   ┌───────────┐
//!                                    │ Generator │──▶│  Session  │
//!                                    └───────────┘   │   Store   │
//!                                                    └───────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`assistant`] | Facade owning every component; the only API the CLI uses |
//! | [`config`] | TOML configuration parsing and validation |
//! | [`extract`] | Per-format text extraction adapters |
//! | [`processor`] | Bytes → processed document → chunks |
//! | [`embedding`] | Embedding backend selection |
//! | [`generation`] | Generation backends, timeout and cancellation |
//! | [`scheduler`] | Background task scheduler |
//! | [`governor`] | Memory sampling, eviction and admission |
//! | [`store`] | Durable JSON-lines session store |
//! | [`progress`] | Task event reporters for the CLI |
//!
//! Pure logic (models, chunking, the index, context composition) lives in
//! the [`hearth_core`] crate and is re-exported here.

pub mod assistant;
pub mod config;
pub mod embedding;
pub mod extract;
pub mod generation;
pub mod governor;
pub mod processor;
pub mod progress;
pub mod scheduler;
pub mod store;

pub use hearth_core;
pub use hearth_core::{Error, Result};

pub use assistant::{Assistant, AssistantBuilder};
