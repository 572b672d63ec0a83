//! The assistant facade.
//!
//! [`Assistant`] owns every long-lived component (index, processor,
//! composer, generator, scheduler, governor, session store) and is the
//! only thing the interactive thread talks to. Every operation that does
//! real work returns a [`TaskHandle`] immediately; the work itself runs
//! on the scheduler's workers.
//!
//! # Pipelines
//!
//! ```text
//! submit_document ──▶ Ingest (extract + chunk) ──▶ Embed (index.add) ──▶ session documents
//! submit_message  ──▶ Generate: lock session ─▶ append user turn ─▶ compose ─▶ generate ─▶ append reply
//! submit_search   ──▶ Retrieve (index.query)
//! ```
//!
//! Session file I/O, query embedding and index writes all go through
//! `spawn_blocking`, never directly on an async worker.
//!
//! The user turn is written before generation starts, so a crash mid-reply
//! loses at most the reply. Cancellation never leaves an assistant turn;
//! any other generation failure leaves an error turn.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use hearth_core::compose::ContextComposer;
use hearth_core::embedding::Embedder;
use hearth_core::index::flat::FlatIndex;
use hearth_core::index::{IndexedDocument, VectorIndex};
use hearth_core::models::{ConversationTurn, DocumentFormat, DocumentMeta, Session, TaskKind, TaskState};
use hearth_core::{Error, Result};

use crate::config::Config;
use crate::embedding::create_embedder;
use crate::extract::ExtractorRegistry;
use crate::generation::{create_generator, run_generation, Generator};
use crate::governor::{MemorySampler, ProcSampler, ResourceGovernor, ResourceReading};
use crate::processor::{DocumentProcessor, ProcessedDocument};
use crate::scheduler::{
    Scheduler, SchedulerStats, TaskContext, TaskEvent, TaskHandle, TaskInfo, TaskOutput, TaskResult,
};
use crate::store::{validate_session_id, SessionStore, SessionSummary};

/// Optional overrides for [`Assistant::start`].
pub struct AssistantBuilder {
    config: Config,
    sampler: Option<Arc<dyn MemorySampler>>,
    embedder: Option<Arc<dyn Embedder>>,
    generator: Option<Arc<dyn Generator>>,
    max_document_bytes: Option<usize>,
}

impl AssistantBuilder {
    pub fn sampler(mut self, sampler: Arc<dyn MemorySampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn generator(mut self, generator: Arc<dyn Generator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn max_document_bytes(mut self, max: usize) -> Self {
        self.max_document_bytes = Some(max);
        self
    }

    /// Wire the components and start the workers and the governor monitor.
    /// Must be called inside a tokio runtime.
    pub fn build(self) -> anyhow::Result<Assistant> {
        let config = self.config;
        let embedder = match self.embedder {
            Some(embedder) => embedder,
            None => create_embedder(&config.embedding)?,
        };
        let generator = match self.generator {
            Some(generator) => generator,
            None => create_generator(&config.generation)?,
        };
        let sampler = self.sampler.unwrap_or_else(|| Arc::new(ProcSampler));
        let embedder_name = embedder.model_name().to_string();

        let index: Arc<dyn VectorIndex> = Arc::new(FlatIndex::new(
            embedder,
            config.resources.index_capacity_chunks,
        ));
        let mut processor =
            DocumentProcessor::new(ExtractorRegistry::with_defaults(), config.chunking.params());
        if let Some(max) = self.max_document_bytes {
            processor = processor.with_max_bytes(max);
        }
        let composer = ContextComposer::new(Arc::clone(&index), config.context.compose_params());
        let store = SessionStore::open(config.storage.sessions_dir()).with_context(|| {
            format!(
                "Failed to open session store at {}",
                config.storage.sessions_dir().display()
            )
        })?;

        let governor = Arc::new(ResourceGovernor::new(
            &config.resources,
            sampler,
            Arc::clone(&index),
        ));
        let monitor = governor.spawn_monitor(config.resources.sample_interval());
        let scheduler = Scheduler::start(&config.scheduler, Some(Arc::clone(&governor)));

        tracing::info!(
            embedder = %embedder_name,
            generator = generator.name(),
            workers = scheduler.worker_count(),
            data_dir = %config.storage.data_dir.display(),
            "assistant started"
        );

        Ok(Assistant {
            shared: Arc::new(Shared {
                config,
                index,
                processor,
                composer,
                generator,
                store,
                governor,
                scheduler,
                monitor: Mutex::new(Some(monitor)),
            }),
        })
    }
}

struct Shared {
    config: Config,
    index: Arc<dyn VectorIndex>,
    processor: DocumentProcessor,
    composer: ContextComposer,
    generator: Arc<dyn Generator>,
    store: SessionStore,
    governor: Arc<ResourceGovernor>,
    scheduler: Scheduler,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

/// Result of [`Assistant::open_session`].
#[derive(Debug)]
pub struct OpenedSession {
    pub session: Session,
    /// Ingestion tasks re-submitted for persisted documents missing from the index.
    pub restoring: Vec<TaskHandle>,
}

enum Source {
    Bytes(Vec<u8>),
    Path(PathBuf),
}

/// Cloneable handle to a running assistant.
#[derive(Clone)]
pub struct Assistant {
    shared: Arc<Shared>,
}

impl Assistant {
    pub fn builder(config: Config) -> AssistantBuilder {
        AssistantBuilder {
            config,
            sampler: None,
            embedder: None,
            generator: None,
            max_document_bytes: None,
        }
    }

    /// Start with the backends named in `config`.
    pub fn start(config: Config) -> anyhow::Result<Self> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Queue ingestion of an in-memory document.
    ///
    /// The format comes from `filename`'s extension; an unsupported one
    /// fails here with `UnsupportedFormat` and no task is created. When
    /// `session` is given, the document is recorded in that session once
    /// indexed.
    pub fn submit_document(
        &self,
        bytes: Vec<u8>,
        filename: &str,
        session: Option<&str>,
    ) -> Result<TaskHandle> {
        let format = DocumentFormat::from_filename(filename)?;
        if let Some(id) = session {
            validate_session_id(id)?;
        }
        self.submit_ingest(filename.to_string(), format, Source::Bytes(bytes), session)
    }

    /// Queue ingestion of a file. The file is read on a worker.
    pub fn submit_document_path(&self, path: &Path, session: Option<&str>) -> Result<TaskHandle> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::NotFound(format!("{} is not a file", path.display())))?;
        let format = DocumentFormat::from_filename(&name)?;
        if let Some(id) = session {
            validate_session_id(id)?;
        }
        self.submit_ingest(name, format, Source::Path(path.to_path_buf()), session)
    }

    fn submit_ingest(
        &self,
        name: String,
        format: DocumentFormat,
        source: Source,
        session: Option<&str>,
    ) -> Result<TaskHandle> {
        let shared = Arc::clone(&self.shared);
        let session = session.map(str::to_string);
        self.shared.scheduler.submit(TaskKind::Ingest, move |ctx| {
            ingest_job(shared, ctx, name, format, source, session)
        })
    }

    /// Queue a reply to `text` in session `session_id` (created on first use).
    pub fn submit_message(&self, session_id: &str, text: &str) -> Result<TaskHandle> {
        validate_session_id(session_id)?;
        let text = text.trim();
        if text.is_empty() {
            return Err(Error::CorruptInput("empty message".to_string()));
        }
        let shared = Arc::clone(&self.shared);
        let session_id = session_id.to_string();
        let text = text.to_string();
        self.shared.scheduler.submit(TaskKind::Generate, move |ctx| {
            generate_job(shared, ctx, session_id, text)
        })
    }

    /// Queue a retrieval of the `k` chunks closest to `query`.
    pub fn submit_search(
        &self,
        query: &str,
        k: usize,
        scope: Option<Vec<String>>,
    ) -> Result<TaskHandle> {
        let index = Arc::clone(&self.shared.index);
        let query = query.to_string();
        self.shared.scheduler.submit(TaskKind::Retrieve, move |ctx| async move {
            ctx.check_cancelled()?;
            let hits = blocking(move || index.query(&query, k, scope.as_deref())).await?;
            Ok(TaskOutput::Hits(hits))
        })
    }

    pub fn cancel(&self, handle: TaskHandle) -> Result<TaskState> {
        self.shared.scheduler.cancel(handle)
    }

    pub fn status(&self, handle: TaskHandle) -> Result<TaskState> {
        self.shared.scheduler.status(handle)
    }

    pub async fn wait(&self, handle: TaskHandle) -> TaskResult {
        self.shared.scheduler.wait(handle).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.shared.scheduler.subscribe()
    }

    pub fn handle(&self, id: u64) -> Option<TaskHandle> {
        self.shared.scheduler.handle(id)
    }

    pub fn tasks(&self) -> Vec<TaskInfo> {
        self.shared.scheduler.tasks()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.shared.scheduler.stats()
    }

    /// Load or create a session and restore its documents into the index.
    ///
    /// Persisted documents that are not indexed and whose source file still
    /// exists are re-submitted for ingestion. Documents that cannot be
    /// restored are skipped with a warning.
    pub fn open_session(&self, id: &str) -> Result<OpenedSession> {
        let session = self.shared.store.load_or_create(id)?;
        let mut restoring = Vec::new();
        for doc in &session.documents {
            if self.shared.index.contains_document(&doc.id) {
                continue;
            }
            let Some(path) = doc.source_path.as_deref().map(Path::new) else {
                tracing::debug!(document = %doc.name, "no source path, not restoring");
                continue;
            };
            if !path.exists() {
                tracing::warn!(document = %doc.name, path = %path.display(), "source file is gone, not restoring");
                continue;
            }
            match self.submit_document_path(path, Some(id)) {
                Ok(handle) => restoring.push(handle),
                Err(e) => {
                    tracing::warn!(document = %doc.name, error = %e, "could not restore document");
                }
            }
        }
        Ok(OpenedSession { session, restoring })
    }

    /// Remove a document from the index and from session `session_id`'s
    /// active documents. Returns whether either of them held it.
    pub async fn remove_document(&self, session_id: &str, document_id: &str) -> Result<bool> {
        validate_session_id(session_id)?;
        let lock = self.shared.store.session_lock(session_id);
        let _guard = lock.lock().await;
        let shared = Arc::clone(&self.shared);
        let session_id = session_id.to_string();
        let document_id = document_id.to_string();
        blocking(move || {
            let from_index = shared.index.remove_document(&document_id);
            let mut session = shared.store.load(&session_id)?;
            let from_session = session.remove_document(&document_id);
            if from_session {
                shared.store.set_documents(&session_id, &session.documents)?;
            }
            tracing::info!(
                session_id = %session_id,
                document_id = %document_id,
                from_index,
                from_session,
                "document removed"
            );
            Ok(from_index || from_session)
        })
        .await
    }

    /// Documents recorded as active in session `id`.
    pub fn session_documents(&self, id: &str) -> Result<Vec<DocumentMeta>> {
        Ok(self.shared.store.load(id)?.documents)
    }

    pub fn history(&self, id: &str) -> Result<Vec<ConversationTurn>> {
        Ok(self.shared.store.load(id)?.turns().to_vec())
    }

    pub fn sessions(&self) -> Result<Vec<SessionSummary>> {
        self.shared.store.list()
    }

    /// Documents currently held by the index, oldest first.
    pub fn documents(&self) -> Vec<IndexedDocument> {
        self.shared.index.documents()
    }

    pub fn reading(&self) -> ResourceReading {
        self.shared.governor.sample()
    }

    pub fn generator_name(&self) -> &str {
        self.shared.generator.name()
    }

    /// Stop the workers (queued tasks are cancelled) and the governor monitor.
    pub async fn shutdown(&self) {
        self.shared.scheduler.shutdown().await;
        let monitor = self
            .shared
            .monitor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(monitor) = monitor {
            monitor.abort();
        }
    }
}

/// Run CPU-bound or blocking work off the async workers.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::CorruptState(format!("worker thread failed: {e}")))?
}

async fn read_source(path: &Path, max_bytes: usize) -> Result<Vec<u8>> {
    let read_error = |e: std::io::Error| match e.kind() {
        std::io::ErrorKind::NotFound => Error::NotFound(path.display().to_string()),
        _ => Error::CorruptInput(format!("{}: {e}", path.display())),
    };
    let meta = tokio::fs::metadata(path).await.map_err(read_error)?;
    if !meta.is_file() {
        return Err(Error::CorruptInput(format!(
            "{} is not a regular file",
            path.display()
        )));
    }
    if meta.len() > max_bytes as u64 {
        return Err(Error::CorruptInput(format!(
            "{} is {} bytes, the limit is {max_bytes}",
            path.display(),
            meta.len()
        )));
    }
    tokio::fs::read(path).await.map_err(read_error)
}

async fn ingest_job(
    shared: Arc<Shared>,
    ctx: TaskContext,
    name: String,
    format: DocumentFormat,
    source: Source,
    session: Option<String>,
) -> TaskResult {
    ctx.check_cancelled()?;
    let (raw, source_path) = match source {
        Source::Bytes(bytes) => (bytes, None),
        Source::Path(path) => {
            ctx.progress(0.05, format!("reading {}", path.display()));
            let raw = read_source(&path, shared.processor.max_bytes()).await?;
            let canonical = tokio::fs::canonicalize(&path).await.unwrap_or(path);
            (raw, Some(canonical))
        }
    };

    ctx.check_cancelled()?;
    ctx.progress(0.2, format!("extracting {name}"));
    let processor = shared.processor.clone();
    let doc_name = name.clone();
    let processed =
        blocking(move || processor.process(&doc_name, format, &raw)).await?;
    ctx.check_cancelled()?;

    let meta = processed.meta(source_path.as_deref());
    ctx.progress(0.9, format!("{} chunks", processed.chunks.len()));

    let embed_shared = Arc::clone(&shared);
    let embed_meta = meta.clone();
    let embed_task = ctx.spawn_child(TaskKind::Embed, move |ctx| {
        embed_job(embed_shared, ctx, processed, embed_meta, session)
    })?;
    tracing::info!(
        task_id = ctx.handle().id,
        document_id = %meta.id,
        document = %name,
        chunks = meta.chunk_count,
        "document ingested"
    );
    Ok(TaskOutput::Ingested {
        document: meta,
        embed_task,
    })
}

async fn embed_job(
    shared: Arc<Shared>,
    ctx: TaskContext,
    processed: ProcessedDocument,
    meta: DocumentMeta,
    session: Option<String>,
) -> TaskResult {
    ctx.check_cancelled()?;
    ctx.progress(0.1, format!("embedding {} chunks", processed.chunks.len()));
    let index = Arc::clone(&shared.index);
    let outcome = blocking(move || index.add(&processed.document, &processed.chunks)).await?;
    for doc in &outcome.evicted {
        tracing::info!(document_id = %doc.id, relevance = doc.relevance, "evicted to make room");
    }

    if let Some(id) = session {
        let lock = shared.store.session_lock(&id);
        let _guard = lock.lock().await;
        let store_shared = Arc::clone(&shared);
        let upsert = meta.clone();
        blocking(move || {
            let mut current = store_shared.store.load_or_create(&id)?;
            current.upsert_document(upsert);
            store_shared.store.set_documents(&id, &current.documents)
        })
        .await?;
    }

    Ok(TaskOutput::Indexed {
        document: meta,
        added: outcome.added,
        evicted: outcome.evicted.into_iter().map(|d| d.id).collect(),
    })
}

async fn generate_job(
    shared: Arc<Shared>,
    ctx: TaskContext,
    session_id: String,
    text: String,
) -> TaskResult {
    let lock = shared.store.session_lock(&session_id);
    let _guard = tokio::select! {
        biased;
        _ = ctx.cancel_token().cancelled() => return Err(Error::Cancelled),
        guard = lock.lock() => guard,
    };
    ctx.check_cancelled()?;

    let session = {
        let shared = Arc::clone(&shared);
        let session_id = session_id.clone();
        let user = ConversationTurn::user(text.clone());
        blocking(move || {
            let session = shared.store.load_or_create(&session_id)?;
            shared.store.append(&session_id, &user)?;
            Ok(session)
        })
        .await?
    };

    let outcome = answer(&shared, &ctx, session, text).await;
    match outcome {
        Ok(turn) => {
            append_turn(&shared, &session_id, turn.clone()).await?;
            Ok(TaskOutput::Reply(turn))
        }
        Err(Error::Cancelled) => {
            tracing::info!(task_id = ctx.handle().id, session_id = %session_id, "reply cancelled");
            Err(Error::Cancelled)
        }
        Err(e) => {
            tracing::warn!(
                task_id = ctx.handle().id,
                session_id = %session_id,
                code = e.code(),
                error = %e,
                "generation failed"
            );
            if let Err(store_err) =
                append_turn(&shared, &session_id, ConversationTurn::assistant_error(&e)).await
            {
                tracing::error!(session_id = %session_id, error = %store_err, "could not record error turn");
            }
            Err(e)
        }
    }
}

async fn append_turn(shared: &Arc<Shared>, session_id: &str, turn: ConversationTurn) -> Result<()> {
    let shared = Arc::clone(shared);
    let session_id = session_id.to_string();
    blocking(move || shared.store.append(&session_id, &turn)).await
}

async fn answer(
    shared: &Arc<Shared>,
    ctx: &TaskContext,
    session: Session,
    text: String,
) -> Result<ConversationTurn> {
    ctx.progress(0.1, "retrieving context");
    let composer_shared = Arc::clone(shared);
    let window = blocking(move || {
        composer_shared
            .composer
            .compose(&session, &text, composer_shared.config.context.budget)
    })
    .await?;
    ctx.check_cancelled()?;
    tracing::debug!(
        task_id = ctx.handle().id,
        turns = window.turns.len(),
        chunks = window.chunks.len(),
        used = window.used,
        budget = window.budget,
        "context composed"
    );

    ctx.progress(0.3, format!("generating with {}", shared.generator.name()));
    let reply = run_generation(
        shared.generator.as_ref(),
        &window,
        shared.config.generation.timeout(),
        ctx.cancel_token(),
    )
    .await?;
    ctx.check_cancelled()?;
    Ok(ConversationTurn::assistant(reply, window.grounding()))
}
