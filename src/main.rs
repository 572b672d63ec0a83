//! # Hearth CLI (`hearth`)
//!
//! The `hearth` binary is the interactive thread of the assistant: it
//! enqueues work on the [`Assistant`] and renders results and progress,
//! never doing expensive work itself.
//!
//! ## Usage
//!
//! ```bash
//! hearth --config ./config/hearth.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `hearth ask "<message>"` | Load documents (optional) and answer one message |
//! | `hearth chat` | Interactive session with `/load`, `/remove`, `/search`, `/cancel`, `/docs`, `/tasks`, `/quit` |
//! | `hearth remove <document>` | Drop a document from a session and the index |
//! | `hearth history` | Print a session's conversation |
//! | `hearth sessions` | List stored sessions |
//! | `hearth status` | Show configuration and resource readings |
//!
//! ## Examples
//!
//! ```bash
//! # One-shot question grounded in a document
//! hearth ask "How long should I boil water?" --doc ./manuals/water.pdf
//!
//! # Interactive chat in the "kitchen" session, JSON progress on stderr
//! hearth chat --session kitchen --progress json
//! ```
//!
//! Logs go to stderr; set `HEARTH_LOG` (e.g. `HEARTH_LOG=hearth=debug`) to
//! see more than warnings.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use hearth::config;
use hearth::hearth_core::models::{ChunkRef, ConversationTurn, DocumentMeta, Role};
use hearth::progress::{format_number, spawn_reporter, ProgressMode};
use hearth::scheduler::{TaskHandle, TaskOutput};
use hearth::Assistant;

/// Hearth: an offline assistant that answers from your own documents.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. A missing file means built-in defaults.
#[derive(Parser)]
#[command(
    name = "hearth",
    about = "Hearth: an offline assistant that answers from your own documents",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/hearth.toml")]
    config: PathBuf,

    /// Task progress on stderr. Defaults to `human` on a terminal, else `off`.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a single message.
    ///
    /// Documents given with `--doc` are ingested and indexed first; the
    /// exchange is stored in the session like any chat turn.
    Ask {
        message: String,

        #[arg(long, default_value = "default")]
        session: String,

        /// Document to load before answering (repeatable).
        #[arg(long = "doc")]
        docs: Vec<PathBuf>,
    },

    /// Start an interactive chat session.
    ///
    /// Lines starting with `/` are commands; anything else is a message.
    /// Replies print as they complete, so the prompt stays usable while
    /// documents load.
    Chat {
        #[arg(long, default_value = "default")]
        session: String,
    },

    /// Print the conversation stored for a session.
    History {
        #[arg(long, default_value = "default")]
        session: String,

        /// Output as JSON lines instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Remove a document from a session and from the index.
    ///
    /// `document` is a file name or a prefix of the document id.
    Remove {
        document: String,

        #[arg(long, default_value = "default")]
        session: String,
    },

    /// List stored sessions, most recent first.
    Sessions,

    /// Show configuration, backends and current resource readings.
    Status,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("HEARTH_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let cfg = config::load_config_or_default(&cli.config)?;
    let progress = cli.progress.unwrap_or_else(ProgressMode::default_for_tty);

    let assistant = Assistant::start(cfg)?;
    let reporter = spawn_reporter(assistant.subscribe(), progress.reporter());

    let outcome = match cli.command {
        Commands::Ask {
            message,
            session,
            docs,
        } => run_ask(&assistant, &session, &message, &docs).await,
        Commands::Chat { session } => run_chat(&assistant, &session).await,
        Commands::History { session, json } => run_history(&assistant, &session, json),
        Commands::Remove { document, session } => {
            run_remove(&assistant, &session, &document).await
        }
        Commands::Sessions => run_sessions(&assistant),
        Commands::Status => run_status(&assistant),
    };

    assistant.shutdown().await;
    reporter.abort();
    outcome
}

async fn run_ask(
    assistant: &Assistant,
    session: &str,
    message: &str,
    docs: &[PathBuf],
) -> anyhow::Result<()> {
    let opened = assistant.open_session(session)?;
    let mut pending: Vec<TaskHandle> = opened.restoring;
    for doc in docs {
        let handle = assistant
            .submit_document_path(doc, Some(session))
            .with_context(|| format!("Cannot load {}", doc.display()))?;
        pending.push(handle);
    }
    for handle in pending {
        load_to_completion(assistant, handle).await?;
    }

    let handle = assistant.submit_message(session, message)?;
    match assistant.wait(handle).await? {
        TaskOutput::Reply(turn) => {
            print_reply(assistant, &turn);
            Ok(())
        }
        other => bail!("unexpected task output: {:?}", other),
    }
}

/// Wait for an ingest task and the embed task it spawns.
async fn load_to_completion(assistant: &Assistant, handle: TaskHandle) -> anyhow::Result<()> {
    match assistant.wait(handle).await? {
        TaskOutput::Ingested {
            document,
            embed_task,
        } => {
            assistant
                .wait(embed_task)
                .await
                .with_context(|| format!("Indexing {} failed", document.name))?;
            Ok(())
        }
        other => bail!("unexpected task output: {:?}", other),
    }
}

async fn run_chat(assistant: &Assistant, session: &str) -> anyhow::Result<()> {
    let opened = assistant.open_session(session)?;
    println!(
        "hearth: session '{}' ({} turns, {} documents). /help for commands.",
        session,
        opened.session.turns().len(),
        opened.session.documents.len()
    );
    for handle in opened.restoring {
        println!("restoring document as {handle}");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(command) = line.strip_prefix('/') {
            let (name, arg) = command
                .split_once(char::is_whitespace)
                .map(|(n, a)| (n, a.trim()))
                .unwrap_or((command, ""));
            match name {
                "quit" | "exit" => break,
                "help" => print_help(),
                "load" => chat_load(assistant, session, arg),
                "remove" => match remove_document(assistant, session, arg).await {
                    Ok(name) => println!("removed {name}"),
                    Err(e) => println!("cannot remove: {e:#}"),
                },
                "search" => chat_search(assistant, arg),
                "cancel" => chat_cancel(assistant, arg),
                "docs" => print_documents(assistant),
                "tasks" => print_tasks(assistant),
                other => println!("unknown command /{other}; try /help"),
            }
            continue;
        }

        match assistant.submit_message(session, line) {
            Ok(handle) => {
                let assistant = assistant.clone();
                tokio::spawn(async move {
                    match assistant.wait(handle).await {
                        Ok(TaskOutput::Reply(turn)) => print_reply(&assistant, &turn),
                        Ok(_) => {}
                        Err(e) => println!("[{handle}] {e}"),
                    }
                });
            }
            Err(e) => println!("cannot send: {e}"),
        }
    }
    Ok(())
}

fn print_help() {
    println!("/load <path>     ingest a document (txt, md, pdf, docx)");
    println!("/remove <doc>    drop a document by name or id prefix");
    println!("/search <query>  show the passages closest to a query");
    println!("/cancel <id>     cancel a queued or running task");
    println!("/docs            list indexed documents");
    println!("/tasks           list tasks");
    println!("/quit            leave");
}

fn chat_load(assistant: &Assistant, session: &str, arg: &str) {
    if arg.is_empty() {
        println!("usage: /load <path>");
        return;
    }
    let path = PathBuf::from(arg);
    match assistant.submit_document_path(&path, Some(session)) {
        Ok(handle) => {
            println!("queued {handle}");
            let assistant = assistant.clone();
            tokio::spawn(async move {
                match load_to_completion(&assistant, handle).await {
                    Ok(()) => println!("loaded {}", path.display()),
                    Err(e) => println!("could not load {}: {e:#}", path.display()),
                }
            });
        }
        Err(e) => println!("cannot load {}: {e}", path.display()),
    }
}

fn chat_search(assistant: &Assistant, query: &str) {
    if query.is_empty() {
        println!("usage: /search <query>");
        return;
    }
    let k = assistant.config().context.top_k;
    match assistant.submit_search(query, k, None) {
        Ok(handle) => {
            let assistant = assistant.clone();
            tokio::spawn(async move {
                match assistant.wait(handle).await {
                    Ok(TaskOutput::Hits(hits)) if hits.is_empty() => println!("no matches"),
                    Ok(TaskOutput::Hits(hits)) => {
                        let names = document_names(&assistant);
                        for (i, hit) in hits.iter().enumerate() {
                            let name = names
                                .get(&hit.chunk.document_id)
                                .map(String::as_str)
                                .unwrap_or("?");
                            let preview: String = hit.chunk.text.chars().take(120).collect();
                            println!(
                                "{}. [{:.3}] {} #{}: {}",
                                i + 1,
                                hit.score,
                                name,
                                hit.chunk.ordinal,
                                preview.replace('\n', " ")
                            );
                        }
                    }
                    Ok(_) => {}
                    Err(e) => println!("search failed: {e}"),
                }
            });
        }
        Err(e) => println!("cannot search: {e}"),
    }
}

fn chat_cancel(assistant: &Assistant, arg: &str) {
    let id = arg.trim_start_matches('#');
    let Some(handle) = id.parse::<u64>().ok().and_then(|id| assistant.handle(id)) else {
        println!("no such task: {arg}");
        return;
    };
    match assistant.cancel(handle) {
        Ok(state) => println!("{handle}: {state}"),
        Err(e) => println!("{handle}: {e}"),
    }
}

fn document_names(assistant: &Assistant) -> HashMap<String, String> {
    assistant
        .documents()
        .into_iter()
        .map(|d| (d.id, d.name))
        .collect()
}

fn print_reply(assistant: &Assistant, turn: &ConversationTurn) {
    println!("{}", turn.text);
    if !turn.grounding.is_empty() {
        let names = document_names(assistant);
        println!();
        for (i, source) in turn.grounding.iter().enumerate() {
            println!("  [{}] {}", i + 1, describe_source(&names, source));
        }
    }
}

fn describe_source(names: &HashMap<String, String>, source: &ChunkRef) -> String {
    let name = names
        .get(&source.document_id)
        .cloned()
        .unwrap_or_else(|| source.document_id.clone());
    format!("{} #{} ({:.2})", name, source.ordinal, source.score)
}

fn print_documents(assistant: &Assistant) {
    let docs = assistant.documents();
    if docs.is_empty() {
        println!("no documents loaded");
        return;
    }
    for doc in docs {
        println!(
            "{}  {:>6} chunks  relevance {:.2}  {}",
            &doc.id[..8.min(doc.id.len())],
            doc.chunk_count,
            doc.relevance,
            doc.name
        );
    }
}

fn print_tasks(assistant: &Assistant) {
    for task in assistant.tasks() {
        let deferred = if task.deferred { "  (deferred)" } else { "" };
        println!("{}  {}{}", task.handle, task.state, deferred);
    }
    println!("{}", describe_stats(assistant));
}

fn describe_stats(assistant: &Assistant) -> String {
    let stats = assistant.stats();
    let average = stats
        .average_run_ms
        .map(|ms| format!(", avg {ms:.0} ms"))
        .unwrap_or_default();
    format!(
        "{} queued, {} running, {} done, {} failed, {} cancelled{}",
        stats.queued, stats.running, stats.done, stats.failed, stats.cancelled, average
    )
}

/// Resolve `query` (a file name or id prefix) among the session's documents.
fn find_document(documents: &[DocumentMeta], query: &str) -> anyhow::Result<DocumentMeta> {
    if query.is_empty() {
        bail!("usage: /remove <name or id prefix>");
    }
    let matches: Vec<&DocumentMeta> = documents
        .iter()
        .filter(|d| d.name == query || d.id.starts_with(query))
        .collect();
    match matches.as_slice() {
        [one] => Ok((*one).clone()),
        [] => bail!("no document '{}' in this session", query),
        _ => bail!("'{}' matches {} documents; use more of the id", query, matches.len()),
    }
}

async fn remove_document(assistant: &Assistant, session: &str, query: &str) -> anyhow::Result<String> {
    let documents = assistant
        .session_documents(session)
        .with_context(|| format!("Cannot read session '{}'", session))?;
    let doc = find_document(&documents, query)?;
    assistant.remove_document(session, &doc.id).await?;
    Ok(doc.name)
}

async fn run_remove(assistant: &Assistant, session: &str, document: &str) -> anyhow::Result<()> {
    let name = remove_document(assistant, session, document).await?;
    println!("Removed {} from session '{}'.", name, session);
    Ok(())
}

fn run_history(assistant: &Assistant, session: &str, json: bool) -> anyhow::Result<()> {
    let turns = assistant
        .history(session)
        .with_context(|| format!("No history for session '{}'", session))?;
    for turn in turns {
        if json {
            println!("{}", serde_json::to_string(&turn)?);
            continue;
        }
        let who = match turn.role {
            Role::User => "you",
            Role::Assistant if turn.error => "hearth (error)",
            Role::Assistant => "hearth",
        };
        println!(
            "[{}] {}: {}",
            turn.timestamp.format("%Y-%m-%d %H:%M"),
            who,
            turn.text
        );
    }
    Ok(())
}

fn run_sessions(assistant: &Assistant) -> anyhow::Result<()> {
    let sessions = assistant.sessions()?;
    if sessions.is_empty() {
        println!("No sessions yet.");
        return Ok(());
    }
    for s in sessions {
        println!(
            "{:<24} {}  {:>10} bytes",
            s.id,
            s.modified.format("%Y-%m-%d %H:%M"),
            format_number(s.bytes)
        );
    }
    Ok(())
}

fn run_status(assistant: &Assistant) -> anyhow::Result<()> {
    let cfg = assistant.config();
    let reading = assistant.reading();
    println!("data dir:        {}", cfg.storage.data_dir.display());
    println!(
        "embedding:       {} ({} dims)",
        cfg.embedding.provider, cfg.embedding.dims
    );
    println!("generation:      {}", assistant.generator_name());
    println!(
        "memory:          {:.1} MB (soft {} MB, ceiling {} MB)",
        reading.rss_mb, cfg.resources.memory_soft_threshold_mb, cfg.resources.memory_ceiling_mb
    );
    println!(
        "index:           {} / {} chunks, ~{} bytes",
        format_number(reading.index_chunks as u64),
        format_number(cfg.resources.index_capacity_chunks as u64),
        format_number(reading.index_bytes as u64)
    );
    println!(
        "context budget:  {} {} (top {} chunks, last {} turns)",
        cfg.context.budget, cfg.context.unit, cfg.context.top_k, cfg.context.turn_window
    );
    println!("tasks:           {}", describe_stats(assistant));
    println!(
        "queue limit:     {} (history {})",
        cfg.scheduler.max_queue, cfg.scheduler.history_limit
    );
    println!("sessions:        {}", assistant.sessions()?.len());
    Ok(())
}
