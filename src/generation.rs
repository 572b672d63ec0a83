//! Answer generation.
//!
//! A [`Generator`] turns a composed [`ContextWindow`] into reply text.
//! The backend is chosen once at startup by [`create_generator`]; every
//! call goes through [`run_generation`], which adds the timeout and the
//! cancellation race so no backend has to implement either.
//!
//! Two offline backends ship:
//!
//! - [`ExtractiveGenerator`] answers from the admitted passages, quoting
//!   the sentences that share the most vocabulary with the question, and
//!   falls back to a short conversational reply when nothing was retrieved.
//! - [`DisabledGenerator`] always fails with `ModelUnavailable`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;

use hearth_core::embedding::tokenize;
use hearth_core::models::{ContextWindow, Role};
use hearth_core::{Error, Result};

use crate::config::GenerationConfig;
use crate::scheduler::CancelToken;

/// Maximum sentences quoted by the extractive backend.
const MAX_QUOTED_SENTENCES: usize = 3;
/// Character cap for a quoted passage when no sentence matches.
const PASSAGE_PREVIEW_CHARS: usize = 300;

#[async_trait]
pub trait Generator: Send + Sync {
    fn name(&self) -> &str;

    /// Produce a reply for `window`. Implementations must not return
    /// partial text; errors are reported through `Error`.
    async fn generate(&self, window: &ContextWindow) -> Result<String>;
}

/// Build the generator named by `config.provider`.
pub fn create_generator(config: &GenerationConfig) -> anyhow::Result<Arc<dyn Generator>> {
    match config.provider.as_str() {
        "extractive" => Ok(Arc::new(ExtractiveGenerator)),
        "disabled" => Ok(Arc::new(DisabledGenerator)),
        other => bail!("Unknown generation provider: {}", other),
    }
}

/// Run `generator` with a deadline, racing it against `cancel`.
///
/// Yields `Cancelled` if the token fires first (no partial text is kept)
/// and `GenerationTimeout` if the deadline passes first.
pub async fn run_generation(
    generator: &dyn Generator,
    window: &ContextWindow,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<String> {
    cancel.check()?;
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        outcome = tokio::time::timeout(timeout, generator.generate(window)) => match outcome {
            Ok(result) => result,
            Err(_) => Err(Error::GenerationTimeout(timeout)),
        },
    }
}

pub struct DisabledGenerator;

#[async_trait]
impl Generator for DisabledGenerator {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn generate(&self, _window: &ContextWindow) -> Result<String> {
        Err(Error::ModelUnavailable(
            "generation provider is disabled".to_string(),
        ))
    }
}

/// Offline, grounded answers assembled from retrieved passages.
pub struct ExtractiveGenerator;

#[async_trait]
impl Generator for ExtractiveGenerator {
    fn name(&self) -> &str {
        "extractive"
    }

    async fn generate(&self, window: &ContextWindow) -> Result<String> {
        Ok(extractive_answer(window))
    }
}

fn extractive_answer(window: &ContextWindow) -> String {
    let query: HashSet<String> = tokenize(&window.message).collect();

    if !window.chunks.is_empty() {
        let mut scored: Vec<(usize, usize, usize, &str)> = Vec::new();
        for (ci, sc) in window.chunks.iter().enumerate() {
            for (si, sentence) in split_sentences(&sc.chunk.text).into_iter().enumerate() {
                let overlap = tokenize(sentence).filter(|t| query.contains(t)).count();
                if overlap > 0 {
                    scored.push((overlap, ci, si, sentence));
                }
            }
        }
        // most overlap first, then passage rank, then reading order
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));
        let mut picked: Vec<(usize, usize, &str)> = scored
            .into_iter()
            .take(MAX_QUOTED_SENTENCES)
            .map(|(_, ci, si, s)| (ci, si, s))
            .collect();
        picked.sort();

        if !picked.is_empty() {
            let mut answer = String::from("From your documents:\n");
            for (ci, _, sentence) in picked {
                answer.push_str(&format!("- {} [{}]\n", sentence, ci + 1));
            }
            return answer.trim_end().to_string();
        }

        let top = &window.chunks[0].chunk.text;
        let preview: String = top.chars().take(PASSAGE_PREVIEW_CHARS).collect();
        let ellipsis = if top.chars().count() > PASSAGE_PREVIEW_CHARS {
            "..."
        } else {
            ""
        };
        return format!("The closest passage I have is:\n\n{preview}{ellipsis} [1]");
    }

    conversational_fallback(window, &query)
}

fn conversational_fallback(window: &ContextWindow, query: &HashSet<String>) -> String {
    let message = window.message.to_lowercase();
    let greeting = message
        .split(|c: char| !c.is_alphanumeric())
        .any(|w| matches!(w, "hello" | "hi" | "hey"));
    if greeting {
        return "Hello! Load a document and ask me about it, or just keep chatting.".to_string();
    }

    let last_topic = window
        .turns
        .iter()
        .rev()
        .find(|t| t.role == Role::User && t.text.chars().count() > 10)
        .map(|t| t.text.chars().take(50).collect::<String>());
    if let Some(topic) = last_topic {
        return format!(
            "I don't have anything on that in the loaded documents. \
             Earlier we were discussing: \"{topic}\". Could you rephrase?"
        );
    }

    if query.is_empty() {
        return "Could you say a bit more about what you need?".to_string();
    }
    "I don't have any loaded documents that cover that yet. \
     Load one with /load <path> and ask again."
        .to_string()
}

/// Sentences of `text`, split after `.`, `!` or `?` followed by whitespace.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if matches!(c, '.' | '!' | '?') {
            if let Some(&(j, next)) = chars.peek() {
                if next.is_whitespace() {
                    let s = text[start..i + c.len_utf8()].trim();
                    if !s.is_empty() {
                        out.push(s);
                    }
                    start = j;
                }
            }
        }
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        out.push(tail);
    }
    out
}
