//! Task progress reporting.
//!
//! Renders the scheduler's [`TaskEvent`] stream so users see what is
//! queued, running, and finished while the prompt stays responsive.
//! Progress is emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::scheduler::TaskEvent;

/// Reports task events. Implementations write to stderr (human or JSON).
pub trait TaskProgressReporter: Send + Sync {
    fn report(&self, event: &TaskEvent);
}

/// Human-friendly progress on stderr: `ingest#3  running  40%  extracting notes.md`.
pub struct StderrProgress;

impl StderrProgress {
    fn line(event: &TaskEvent) -> String {
        let mut line = format!("{}#{}  {}", event.kind, event.task, event.state);
        if let Some(fraction) = event.progress {
            line.push_str(&format!("  {:>3.0}%", fraction * 100.0));
        }
        if let Some(detail) = &event.detail {
            line.push_str("  ");
            line.push_str(detail);
        }
        if let Some(parent) = event.parent {
            line.push_str(&format!("  (after #{parent})"));
        }
        line.push('\n');
        line
    }
}

impl TaskProgressReporter for StderrProgress {
    fn report(&self, event: &TaskEvent) {
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(Self::line(event).as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl TaskProgressReporter for JsonProgress {
    fn report(&self, event: &TaskEvent) {
        let obj = serde_json::json!({
            "event": "task",
            "task": event,
        });
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl TaskProgressReporter for NoProgress {
    fn report(&self, _event: &TaskEvent) {}
}

/// Forward events from `events` to `reporter` until the channel closes.
pub fn spawn_reporter(
    mut events: broadcast::Receiver<TaskEvent>,
    reporter: Box<dyn TaskProgressReporter>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => reporter.report(&event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::debug!(missed, "progress reporter lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn TaskProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
