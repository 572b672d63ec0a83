//! Bounded context composition.
//!
//! Builds the [`ContextWindow`] handed to a generator: the new user
//! message, then as much recent conversation and retrieved material as
//! fits the size budget.
//!
//! # Selection
//!
//! 1. The new message is always carried. It is not charged against the
//!    budget; the budget covers conversation and retrieved material.
//! 2. Retrieve the `top_k` chunks most relevant to the message.
//! 3. Walk the last `turn_window` turns newest → oldest (error turns are
//!    skipped), then the chunks most → least relevant. Each candidate is
//!    admitted only if it still fits the remaining budget; a candidate
//!    that does not fit is skipped, not truncated.
//! 4. Stop once the budget is exhausted or every candidate was considered.
//!
//! The result satisfies `used <= budget` and is reproducible for a fixed
//! session, message, and index state.

use std::sync::Arc;

use crate::error::Result;
use crate::index::VectorIndex;
use crate::models::{BudgetUnit, ContextWindow, ConversationTurn, ScoredChunk, Session};

/// Default number of recent turns considered for a window.
pub const DEFAULT_TURN_WINDOW: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComposeParams {
    pub top_k: usize,
    pub turn_window: usize,
    pub unit: BudgetUnit,
}

impl Default for ComposeParams {
    fn default() -> Self {
        Self {
            top_k: 5,
            turn_window: DEFAULT_TURN_WINDOW,
            unit: BudgetUnit::Chars,
        }
    }
}

/// Selects conversation and retrieved chunks for one request.
pub struct ContextComposer {
    index: Arc<dyn VectorIndex>,
    params: ComposeParams,
}

impl ContextComposer {
    pub fn new(index: Arc<dyn VectorIndex>, params: ComposeParams) -> Self {
        Self { index, params }
    }

    pub fn params(&self) -> ComposeParams {
        self.params
    }

    /// Compose against the whole index.
    pub fn compose(&self, session: &Session, message: &str, budget: usize) -> Result<ContextWindow> {
        self.compose_scoped(session, message, budget, None)
    }

    /// Compose with retrieval restricted to `scope` document ids.
    pub fn compose_scoped(
        &self,
        session: &Session,
        message: &str,
        budget: usize,
        scope: Option<&[String]>,
    ) -> Result<ContextWindow> {
        let candidates = self.index.query(message, self.params.top_k, scope)?;
        Ok(select(
            message,
            session.turns(),
            candidates,
            budget,
            self.params.unit,
            self.params.turn_window,
        ))
    }
}

/// Greedy admit-if-fits selection over already retrieved candidates.
pub fn select(
    message: &str,
    turns: &[ConversationTurn],
    chunks: Vec<ScoredChunk>,
    budget: usize,
    unit: BudgetUnit,
    turn_window: usize,
) -> ContextWindow {
    let mut used = 0usize;
    let mut admitted_turns = Vec::new();

    for turn in turns.iter().rev().take(turn_window) {
        if used == budget {
            break;
        }
        if turn.error {
            continue;
        }
        let cost = unit.measure(&turn.text);
        if used + cost <= budget {
            used += cost;
            admitted_turns.push(turn.clone());
        }
    }
    admitted_turns.reverse();

    let mut admitted_chunks = Vec::new();
    for sc in chunks {
        if used == budget {
            break;
        }
        let cost = unit.measure(&sc.chunk.text);
        if used + cost <= budget {
            used += cost;
            admitted_chunks.push(sc);
        }
    }

    ContextWindow {
        message: message.to_string(),
        turns: admitted_turns,
        chunks: admitted_chunks,
        budget,
        used,
        unit,
    }
}
