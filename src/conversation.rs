//! Conversation state: turns, sampled candidates, per-token probability
//! traces, and the append-only store that owns them.
//!
//! ## Guarantees
//! - Turns keep creation order; nothing is ever reordered or removed except
//!   by [`ConversationStore::reset`].
//! - At most one assistant turn is in flight. [`ConversationStore::append`]
//!   refuses new turns until it is finished.
//! - Appending a user turn locks every earlier assistant turn to the
//!   candidate that was on screen, so the next upstream prompt is exactly what
//!   the user saw.
//! - Mutations of the in-flight turn go through a [`TurnHandle`] and are
//!   checked by identity, so a handle that outlived a reset does nothing.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::error::{ChatError, Result};
use crate::providers::OpenAIChatMessage;

/// Content written into an assistant turn whose request failed.
pub const ERROR_MESSAGE: &str = "Sorry, there was an error processing your request.";

/// Current Unix epoch in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Convert a natural-log probability into a probability in `[0, 1]`.
pub fn probability(logprob: f64) -> f64 {
    logprob.exp().clamp(0.0, 1.0)
}

/// Format a log-probability as a percentage with two decimals, e.g. `"90.48%"`.
pub fn percentage(logprob: f64) -> String {
    format!("{:.2}%", probability(logprob) * 100.0)
}

// ---------------------------------------------------------------------------
// Role / status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// Lifecycle of one turn. User turns are born `Finalized`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnStatus {
    Dispatched,
    Streaming,
    Resolving,
    Finalized,
    Errored,
}

impl TurnStatus {
    fn finalized() -> Self {
        TurnStatus::Finalized
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TurnStatus::Finalized | TurnStatus::Errored)
    }
}

impl std::fmt::Display for TurnStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TurnStatus::Dispatched => "dispatched",
            TurnStatus::Streaming => "streaming",
            TurnStatus::Resolving => "resolving",
            TurnStatus::Finalized => "finalized",
            TurnStatus::Errored => "errored",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Candidates and token traces
// ---------------------------------------------------------------------------

/// One generated token and the top-K alternatives the model weighed for that
/// position, keyed by token text with natural-log probabilities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenTrace {
    pub token: String,
    #[serde(default)]
    pub alternatives: BTreeMap<String, f64>,
}

impl TokenTrace {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            alternatives: BTreeMap::new(),
        }
    }

    pub fn with_alternative(mut self, token: impl Into<String>, logprob: f64) -> Self {
        self.alternatives.insert(token.into(), logprob);
        self
    }

    /// Alternatives sorted by descending log-probability.
    pub fn ranked(&self) -> Vec<(&str, f64)> {
        let mut entries: Vec<(&str, f64)> = self
            .alternatives
            .iter()
            .map(|(t, lp)| (t.as_str(), *lp))
            .collect();
        entries.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        entries
    }

    /// Probability of `token` at this position, if it is among the alternatives.
    pub fn probability_of(&self, token: &str) -> Option<f64> {
        self.alternatives.get(token).map(|lp| probability(*lp))
    }

    /// Probability of the token that was actually emitted.
    pub fn chosen_probability(&self) -> Option<f64> {
        self.probability_of(&self.token)
    }
}

/// One independently sampled assistant response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub text: String,
    #[serde(default)]
    pub token_trace: Vec<TokenTrace>,
}

impl Candidate {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            token_trace: Vec::new(),
        }
    }

    /// Mean probability of the emitted tokens. `None` without probability data.
    pub fn mean_confidence(&self) -> Option<f64> {
        let probs: Vec<f64> = self
            .token_trace
            .iter()
            .filter_map(TokenTrace::chosen_probability)
            .collect();
        if probs.is_empty() {
            None
        } else {
            Some(probs.iter().sum::<f64>() / probs.len() as f64)
        }
    }
}

// ---------------------------------------------------------------------------
// Turn
// ---------------------------------------------------------------------------

/// One entry in the conversation.
///
/// For assistant turns `content` is derived: the streamed text while the turn
/// is in flight, then `candidates[active_candidate_index].text` once resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Turn {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub role: Role,
    pub timestamp: u64,
    pub content: String,
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default)]
    pub active_candidate_index: usize,
    #[serde(default = "TurnStatus::finalized")]
    pub status: TurnStatus,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role: Role::User,
            timestamp: now_ms(),
            content: content.into(),
            candidates: Vec::new(),
            active_candidate_index: 0,
            status: TurnStatus::Finalized,
        }
    }

    /// An empty assistant turn waiting for its request to produce output.
    pub fn pending_assistant() -> Self {
        Self {
            id: Uuid::new_v4(),
            role: Role::Assistant,
            timestamp: now_ms(),
            content: String::new(),
            candidates: Vec::new(),
            active_candidate_index: 0,
            status: TurnStatus::Dispatched,
        }
    }

    /// A finished assistant turn with the given candidates, candidate 0 active.
    pub fn assistant(candidates: Vec<Candidate>) -> Self {
        let mut turn = Self::pending_assistant();
        turn.set_candidates(candidates);
        turn.status = TurnStatus::Finalized;
        turn
    }

    pub fn is_in_progress(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn active_candidate(&self) -> Option<&Candidate> {
        self.candidates.get(self.active_candidate_index)
    }

    /// Install resolved candidates. Candidate 0 becomes active and its text
    /// replaces whatever was streamed. An empty list leaves `content` alone.
    pub fn set_candidates(&mut self, candidates: Vec<Candidate>) {
        self.candidates = candidates;
        self.active_candidate_index = 0;
        if let Some(first) = self.candidates.first() {
            self.content = first.text.clone();
        }
    }

    /// Collapse the candidate set to the active one.
    fn lock(&mut self) {
        if self.candidates.len() > 1 {
            let active = self.active_candidate_index.min(self.candidates.len() - 1);
            let kept = self.candidates.swap_remove(active);
            self.candidates = vec![kept];
            self.active_candidate_index = 0;
            self.content = self.candidates[0].text.clone();
        }
    }

    /// Bring the active index back into range and `content` back in line
    /// with the active candidate.
    fn reselect(&mut self) {
        let last = self.candidates.len() - 1;
        if self.active_candidate_index > last {
            tracing::warn!(id = %self.id, index = self.active_candidate_index, "active candidate out of range");
            self.active_candidate_index = last;
        }
        self.content = self.candidates[self.active_candidate_index].text.clone();
    }

    fn rotate(&mut self) -> usize {
        self.active_candidate_index = (self.active_candidate_index + 1) % self.candidates.len();
        self.content = self.candidates[self.active_candidate_index].text.clone();
        self.active_candidate_index
    }

    fn mark_errored(&mut self) {
        self.content = ERROR_MESSAGE.to_string();
        self.candidates.clear();
        self.active_candidate_index = 0;
        self.status = TurnStatus::Errored;
    }
}

// ---------------------------------------------------------------------------
// ConversationStore
// ---------------------------------------------------------------------------

/// Identifies the in-flight turn: position plus identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnHandle {
    pub index: usize,
    pub id: Uuid,
}

/// The ordered, append-only log of turns.
#[derive(Debug, Default)]
pub struct ConversationStore {
    turns: Vec<Turn>,
    in_flight: Option<TurnHandle>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn get(&self, index: usize) -> Option<&Turn> {
        self.turns.get(index)
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn in_flight(&self) -> Option<TurnHandle> {
        self.in_flight
    }

    /// Append a turn and return its index.
    ///
    /// Fails with `InvalidState` while another turn is in flight. A user turn
    /// locks all earlier assistant turns first. A non-terminal turn becomes
    /// the in-flight turn.
    pub fn append(&mut self, turn: Turn) -> Result<usize> {
        if let Some(handle) = self.in_flight {
            return Err(ChatError::invalid_state(format!(
                "turn {} is still in flight",
                handle.index
            )));
        }
        if turn.role == Role::User {
            self.lock_candidates();
        }
        let index = self.turns.len();
        if turn.is_in_progress() {
            self.in_flight = Some(TurnHandle { index, id: turn.id });
        }
        self.turns.push(turn);
        Ok(index)
    }

    /// Append the user's message plus an empty assistant turn that is marked
    /// in flight.
    pub fn begin_turn(&mut self, user_text: impl Into<String>) -> Result<TurnHandle> {
        self.append(Turn::user(user_text))?;
        let assistant = Turn::pending_assistant();
        let id = assistant.id;
        let index = self.append(assistant)?;
        Ok(TurnHandle { index, id })
    }

    /// Apply `mutator` to the last turn. Returns `false` on an empty store.
    pub fn update_last<F: FnOnce(&mut Turn)>(&mut self, mutator: F) -> bool {
        match self.turns.last_mut() {
            Some(turn) => {
                mutator(turn);
                true
            }
            None => false,
        }
    }

    /// Apply `mutator` to the in-flight turn named by `handle`.
    ///
    /// Returns `false` and leaves the store untouched when `handle` is stale:
    /// the turn was finished, or the store was reset or restored since.
    pub fn update_in_flight<F: FnOnce(&mut Turn)>(&mut self, handle: TurnHandle, mutator: F) -> bool {
        if self.in_flight != Some(handle) {
            tracing::debug!(index = handle.index, "ignoring update for stale turn handle");
            return false;
        }
        match self.turns.get_mut(handle.index) {
            Some(turn) if turn.id == handle.id => {
                mutator(turn);
                true
            }
            _ => false,
        }
    }

    /// Finalize the in-flight turn with `candidates`.
    pub fn finalize(&mut self, handle: TurnHandle, candidates: Vec<Candidate>) -> bool {
        let applied = self.update_in_flight(handle, |turn| {
            turn.set_candidates(candidates);
            turn.status = TurnStatus::Finalized;
        });
        if applied {
            self.in_flight = None;
        }
        applied
    }

    /// Finalize the in-flight turn as errored: fixed message, no candidates.
    pub fn fail(&mut self, handle: TurnHandle) -> bool {
        let applied = self.update_in_flight(handle, Turn::mark_errored);
        if applied {
            self.in_flight = None;
        }
        applied
    }

    /// Cycle the displayed candidate of a finalized turn. Returns the new
    /// active index.
    pub fn toggle_candidate(&mut self, turn_index: usize) -> Result<usize> {
        let turn = self
            .turns
            .get_mut(turn_index)
            .ok_or_else(|| ChatError::invalid_state(format!("no turn at index {turn_index}")))?;
        if turn.status != TurnStatus::Finalized {
            return Err(ChatError::invalid_state(format!(
                "turn {turn_index} is {}, not finalized",
                turn.status
            )));
        }
        if turn.candidates.len() < 2 {
            return Err(ChatError::invalid_state(format!(
                "turn {turn_index} has {} candidate(s), nothing to toggle",
                turn.candidates.len()
            )));
        }
        Ok(turn.rotate())
    }

    /// The conversation as sent upstream: every settled turn reduced to
    /// `{role, content}`. In-progress and errored turns are left out.
    pub fn history(&self) -> Vec<OpenAIChatMessage> {
        self.turns
            .iter()
            .filter(|t| t.status == TurnStatus::Finalized)
            .map(|t| OpenAIChatMessage {
                role: t.role.to_string(),
                content: t.content.clone(),
            })
            .collect()
    }

    /// Drop every turn. Any outstanding [`TurnHandle`] becomes stale.
    pub fn reset(&mut self) {
        self.turns.clear();
        self.in_flight = None;
    }

    pub fn snapshot(&self) -> Vec<Turn> {
        self.turns.clone()
    }

    /// Replace the store's contents with a previously taken snapshot.
    ///
    /// A turn that was still in progress when the snapshot was written can
    /// never finish, so it is restored as errored.
    pub fn restore(&mut self, snapshot: Vec<Turn>) -> Result<()> {
        if self.in_flight.is_some() {
            return Err(ChatError::invalid_state("cannot restore while a turn is in flight"));
        }
        self.turns = snapshot;
        for turn in self.turns.iter_mut() {
            if turn.is_in_progress() {
                tracing::warn!(id = %turn.id, status = %turn.status, "restored turn was abandoned mid-flight");
                turn.mark_errored();
            } else if turn.status == TurnStatus::Finalized && !turn.candidates.is_empty() {
                turn.reselect();
            }
        }
        Ok(())
    }

    fn lock_candidates(&mut self) {
        for turn in self
            .turns
            .iter_mut()
            .filter(|t| t.role == Role::Assistant && t.candidates.len() > 1)
        {
            turn.lock();
        }
    }
}
