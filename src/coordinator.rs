//! # Turn coordinator
//!
//! ## Responsibility
//! Drive one user turn from dispatch to a terminal state and be the only
//! writer of the [`ConversationStore`] while it runs.
//!
//! ```text
//! Dispatched ──► Streaming ──► Resolving ──► Finalized
//!      │             │             │
//!      └─────────────┴─────────────┴──────► Errored
//! ```
//!
//! In [`DeliveryMode::Streaming`] the stream and the resolve request are
//! dispatched together and raced on one task with `tokio::select!`:
//! - each delta is appended to the turn's `content` the moment it arrives;
//! - when the stream ends the turn moves to `Resolving`;
//! - a resolve failure ends the turn as soon as it lands;
//! - a resolve success is held until the stream has ended, then its
//!   candidates replace the streamed text (candidate 0 wins even when it
//!   differs). An empty list keeps the full streamed text.
//!
//! The turn is finalized only once both requests have succeeded, so the
//! final state does not depend on which one finishes first. A successful
//! resolve still waits on a slow stream.
//!
//! [`DeliveryMode::Buffered`] skips `Streaming` and uses the resolve request
//! alone. The final state is the same either way.
//!
//! ## Guarantees
//! - Any request failure finalizes the turn as errored with
//!   [`ERROR_MESSAGE`]; earlier turns are never touched and the next
//!   [`TurnCoordinator::submit`] is accepted.
//! - Deltas are applied in arrival order with plain concatenation.

use std::io::IsTerminal;

use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::backend::ModelBackend;
use crate::conversation::{Candidate, ConversationStore, Turn, TurnHandle, TurnStatus, ERROR_MESSAGE};
use crate::error::{ChatError, Result};
use crate::persist::SnapshotFile;
use crate::providers::OpenAIChatMessage;
use crate::resolver::GenerationParams;

/// Whether the runtime can show a turn incrementally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Stream deltas and resolve candidates concurrently.
    Streaming,
    /// One resolve request produces both the text and the candidates.
    Buffered,
}

impl DeliveryMode {
    /// Pick a mode from the process environment.
    pub fn detect() -> Self {
        Self::detect_from(
            std::env::var("CHATPROB_DELIVERY").ok().as_deref(),
            std::env::var("TERM").ok().as_deref(),
            std::io::stdout().is_terminal(),
        )
    }

    /// `CHATPROB_DELIVERY` (`streaming`/`buffered`) wins; otherwise a dumb
    /// terminal or redirected stdout gets `Buffered`.
    pub fn detect_from(forced: Option<&str>, term: Option<&str>, stdout_is_tty: bool) -> Self {
        match forced.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            Some("streaming") => return DeliveryMode::Streaming,
            Some("buffered") => return DeliveryMode::Buffered,
            _ => {}
        }
        if !stdout_is_tty || term == Some("dumb") {
            DeliveryMode::Buffered
        } else {
            DeliveryMode::Streaming
        }
    }
}

/// Progress notifications for live consumers (the terminal UI).
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    Dispatched { index: usize },
    /// Cumulative content of the in-flight turn after one more delta.
    Content { index: usize, content: String },
    StatusChanged { index: usize, status: TurnStatus },
    Finalized { index: usize, candidates: usize },
    Errored { index: usize, message: String },
}

/// How a submitted turn ended.
#[derive(Debug)]
pub enum TurnOutcome {
    Finalized { index: usize, candidates: usize },
    Errored { index: usize, error: ChatError },
}

impl TurnOutcome {
    pub fn index(&self) -> usize {
        match self {
            TurnOutcome::Finalized { index, .. } | TurnOutcome::Errored { index, .. } => *index,
        }
    }

    pub fn is_errored(&self) -> bool {
        matches!(self, TurnOutcome::Errored { .. })
    }
}

pub struct TurnCoordinator<B> {
    backend: B,
    store: ConversationStore,
    params: GenerationParams,
    mode: DeliveryMode,
    events: Option<mpsc::UnboundedSender<TurnEvent>>,
    autosave: Option<SnapshotFile>,
}

impl<B: ModelBackend> TurnCoordinator<B> {
    pub fn new(backend: B, params: GenerationParams, mode: DeliveryMode) -> Self {
        Self {
            backend,
            store: ConversationStore::new(),
            params: params.normalized(),
            mode,
            events: None,
            autosave: None,
        }
    }

    /// Send [`TurnEvent`]s to `tx` as turns progress.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<TurnEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Save the conversation to `file` after every settled change.
    pub fn with_autosave(mut self, file: SnapshotFile) -> Self {
        self.autosave = Some(file);
        self
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn turns(&self) -> &[Turn] {
        self.store.turns()
    }

    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    pub fn params(&self) -> &GenerationParams {
        &self.params
    }

    /// Replace the conversation with a saved snapshot.
    pub fn restore(&mut self, turns: Vec<Turn>) -> Result<()> {
        self.store.restore(turns)
    }

    /// Load the autosave file, if configured and present. Returns the number
    /// of restored turns.
    pub fn restore_from_autosave(&mut self) -> Result<usize> {
        let Some(file) = &self.autosave else {
            return Ok(0);
        };
        match file.load()? {
            Some(turns) => {
                let n = turns.len();
                self.store.restore(turns)?;
                tracing::info!(turns = n, path = %file.path().display(), "conversation restored");
                Ok(n)
            }
            None => Ok(0),
        }
    }

    /// Run one full turn for `user_text`.
    ///
    /// Returns `Err` only for caller mistakes (empty input, a turn already in
    /// flight). Provider failures come back as [`TurnOutcome::Errored`] with
    /// the store already updated.
    pub async fn submit(&mut self, user_text: &str) -> Result<TurnOutcome> {
        let text = user_text.trim();
        if text.is_empty() {
            return Err(ChatError::invalid_state("refusing to send an empty message"));
        }

        let handle = self.store.begin_turn(text)?;
        let history = self.store.history();
        emit(&self.events, TurnEvent::Dispatched { index: handle.index });
        tracing::info!(turn = handle.index, mode = ?self.mode, history = history.len(), "turn dispatched");

        let result = match self.mode {
            DeliveryMode::Streaming => self.run_streaming(handle, &history).await,
            DeliveryMode::Buffered => self.run_buffered(handle, &history).await,
        };

        let outcome = match result {
            Ok(candidates) => {
                let count = candidates.len();
                self.store.finalize(handle, candidates);
                emit(&self.events, TurnEvent::Finalized { index: handle.index, candidates: count });
                tracing::info!(turn = handle.index, candidates = count, "turn finalized");
                TurnOutcome::Finalized { index: handle.index, candidates: count }
            }
            Err(error) => {
                tracing::warn!(turn = handle.index, %error, "turn failed");
                self.store.fail(handle);
                emit(&self.events, TurnEvent::Errored {
                    index: handle.index,
                    message: ERROR_MESSAGE.to_string(),
                });
                TurnOutcome::Errored { index: handle.index, error }
            }
        };

        self.save();
        Ok(outcome)
    }

    /// Show the next candidate of a finalized turn.
    pub fn toggle(&mut self, turn_index: usize) -> Result<usize> {
        let active = self.store.toggle_candidate(turn_index)?;
        self.save();
        Ok(active)
    }

    /// Clear the conversation and delete its snapshot.
    pub fn reset(&mut self) -> Result<()> {
        self.store.reset();
        if let Some(file) = &self.autosave {
            file.clear()?;
        }
        Ok(())
    }

    async fn run_streaming(
        &mut self,
        handle: TurnHandle,
        history: &[OpenAIChatMessage],
    ) -> Result<Vec<Candidate>> {
        let Self { backend, store, params, events, .. } = self;

        let mut fragments = backend.stream(history, params);
        let mut resolution = backend.resolve(history, params);
        set_status(store, events, handle, TurnStatus::Streaming);

        // A resolution that lands early is held until the stream is drained.
        let mut resolved: Option<Vec<Candidate>> = None;
        loop {
            tokio::select! {
                fragment = fragments.next() => match fragment {
                    Some(Ok(delta)) => {
                        let mut content = None;
                        store.update_in_flight(handle, |turn| {
                            turn.content.push_str(&delta);
                            content = Some(turn.content.clone());
                        });
                        if let Some(content) = content {
                            emit(events, TurnEvent::Content { index: handle.index, content });
                        }
                    }
                    Some(Err(e)) => return Err(e),
                    None => break,
                },
                result = &mut resolution, if resolved.is_none() => {
                    tracing::debug!(turn = handle.index, "resolution landed before the stream ended");
                    resolved = Some(result?);
                }
            }
        }

        set_status(store, events, handle, TurnStatus::Resolving);
        match resolved {
            Some(candidates) => Ok(candidates),
            None => resolution.await,
        }
    }

    async fn run_buffered(
        &mut self,
        handle: TurnHandle,
        history: &[OpenAIChatMessage],
    ) -> Result<Vec<Candidate>> {
        set_status(&mut self.store, &self.events, handle, TurnStatus::Resolving);
        let candidates = self.backend.resolve(history, &self.params).await?;
        if candidates.is_empty() {
            return Err(ChatError::ResolutionFailed {
                status: None,
                detail: "provider returned no candidates".to_string(),
            });
        }
        Ok(candidates)
    }

    fn save(&self) {
        if let Some(file) = &self.autosave {
            if let Err(e) = file.save(self.store.turns()) {
                tracing::warn!(error = %e, path = %file.path().display(), "could not save conversation");
            }
        }
    }
}

fn emit(events: &Option<mpsc::UnboundedSender<TurnEvent>>, event: TurnEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event);
    }
}

fn set_status(
    store: &mut ConversationStore,
    events: &Option<mpsc::UnboundedSender<TurnEvent>>,
    handle: TurnHandle,
    status: TurnStatus,
) {
    if store.update_in_flight(handle, |turn| turn.status = status) {
        emit(events, TurnEvent::StatusChanged { index: handle.index, status });
    }
}
