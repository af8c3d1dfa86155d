//! Crate-level error type.
//!
//! Each variant maps to one failure kind of the chat engine. Only
//! [`ChatError::StreamFailure`] and [`ChatError::ResolutionFailed`] ever reach
//! the user, and then only as an errored assistant turn; [`ChatError::Decode`]
//! is absorbed by the decoder and [`ChatError::InvalidState`] signals a caller
//! bug.

use thiserror::Error;

/// Errors produced by the streaming and reconciliation engine.
#[derive(Debug, Error)]
pub enum ChatError {
    /// One stream record could not be decoded. Recovered locally.
    #[error("malformed stream record: {detail}")]
    Decode { detail: String },

    /// The stream endpoint replied with a non-success status or the
    /// connection dropped mid-stream.
    #[error("stream failed{}: {detail}", http_suffix(.status))]
    StreamFailure { status: Option<u16>, detail: String },

    /// The probability-annotated request failed. No partial candidates.
    #[error("resolution failed{}: {detail}", http_suffix(.status))]
    ResolutionFailed { status: Option<u16>, detail: String },

    /// An operation was invoked against a turn in the wrong state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("snapshot error: {0}")]
    Persistence(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl ChatError {
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        ChatError::InvalidState(msg.into())
    }
}

fn http_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

pub type Result<T> = std::result::Result<T, ChatError>;
