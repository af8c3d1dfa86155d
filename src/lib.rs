//! Terminal chat client that streams a model's reply while resolving several
//! sampled completions with per-token probabilities.
//!
//! The pieces, bottom up:
//! - [`decoder`] turns a chunked SSE body into content deltas;
//! - [`resolver`] builds the multi-candidate request and maps its response;
//! - [`backend`] talks to the provider;
//! - [`conversation`] owns the turn log;
//! - [`coordinator`] runs a turn against all of the above.

pub mod backend;
pub mod cli;
pub mod config;
pub mod conversation;
pub mod coordinator;
pub mod decoder;
pub mod error;
pub mod persist;
pub mod providers;
pub mod render;
pub mod resolver;

pub use backend::{FragmentStream, ModelBackend, OpenAiBackend};
pub use config::{Config, Delivery};
pub use conversation::{Candidate, ConversationStore, Role, TokenTrace, Turn, TurnHandle, TurnStatus};
pub use coordinator::{DeliveryMode, TurnCoordinator, TurnEvent, TurnOutcome};
pub use error::{ChatError, Result};
pub use persist::SnapshotFile;
pub use resolver::GenerationParams;
