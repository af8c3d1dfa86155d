//! Layered configuration: defaults, then an optional TOML file, then the
//! environment. Command-line flags are applied last by [`crate::cli::Args`].

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::coordinator::DeliveryMode;
use crate::error::{ChatError, Result};
use crate::providers::OPENAI_BASE_URL;
use crate::resolver::GenerationParams;

pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";

/// How turns are delivered to the screen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Delivery {
    /// Pick from the environment at startup.
    #[default]
    Auto,
    Streaming,
    Buffered,
}

impl Delivery {
    pub fn resolve(self) -> DeliveryMode {
        match self {
            Delivery::Auto => DeliveryMode::detect(),
            Delivery::Streaming => DeliveryMode::Streaming,
            Delivery::Buffered => DeliveryMode::Buffered,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub model: String,
    pub base_url: String,
    /// Normally taken from `OPENAI_API_KEY`; never written back out.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub delivery: Delivery,
    /// Where the conversation snapshot lives. `None` disables persistence.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_path: Option<PathBuf>,
    pub generation: GenerationParams,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            base_url: OPENAI_BASE_URL.to_string(),
            api_key: None,
            delivery: Delivery::Auto,
            session_path: default_session_path(),
            generation: GenerationParams::default(),
        }
    }
}

/// `$HOME/.chatprob/session.json`, or `None` when there is no home directory.
pub fn default_session_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".chatprob").join("session.json"))
}

impl Config {
    /// Load defaults, the TOML file at `path` (or `$CHATPROB_CONFIG`), then
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let from_env = std::env::var_os("CHATPROB_CONFIG").map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(from_env) {
            Some(p) => Self::from_file(&p)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ChatError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml(&raw).map_err(|e| ChatError::Config(format!("{}: {e}", path.display())))
    }

    pub fn from_toml(raw: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// Apply `OPENAI_API_KEY`, `CHATPROB_MODEL` and `CHATPROB_BASE_URL` from
    /// `lookup`. Empty values are ignored.
    pub fn apply_env<F: Fn(&str) -> Option<String>>(&mut self, lookup: F) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(key) = get("OPENAI_API_KEY") {
            self.api_key = Some(key);
        }
        if let Some(model) = get("CHATPROB_MODEL") {
            self.model = model;
        }
        if let Some(url) = get("CHATPROB_BASE_URL") {
            self.base_url = url;
        }
    }

    pub fn require_api_key(&self) -> Result<&str> {
        self.api_key
            .as_deref()
            .ok_or_else(|| ChatError::Config("OPENAI_API_KEY not set. Export it or pass via environment.".to_string()))
    }
}
