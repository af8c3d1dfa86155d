use crate::config::{Config, Delivery};
use clap::Parser;
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "chatprob")]
#[command(version)]
#[command(about = "Chat with an LLM and inspect per-token probabilities and alternative completions")]
pub struct Args {
    /// Model name (e.g. gpt-3.5-turbo, gpt-4o-mini)
    #[arg(long, short)]
    pub model: Option<String>,

    /// Number of independently sampled completions per turn
    #[arg(long, short = 'n')]
    pub candidates: Option<u8>,

    /// Alternatives recorded per token (0 disables)
    #[arg(long)]
    pub top_k: Option<u8>,

    /// Sampling temperature
    #[arg(long)]
    pub temperature: Option<f32>,

    /// Maximum tokens per completion
    #[arg(long)]
    pub max_tokens: Option<u32>,

    /// How turns are delivered: auto, streaming, or buffered
    #[arg(long, value_enum)]
    pub delivery: Option<Delivery>,

    /// Conversation snapshot file
    #[arg(long)]
    pub session: Option<PathBuf>,

    /// Do not load or save the conversation
    #[arg(long, conflicts_with = "session")]
    pub no_session: bool,

    /// TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// API root of an OpenAI-compatible provider
    #[arg(long)]
    pub base_url: Option<String>,

    /// Colour assistant tokens by model confidence
    #[arg(long)]
    pub heatmap: bool,

    /// Print a shell completion script and exit
    #[arg(long, value_enum)]
    pub completions: Option<Shell>,
}

impl Args {
    /// Apply command-line overrides on top of `config`.
    pub fn apply(&self, config: &mut Config) {
        if let Some(model) = &self.model {
            config.model = model.clone();
        }
        if let Some(n) = self.candidates {
            config.generation.candidates = n;
        }
        if let Some(k) = self.top_k {
            config.generation.top_k = k;
        }
        if let Some(t) = self.temperature {
            config.generation.temperature = t;
        }
        if let Some(m) = self.max_tokens {
            config.generation.max_tokens = m;
        }
        if let Some(d) = self.delivery {
            config.delivery = d;
        }
        if let Some(url) = &self.base_url {
            config.base_url = url.clone();
        }
        if self.no_session {
            config.session_path = None;
        } else if let Some(path) = &self.session {
            config.session_path = Some(path.clone());
        }
    }
}
