//! Upstream model provider.
//!
//! [`ModelBackend`] is the seam the turn coordinator talks to: one lazily
//! started stream of content deltas and one multi-candidate resolve call.
//! [`OpenAiBackend`] implements both against an OpenAI-compatible
//! `/chat/completions` endpoint.

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt, TryStreamExt};
use reqwest::Client;
use std::time::Duration;

use crate::config::Config;
use crate::conversation::Candidate;
use crate::decoder::decode;
use crate::error::{ChatError, Result};
use crate::providers::{error_message, OpenAIChatMessage, OpenAIChatRequest, OpenAIResolveResponse};
use crate::resolver::{candidates_from_response, GenerationParams};

/// Content deltas for one turn, in arrival order.
pub type FragmentStream = BoxStream<'static, Result<String>>;

#[async_trait]
pub trait ModelBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Start the incremental request. Nothing is sent until the returned
    /// stream is first polled; failures surface as `StreamFailure` items.
    fn stream(&self, history: &[OpenAIChatMessage], params: &GenerationParams) -> FragmentStream;

    /// Request `params.candidates` sampled completions with per-token
    /// alternatives. Any failure is `ResolutionFailed`; there are no partial
    /// results.
    async fn resolve(
        &self,
        history: &[OpenAIChatMessage],
        params: &GenerationParams,
    ) -> Result<Vec<Candidate>>;
}

#[derive(Clone)]
pub struct OpenAiBackend {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiBackend {
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ChatError::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            base_url: base_url.into(),
            model: model.into(),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(config.require_api_key()?, config.base_url.clone(), config.model.clone())
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl ModelBackend for OpenAiBackend {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn stream(&self, history: &[OpenAIChatMessage], params: &GenerationParams) -> FragmentStream {
        let request = OpenAIChatRequest {
            model: self.model.clone(),
            messages: history.to_vec(),
            stream: true,
            temperature: params.temperature,
        };
        let pending = self
            .client
            .post(self.completions_url())
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request);

        let opened = async move {
            let response = pending.send().await.map_err(|e| ChatError::StreamFailure {
                status: None,
                detail: e.to_string(),
            })?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(ChatError::StreamFailure {
                    status: Some(status.as_u16()),
                    detail: error_message(&body),
                });
            }

            tracing::debug!(status = status.as_u16(), "stream opened");
            Ok(decode(response.bytes_stream()))
        };

        stream::once(opened).try_flatten().boxed()
    }

    async fn resolve(
        &self,
        history: &[OpenAIChatMessage],
        params: &GenerationParams,
    ) -> Result<Vec<Candidate>> {
        let request = params.to_request(&self.model, history);
        let response = self
            .client
            .post(self.completions_url())
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| ChatError::ResolutionFailed {
                status: None,
                detail: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::ResolutionFailed {
                status: Some(status.as_u16()),
                detail: error_message(&body),
            });
        }

        let parsed: OpenAIResolveResponse =
            response.json().await.map_err(|e| ChatError::ResolutionFailed {
                status: None,
                detail: format!("unreadable response body: {e}"),
            })?;
        let candidates = candidates_from_response(parsed);
        tracing::debug!(count = candidates.len(), n = request.n, "candidates resolved");
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completions_url_trims_trailing_slash() {
        let b = OpenAiBackend::new("k", "http://localhost:9/v1/", "m").expect("client");
        assert_eq!(b.completions_url(), "http://localhost:9/v1/chat/completions");
    }

    #[test]
    fn test_from_config_requires_api_key() {
        let config = Config { api_key: None, ..Default::default() };
        assert!(matches!(OpenAiBackend::from_config(&config), Err(ChatError::Config(_))));
    }

    #[test]
    fn test_from_config_uses_model() {
        let config = Config {
            api_key: Some("sk-test".into()),
            model: "gpt-4o-mini".into(),
            ..Default::default()
        };
        let b = OpenAiBackend::from_config(&config).expect("backend");
        assert_eq!(b.model(), "gpt-4o-mini");
        assert_eq!(b.name(), "openai");
    }

    #[tokio::test]
    async fn test_stream_unreachable_host_is_stream_failure() {
        let b = OpenAiBackend::new("k", "http://127.0.0.1:1", "m").expect("client");
        let items: Vec<Result<String>> = b.stream(&[], &GenerationParams::default()).collect().await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(ChatError::StreamFailure { status: None, .. })));
    }

    #[tokio::test]
    async fn test_resolve_unreachable_host_is_resolution_failure() {
        let b = OpenAiBackend::new("k", "http://127.0.0.1:1", "m").expect("client");
        let err = b.resolve(&[], &GenerationParams::default()).await.unwrap_err();
        assert!(matches!(err, ChatError::ResolutionFailed { status: None, .. }));
    }
}
