//! Completion resolution: reshaping a multi-candidate, logprob-annotated
//! response into ranked [`Candidate`]s.
//!
//! Candidates keep generation order (the provider's choice `index`), not
//! probability order. Log-probabilities are stored as returned; converting
//! them to percentages is left to whoever displays them.

use serde::{Deserialize, Serialize};

use crate::conversation::{Candidate, TokenTrace};
use crate::providers::{OpenAIChatMessage, OpenAIResolveChoice, OpenAIResolveRequest, OpenAIResolveResponse};

/// Upper bound the provider accepts for `top_logprobs`.
pub const MAX_TOP_K: u8 = 20;

/// Sampling parameters for the resolve request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GenerationParams {
    pub temperature: f32,
    pub max_tokens: u32,
    /// Number of independently sampled completions (N).
    pub candidates: u8,
    /// Alternatives recorded per token (K). Zero disables alternatives.
    pub top_k: u8,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 150,
            candidates: 3,
            top_k: 5,
        }
    }
}

impl GenerationParams {
    /// Clamp into the ranges the provider accepts: N ≥ 1, K ≤ 20.
    pub fn normalized(mut self) -> Self {
        self.candidates = self.candidates.max(1);
        self.top_k = self.top_k.min(MAX_TOP_K);
        self
    }

    pub fn to_request(&self, model: &str, history: &[OpenAIChatMessage]) -> OpenAIResolveRequest {
        let params = self.clone().normalized();
        OpenAIResolveRequest {
            model: model.to_string(),
            messages: history.to_vec(),
            temperature: params.temperature,
            max_tokens: params.max_tokens,
            n: params.candidates,
            logprobs: true,
            top_logprobs: (params.top_k > 0).then_some(params.top_k),
        }
    }
}

fn candidate_from_choice(choice: OpenAIResolveChoice) -> Candidate {
    let token_trace = choice
        .logprobs
        .and_then(|lp| lp.content)
        .unwrap_or_default()
        .into_iter()
        .map(|entry| TokenTrace {
            token: entry.token,
            alternatives: entry
                .top_logprobs
                .into_iter()
                .map(|alt| (alt.token, alt.logprob))
                .collect(),
        })
        .collect();

    Candidate {
        text: choice.message.content.unwrap_or_default(),
        token_trace,
    }
}

/// Reshape a resolve response into candidates in generation order.
pub fn candidates_from_response(response: OpenAIResolveResponse) -> Vec<Candidate> {
    let mut choices = response.choices;
    choices.sort_by_key(|c| c.index);
    choices.into_iter().map(candidate_from_choice).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(json: &str) -> OpenAIResolveResponse {
        serde_json::from_str(json).expect("deser")
    }

    #[test]
    fn test_defaults() {
        let p = GenerationParams::default();
        assert_eq!(p.temperature, 0.7);
        assert_eq!(p.max_tokens, 150);
        assert_eq!(p.candidates, 3);
        assert_eq!(p.top_k, 5);
    }

    #[test]
    fn test_normalized_clamps() {
        let p = GenerationParams { candidates: 0, top_k: 99, ..Default::default() }.normalized();
        assert_eq!(p.candidates, 1);
        assert_eq!(p.top_k, MAX_TOP_K);
    }

    #[test]
    fn test_to_request_sets_logprob_fields() {
        let history = vec![OpenAIChatMessage { role: "user".into(), content: "Hi".into() }];
        let req = GenerationParams::default().to_request("gpt-4o-mini", &history);
        assert_eq!(req.n, 3);
        assert!(req.logprobs);
        assert_eq!(req.top_logprobs, Some(5));
        assert_eq!(req.messages, history);
    }

    #[test]
    fn test_to_request_zero_top_k_omits_alternatives() {
        let req = GenerationParams { top_k: 0, ..Default::default() }.to_request("m", &[]);
        assert_eq!(req.top_logprobs, None);
    }

    #[test]
    fn test_candidates_keep_generation_order() {
        let resp = response(
            r#"{"choices":[
                {"index":1,"message":{"content":"Hey there!"}},
                {"index":0,"message":{"content":"Hello!"}}
            ]}"#,
        );
        let texts: Vec<String> = candidates_from_response(resp).into_iter().map(|c| c.text).collect();
        assert_eq!(texts, vec!["Hello!", "Hey there!"]);
    }

    #[test]
    fn test_token_trace_built_from_logprobs() {
        let resp = response(
            r#"{"choices":[{"index":0,"message":{"content":"Hi!"},"logprobs":{"content":[
                {"token":"Hi","logprob":-0.25,"top_logprobs":[{"token":"Hi","logprob":-0.25},{"token":"Hello","logprob":-1.5}]},
                {"token":"!","logprob":-0.5,"top_logprobs":[{"token":"!","logprob":-0.5}]}
            ]}}]}"#,
        );
        let candidates = candidates_from_response(resp);
        let trace = &candidates[0].token_trace;
        assert_eq!(trace.len(), 2);
        assert_eq!(trace[0].token, "Hi");
        assert_eq!(trace[0].alternatives.get("Hello"), Some(&-1.5));
        assert_eq!(trace[1].alternatives.len(), 1);
    }

    #[test]
    fn test_missing_logprobs_gives_empty_trace() {
        let resp = response(r#"{"choices":[{"index":0,"message":{"content":"x"}}]}"#);
        let candidates = candidates_from_response(resp);
        assert!(candidates[0].token_trace.is_empty());
    }

    #[test]
    fn test_null_content_becomes_empty_text() {
        let resp = response(r#"{"choices":[{"index":0,"message":{"content":null}}]}"#);
        assert_eq!(candidates_from_response(resp)[0].text, "");
    }

    #[test]
    fn test_no_choices() {
        assert!(candidates_from_response(response(r#"{"choices":[]}"#)).is_empty());
    }
}
