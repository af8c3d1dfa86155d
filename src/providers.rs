use serde::{Deserialize, Serialize};

/// Default endpoint root for the OpenAI-compatible chat-completions API.
pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

// -- Shared message shape ----------------------------------------------------

/// One turn as sent upstream: every turn is reduced to `{role, content}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenAIChatMessage {
    pub role: String,
    pub content: String,
}

// -- Stream operation ----------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct OpenAIChatRequest {
    pub model: String,
    pub messages: Vec<OpenAIChatMessage>,
    pub stream: bool,
    pub temperature: f32,
}

#[derive(Debug, Default, Deserialize)]
pub struct OpenAIDelta {
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OpenAIChoice {
    #[serde(default)]
    pub delta: OpenAIDelta,
    #[allow(dead_code)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OpenAIChunk {
    pub choices: Vec<OpenAIChoice>,
}

impl OpenAIChunk {
    /// The incremental content at `choices[0].delta.content`, if any.
    pub fn delta_content(&self) -> Option<&str> {
        self.choices.first().and_then(|c| c.delta.content.as_deref())
    }
}

// -- Resolve operation ---------------------------------------------------------

/// Non-streaming request for `n` independently sampled, logprob-annotated
/// completions.
#[derive(Debug, Serialize)]
pub struct OpenAIResolveRequest {
    pub model: String,
    pub messages: Vec<OpenAIChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub n: u8,
    pub logprobs: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_logprobs: Option<u8>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAITopLogprob {
    pub token: String,
    pub logprob: f64,
}

/// One generated token with its own log-probability and the top-K
/// alternatives the model considered at that position.
#[derive(Debug, Clone, Deserialize)]
pub struct OpenAILogprobContent {
    pub token: String,
    pub logprob: f64,
    #[serde(default)]
    pub top_logprobs: Vec<OpenAITopLogprob>,
}

#[derive(Debug, Default, Deserialize)]
pub struct OpenAIChoiceLogprobs {
    #[serde(default)]
    pub content: Option<Vec<OpenAILogprobContent>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct OpenAIResponseMessage {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OpenAIResolveChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub message: OpenAIResponseMessage,
    #[serde(default)]
    pub logprobs: Option<OpenAIChoiceLogprobs>,
}

#[derive(Debug, Deserialize)]
pub struct OpenAIResolveResponse {
    pub choices: Vec<OpenAIResolveChoice>,
}

// -- Error envelope ------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct OpenAIErrorDetail {
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct OpenAIErrorBody {
    pub error: OpenAIErrorDetail,
}

/// Pull a human-readable message out of an error response body, falling back
/// to the raw body when it is not the usual `{"error": {"message": ...}}`.
pub fn error_message(body: &str) -> String {
    serde_json::from_str::<OpenAIErrorBody>(body)
        .map(|b| b.error.message)
        .unwrap_or_else(|_| body.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openai_chunk_missing_delta() {
        let json = r#"{"choices":[{"index":0,"finish_reason":"stop"}]}"#;
        let chunk: OpenAIChunk = serde_json::from_str(json).expect("deser failed");
        assert!(chunk.delta_content().is_none());
    }

    #[test]
    fn test_resolve_request_omits_top_logprobs_when_none() {
        let req = OpenAIResolveRequest {
            model: "gpt-4o-mini".to_string(),
            messages: vec![],
            temperature: 0.7,
            max_tokens: 150,
            n: 2,
            logprobs: true,
            top_logprobs: None,
        };
        let json = serde_json::to_string(&req).expect("serialize");
        assert!(!json.contains("top_logprobs"));
        assert!(json.contains("\"n\":2"));
    }

    #[test]
    fn test_resolve_response_with_logprobs() {
        let json = r#"{
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "Hi"},
                "logprobs": {"content": [
                    {"token": "Hi", "logprob": -0.1,
                     "top_logprobs": [{"token": "Hi", "logprob": -0.1}, {"token": "Hello", "logprob": -2.5}]}
                ]}
            }]
        }"#;
        let resp: OpenAIResolveResponse = serde_json::from_str(json).expect("deser");
        let lp = resp.choices[0].logprobs.as_ref().and_then(|l| l.content.as_ref()).expect("content");
        assert_eq!(lp[0].top_logprobs.len(), 2);
        assert_eq!(lp[0].top_logprobs[1].token, "Hello");
    }

    #[test]
    fn test_resolve_response_null_logprobs() {
        let json = r#"{"choices":[{"index":0,"message":{"content":"x"},"logprobs":null}]}"#;
        let resp: OpenAIResolveResponse = serde_json::from_str(json).expect("deser");
        assert!(resp.choices[0].logprobs.is_none());
    }

    #[test]
    fn test_error_message_extracts_envelope() {
        let body = r#"{"error":{"message":"Invalid API key","type":"auth"}}"#;
        assert_eq!(error_message(body), "Invalid API key");
    }

    #[test]
    fn test_error_message_falls_back_to_body() {
        assert_eq!(error_message("  upstream timeout \n"), "upstream timeout");
    }
}
