//! LLM wire contract and provider abstraction.
//!
//! The engine only ever needs two capabilities from a provider: a chat
//! completion and a model listing. Concrete clients (OpenAI-compatible,
//! Ollama) live in `client`; a queue-driven mock lives here for tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors that can occur when interacting with an LLM provider.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// An HTTP-level error (connection failure, DNS, TLS, etc.).
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// The API returned a non-success status with a message.
    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    /// Failed to parse the API response body.
    #[error("parse error: {0}")]
    ParseError(String),

    /// The API indicated rate limiting (HTTP 429).
    #[error("rate limited: retry after {retry_after_secs:?}s")]
    RateLimited { retry_after_secs: Option<u64> },

    /// The request timed out.
    #[error("request timed out")]
    Timeout,

    /// The surrounding context was canceled mid-request.
    #[error("request canceled")]
    Canceled,
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout
        } else {
            LlmError::HttpError(err.to_string())
        }
    }
}

const CONTEXT_LENGTH_MARKERS: &[&str] = &[
    "context length",
    "context_length",
    "prompt is too long",
    "token limit",
    "too many tokens",
    "exceed",
];

impl LlmError {
    /// Whether the provider rejected the request for prompt size. Detected
    /// by substring since providers disagree on error codes.
    pub fn is_context_length(&self) -> bool {
        let message = match self {
            LlmError::ApiError { message, .. } => message,
            LlmError::HttpError(message) => message,
            LlmError::ParseError(message) => message,
            _ => return false,
        };
        let lower = message.to_lowercase();
        CONTEXT_LENGTH_MARKERS.iter().any(|m| lower.contains(m))
    }

    /// Whether a retry after backoff is worthwhile.
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::RateLimited { .. } | LlmError::Timeout | LlmError::Canceled => true,
            LlmError::HttpError(_) => true,
            LlmError::ApiError { status, .. } => {
                matches!(status, 429 | 500 | 502 | 503)
            }
            LlmError::ParseError(_) => false,
        }
    }

    /// Whether the configured model was rejected as unknown.
    pub fn is_model_not_found(&self) -> bool {
        match self {
            LlmError::ApiError { status: 404, .. } => true,
            LlmError::ApiError { message, .. } => {
                let lower = message.to_lowercase();
                lower.contains("model") && lower.contains("not found")
            }
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Wire types (OpenAI-compatible)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub role: String,
    pub content: String,
}

impl WireMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFormat {
    #[serde(rename = "type")]
    pub format_type: String,
}

impl ResponseFormat {
    pub fn json_object() -> Self {
        Self {
            format_type: "json_object".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<WireMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<WireMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: 0.7,
            max_tokens: 4096,
            stream: false,
            response_format: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChoice {
    #[serde(default)]
    pub index: u32,
    pub message: WireMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    pub choices: Vec<ChatChoice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

impl ChatResponse {
    /// Content of the first choice, if any.
    pub fn content(&self) -> Option<&str> {
        self.choices.first().map(|c| c.message.content.as_str())
    }
}

// ---------------------------------------------------------------------------
// Protocol trait
// ---------------------------------------------------------------------------

/// The abstract provider capability the engine consumes.
#[async_trait]
pub trait Protocol: Send + Sync {
    /// Send a chat completion request and return the full response.
    async fn create_chat_completion(&self, req: &ChatRequest) -> Result<ChatResponse, LlmError>;

    /// List the model ids this endpoint serves.
    async fn get_models(&self) -> Result<Vec<String>, LlmError>;
}

// ---------------------------------------------------------------------------
// MockProtocol
// ---------------------------------------------------------------------------

/// A mock provider for testing.
///
/// Each call to `create_chat_completion` pops the next queued result. An
/// empty queue yields a default response. Requests are captured for
/// assertions.
pub struct MockProtocol {
    responses: Mutex<VecDeque<Result<ChatResponse, LlmError>>>,
    captured: Mutex<Vec<ChatRequest>>,
    models: Vec<String>,
}

impl Default for MockProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProtocol {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            captured: Mutex::new(Vec::new()),
            models: vec!["mock-model".into()],
        }
    }

    pub fn with_models(mut self, models: Vec<String>) -> Self {
        self.models = models;
        self
    }

    /// Queue a raw response.
    pub fn push_response(&self, response: ChatResponse) {
        self.responses
            .lock()
            .expect("mock lock poisoned")
            .push_back(Ok(response));
    }

    /// Queue an assistant message with the given content.
    pub fn push_text(&self, content: impl Into<String>) {
        self.push_response(text_response(content));
    }

    /// Queue an error.
    pub fn push_error(&self, error: LlmError) {
        self.responses
            .lock()
            .expect("mock lock poisoned")
            .push_back(Err(error));
    }

    /// Requests captured so far.
    pub fn captured_requests(&self) -> Vec<ChatRequest> {
        self.captured.lock().expect("mock lock poisoned").clone()
    }
}

/// Build a single-choice assistant response, for mocks and tests.
pub fn text_response(content: impl Into<String>) -> ChatResponse {
    let content = content.into();
    let tokens = (content.len() / 4) as u64;
    ChatResponse {
        id: "mock-completion".into(),
        model: "mock-model".into(),
        choices: vec![ChatChoice {
            index: 0,
            message: WireMessage::new("assistant", content),
            finish_reason: Some("stop".into()),
        }],
        usage: Some(Usage {
            prompt_tokens: 10,
            completion_tokens: tokens,
            total_tokens: 10 + tokens,
        }),
    }
}

#[async_trait]
impl Protocol for MockProtocol {
    async fn create_chat_completion(&self, req: &ChatRequest) -> Result<ChatResponse, LlmError> {
        self.captured
            .lock()
            .expect("mock lock poisoned")
            .push(req.clone());
        let mut queue = self.responses.lock().expect("mock lock poisoned");
        match queue.pop_front() {
            Some(result) => result,
            None => Ok(text_response("Mock response")),
        }
    }

    async fn get_models(&self) -> Result<Vec<String>, LlmError> {
        Ok(self.models.clone())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_length_detection_by_substring() {
        let e = LlmError::ApiError {
            status: 400,
            message: "This model's maximum context length is 8192 tokens".into(),
        };
        assert!(e.is_context_length());

        let e = LlmError::ApiError {
            status: 400,
            message: "prompt is too long: 210000 tokens".into(),
        };
        assert!(e.is_context_length());

        let e = LlmError::ApiError {
            status: 400,
            message: "invalid temperature".into(),
        };
        assert!(!e.is_context_length());

        assert!(!LlmError::Timeout.is_context_length());
    }

    #[test]
    fn transient_classification() {
        assert!(LlmError::RateLimited {
            retry_after_secs: Some(5)
        }
        .is_transient());
        assert!(LlmError::Timeout.is_transient());
        assert!(LlmError::Canceled.is_transient());
        assert!(LlmError::ApiError {
            status: 503,
            message: "overloaded".into()
        }
        .is_transient());
        assert!(!LlmError::ApiError {
            status: 400,
            message: "bad request".into()
        }
        .is_transient());
        assert!(!LlmError::ParseError("junk".into()).is_transient());
    }

    #[test]
    fn model_not_found_detection() {
        assert!(LlmError::ApiError {
            status: 404,
            message: "no such route".into()
        }
        .is_model_not_found());
        assert!(LlmError::ApiError {
            status: 400,
            message: "The model `gpt-9` was not found".into()
        }
        .is_model_not_found());
        assert!(!LlmError::Timeout.is_model_not_found());
    }

    #[tokio::test]
    async fn mock_pops_queue_then_defaults() {
        let mock = MockProtocol::new();
        mock.push_text("first");
        mock.push_error(LlmError::Timeout);

        let req = ChatRequest::new("m", vec![WireMessage::new("user", "hi")]);
        let first = mock.create_chat_completion(&req).await.unwrap();
        assert_eq!(first.content(), Some("first"));

        assert!(mock.create_chat_completion(&req).await.is_err());

        let fallback = mock.create_chat_completion(&req).await.unwrap();
        assert_eq!(fallback.content(), Some("Mock response"));

        assert_eq!(mock.captured_requests().len(), 3);
    }

    #[test]
    fn chat_request_serializes_without_empty_format() {
        let req = ChatRequest::new("m", vec![WireMessage::new("user", "hi")]);
        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("response_format").is_none());
        assert_eq!(json["stream"], false);
    }

    #[test]
    fn chat_response_deserializes_minimal() {
        let json = r#"{"choices":[{"message":{"role":"assistant","content":"Hello"}}]}"#;
        let resp: ChatResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.content(), Some("Hello"));
        assert!(resp.usage.is_none());
    }
}
