//! Concrete protocol clients.
//!
//! `OpenAiCompatClient` speaks the standard `/chat/completions` protocol
//! used by OpenAI, vLLM, llama.cpp, TokenHub and most proxies.
//! `OllamaClient` speaks Ollama's native `/api/chat` and `/api/tags`.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::protocol::{
    ChatRequest, ChatResponse, LlmError, Protocol, ResponseFormat, WireMessage,
};

/// Default per-request timeout for non-streaming completions.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

// ---------------------------------------------------------------------------
// Endpoint classification
// ---------------------------------------------------------------------------

/// Whether an endpoint is a local inference server: loopback, `.local`
/// hostnames, or RFC1918 addresses. Local servers get
/// `response_format=json_object` to engage constrained decoding; cloud
/// endpoints do not, since proxies often reject the field.
pub fn is_local_endpoint(endpoint: &str) -> bool {
    let host = endpoint
        .trim_start_matches("http://")
        .trim_start_matches("https://")
        .split(['/', ':'])
        .next()
        .unwrap_or("");

    if host == "localhost" || host == "127.0.0.1" || host == "::1" || host.ends_with(".local") {
        return true;
    }

    let octets: Vec<u8> = host.split('.').filter_map(|p| p.parse().ok()).collect();
    if octets.len() == 4 {
        return octets[0] == 10
            || (octets[0] == 172 && (16..=31).contains(&octets[1]))
            || (octets[0] == 192 && octets[1] == 168);
    }
    false
}

// ---------------------------------------------------------------------------
// OpenAiCompatClient
// ---------------------------------------------------------------------------

/// Client for any endpoint implementing the OpenAI chat-completions wire
/// contract. `endpoint` is the API base including the version segment, e.g.
/// `https://api.openai.com/v1` or `http://localhost:8000/v1`.
pub struct OpenAiCompatClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    hint_json: bool,
}

impl OpenAiCompatClient {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        let endpoint = endpoint.into();
        let hint_json = is_local_endpoint(&endpoint);
        Self {
            client: reqwest::Client::builder()
                .timeout(DEFAULT_REQUEST_TIMEOUT)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
            hint_json,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        self
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.header("Authorization", format!("Bearer {}", key)),
            None => req,
        }
    }
}

#[async_trait]
impl Protocol for OpenAiCompatClient {
    async fn create_chat_completion(&self, req: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let url = format!("{}/chat/completions", self.endpoint);

        let mut req = req.clone();
        if self.hint_json && req.response_format.is_none() {
            req.response_format = Some(ResponseFormat::json_object());
        }

        debug!(url = %url, model = %req.model, messages = req.messages.len(), "chat completion");
        let resp = self
            .authorize(self.client.post(&url).header("Content-Type", "application/json"))
            .json(&req)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status == 429 {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            return Err(LlmError::RateLimited {
                retry_after_secs: retry_after,
            });
        }
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(LlmError::ApiError {
                status,
                message: text,
            });
        }

        resp.json::<ChatResponse>()
            .await
            .map_err(|e| LlmError::ParseError(e.to_string()))
    }

    async fn get_models(&self) -> Result<Vec<String>, LlmError> {
        #[derive(Deserialize)]
        struct ModelsResponse {
            data: Vec<ModelEntry>,
        }
        #[derive(Deserialize)]
        struct ModelEntry {
            id: String,
        }

        let url = format!("{}/models", self.endpoint);
        let resp = self.authorize(self.client.get(&url)).send().await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(LlmError::ApiError {
                status,
                message: text,
            });
        }

        let models: ModelsResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::ParseError(e.to_string()))?;
        Ok(models.data.into_iter().map(|m| m.id).collect())
    }
}

// ---------------------------------------------------------------------------
// OllamaClient
// ---------------------------------------------------------------------------

/// Client for Ollama's native API (`/api/chat`, `/api/tags`).
pub struct OllamaClient {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Deserialize)]
struct OllamaChatResponse {
    #[serde(default)]
    model: String,
    message: OllamaMessage,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
}

#[derive(Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    role: String,
    #[serde(default)]
    content: String,
}

impl OllamaClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(DEFAULT_REQUEST_TIMEOUT)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl Protocol for OllamaClient {
    async fn create_chat_completion(&self, req: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let url = format!("{}/api/chat", self.endpoint);
        let body = serde_json::json!({
            "model": req.model,
            "messages": req.messages,
            "stream": false,
            "options": { "temperature": req.temperature, "num_predict": req.max_tokens },
        });

        let resp = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(LlmError::ApiError {
                status,
                message: text,
            });
        }

        let ollama: OllamaChatResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::ParseError(e.to_string()))?;
        if !ollama.done {
            return Err(LlmError::ParseError(
                "ollama returned a partial (done=false) response".into(),
            ));
        }

        let prompt_tokens = ollama.prompt_eval_count.unwrap_or(0);
        let completion_tokens = ollama.eval_count.unwrap_or(0);
        Ok(ChatResponse {
            id: String::new(),
            model: ollama.model,
            choices: vec![crate::protocol::ChatChoice {
                index: 0,
                message: WireMessage::new(
                    if ollama.message.role.is_empty() {
                        "assistant".to_string()
                    } else {
                        ollama.message.role
                    },
                    ollama.message.content,
                ),
                finish_reason: Some("stop".into()),
            }],
            usage: Some(crate::protocol::Usage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
            }),
        })
    }

    async fn get_models(&self) -> Result<Vec<String>, LlmError> {
        #[derive(Deserialize)]
        struct TagsResponse {
            models: Vec<TagEntry>,
        }
        #[derive(Deserialize)]
        struct TagEntry {
            name: String,
        }

        let url = format!("{}/api/tags", self.endpoint);
        let resp = self.client.get(&url).send().await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(LlmError::ApiError {
                status,
                message: text,
            });
        }

        let tags: TagsResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::ParseError(e.to_string()))?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
