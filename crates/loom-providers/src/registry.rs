use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::client::{OllamaClient, OpenAiCompatClient};
use crate::protocol::{ChatRequest, ChatResponse, LlmError, Protocol};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider already registered: {0}")]
    AlreadyRegistered(String),
    #[error("provider not found: {0}")]
    NotFound(String),
    #[error("provider not healthy: {0}")]
    NotHealthy(String),
    #[error(transparent)]
    Llm(#[from] LlmError),
}

pub type Result<T> = std::result::Result<T, ProviderError>;

// ---------------------------------------------------------------------------
// Provider configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    Openai,
    Anthropic,
    Local,
    Custom,
    Ollama,
    Vllm,
    Tokenhub,
    Mock,
}

impl std::str::FromStr for ProviderType {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "openai" => Ok(ProviderType::Openai),
            "anthropic" => Ok(ProviderType::Anthropic),
            "local" => Ok(ProviderType::Local),
            "custom" => Ok(ProviderType::Custom),
            "ollama" => Ok(ProviderType::Ollama),
            "vllm" => Ok(ProviderType::Vllm),
            "tokenhub" => Ok(ProviderType::Tokenhub),
            "mock" => Ok(ProviderType::Mock),
            other => Err(ProviderError::NotFound(format!(
                "unknown provider type: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Pending,
    Healthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub provider_type: ProviderType,
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub model: String,
    #[serde(default)]
    pub context_window: Option<usize>,
    pub status: ProviderStatus,
}

impl ProviderConfig {
    pub fn new(
        id: impl Into<String>,
        provider_type: ProviderType,
        endpoint: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            provider_type,
            endpoint: endpoint.into(),
            api_key: None,
            model: model.into(),
            context_window: None,
            status: ProviderStatus::Pending,
        }
    }
}

// ---------------------------------------------------------------------------
// RegisteredProvider
// ---------------------------------------------------------------------------

/// A provider registration. Workers hold the `Arc` across config updates:
/// `upsert` mutates the inner state, never replaces the allocation, so a
/// cached handle keeps observing the current endpoint/model.
pub struct RegisteredProvider {
    config: RwLock<ProviderConfig>,
    client: RwLock<Arc<dyn Protocol>>,
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    last_heartbeat: RwLock<Option<DateTime<Utc>>>,
}

impl std::fmt::Debug for RegisteredProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredProvider")
            .field("config", &self.config)
            .field("total_requests", &self.total_requests)
            .field("successful_requests", &self.successful_requests)
            .field("last_heartbeat", &self.last_heartbeat)
            .finish_non_exhaustive()
    }
}

impl RegisteredProvider {
    fn new(config: ProviderConfig, client: Arc<dyn Protocol>) -> Self {
        Self {
            config: RwLock::new(config),
            client: RwLock::new(client),
            total_requests: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
            last_heartbeat: RwLock::new(None),
        }
    }

    /// Snapshot the current config. Taken fresh at the start of every
    /// request so an in-place upsert is never observed torn.
    pub fn config(&self) -> ProviderConfig {
        self.config.read().expect("provider lock poisoned").clone()
    }

    pub fn id(&self) -> String {
        self.config.read().expect("provider lock poisoned").id.clone()
    }

    pub fn status(&self) -> ProviderStatus {
        self.config.read().expect("provider lock poisoned").status
    }

    pub fn is_healthy(&self) -> bool {
        self.status() == ProviderStatus::Healthy
    }

    /// Advertised context window, or the engine-wide default.
    pub fn context_window(&self, default: usize) -> usize {
        self.config
            .read()
            .expect("provider lock poisoned")
            .context_window
            .unwrap_or(default)
    }

    fn client(&self) -> Arc<dyn Protocol> {
        self.client.read().expect("provider lock poisoned").clone()
    }

    fn mark_healthy(&self) {
        self.config.write().expect("provider lock poisoned").status = ProviderStatus::Healthy;
        *self.last_heartbeat.write().expect("provider lock poisoned") = Some(Utc::now());
    }

    pub fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
        *self.last_heartbeat.read().expect("provider lock poisoned")
    }

    pub fn request_counts(&self) -> (u64, u64) {
        (
            self.total_requests.load(Ordering::Relaxed),
            self.successful_requests.load(Ordering::Relaxed),
        )
    }
}

/// Point-in-time view of a provider for status surfaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSnapshot {
    pub id: String,
    pub provider_type: ProviderType,
    pub model: String,
    pub status: ProviderStatus,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// ProviderRegistry
// ---------------------------------------------------------------------------

pub type MetricsHook = Arc<dyn Fn(&str, bool) + Send + Sync>;

/// Holds LLM endpoints, tracks health, and routes chat requests.
pub struct ProviderRegistry {
    providers: DashMap<String, Arc<RegisteredProvider>>,
    health_check_timeout: Duration,
    metrics_hook: RwLock<Option<MetricsHook>>,
}

impl ProviderRegistry {
    pub fn new(health_check_timeout: Duration) -> Self {
        Self {
            providers: DashMap::new(),
            health_check_timeout,
            metrics_hook: RwLock::new(None),
        }
    }

    /// Install a per-request metrics callback `(provider_id, success)`.
    pub fn set_metrics_hook(&self, hook: MetricsHook) {
        *self.metrics_hook.write().expect("registry lock poisoned") = Some(hook);
    }

    fn emit_metric(&self, provider_id: &str, success: bool) {
        let hook = self
            .metrics_hook
            .read()
            .expect("registry lock poisoned")
            .clone();
        if let Some(hook) = hook {
            hook(provider_id, success);
        }
    }

    fn build_client(config: &ProviderConfig) -> Arc<dyn Protocol> {
        match config.provider_type {
            ProviderType::Ollama => Arc::new(OllamaClient::new(&config.endpoint)),
            _ => Arc::new(OpenAiCompatClient::new(
                &config.endpoint,
                config.api_key.clone(),
            )),
        }
    }

    /// Register a provider and run the blocking health check. On success the
    /// provider is promoted to healthy; on failure it stays pending and is
    /// skipped by `first_healthy`.
    pub async fn register(&self, mut config: ProviderConfig) -> Result<Arc<RegisteredProvider>> {
        config.status = ProviderStatus::Pending;
        let client = Self::build_client(&config);
        self.register_with_client(config, client).await
    }

    /// Register with a caller-supplied client (mock providers, tests).
    pub async fn register_with_client(
        &self,
        mut config: ProviderConfig,
        client: Arc<dyn Protocol>,
    ) -> Result<Arc<RegisteredProvider>> {
        if self.providers.contains_key(&config.id) {
            return Err(ProviderError::AlreadyRegistered(config.id));
        }
        config.status = ProviderStatus::Pending;
        let id = config.id.clone();
        let provider = Arc::new(RegisteredProvider::new(config, client));
        self.providers.insert(id.clone(), Arc::clone(&provider));

        match tokio::time::timeout(self.health_check_timeout, provider.client().get_models()).await
        {
            Ok(Ok(models)) => {
                provider.mark_healthy();
                info!(provider_id = %id, models = models.len(), "provider healthy");
            }
            Ok(Err(e)) => {
                warn!(provider_id = %id, error = %e, "provider health check failed, staying pending");
            }
            Err(_) => {
                warn!(provider_id = %id, "provider health check timed out, staying pending");
            }
        }
        Ok(provider)
    }

    /// Update an existing registration in place. Workers caching the handle
    /// observe the new config on their next request. Unknown ids register
    /// fresh.
    pub async fn upsert(&self, config: ProviderConfig) -> Result<Arc<RegisteredProvider>> {
        let existing = self.providers.get(&config.id).map(|p| Arc::clone(&p));
        match existing {
            Some(provider) => {
                let client = Self::build_client(&config);
                {
                    let mut cfg = provider.config.write().expect("provider lock poisoned");
                    let status = cfg.status;
                    *cfg = config;
                    cfg.status = status;
                }
                *provider.client.write().expect("provider lock poisoned") = client;
                Ok(provider)
            }
            None => self.register(config).await,
        }
    }

    pub fn get(&self, provider_id: &str) -> Result<Arc<RegisteredProvider>> {
        self.providers
            .get(provider_id)
            .map(|p| Arc::clone(&p))
            .ok_or_else(|| ProviderError::NotFound(provider_id.to_string()))
    }

    /// First healthy provider, for executor dispatch.
    pub fn first_healthy(&self) -> Option<Arc<RegisteredProvider>> {
        let mut healthy: Vec<_> = self
            .providers
            .iter()
            .filter(|p| p.is_healthy())
            .map(|p| Arc::clone(&p))
            .collect();
        healthy.sort_by_key(|p| p.id());
        healthy.into_iter().next()
    }

    pub fn snapshots(&self) -> Vec<ProviderSnapshot> {
        self.providers
            .iter()
            .map(|p| {
                let config = p.config();
                let (total, ok) = p.request_counts();
                ProviderSnapshot {
                    id: config.id,
                    provider_type: config.provider_type,
                    model: config.model,
                    status: config.status,
                    total_requests: total,
                    successful_requests: ok,
                    last_heartbeat: p.last_heartbeat(),
                }
            })
            .collect()
    }

    /// Route a chat request through a registered provider.
    ///
    /// Rejects when the provider is not healthy. When the configured model
    /// is rejected as unknown, fetches the endpoint's model list once,
    /// retries with the first available model, and persists the new model id
    /// in the registration.
    pub async fn send_chat_completion(
        &self,
        provider_id: &str,
        req: &ChatRequest,
    ) -> Result<ChatResponse> {
        let provider = self.get(provider_id)?;
        self.send_via(&provider, req).await
    }

    /// Same as `send_chat_completion` but for a worker-held handle.
    pub async fn send_via(
        &self,
        provider: &Arc<RegisteredProvider>,
        req: &ChatRequest,
    ) -> Result<ChatResponse> {
        let config = provider.config();
        if config.status != ProviderStatus::Healthy {
            return Err(ProviderError::NotHealthy(config.id));
        }

        provider.total_requests.fetch_add(1, Ordering::Relaxed);
        let mut req = req.clone();
        if req.model.is_empty() {
            req.model = config.model.clone();
        }

        let result = provider.client().create_chat_completion(&req).await;
        let result = match result {
            Err(e) if e.is_model_not_found() => {
                warn!(provider_id = %config.id, model = %req.model, "model rejected, consulting model list");
                let models = provider.client().get_models().await?;
                let Some(fallback) = models.into_iter().next() else {
                    return Err(ProviderError::Llm(e));
                };
                info!(provider_id = %config.id, model = %fallback, "retrying with first available model");
                provider
                    .config
                    .write()
                    .expect("provider lock poisoned")
                    .model = fallback.clone();
                req.model = fallback;
                provider.client().create_chat_completion(&req).await
            }
            other => other,
        };

        match result {
            Ok(resp) => {
                provider.successful_requests.fetch_add(1, Ordering::Relaxed);
                self.emit_metric(&provider.id(), true);
                Ok(resp)
            }
            Err(e) => {
                self.emit_metric(&provider.id(), false);
                Err(ProviderError::Llm(e))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{text_response, MockProtocol, WireMessage};

    fn mock_config(id: &str) -> ProviderConfig {
        ProviderConfig::new(id, ProviderType::Mock, "http://localhost:0", "mock-model")
    }

    async fn registry_with_mock(id: &str) -> (ProviderRegistry, Arc<MockProtocol>) {
        let registry = ProviderRegistry::new(Duration::from_secs(1));
        let mock = Arc::new(MockProtocol::new());
        registry
            .register_with_client(mock_config(id), Arc::clone(&mock) as Arc<dyn Protocol>)
            .await
            .expect("register");
        (registry, mock)
    }

    #[tokio::test]
    async fn register_promotes_to_healthy() {
        let (registry, _mock) = registry_with_mock("p1").await;
        let provider = registry.get("p1").unwrap();
        assert!(provider.is_healthy());
        assert!(provider.last_heartbeat().is_some());
    }

    #[tokio::test]
    async fn duplicate_registration_rejected() {
        let (registry, _mock) = registry_with_mock("p1").await;
        let err = registry.register(mock_config("p1")).await.unwrap_err();
        assert!(matches!(err, ProviderError::AlreadyRegistered(_)));
    }

    #[tokio::test]
    async fn upsert_keeps_handle_stable() {
        let (registry, _mock) = registry_with_mock("p1").await;
        let handle = registry.get("p1").unwrap();

        let mut updated = mock_config("p1");
        updated.model = "better-model".into();
        updated.context_window = Some(128_000);
        registry.upsert(updated).await.expect("upsert");

        // The original handle observes the new config.
        assert_eq!(handle.config().model, "better-model");
        assert_eq!(handle.context_window(32768), 128_000);
        // Health status survives the upsert.
        assert!(handle.is_healthy());
    }

    #[tokio::test]
    async fn pending_provider_rejects_requests() {
        let registry = ProviderRegistry::new(Duration::from_millis(100));
        let mock = Arc::new(MockProtocol::new());
        let provider = registry
            .register_with_client(mock_config("p1"), mock as Arc<dyn Protocol>)
            .await
            .unwrap();
        // Force back to pending to simulate a failed health check.
        provider.config.write().unwrap().status = ProviderStatus::Pending;

        let req = ChatRequest::new("m", vec![WireMessage::new("user", "hi")]);
        let err = registry.send_chat_completion("p1", &req).await.unwrap_err();
        assert!(matches!(err, ProviderError::NotHealthy(_)));
        assert!(registry.first_healthy().is_none());
    }

    #[tokio::test]
    async fn unknown_model_falls_back_and_persists() {
        let registry = ProviderRegistry::new(Duration::from_secs(1));
        let mock = Arc::new(MockProtocol::new().with_models(vec!["llama-3-8b".into()]));
        registry
            .register_with_client(mock_config("p1"), Arc::clone(&mock) as Arc<dyn Protocol>)
            .await
            .unwrap();

        mock.push_error(LlmError::ApiError {
            status: 404,
            message: "model not found".into(),
        });
        mock.push_response(text_response("recovered"));

        let req = ChatRequest::new("gone-model", vec![WireMessage::new("user", "hi")]);
        let resp = registry.send_chat_completion("p1", &req).await.unwrap();
        assert_eq!(resp.content(), Some("recovered"));

        // New model id is persisted in the registration.
        assert_eq!(registry.get("p1").unwrap().config().model, "llama-3-8b");
        // The retry used the fallback model.
        let captured = mock.captured_requests();
        assert_eq!(captured.last().unwrap().model, "llama-3-8b");
    }

    #[tokio::test]
    async fn request_counters_and_metrics_hook() {
        let (registry, mock) = registry_with_mock("p1").await;
        let calls = Arc::new(std::sync::Mutex::new(Vec::new()));
        let calls_clone = Arc::clone(&calls);
        registry.set_metrics_hook(Arc::new(move |id: &str, ok: bool| {
            calls_clone.lock().unwrap().push((id.to_string(), ok));
        }));

        mock.push_text("ok");
        mock.push_error(LlmError::Timeout);

        let req = ChatRequest::new("m", vec![WireMessage::new("user", "hi")]);
        registry.send_chat_completion("p1", &req).await.unwrap();
        let _ = registry.send_chat_completion("p1", &req).await;

        let provider = registry.get("p1").unwrap();
        let (total, ok) = provider.request_counts();
        assert_eq!(total, 2);
        assert_eq!(ok, 1);

        let calls = calls.lock().unwrap();
        assert_eq!(calls.as_slice(), &[("p1".into(), true), ("p1".into(), false)]);
    }

    #[tokio::test]
    async fn snapshots_reflect_state() {
        let (registry, _mock) = registry_with_mock("p1").await;
        let snaps = registry.snapshots();
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].id, "p1");
        assert_eq!(snaps[0].status, ProviderStatus::Healthy);
    }

    #[test]
    fn provider_type_parsing() {
        use std::str::FromStr;
        assert_eq!(ProviderType::from_str("ollama").unwrap(), ProviderType::Ollama);
        assert_eq!(ProviderType::from_str("vllm").unwrap(), ProviderType::Vllm);
        assert!(ProviderType::from_str("bogus").is_err());
    }
}
