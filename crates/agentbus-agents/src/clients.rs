// Outbound Clients
// LLM, memory, and skills contracts the core calls. The production LLM
// client speaks an OpenAI-style chat endpoint over reqwest; memory and
// skills ship with no-op defaults since both live outside this process.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use agentbus_types::{AgentKind, Usage};

use crate::AgentError;

// ============================================================================
// LLM
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub system: Option<String>,
    pub prompt: String,
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

impl Completion {
    pub fn usage(&self) -> Usage {
        Usage {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            calls: 1,
            cost_usd: self.cost_usd,
        }
    }
}

/// Must be cancellable: implementations abandon the call promptly when the
/// token fires and report `AgentError::Cancelled`.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(
        &self,
        request: CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<Completion, AgentError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpLlmConfig {
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub model: String,
    /// USD per 1k prompt tokens, for the usage counters
    #[serde(default)]
    pub prompt_cost_per_1k: f64,
    #[serde(default)]
    pub completion_cost_per_1k: f64,
}

impl Default for HttpLlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:11434/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            prompt_cost_per_1k: 0.0,
            completion_cost_per_1k: 0.0,
        }
    }
}

/// OpenAI-compatible chat completion client.
pub struct HttpLlmClient {
    client: reqwest::Client,
    config: HttpLlmConfig,
}

impl HttpLlmClient {
    pub fn new(config: HttpLlmConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn classify_status(status: reqwest::StatusCode, body: &str) -> AgentError {
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            if body.to_lowercase().contains("quota") {
                return AgentError::QuotaExceeded(body.to_string());
            }
            return AgentError::RateLimited(format!("429: {body}"));
        }
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return AgentError::PermissionDenied(format!("{status}: {body}"));
        }
        if status.is_server_error() {
            return AgentError::Upstream(format!("{status}: {body}"));
        }
        AgentError::Other(format!("unexpected status {status}: {body}"))
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(
        &self,
        request: CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<Completion, AgentError> {
        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.push(json!({ "role": "user", "content": request.prompt }));

        let mut body = json!({
            "model": request.model.as_deref().unwrap_or(&self.config.model),
            "messages": messages,
        });
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }

        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let mut builder = self.client.post(&url).json(&body);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            result = builder.send() => {
                result.map_err(|e| AgentError::Upstream(format!("request failed: {e}")))?
            }
        };

        let status = response.status();
        let text = tokio::select! {
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            result = response.text() => {
                result.map_err(|e| AgentError::Upstream(format!("read failed: {e}")))?
            }
        };

        if !status.is_success() {
            return Err(Self::classify_status(status, &text));
        }

        let parsed: Value = serde_json::from_str(&text)
            .map_err(|e| AgentError::Upstream(format!("malformed response: {e}")))?;
        let content = parsed["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let input_tokens = parsed["usage"]["prompt_tokens"].as_u64().unwrap_or(0);
        let output_tokens = parsed["usage"]["completion_tokens"].as_u64().unwrap_or(0);
        let cost_usd = (input_tokens as f64 / 1000.0) * self.config.prompt_cost_per_1k
            + (output_tokens as f64 / 1000.0) * self.config.completion_cost_per_1k;

        Ok(Completion {
            text: content,
            input_tokens,
            output_tokens,
            cost_usd,
        })
    }
}

// ============================================================================
// Memory
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryHit {
    pub id: String,
    pub score: f32,
    pub text: String,
    #[serde(default)]
    pub metadata: Value,
}

#[async_trait]
pub trait MemoryClient: Send + Sync {
    async fn search(
        &self,
        query: &str,
        top_k: usize,
        filter: Option<Value>,
    ) -> Result<Vec<MemoryHit>, AgentError>;

    async fn store(&self, kind: &str, text: &str, metadata: Value)
        -> Result<String, AgentError>;
}

/// Stand-in when no memory store is wired up.
pub struct NoopMemory;

#[async_trait]
impl MemoryClient for NoopMemory {
    async fn search(
        &self,
        _query: &str,
        _top_k: usize,
        _filter: Option<Value>,
    ) -> Result<Vec<MemoryHit>, AgentError> {
        Ok(Vec::new())
    }

    async fn store(
        &self,
        _kind: &str,
        _text: &str,
        _metadata: Value,
    ) -> Result<String, AgentError> {
        Ok(agentbus_types::new_id())
    }
}

// ============================================================================
// Skills
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillInfo {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillBundle {
    pub info: SkillInfo,
    pub content: String,
}

#[async_trait]
pub trait SkillsClient: Send + Sync {
    async fn list(&self, kind: AgentKind) -> Result<Vec<SkillInfo>, AgentError>;
    async fn load(&self, name: &str) -> Result<Option<SkillBundle>, AgentError>;
}

pub struct NoopSkills;

#[async_trait]
impl SkillsClient for NoopSkills {
    async fn list(&self, _kind: AgentKind) -> Result<Vec<SkillInfo>, AgentError> {
        Ok(Vec::new())
    }

    async fn load(&self, _name: &str) -> Result<Option<SkillBundle>, AgentError> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        let err = HttpLlmClient::classify_status(
            reqwest::StatusCode::TOO_MANY_REQUESTS,
            "slow down",
        );
        assert!(matches!(err, AgentError::RateLimited(_)));
        assert!(err.is_transient());

        let err = HttpLlmClient::classify_status(
            reqwest::StatusCode::TOO_MANY_REQUESTS,
            "monthly quota exceeded",
        );
        assert!(matches!(err, AgentError::QuotaExceeded(_)));
        assert!(!err.is_transient());

        let err =
            HttpLlmClient::classify_status(reqwest::StatusCode::BAD_GATEWAY, "upstream died");
        assert!(matches!(err, AgentError::Upstream(_)));
        assert!(err.is_transient());

        let err = HttpLlmClient::classify_status(reqwest::StatusCode::UNAUTHORIZED, "no key");
        assert!(matches!(err, AgentError::PermissionDenied(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn noop_memory_is_empty() {
        let memory = NoopMemory;
        let hits = memory.search("anything", 5, None).await.unwrap();
        assert!(hits.is_empty());
        let id = memory.store("note", "text", Value::Null).await.unwrap();
        assert!(!id.is_empty());
    }
}
