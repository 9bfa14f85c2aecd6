// Engine Configuration
// Everything is defaulted so an empty config file (or none) runs. Loaded
// from JSON once at startup, with env overrides for the deploy-sensitive
// knobs.

use std::path::Path;

use serde::{Deserialize, Serialize};

use agentbus_agents::HttpLlmConfig;

use crate::{CoreError, CoreResult};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub http: HttpConfig,
    /// Production LLM endpoint; absent means agents cannot run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm: Option<HttpLlmConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersConfig {
    #[serde(default = "default_cpu_count")]
    pub cpu_count: usize,
    #[serde(default = "default_gpu_count")]
    pub gpu_count: usize,
}

fn default_cpu_count() -> usize {
    2
}

fn default_gpu_count() -> usize {
    0
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            cpu_count: default_cpu_count(),
            gpu_count: default_gpu_count(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Per-task hard deadline
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,
    #[serde(default = "default_dequeue_timeout_ms")]
    pub dequeue_timeout_ms: u64,
    #[serde(default)]
    pub llm_retry: LlmRetryConfig,
}

fn default_task_timeout_ms() -> u64 {
    600_000
}

fn default_dequeue_timeout_ms() -> u64 {
    30_000
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            task_timeout_ms: default_task_timeout_ms(),
            dequeue_timeout_ms: default_dequeue_timeout_ms(),
            llm_retry: LlmRetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRetryConfig {
    #[serde(default = "default_llm_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_llm_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_llm_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_llm_max_attempts() -> u32 {
    5
}

fn default_llm_initial_delay_ms() -> u64 {
    1_000
}

fn default_llm_max_delay_ms() -> u64 {
    60_000
}

impl Default for LlmRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_llm_max_attempts(),
            initial_delay_ms: default_llm_initial_delay_ms(),
            max_delay_ms: default_llm_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub stage_retry: StageRetryConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageRetryConfig {
    /// Stage re-runs after a failure; 0 unless an agent opts in via
    /// retry_safe and the operator raises this
    #[serde(default)]
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_visibility_timeout_ms")]
    pub visibility_timeout_ms: u64,
}

fn default_visibility_timeout_ms() -> u64 {
    60_000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_ms: default_visibility_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventsConfig {
    #[serde(default)]
    pub ring_buffer: RingBufferConfig,
    /// Mirror every published event into the store's audit table
    #[serde(default)]
    pub audit: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingBufferConfig {
    #[serde(default = "default_ring_per_job")]
    pub per_job: usize,
    #[serde(default = "default_ring_global")]
    pub global: usize,
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
}

fn default_ring_per_job() -> usize {
    1_000
}

fn default_ring_global() -> usize {
    10_000
}

fn default_subscriber_buffer() -> usize {
    256
}

impl Default for RingBufferConfig {
    fn default() -> Self {
        Self {
            per_job: default_ring_per_job(),
            global: default_ring_global(),
            subscriber_buffer: default_subscriber_buffer(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
    /// When set, /api routes require `Authorization: Bearer <token>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_heartbeat_ms() -> u64 {
    15_000
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            heartbeat_ms: default_heartbeat_ms(),
            auth_token: None,
        }
    }
}

impl EngineConfig {
    /// Read config from a JSON file; a missing file means defaults. Env
    /// overrides: AGENTBUS_BIND_ADDR, AGENTBUS_AUTH_TOKEN.
    pub fn load(path: Option<&Path>) -> CoreResult<Self> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(path)
                    .map_err(|e| CoreError::Internal(format!("failed to read config: {e}")))?;
                serde_json::from_str(&raw)
                    .map_err(|e| CoreError::InvalidInput(format!("invalid config: {e}")))?
            }
            _ => Self::default(),
        };

        if let Ok(addr) = std::env::var("AGENTBUS_BIND_ADDR") {
            if !addr.trim().is_empty() {
                config.http.bind_addr = addr;
            }
        }
        if let Ok(token) = std::env::var("AGENTBUS_AUTH_TOKEN") {
            if !token.trim().is_empty() {
                config.http.auth_token = Some(token);
            }
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.worker.task_timeout_ms, 600_000);
        assert_eq!(config.worker.llm_retry.max_attempts, 5);
        assert_eq!(config.worker.llm_retry.initial_delay_ms, 1_000);
        assert_eq!(config.worker.llm_retry.max_delay_ms, 60_000);
        assert_eq!(config.orchestrator.stage_retry.max_attempts, 0);
        assert_eq!(config.queue.visibility_timeout_ms, 60_000);
        assert_eq!(config.events.ring_buffer.per_job, 1_000);
        assert_eq!(config.events.ring_buffer.global, 10_000);
        assert_eq!(config.events.ring_buffer.subscriber_buffer, 256);
        assert_eq!(config.http.heartbeat_ms, 15_000);
        assert!(!config.events.audit);
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"workers": {"cpu_count": 8}, "http": {}}"#).unwrap();
        assert_eq!(config.workers.cpu_count, 8);
        assert_eq!(config.workers.gpu_count, 0);
        assert_eq!(config.http.heartbeat_ms, 15_000);
    }
}
