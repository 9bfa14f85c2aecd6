// Agent Bus Core
// The stage state machine and the workers that feed it. Everything here is
// constructed once at process start and handed around explicitly; there is
// no hidden global state.

mod cancellations;
mod config;
mod graph;
mod locks;
mod metrics;
mod orchestrator;
mod worker;


pub use cancellations::CancellationRegistry;
pub use config::{
    EngineConfig, EventsConfig, HttpConfig, LlmRetryConfig, OrchestratorConfig, QueueConfig,
    RingBufferConfig, StageRetryConfig, WorkerConfig, WorkersConfig,
};
pub use graph::{StageGraph, Transition};
pub use locks::JobLockManager;
pub use metrics::Metrics;
pub use orchestrator::Orchestrator;
pub use worker::{WorkerClients, WorkerPool};

use thiserror::Error;

use agentbus_store::StoreError;

/// Error taxonomy surfaced to clients; the HTTP layer maps these onto
/// status codes directly.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Action not admissible in the current state
    #[error("conflict: {0}")]
    Conflict(String),

    /// Retryable store/queue failure; surfaces as 503
    #[error("temporarily unavailable: {0}")]
    Transient(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => CoreError::Transient(msg),
            StoreError::Conflict(msg) => CoreError::Conflict(msg),
            StoreError::NotFound(msg) => CoreError::NotFound(msg),
            StoreError::AlreadyClaimed(msg) => CoreError::Conflict(msg),
            StoreError::Corrupt(msg) => CoreError::Internal(msg),
        }
    }
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;
