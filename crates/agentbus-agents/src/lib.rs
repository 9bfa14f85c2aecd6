// Agent Runtime
// The contract a pipeline agent satisfies, the registry that resolves
// agent kinds, and the outbound clients agents are allowed to call.
// Agents never touch the store or the queue; the worker persists their
// results on their behalf.

mod clients;
mod prompts;
mod registry;
mod stage;

pub use clients::{
    Completion, CompletionRequest, HttpLlmClient, HttpLlmConfig, LlmClient, MemoryClient,
    MemoryHit, NoopMemory, NoopSkills, SkillBundle, SkillInfo, SkillsClient,
};
pub use prompts::AgentPrompts;
pub use registry::AgentRegistry;
pub use stage::{render_feature_graph, StageAgent};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use agentbus_types::{AgentKind, Artifact, ArtifactType, FailureKind, Stage, Usage};

// ============================================================================
// Errors
// ============================================================================

/// Agent failure classes. Only `RateLimited` and `Upstream` are transient;
/// the worker retries those within its backoff budget and nothing else.
#[derive(Error, Debug)]
pub enum AgentError {
    /// Required input missing or malformed; never retried
    #[error("bad input: {0}")]
    BadInput(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Upstream 5xx or connection failure
    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl AgentError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited(_) | Self::Upstream(_))
    }

    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::BadInput(_) => FailureKind::BadInput,
            Self::RateLimited(_) => FailureKind::RateLimited,
            Self::Upstream(_) => FailureKind::Upstream,
            Self::PermissionDenied(_) => FailureKind::PermissionDenied,
            Self::QuotaExceeded(_) => FailureKind::QuotaExceeded,
            Self::Cancelled => FailureKind::Cancelled,
            Self::Other(_) => FailureKind::Unknown,
        }
    }
}

// ============================================================================
// Context and Output
// ============================================================================

/// Everything an agent may see or call. Side effects are limited to the
/// clients carried here.
#[derive(Clone)]
pub struct AgentContext {
    pub job_id: String,
    /// The job's immutable input text
    pub requirements: String,
    /// Latest artifact per type at dispatch time
    pub prior_artifacts: HashMap<ArtifactType, Artifact>,
    pub llm: Arc<dyn LlmClient>,
    pub memory: Arc<dyn MemoryClient>,
    pub skills: Arc<dyn SkillsClient>,
    pub cancel: CancellationToken,
}

impl AgentContext {
    pub fn artifact(&self, artifact_type: ArtifactType) -> Option<&Artifact> {
        self.prior_artifacts.get(&artifact_type)
    }
}

/// What a successful agent run yields. The worker persists the primary
/// artifact, any extras, the usage delta, and the structured output.
#[derive(Debug, Clone)]
pub struct AgentOutput {
    pub artifact_type: ArtifactType,
    pub content: String,
    pub structured_output: Value,
    pub usage: Usage,
    pub memory_hits: Vec<MemoryHit>,
    pub extra_artifacts: Vec<(ArtifactType, String)>,
}

// ============================================================================
// Agent Contract
// ============================================================================

/// A pure function from (task input, context) to an output. Implementations
/// may be non-deterministic; they must be cancel-aware at step boundaries.
#[async_trait]
pub trait Agent: Send + Sync {
    fn kind(&self) -> AgentKind;

    /// Whether the orchestrator may re-run this stage after a failure.
    fn retry_safe(&self) -> bool {
        false
    }

    async fn run(&self, input: &Value, ctx: &AgentContext) -> Result<AgentOutput, AgentError>;
}

// ============================================================================
// Workload classification
// ============================================================================

/// External collaborator deciding whether the next stage needs the gpu
/// queue. The core only passes the boolean through to queue selection.
pub trait WorkloadClassifier: Send + Sync {
    fn ml_required(&self, stage: Stage, prior_artifacts: &HashMap<ArtifactType, Artifact>)
        -> bool;
}

/// Default: nothing needs the gpu class.
pub struct DefaultClassifier;

impl WorkloadClassifier for DefaultClassifier {
    fn ml_required(&self, _stage: Stage, _prior: &HashMap<ArtifactType, Artifact>) -> bool {
        false
    }
}
