// Persistent Records
// Row types owned by the persistence store: jobs, tasks, artifacts,
// approvals, and per-job usage counters

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::failure::TaskFailure;
use crate::pipeline::{AgentKind, ApprovalDecision, JobStatus, Stage, TaskStatus};

// ============================================================================
// Job
// ============================================================================

/// One end-to-end pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Globally unique identifier
    pub job_id: String,
    /// Client-supplied, human-readable, not unique
    pub project_id: String,
    /// Immutable input text
    pub requirements: String,
    pub status: JobStatus,
    pub stage: Stage,
    /// Free-form client metadata, passed through opaquely
    #[serde(default)]
    pub metadata: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(job_id: String, project_id: String, requirements: String, metadata: Value) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            project_id,
            requirements,
            status: JobStatus::Queued,
            stage: Stage::Initialization,
            metadata,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ============================================================================
// Task
// ============================================================================

/// One attempt to execute a stage's agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub job_id: String,
    /// The stage this task executes
    pub stage: Stage,
    pub agent_kind: AgentKind,
    /// Structured agent input; well-known fields vary per stage
    pub input_data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_data: Option<Value>,
    pub status: TaskStatus,
    /// 1-based attempt counter across stage retries
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskFailure>,
}

// ============================================================================
// Artifact
// ============================================================================

/// Addressable output of a stage. Rows are append-only; the latest row per
/// (job_id, artifact_type) is canonical, earlier rows are history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub artifact_id: String,
    pub job_id: String,
    pub artifact_type: ArtifactType,
    /// Markdown or JSON text
    pub content: String,
    #[serde(default)]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    Prd,
    Plan,
    Architecture,
    Uiux,
    Development,
    Qa,
    Security,
    Documentation,
    Support,
    PmReview,
    Delivery,
    FeatureTree,
    FeatureTreeGraph,
}

impl ArtifactType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Prd => "prd",
            Self::Plan => "plan",
            Self::Architecture => "architecture",
            Self::Uiux => "uiux",
            Self::Development => "development",
            Self::Qa => "qa",
            Self::Security => "security",
            Self::Documentation => "documentation",
            Self::Support => "support",
            Self::PmReview => "pm_review",
            Self::Delivery => "delivery",
            Self::FeatureTree => "feature_tree",
            Self::FeatureTreeGraph => "feature_tree_graph",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "prd" => Some(Self::Prd),
            "plan" => Some(Self::Plan),
            "architecture" => Some(Self::Architecture),
            "uiux" => Some(Self::Uiux),
            "development" => Some(Self::Development),
            "qa" => Some(Self::Qa),
            "security" => Some(Self::Security),
            "documentation" => Some(Self::Documentation),
            "support" => Some(Self::Support),
            "pm_review" => Some(Self::PmReview),
            "delivery" => Some(Self::Delivery),
            "feature_tree" => Some(Self::FeatureTree),
            "feature_tree_graph" => Some(Self::FeatureTreeGraph),
            _ => None,
        }
    }
}

impl std::fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Approval
// ============================================================================

/// Recorded human-in-the-loop decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    pub approval_id: String,
    pub job_id: String,
    /// The gated stage the decision applies to
    pub stage: Stage,
    pub decision: ApprovalDecision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Usage
// ============================================================================

/// Per-job aggregate of LLM consumption
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub calls: u64,
    pub cost_usd: f64,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.calls += other.calls;
        self.cost_usd += other.cost_usd;
    }
}
