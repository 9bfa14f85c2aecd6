// Pipeline Enumerations
// Job/task lifecycle states, stage graph nodes, and agent kinds

use serde::{Deserialize, Serialize};

// ============================================================================
// Job Status
// ============================================================================

/// Lifecycle status of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, no task dispatched yet
    Queued,
    /// A stage task is queued or executing
    Running,
    /// Paused at a human approval gate
    WaitingForApproval,
    /// Pipeline ran to completion
    Completed,
    /// Unrecoverable failure
    Failed,
    /// Cancelled by the user
    Cancelled,
}

impl JobStatus {
    /// Terminal jobs accept no further tasks or transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::WaitingForApproval => "waiting_for_approval",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "waiting_for_approval" => Some(Self::WaitingForApproval),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

// ============================================================================
// Stages
// ============================================================================

/// A node in the fixed pipeline graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Initialization,
    PrdGeneration,
    WaitingForApproval,
    PlanGeneration,
    ArchitectureDesign,
    UiuxDesign,
    Development,
    QaTesting,
    SecurityReview,
    Documentation,
    SupportDocs,
    PmReview,
    Delivery,
    Completed,
    Failed,
    Cancelled,
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initialization => "initialization",
            Self::PrdGeneration => "prd_generation",
            Self::WaitingForApproval => "waiting_for_approval",
            Self::PlanGeneration => "plan_generation",
            Self::ArchitectureDesign => "architecture_design",
            Self::UiuxDesign => "uiux_design",
            Self::Development => "development",
            Self::QaTesting => "qa_testing",
            Self::SecurityReview => "security_review",
            Self::Documentation => "documentation",
            Self::SupportDocs => "support_docs",
            Self::PmReview => "pm_review",
            Self::Delivery => "delivery",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "initialization" => Some(Self::Initialization),
            "prd_generation" => Some(Self::PrdGeneration),
            "waiting_for_approval" => Some(Self::WaitingForApproval),
            "plan_generation" => Some(Self::PlanGeneration),
            "architecture_design" => Some(Self::ArchitectureDesign),
            "uiux_design" => Some(Self::UiuxDesign),
            "development" => Some(Self::Development),
            "qa_testing" => Some(Self::QaTesting),
            "security_review" => Some(Self::SecurityReview),
            "documentation" => Some(Self::Documentation),
            "support_docs" => Some(Self::SupportDocs),
            "pm_review" => Some(Self::PmReview),
            "delivery" => Some(Self::Delivery),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Task Status
// ============================================================================

/// Status of one unit of agent work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    InProgress,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "in_progress" => Some(Self::InProgress),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

// ============================================================================
// Agent Kinds
// ============================================================================

/// Tag identifying which stage's work a task performs. Maps 1:1 to an Agent
/// implementation registered at process start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Prd,
    Plan,
    Architect,
    Uiux,
    Developer,
    Qa,
    Security,
    Documentation,
    Support,
    PmReview,
    Delivery,
}

impl AgentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Prd => "prd",
            Self::Plan => "plan",
            Self::Architect => "architect",
            Self::Uiux => "uiux",
            Self::Developer => "developer",
            Self::Qa => "qa",
            Self::Security => "security",
            Self::Documentation => "documentation",
            Self::Support => "support",
            Self::PmReview => "pm_review",
            Self::Delivery => "delivery",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "prd" => Some(Self::Prd),
            "plan" => Some(Self::Plan),
            "architect" => Some(Self::Architect),
            "uiux" => Some(Self::Uiux),
            "developer" => Some(Self::Developer),
            "qa" => Some(Self::Qa),
            "security" => Some(Self::Security),
            "documentation" => Some(Self::Documentation),
            "support" => Some(Self::Support),
            "pm_review" => Some(Self::PmReview),
            "delivery" => Some(Self::Delivery),
            _ => None,
        }
    }

    pub fn all() -> [AgentKind; 11] {
        [
            Self::Prd,
            Self::Plan,
            Self::Architect,
            Self::Uiux,
            Self::Developer,
            Self::Qa,
            Self::Security,
            Self::Documentation,
            Self::Support,
            Self::PmReview,
            Self::Delivery,
        ]
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Approvals
// ============================================================================

/// Human decision at an approval gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve,
    RequestChanges,
}

impl ApprovalDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::RequestChanges => "request_changes",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "approve" => Some(Self::Approve),
            "request_changes" => Some(Self::RequestChanges),
            _ => None,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::WaitingForApproval.is_terminal());

        assert!(TaskStatus::Succeeded.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
    }

    #[test]
    fn stage_round_trips_through_str() {
        let all = [
            Stage::Initialization,
            Stage::PrdGeneration,
            Stage::WaitingForApproval,
            Stage::PlanGeneration,
            Stage::ArchitectureDesign,
            Stage::UiuxDesign,
            Stage::Development,
            Stage::QaTesting,
            Stage::SecurityReview,
            Stage::Documentation,
            Stage::SupportDocs,
            Stage::PmReview,
            Stage::Delivery,
            Stage::Completed,
            Stage::Failed,
            Stage::Cancelled,
        ];
        for stage in all {
            assert_eq!(Stage::parse(stage.as_str()), Some(stage));
        }
        assert_eq!(Stage::parse("unknown"), None);
    }

    #[test]
    fn serde_names_match_as_str() {
        let json = serde_json::to_string(&Stage::QaTesting).unwrap();
        assert_eq!(json, "\"qa_testing\"");
        let json = serde_json::to_string(&AgentKind::PmReview).unwrap();
        assert_eq!(json, "\"pm_review\"");
        let json = serde_json::to_string(&JobStatus::WaitingForApproval).unwrap();
        assert_eq!(json, "\"waiting_for_approval\"");
    }

    #[test]
    fn agent_kind_parse_covers_all() {
        for kind in AgentKind::all() {
            assert_eq!(AgentKind::parse(kind.as_str()), Some(kind));
        }
    }
}
