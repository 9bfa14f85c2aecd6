// Stage Graph
// The fixed pipeline as pure functions. The orchestrator consults this and
// nothing else to decide what follows a successful stage.

use agentbus_types::{AgentKind, ArtifactType, Stage};

/// What happens after a stage succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Pause for a human decision; no task is enqueued
    Gate,
    /// Single successor
    Next(Stage),
    /// Parallel successors, enqueued in one transaction
    FanOut(&'static [Stage]),
    /// Fires `then` only once every peer's latest task has succeeded
    Join {
        peers: &'static [Stage],
        then: Stage,
    },
    /// Pipeline done
    Complete,
}

pub const FAN_OUT_STAGES: &[Stage] = &[Stage::Documentation, Stage::SupportDocs];

pub struct StageGraph;

impl StageGraph {
    /// The stage a fresh (or restarted) job is dispatched into.
    pub fn first_stage() -> Stage {
        Stage::PrdGeneration
    }

    pub fn on_success(stage: Stage) -> Option<Transition> {
        match stage {
            Stage::PrdGeneration => Some(Transition::Gate),
            Stage::PlanGeneration => Some(Transition::Next(Stage::ArchitectureDesign)),
            Stage::ArchitectureDesign => Some(Transition::Next(Stage::UiuxDesign)),
            Stage::UiuxDesign => Some(Transition::Next(Stage::Development)),
            Stage::Development => Some(Transition::Next(Stage::QaTesting)),
            Stage::QaTesting => Some(Transition::Next(Stage::SecurityReview)),
            Stage::SecurityReview => Some(Transition::FanOut(FAN_OUT_STAGES)),
            Stage::Documentation | Stage::SupportDocs => Some(Transition::Join {
                peers: FAN_OUT_STAGES,
                then: Stage::PmReview,
            }),
            Stage::PmReview => Some(Transition::Next(Stage::Delivery)),
            Stage::Delivery => Some(Transition::Complete),
            _ => None,
        }
    }

    /// The stage whose success is gated on human approval.
    pub fn is_gated(stage: Stage) -> bool {
        stage == Stage::PrdGeneration
    }

    pub fn agent_kind(stage: Stage) -> Option<AgentKind> {
        match stage {
            Stage::PrdGeneration => Some(AgentKind::Prd),
            Stage::PlanGeneration => Some(AgentKind::Plan),
            Stage::ArchitectureDesign => Some(AgentKind::Architect),
            Stage::UiuxDesign => Some(AgentKind::Uiux),
            Stage::Development => Some(AgentKind::Developer),
            Stage::QaTesting => Some(AgentKind::Qa),
            Stage::SecurityReview => Some(AgentKind::Security),
            Stage::Documentation => Some(AgentKind::Documentation),
            Stage::SupportDocs => Some(AgentKind::Support),
            Stage::PmReview => Some(AgentKind::PmReview),
            Stage::Delivery => Some(AgentKind::Delivery),
            _ => None,
        }
    }

    pub fn artifact_type(stage: Stage) -> Option<ArtifactType> {
        match stage {
            Stage::PrdGeneration => Some(ArtifactType::Prd),
            Stage::PlanGeneration => Some(ArtifactType::Plan),
            Stage::ArchitectureDesign => Some(ArtifactType::Architecture),
            Stage::UiuxDesign => Some(ArtifactType::Uiux),
            Stage::Development => Some(ArtifactType::Development),
            Stage::QaTesting => Some(ArtifactType::Qa),
            Stage::SecurityReview => Some(ArtifactType::Security),
            Stage::Documentation => Some(ArtifactType::Documentation),
            Stage::SupportDocs => Some(ArtifactType::Support),
            Stage::PmReview => Some(ArtifactType::PmReview),
            Stage::Delivery => Some(ArtifactType::Delivery),
            _ => None,
        }
    }

    /// Every stage that executes an agent, in pipeline order (fan-out
    /// branches adjacent).
    pub fn work_stages() -> [Stage; 11] {
        [
            Stage::PrdGeneration,
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
        ]
    }
}

// ============================================================================
// Tests
// ============================================================================
