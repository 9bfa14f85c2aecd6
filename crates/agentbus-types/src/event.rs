// Bus Events
// Observations emitted by the core; fanned out in-process and over SSE

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::pipeline::{AgentKind, Stage};

/// Every event type the core emits. `DroppedEvent` is synthesized into a
/// lagging subscriber's stream and never enters the ring history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    JobCreated,
    JobStarted,
    JobCompleted,
    JobFailed,
    JobCancelled,
    StageStarted,
    StageCompleted,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    HitlRequested,
    Approved,
    Rejected,
    /// Free-form diagnostic from an agent
    AgentEvent,
    TaskCompletedAfterCancel,
    DroppedEvent,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::JobCreated => "job_created",
            Self::JobStarted => "job_started",
            Self::JobCompleted => "job_completed",
            Self::JobFailed => "job_failed",
            Self::JobCancelled => "job_cancelled",
            Self::StageStarted => "stage_started",
            Self::StageCompleted => "stage_completed",
            Self::TaskStarted => "task_started",
            Self::TaskCompleted => "task_completed",
            Self::TaskFailed => "task_failed",
            Self::HitlRequested => "hitl_requested",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::AgentEvent => "agent_event",
            Self::TaskCompletedAfterCancel => "task_completed_after_cancel",
            Self::DroppedEvent => "dropped_event",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event as observed by subscribers. `event_id` is stamped by the bus on
/// publish and is monotonic for the process lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEvent {
    pub event_id: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_kind: Option<AgentKind>,
    #[serde(default)]
    pub data: Value,
}

impl BusEvent {
    pub fn new(event_type: EventType, data: Value) -> Self {
        Self {
            event_id: 0,
            timestamp: Utc::now(),
            event_type,
            job_id: None,
            stage: None,
            agent_kind: None,
            data,
        }
    }

    pub fn with_job(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn with_agent(mut self, kind: AgentKind) -> Self {
        self.agent_kind = Some(kind);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_serializes_with_type_field() {
        let event = BusEvent::new(EventType::StageCompleted, json!({"ok": true}))
            .with_job("j1")
            .with_stage(Stage::PrdGeneration);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "stage_completed");
        assert_eq!(value["job_id"], "j1");
        assert_eq!(value["stage"], "prd_generation");
        assert!(value.get("agent_kind").is_none());
    }
}
