mod event;
mod failure;
mod pipeline;
mod records;

pub use event::{BusEvent, EventType};
pub use failure::{FailureKind, TaskFailure};
pub use pipeline::{AgentKind, ApprovalDecision, JobStatus, Stage, TaskStatus};
pub use records::{Approval, Artifact, ArtifactType, Job, TaskRecord, Usage};

/// Generate a fresh opaque identifier. All entity ids share this format.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
