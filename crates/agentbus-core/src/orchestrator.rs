// Orchestrator
// The single authority for job progression. Computes the next stage from
// job state + approvals, enqueues tasks, observes task completion, and
// owns the HITL gate. Per-job transitions are serialized by the job lock;
// jobs are independent of each other.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use agentbus_agents::WorkloadClassifier;
use agentbus_events::EventBus;
use agentbus_queue::{route_for, TaskQueue, TaskRef};
use agentbus_store::{JobStore, NewTask};
use agentbus_types::{
    new_id, BusEvent, EventType, FailureKind, Job, JobStatus, Stage, TaskFailure, TaskRecord,
    TaskStatus,
};

use crate::cancellations::CancellationRegistry;
use crate::config::EngineConfig;
use crate::graph::{StageGraph, Transition};
use crate::locks::JobLockManager;
use crate::metrics::Metrics;
use crate::{CoreError, CoreResult};

pub struct Orchestrator {
    store: Arc<JobStore>,
    queue: Arc<TaskQueue>,
    events: EventBus,
    config: EngineConfig,
    locks: JobLockManager,
    cancellations: CancellationRegistry,
    classifier: Arc<dyn WorkloadClassifier>,
    metrics: Arc<Metrics>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<JobStore>,
        queue: Arc<TaskQueue>,
        events: EventBus,
        config: EngineConfig,
        classifier: Arc<dyn WorkloadClassifier>,
    ) -> Self {
        Self {
            store,
            queue,
            events,
            config,
            locks: JobLockManager::new(),
            cancellations: CancellationRegistry::new(),
            classifier,
            metrics: Arc::new(Metrics::new()),
        }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cancellations(&self) -> &CancellationRegistry {
        &self.cancellations
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Publish an event; mirror it into the audit table when configured.
    pub(crate) async fn emit(&self, event: BusEvent) {
        let stamped = self.events.publish(event);
        if self.config.events.audit {
            if let Err(err) = self.store.append_audit_event(&stamped).await {
                tracing::warn!(error = %err, "audit event write failed");
            }
        }
    }

    // ========================================================================
    // Job entry points
    // ========================================================================

    /// Persist a new job and announce it. Dispatch happens in `start_job`
    /// so the creation response never waits on the first transition.
    pub async fn create_job(
        &self,
        project_id: &str,
        requirements: &str,
        metadata: Value,
    ) -> CoreResult<Job> {
        if project_id.trim().is_empty() {
            return Err(CoreError::InvalidInput("project_id is required".into()));
        }
        if requirements.trim().is_empty() {
            return Err(CoreError::InvalidInput("requirements are required".into()));
        }

        let job_id = new_id();
        let job = self
            .store
            .create_job(&job_id, project_id, requirements, metadata)
            .await?;
        Metrics::incr(&self.metrics.jobs_created);
        self.emit(
            BusEvent::new(
                EventType::JobCreated,
                json!({ "project_id": project_id }),
            )
            .with_job(&job_id)
            .with_stage(job.stage),
        )
        .await;
        tracing::info!(job_id, project_id, "job created");
        Ok(job)
    }

    /// Move a queued job into the first pipeline stage.
    pub async fn start_job(&self, job_id: &str) -> CoreResult<()> {
        let _guard = self.locks.lock(job_id).await;
        let job = self.store.get_job(job_id).await?;
        if job.status != JobStatus::Queued {
            return Err(CoreError::Conflict(format!(
                "job {job_id} is {} and cannot be started",
                job.status.as_str()
            )));
        }
        self.emit(
            BusEvent::new(EventType::JobStarted, json!({}))
                .with_job(job_id)
                .with_stage(StageGraph::first_stage()),
        )
        .await;
        self.dispatch(&job, &[StageGraph::first_stage()], None, 1).await
    }

    pub async fn approve(&self, job_id: &str, notes: Option<&str>) -> CoreResult<()> {
        let _guard = self.locks.lock(job_id).await;
        let job = self.require_waiting(job_id).await?;
        self.store
            .record_approval(
                job_id,
                Stage::WaitingForApproval,
                agentbus_types::ApprovalDecision::Approve,
                notes,
            )
            .await?;
        self.emit(
            BusEvent::new(EventType::Approved, json!({ "notes": notes }))
                .with_job(job_id)
                .with_stage(Stage::WaitingForApproval),
        )
        .await;
        tracing::info!(job_id, "approval recorded, resuming pipeline");
        self.dispatch(&job, &[Stage::PlanGeneration], None, 1).await
    }

    /// Reject the PRD: record the decision and re-run prd_generation with
    /// the reviewer's notes. The revised PRD supersedes the prior artifact.
    pub async fn request_changes(&self, job_id: &str, notes: &str) -> CoreResult<()> {
        if notes.trim().is_empty() {
            return Err(CoreError::InvalidInput("notes are required".into()));
        }
        let _guard = self.locks.lock(job_id).await;
        let job = self.require_waiting(job_id).await?;
        self.store
            .record_approval(
                job_id,
                Stage::WaitingForApproval,
                agentbus_types::ApprovalDecision::RequestChanges,
                Some(notes),
            )
            .await?;
        self.emit(
            BusEvent::new(EventType::Rejected, json!({ "notes": notes }))
                .with_job(job_id)
                .with_stage(Stage::WaitingForApproval),
        )
        .await;
        let input = json!({
            "requirements": job.requirements,
            "revision_notes": notes,
        });
        self.dispatch(&job, &[Stage::PrdGeneration], Some(input), 1)
            .await
    }

    pub async fn cancel(&self, job_id: &str, reason: Option<&str>) -> CoreResult<()> {
        let _guard = self.locks.lock(job_id).await;
        let job = self.store.get_job(job_id).await?;
        if job.status.is_terminal() {
            return Err(CoreError::Conflict(format!(
                "job {job_id} is already {}",
                job.status.as_str()
            )));
        }
        self.store
            .update_job_stage(job_id, Stage::Cancelled, JobStatus::Cancelled, None)
            .await?;
        self.cancellations.cancel(job_id);
        Metrics::incr(&self.metrics.jobs_cancelled);
        self.emit(
            BusEvent::new(EventType::JobCancelled, json!({ "reason": reason }))
                .with_job(job_id)
                .with_stage(Stage::Cancelled),
        )
        .await;
        tracing::info!(job_id, reason, "job cancelled");
        Ok(())
    }

    /// Admissible only from failed or cancelled: back to the start of the
    /// pipeline with a fresh cancellation token. History is preserved.
    pub async fn restart(&self, job_id: &str) -> CoreResult<()> {
        let _guard = self.locks.lock(job_id).await;
        let job = self.store.reset_job(job_id).await?;
        self.cancellations.reset(job_id);
        self.emit(
            BusEvent::new(EventType::JobStarted, json!({ "restarted": true }))
                .with_job(job_id)
                .with_stage(StageGraph::first_stage()),
        )
        .await;
        tracing::info!(job_id, "job restarted");
        self.dispatch(&job, &[StageGraph::first_stage()], None, 1).await
    }

    pub async fn delete(&self, job_id: &str) -> CoreResult<()> {
        self.store.delete_job(job_id).await?;
        self.locks.remove(job_id);
        self.cancellations.remove(job_id);
        Ok(())
    }

    /// Operator recovery: return stale in-progress tasks to queued and
    /// re-advertise them to the workers.
    pub async fn requeue_orphaned(&self, older_than: Duration) -> CoreResult<Vec<String>> {
        let requeued = self.store.requeue_orphaned_tasks(older_than).await?;
        let mut ids = Vec::with_capacity(requeued.len());
        for task in requeued {
            let ml = task.input_data["ml_required"].as_bool().unwrap_or(false);
            self.queue.enqueue(
                route_for(task.agent_kind, ml),
                TaskRef {
                    task_id: task.task_id.clone(),
                    job_id: task.job_id.clone(),
                },
            );
            ids.push(task.task_id);
        }
        Ok(ids)
    }

    async fn require_waiting(&self, job_id: &str) -> CoreResult<Job> {
        let job = self.store.get_job(job_id).await?;
        if job.status != JobStatus::WaitingForApproval {
            return Err(CoreError::Conflict(format!(
                "job {job_id} is not waiting for approval (status {})",
                job.status.as_str()
            )));
        }
        Ok(job)
    }

    // ========================================================================
    // Task observation
    // ========================================================================

    /// Worker callback after a task's result write has committed. Emits the
    /// completion events and advances the stage machine.
    pub async fn on_task_terminal(&self, task: &TaskRecord, retry_safe: bool) -> CoreResult<()> {
        let _guard = self.locks.lock(&task.job_id).await;
        let job = self.store.get_job(&task.job_id).await?;

        if job.status.is_terminal() {
            // Result is recorded; nothing moves. Typical after cancel.
            self.emit(
                BusEvent::new(
                    EventType::TaskCompletedAfterCancel,
                    json!({ "task_id": task.task_id, "outcome": task.status }),
                )
                .with_job(&task.job_id)
                .with_stage(task.stage)
                .with_agent(task.agent_kind),
            )
            .await;
            tracing::info!(
                task_id = %task.task_id,
                outcome = task.status.as_str(),
                "task finished after job reached a terminal state"
            );
            return Ok(());
        }

        match task.status {
            TaskStatus::Succeeded => {
                Metrics::incr(&self.metrics.tasks_succeeded);
                self.emit(
                    BusEvent::new(
                        EventType::TaskCompleted,
                        json!({ "task_id": task.task_id, "attempts": task.attempts }),
                    )
                    .with_job(&task.job_id)
                    .with_stage(task.stage)
                    .with_agent(task.agent_kind),
                )
                .await;
                self.emit(
                    BusEvent::new(EventType::StageCompleted, json!({}))
                        .with_job(&task.job_id)
                        .with_stage(task.stage),
                )
                .await;
                self.advance_after_success(&job, task).await
            }
            TaskStatus::Failed => {
                Metrics::incr(&self.metrics.tasks_failed);
                let failure = task.error.clone().unwrap_or_else(|| {
                    TaskFailure::new(FailureKind::Unknown, "task failed without detail")
                });
                self.emit(
                    BusEvent::new(
                        EventType::TaskFailed,
                        json!({
                            "task_id": task.task_id,
                            "kind": failure.kind,
                            "message": failure.message,
                        }),
                    )
                    .with_job(&task.job_id)
                    .with_stage(task.stage)
                    .with_agent(task.agent_kind),
                )
                .await;
                self.handle_task_failure(&job, task, failure, retry_safe).await
            }
            _ => Err(CoreError::Internal(format!(
                "on_task_terminal called with non-terminal task {}",
                task.task_id
            ))),
        }
    }

    async fn advance_after_success(&self, job: &Job, task: &TaskRecord) -> CoreResult<()> {
        let Some(transition) = StageGraph::on_success(task.stage) else {
            return Err(CoreError::Internal(format!(
                "no transition defined for stage {}",
                task.stage
            )));
        };

        match transition {
            Transition::Gate => {
                self.store
                    .update_job_stage(
                        &job.job_id,
                        Stage::WaitingForApproval,
                        JobStatus::WaitingForApproval,
                        None,
                    )
                    .await?;
                self.emit(
                    BusEvent::new(EventType::HitlRequested, json!({ "gated_stage": task.stage }))
                        .with_job(&job.job_id)
                        .with_stage(Stage::WaitingForApproval),
                )
                .await;
                tracing::info!(job_id = %job.job_id, "pipeline paused for approval");
                Ok(())
            }
            Transition::Next(next) => self.dispatch(job, &[next], None, 1).await,
            Transition::FanOut(stages) => self.dispatch(job, stages, None, 1).await,
            Transition::Join { peers, then } => {
                for peer in peers {
                    let latest = self.store.latest_task_for_stage(&job.job_id, *peer).await?;
                    let done = latest
                        .map(|t| t.status == TaskStatus::Succeeded)
                        .unwrap_or(false);
                    if !done {
                        // The other branch completes the join
                        return Ok(());
                    }
                }
                self.dispatch(job, &[then], None, 1).await
            }
            Transition::Complete => {
                self.store
                    .update_job_stage(&job.job_id, Stage::Completed, JobStatus::Completed, None)
                    .await?;
                Metrics::incr(&self.metrics.jobs_completed);
                self.emit(
                    BusEvent::new(EventType::JobCompleted, json!({}))
                        .with_job(&job.job_id)
                        .with_stage(Stage::Completed),
                )
                .await;
                tracing::info!(job_id = %job.job_id, "job completed");
                Ok(())
            }
        }
    }

    async fn handle_task_failure(
        &self,
        job: &Job,
        task: &TaskRecord,
        failure: TaskFailure,
        retry_safe: bool,
    ) -> CoreResult<()> {
        let budget = self.config.orchestrator.stage_retry.max_attempts;
        let retry_allowed =
            retry_safe && failure.kind != FailureKind::Cancelled && task.attempts <= budget;

        if retry_allowed {
            tracing::info!(
                job_id = %job.job_id,
                stage = %task.stage,
                attempt = task.attempts + 1,
                "retrying stage after failure"
            );
            let mut input = task.input_data.clone();
            if let Some(map) = input.as_object_mut() {
                map.remove("ml_required");
            }
            return self
                .dispatch(job, &[task.stage], Some(input), task.attempts + 1)
                .await;
        }

        self.store
            .update_job_stage(
                &job.job_id,
                task.stage,
                JobStatus::Failed,
                Some(&failure.to_string()),
            )
            .await?;
        // Stops the sibling branch of a fan-out, or any other straggler
        self.cancellations.cancel(&job.job_id);
        Metrics::incr(&self.metrics.jobs_failed);
        self.emit(
            BusEvent::new(
                EventType::JobFailed,
                json!({ "reason": failure.to_string() }),
            )
            .with_job(&job.job_id)
            .with_stage(task.stage),
        )
        .await;
        tracing::warn!(job_id = %job.job_id, stage = %task.stage, reason = %failure, "job failed");
        Ok(())
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Create the task rows for the given stages in one transaction, route
    /// the references, and announce the stage starts. The caller holds the
    /// job lock.
    async fn dispatch(
        &self,
        job: &Job,
        stages: &[Stage],
        input_override: Option<Value>,
        attempts: u32,
    ) -> CoreResult<()> {
        let prior = self.store.latest_artifacts(&job.job_id).await?;

        let mut specs = Vec::with_capacity(stages.len());
        for stage in stages {
            let kind = StageGraph::agent_kind(*stage).ok_or_else(|| {
                CoreError::Internal(format!("stage {stage} has no agent kind"))
            })?;
            let mut input = match &input_override {
                Some(value) => value.clone(),
                None => self.default_input(*stage, job, &prior),
            };
            let ml = self.classifier.ml_required(*stage, &prior);
            if let Some(map) = input.as_object_mut() {
                map.insert("ml_required".to_string(), json!(ml));
            }
            specs.push(NewTask {
                stage: *stage,
                agent_kind: kind,
                input_data: input,
                attempts,
            });
        }

        let (_, tasks) = self
            .store
            .advance_job(&job.job_id, stages[0], JobStatus::Running, None, specs)
            .await?;

        for task in &tasks {
            // Announce before the reference becomes visible to workers so
            // stage_started always precedes the worker's task_started
            Metrics::incr(&self.metrics.tasks_dispatched);
            self.emit(
                BusEvent::new(EventType::StageStarted, json!({ "task_id": task.task_id }))
                    .with_job(&job.job_id)
                    .with_stage(task.stage)
                    .with_agent(task.agent_kind),
            )
            .await;
            let ml = task.input_data["ml_required"].as_bool().unwrap_or(false);
            self.queue.enqueue(
                route_for(task.agent_kind, ml),
                TaskRef {
                    task_id: task.task_id.clone(),
                    job_id: task.job_id.clone(),
                },
            );
            tracing::debug!(
                job_id = %job.job_id,
                stage = %task.stage,
                task_id = %task.task_id,
                "stage dispatched"
            );
        }
        Ok(())
    }

    fn default_input(
        &self,
        stage: Stage,
        job: &Job,
        prior: &std::collections::HashMap<agentbus_types::ArtifactType, agentbus_types::Artifact>,
    ) -> Value {
        match stage {
            Stage::PrdGeneration => json!({ "requirements": job.requirements }),
            Stage::PlanGeneration => match prior.get(&agentbus_types::ArtifactType::Prd) {
                Some(prd) => json!({ "prd_artifact_id": prd.artifact_id }),
                None => json!({}),
            },
            _ => json!({}),
        }
    }
}
