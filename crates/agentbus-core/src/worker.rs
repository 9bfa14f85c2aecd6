// Worker Pool
// Long-running consumers that turn queued tasks into artifacts. A worker
// claims the task in the store (the queue reference is only advisory),
// executes the agent with a hard deadline, bounded transient retries, and
// cooperative cancellation, then writes results back and notifies the
// orchestrator. The queue reference is acked exactly once per delivery.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use agentbus_agents::{
    Agent, AgentContext, AgentError, AgentOutput, AgentRegistry, LlmClient, MemoryClient,
    SkillsClient,
};
use agentbus_queue::{Delivery, WorkerClass};
use agentbus_store::StoreError;
use agentbus_types::{BusEvent, EventType, FailureKind, TaskFailure, TaskRecord, TaskStatus};

use crate::metrics::Metrics;
use crate::orchestrator::Orchestrator;

/// Grace period for an agent to abandon work after cancellation fires.
const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Outbound clients injected into every agent context.
#[derive(Clone)]
pub struct WorkerClients {
    pub llm: Arc<dyn LlmClient>,
    pub memory: Arc<dyn MemoryClient>,
    pub skills: Arc<dyn SkillsClient>,
}

pub struct WorkerPool {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        orchestrator: Arc<Orchestrator>,
        registry: AgentRegistry,
        clients: WorkerClients,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let mut handles = Vec::new();
        let config = orchestrator.config().clone();
        let pools = [
            (WorkerClass::Cpu, config.workers.cpu_count),
            (WorkerClass::Gpu, config.workers.gpu_count),
        ];
        for (class, count) in pools {
            for index in 0..count {
                let worker = Worker {
                    worker_id: format!("{class}-{index}"),
                    class,
                    orchestrator: orchestrator.clone(),
                    registry: registry.clone(),
                    clients: clients.clone(),
                    shutdown: shutdown.child_token(),
                };
                handles.push(tokio::spawn(worker.run()));
            }
        }
        tracing::info!(
            cpu = config.workers.cpu_count,
            gpu = config.workers.gpu_count,
            "worker pool started"
        );
        Self { shutdown, handles }
    }

    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

struct Worker {
    worker_id: String,
    class: WorkerClass,
    orchestrator: Arc<Orchestrator>,
    registry: AgentRegistry,
    clients: WorkerClients,
    shutdown: CancellationToken,
}

enum RunError {
    Agent(AgentError),
    TimedOut,
}

impl Worker {
    async fn run(self) {
        let dequeue_timeout =
            Duration::from_millis(self.orchestrator.config().worker.dequeue_timeout_ms);
        loop {
            let delivery = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                delivery = self
                    .orchestrator
                    .queue()
                    .dequeue(self.class, dequeue_timeout) => delivery,
            };
            let Some(delivery) = delivery else { continue };
            self.handle_delivery(delivery).await;
        }
        tracing::debug!(worker_id = %self.worker_id, "worker stopped");
    }

    async fn handle_delivery(&self, delivery: Delivery) {
        let task_id = delivery.task_ref.task_id.clone();
        match self
            .orchestrator
            .store()
            .claim_task(&task_id, &self.worker_id)
            .await
        {
            Ok(task) => {
                self.execute(task).await;
                self.orchestrator.queue().ack(self.class, delivery.delivery_id);
            }
            Err(StoreError::AlreadyClaimed(_)) => {
                // Redelivery of a reference another worker owns
                tracing::debug!(task_id, "claim lost, dropping reference");
                self.orchestrator.queue().ack(self.class, delivery.delivery_id);
            }
            Err(err) if err.is_retryable() => {
                tracing::warn!(task_id, error = %err, "store unavailable, backing off");
                self.orchestrator.queue().nack(
                    self.class,
                    delivery.delivery_id,
                    Duration::from_secs(1),
                );
            }
            Err(err) => {
                tracing::error!(task_id, error = %err, "claim failed, dropping reference");
                self.orchestrator.queue().ack(self.class, delivery.delivery_id);
            }
        }
    }

    async fn execute(&self, task: TaskRecord) {
        let store = self.orchestrator.store().clone();
        let cancel = self.orchestrator.cancellations().token_for(&task.job_id);

        let job = match store.get_job(&task.job_id).await {
            Ok(job) => job,
            Err(err) => {
                tracing::error!(task_id = %task.task_id, error = %err, "job lookup failed");
                return;
            }
        };

        if job.status.is_terminal() {
            // Cancel committed between dispatch and claim
            self.finalize(
                &task,
                Err(TaskFailure::new(
                    FailureKind::Cancelled,
                    "job was terminal before execution",
                )),
                false,
            )
            .await;
            return;
        }

        self.orchestrator
            .emit(
                BusEvent::new(
                    EventType::TaskStarted,
                    json!({ "task_id": task.task_id, "worker_id": self.worker_id }),
                )
                .with_job(&task.job_id)
                .with_stage(task.stage)
                .with_agent(task.agent_kind),
            )
            .await;

        let Some(agent) = self.registry.resolve(task.agent_kind) else {
            self.finalize(
                &task,
                Err(TaskFailure::new(
                    FailureKind::BadInput,
                    format!("no agent registered for kind {}", task.agent_kind),
                )),
                false,
            )
            .await;
            return;
        };

        let prior_artifacts = match store.latest_artifacts(&task.job_id).await {
            Ok(artifacts) => artifacts,
            Err(err) => {
                tracing::error!(task_id = %task.task_id, error = %err, "context build failed");
                return;
            }
        };
        let ctx = AgentContext {
            job_id: task.job_id.clone(),
            requirements: job.requirements.clone(),
            prior_artifacts,
            llm: self.clients.llm.clone(),
            memory: self.clients.memory.clone(),
            skills: self.clients.skills.clone(),
            cancel,
        };

        let retry_safe = agent.retry_safe();
        let result = self.run_with_retries(agent, &task, ctx).await;
        self.finalize(&task, result, retry_safe).await;
    }

    /// Transient errors retry with exponential backoff and jitter inside
    /// the per-task deadline; everything else fails immediately.
    async fn run_with_retries(
        &self,
        agent: Arc<dyn Agent>,
        task: &TaskRecord,
        ctx: AgentContext,
    ) -> Result<AgentOutput, TaskFailure> {
        let config = self.orchestrator.config();
        let retry = &config.worker.llm_retry;
        let timeout = Duration::from_millis(config.worker.task_timeout_ms);
        let deadline = Instant::now() + timeout;
        let mut delay = Duration::from_millis(retry.initial_delay_ms);
        let max_delay = Duration::from_millis(retry.max_delay_ms);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.attempt_once(&agent, task, &ctx, deadline).await {
                Ok(output) => return Ok(output),
                Err(RunError::TimedOut) => {
                    return Err(TaskFailure::new(
                        FailureKind::Timeout,
                        format!("task exceeded {}ms deadline", config.worker.task_timeout_ms),
                    ));
                }
                Err(RunError::Agent(err)) => {
                    let budget_left =
                        attempt < retry.max_attempts && Instant::now() < deadline;
                    if err.is_transient() && budget_left {
                        Metrics::incr(&self.orchestrator.metrics().llm_retries);
                        let pause = jittered(delay)
                            .min(deadline.saturating_duration_since(Instant::now()));
                        tracing::warn!(
                            task_id = %task.task_id,
                            attempt,
                            error = %err,
                            delay_ms = pause.as_millis() as u64,
                            "transient agent error, retrying"
                        );
                        tokio::select! {
                            _ = ctx.cancel.cancelled() => {
                                return Err(TaskFailure::new(
                                    FailureKind::Cancelled,
                                    "cancelled during retry backoff",
                                ));
                            }
                            _ = tokio::time::sleep(pause) => {}
                        }
                        delay = (delay * 2).min(max_delay);
                        continue;
                    }
                    return Err(TaskFailure::new(err.failure_kind(), err.to_string()));
                }
            }
        }
    }

    /// One agent attempt inside the deadline. The run is spawned so panics
    /// become a permanent failure instead of taking the worker down; a
    /// cancelled job gets CANCEL_GRACE to yield before the run is aborted.
    async fn attempt_once(
        &self,
        agent: &Arc<dyn Agent>,
        task: &TaskRecord,
        ctx: &AgentContext,
        deadline: Instant,
    ) -> Result<AgentOutput, RunError> {
        let run_agent = agent.clone();
        let input = task.input_data.clone();
        let run_ctx = ctx.clone();
        let mut handle = tokio::spawn(async move { run_agent.run(&input, &run_ctx).await });

        let result = tokio::select! {
            res = &mut handle => flatten_join(res),
            _ = tokio::time::sleep_until(deadline) => {
                handle.abort();
                Err(RunError::TimedOut)
            }
            _ = ctx.cancel.cancelled() => {
                match tokio::time::timeout(CANCEL_GRACE, &mut handle).await {
                    Ok(res) => flatten_join(res),
                    Err(_) => {
                        tracing::warn!(
                            task_id = %task.task_id,
                            "agent ignored cancellation, aborting"
                        );
                        handle.abort();
                        Err(RunError::Agent(AgentError::Cancelled))
                    }
                }
            }
        };
        result
    }

    /// Store commit first, events after: artifact and task writes land,
    /// then the orchestrator observes the terminal task and emits.
    async fn finalize(
        &self,
        task: &TaskRecord,
        result: Result<AgentOutput, TaskFailure>,
        retry_safe: bool,
    ) {
        let store = self.orchestrator.store();
        let outcome = match result {
            Ok(output) => {
                let artifact_meta = json!({
                    "stage": task.stage,
                    "task_id": task.task_id,
                    "worker_id": self.worker_id,
                });
                if let Err(err) = store
                    .upsert_artifact(
                        &task.job_id,
                        output.artifact_type,
                        &output.content,
                        artifact_meta.clone(),
                    )
                    .await
                {
                    tracing::error!(task_id = %task.task_id, error = %err, "artifact write failed");
                    return;
                }
                for (artifact_type, content) in &output.extra_artifacts {
                    if let Err(err) = store
                        .upsert_artifact(&task.job_id, *artifact_type, content, artifact_meta.clone())
                        .await
                    {
                        tracing::error!(
                            task_id = %task.task_id,
                            artifact_type = %artifact_type,
                            error = %err,
                            "extra artifact write failed"
                        );
                    }
                }
                if let Err(err) = store.add_usage(&task.job_id, &output.usage).await {
                    tracing::warn!(task_id = %task.task_id, error = %err, "usage write failed");
                }
                let output_data = json!({
                    "structured_output": output.structured_output,
                    "memory_hits": output.memory_hits,
                    "usage": output.usage,
                });
                store
                    .finish_task(&task.task_id, TaskStatus::Succeeded, Some(output_data), None)
                    .await
            }
            Err(failure) => {
                store
                    .finish_task(&task.task_id, TaskStatus::Failed, None, Some(failure))
                    .await
            }
        };

        match outcome {
            Ok(outcome) if outcome.was_applied => {
                if let Err(err) = self
                    .orchestrator
                    .on_task_terminal(&outcome.task, retry_safe)
                    .await
                {
                    tracing::error!(
                        task_id = %task.task_id,
                        error = %err,
                        "stage transition failed"
                    );
                }
            }
            Ok(_) => {
                tracing::info!(task_id = %task.task_id, "duplicate finalize ignored");
            }
            Err(err) => {
                // The claim stands; the orphan sweep re-dispatches this task
                tracing::error!(task_id = %task.task_id, error = %err, "result write failed");
            }
        }
    }
}

fn flatten_join(
    res: Result<Result<AgentOutput, AgentError>, tokio::task::JoinError>,
) -> Result<AgentOutput, RunError> {
    match res {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(err)) => Err(RunError::Agent(err)),
        Err(join) if join.is_panic() => Err(RunError::Agent(AgentError::Other(
            "agent panicked".to_string(),
        ))),
        Err(_) => Err(RunError::Agent(AgentError::Cancelled)),
    }
}

/// +/-20% jitter so retrying workers do not stampede.
fn jittered(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.8..=1.2);
    delay.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_bounds() {
        let base = Duration::from_millis(1_000);
        for _ in 0..100 {
            let j = jittered(base);
            assert!(j >= Duration::from_millis(800), "{j:?}");
            assert!(j <= Duration::from_millis(1_200), "{j:?}");
        }
    }
}
