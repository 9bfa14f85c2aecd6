// Job Store
// SQLite-backed storage with transactional stage+task writes. One mutexed
// connection; WAL mode; per-job write serialization sits on top of this in
// the orchestrator's job locks.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::Mutex;

use agentbus_types::{
    new_id, AgentKind, Approval, ApprovalDecision, Artifact, ArtifactType, BusEvent, FailureKind,
    Job, JobStatus, Stage, TaskFailure, TaskRecord, TaskStatus, Usage,
};

use crate::{StoreError, StoreResult};

/// Next-task parameters for a transactional stage transition.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub stage: Stage,
    pub agent_kind: AgentKind,
    pub input_data: serde_json::Value,
    pub attempts: u32,
}

/// Result of `finish_task`. `was_applied == false` means the task was
/// already terminal and the call was a no-op.
#[derive(Debug, Clone)]
pub struct FinishOutcome {
    pub task: TaskRecord,
    pub was_applied: bool,
}

pub struct JobStore {
    conn: Arc<Mutex<Connection>>,
}

impl JobStore {
    /// Open (or create) the store at the given path.
    pub async fn open(db_path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(db_path)?;
        Self::from_connection(conn).await
    }

    /// In-memory store for tests and one-shot runs.
    pub async fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn).await
    }

    async fn from_connection(conn: Connection) -> StoreResult<Self> {
        conn.busy_timeout(Duration::from_secs(10))?;
        // PRAGMA journal_mode returns a row, so query_row and ignore it
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
            .or_else(|err| match err {
                // In-memory databases reject WAL; they don't need it
                rusqlite::Error::QueryReturnedNoRows => Ok(()),
                other => Err(other),
            })?;
        conn.execute("PRAGMA synchronous = NORMAL", [])?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> StoreResult<()> {
        let conn = self.conn.lock().await;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS jobs (
                job_id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                requirements TEXT NOT NULL,
                status TEXT NOT NULL,
                stage TEXT NOT NULL,
                metadata TEXT NOT NULL,
                failure_reason TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS tasks (
                task_id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL,
                stage TEXT NOT NULL,
                agent_kind TEXT NOT NULL,
                input_data TEXT NOT NULL,
                output_data TEXT,
                status TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 1,
                enqueued_at TEXT NOT NULL,
                started_at TEXT,
                finished_at TEXT,
                worker_id TEXT,
                error_kind TEXT,
                error_message TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tasks_job_stage ON tasks (job_id, stage)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS artifacts (
                artifact_id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL,
                artifact_type TEXT NOT NULL,
                content TEXT NOT NULL,
                metadata TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_artifacts_job_type
                ON artifacts (job_id, artifact_type)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS approvals (
                approval_id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL,
                stage TEXT NOT NULL,
                decision TEXT NOT NULL,
                notes TEXT,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS usage_counters (
                job_id TEXT PRIMARY KEY,
                input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                calls INTEGER NOT NULL DEFAULT 0,
                cost_usd REAL NOT NULL DEFAULT 0
            )",
            [],
        )?;

        // Optional audit log; the live event surface is the in-memory ring
        conn.execute(
            "CREATE TABLE IF NOT EXISTS events (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                event_id INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                event_type TEXT NOT NULL,
                job_id TEXT,
                stage TEXT,
                agent_kind TEXT,
                data TEXT NOT NULL
            )",
            [],
        )?;

        Ok(())
    }

    // ========================================================================
    // Jobs
    // ========================================================================

    pub async fn create_job(
        &self,
        job_id: &str,
        project_id: &str,
        requirements: &str,
        metadata: serde_json::Value,
    ) -> StoreResult<Job> {
        let job = Job::new(
            job_id.to_string(),
            project_id.to_string(),
            requirements.to_string(),
            metadata,
        );
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO jobs (job_id, project_id, requirements, status, stage, metadata,
                failure_reason, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7, ?8)",
            params![
                job.job_id,
                job.project_id,
                job.requirements,
                job.status.as_str(),
                job.stage.as_str(),
                job.metadata.to_string(),
                ts(&job.created_at),
                ts(&job.updated_at),
            ],
        )?;
        Ok(job)
    }

    pub async fn get_job(&self, job_id: &str) -> StoreResult<Job> {
        let conn = self.conn.lock().await;
        Self::get_job_on(&conn, job_id)
    }

    fn get_job_on(conn: &Connection, job_id: &str) -> StoreResult<Job> {
        conn.query_row(
            "SELECT job_id, project_id, requirements, status, stage, metadata,
                    failure_reason, created_at, updated_at
             FROM jobs WHERE job_id = ?1",
            params![job_id],
            row_to_job,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))
    }

    pub async fn list_jobs(
        &self,
        limit: usize,
        status: Option<JobStatus>,
    ) -> StoreResult<Vec<Job>> {
        let conn = self.conn.lock().await;
        let mut jobs = Vec::new();
        match status {
            Some(status) => {
                let mut stmt = conn.prepare(
                    "SELECT job_id, project_id, requirements, status, stage, metadata,
                            failure_reason, created_at, updated_at
                     FROM jobs WHERE status = ?1
                     ORDER BY created_at DESC, rowid DESC LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![status.as_str(), limit as i64], row_to_job)?;
                for row in rows {
                    jobs.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT job_id, project_id, requirements, status, stage, metadata,
                            failure_reason, created_at, updated_at
                     FROM jobs ORDER BY created_at DESC, rowid DESC LIMIT ?1",
                )?;
                let rows = stmt.query_map(params![limit as i64], row_to_job)?;
                for row in rows {
                    jobs.push(row?);
                }
            }
        }
        Ok(jobs)
    }

    /// Update the job's stage/status. Fails with `Conflict` if the job is
    /// already terminal.
    pub async fn update_job_stage(
        &self,
        job_id: &str,
        stage: Stage,
        status: JobStatus,
        failure_reason: Option<&str>,
    ) -> StoreResult<Job> {
        self.advance_job(job_id, stage, status, failure_reason, Vec::new())
            .await
            .map(|(job, _)| job)
    }

    /// The transition transaction: update the job row and, when the
    /// transition enqueues work, insert the task rows atomically. Fan-out
    /// transitions pass both branches here so neither exists without the
    /// other.
    pub async fn advance_job(
        &self,
        job_id: &str,
        stage: Stage,
        status: JobStatus,
        failure_reason: Option<&str>,
        new_tasks: Vec<NewTask>,
    ) -> StoreResult<(Job, Vec<TaskRecord>)> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let current = tx
            .query_row(
                "SELECT job_id, project_id, requirements, status, stage, metadata,
                        failure_reason, created_at, updated_at
                 FROM jobs WHERE job_id = ?1",
                params![job_id],
                row_to_job,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))?;

        if current.status.is_terminal() {
            return Err(StoreError::Conflict(format!(
                "job {job_id} is terminal ({})",
                current.status.as_str()
            )));
        }

        let now = Utc::now();
        tx.execute(
            "UPDATE jobs SET stage = ?1, status = ?2, failure_reason = ?3, updated_at = ?4
             WHERE job_id = ?5",
            params![
                stage.as_str(),
                status.as_str(),
                failure_reason,
                ts(&now),
                job_id,
            ],
        )?;

        let mut tasks = Vec::with_capacity(new_tasks.len());
        for spec in &new_tasks {
            tasks.push(Self::insert_task_on(&tx, job_id, spec)?);
        }

        tx.commit()?;

        let mut job = current;
        job.stage = stage;
        job.status = status;
        job.failure_reason = failure_reason.map(str::to_string);
        job.updated_at = now;
        Ok((job, tasks))
    }

    /// Restart admission: a terminal (failed or cancelled) job goes back to
    /// the start of the pipeline. History (tasks, artifacts, approvals,
    /// usage) is preserved.
    pub async fn reset_job(&self, job_id: &str) -> StoreResult<Job> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let current = tx
            .query_row(
                "SELECT job_id, project_id, requirements, status, stage, metadata,
                        failure_reason, created_at, updated_at
                 FROM jobs WHERE job_id = ?1",
                params![job_id],
                row_to_job,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))?;
        if !matches!(current.status, JobStatus::Failed | JobStatus::Cancelled) {
            return Err(StoreError::Conflict(format!(
                "job {job_id} is {} and cannot be restarted",
                current.status.as_str()
            )));
        }
        let now = Utc::now();
        tx.execute(
            "UPDATE jobs SET stage = ?1, status = ?2, failure_reason = NULL, updated_at = ?3
             WHERE job_id = ?4",
            params![
                Stage::Initialization.as_str(),
                JobStatus::Queued.as_str(),
                ts(&now),
                job_id,
            ],
        )?;
        tx.commit()?;

        let mut job = current;
        job.stage = Stage::Initialization;
        job.status = JobStatus::Queued;
        job.failure_reason = None;
        job.updated_at = now;
        Ok(job)
    }

    /// Delete a terminal job and everything attached to it.
    pub async fn delete_job(&self, job_id: &str) -> StoreResult<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let status: Option<String> = tx
            .query_row(
                "SELECT status FROM jobs WHERE job_id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()?;
        let status = status.ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))?;
        let parsed = JobStatus::parse(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("job status {status}")))?;
        if !parsed.is_terminal() {
            return Err(StoreError::Conflict(format!(
                "job {job_id} is not terminal ({status})"
            )));
        }
        tx.execute("DELETE FROM tasks WHERE job_id = ?1", params![job_id])?;
        tx.execute("DELETE FROM artifacts WHERE job_id = ?1", params![job_id])?;
        tx.execute("DELETE FROM approvals WHERE job_id = ?1", params![job_id])?;
        tx.execute(
            "DELETE FROM usage_counters WHERE job_id = ?1",
            params![job_id],
        )?;
        tx.execute("DELETE FROM jobs WHERE job_id = ?1", params![job_id])?;
        tx.commit()?;
        Ok(())
    }

    // ========================================================================
    // Tasks
    // ========================================================================

    /// Create a task outside a stage transition (stage retries).
    pub async fn create_task(
        &self,
        job_id: &str,
        stage: Stage,
        agent_kind: AgentKind,
        input_data: serde_json::Value,
        attempts: u32,
    ) -> StoreResult<TaskRecord> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let task = Self::insert_task_on(
            &tx,
            job_id,
            &NewTask {
                stage,
                agent_kind,
                input_data,
                attempts,
            },
        )?;
        tx.commit()?;
        Ok(task)
    }

    fn insert_task_on(
        tx: &rusqlite::Transaction<'_>,
        job_id: &str,
        spec: &NewTask,
    ) -> StoreResult<TaskRecord> {
        // Invariant: at most one non-terminal task per (job, stage)
        let open: i64 = tx.query_row(
            "SELECT COUNT(*) FROM tasks
             WHERE job_id = ?1 AND stage = ?2 AND status IN ('queued', 'in_progress')",
            params![job_id, spec.stage.as_str()],
            |row| row.get(0),
        )?;
        if open > 0 {
            return Err(StoreError::Conflict(format!(
                "job {job_id} already has a non-terminal task for stage {}",
                spec.stage.as_str()
            )));
        }

        let task = TaskRecord {
            task_id: new_id(),
            job_id: job_id.to_string(),
            stage: spec.stage,
            agent_kind: spec.agent_kind,
            input_data: spec.input_data.clone(),
            output_data: None,
            status: TaskStatus::Queued,
            attempts: spec.attempts,
            enqueued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            worker_id: None,
            error: None,
        };
        tx.execute(
            "INSERT INTO tasks (task_id, job_id, stage, agent_kind, input_data, status,
                attempts, enqueued_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                task.task_id,
                task.job_id,
                task.stage.as_str(),
                task.agent_kind.as_str(),
                task.input_data.to_string(),
                task.status.as_str(),
                task.attempts,
                ts(&task.enqueued_at),
            ],
        )?;
        Ok(task)
    }

    /// Exactly-one-claim: only a queued task can be claimed, and only once.
    pub async fn claim_task(&self, task_id: &str, worker_id: &str) -> StoreResult<TaskRecord> {
        let conn = self.conn.lock().await;
        let now = Utc::now();
        let changed = conn.execute(
            "UPDATE tasks SET status = 'in_progress', started_at = ?1, worker_id = ?2
             WHERE task_id = ?3 AND status = 'queued'",
            params![ts(&now), worker_id, task_id],
        )?;
        if changed == 0 {
            let exists: Option<String> = conn
                .query_row(
                    "SELECT status FROM tasks WHERE task_id = ?1",
                    params![task_id],
                    |row| row.get(0),
                )
                .optional()?;
            return match exists {
                Some(status) => Err(StoreError::AlreadyClaimed(format!(
                    "task {task_id} is {status}"
                ))),
                None => Err(StoreError::NotFound(format!("task {task_id}"))),
            };
        }
        Self::get_task_on(&conn, task_id)
    }

    /// Finalize a task. Idempotent: finalizing an already-terminal task is a
    /// no-op reported through `was_applied`.
    pub async fn finish_task(
        &self,
        task_id: &str,
        status: TaskStatus,
        output_data: Option<serde_json::Value>,
        error: Option<TaskFailure>,
    ) -> StoreResult<FinishOutcome> {
        if !status.is_terminal() {
            return Err(StoreError::Conflict(format!(
                "finish_task requires a terminal status, got {}",
                status.as_str()
            )));
        }
        let conn = self.conn.lock().await;
        let now = Utc::now();
        let changed = conn.execute(
            "UPDATE tasks SET status = ?1, output_data = ?2, finished_at = ?3,
                error_kind = ?4, error_message = ?5
             WHERE task_id = ?6 AND status IN ('queued', 'in_progress')",
            params![
                status.as_str(),
                output_data.as_ref().map(|v| v.to_string()),
                ts(&now),
                error.as_ref().map(|e| e.kind.as_str()),
                error.as_ref().map(|e| e.message.as_str()),
                task_id,
            ],
        )?;
        let task = Self::get_task_on(&conn, task_id)?;
        if changed == 0 {
            tracing::debug!(task_id, "finish_task on terminal task ignored");
        }
        Ok(FinishOutcome {
            task,
            was_applied: changed > 0,
        })
    }

    pub async fn get_task(&self, task_id: &str) -> StoreResult<TaskRecord> {
        let conn = self.conn.lock().await;
        Self::get_task_on(&conn, task_id)
    }

    fn get_task_on(conn: &Connection, task_id: &str) -> StoreResult<TaskRecord> {
        conn.query_row(
            &format!("{TASK_COLUMNS} WHERE task_id = ?1"),
            params![task_id],
            row_to_task,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("task {task_id}")))
    }

    pub async fn list_tasks(&self, job_id: &str) -> StoreResult<Vec<TaskRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "{TASK_COLUMNS} WHERE job_id = ?1 ORDER BY enqueued_at ASC, rowid ASC"
        ))?;
        let rows = stmt.query_map(params![job_id], row_to_task)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?);
        }
        Ok(tasks)
    }

    /// Latest task row for (job, stage); retries append rows, so the newest
    /// row is the authoritative one.
    pub async fn latest_task_for_stage(
        &self,
        job_id: &str,
        stage: Stage,
    ) -> StoreResult<Option<TaskRecord>> {
        let conn = self.conn.lock().await;
        Ok(conn
            .query_row(
                &format!(
                    "{TASK_COLUMNS} WHERE job_id = ?1 AND stage = ?2
                     ORDER BY enqueued_at DESC, rowid DESC LIMIT 1"
                ),
                params![job_id, stage.as_str()],
                row_to_task,
            )
            .optional()?)
    }

    /// Operator recovery sweep: in-progress tasks whose claim is older than
    /// the cutoff go back to queued so they can be re-dispatched.
    pub async fn requeue_orphaned_tasks(
        &self,
        older_than: Duration,
    ) -> StoreResult<Vec<TaskRecord>> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than)
                .map_err(|e| StoreError::Conflict(format!("invalid cutoff: {e}")))?;
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let orphaned: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT task_id FROM tasks
                 WHERE status = 'in_progress' AND started_at <= ?1",
            )?;
            let rows = stmt.query_map(params![ts(&cutoff)], |row| row.get(0))?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row?);
            }
            ids
        };
        for task_id in &orphaned {
            tx.execute(
                "UPDATE tasks SET status = 'queued', worker_id = NULL, started_at = NULL
                 WHERE task_id = ?1",
                params![task_id],
            )?;
        }
        let mut requeued = Vec::with_capacity(orphaned.len());
        for task_id in &orphaned {
            requeued.push(
                tx.query_row(
                    &format!("{TASK_COLUMNS} WHERE task_id = ?1"),
                    params![task_id],
                    row_to_task,
                )?,
            );
        }
        tx.commit()?;
        if !requeued.is_empty() {
            tracing::info!(count = requeued.len(), "requeued orphaned tasks");
        }
        Ok(requeued)
    }

    // ========================================================================
    // Artifacts
    // ========================================================================

    /// Append a new artifact row. Reads are latest-wins; prior rows stay as
    /// history until the job is deleted.
    pub async fn upsert_artifact(
        &self,
        job_id: &str,
        artifact_type: ArtifactType,
        content: &str,
        metadata: serde_json::Value,
    ) -> StoreResult<Artifact> {
        let artifact = Artifact {
            artifact_id: new_id(),
            job_id: job_id.to_string(),
            artifact_type,
            content: content.to_string(),
            metadata,
            created_at: Utc::now(),
        };
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO artifacts (artifact_id, job_id, artifact_type, content, metadata,
                created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                artifact.artifact_id,
                artifact.job_id,
                artifact.artifact_type.as_str(),
                artifact.content,
                artifact.metadata.to_string(),
                ts(&artifact.created_at),
            ],
        )?;
        Ok(artifact)
    }

    pub async fn get_latest_artifact(
        &self,
        job_id: &str,
        artifact_type: ArtifactType,
    ) -> StoreResult<Option<Artifact>> {
        let conn = self.conn.lock().await;
        Ok(conn
            .query_row(
                "SELECT artifact_id, job_id, artifact_type, content, metadata, created_at
                 FROM artifacts WHERE job_id = ?1 AND artifact_type = ?2
                 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                params![job_id, artifact_type.as_str()],
                row_to_artifact,
            )
            .optional()?)
    }

    /// Latest artifact per type, for building agent context.
    pub async fn latest_artifacts(
        &self,
        job_id: &str,
    ) -> StoreResult<HashMap<ArtifactType, Artifact>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT artifact_id, job_id, artifact_type, content, metadata, created_at
             FROM artifacts WHERE job_id = ?1 ORDER BY created_at ASC, rowid ASC",
        )?;
        let rows = stmt.query_map(params![job_id], row_to_artifact)?;
        let mut latest = HashMap::new();
        for row in rows {
            let artifact = row?;
            latest.insert(artifact.artifact_type, artifact);
        }
        Ok(latest)
    }

    pub async fn artifact_history(
        &self,
        job_id: &str,
        artifact_type: ArtifactType,
    ) -> StoreResult<Vec<Artifact>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT artifact_id, job_id, artifact_type, content, metadata, created_at
             FROM artifacts WHERE job_id = ?1 AND artifact_type = ?2
             ORDER BY created_at ASC, rowid ASC",
        )?;
        let rows = stmt.query_map(params![job_id, artifact_type.as_str()], row_to_artifact)?;
        let mut artifacts = Vec::new();
        for row in rows {
            artifacts.push(row?);
        }
        Ok(artifacts)
    }

    // ========================================================================
    // Approvals
    // ========================================================================

    pub async fn record_approval(
        &self,
        job_id: &str,
        stage: Stage,
        decision: ApprovalDecision,
        notes: Option<&str>,
    ) -> StoreResult<Approval> {
        let approval = Approval {
            approval_id: new_id(),
            job_id: job_id.to_string(),
            stage,
            decision,
            notes: notes.map(str::to_string),
            created_at: Utc::now(),
        };
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO approvals (approval_id, job_id, stage, decision, notes, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                approval.approval_id,
                approval.job_id,
                approval.stage.as_str(),
                approval.decision.as_str(),
                approval.notes,
                ts(&approval.created_at),
            ],
        )?;
        Ok(approval)
    }

    pub async fn latest_approval(
        &self,
        job_id: &str,
        stage: Stage,
    ) -> StoreResult<Option<Approval>> {
        let conn = self.conn.lock().await;
        Ok(conn
            .query_row(
                "SELECT approval_id, job_id, stage, decision, notes, created_at
                 FROM approvals WHERE job_id = ?1 AND stage = ?2
                 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                params![job_id, stage.as_str()],
                row_to_approval,
            )
            .optional()?)
    }

    // ========================================================================
    // Usage
    // ========================================================================

    pub async fn add_usage(&self, job_id: &str, usage: &Usage) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO usage_counters (job_id, input_tokens, output_tokens, calls, cost_usd)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(job_id) DO UPDATE SET
                input_tokens = input_tokens + excluded.input_tokens,
                output_tokens = output_tokens + excluded.output_tokens,
                calls = calls + excluded.calls,
                cost_usd = cost_usd + excluded.cost_usd",
            params![
                job_id,
                usage.input_tokens as i64,
                usage.output_tokens as i64,
                usage.calls as i64,
                usage.cost_usd,
            ],
        )?;
        Ok(())
    }

    pub async fn get_usage(&self, job_id: &str) -> StoreResult<Usage> {
        let conn = self.conn.lock().await;
        Ok(conn
            .query_row(
                "SELECT input_tokens, output_tokens, calls, cost_usd
                 FROM usage_counters WHERE job_id = ?1",
                params![job_id],
                |row| {
                    Ok(Usage {
                        input_tokens: row.get::<_, i64>(0)? as u64,
                        output_tokens: row.get::<_, i64>(1)? as u64,
                        calls: row.get::<_, i64>(2)? as u64,
                        cost_usd: row.get(3)?,
                    })
                },
            )
            .optional()?
            .unwrap_or_default())
    }

    // ========================================================================
    // Audit events
    // ========================================================================

    pub async fn append_audit_event(&self, event: &BusEvent) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO events (event_id, timestamp, event_type, job_id, stage, agent_kind, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                event.event_id as i64,
                ts(&event.timestamp),
                event.event_type.as_str(),
                event.job_id,
                event.stage.map(|s| s.as_str()),
                event.agent_kind.map(|k| k.as_str()),
                event.data.to_string(),
            ],
        )?;
        Ok(())
    }
}

const TASK_COLUMNS: &str = "SELECT task_id, job_id, stage, agent_kind, input_data, output_data,
    status, attempts, enqueued_at, started_at, finished_at, worker_id, error_kind, error_message
    FROM tasks";

// ============================================================================
// Row mapping
// ============================================================================

/// Fixed-width UTC timestamps so string comparison in SQL orders correctly.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

fn column_err(idx: usize, detail: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, detail.into())
}

fn parse_ts(idx: usize, raw: &str) -> Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| column_err(idx, format!("bad timestamp {raw}: {e}")))
}

fn parse_json(idx: usize, raw: &str) -> Result<serde_json::Value, rusqlite::Error> {
    serde_json::from_str(raw).map_err(|e| column_err(idx, format!("bad json: {e}")))
}

fn row_to_job(row: &Row<'_>) -> Result<Job, rusqlite::Error> {
    let status_raw: String = row.get(3)?;
    let stage_raw: String = row.get(4)?;
    let metadata_raw: String = row.get(5)?;
    let created_raw: String = row.get(7)?;
    let updated_raw: String = row.get(8)?;
    Ok(Job {
        job_id: row.get(0)?,
        project_id: row.get(1)?,
        requirements: row.get(2)?,
        status: JobStatus::parse(&status_raw)
            .ok_or_else(|| column_err(3, format!("bad job status {status_raw}")))?,
        stage: Stage::parse(&stage_raw)
            .ok_or_else(|| column_err(4, format!("bad stage {stage_raw}")))?,
        metadata: parse_json(5, &metadata_raw)?,
        failure_reason: row.get(6)?,
        created_at: parse_ts(7, &created_raw)?,
        updated_at: parse_ts(8, &updated_raw)?,
    })
}

fn row_to_task(row: &Row<'_>) -> Result<TaskRecord, rusqlite::Error> {
    let stage_raw: String = row.get(2)?;
    let kind_raw: String = row.get(3)?;
    let input_raw: String = row.get(4)?;
    let output_raw: Option<String> = row.get(5)?;
    let status_raw: String = row.get(6)?;
    let enqueued_raw: String = row.get(8)?;
    let started_raw: Option<String> = row.get(9)?;
    let finished_raw: Option<String> = row.get(10)?;
    let error_kind: Option<String> = row.get(12)?;
    let error_message: Option<String> = row.get(13)?;

    let error = match (error_kind, error_message) {
        (Some(kind_raw), message) => Some(TaskFailure {
            kind: FailureKind::parse(&kind_raw)
                .ok_or_else(|| column_err(12, format!("bad failure kind {kind_raw}")))?,
            message: message.unwrap_or_default(),
        }),
        (None, _) => None,
    };

    Ok(TaskRecord {
        task_id: row.get(0)?,
        job_id: row.get(1)?,
        stage: Stage::parse(&stage_raw)
            .ok_or_else(|| column_err(2, format!("bad stage {stage_raw}")))?,
        agent_kind: AgentKind::parse(&kind_raw)
            .ok_or_else(|| column_err(3, format!("bad agent kind {kind_raw}")))?,
        input_data: parse_json(4, &input_raw)?,
        output_data: output_raw.as_deref().map(|raw| parse_json(5, raw)).transpose()?,
        status: TaskStatus::parse(&status_raw)
            .ok_or_else(|| column_err(6, format!("bad task status {status_raw}")))?,
        attempts: row.get::<_, i64>(7)? as u32,
        enqueued_at: parse_ts(8, &enqueued_raw)?,
        started_at: started_raw.as_deref().map(|raw| parse_ts(9, raw)).transpose()?,
        finished_at: finished_raw.as_deref().map(|raw| parse_ts(10, raw)).transpose()?,
        worker_id: row.get(11)?,
        error,
    })
}

fn row_to_artifact(row: &Row<'_>) -> Result<Artifact, rusqlite::Error> {
    let type_raw: String = row.get(2)?;
    let metadata_raw: String = row.get(4)?;
    let created_raw: String = row.get(5)?;
    Ok(Artifact {
        artifact_id: row.get(0)?,
        job_id: row.get(1)?,
        artifact_type: ArtifactType::parse(&type_raw)
            .ok_or_else(|| column_err(2, format!("bad artifact type {type_raw}")))?,
        content: row.get(3)?,
        metadata: parse_json(4, &metadata_raw)?,
        created_at: parse_ts(5, &created_raw)?,
    })
}

fn row_to_approval(row: &Row<'_>) -> Result<Approval, rusqlite::Error> {
    let stage_raw: String = row.get(2)?;
    let decision_raw: String = row.get(3)?;
    let created_raw: String = row.get(5)?;
    Ok(Approval {
        approval_id: row.get(0)?,
        job_id: row.get(1)?,
        stage: Stage::parse(&stage_raw)
            .ok_or_else(|| column_err(2, format!("bad stage {stage_raw}")))?,
        decision: ApprovalDecision::parse(&decision_raw)
            .ok_or_else(|| column_err(3, format!("bad decision {decision_raw}")))?,
        notes: row.get(4)?,
        created_at: parse_ts(5, &created_raw)?,
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn test_store() -> JobStore {
        JobStore::open_in_memory().await.unwrap()
    }

    fn prd_task() -> NewTask {
        NewTask {
            stage: Stage::PrdGeneration,
            agent_kind: AgentKind::Prd,
            input_data: json!({"requirements": "Build a notes app"}),
            attempts: 1,
        }
    }

    #[tokio::test]
    async fn create_and_get_job() {
        let store = test_store().await;
        let job = store
            .create_job("j1", "p1", "Build a notes app", json!({"team": "core"}))
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.stage, Stage::Initialization);

        let loaded = store.get_job("j1").await.unwrap();
        assert_eq!(loaded.project_id, "p1");
        assert_eq!(loaded.metadata, json!({"team": "core"}));
    }

    #[tokio::test]
    async fn get_missing_job_is_not_found() {
        let store = test_store().await;
        assert!(matches!(
            store.get_job("nope").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn advance_creates_task_atomically() {
        let store = test_store().await;
        store.create_job("j1", "p1", "req", json!({})).await.unwrap();

        let (job, tasks) = store
            .advance_job(
                "j1",
                Stage::PrdGeneration,
                JobStatus::Running,
                None,
                vec![prd_task()],
            )
            .await
            .unwrap();
        assert_eq!(job.stage, Stage::PrdGeneration);
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, TaskStatus::Queued);
        assert_eq!(tasks[0].attempts, 1);

        let tasks = store.list_tasks("j1").await.unwrap();
        assert_eq!(tasks.len(), 1);
    }

    #[tokio::test]
    async fn advance_terminal_job_conflicts() {
        let store = test_store().await;
        store.create_job("j1", "p1", "req", json!({})).await.unwrap();
        store
            .update_job_stage("j1", Stage::Cancelled, JobStatus::Cancelled, None)
            .await
            .unwrap();

        let result = store
            .advance_job(
                "j1",
                Stage::PrdGeneration,
                JobStatus::Running,
                None,
                vec![prd_task()],
            )
            .await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));
        assert!(store.list_tasks("j1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fan_out_inserts_both_tasks_atomically() {
        let store = test_store().await;
        store.create_job("j1", "p1", "req", json!({})).await.unwrap();
        let (_, tasks) = store
            .advance_job(
                "j1",
                Stage::Documentation,
                JobStatus::Running,
                None,
                vec![
                    NewTask {
                        stage: Stage::Documentation,
                        agent_kind: AgentKind::Documentation,
                        input_data: json!({}),
                        attempts: 1,
                    },
                    NewTask {
                        stage: Stage::SupportDocs,
                        agent_kind: AgentKind::Support,
                        input_data: json!({}),
                        attempts: 1,
                    },
                ],
            )
            .await
            .unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(store.list_tasks("j1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn reset_job_requires_terminal() {
        let store = test_store().await;
        store.create_job("j1", "p1", "req", json!({})).await.unwrap();
        assert!(matches!(
            store.reset_job("j1").await,
            Err(StoreError::Conflict(_))
        ));

        store
            .update_job_stage("j1", Stage::Failed, JobStatus::Failed, Some("upstream: x"))
            .await
            .unwrap();
        let job = store.reset_job("j1").await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.stage, Stage::Initialization);
        assert!(job.failure_reason.is_none());
    }

    #[tokio::test]
    async fn at_most_one_open_task_per_stage() {
        let store = test_store().await;
        store.create_job("j1", "p1", "req", json!({})).await.unwrap();
        store
            .create_task("j1", Stage::PrdGeneration, AgentKind::Prd, json!({}), 1)
            .await
            .unwrap();
        let second = store
            .create_task("j1", Stage::PrdGeneration, AgentKind::Prd, json!({}), 2)
            .await;
        assert!(matches!(second, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let store = test_store().await;
        store.create_job("j1", "p1", "req", json!({})).await.unwrap();
        let task = store
            .create_task("j1", Stage::PrdGeneration, AgentKind::Prd, json!({}), 1)
            .await
            .unwrap();

        let claimed = store.claim_task(&task.task_id, "worker-1").await.unwrap();
        assert_eq!(claimed.status, TaskStatus::InProgress);
        assert_eq!(claimed.worker_id.as_deref(), Some("worker-1"));
        assert!(claimed.started_at.is_some());

        let second = store.claim_task(&task.task_id, "worker-2").await;
        assert!(matches!(second, Err(StoreError::AlreadyClaimed(_))));
    }

    #[tokio::test]
    async fn finish_task_is_idempotent() {
        let store = test_store().await;
        store.create_job("j1", "p1", "req", json!({})).await.unwrap();
        let task = store
            .create_task("j1", Stage::PrdGeneration, AgentKind::Prd, json!({}), 1)
            .await
            .unwrap();
        store.claim_task(&task.task_id, "worker-1").await.unwrap();

        let first = store
            .finish_task(
                &task.task_id,
                TaskStatus::Succeeded,
                Some(json!({"summary": "done"})),
                None,
            )
            .await
            .unwrap();
        assert!(first.was_applied);
        assert_eq!(first.task.status, TaskStatus::Succeeded);

        // Repeat with a different outcome; the task must be unchanged
        let second = store
            .finish_task(
                &task.task_id,
                TaskStatus::Failed,
                None,
                Some(TaskFailure::new(FailureKind::Unknown, "late duplicate")),
            )
            .await
            .unwrap();
        assert!(!second.was_applied);
        assert_eq!(second.task.status, TaskStatus::Succeeded);
        assert_eq!(second.task.output_data, Some(json!({"summary": "done"})));
        assert!(second.task.error.is_none());
    }

    #[tokio::test]
    async fn artifact_reads_are_latest_wins() {
        let store = test_store().await;
        store.create_job("j1", "p1", "req", json!({})).await.unwrap();

        store
            .upsert_artifact("j1", ArtifactType::Prd, "v1", json!({}))
            .await
            .unwrap();
        store
            .upsert_artifact("j1", ArtifactType::Prd, "v2", json!({}))
            .await
            .unwrap();

        let latest = store
            .get_latest_artifact("j1", ArtifactType::Prd)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.content, "v2");

        let history = store
            .artifact_history("j1", ArtifactType::Prd)
            .await
            .unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "v1");
    }

    #[tokio::test]
    async fn latest_artifacts_map_has_one_per_type() {
        let store = test_store().await;
        store.create_job("j1", "p1", "req", json!({})).await.unwrap();
        store
            .upsert_artifact("j1", ArtifactType::Prd, "prd-v1", json!({}))
            .await
            .unwrap();
        store
            .upsert_artifact("j1", ArtifactType::Prd, "prd-v2", json!({}))
            .await
            .unwrap();
        store
            .upsert_artifact("j1", ArtifactType::Plan, "plan", json!({}))
            .await
            .unwrap();

        let latest = store.latest_artifacts("j1").await.unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[&ArtifactType::Prd].content, "prd-v2");
        assert_eq!(latest[&ArtifactType::Plan].content, "plan");
    }

    #[tokio::test]
    async fn approvals_latest_first() {
        let store = test_store().await;
        store.create_job("j1", "p1", "req", json!({})).await.unwrap();
        store
            .record_approval(
                "j1",
                Stage::WaitingForApproval,
                ApprovalDecision::RequestChanges,
                Some("Add offline sync."),
            )
            .await
            .unwrap();
        store
            .record_approval("j1", Stage::WaitingForApproval, ApprovalDecision::Approve, None)
            .await
            .unwrap();

        let latest = store
            .latest_approval("j1", Stage::WaitingForApproval)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.decision, ApprovalDecision::Approve);
    }

    #[tokio::test]
    async fn usage_accumulates_across_writes() {
        let store = test_store().await;
        store.create_job("j1", "p1", "req", json!({})).await.unwrap();
        store
            .add_usage(
                "j1",
                &Usage {
                    input_tokens: 100,
                    output_tokens: 20,
                    calls: 1,
                    cost_usd: 0.01,
                },
            )
            .await
            .unwrap();
        store
            .add_usage(
                "j1",
                &Usage {
                    input_tokens: 50,
                    output_tokens: 30,
                    calls: 2,
                    cost_usd: 0.02,
                },
            )
            .await
            .unwrap();

        let usage = store.get_usage("j1").await.unwrap();
        assert_eq!(usage.input_tokens, 150);
        assert_eq!(usage.output_tokens, 50);
        assert_eq!(usage.calls, 3);
        assert!((usage.cost_usd - 0.03).abs() < 1e-9);
    }

    #[tokio::test]
    async fn requeue_orphaned_resets_stale_claims() {
        let store = test_store().await;
        store.create_job("j1", "p1", "req", json!({})).await.unwrap();
        let task = store
            .create_task("j1", Stage::PrdGeneration, AgentKind::Prd, json!({}), 1)
            .await
            .unwrap();
        store.claim_task(&task.task_id, "worker-1").await.unwrap();

        // Nothing is older than an hour yet
        let swept = store
            .requeue_orphaned_tasks(Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(swept.is_empty());

        let swept = store
            .requeue_orphaned_tasks(Duration::from_secs(0))
            .await
            .unwrap();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].status, TaskStatus::Queued);
        assert!(swept[0].worker_id.is_none());

        // Requeued tasks can be claimed again
        store.claim_task(&task.task_id, "worker-2").await.unwrap();
    }

    #[tokio::test]
    async fn delete_requires_terminal_and_cascades() {
        let store = test_store().await;
        store.create_job("j1", "p1", "req", json!({})).await.unwrap();
        store
            .upsert_artifact("j1", ArtifactType::Prd, "prd", json!({}))
            .await
            .unwrap();

        assert!(matches!(
            store.delete_job("j1").await,
            Err(StoreError::Conflict(_))
        ));

        store
            .update_job_stage("j1", Stage::Cancelled, JobStatus::Cancelled, None)
            .await
            .unwrap();
        store.delete_job("j1").await.unwrap();

        assert!(matches!(
            store.get_job("j1").await,
            Err(StoreError::NotFound(_))
        ));
        assert!(store
            .get_latest_artifact("j1", ArtifactType::Prd)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn list_jobs_filters_by_status() {
        let store = test_store().await;
        store.create_job("j1", "p1", "req", json!({})).await.unwrap();
        store.create_job("j2", "p2", "req", json!({})).await.unwrap();
        store
            .update_job_stage("j2", Stage::Failed, JobStatus::Failed, Some("bad_input: x"))
            .await
            .unwrap();

        let all = store.list_jobs(10, None).await.unwrap();
        assert_eq!(all.len(), 2);

        let failed = store.list_jobs(10, Some(JobStatus::Failed)).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].job_id, "j2");
        assert_eq!(failed[0].failure_reason.as_deref(), Some("bad_input: x"));
    }

    #[tokio::test]
    async fn store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agentbus.db");
        {
            let store = JobStore::open(&path).await.unwrap();
            store.create_job("j1", "p1", "req", json!({})).await.unwrap();
        }
        let store = JobStore::open(&path).await.unwrap();
        let job = store.get_job("j1").await.unwrap();
        assert_eq!(job.project_id, "p1");
    }
}
