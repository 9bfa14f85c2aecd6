// Task Queue
// Advisory dispatcher between the orchestrator and the worker pool. Named
// FIFO queues keyed by worker class, blocking dequeue, visibility deadlines
// with redelivery. The store's claim_task provides the final
// exactly-one-claim guarantee; losing a reference here is recoverable.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;

use agentbus_types::AgentKind;

// ============================================================================
// Worker Classes and Routing
// ============================================================================

/// Worker classes; one logical queue each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerClass {
    Cpu,
    Gpu,
}

impl WorkerClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Gpu => "gpu",
        }
    }

    pub fn all() -> [WorkerClass; 2] {
        [Self::Cpu, Self::Gpu]
    }
}

impl std::fmt::Display for WorkerClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queue selection for a task. Every agent kind defaults to `cpu`; a task
/// whose input carries `ml_required = true` is routed to `gpu`.
pub fn route_for(_kind: AgentKind, ml_required: bool) -> WorkerClass {
    if ml_required {
        WorkerClass::Gpu
    } else {
        WorkerClass::Cpu
    }
}

// ============================================================================
// References
// ============================================================================

/// What the orchestrator enqueues: a pointer into the store, not the task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRef {
    pub task_id: String,
    pub job_id: String,
}

/// A dequeued reference. Valid until `deadline`; `ack` or `nack` with the
/// delivery id before then, or the reference is handed to another worker.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub task_ref: TaskRef,
    pub delivery_id: u64,
    pub deadline: Instant,
}

// ============================================================================
// Queue
// ============================================================================

#[derive(Default)]
struct ClassState {
    ready: VecDeque<TaskRef>,
    in_flight: HashMap<u64, (TaskRef, Instant)>,
    delayed: Vec<(Instant, TaskRef)>,
}

struct ClassQueue {
    state: Mutex<ClassState>,
    notify: Notify,
}

pub struct TaskQueue {
    visibility: Duration,
    classes: HashMap<WorkerClass, Arc<ClassQueue>>,
    next_delivery: std::sync::atomic::AtomicU64,
}

impl TaskQueue {
    pub fn new(visibility: Duration) -> Self {
        let mut classes = HashMap::new();
        for class in WorkerClass::all() {
            classes.insert(
                class,
                Arc::new(ClassQueue {
                    state: Mutex::new(ClassState::default()),
                    notify: Notify::new(),
                }),
            );
        }
        Self {
            visibility,
            classes,
            next_delivery: std::sync::atomic::AtomicU64::new(1),
        }
    }

    fn class(&self, class: WorkerClass) -> &Arc<ClassQueue> {
        // Every class is inserted in new()
        &self.classes[&class]
    }

    /// O(1), at-least-once. Never blocks.
    pub fn enqueue(&self, class: WorkerClass, task_ref: TaskRef) {
        let queue = self.class(class);
        queue.state.lock().ready.push_back(task_ref);
        queue.notify.notify_one();
    }

    /// Blocking dequeue, up to `timeout`. Promotes due redeliveries first.
    pub async fn dequeue(&self, class: WorkerClass, timeout: Duration) -> Option<Delivery> {
        let queue = self.class(class).clone();
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(delivery) = self.try_pop(&queue) {
                return Some(delivery);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let notified = queue.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            // Re-check after registering so an enqueue between the first
            // check and here is not lost
            if let Some(delivery) = self.try_pop(&queue) {
                return Some(delivery);
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return None;
            }
        }
    }

    fn try_pop(&self, queue: &ClassQueue) -> Option<Delivery> {
        let mut state = queue.state.lock();
        Self::promote_due(&mut state);
        let task_ref = state.ready.pop_front()?;
        let delivery_id = self
            .next_delivery
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let deadline = Instant::now() + self.visibility;
        state
            .in_flight
            .insert(delivery_id, (task_ref.clone(), deadline));
        Some(Delivery {
            task_ref,
            delivery_id,
            deadline,
        })
    }

    fn promote_due(state: &mut ClassState) {
        let now = Instant::now();

        let mut due = Vec::new();
        state.delayed.retain(|(at, task_ref)| {
            if *at <= now {
                due.push(task_ref.clone());
                false
            } else {
                true
            }
        });

        let expired: Vec<u64> = state
            .in_flight
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some((task_ref, _)) = state.in_flight.remove(&id) {
                tracing::warn!(task_id = %task_ref.task_id, "visibility expired, redelivering");
                state.ready.push_front(task_ref);
            }
        }

        for task_ref in due {
            state.ready.push_back(task_ref);
        }
    }

    /// Remove a delivered reference. A stale delivery id (already expired
    /// and redelivered) is a no-op; returns whether the ack applied.
    pub fn ack(&self, class: WorkerClass, delivery_id: u64) -> bool {
        let queue = self.class(class);
        queue.state.lock().in_flight.remove(&delivery_id).is_some()
    }

    /// Re-enqueue a delivered reference after `delay`. Stale ids no-op.
    pub fn nack(&self, class: WorkerClass, delivery_id: u64, delay: Duration) -> bool {
        let queue = self.class(class);
        let mut state = queue.state.lock();
        match state.in_flight.remove(&delivery_id) {
            Some((task_ref, _)) => {
                if delay.is_zero() {
                    state.ready.push_back(task_ref);
                    drop(state);
                    queue.notify.notify_one();
                } else {
                    state.delayed.push((Instant::now() + delay, task_ref));
                }
                true
            }
            None => false,
        }
    }

    /// Promote expired in-flight refs and due nacks on every class. Run
    /// periodically so redelivery does not wait for the next dequeue.
    pub fn redeliver_expired(&self) {
        for class in WorkerClass::all() {
            let queue = self.class(class);
            let woke = {
                let mut state = queue.state.lock();
                let before = state.ready.len();
                Self::promote_due(&mut state);
                state.ready.len() > before
            };
            if woke {
                queue.notify.notify_one();
            }
        }
    }

    /// Waiting references (ready + delayed), exposed as a gauge.
    pub fn depth(&self, class: WorkerClass) -> usize {
        let state = self.class(class).state.lock();
        state.ready.len() + state.delayed.len()
    }

    pub fn in_flight(&self, class: WorkerClass) -> usize {
        self.class(class).state.lock().in_flight.len()
    }
}

// ============================================================================
// Tests
// ============================================================================
