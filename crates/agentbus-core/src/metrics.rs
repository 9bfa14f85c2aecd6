// Process Metrics
// Plain atomic counters plus queue-depth gauges, rendered into Prometheus
// text exposition format for /metrics.

use std::sync::atomic::{AtomicU64, Ordering};

use agentbus_queue::{TaskQueue, WorkerClass};

#[derive(Default)]
pub struct Metrics {
    pub jobs_created: AtomicU64,
    pub jobs_completed: AtomicU64,
    pub jobs_failed: AtomicU64,
    pub jobs_cancelled: AtomicU64,
    pub tasks_dispatched: AtomicU64,
    pub tasks_succeeded: AtomicU64,
    pub tasks_failed: AtomicU64,
    pub llm_retries: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn render(&self, queue: &TaskQueue) -> String {
        let mut out = String::new();
        let counters: [(&str, &str, &AtomicU64); 8] = [
            ("agentbus_jobs_created_total", "Jobs created", &self.jobs_created),
            (
                "agentbus_jobs_completed_total",
                "Jobs run to completion",
                &self.jobs_completed,
            ),
            ("agentbus_jobs_failed_total", "Jobs failed", &self.jobs_failed),
            (
                "agentbus_jobs_cancelled_total",
                "Jobs cancelled",
                &self.jobs_cancelled,
            ),
            (
                "agentbus_tasks_dispatched_total",
                "Tasks enqueued for workers",
                &self.tasks_dispatched,
            ),
            (
                "agentbus_tasks_succeeded_total",
                "Tasks finished successfully",
                &self.tasks_succeeded,
            ),
            ("agentbus_tasks_failed_total", "Tasks failed", &self.tasks_failed),
            (
                "agentbus_llm_retries_total",
                "Transient LLM errors retried",
                &self.llm_retries,
            ),
        ];
        for (name, help, counter) in counters {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {}\n",
                counter.load(Ordering::Relaxed)
            ));
        }

        out.push_str(
            "# HELP agentbus_queue_depth Waiting task references per queue\n\
             # TYPE agentbus_queue_depth gauge\n",
        );
        for class in WorkerClass::all() {
            out.push_str(&format!(
                "agentbus_queue_depth{{queue=\"{}\"}} {}\n",
                class,
                queue.depth(class)
            ));
        }
        out.push_str(
            "# HELP agentbus_queue_in_flight Delivered but unacked references per queue\n\
             # TYPE agentbus_queue_in_flight gauge\n",
        );
        for class in WorkerClass::all() {
            out.push_str(&format!(
                "agentbus_queue_in_flight{{queue=\"{}\"}} {}\n",
                class,
                queue.in_flight(class)
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn render_is_scrapeable() {
        let metrics = Metrics::new();
        Metrics::incr(&metrics.jobs_created);
        Metrics::incr(&metrics.jobs_created);
        let queue = TaskQueue::new(Duration::from_secs(60));

        let text = metrics.render(&queue);
        assert!(text.contains("agentbus_jobs_created_total 2"));
        assert!(text.contains("# TYPE agentbus_jobs_created_total counter"));
        assert!(text.contains("agentbus_queue_depth{queue=\"cpu\"} 0"));
        assert!(text.contains("agentbus_queue_depth{queue=\"gpu\"} 0"));
    }
}
