// Job Locks
// Per-job async mutex; every stage transition runs under the job's lock so
// no two transitions for one job can interleave. Jobs are independent.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Clone, Default)]
pub struct JobLockManager {
    locks: Arc<parking_lot::Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl JobLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, job_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            locks
                .entry(job_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Drop the entry once the job is deleted.
    pub fn remove(&self, job_id: &str) {
        self.locks.lock().remove(job_id);
    }
}
