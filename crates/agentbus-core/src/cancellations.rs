// Cancellation Registry
// One token per job. Workers poll the token between agent steps; cancel
// and fan-out failure both fire it.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

#[derive(Clone, Default)]
pub struct CancellationRegistry {
    tokens: Arc<parking_lot::Mutex<HashMap<String, CancellationToken>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The job's current token, created on first use.
    pub fn token_for(&self, job_id: &str) -> CancellationToken {
        self.tokens
            .lock()
            .entry(job_id.to_string())
            .or_default()
            .clone()
    }

    pub fn cancel(&self, job_id: &str) {
        self.token_for(job_id).cancel();
    }

    /// Fresh token for a restarted job; the old one stays cancelled for
    /// any straggling workers.
    pub fn reset(&self, job_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens
            .lock()
            .insert(job_id.to_string(), token.clone());
        token
    }

    pub fn remove(&self, job_id: &str) {
        self.tokens.lock().remove(job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_fires_existing_token() {
        let registry = CancellationRegistry::new();
        let token = registry.token_for("j1");
        assert!(!token.is_cancelled());
        registry.cancel("j1");
        assert!(token.is_cancelled());
    }

    #[test]
    fn reset_replaces_cancelled_token() {
        let registry = CancellationRegistry::new();
        let old = registry.token_for("j1");
        registry.cancel("j1");
        let fresh = registry.reset("j1");
        assert!(old.is_cancelled());
        assert!(!fresh.is_cancelled());
        assert!(!registry.token_for("j1").is_cancelled());
    }
}
