// Failure Taxonomy
// Kind-tagged task failures; the orchestrator decides transitions from the
// kind alone and never re-interprets error text

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Required input field missing or malformed
    BadInput,
    /// Per-task hard deadline exceeded
    Timeout,
    /// LLM rate limit exhausted the retry budget
    RateLimited,
    /// Job was cancelled while the task was in flight
    Cancelled,
    QuotaExceeded,
    PermissionDenied,
    /// Upstream 5xx exhausted the retry budget
    Upstream,
    Unknown,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BadInput => "bad_input",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::Cancelled => "cancelled",
            Self::QuotaExceeded => "quota_exceeded",
            Self::PermissionDenied => "permission_denied",
            Self::Upstream => "upstream",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "bad_input" => Some(Self::BadInput),
            "timeout" => Some(Self::Timeout),
            "rate_limited" => Some(Self::RateLimited),
            "cancelled" => Some(Self::Cancelled),
            "quota_exceeded" => Some(Self::QuotaExceeded),
            "permission_denied" => Some(Self::PermissionDenied),
            "upstream" => Some(Self::Upstream),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

/// Terminal error recorded on a failed task and surfaced on the job as
/// `failure_reason = "<kind>: <message>"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl TaskFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_kind_tagged() {
        let failure = TaskFailure::new(FailureKind::Timeout, "exceeded 600000ms");
        assert_eq!(failure.to_string(), "timeout: exceeded 600000ms");
    }

    #[test]
    fn kind_round_trips() {
        for kind in [
            FailureKind::BadInput,
            FailureKind::Timeout,
            FailureKind::RateLimited,
            FailureKind::Cancelled,
            FailureKind::QuotaExceeded,
            FailureKind::PermissionDenied,
            FailureKind::Upstream,
            FailureKind::Unknown,
        ] {
            assert_eq!(FailureKind::parse(kind.as_str()), Some(kind));
        }
    }
}
