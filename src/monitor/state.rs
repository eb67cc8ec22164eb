//! Monitor state and outcomes.

use std::time::Duration;

use serde::Serialize;

use crate::scheduler::JobHandle;

/// Where a watched job stands.
///
/// `Pending` is the only non-terminal state. `Timeout` means the monitor
/// gave up; the remote job may still be running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Pending,
    Success,
    Failure { exit_code: i32 },
    Timeout,
}

impl Outcome {
    /// Classifies a backend exit code.
    pub fn from_exit_code(exit_code: i32) -> Self {
        if exit_code == 0 {
            Outcome::Success
        } else {
            Outcome::Failure { exit_code }
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Outcome::Pending)
    }

    /// Short label used for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Pending => "pending",
            Outcome::Success => "success",
            Outcome::Failure { .. } => "failure",
            Outcome::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Failure { exit_code } => write!(f, "failure (exit code {})", exit_code),
            other => f.write_str(other.label()),
        }
    }
}

/// State threaded through the watch loop and returned when it ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonitorState {
    pub handle: JobHandle,
    /// Clock time since the watch started.
    pub elapsed: Duration,
    /// Offset of the first log byte not yet delivered.
    pub last_log_offset: u64,
    /// Status queries issued, including failed ones.
    pub status_queries: u32,
    /// Status or log queries that failed and were skipped.
    pub transient_errors: u32,
    pub outcome: Outcome,
}

impl MonitorState {
    pub fn new(handle: JobHandle) -> Self {
        Self {
            handle,
            elapsed: Duration::ZERO,
            last_log_offset: 0,
            status_queries: 0,
            transient_errors: 0,
            outcome: Outcome::Pending,
        }
    }

    /// Resumes log delivery from `offset`, e.g. for a restarted watcher.
    pub fn with_log_offset(mut self, offset: u64) -> Self {
        self.last_log_offset = offset;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_classification() {
        assert_eq!(Outcome::from_exit_code(0), Outcome::Success);
        assert_eq!(Outcome::from_exit_code(2), Outcome::Failure { exit_code: 2 });
        assert_eq!(Outcome::from_exit_code(-9), Outcome::Failure { exit_code: -9 });
        assert!(!Outcome::Pending.is_terminal());
        assert!(Outcome::Timeout.is_terminal());
    }

    #[test]
    fn test_outcome_display() {
        assert_eq!(Outcome::Success.to_string(), "success");
        assert_eq!(
            Outcome::Failure { exit_code: 3 }.to_string(),
            "failure (exit code 3)"
        );
        assert_eq!(Outcome::Timeout.to_string(), "timeout");
    }

    #[test]
    fn test_new_state_is_pending() {
        let state = MonitorState::new(JobHandle::new("j")).with_log_offset(42);

        assert_eq!(state.outcome, Outcome::Pending);
        assert_eq!(state.last_log_offset, 42);
        assert_eq!(state.status_queries, 0);
    }
}
