//! Task state machine and retry bookkeeping.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RunError, TaskError};

/// State of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Queued, waiting for a worker slot.
    Pending,
    /// Inside an attempt or waiting between attempts.
    Attempting,
    /// Work done, records appended.
    Succeeded,
    /// Stopped because the run (or this task) was cancelled.
    Cancelled,
    /// Retries exhausted or a non-retryable error.
    Failed,
}

impl TaskState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: TaskState) -> bool {
        use TaskState::*;

        matches!(
            (self, target),
            (Pending, Attempting) | (Pending, Cancelled) |
            (Attempting, Succeeded) | (Attempting, Cancelled) | (Attempting, Failed)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Attempting => "attempting",
            Self::Succeeded => "succeeded",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Attempts made so far and the last error seen.
#[derive(Debug, Clone)]
pub struct RetryState {
    attempts: u32,
    max_attempts: u32,
    last_error: Option<TaskError>,
}

impl RetryState {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempts: 0,
            max_attempts: max_attempts.max(1),
            last_error: None,
        }
    }

    /// Count an attempt about to start.
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    /// Record a failed attempt. Returns `true` if another attempt is allowed.
    pub fn record_failure(&mut self, error: TaskError) -> bool {
        self.last_error = Some(error);
        self.attempts < self.max_attempts
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn into_last_error(self) -> Option<TaskError> {
        self.last_error
    }
}

/// Lifecycle of one task: current state and when it started and finished.
#[derive(Debug, Clone)]
pub struct TaskLifecycle {
    pub task_id: String,
    pub state: TaskState,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskLifecycle {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            state: TaskState::Pending,
            started_at: None,
            finished_at: None,
        }
    }

    /// Transition to a new state.
    pub fn transition_to(&mut self, new_state: TaskState) -> Result<(), RunError> {
        if !self.state.can_transition_to(new_state) {
            return Err(RunError::InvalidTransition {
                id: self.task_id.clone(),
                state: self.state.to_string(),
                target: new_state.to_string(),
            });
        }

        self.state = new_state;

        match new_state {
            TaskState::Attempting if self.started_at.is_none() => {
                self.started_at = Some(Utc::now());
            }
            s if s.is_terminal() => {
                self.finished_at = Some(Utc::now());
            }
            _ => {}
        }

        Ok(())
    }

    /// Time spent since the first attempt started.
    pub fn elapsed(&self) -> Option<Duration> {
        self.started_at.map(|start| {
            let end = self.finished_at.unwrap_or_else(Utc::now);
            end.signed_duration_since(start)
                .to_std()
                .unwrap_or(Duration::ZERO)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions_valid() {
        assert!(TaskState::Pending.can_transition_to(TaskState::Attempting));
        assert!(TaskState::Pending.can_transition_to(TaskState::Cancelled));
        assert!(TaskState::Attempting.can_transition_to(TaskState::Succeeded));
        assert!(TaskState::Attempting.can_transition_to(TaskState::Failed));
        assert!(TaskState::Attempting.can_transition_to(TaskState::Cancelled));
    }

    #[test]
    fn state_transitions_invalid() {
        assert!(!TaskState::Pending.can_transition_to(TaskState::Succeeded));
        assert!(!TaskState::Pending.can_transition_to(TaskState::Failed));
        assert!(!TaskState::Succeeded.can_transition_to(TaskState::Attempting));
        assert!(!TaskState::Cancelled.can_transition_to(TaskState::Attempting));
        assert!(!TaskState::Failed.can_transition_to(TaskState::Cancelled));
    }

    #[test]
    fn terminal_states() {
        assert!(TaskState::Succeeded.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
        assert!(!TaskState::Pending.is_terminal());
        assert!(!TaskState::Attempting.is_terminal());
    }

    #[test]
    fn lifecycle_timestamps() {
        let mut lc = TaskLifecycle::new("t1");
        lc.transition_to(TaskState::Attempting).unwrap();
        assert!(lc.started_at.is_some());
        assert!(lc.finished_at.is_none());

        lc.transition_to(TaskState::Succeeded).unwrap();
        assert!(lc.finished_at.is_some());
        assert_eq!(lc.state, TaskState::Succeeded);
        assert!(lc.elapsed().is_some());
    }

    #[test]
    fn invalid_transition_reports_states() {
        let mut lc = TaskLifecycle::new("t1");
        let err = lc.transition_to(TaskState::Failed).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Task t1 already in state pending, cannot transition to failed"
        );
        assert_eq!(lc.state, TaskState::Pending);
    }

    #[test]
    fn retry_state_counts_attempts() {
        let mut retry = RetryState::new(3);
        retry.begin_attempt();
        assert!(retry.record_failure(TaskError::resource_unavailable("closed")));
        retry.begin_attempt();
        assert!(retry.record_failure(TaskError::resource_unavailable("closed")));
        retry.begin_attempt();
        assert!(!retry.record_failure(TaskError::resource_unavailable("closed")));
        assert_eq!(retry.attempts(), 3);
        assert_eq!(
            retry.into_last_error(),
            Some(TaskError::resource_unavailable("closed"))
        );
    }

    #[test]
    fn retry_state_minimum_one_attempt() {
        assert_eq!(RetryState::new(0).max_attempts(), 1);
    }

    #[test]
    fn task_state_serde() {
        let json = serde_json::to_string(&TaskState::Attempting).unwrap();
        assert_eq!(json, "\"attempting\"");
    }
}
