//! Cancellation-aware retry loop around a single task.
//!
//! The same low-level error is classified differently depending on whether a
//! stop is in progress: a resource that disappears because shutdown closed
//! it is a cancellation, not a crash.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, watch};
use tracing::{debug, info, warn};

use crate::config::RunConfig;
use crate::error::TaskError;
use crate::results::{ResultRecord, ResultStore};
use crate::signal::CancellationSignal;
use crate::worker::state::{RetryState, TaskLifecycle, TaskState};
use crate::worker::task::{TaskContext, TaskDescriptor, TaskExecutor, TaskOutcome};

/// Attempt cap and spacing for one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            max_attempts: config.retry_limit,
            delay: config.retry_delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RunConfig::default())
    }
}

/// One task driven through `Pending → Attempting → terminal`.
pub struct RetryingTask {
    descriptor: TaskDescriptor,
    executor: Arc<dyn TaskExecutor>,
    store: Arc<ResultStore>,
    cancel: CancellationSignal,
    policy: RetryPolicy,
    lifecycle: TaskLifecycle,
    state_tx: watch::Sender<TaskState>,
}

impl RetryingTask {
    /// Create a task. The returned receiver tracks its state.
    pub fn new(
        descriptor: TaskDescriptor,
        executor: Arc<dyn TaskExecutor>,
        store: Arc<ResultStore>,
        cancel: CancellationSignal,
        policy: RetryPolicy,
    ) -> (Self, watch::Receiver<TaskState>) {
        let (state_tx, state_rx) = watch::channel(TaskState::Pending);
        let lifecycle = TaskLifecycle::new(descriptor.id.clone());
        let task = Self {
            descriptor,
            executor,
            store,
            cancel,
            policy,
            lifecycle,
            state_tx,
        };
        (task, state_rx)
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    /// Wait for a worker slot, then run. A stop while queued cancels the task
    /// without attempting it.
    pub async fn run_with_permit(mut self, permits: Arc<Semaphore>) -> TaskOutcome {
        let permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            permit = permits.acquire_owned() => permit.ok(),
        };

        match permit {
            Some(_permit) => self.run().await,
            None => self.finish_cancelled(0, "cancelled while queued"),
        }
    }

    /// Run attempts until the task reaches a terminal state.
    pub async fn run(mut self) -> TaskOutcome {
        let mut retry = RetryState::new(self.policy.max_attempts);

        loop {
            if self.cancel.is_set() {
                return self.finish_cancelled(retry.attempts(), "stop requested before attempt");
            }

            if self.lifecycle.state == TaskState::Pending {
                self.set_state(TaskState::Attempting, None);
            }

            let attempt = retry.begin_attempt();
            let ctx = TaskContext {
                cancel: self.cancel.clone(),
                attempt,
                max_attempts: retry.max_attempts(),
            };
            debug!(task_id = %self.id(), attempt, "Attempt starting");

            let result = if self.executor.interruptible() {
                tokio::select! {
                    result = self.executor.execute(&self.descriptor, &ctx) => Some(result),
                    _ = self.cancel.cancelled() => None,
                }
            } else {
                Some(self.executor.execute(&self.descriptor, &ctx).await)
            };

            let error = match result {
                None => return self.finish_cancelled(attempt, "attempt interrupted by stop"),
                Some(Ok(records)) => return self.finish_succeeded(records, attempt),
                Some(Err(error)) => error,
            };

            match error {
                TaskError::ResourceUnavailable(_) if self.cancel.is_set() => {
                    debug!(
                        task_id = %self.id(),
                        error = %error,
                        "Resource closed during shutdown"
                    );
                    return self.finish_cancelled(attempt, "resource released during shutdown");
                }
                TaskError::ResourceUnavailable(_) => {
                    let reason = error.to_string();
                    if !retry.record_failure(error) {
                        warn!(
                            task_id = %self.id(),
                            attempts = attempt,
                            error = %reason,
                            "Giving up after retries"
                        );
                        return self.finish_failed(retry);
                    }

                    warn!(
                        task_id = %self.id(),
                        "Retry {}/{}: {}",
                        attempt + 1,
                        retry.max_attempts(),
                        reason
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(self.policy.delay) => {}
                        _ = self.cancel.cancelled() => {
                            return self.finish_cancelled(attempt, "stop requested during retry delay");
                        }
                    }
                }
                TaskError::Other(_) if self.cancel.is_set() => {
                    debug!(task_id = %self.id(), error = %error, "Task error during shutdown");
                    return self.finish_cancelled(attempt, "errored during shutdown");
                }
                TaskError::Other(_) => {
                    warn!(task_id = %self.id(), error = %error, "Task failed");
                    retry.record_failure(error);
                    return self.finish_failed(retry);
                }
            }
        }
    }

    fn set_state(&mut self, state: TaskState, reason: Option<&str>) {
        if let Err(e) = self.lifecycle.transition_to(state) {
            warn!(task_id = %self.id(), error = %e, "Ignoring invalid task transition");
            return;
        }
        debug!(task_id = %self.id(), state = %state, reason, "Task state");
        self.state_tx.send_replace(state);
    }

    fn finish_succeeded(&mut self, records: Vec<ResultRecord>, attempts: u32) -> TaskOutcome {
        let count = records.len();
        self.store.extend(records);
        self.set_state(TaskState::Succeeded, None);
        info!(
            task_id = %self.id(),
            records = count,
            attempts,
            elapsed_ms = self.lifecycle.elapsed().map(|d| d.as_millis() as u64),
            "Task succeeded"
        );
        TaskOutcome::Succeeded {
            records: count,
            attempts,
        }
    }

    fn finish_cancelled(&mut self, attempts: u32, reason: &str) -> TaskOutcome {
        self.set_state(TaskState::Cancelled, Some(reason));
        debug!(task_id = %self.id(), attempts, reason, "Task cancelled");
        TaskOutcome::Cancelled {
            attempts,
            reason: reason.to_string(),
        }
    }

    fn finish_failed(&mut self, retry: RetryState) -> TaskOutcome {
        let attempts = retry.attempts();
        let error = retry
            .into_last_error()
            .unwrap_or_else(|| TaskError::other("unknown failure"));
        let reason = error.to_string();
        self.set_state(TaskState::Failed, Some(&reason));
        TaskOutcome::Failed { attempts, error }
    }
}
