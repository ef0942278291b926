//! Worker pool: bounded parallel execution of retrying tasks.
//!
//! The pool spawns one tokio task per descriptor; a semaphore with N permits
//! keeps at most N of them attempting work at once, the rest wait in
//! `Pending`. Handles stay owned by the pool until they are drained or
//! abandoned.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::join_all;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::TaskError;
use crate::results::ResultStore;
use crate::shutdown::{DrainVerdict, ShutdownOrchestrator, ShutdownPhase};
use crate::signal::CancellationSignal;
use crate::worker::retry::{RetryPolicy, RetryingTask};
use crate::worker::state::TaskState;
use crate::worker::task::{TaskDescriptor, TaskExecutor, TaskOutcome};

/// Tracked in-flight task.
struct TaskHandle {
    id: String,
    cancel: CancellationSignal,
    cancel_requested: AtomicBool,
    state: watch::Receiver<TaskState>,
    join: JoinHandle<TaskOutcome>,
    abandoned: bool,
}

impl TaskHandle {
    fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Cancel once. Returns `true` if this call did it.
    fn cancel(&self) -> bool {
        if self.is_finished() || self.cancel_requested.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.cancel.request();
        true
    }
}

/// Per-outcome task counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskTally {
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub abandoned: usize,
}

impl TaskTally {
    fn record(&mut self, outcome: &TaskOutcome) {
        match outcome {
            TaskOutcome::Succeeded { .. } => self.succeeded += 1,
            TaskOutcome::Failed { .. } => self.failed += 1,
            TaskOutcome::Cancelled { .. } => self.cancelled += 1,
            TaskOutcome::Abandoned => self.abandoned += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.cancelled + self.abandoned
    }
}

/// What `await_all` hands back once every handle is drained or abandoned.
#[derive(Debug, Clone, Default)]
pub struct PoolReport {
    /// Outcome per task, in submission order.
    pub outcomes: Vec<(String, TaskOutcome)>,
    pub tally: TaskTally,
}

impl PoolReport {
    pub fn outcome(&self, id: &str) -> Option<&TaskOutcome> {
        self.outcomes
            .iter()
            .find(|(task_id, _)| task_id == id)
            .map(|(_, outcome)| outcome)
    }
}

/// Runs tasks with bounded parallelism.
pub struct WorkerPool {
    executor: Arc<dyn TaskExecutor>,
    store: Arc<ResultStore>,
    signal: CancellationSignal,
    permits: Arc<Semaphore>,
    worker_count: usize,
    policy: RetryPolicy,
    handles: Vec<TaskHandle>,
    seen: HashSet<String>,
    runtime: Option<Handle>,
}

impl WorkerPool {
    /// Create a pool with `worker_count` slots (at least one).
    pub fn new(
        worker_count: usize,
        policy: RetryPolicy,
        executor: Arc<dyn TaskExecutor>,
        store: Arc<ResultStore>,
        signal: CancellationSignal,
    ) -> Self {
        let worker_count = worker_count.max(1);
        Self {
            executor,
            store,
            signal,
            permits: Arc::new(Semaphore::new(worker_count)),
            worker_count,
            policy,
            handles: Vec::new(),
            seen: HashSet::new(),
            runtime: None,
        }
    }

    /// Spawn task work onto `runtime` instead of the caller's runtime, so a
    /// task blocking its thread cannot starve whoever drives `await_all`.
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Launch a batch. Up to N run at once, the remainder queue. Returns the
    /// ids accepted; a descriptor whose id was already submitted is skipped.
    pub fn submit(&mut self, descriptors: impl IntoIterator<Item = TaskDescriptor>) -> Vec<String> {
        let mut accepted = Vec::new();

        for descriptor in descriptors {
            if !self.seen.insert(descriptor.id.clone()) {
                warn!(task_id = %descriptor.id, "Skipping duplicate task id");
                continue;
            }

            let id = descriptor.id.clone();
            let cancel = self.signal.child();
            let (task, state) = RetryingTask::new(
                descriptor,
                Arc::clone(&self.executor),
                Arc::clone(&self.store),
                cancel.clone(),
                self.policy,
            );
            let work = task.run_with_permit(Arc::clone(&self.permits));
            let join = match &self.runtime {
                Some(runtime) => runtime.spawn(work),
                None => tokio::spawn(work),
            };

            self.handles.push(TaskHandle {
                id: id.clone(),
                cancel,
                cancel_requested: AtomicBool::new(false),
                state,
                join,
                abandoned: false,
            });
            accepted.push(id);
        }

        debug!(
            submitted = accepted.len(),
            workers = self.worker_count,
            "Submitted task batch"
        );
        accepted
    }

    /// Block until every task is terminal, letting `shutdown` react to a stop
    /// request and bound the drain. Returns the per-task outcomes.
    pub async fn await_all(&mut self, shutdown: &mut ShutdownOrchestrator) -> PoolReport {
        loop {
            match shutdown.observe(self) {
                DrainVerdict::Done => break,
                DrainVerdict::Abandon => {
                    let abandoned = self.abandon_remaining();
                    shutdown.record_abandoned(abandoned);
                    break;
                }
                DrainVerdict::Wait(interval) => {
                    // While running, a stop request wakes the loop early.
                    let running = shutdown.phase() == ShutdownPhase::Running;
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {}
                        _ = self.signal.cancelled(), if running => {}
                    }
                }
            }
        }

        self.collect().await
    }

    /// Request cancellation of every non-terminal task. Returns how many
    /// handles this call cancelled; repeated calls cancel nothing new.
    pub fn cancel_all(&self) -> usize {
        let cancelled = self.handles.iter().filter(|h| h.cancel()).count();
        if cancelled > 0 {
            info!(cancelled, "Cancelling outstanding tasks");
        }
        cancelled
    }

    /// Cancel a single task by id. Returns `false` if unknown, finished, or
    /// already cancelled.
    pub fn cancel(&self, id: &str) -> bool {
        self.handles
            .iter()
            .find(|h| h.id == id)
            .is_some_and(|h| h.cancel())
    }

    /// Current state of a task.
    pub fn state(&self, id: &str) -> Option<TaskState> {
        self.handles
            .iter()
            .find(|h| h.id == id)
            .map(|h| *h.state.borrow())
    }

    /// Tasks not yet finished.
    pub fn active_count(&self) -> usize {
        self.handles.iter().filter(|h| !h.is_finished()).count()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Give up on unfinished tasks: cancel and abort them without waiting.
    /// Returns the ids given up on; exactly these are collected as
    /// `Abandoned`.
    fn abandon_remaining(&mut self) -> Vec<String> {
        let mut abandoned = Vec::new();
        for handle in self.handles.iter_mut().filter(|h| !h.is_finished()) {
            handle.cancel();
            handle.join.abort();
            handle.abandoned = true;
            warn!(task_id = %handle.id, state = %*handle.state.borrow(), "Abandoning task");
            abandoned.push(handle.id.clone());
        }
        // No further work may start for this pool.
        self.permits.close();
        abandoned
    }

    async fn collect(&mut self) -> PoolReport {
        let handles: Vec<TaskHandle> = self.handles.drain(..).collect();
        let finished = join_all(handles.into_iter().map(|handle| async move {
            let outcome = if handle.abandoned {
                TaskOutcome::Abandoned
            } else {
                match handle.join.await {
                    Ok(outcome) => outcome,
                    Err(e) if e.is_panic() => TaskOutcome::Failed {
                        attempts: 0,
                        error: TaskError::other(format!("task panicked: {e}")),
                    },
                    Err(_) => TaskOutcome::Cancelled {
                        attempts: 0,
                        reason: "aborted".to_string(),
                    },
                }
            };
            debug!(task_id = %handle.id, outcome = outcome.label(), "Task collected");
            (handle.id, outcome)
        }))
        .await;

        let mut report = PoolReport::default();
        for (id, outcome) in finished {
            report.tally.record(&outcome);
            report.outcomes.push((id, outcome));
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::config::RunConfig;
    use crate::results::ResultRecord;
    use crate::shutdown::NoopReleaser;
    use crate::worker::task::TaskContext;

    /// Sleeps, then succeeds; records peak concurrency.
    struct Gauge {
        current: AtomicUsize,
        peak: AtomicUsize,
        work: Duration,
    }

    impl Gauge {
        fn new(work: Duration) -> Arc<Self> {
            Arc::new(Self {
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                work,
            })
        }
    }

    #[async_trait]
    impl TaskExecutor for Gauge {
        async fn execute(
            &self,
            task: &TaskDescriptor,
            _ctx: &TaskContext,
        ) -> Result<Vec<ResultRecord>, TaskError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.work).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(vec![ResultRecord::new(&task.id, json!(null))])
        }
    }

    fn config() -> RunConfig {
        RunConfig {
            max_drain: Duration::from_millis(300),
            retry_delay: Duration::from_millis(5),
            poll_interval_running: Duration::from_millis(20),
            poll_interval_draining: Duration::from_millis(5),
            ..RunConfig::default()
        }
    }

    fn pool(
        workers: usize,
        executor: Arc<dyn TaskExecutor>,
        store: &Arc<ResultStore>,
        signal: &CancellationSignal,
    ) -> WorkerPool {
        WorkerPool::new(
            workers,
            RetryPolicy::from_config(&config()),
            executor,
            Arc::clone(store),
            signal.clone(),
        )
    }

    fn orchestrator(signal: &CancellationSignal) -> ShutdownOrchestrator {
        ShutdownOrchestrator::new(&config(), signal.clone(), Arc::new(NoopReleaser))
    }

    fn descriptors(n: usize) -> Vec<TaskDescriptor> {
        (0..n).map(|i| TaskDescriptor::from_id(format!("t{i}"))).collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn parallelism_is_bounded() {
        let gauge = Gauge::new(Duration::from_millis(30));
        let store = Arc::new(ResultStore::new());
        let signal = CancellationSignal::new();
        let mut pool = pool(3, gauge.clone(), &store, &signal);

        let ids = pool.submit(descriptors(10));
        assert_eq!(ids.len(), 10);

        let report = pool.await_all(&mut orchestrator(&signal)).await;
        assert_eq!(report.tally.succeeded, 10);
        assert_eq!(store.count(), 10);
        assert!(gauge.peak.load(Ordering::SeqCst) <= 3);
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn duplicate_ids_are_skipped() {
        let store = Arc::new(ResultStore::new());
        let signal = CancellationSignal::new();
        let mut pool = pool(2, Gauge::new(Duration::ZERO), &store, &signal);

        let ids = pool.submit(vec![
            TaskDescriptor::from_id("a"),
            TaskDescriptor::from_id("a"),
            TaskDescriptor::from_id("b"),
        ]);
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(pool.len(), 2);

        let report = pool.await_all(&mut orchestrator(&signal)).await;
        assert_eq!(report.tally.total(), 2);
    }

    #[tokio::test]
    async fn cancel_all_is_idempotent() {
        let store = Arc::new(ResultStore::new());
        let signal = CancellationSignal::new();
        let mut pool = pool(1, Gauge::new(Duration::from_secs(60)), &store, &signal);
        pool.submit(descriptors(3));

        assert_eq!(pool.cancel_all(), 3);
        assert_eq!(pool.cancel_all(), 0);
        // The run-wide signal is untouched by per-task cancellation.
        assert!(!signal.is_set());
    }

    #[tokio::test]
    async fn cancel_single_task() {
        let store = Arc::new(ResultStore::new());
        let signal = CancellationSignal::new();
        let mut pool = pool(1, Gauge::new(Duration::from_millis(20)), &store, &signal);
        pool.submit(descriptors(2));

        // t1 is queued behind t0 on the single slot.
        assert!(pool.cancel("t1"));
        assert!(!pool.cancel("t1"));
        assert!(!pool.cancel("missing"));

        let report = pool.await_all(&mut orchestrator(&signal)).await;
        assert!(matches!(
            report.outcome("t0"),
            Some(TaskOutcome::Succeeded { .. })
        ));
        assert!(matches!(
            report.outcome("t1"),
            Some(TaskOutcome::Cancelled { attempts: 0, .. })
        ));
    }

    #[tokio::test]
    async fn empty_pool_finishes_immediately() {
        let store = Arc::new(ResultStore::new());
        let signal = CancellationSignal::new();
        let mut pool = pool(2, Gauge::new(Duration::ZERO), &store, &signal);

        let report = pool.await_all(&mut orchestrator(&signal)).await;
        assert_eq!(report.tally, TaskTally::default());
    }

    #[tokio::test]
    async fn state_query_tracks_progress() {
        let store = Arc::new(ResultStore::new());
        let signal = CancellationSignal::new();
        let mut pool = pool(1, Gauge::new(Duration::from_millis(50)), &store, &signal);
        pool.submit(descriptors(2));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.state("t0"), Some(TaskState::Attempting));
        assert_eq!(pool.state("t1"), Some(TaskState::Pending));
        assert_eq!(pool.active_count(), 2);
        assert_eq!(pool.state("nope"), None);

        pool.await_all(&mut orchestrator(&signal)).await;
    }
}
