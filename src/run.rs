//! Run control surface.
//!
//! [`start_run`] validates the configuration and starts a control thread that
//! owns the pool for the whole run: submit, await (with stop handling),
//! persist, summarize. Task work runs on the caller's runtime; the control
//! loop has its own thread and runtime, so tasks stuck in blocking calls
//! cannot keep it from enforcing the drain deadline. The caller keeps a
//! [`RunHandle`] to request a stop and to collect the [`Summary`].

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Local;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::config::RunConfig;
use crate::error::{Error, RunError};
use crate::persist::{
    Destination, JsonLinesPersistence, PersistReport, Persistence, PersistenceGate,
};
use crate::report::{Diagnostics, Reporter, TracingReporter};
use crate::results::ResultStore;
use crate::shutdown::{NoopReleaser, ResourceReleaser, ShutdownOrchestrator};
use crate::signal::CancellationSignal;
use crate::worker::pool::{TaskTally, WorkerPool};
use crate::worker::retry::RetryPolicy;
use crate::worker::task::{TaskDescriptor, TaskExecutor, TaskOutcome};

/// Per-run state shared by every component of one run.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub signal: CancellationSignal,
    pub store: Arc<ResultStore>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Collaborators a run is wired with.
#[derive(Clone)]
pub struct RunDeps {
    pub executor: Arc<dyn TaskExecutor>,
    pub releaser: Arc<dyn ResourceReleaser>,
    pub persistence: Arc<dyn Persistence>,
    pub reporter: Arc<dyn Reporter>,
}

impl RunDeps {
    /// Defaults: nothing to release, JSON Lines on disk, tracing output.
    pub fn new(executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            executor,
            releaser: Arc::new(NoopReleaser),
            persistence: Arc::new(JsonLinesPersistence),
            reporter: Arc::new(TracingReporter),
        }
    }

    pub fn with_releaser(mut self, releaser: Arc<dyn ResourceReleaser>) -> Self {
        self.releaser = releaser;
        self
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = persistence;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }
}

/// Captured results existed but could not be saved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PersistenceFailure {
    pub captured: usize,
    pub reason: String,
}

/// Final account of a run.
#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    /// Records captured (saved or not).
    pub count: usize,
    /// Where they were saved, if they were.
    pub destination: Option<PathBuf>,
    /// A stop was requested before results were persisted.
    pub stopped: bool,
    /// The drain deadline passed and tasks were abandoned.
    pub forced_termination: bool,
    pub persistence_failure: Option<PersistenceFailure>,
    pub tasks: TaskTally,
}

/// Handle to a run in progress.
pub struct RunHandle {
    ctx: RunContext,
    done: oneshot::Receiver<Result<Summary, RunError>>,
}

impl RunHandle {
    /// Ask the run to stop. Safe from any thread, any number of times.
    pub fn request_stop(&self) {
        if self.ctx.signal.request() {
            info!("Stop requested");
        }
    }

    /// A clone of the run's signal, for wiring into other stop sources.
    pub fn stop_signal(&self) -> CancellationSignal {
        self.ctx.signal.clone()
    }

    /// Records captured so far.
    pub fn captured(&self) -> usize {
        self.ctx.store.count()
    }

    /// Wait for the run to finish. Errors only if the control thread itself
    /// died; task and persistence failures are reported in the `Summary`.
    pub async fn await_completion(self) -> Result<Summary, Error> {
        let summary = self.done.await.map_err(|_| {
            RunError::ControlTask("control thread exited without a summary".to_string())
        })??;
        Ok(summary)
    }
}

/// Start a run over `descriptors`. Must be called from within a tokio
/// runtime; tasks are spawned onto it.
pub fn start_run(
    descriptors: impl IntoIterator<Item = TaskDescriptor>,
    config: RunConfig,
    deps: RunDeps,
) -> Result<RunHandle, Error> {
    config.validate()?;

    let descriptors: Vec<TaskDescriptor> = descriptors.into_iter().collect();
    let ctx = RunContext::new();
    let workers = Handle::current();
    let (done_tx, done) = oneshot::channel();

    let control_ctx = ctx.clone();
    std::thread::Builder::new()
        .name("capture-control".to_string())
        .spawn(move || {
            let result = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| RunError::ControlTask(format!("control runtime: {e}")))
                .map(|runtime| {
                    runtime.block_on(drive(control_ctx, descriptors, config, deps, workers))
                });
            if let Err(e) = &result {
                error!("Run aborted: {e}");
            }
            // The caller may have dropped its handle.
            let _ = done_tx.send(result);
        })
        .map_err(|e| RunError::ControlTask(format!("control thread: {e}")))?;

    Ok(RunHandle { ctx, done })
}

async fn drive(
    ctx: RunContext,
    descriptors: Vec<TaskDescriptor>,
    config: RunConfig,
    deps: RunDeps,
    workers: Handle,
) -> Summary {
    let started_at = Local::now();
    let diagnostics = Diagnostics::new(deps.reporter, ctx.signal.clone());

    diagnostics.info(&format!(
        "Starting run → {}",
        started_at.format("%Y-%m-%d_%H-%M")
    ));
    diagnostics.verbose(&format!(
        "{} task(s), {} worker(s), output folder: {}",
        descriptors.len(),
        config.worker_count,
        config.output_dir.display()
    ));

    let mut pool = WorkerPool::new(
        config.worker_count,
        RetryPolicy::from_config(&config),
        deps.executor,
        Arc::clone(&ctx.store),
        ctx.signal.clone(),
    )
    .with_runtime(workers);
    pool.submit(descriptors);

    let mut shutdown = ShutdownOrchestrator::new(&config, ctx.signal.clone(), deps.releaser);
    let pool_report = pool.await_all(&mut shutdown).await;
    let shutdown_report = shutdown.into_report();

    let tally = pool_report.tally;
    info!(
        succeeded = tally.succeeded,
        failed = tally.failed,
        cancelled = tally.cancelled,
        abandoned = tally.abandoned,
        "Tasks finished"
    );
    for (id, outcome) in &pool_report.outcomes {
        match outcome {
            TaskOutcome::Failed { attempts, error } => diagnostics.verbose(&format!(
                "❌ {id} failed after {attempts} attempt(s): {error}"
            )),
            TaskOutcome::Succeeded { .. } => {}
            other => diagnostics.verbose(&format!("⏹️ {id}: {}", other.label())),
        }
    }
    if shutdown_report.forced {
        warn!(abandoned = ?shutdown_report.abandoned, "Run terminated with tasks still running");
    }

    let stopped = ctx.signal.is_set();
    let destination = Destination::for_run(&config, started_at, stopped);
    let gate = PersistenceGate::new(deps.persistence, diagnostics, &config);
    let persisted = gate.persist_and_report(&ctx.store, destination).await;

    let count = persisted.count();
    let (destination, persistence_failure) = match persisted {
        PersistReport::Saved { destination, .. } => (Some(destination.path()), None),
        PersistReport::Empty => (None, None),
        PersistReport::Failed {
            captured, reason, ..
        } => (None, Some(PersistenceFailure { captured, reason })),
    };

    Summary {
        count,
        destination,
        stopped,
        forced_termination: shutdown_report.forced,
        persistence_failure,
        tasks: tally,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::error::{ConfigError, TaskError};
    use crate::results::ResultRecord;
    use crate::worker::task::TaskContext;

    struct Echo;

    #[async_trait]
    impl TaskExecutor for Echo {
        async fn execute(
            &self,
            task: &TaskDescriptor,
            _ctx: &TaskContext,
        ) -> Result<Vec<ResultRecord>, TaskError> {
            Ok(vec![ResultRecord::new(&task.id, task.input.clone())])
        }
    }

    fn config(dir: &std::path::Path) -> RunConfig {
        RunConfig {
            output_dir: dir.to_path_buf(),
            poll_interval_running: Duration::from_millis(20),
            poll_interval_draining: Duration::from_millis(5),
            ..RunConfig::default()
        }
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_before_spawning() {
        let cfg = RunConfig {
            worker_count: 0,
            ..RunConfig::default()
        };
        let result = start_run(Vec::new(), cfg, RunDeps::new(Arc::new(Echo)));
        assert!(matches!(
            result,
            Err(Error::Config(ConfigError::InvalidValue { .. }))
        ));
    }

    #[tokio::test]
    async fn completed_run_is_saved_under_run_stamp() {
        let dir = tempfile::tempdir().unwrap();
        let descriptors =
            (0..3).map(|i| TaskDescriptor::new(format!("t{i}"), json!({ "n": i })));

        let handle = start_run(descriptors, config(dir.path()), RunDeps::new(Arc::new(Echo)))
            .unwrap();
        let summary = handle.await_completion().await.unwrap();

        assert_eq!(summary.count, 3);
        assert!(!summary.stopped);
        assert!(!summary.forced_termination);
        assert_eq!(summary.tasks.succeeded, 3);
        let path = summary.destination.unwrap();
        assert!(path.exists());
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("captured_"));
        assert!(!name.contains("_partial"));
    }

    #[tokio::test]
    async fn stop_before_any_work_saves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let handle = start_run(
            vec![TaskDescriptor::from_id("a")],
            config(dir.path()),
            RunDeps::new(Arc::new(Echo)),
        )
        .unwrap();
        let signal = handle.stop_signal();
        handle.request_stop();
        handle.request_stop();
        assert!(signal.is_set());

        let summary = handle.await_completion().await.unwrap();
        assert!(summary.stopped);
        if let Some(path) = &summary.destination {
            assert!(path.to_string_lossy().ends_with("_partial.jsonl"));
        }
        assert_eq!(summary.tasks.total(), 1);
    }

    #[test]
    fn summary_serializes() {
        let summary = Summary {
            count: 2,
            destination: Some(PathBuf::from("/tmp/out.jsonl")),
            stopped: true,
            forced_termination: false,
            persistence_failure: None,
            tasks: TaskTally {
                succeeded: 2,
                ..TaskTally::default()
            },
        };
        let value = serde_json::to_value(&summary).unwrap();
        assert_eq!(value["count"], 2);
        assert_eq!(value["stopped"], true);
        assert_eq!(value["tasks"]["succeeded"], 2);
        assert!(value["persistence_failure"].is_null());
    }
}
