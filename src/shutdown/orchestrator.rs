//! Shutdown orchestration.
//!
//! Polled by [`WorkerPool::await_all`] on every tick. The first tick that
//! sees the stop signal releases external resources, cancels outstanding
//! tasks and starts the drain clock. Tasks get `max_drain` to reach a
//! terminal state; after that they are abandoned.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::RunConfig;
use crate::error::RunError;
use crate::shutdown::resources::ResourceReleaser;
use crate::signal::CancellationSignal;
use crate::worker::pool::WorkerPool;

/// Orchestrator phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownPhase {
    Running,
    StopRequested,
    Draining,
    Terminated,
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::StopRequested => "stop_requested",
            Self::Draining => "draining",
            Self::Terminated => "terminated",
        };
        write!(f, "{s}")
    }
}

/// What the pool should do after a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainVerdict {
    /// Sleep this long, then poll again.
    Wait(Duration),
    /// Every task is terminal.
    Done,
    /// Deadline passed; stop waiting for the remaining tasks.
    Abandon,
}

/// How the run ended, from the orchestrator's point of view.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ShutdownReport {
    /// A stop request was observed while tasks were being polled.
    pub stop_observed: bool,
    /// Wall-clock time of that observation.
    pub stop_observed_at: Option<DateTime<Utc>>,
    /// Time from stop observation to termination.
    pub drain_time: Option<Duration>,
    /// The drain deadline passed with tasks still running.
    pub forced: bool,
    /// Ids of the tasks given up on.
    pub abandoned: Vec<String>,
}

/// Drives `Running → StopRequested → Draining → Terminated`.
pub struct ShutdownOrchestrator {
    signal: CancellationSignal,
    releaser: Arc<dyn ResourceReleaser>,
    max_drain: Duration,
    poll_running: Duration,
    poll_draining: Duration,
    phase: ShutdownPhase,
    stop_instant: Option<Instant>,
    released: bool,
    report: ShutdownReport,
}

impl ShutdownOrchestrator {
    pub fn new(
        config: &RunConfig,
        signal: CancellationSignal,
        releaser: Arc<dyn ResourceReleaser>,
    ) -> Self {
        Self {
            signal,
            releaser,
            max_drain: config.max_drain,
            poll_running: config.poll_interval_running,
            poll_draining: config.poll_interval_draining,
            phase: ShutdownPhase::Running,
            stop_instant: None,
            released: false,
            report: ShutdownReport::default(),
        }
    }

    pub fn phase(&self) -> ShutdownPhase {
        self.phase
    }

    /// Polling cadence for the current phase.
    pub fn poll_interval(&self) -> Duration {
        match self.phase {
            ShutdownPhase::Running => self.poll_running,
            _ => self.poll_draining,
        }
    }

    pub fn report(&self) -> &ShutdownReport {
        &self.report
    }

    pub fn into_report(self) -> ShutdownReport {
        self.report
    }

    /// One poll: react to a stop request, then decide whether to keep
    /// waiting, finish, or abandon.
    pub fn observe(&mut self, pool: &WorkerPool) -> DrainVerdict {
        if self.phase == ShutdownPhase::Terminated {
            return DrainVerdict::Done;
        }

        if self.phase == ShutdownPhase::Running && self.signal.is_set() {
            self.begin_stop(pool);
        }

        let active = pool.active_count();
        if active == 0 {
            self.terminate(false);
            return DrainVerdict::Done;
        }

        let deadline_passed = self
            .stop_instant
            .is_some_and(|stopped_at| stopped_at.elapsed() >= self.max_drain);
        if deadline_passed {
            let err = RunError::DrainDeadline {
                deadline: self.max_drain,
                remaining: active,
            };
            warn!("⚠️ Force terminating remaining tasks: {err}");
            return DrainVerdict::Abandon;
        }

        DrainVerdict::Wait(self.poll_interval())
    }

    fn begin_stop(&mut self, pool: &WorkerPool) {
        self.set_phase(ShutdownPhase::StopRequested);
        self.stop_instant = Some(Instant::now());
        self.report.stop_observed = true;
        self.report.stop_observed_at = Some(Utc::now());
        info!("🛑 Stop detected: cancelling remaining tasks...");

        self.release_resources();
        pool.cancel_all();

        self.set_phase(ShutdownPhase::Draining);
        debug!(
            max_drain_ms = self.max_drain.as_millis() as u64,
            active = pool.active_count(),
            "Draining"
        );
    }

    /// Close out an `Abandon` verdict with the ids the pool actually gave
    /// up on.
    pub fn record_abandoned(&mut self, abandoned: Vec<String>) {
        self.report.abandoned = abandoned;
        self.terminate(true);
    }

    /// Invoke the release hook, at most once per orchestrator.
    pub fn release_resources(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let releaser = Arc::clone(&self.releaser);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            releaser.release_all()
        }));
        if result.is_err() {
            warn!("Resource release hook panicked; continuing shutdown");
        }
    }

    fn terminate(&mut self, forced: bool) {
        self.release_resources();
        self.report.forced = forced;
        self.report.drain_time = self.stop_instant.map(|t| t.elapsed());
        self.set_phase(ShutdownPhase::Terminated);

        if forced {
            warn!(
                abandoned = self.report.abandoned.len(),
                "Forced termination after drain deadline"
            );
        } else if self.report.stop_observed {
            info!(
                drain_ms = self.report.drain_time.map(|d| d.as_millis() as u64),
                "All tasks drained after stop"
            );
        }
    }

    fn set_phase(&mut self, phase: ShutdownPhase) {
        debug!(from = %self.phase, to = %phase, "Shutdown phase");
        self.phase = phase;
    }
}
