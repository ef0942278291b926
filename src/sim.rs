//! Simulated executor for the demo binary and tests.
//!
//! Each attempt opens a fake "session" registered with a
//! [`ResourceTracker`], waits a random latency, and yields one to three
//! records. Closing the session through the tracker (as the orchestrator
//! does on stop) makes the in-flight attempt fail with a resource-unavailable
//! error, the way a real browser call fails once its browser is killed.

use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::TaskError;
use crate::results::ResultRecord;
use crate::shutdown::ResourceTracker;
use crate::worker::task::{TaskContext, TaskDescriptor, TaskExecutor};

pub struct SimulatedExecutor {
    tracker: Arc<ResourceTracker>,
    latency_ms: RangeInclusive<u64>,
    failure_rate: f64,
    records_per_task: RangeInclusive<usize>,
}

impl SimulatedExecutor {
    pub fn new(tracker: Arc<ResourceTracker>) -> Self {
        Self {
            tracker,
            latency_ms: 200..=1500,
            failure_rate: 0.1,
            records_per_task: 1..=3,
        }
    }

    pub fn with_latency(mut self, min: Duration, max: Duration) -> Self {
        let min = min.as_millis() as u64;
        let max = (max.as_millis() as u64).max(min);
        self.latency_ms = min..=max;
        self
    }

    /// Probability that an attempt fails with a transient error.
    pub fn with_failure_rate(mut self, rate: f64) -> Self {
        self.failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_records_per_task(mut self, min: usize, max: usize) -> Self {
        self.records_per_task = min..=max.max(min);
        self
    }
}

#[async_trait]
impl TaskExecutor for SimulatedExecutor {
    async fn execute(
        &self,
        task: &TaskDescriptor,
        ctx: &TaskContext,
    ) -> Result<Vec<ResultRecord>, TaskError> {
        let (latency, fails, produced) = {
            let mut rng = rand::thread_rng();
            (
                Duration::from_millis(rng.gen_range(self.latency_ms.clone())),
                rng.gen_bool(self.failure_rate),
                rng.gen_range(self.records_per_task.clone()),
            )
        };

        let session = CancellationToken::new();
        let closer = session.clone();
        let resource = self
            .tracker
            .track(format!("session:{}", task.id), move || closer.cancel());

        tokio::select! {
            _ = tokio::time::sleep(latency) => {}
            _ = session.cancelled() => {
                debug!(task_id = %task.id, "Session closed mid-attempt");
                return Err(TaskError::resource_unavailable("session closed"));
            }
        }

        self.tracker.release(resource);

        if fails {
            return Err(TaskError::resource_unavailable("page did not respond"));
        }

        Ok((0..produced)
            .map(|index| {
                ResultRecord::new(
                    &task.id,
                    json!({
                        "source": task.input,
                        "index": index,
                        "attempt": ctx.attempt,
                    }),
                )
            })
            .collect())
    }
}
