//! Task descriptors, the executor contract, and task outcomes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::TaskError;
use crate::results::ResultRecord;
use crate::signal::CancellationSignal;

/// Input describing one unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    /// Caller-chosen identifier, unique within a run.
    pub id: String,
    /// Domain input handed to the executor untouched.
    #[serde(default)]
    pub input: serde_json::Value,
}

impl TaskDescriptor {
    pub fn new(id: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            input,
        }
    }

    /// Descriptor whose input is just its id (e.g. a URL).
    pub fn from_id(id: impl Into<String>) -> Self {
        let id = id.into();
        let input = serde_json::Value::String(id.clone());
        Self { id, input }
    }
}

/// Per-attempt context passed to the executor.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// The task's own stop signal (set on run-wide stop or task cancel).
    pub cancel: CancellationSignal,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Attempt cap for this task.
    pub max_attempts: u32,
}

/// Performs one unit of domain work.
///
/// Called concurrently from many tasks, one call per task at a time.
/// Errors must be classified here; the pool never looks at message text.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Run one attempt and return the records it produced (possibly none).
    async fn execute(
        &self,
        task: &TaskDescriptor,
        ctx: &TaskContext,
    ) -> Result<Vec<ResultRecord>, TaskError>;

    /// Whether an in-flight `execute` future may be dropped when the task is
    /// cancelled. Executors wrapping blocking calls should leave this false;
    /// such a call holds its worker thread until it returns, and a run gives
    /// up on it once the drain deadline passes.
    fn interruptible(&self) -> bool {
        false
    }
}

/// Terminal result of a task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Succeeded { records: usize, attempts: u32 },
    Cancelled { attempts: u32, reason: String },
    Failed { attempts: u32, error: TaskError },
    /// Still running when the drain deadline passed.
    Abandoned,
}

impl TaskOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Succeeded { .. } => "succeeded",
            Self::Cancelled { .. } => "cancelled",
            Self::Failed { .. } => "failed",
            Self::Abandoned => "abandoned",
        }
    }
}
