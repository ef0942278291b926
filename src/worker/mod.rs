//! Worker system: bounded execution of retrying tasks.
//!
//! Core components:
//! - `task`: descriptors, the executor contract, terminal outcomes
//! - `state`: task state machine (Pending → Attempting → Succeeded/Cancelled/Failed)
//! - `retry`: one task wrapped in a cancellation-aware retry loop
//! - `pool`: bounded parallelism, cancel-all, await-all

pub mod pool;
pub mod retry;
pub mod state;
pub mod task;

pub use pool::{PoolReport, TaskTally, WorkerPool};
pub use retry::{RetryPolicy, RetryingTask};
pub use state::{RetryState, TaskLifecycle, TaskState};
pub use task::{TaskContext, TaskDescriptor, TaskExecutor, TaskOutcome};
