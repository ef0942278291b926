//! Capture pool: bounded concurrent capture runs with prompt, bounded-time
//! stop and retryable saving of partial results.

pub mod config;
pub mod error;
pub mod persist;
pub mod report;
pub mod results;
pub mod run;
pub mod shutdown;
pub mod signal;
pub mod sim;
pub mod worker;

pub use config::RunConfig;
pub use error::{Error, Result};
pub use run::{RunContext, RunDeps, RunHandle, Summary, start_run};
pub use signal::CancellationSignal;
