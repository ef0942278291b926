//! Stop handling: drain orchestration and external resource release.
//!
//! - `orchestrator`: `Running → StopRequested → Draining → Terminated`
//! - `resources`: the release hook contract plus a tracker implementation

pub mod orchestrator;
pub mod resources;

pub use orchestrator::{DrainVerdict, ShutdownOrchestrator, ShutdownPhase, ShutdownReport};
pub use resources::{NoopReleaser, ResourceId, ResourceReleaser, ResourceTracker};
