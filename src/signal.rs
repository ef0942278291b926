//! Per-run stop signal.
//!
//! A `CancellationSignal` flips from unset to set exactly once and never
//! resets. Every component holds a clone; reads are lock-free. Child signals
//! are handed to individual tasks so the pool can cancel a task without
//! touching the run-wide flag, while a run-wide stop still reaches every
//! child.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::CancellationToken;

/// Monotonic, idempotent stop flag with broadcast semantics.
#[derive(Debug, Clone, Default)]
pub struct CancellationSignal {
    token: CancellationToken,
    // Claimed by the one `request()` call that performs the transition.
    requested: Arc<AtomicBool>,
}

impl CancellationSignal {
    /// Create a fresh, unset signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag. Returns `true` only for the call that performed the
    /// transition, even under concurrent callers; later calls are no-ops.
    pub fn request(&self) -> bool {
        if self.token.is_cancelled() || self.requested.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.token.cancel();
        true
    }

    /// Non-blocking read.
    pub fn is_set(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the flag is set. Resolves immediately if it already is.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Derive a signal that is set whenever this one is, and can also be set
    /// on its own without affecting this one.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            requested: Arc::new(AtomicBool::new(false)),
        }
    }
}
