//! External resource release.
//!
//! Workers hold heavyweight handles (browser sessions, child processes).
//! On stop the orchestrator calls [`ResourceReleaser::release_all`] once so
//! that blocked calls on those handles return promptly with a
//! resource-unavailable error.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Best-effort release of every externally held resource.
///
/// Must be idempotent and must tolerate resources that are already gone.
/// Should return quickly; it runs on the control task.
pub trait ResourceReleaser: Send + Sync {
    fn release_all(&self);
}

impl<F> ResourceReleaser for F
where
    F: Fn() + Send + Sync,
{
    fn release_all(&self) {
        self()
    }
}

/// Releaser for runs whose executor holds nothing external.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopReleaser;

impl ResourceReleaser for NoopReleaser {
    fn release_all(&self) {}
}

/// Handle to a tracked resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceId(Uuid);

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

struct TrackedResource {
    label: String,
    close: Box<dyn FnOnce() + Send>,
}

/// Registry of open resources and how to close them.
///
/// Executors register a close callback when they open a resource and
/// release it themselves on the normal path; whatever is still registered
/// when a stop arrives is closed by `release_all`.
#[derive(Default)]
pub struct ResourceTracker {
    resources: Mutex<HashMap<ResourceId, TrackedResource>>,
}

impl ResourceTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ResourceId, TrackedResource>> {
        self.resources.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register an open resource with its close callback.
    pub fn track(
        &self,
        label: impl Into<String>,
        close: impl FnOnce() + Send + 'static,
    ) -> ResourceId {
        let id = ResourceId(Uuid::new_v4());
        let label = label.into();
        debug!(resource_id = %id, label = %label, "Tracking resource");
        self.lock().insert(
            id,
            TrackedResource {
                label,
                close: Box::new(close),
            },
        );
        id
    }

    /// Close one resource now. Returns `false` if it was already released.
    pub fn release(&self, id: ResourceId) -> bool {
        let resource = self.lock().remove(&id);
        match resource {
            Some(resource) => {
                close_quietly(resource);
                true
            }
            None => false,
        }
    }

    /// Stop tracking a resource its owner already closed.
    pub fn forget(&self, id: ResourceId) -> bool {
        self.lock().remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ResourceReleaser for ResourceTracker {
    fn release_all(&self) {
        let drained: Vec<TrackedResource> = self.lock().drain().map(|(_, r)| r).collect();
        if drained.is_empty() {
            return;
        }

        info!("Closing {} active resource(s)...", drained.len());
        for resource in drained {
            close_quietly(resource);
        }
        info!("All resources closed.");
    }
}

// Close errors are expected during forced shutdown; a panicking closer must
// not take the control task down with it.
fn close_quietly(resource: TrackedResource) {
    let TrackedResource { label, close } = resource;
    if catch_unwind(AssertUnwindSafe(close)).is_err() {
        warn!(label = %label, "Resource close callback panicked");
    }
}
