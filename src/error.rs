//! Error types for capture-pool.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Run error: {0}")]
    Run(#[from] RunError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

impl ConfigError {
    pub(crate) fn invalid(key: &str, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

/// Classified failure reported by a task executor.
///
/// The executor decides the class once, at its own boundary. The retry layer
/// never inspects the message text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// The external resource is closed, gone, or not answering.
    #[error("Resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// Anything else. Not retried.
    #[error("{0}")]
    Other(String),
}

impl TaskError {
    pub fn resource_unavailable(reason: impl Into<String>) -> Self {
        Self::ResourceUnavailable(reason.into())
    }

    pub fn other(reason: impl Into<String>) -> Self {
        Self::Other(reason.into())
    }

    pub fn is_resource_unavailable(&self) -> bool {
        matches!(self, Self::ResourceUnavailable(_))
    }
}

/// Errors from the persistence collaborator.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    /// Worth another attempt (transient I/O, locked file, ...).
    #[error("Retryable persistence failure: {0}")]
    Retryable(String),

    /// Retrying will not help (invalid destination, serialization bug, ...).
    #[error("Persistence failed: {0}")]
    Fatal(String),
}

impl PersistError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

impl From<std::io::Error> for PersistError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::InvalidInput | ErrorKind::PermissionDenied | ErrorKind::Unsupported => {
                Self::Fatal(e.to_string())
            }
            _ => Self::Retryable(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for PersistError {
    fn from(e: serde_json::Error) -> Self {
        Self::Fatal(format!("serialization: {e}"))
    }
}

/// Run-level errors.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Run control task failed: {0}")]
    ControlTask(String),

    #[error("Task {id} already in state {state}, cannot transition to {target}")]
    InvalidTransition {
        id: String,
        state: String,
        target: String,
    },

    #[error("Drain deadline of {deadline:?} exceeded with {remaining} task(s) still running")]
    DrainDeadline { deadline: Duration, remaining: usize },
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_error_classification() {
        assert!(TaskError::resource_unavailable("page closed").is_resource_unavailable());
        assert!(!TaskError::other("bad selector").is_resource_unavailable());
    }

    #[test]
    fn io_errors_map_to_persist_classes() {
        let transient = std::io::Error::new(std::io::ErrorKind::Interrupted, "eintr");
        assert!(PersistError::from(transient).is_retryable());

        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        assert!(!PersistError::from(denied).is_retryable());
    }

    #[test]
    fn error_display() {
        let err: Error = ConfigError::invalid("worker_count", "must be at least 1").into();
        assert_eq!(
            err.to_string(),
            "Configuration error: Invalid configuration value for worker_count: must be at least 1"
        );
    }
}
