//! User-facing reporting.
//!
//! The run talks to whoever is watching through a [`Reporter`]. While a stop
//! is in progress nothing may block on the user, so [`Diagnostics`] drops
//! verbose chatter and turns alerts into plain log lines.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::signal::CancellationSignal;

/// Sink for messages meant for a human.
///
/// `alert` is the attention-grabbing channel (a dialog in a desktop shell);
/// implementations may block until acknowledged.
pub trait Reporter: Send + Sync {
    fn info(&self, message: &str);
    fn alert(&self, title: &str, message: &str);
}

/// Reporter that writes everything to the tracing log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn info(&self, message: &str) {
        info!("{message}");
    }

    fn alert(&self, title: &str, message: &str) {
        error!(title = %title, "{message}");
    }
}

/// Stop-aware wrapper around a [`Reporter`].
#[derive(Clone)]
pub struct Diagnostics {
    reporter: Arc<dyn Reporter>,
    signal: CancellationSignal,
}

impl Diagnostics {
    pub fn new(reporter: Arc<dyn Reporter>, signal: CancellationSignal) -> Self {
        Self { reporter, signal }
    }

    pub fn stopping(&self) -> bool {
        self.signal.is_set()
    }

    pub fn info(&self, message: &str) {
        self.reporter.info(message);
    }

    /// Detail only worth showing on a healthy run.
    pub fn verbose(&self, message: &str) {
        if self.stopping() {
            debug!(suppressed = true, "{message}");
            return;
        }
        self.reporter.info(message);
    }

    /// Alert the user, or just log it if a stop is in progress.
    pub fn alert(&self, title: &str, message: &str) {
        if self.stopping() {
            warn!(title = %title, "{message}");
            return;
        }
        self.reporter.alert(title, message);
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingReporter;
    use super::*;

    #[test]
    fn passes_through_while_running() {
        let recorder = Arc::new(RecordingReporter::default());
        let diag = Diagnostics::new(recorder.clone(), CancellationSignal::new());

        diag.info("hello");
        diag.verbose("details");
        diag.alert("Oops", "went wrong");

        assert_eq!(recorder.infos(), vec!["hello", "details"]);
        assert_eq!(
            recorder.alerts(),
            vec![("Oops".to_string(), "went wrong".to_string())]
        );
    }

    #[test]
    fn quiet_while_stopping() {
        let recorder = Arc::new(RecordingReporter::default());
        let signal = CancellationSignal::new();
        let diag = Diagnostics::new(recorder.clone(), signal.clone());
        signal.request();

        diag.info("summary");
        diag.verbose("details");
        diag.alert("Oops", "went wrong");

        assert_eq!(recorder.infos(), vec!["summary"]);
        assert!(recorder.alerts().is_empty());
    }
}
