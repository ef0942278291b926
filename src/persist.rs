//! Durable saving of captured results.
//!
//! After the pool terminates, [`PersistenceGate::persist_and_report`]
//! snapshots the store once and hands the snapshot to a [`Persistence`]
//! collaborator, retrying transient failures a bounded number of times.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::RunConfig;
use crate::error::PersistError;
use crate::report::Diagnostics;
use crate::results::{ResultRecord, ResultStore};

const STAMP_FORMAT: &str = "%Y-%m-%d_%H-%M";
const EXTENSION: &str = "jsonl";

/// Where a run's results land.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Destination {
    pub dir: PathBuf,
    pub file_name: String,
}

impl Destination {
    pub fn new(dir: impl Into<PathBuf>, file_name: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            file_name: file_name.into(),
        }
    }

    /// `<output_dir>/<prefix>_<run stamp>[_partial].jsonl`
    pub fn for_run(config: &RunConfig, started_at: DateTime<Local>, stopped: bool) -> Self {
        let stamp = started_at.format(STAMP_FORMAT);
        let suffix = if stopped { "_partial" } else { "" };
        Self::new(
            &config.output_dir,
            format!("{}_{stamp}{suffix}.{EXTENSION}", config.output_prefix),
        )
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.file_name)
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path().display())
    }
}

/// Durable storage for a result snapshot.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Make the destination writable. Must be idempotent.
    async fn prepare(&self, destination: &Destination) -> Result<(), PersistError>;

    /// Write the whole snapshot, replacing anything already there.
    async fn save(
        &self,
        records: &[ResultRecord],
        destination: &Destination,
    ) -> Result<(), PersistError>;
}

/// One JSON object per line.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLinesPersistence;

impl JsonLinesPersistence {
    fn encode(records: &[ResultRecord]) -> Result<Vec<u8>, PersistError> {
        let mut buf = Vec::with_capacity(records.len() * 128);
        for record in records {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }
        Ok(buf)
    }

    fn temp_path(path: &Path) -> PathBuf {
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        PathBuf::from(tmp)
    }
}

#[async_trait]
impl Persistence for JsonLinesPersistence {
    async fn prepare(&self, destination: &Destination) -> Result<(), PersistError> {
        tokio::fs::create_dir_all(&destination.dir).await?;
        Ok(())
    }

    async fn save(
        &self,
        records: &[ResultRecord],
        destination: &Destination,
    ) -> Result<(), PersistError> {
        let body = Self::encode(records)?;
        let path = destination.path();
        let tmp = Self::temp_path(&path);

        // Write aside then rename so a failed attempt never leaves a
        // truncated file at the destination.
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&body).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

/// Result of the persistence phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistReport {
    Saved {
        destination: Destination,
        count: usize,
    },
    /// Nothing was captured; no file written.
    Empty,
    Failed {
        destination: Destination,
        captured: usize,
        reason: String,
    },
}

impl PersistReport {
    pub fn count(&self) -> usize {
        match self {
            Self::Saved { count, .. } => *count,
            Self::Failed { captured, .. } => *captured,
            Self::Empty => 0,
        }
    }
}

/// Snapshot, save with bounded retries, report.
pub struct PersistenceGate {
    persistence: Arc<dyn Persistence>,
    diagnostics: Diagnostics,
    attempts: u32,
    retry_delay: Duration,
}

impl PersistenceGate {
    pub fn new(
        persistence: Arc<dyn Persistence>,
        diagnostics: Diagnostics,
        config: &RunConfig,
    ) -> Self {
        Self {
            persistence,
            diagnostics,
            attempts: config.save_attempts.max(1),
            retry_delay: config.save_retry_delay,
        }
    }

    /// Persist whatever `store` holds right now to `destination`.
    pub async fn persist_and_report(
        &self,
        store: &ResultStore,
        destination: Destination,
    ) -> PersistReport {
        let stopped = self.diagnostics.stopping();
        let snapshot = store.snapshot();

        if snapshot.is_empty() {
            if stopped {
                self.diagnostics.info("⚠️ Stopped by user. No data captured.");
            } else {
                self.diagnostics.info("No results captured.");
            }
            return PersistReport::Empty;
        }

        let count = snapshot.len();
        match self.save_with_retry(&snapshot, &destination).await {
            Ok(()) => {
                if stopped {
                    self.diagnostics.info(&format!(
                        "⚠️ Stopped by user. Partial results saved → {destination}"
                    ));
                    self.diagnostics
                        .info(&format!("📊 Captured {count} result(s) before stopping."));
                } else {
                    self.diagnostics
                        .info(&format!("✅ Success! Results saved → {destination}"));
                    self.diagnostics
                        .info(&format!("📊 Total results captured: {count}"));
                }
                PersistReport::Saved { destination, count }
            }
            Err(e) => {
                let reason = e.to_string();
                self.diagnostics.info(&format!(
                    "⚠️ Save failed but {count} result(s) were captured."
                ));
                self.diagnostics.alert(
                    "Save failed",
                    &format!("Could not write {destination}: {reason}"),
                );
                PersistReport::Failed {
                    destination,
                    captured: count,
                    reason,
                }
            }
        }
    }

    async fn save_with_retry(
        &self,
        snapshot: &[ResultRecord],
        destination: &Destination,
    ) -> Result<(), PersistError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match self.persistence.prepare(destination).await {
                Ok(()) => self.persistence.save(snapshot, destination).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => {
                    info!(
                        destination = %destination,
                        records = snapshot.len(),
                        attempt,
                        "Results saved"
                    );
                    return Ok(());
                }
                Err(e) if !e.is_retryable() => {
                    warn!(destination = %destination, attempt, error = %e, "Save failed, not retrying");
                    return Err(e);
                }
                Err(e) if attempt >= self.attempts => {
                    warn!(destination = %destination, attempts = attempt, error = %e, "Save attempts exhausted");
                    return Err(e);
                }
                Err(e) => {
                    debug!(attempt, max = self.attempts, error = %e, "Save attempt failed, retrying");
                    self.diagnostics.verbose(&format!(
                        "⚠️ Save attempt {attempt}/{} failed: {e}",
                        self.attempts
                    ));
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }
    }
}
