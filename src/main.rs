use std::sync::Arc;

use anyhow::{Context, bail};
use tracing::warn;

use capture_pool::config::RunConfig;
use capture_pool::run::{RunDeps, start_run};
use capture_pool::shutdown::ResourceTracker;
use capture_pool::signal::CancellationSignal;
use capture_pool::sim::SimulatedExecutor;
use capture_pool::worker::TaskDescriptor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (log_writer, log_guard) = tracing_appender::non_blocking(std::io::stderr());
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(log_writer)
        .init();

    let Some(list_path) = std::env::args().nth(1) else {
        eprintln!("Usage: capture-pool <task-list-file>");
        eprintln!("  One task id per line; blank lines and lines starting with # are skipped.");
        std::process::exit(2);
    };

    let text = tokio::fs::read_to_string(&list_path)
        .await
        .with_context(|| format!("reading task list {list_path}"))?;
    let descriptors: Vec<TaskDescriptor> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(TaskDescriptor::from_id)
        .collect();
    if descriptors.is_empty() {
        bail!("{list_path} contains no task ids");
    }

    let config = RunConfig::from_env();

    eprintln!("📸 Capture Pool v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Tasks: {}", descriptors.len());
    eprintln!("   Workers: {}", config.worker_count);
    eprintln!("   Output: {}", config.output_dir.display());
    eprintln!("   Press Ctrl+C to stop and keep partial results.\n");

    let tracker = ResourceTracker::new();
    let executor = Arc::new(SimulatedExecutor::new(Arc::clone(&tracker)));
    let deps = RunDeps::new(executor).with_releaser(tracker);

    let handle = start_run(descriptors, config, deps)?;
    tokio::spawn(handle_ctrl_c(handle.stop_signal()));

    let summary = handle.await_completion().await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);

    let failed_to_save = summary.persistence_failure.is_some();
    drop(log_guard);
    if failed_to_save {
        std::process::exit(1);
    }
    Ok(())
}

/// First Ctrl+C stops the run and lets it save; a second one exits at once.
async fn handle_ctrl_c(signal: CancellationSignal) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl+C: {e}");
        return;
    }
    eprintln!("\n🛑 Stopping... partial results will be saved. Ctrl+C again to abort.");
    signal.request();

    if tokio::signal::ctrl_c().await.is_ok() {
        eprintln!("\nReceived second Ctrl+C, aborting immediately.");
        std::process::exit(130);
    }
}
