//! Read-only views over the run and event store, plus retention.

use crate::bootstrap;
use crate::config::Config;
use anyhow::{Context, Result};
use deskpilot_core::RunStore;

pub async fn runs(config: &Config, limit: usize) -> Result<()> {
    let store = bootstrap::open_store(config)?;
    let runs = store.load_runs(limit).await?;
    if runs.is_empty() {
        println!("No runs recorded");
        return Ok(());
    }

    println!("{:<36}  {:<16}  {:>9}  {:<20}  OBJECTIVE", "RUN", "STATUS", "ITER", "STARTED");
    for run in runs {
        println!(
            "{:<36}  {:<16}  {:>4}/{:<4}  {:<20}  {}",
            run.run_id,
            run.status.as_str(),
            run.iteration,
            run.max_iterations,
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
            run.objective
        );
    }
    Ok(())
}

pub async fn show(config: &Config, run_id: &str) -> Result<()> {
    let store = bootstrap::open_store(config)?;
    let run = store
        .get_run(run_id)
        .await?
        .with_context(|| format!("run not found: {}", run_id))?;
    println!("{}", serde_json::to_string_pretty(&run)?);
    Ok(())
}

pub async fn events(config: &Config, limit: usize) -> Result<()> {
    let store = bootstrap::open_store(config)?;
    for event in store.recent_events(limit).await? {
        let detail = match event.idle_duration_ms {
            Some(ms) => format!("idle for {}ms", ms),
            None => format!("{} ({})", event.window_title, event.process_path),
        };
        println!(
            "{}  {:<10}  {}",
            event.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            event.kind.as_str(),
            detail
        );
    }
    Ok(())
}

pub async fn prune(config: &Config) -> Result<()> {
    let store = bootstrap::open_store(config)?;
    let report = store.prune().await?;
    println!(
        "Removed {} run(s) and {} event(s)",
        report.runs_removed, report.events_removed
    );
    Ok(())
}
