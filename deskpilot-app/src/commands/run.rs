//! Orchestration side: bridge hub, executors and one autonomy run.

use crate::bootstrap;
use crate::config::Config;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use deskpilot_autonomy::{DeterministicPlanner, Orchestrator, RunRequest};
use deskpilot_bridge::BridgeHub;
use deskpilot_core::{AutonomyRun, ContextCell, ExecutorMode, RunStatus};
use deskpilot_executor::{BridgeExecutor, BrowserExecutor, ExecutorSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct RunArgs {
    pub objective: String,
    pub executor: Option<ExecutorMode>,
    pub auto_approve: bool,
    pub max_iterations: Option<u32>,
}

pub async fn run(config: &Config, args: RunArgs) -> Result<()> {
    let store = Arc::new(bootstrap::open_store(config)?);
    let mode = args.executor.unwrap_or(config.autonomy.executor);
    let pruner = config
        .store
        .retention
        .prune_interval()
        .map(|every| store.spawn_pruner(every));

    let hub = Arc::new(
        BridgeHub::new(config.bridge.clone(), Arc::new(ContextCell::new())).with_event_sink(store.clone()),
    );
    if matches!(mode, ExecutorMode::Bridge | ExecutorMode::Auto) {
        let addr = hub.start().await.context("Failed to start bridge hub")?;
        info!("Bridge hub listening on {}", addr);
    }
    let context = hub.context();

    let bridge = BridgeExecutor::new(hub.clone(), context.clone(), config.bridge.command_timeout())
        .with_settle(config.autonomy.orchestrator.settle());
    let mut executors = ExecutorSet::new(mode).with_bridge(bridge);
    if matches!(mode, ExecutorMode::Browser | ExecutorMode::Auto) {
        executors = executors.with_browser(BrowserExecutor::new(config.autonomy.browser.clone()));
    }
    let executors = Arc::new(executors);

    let orchestrator = Arc::new(
        Orchestrator::new(
            config.autonomy.orchestrator.clone(),
            Arc::new(DeterministicPlanner),
            executors.clone(),
            context,
        )
        .with_store(store),
    );
    orchestrator.hydrate().await?;

    if mode == ExecutorMode::Bridge {
        println!("Waiting for the desktop agent to connect...");
        if !executors.wait_bridge(config.autonomy.orchestrator.reconnect_window()).await {
            warn!("Desktop agent not connected; the run will pause until it is");
        }
    }

    let mut request = RunRequest::new(args.objective).with_executor(mode);
    if let Some(max) = args.max_iterations {
        request = request.with_max_iterations(max);
    }
    if args.auto_approve {
        request = request.auto_approve();
    }
    let run = orchestrator.start(request).await?;
    println!("Run {} started ({})", run.run_id, mode.as_str());

    let result = supervise(&orchestrator, &run.run_id).await;
    orchestrator.shutdown().await;
    hub.shutdown();
    if let Some(pruner) = pruner {
        pruner.abort();
    }

    let finished = result?;
    println!("Run {} {}", finished.run_id, finished.status);
    match finished.status {
        RunStatus::Completed => Ok(()),
        _ => anyhow::bail!(
            "run {}: {}",
            finished.status,
            finished.last_error.unwrap_or_else(|| "no reason recorded".to_string())
        ),
    }
}

/// Follow a run until it ends, printing new log entries and prompting on
/// stdin when an irreversible step needs approval.
async fn supervise(orchestrator: &Orchestrator, run_id: &str) -> Result<AutonomyRun> {
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut last_seen: Option<DateTime<Utc>> = None;
    loop {
        let run = tokio::select! {
            _ = tokio::time::sleep(POLL_INTERVAL) => orchestrator.get(run_id).await?,
            _ = tokio::signal::ctrl_c() => {
                println!("Interrupted; cancelling run");
                return Ok(orchestrator.cancel(run_id).await?);
            }
        };

        // the log drops old entries once full, so track by timestamp
        for entry in run
            .agent_log
            .iter()
            .filter(|e| last_seen.map_or(true, |seen| e.timestamp > seen))
        {
            let confidence = entry
                .confidence
                .map(|c| format!(" [{:.2}]", c))
                .unwrap_or_default();
            println!("  {:<12} {}{}", entry.agent, entry.message, confidence);
        }
        if let Some(last) = run.agent_log.last() {
            last_seen = Some(last.timestamp);
        }

        if run.status.is_terminal() {
            return Ok(run);
        }
        if run.status != RunStatus::WaitingApproval {
            continue;
        }

        let Some(token) = run.approval_token.clone() else {
            continue;
        };
        let step = run
            .pending_step
            .as_ref()
            .map(|s| s.action.clone())
            .unwrap_or_default();
        let mut stdout = tokio::io::stdout();
        stdout
            .write_all(format!("Approve irreversible step '{}'? [y/N] ", step).as_bytes())
            .await?;
        stdout.flush().await?;

        let answer = stdin.next_line().await?.unwrap_or_default();
        if matches!(answer.trim().to_lowercase().as_str(), "y" | "yes") {
            orchestrator.approve(run_id, &token).await?;
        } else {
            println!("Step rejected; cancelling run");
            return Ok(orchestrator.cancel(run_id).await?);
        }
    }
}
