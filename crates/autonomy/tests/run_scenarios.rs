#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use async_trait::async_trait;
use deskpilot_autonomy::{
    AdmissionPolicy, DeterministicPlanner, Orchestrator, OrchestratorConfig, OrchestratorError, PlanDecision,
    Planner, PlannerError, PlanningInput, RunRequest, BUDGET_EXHAUSTED, INTERRUPTED_BY_SHUTDOWN,
    RESTORED_AFTER_RESTART, ZERO_BUDGET,
};
use deskpilot_core::{
    AutonomyRun, BridgeCommand, BridgeResult, ChannelFailure, CommandChannel, ContextCell, DesktopAction, DesktopContext,
    ExecutorMode, Params, PlannedStep, RunStatus, RunStore, StoreError,
};
use deskpilot_executor::{BridgeExecutor, ExecutorSet};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct MemoryRuns {
    runs: Mutex<HashMap<String, AutonomyRun>>,
}

#[async_trait]
impl RunStore for MemoryRuns {
    async fn save_run(&self, run: &AutonomyRun) -> Result<(), StoreError> {
        self.runs.lock().insert(run.run_id.clone(), run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<AutonomyRun>, StoreError> {
        Ok(self.runs.lock().get(run_id).cloned())
    }

    async fn load_runs(&self, limit: usize) -> Result<Vec<AutonomyRun>, StoreError> {
        let mut runs: Vec<AutonomyRun> = self.runs.lock().values().cloned().collect();
        runs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        runs.truncate(limit);
        Ok(runs)
    }
}

/// Stand-in for the native desktop behind the bridge.
struct FakeDesktop {
    connected: AtomicBool,
    context: Arc<ContextCell>,
    hang: bool,
    fail: bool,
    /// Drop the connection under the next command.
    lose_connection: AtomicBool,
    dispatched: AtomicUsize,
}

#[async_trait]
impl CommandChannel for FakeDesktop {
    async fn dispatch(&self, command: BridgeCommand, _timeout: Duration) -> BridgeResult {
        self.dispatched.fetch_add(1, Ordering::SeqCst);
        if self.lose_connection.swap(false, Ordering::SeqCst) {
            self.connected.store(false, Ordering::SeqCst);
            return BridgeResult::channel_failure(command.id, ChannelFailure::ConnectionLost);
        }
        if self.hang {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        if self.fail {
            return BridgeResult::failure(command.id, "element not found");
        }
        if command.action == DesktopAction::OpenApplication {
            let title = command.str_param("application").unwrap_or_default().to_string();
            self.context.publish(DesktopContext {
                window_title: title,
                ..Default::default()
            });
        }
        BridgeResult::success(command.id, json!({}))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

struct Harness {
    orchestrator: Arc<Orchestrator>,
    desktop: Arc<FakeDesktop>,
    store: Arc<MemoryRuns>,
}

fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig {
        max_iterations: 6,
        retry_backoff_ms: 5,
        settle_ms: 20,
        reconnect_window_ms: 3_000,
        ..OrchestratorConfig::default()
    }
}

fn harness_with(
    config: OrchestratorConfig,
    mode: ExecutorMode,
    connected: bool,
    hang: bool,
    fail: bool,
    planner: Arc<dyn Planner>,
) -> Harness {
    let context = Arc::new(ContextCell::new());
    let desktop = Arc::new(FakeDesktop {
        connected: AtomicBool::new(connected),
        context: context.clone(),
        hang,
        fail,
        lose_connection: AtomicBool::new(false),
        dispatched: AtomicUsize::new(0),
    });
    let bridge =
        BridgeExecutor::new(desktop.clone(), context.clone(), Duration::from_secs(60)).with_settle(Duration::from_millis(20));
    let executors = Arc::new(ExecutorSet::new(mode).with_bridge(bridge));
    let store = Arc::new(MemoryRuns::default());
    let orchestrator =
        Arc::new(Orchestrator::new(config, planner, executors, context).with_store(store.clone()));
    Harness {
        orchestrator,
        desktop,
        store,
    }
}

fn harness(mode: ExecutorMode, connected: bool) -> Harness {
    harness_with(fast_config(), mode, connected, false, false, Arc::new(DeterministicPlanner))
}

async fn wait_for(
    orchestrator: &Orchestrator,
    run_id: &str,
    mut condition: impl FnMut(&AutonomyRun) -> bool,
) -> AutonomyRun {
    for _ in 0..500 {
        let run = orchestrator.get(run_id).await.unwrap();
        if condition(&run) {
            return run;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let run = orchestrator.get(run_id).await.unwrap();
    panic!("condition not reached; run is {} with log {:?}", run.status, run.agent_log);
}

async fn wait_status(orchestrator: &Orchestrator, run_id: &str, status: RunStatus) -> AutonomyRun {
    wait_for(orchestrator, run_id, |run| run.status == status).await
}

fn has_entry(run: &AutonomyRun, agent: &str, needle: &str) -> bool {
    run.agent_log
        .iter()
        .any(|entry| entry.agent == agent && entry.message.contains(needle))
}

#[tokio::test]
async fn test_open_application_completes_in_simulator() {
    let h = harness(ExecutorMode::Simulator, false);
    let run = h
        .orchestrator
        .start(RunRequest::new("open calculator"))
        .await
        .unwrap();
    assert_eq!(run.planner_mode, "deterministic");

    let run = wait_status(&h.orchestrator, &run.run_id, RunStatus::Completed).await;
    assert!(run.finished_at.is_some());
    assert!(run.iteration >= 1 && run.iteration <= run.max_iterations);
    assert!(run
        .agent_log
        .iter()
        .any(|e| e.action.as_deref() == Some("open_application") && e.success == Some(true)));
    assert_eq!(h.desktop.dispatched.load(Ordering::SeqCst), 0);

    let stored = h.store.get_run(&run.run_id).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Completed);
}

#[tokio::test]
async fn test_send_requires_single_use_approval() {
    let h = harness(ExecutorMode::Simulator, false);
    let run = h
        .orchestrator
        .start(RunRequest::new(r#"reply "on my way" and send"#))
        .await
        .unwrap();
    let waiting = wait_status(&h.orchestrator, &run.run_id, RunStatus::WaitingApproval).await;
    let token = waiting.approval_token.clone().unwrap();
    assert_eq!(waiting.pending_step.as_ref().unwrap().action, "send_keys");
    assert!(waiting
        .agent_log
        .iter()
        .any(|e| e.action.as_deref() == Some("type_text") && e.success == Some(true)));
    assert!(!waiting
        .agent_log
        .iter()
        .any(|e| e.action.as_deref() == Some("send_keys")));

    let wrong = h.orchestrator.approve(&run.run_id, "not-the-token").await;
    assert!(matches!(wrong, Err(OrchestratorError::InvalidToken)));
    let unchanged = h.orchestrator.get(&run.run_id).await.unwrap();
    assert_eq!(unchanged.status, RunStatus::WaitingApproval);
    assert_eq!(unchanged.approval_token.as_deref(), Some(token.as_str()));

    let approved = h.orchestrator.approve(&run.run_id, &token).await.unwrap();
    assert!(approved.approval_token.is_none());

    let done = wait_status(&h.orchestrator, &run.run_id, RunStatus::Completed).await;
    assert!(done
        .agent_log
        .iter()
        .any(|e| e.action.as_deref() == Some("send_keys") && e.success == Some(true)));

    let reused = h.orchestrator.approve(&run.run_id, &token).await;
    assert!(matches!(reused, Err(OrchestratorError::NotWaitingApproval)));
}

#[tokio::test]
async fn test_auto_approve_skips_gate() {
    let h = harness(ExecutorMode::Simulator, false);
    let run = h
        .orchestrator
        .start(RunRequest::new("type hello then submit").auto_approve())
        .await
        .unwrap();
    let run = wait_status(&h.orchestrator, &run.run_id, RunStatus::Completed).await;
    assert!(!has_entry(&run, "orchestrator", "approval required"));
    assert!(run.approval_token.is_none());
}

#[tokio::test]
async fn test_zero_budget_fails_immediately() {
    let h = harness(ExecutorMode::Simulator, false);
    let run = h
        .orchestrator
        .start(RunRequest::new("open calculator").with_max_iterations(0))
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.agent_log.len(), 1);
    assert_eq!(run.last_error.as_deref(), Some(ZERO_BUDGET));
    assert_eq!(run.iteration, 0);

    let fetched = h.orchestrator.get(&run.run_id).await.unwrap();
    assert_eq!(fetched, run);
}

struct Hesitant;

#[async_trait]
impl Planner for Hesitant {
    fn mode(&self) -> &str {
        "hesitant"
    }

    async fn next_step(&self, _input: &PlanningInput) -> Result<PlanDecision, PlannerError> {
        Ok(PlanDecision::Step(
            PlannedStep::new("click", Params::new()).with_confidence(0.1),
        ))
    }
}

#[tokio::test]
async fn test_low_confidence_waits_until_budget_exhausted() {
    let config = OrchestratorConfig {
        max_iterations: 3,
        ..fast_config()
    };
    let h = harness_with(config, ExecutorMode::Bridge, true, false, false, Arc::new(Hesitant));
    let run = h.orchestrator.start(RunRequest::new("tidy up")).await.unwrap();
    let run = wait_status(&h.orchestrator, &run.run_id, RunStatus::Failed).await;

    assert_eq!(run.last_error.as_deref(), Some(BUDGET_EXHAUSTED));
    assert_eq!(run.iteration, 3);
    let waits = run
        .agent_log
        .iter()
        .filter(|e| e.agent == "planner" && e.message.starts_with("wait:"))
        .count();
    assert_eq!(waits, 3);
    assert_eq!(h.desktop.dispatched.load(Ordering::SeqCst), 0);
}

struct Broken(AtomicUsize);

#[async_trait]
impl Planner for Broken {
    fn mode(&self) -> &str {
        "broken"
    }

    async fn next_step(&self, _input: &PlanningInput) -> Result<PlanDecision, PlannerError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Err(PlannerError::Unavailable("model offline".to_string()))
    }
}

#[tokio::test]
async fn test_planner_errors_are_retried_then_fail_run() {
    let planner = Arc::new(Broken(AtomicUsize::new(0)));
    let h = harness_with(fast_config(), ExecutorMode::Simulator, false, false, false, planner.clone());
    let run = h.orchestrator.start(RunRequest::new("anything")).await.unwrap();
    let run = wait_status(&h.orchestrator, &run.run_id, RunStatus::Failed).await;

    assert_eq!(planner.0.load(Ordering::SeqCst), 3);
    assert!(run
        .last_error
        .as_deref()
        .unwrap()
        .starts_with("planner failed after 3 attempt(s)"));
}

#[tokio::test]
async fn test_repeated_step_failures_fail_run() {
    let config = OrchestratorConfig {
        step_retries: 0,
        ..fast_config()
    };
    let h = harness_with(
        config,
        ExecutorMode::Bridge,
        true,
        false,
        true,
        Arc::new(DeterministicPlanner),
    );
    let run = h.orchestrator.start(RunRequest::new("open calculator")).await.unwrap();
    let run = wait_status(&h.orchestrator, &run.run_id, RunStatus::Failed).await;

    assert_eq!(h.desktop.dispatched.load(Ordering::SeqCst), 3);
    assert!(run.last_error.as_deref().unwrap().contains("3 consecutive step failures"));
}

#[tokio::test]
async fn test_strict_mode_fails_on_first_exhausted_step() {
    let config = OrchestratorConfig {
        step_retries: 1,
        strict: true,
        ..fast_config()
    };
    let h = harness_with(
        config,
        ExecutorMode::Bridge,
        true,
        false,
        true,
        Arc::new(DeterministicPlanner),
    );
    let run = h.orchestrator.start(RunRequest::new("open calculator")).await.unwrap();
    let run = wait_status(&h.orchestrator, &run.run_id, RunStatus::Failed).await;

    assert_eq!(h.desktop.dispatched.load(Ordering::SeqCst), 2);
    assert!(run.last_error.as_deref().unwrap().starts_with("step failed"));
}

#[tokio::test]
async fn test_bridge_disconnect_pauses_and_resumes() {
    let h = harness(ExecutorMode::Bridge, false);
    let run = h.orchestrator.start(RunRequest::new("open calculator")).await.unwrap();
    let paused = wait_status(&h.orchestrator, &run.run_id, RunStatus::Paused).await;
    assert_eq!(paused.iteration, 0);
    assert_eq!(h.desktop.dispatched.load(Ordering::SeqCst), 0);

    h.desktop.connected.store(true, Ordering::SeqCst);
    let done = wait_status(&h.orchestrator, &run.run_id, RunStatus::Completed).await;
    assert!(has_entry(&done, "orchestrator", "run paused"));
    assert!(has_entry(&done, "orchestrator", "run resumed"));
    assert!(has_entry(&done, "verifier", "window changed to calculator"));
    assert_eq!(h.desktop.dispatched.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_connection_lost_mid_step_replays_after_reconnect() {
    let config = OrchestratorConfig {
        step_retries: 0,
        strict: true,
        ..fast_config()
    };
    let h = harness_with(
        config,
        ExecutorMode::Bridge,
        true,
        false,
        false,
        Arc::new(DeterministicPlanner),
    );
    h.desktop.lose_connection.store(true, Ordering::SeqCst);
    let run = h.orchestrator.start(RunRequest::new("open calculator")).await.unwrap();

    let paused = wait_status(&h.orchestrator, &run.run_id, RunStatus::Paused).await;
    assert_eq!(paused.iteration, 1);
    assert!(paused.last_error.is_none());
    assert!(has_entry(&paused, "executor", "interrupted: connection lost"));
    assert_eq!(h.desktop.dispatched.load(Ordering::SeqCst), 1);

    h.desktop.connected.store(true, Ordering::SeqCst);
    let done = wait_status(&h.orchestrator, &run.run_id, RunStatus::Completed).await;
    assert_eq!(done.iteration, 1);
    assert!(has_entry(&done, "verifier", "window changed to calculator"));
    assert_eq!(h.desktop.dispatched.load(Ordering::SeqCst), 2);
}

/// Emits a send click without marking it irreversible.
struct UnflaggedSend;

#[async_trait]
impl Planner for UnflaggedSend {
    fn mode(&self) -> &str {
        "unflagged"
    }

    async fn next_step(&self, _input: &PlanningInput) -> Result<PlanDecision, PlannerError> {
        let mut params = Params::new();
        params.insert("name".into(), json!("Send"));
        Ok(PlanDecision::Step(PlannedStep::new("click", params)))
    }
}

#[tokio::test]
async fn test_unflagged_send_click_still_needs_approval() {
    let h = harness_with(fast_config(), ExecutorMode::Bridge, true, false, false, Arc::new(UnflaggedSend));
    let run = h.orchestrator.start(RunRequest::new("answer the email")).await.unwrap();

    let waiting = wait_status(&h.orchestrator, &run.run_id, RunStatus::WaitingApproval).await;
    let pending = waiting.pending_step.as_ref().unwrap();
    assert_eq!(pending.action, "click");
    assert!(pending.irreversible);
    assert_eq!(h.desktop.dispatched.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_approved_step_survives_connection_loss() {
    let h = harness_with(fast_config(), ExecutorMode::Bridge, true, false, false, Arc::new(UnflaggedSend));
    let run = h.orchestrator.start(RunRequest::new("answer the email")).await.unwrap();
    let waiting = wait_status(&h.orchestrator, &run.run_id, RunStatus::WaitingApproval).await;
    assert_eq!(waiting.iteration, 1);

    h.desktop.lose_connection.store(true, Ordering::SeqCst);
    let token = waiting.approval_token.clone().unwrap();
    h.orchestrator.approve(&run.run_id, &token).await.unwrap();
    let paused = wait_status(&h.orchestrator, &run.run_id, RunStatus::Paused).await;
    assert_eq!(paused.iteration, 1);
    assert_eq!(h.desktop.dispatched.load(Ordering::SeqCst), 1);

    h.desktop.connected.store(true, Ordering::SeqCst);
    // the replayed click runs without a second approval; the next one is gated again
    let again = wait_for(&h.orchestrator, &run.run_id, |run| {
        run.status == RunStatus::WaitingApproval && run.iteration == 2
    })
    .await;
    assert!(again
        .agent_log
        .iter()
        .any(|e| e.action.as_deref() == Some("click") && e.success == Some(true)));
    assert_eq!(h.desktop.dispatched.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_bridge_outage_beyond_window_fails() {
    let config = OrchestratorConfig {
        reconnect_window_ms: 100,
        ..fast_config()
    };
    let h = harness_with(
        config,
        ExecutorMode::Bridge,
        false,
        false,
        false,
        Arc::new(DeterministicPlanner),
    );
    let run = h.orchestrator.start(RunRequest::new("open calculator")).await.unwrap();
    let run = wait_status(&h.orchestrator, &run.run_id, RunStatus::Failed).await;
    assert!(run
        .last_error
        .as_deref()
        .unwrap()
        .starts_with("bridge did not reconnect"));
}

#[tokio::test]
async fn test_cancel_abandons_in_flight_command() {
    let h = harness_with(
        fast_config(),
        ExecutorMode::Bridge,
        true,
        true,
        false,
        Arc::new(DeterministicPlanner),
    );
    let run = h.orchestrator.start(RunRequest::new("open calculator")).await.unwrap();
    for _ in 0..300 {
        if h.desktop.dispatched.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.desktop.dispatched.load(Ordering::SeqCst), 1);

    let cancelled = h.orchestrator.cancel(&run.run_id).await.unwrap();
    assert_eq!(cancelled.status, RunStatus::Cancelled);
    assert!(cancelled.finished_at.is_some());

    tokio::time::sleep(Duration::from_millis(50)).await;
    let after = h.orchestrator.get(&run.run_id).await.unwrap();
    assert_eq!(after.status, RunStatus::Cancelled);
    assert!(!after.agent_log.iter().any(|e| e.agent == "executor"));

    let again = h.orchestrator.cancel(&run.run_id).await;
    assert!(matches!(again, Err(OrchestratorError::AlreadyFinished(_))));
}

#[tokio::test]
async fn test_busy_orchestrator_rejects_second_run() {
    let h = harness_with(
        fast_config(),
        ExecutorMode::Bridge,
        true,
        true,
        false,
        Arc::new(DeterministicPlanner),
    );
    let first = h.orchestrator.start(RunRequest::new("open calculator")).await.unwrap();
    let second = h.orchestrator.start(RunRequest::new("open firefox")).await;
    assert!(matches!(second, Err(OrchestratorError::Busy)));
    assert_eq!(h.orchestrator.list(10).await.len(), 1);
    h.orchestrator.cancel(&first.run_id).await.unwrap();
}

#[tokio::test]
async fn test_queued_run_starts_after_first_finishes() {
    let config = OrchestratorConfig {
        admission: AdmissionPolicy::Queue,
        ..fast_config()
    };
    let h = harness_with(
        config,
        ExecutorMode::Bridge,
        true,
        true,
        false,
        Arc::new(DeterministicPlanner),
    );
    let first = h.orchestrator.start(RunRequest::new("open calculator")).await.unwrap();
    wait_status(&h.orchestrator, &first.run_id, RunStatus::Running).await;
    let second = h.orchestrator.start(RunRequest::new("open firefox")).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        h.orchestrator.get(&second.run_id).await.unwrap().status,
        RunStatus::Pending
    );

    h.orchestrator.cancel(&first.run_id).await.unwrap();
    wait_status(&h.orchestrator, &second.run_id, RunStatus::Running).await;

    let listed = h.orchestrator.list(10).await;
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].run_id, second.run_id);
    h.orchestrator.cancel(&second.run_id).await.unwrap();
}

#[tokio::test]
async fn test_hydrate_fails_interrupted_runs() {
    let h = harness(ExecutorMode::Simulator, false);
    let mut live = AutonomyRun::new("live", "open calculator", 5, "deterministic", ExecutorMode::Bridge, false);
    live.transition(RunStatus::Running).unwrap();
    live.transition(RunStatus::WaitingApproval).unwrap();
    live.approval_token = Some("stale".to_string());
    let mut finished = AutonomyRun::new("done", "open firefox", 5, "deterministic", ExecutorMode::Bridge, false);
    finished.transition(RunStatus::Running).unwrap();
    finished.transition(RunStatus::Completed).unwrap();
    h.store.save_run(&live).await.unwrap();
    h.store.save_run(&finished).await.unwrap();

    assert_eq!(h.orchestrator.hydrate().await.unwrap(), 1);

    let restored = h.orchestrator.get("live").await.unwrap();
    assert_eq!(restored.status, RunStatus::Failed);
    assert_eq!(restored.last_error.as_deref(), Some(RESTORED_AFTER_RESTART));
    assert!(restored.approval_token.is_none());
    assert_eq!(
        h.store.get_run("live").await.unwrap().unwrap().status,
        RunStatus::Failed
    );
    assert_eq!(h.orchestrator.get("done").await.unwrap().status, RunStatus::Completed);

    let stale = h.orchestrator.approve("live", "stale").await;
    assert!(matches!(stale, Err(OrchestratorError::NotWaitingApproval)));
}

#[tokio::test]
async fn test_shutdown_interrupts_live_runs() {
    let h = harness_with(
        fast_config(),
        ExecutorMode::Bridge,
        true,
        true,
        false,
        Arc::new(DeterministicPlanner),
    );
    let run = h.orchestrator.start(RunRequest::new("open calculator")).await.unwrap();
    wait_status(&h.orchestrator, &run.run_id, RunStatus::Running).await;

    h.orchestrator.shutdown().await;
    let run = h.orchestrator.get(&run.run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.last_error.as_deref(), Some(INTERRUPTED_BY_SHUTDOWN));
}

#[tokio::test]
async fn test_unknown_run_is_not_found() {
    let h = harness(ExecutorMode::Simulator, false);
    assert!(matches!(
        h.orchestrator.get("missing").await,
        Err(OrchestratorError::NotFound(_))
    ));
    assert!(matches!(
        h.orchestrator.approve("missing", "token").await,
        Err(OrchestratorError::NotFound(_))
    ));
    assert!(matches!(
        h.orchestrator.start(RunRequest::new("   ")).await,
        Err(OrchestratorError::EmptyObjective)
    ));
}
