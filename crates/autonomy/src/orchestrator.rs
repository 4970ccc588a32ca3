//! Run registry and the plan/execute/verify loop.
//!
//! Each run is driven by its own task. Run state lives in the registry behind
//! a per-run mutex; the loop and the control calls (`approve`, `cancel`)
//! mutate it in short critical sections and every mutation is written through
//! to the [`RunStore`] when one is attached. Executor access is serialized by
//! a single admission permit, so at most one run issues commands at a time.

use crate::error::OrchestratorError;
use crate::planner::{is_irreversible, PlanDecision, Planner, PlanningInput, WAIT_ACTION};
use crate::verifier::{ContextVerifier, RepeatTracker, Verifier, DEFAULT_REPEAT_THRESHOLD};
use deskpilot_core::{AgentLogEntry, AutonomyRun, ContextCell, ExecutorMode, PlannedStep, RunStatus, RunStore};
use deskpilot_executor::{ActionOutcome, ExecutorSet};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const PLANNER: &str = "planner";
pub const EXECUTOR: &str = "executor";
pub const VERIFIER: &str = "verifier";
pub const ORCHESTRATOR: &str = "orchestrator";

pub const BUDGET_EXHAUSTED: &str = "maximum iteration budget reached";
pub const RUN_TIMED_OUT: &str = "run timed out";
pub const RESTORED_AFTER_RESTART: &str = "run restored after restart";
pub const INTERRUPTED_BY_SHUTDOWN: &str = "run interrupted by shutdown";
pub const ZERO_BUDGET: &str = "run rejected: max_iterations must be at least 1";

/// How many stored runs `hydrate` brings back into the registry.
const HYDRATE_LIMIT: usize = 500;

/// What `start` does while another run holds the executor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionPolicy {
    #[default]
    Reject,
    Queue,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub max_iterations: u32,
    pub min_confidence: f64,
    pub planner_retries: u32,
    pub step_retries: u32,
    /// First retry delay; doubles on each further attempt.
    pub retry_backoff_ms: u64,
    pub max_consecutive_failures: u32,
    /// Fail the run on the first step that exhausts its retries.
    pub strict: bool,
    pub settle_ms: u64,
    pub reconnect_window_ms: u64,
    pub run_timeout_ms: Option<u64>,
    pub repeat_threshold: u32,
    pub admission: AdmissionPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            min_confidence: 0.3,
            planner_retries: 2,
            step_retries: 1,
            retry_backoff_ms: 500,
            max_consecutive_failures: 3,
            strict: false,
            settle_ms: 800,
            reconnect_window_ms: 30_000,
            run_timeout_ms: None,
            repeat_threshold: DEFAULT_REPEAT_THRESHOLD,
            admission: AdmissionPolicy::Reject,
        }
    }
}

impl OrchestratorConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn reconnect_window(&self) -> Duration {
        Duration::from_millis(self.reconnect_window_ms)
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_ms.map(Duration::from_millis)
    }

    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.min(16);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }
}

/// Parameters for a new run.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub objective: String,
    pub max_iterations: Option<u32>,
    pub executor_mode: Option<ExecutorMode>,
    pub auto_approve_irreversible: bool,
}

impl RunRequest {
    pub fn new(objective: impl Into<String>) -> Self {
        Self {
            objective: objective.into(),
            ..Default::default()
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = Some(max_iterations);
        self
    }

    pub fn with_executor(mut self, mode: ExecutorMode) -> Self {
        self.executor_mode = Some(mode);
        self
    }

    pub fn auto_approve(mut self) -> Self {
        self.auto_approve_irreversible = true;
        self
    }
}

#[derive(Default)]
struct RunControl {
    cancelled: AtomicBool,
    wake: Notify,
}

impl RunControl {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    async fn cancelled(&self) {
        while !self.is_cancelled() {
            self.wake.notified().await;
        }
    }
}

struct RunEntry {
    run: AutonomyRun,
    control: Arc<RunControl>,
    task: Option<JoinHandle<()>>,
}

type SharedRun = Arc<Mutex<RunEntry>>;

/// What the loop does after a step.
enum StepFlow {
    Next,
    Ended,
    /// The bridge dropped mid-step; run the same step once it is back.
    Interrupted(PlannedStep),
}

struct LoopState {
    history: Vec<PlannedStep>,
    repeats: RepeatTracker,
    consecutive_failures: u32,
}

fn describe_step(step: &PlannedStep) -> String {
    if step.description.is_empty() {
        step.action.clone()
    } else {
        format!("{} ({})", step.action, step.description)
    }
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    planner: Arc<dyn Planner>,
    verifier: Arc<dyn Verifier>,
    executors: Arc<ExecutorSet>,
    context: Arc<ContextCell>,
    store: Option<Arc<dyn RunStore>>,
    runs: RwLock<HashMap<String, SharedRun>>,
    admission: Arc<Semaphore>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        planner: Arc<dyn Planner>,
        executors: Arc<ExecutorSet>,
        context: Arc<ContextCell>,
    ) -> Self {
        Self {
            config,
            planner,
            verifier: Arc::new(ContextVerifier),
            executors,
            context,
            store: None,
            runs: RwLock::new(HashMap::new()),
            admission: Arc::new(Semaphore::new(1)),
        }
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn Verifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Create a run and start driving it in the background.
    ///
    /// A zero iteration budget yields a run that is already failed. Under the
    /// `reject` admission policy a busy orchestrator refuses the run; under
    /// `queue` it stays pending until the executor frees up.
    pub async fn start(self: &Arc<Self>, request: RunRequest) -> Result<AutonomyRun, OrchestratorError> {
        let objective = request.objective.trim();
        if objective.is_empty() {
            return Err(OrchestratorError::EmptyObjective);
        }
        let max_iterations = request.max_iterations.unwrap_or(self.config.max_iterations);
        let mode = request.executor_mode.unwrap_or_else(|| self.executors.mode());
        let mut run = AutonomyRun::new(
            uuid::Uuid::new_v4().to_string(),
            objective,
            max_iterations,
            self.planner.mode(),
            mode,
            request.auto_approve_irreversible,
        );

        if max_iterations == 0 {
            run.transition(RunStatus::Failed)?;
            run.last_error = Some(ZERO_BUDGET.to_string());
            run.note(ORCHESTRATOR, ZERO_BUDGET);
            warn!("Run {} rejected: zero iteration budget", run.run_id);
            self.register(run.clone(), Arc::new(RunControl::default())).await;
            self.persist(&run).await;
            return Ok(run);
        }

        let permit = match self.config.admission {
            AdmissionPolicy::Reject => Some(
                self.admission
                    .clone()
                    .try_acquire_owned()
                    .map_err(|_| OrchestratorError::Busy)?,
            ),
            AdmissionPolicy::Queue => None,
        };

        run.note(
            ORCHESTRATOR,
            format!("run created: {} (executor: {})", objective, mode.as_str()),
        );
        let control = Arc::new(RunControl::default());
        let entry = self.register(run.clone(), control.clone()).await;
        self.persist(&run).await;

        let this = self.clone();
        let driven = entry.clone();
        let task = tokio::spawn(async move { this.execute_run(driven, control, permit).await });
        entry.lock().await.task = Some(task);

        info!("Started run {}: {}", run.run_id, run.objective);
        Ok(run)
    }

    pub async fn get(&self, run_id: &str) -> Result<AutonomyRun, OrchestratorError> {
        if let Some(entry) = self.runs.read().await.get(run_id).cloned() {
            return Ok(entry.lock().await.run.clone());
        }
        if let Some(store) = &self.store {
            if let Some(run) = store.get_run(run_id).await? {
                return Ok(run);
            }
        }
        Err(OrchestratorError::NotFound(run_id.to_string()))
    }

    /// Known runs, newest first.
    pub async fn list(&self, limit: usize) -> Vec<AutonomyRun> {
        let entries: Vec<SharedRun> = self.runs.read().await.values().cloned().collect();
        let mut runs = Vec::with_capacity(entries.len());
        for entry in entries {
            runs.push(entry.lock().await.run.clone());
        }
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);
        runs
    }

    /// Release the step a run is holding for approval. The token is single
    /// use; a rejected approval leaves the run untouched.
    pub async fn approve(&self, run_id: &str, token: &str) -> Result<AutonomyRun, OrchestratorError> {
        let entry = self.entry(run_id).await?;
        let (snapshot, control) = {
            let mut guard = entry.lock().await;
            if guard.run.status != RunStatus::WaitingApproval {
                return Err(OrchestratorError::NotWaitingApproval);
            }
            if guard.run.approval_token.as_deref() != Some(token) {
                warn!("Rejected approval for run {}: token mismatch", run_id);
                return Err(OrchestratorError::InvalidToken);
            }
            guard.run.transition(RunStatus::Running)?;
            guard.run.approval_token = None;
            guard.run.note(ORCHESTRATOR, "irreversible step approved");
            (guard.run.clone(), guard.control.clone())
        };
        self.persist(&snapshot).await;
        control.wake.notify_one();
        info!("Run {} approved", run_id);
        Ok(snapshot)
    }

    /// Cancel a run in any non-terminal state. An in-flight executor call is
    /// abandoned and its result discarded.
    pub async fn cancel(&self, run_id: &str) -> Result<AutonomyRun, OrchestratorError> {
        let entry = self.entry(run_id).await?;
        let snapshot = {
            let mut guard = entry.lock().await;
            if guard.run.status.is_terminal() {
                return Err(OrchestratorError::AlreadyFinished(guard.run.status.to_string()));
            }
            guard.run.transition(RunStatus::Cancelled)?;
            guard.run.note(ORCHESTRATOR, "run cancelled");
            guard.control.cancel();
            guard.run.clone()
        };
        self.persist(&snapshot).await;
        info!("Run {} cancelled", run_id);
        Ok(snapshot)
    }

    /// Load stored runs into the registry. Runs that were live when the
    /// process stopped cannot be resumed and are marked failed.
    pub async fn hydrate(&self) -> Result<usize, OrchestratorError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let stored = store.load_runs(HYDRATE_LIMIT).await?;
        let mut restored = 0;
        let mut runs = self.runs.write().await;
        for mut run in stored {
            if runs.contains_key(&run.run_id) {
                continue;
            }
            if !run.status.is_terminal() {
                run.transition(RunStatus::Failed)?;
                run.last_error = Some(RESTORED_AFTER_RESTART.to_string());
                run.note(ORCHESTRATOR, RESTORED_AFTER_RESTART);
                store.save_run(&run).await?;
                restored += 1;
            }
            runs.insert(
                run.run_id.clone(),
                Arc::new(Mutex::new(RunEntry {
                    run,
                    control: Arc::new(RunControl::default()),
                    task: None,
                })),
            );
        }
        if restored > 0 {
            info!("Marked {} interrupted run(s) as failed", restored);
        }
        Ok(restored)
    }

    /// Fail every live run and stop its task.
    pub async fn shutdown(&self) {
        let entries: Vec<SharedRun> = self.runs.read().await.values().cloned().collect();
        for entry in entries {
            let (snapshot, task) = {
                let mut guard = entry.lock().await;
                if guard.run.status.is_terminal() {
                    continue;
                }
                if guard.run.transition(RunStatus::Failed).is_err() {
                    continue;
                }
                guard.run.last_error = Some(INTERRUPTED_BY_SHUTDOWN.to_string());
                guard.run.note(ORCHESTRATOR, INTERRUPTED_BY_SHUTDOWN);
                guard.control.cancel();
                (guard.run.clone(), guard.task.take())
            };
            self.persist(&snapshot).await;
            if let Some(task) = task {
                task.abort();
            }
        }
    }

    async fn register(&self, run: AutonomyRun, control: Arc<RunControl>) -> SharedRun {
        let run_id = run.run_id.clone();
        let entry = Arc::new(Mutex::new(RunEntry {
            run,
            control,
            task: None,
        }));
        self.runs.write().await.insert(run_id, entry.clone());
        entry
    }

    async fn entry(&self, run_id: &str) -> Result<SharedRun, OrchestratorError> {
        self.runs
            .read()
            .await
            .get(run_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(run_id.to_string()))
    }

    async fn persist(&self, run: &AutonomyRun) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save_run(run).await {
                warn!("Failed to persist run {}: {}", run.run_id, e);
            }
        }
    }

    async fn update<R>(&self, entry: &Mutex<RunEntry>, f: impl FnOnce(&mut AutonomyRun) -> R) -> R {
        let (result, snapshot) = {
            let mut guard = entry.lock().await;
            let result = f(&mut guard.run);
            (result, guard.run.clone())
        };
        self.persist(&snapshot).await;
        result
    }

    /// Move a live run to a terminal state. False if it already ended.
    async fn finish(&self, entry: &Mutex<RunEntry>, status: RunStatus, reason: &str) -> bool {
        let finished = self
            .update(entry, |run| {
                if run.status.is_terminal() || run.transition(status).is_err() {
                    return false;
                }
                if status == RunStatus::Failed {
                    run.last_error = Some(reason.to_string());
                }
                run.note(ORCHESTRATOR, reason);
                true
            })
            .await;
        if finished {
            info!("Run {}: {}", status, reason);
        }
        finished
    }

    async fn backoff(&self, control: &RunControl, attempt: u32) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.config.retry_backoff(attempt)) => true,
            _ = control.cancelled() => false,
        }
    }

    async fn execute_run(
        self: Arc<Self>,
        entry: SharedRun,
        control: Arc<RunControl>,
        permit: Option<OwnedSemaphorePermit>,
    ) {
        let _permit = match permit {
            Some(permit) => permit,
            None => {
                let acquired = tokio::select! {
                    acquired = self.admission.clone().acquire_owned() => acquired,
                    _ = control.cancelled() => return,
                };
                match acquired {
                    Ok(permit) => permit,
                    Err(_) => {
                        self.finish(&entry, RunStatus::Failed, "admission closed").await;
                        return;
                    }
                }
            }
        };

        let started = self
            .update(&entry, |run| {
                if run.transition(RunStatus::Running).is_err() {
                    return false;
                }
                run.note(ORCHESTRATOR, "run admitted");
                true
            })
            .await;
        if !started {
            return;
        }

        let drive = self.drive(&entry, &control);
        let timed_out = match self.config.run_timeout() {
            Some(limit) => tokio::time::timeout(limit, drive).await.is_err(),
            None => {
                drive.await;
                false
            }
        };
        if timed_out {
            self.finish(&entry, RunStatus::Failed, RUN_TIMED_OUT).await;
        }
    }

    async fn drive(&self, entry: &Mutex<RunEntry>, control: &RunControl) {
        let (objective, mode, max_iterations, auto_approve) = {
            let guard = entry.lock().await;
            (
                guard.run.objective.clone(),
                guard.run.executor_mode,
                guard.run.max_iterations,
                guard.run.auto_approve_irreversible,
            )
        };
        let mut state = LoopState {
            history: Vec::new(),
            repeats: RepeatTracker::new(self.config.repeat_threshold),
            consecutive_failures: 0,
        };

        // a step cut off by a bridge outage, replayed without a new iteration
        let mut interrupted: Option<PlannedStep> = None;

        loop {
            if control.is_cancelled() {
                return;
            }

            let (status, approved, iteration) = self
                .update(entry, |run| {
                    let approved = if run.status == RunStatus::Running {
                        run.pending_step.take()
                    } else {
                        None
                    };
                    (run.status, approved, run.iteration)
                })
                .await;
            if status.is_terminal() {
                return;
            }
            if let Some(step) = approved.or_else(|| interrupted.take()) {
                if mode == ExecutorMode::Bridge && !self.executors.bridge_connected() {
                    interrupted = Some(step);
                    if !self.pause_for_bridge(entry, control).await {
                        return;
                    }
                    continue;
                }
                match self.execute_step(entry, control, mode, &objective, step, &mut state).await {
                    StepFlow::Next => continue,
                    StepFlow::Ended => return,
                    StepFlow::Interrupted(step) => {
                        interrupted = Some(step);
                        if !self.pause_for_bridge(entry, control).await {
                            return;
                        }
                        continue;
                    }
                }
            }

            let context = self.context.load();
            if self.verifier.objective_met(&objective, &context) {
                self.finish(entry, RunStatus::Completed, "objective met").await;
                return;
            }
            if iteration >= max_iterations {
                self.finish(entry, RunStatus::Failed, BUDGET_EXHAUSTED).await;
                return;
            }
            if mode == ExecutorMode::Bridge && !self.executors.bridge_connected() {
                if !self.pause_for_bridge(entry, control).await {
                    return;
                }
                continue;
            }

            let iteration = self
                .update(entry, |run| {
                    if !run.status.is_terminal() {
                        run.iteration += 1;
                    }
                    run.iteration
                })
                .await;
            debug!("Iteration {}/{} for {}", iteration, max_iterations, objective);

            let input = PlanningInput {
                objective: objective.clone(),
                context,
                iteration,
                history: state.history.clone(),
            };
            let Some(decision) = self.plan(entry, control, &input).await else {
                return;
            };

            let mut step = match decision {
                PlanDecision::Complete { summary } => {
                    self.finish(entry, RunStatus::Completed, &format!("objective complete: {}", summary))
                        .await;
                    return;
                }
                PlanDecision::Step(step) => step,
            };

            if step.action == WAIT_ACTION || step.confidence < self.config.min_confidence {
                let message = if step.action == WAIT_ACTION {
                    "wait: planner chose to wait".to_string()
                } else {
                    format!(
                        "wait: confidence {:.2} below minimum {:.2} for {}",
                        step.confidence,
                        self.config.min_confidence,
                        describe_step(&step)
                    )
                };
                self.update(entry, |run| {
                    run.log(AgentLogEntry::new(PLANNER, message).with_confidence(step.confidence))
                })
                .await;
                continue;
            }

            // the planner's own flag is not trusted to be complete
            step.irreversible |= is_irreversible(&step.action, &step.params, &step.description);
            if step.irreversible && !auto_approve {
                if !self.await_approval(entry, control, step).await {
                    return;
                }
                continue;
            }

            match self.execute_step(entry, control, mode, &objective, step, &mut state).await {
                StepFlow::Next => {}
                StepFlow::Ended => return,
                StepFlow::Interrupted(step) => {
                    interrupted = Some(step);
                    if !self.pause_for_bridge(entry, control).await {
                        return;
                    }
                }
            }
        }
    }

    /// Ask the planner, retrying with backoff. `None` means the run ended.
    async fn plan(&self, entry: &Mutex<RunEntry>, control: &RunControl, input: &PlanningInput) -> Option<PlanDecision> {
        let attempts = self.config.planner_retries + 1;
        let mut last_error = String::new();
        for attempt in 0..attempts {
            let result = tokio::select! {
                result = self.planner.next_step(input) => result,
                _ = control.cancelled() => return None,
            };
            match result {
                Ok(decision) => return Some(decision),
                Err(e) => {
                    warn!("Planner attempt {}/{} failed: {}", attempt + 1, attempts, e);
                    last_error = e.to_string();
                    self.update(entry, |run| run.note(PLANNER, format!("planner error: {}", last_error)))
                        .await;
                    if attempt + 1 < attempts && !self.backoff(control, attempt).await {
                        return None;
                    }
                }
            }
        }
        self.finish(
            entry,
            RunStatus::Failed,
            &format!("planner failed after {} attempt(s): {}", attempts, last_error),
        )
        .await;
        None
    }

    /// Park the run until `approve` or `cancel`. True when approved.
    async fn await_approval(&self, entry: &Mutex<RunEntry>, control: &RunControl, step: PlannedStep) -> bool {
        let token = uuid::Uuid::new_v4().to_string();
        let described = describe_step(&step);
        let confidence = step.confidence;
        let parked = self
            .update(entry, |run| {
                if run.transition(RunStatus::WaitingApproval).is_err() {
                    return false;
                }
                run.approval_token = Some(token);
                run.pending_step = Some(step);
                run.log(
                    AgentLogEntry::new(ORCHESTRATOR, format!("approval required for irreversible step: {}", described))
                        .with_confidence(confidence),
                );
                true
            })
            .await;
        if !parked {
            return false;
        }
        info!("Run waiting for approval: {}", described);

        loop {
            control.wake.notified().await;
            if control.is_cancelled() {
                return false;
            }
            match entry.lock().await.run.status {
                RunStatus::WaitingApproval => continue,
                RunStatus::Running => return true,
                _ => return false,
            }
        }
    }

    /// Pause a bridge-bound run until the bridge reconnects. True on resume.
    async fn pause_for_bridge(&self, entry: &Mutex<RunEntry>, control: &RunControl) -> bool {
        let paused = self
            .update(entry, |run| {
                if run.transition(RunStatus::Paused).is_err() {
                    return false;
                }
                run.note(ORCHESTRATOR, "bridge disconnected; run paused");
                true
            })
            .await;
        if !paused {
            return false;
        }
        warn!("Bridge disconnected; pausing run");

        let window = self.config.reconnect_window();
        let reconnected = tokio::select! {
            reconnected = self.executors.wait_bridge(window) => reconnected,
            _ = control.cancelled() => return false,
        };
        if !reconnected {
            let reason = format!("bridge did not reconnect within {}ms", window.as_millis());
            self.finish(entry, RunStatus::Failed, &reason).await;
            return false;
        }

        self.update(entry, |run| {
            if run.transition(RunStatus::Running).is_err() {
                return false;
            }
            run.note(ORCHESTRATOR, "bridge reconnected; run resumed");
            true
        })
        .await
    }

    /// Execute one step with retries, verify it and apply the completion and
    /// failure rules. A bridge-bound step cut off by a disconnect is handed
    /// back untouched: it counts neither as a failure nor as progress.
    async fn execute_step(
        &self,
        entry: &Mutex<RunEntry>,
        control: &RunControl,
        mode: ExecutorMode,
        objective: &str,
        step: PlannedStep,
        state: &mut LoopState,
    ) -> StepFlow {
        let described = describe_step(&step);
        self.update(entry, |run| {
            run.log(AgentLogEntry::new(PLANNER, format!("next step: {}", described)).with_confidence(step.confidence))
        })
        .await;

        let before = self.context.load();
        let attempts = self.config.step_retries + 1;
        let mut outcome = ActionOutcome::failed("not executed");
        for attempt in 0..attempts {
            outcome = tokio::select! {
                outcome = self.executors.execute_in(mode, &step.action, &step.params) => outcome,
                _ = control.cancelled() => {
                    debug!("Dropping in-flight {} after cancellation", step.action);
                    return StepFlow::Ended;
                }
            };
            if outcome.success || (mode == ExecutorMode::Bridge && outcome.is_disconnect()) {
                break;
            }
            if attempt + 1 < attempts {
                let message = format!("attempt {} failed: {}", attempt + 1, outcome.describe());
                self.update(entry, |run| {
                    run.log(AgentLogEntry::new(EXECUTOR, message).with_action(step.action.clone(), false))
                })
                .await;
                if !self.backoff(control, attempt).await {
                    return StepFlow::Ended;
                }
            }
        }
        if control.is_cancelled() {
            return StepFlow::Ended;
        }
        if mode == ExecutorMode::Bridge && outcome.is_disconnect() {
            let message = format!("{} interrupted: {}", described, outcome.describe());
            self.update(entry, |run| {
                run.log(AgentLogEntry::new(EXECUTOR, message).with_action(step.action.clone(), false))
            })
            .await;
            return StepFlow::Interrupted(step);
        }

        let after = if outcome.success && self.executors.bridge_connected() {
            self.context.wait_newer(before.version, self.config.settle()).await
        } else {
            self.context.load()
        };
        let verdict = self.verifier.verify_step(&before, &after, &outcome);
        let met = outcome.success && self.verifier.objective_met(objective, &after);

        let live = self
            .update(entry, |run| {
                if run.status.is_terminal() {
                    return false;
                }
                run.log(AgentLogEntry::new(EXECUTOR, outcome.describe()).with_action(step.action.clone(), outcome.success));
                run.note(VERIFIER, verdict.note.clone());
                if !outcome.success {
                    run.last_error = outcome.error.clone();
                }
                true
            })
            .await;
        if !live {
            return StepFlow::Ended;
        }

        if outcome.success {
            state.consecutive_failures = 0;
            let repeated = state.repeats.record(&step);
            state.history.push(step);
            if met {
                self.finish(entry, RunStatus::Completed, "objective met").await;
                return StepFlow::Ended;
            }
            if repeated {
                let reason = format!("objective assumed met: {} repeated {} times", described, self.config.repeat_threshold);
                self.finish(entry, RunStatus::Completed, &reason).await;
                return StepFlow::Ended;
            }
            return StepFlow::Next;
        }

        let error = outcome.error.unwrap_or_else(|| "step failed".to_string());
        state.consecutive_failures += 1;
        state.repeats.reset();
        if self.config.strict {
            self.finish(entry, RunStatus::Failed, &format!("step failed: {}: {}", described, error))
                .await;
            return StepFlow::Ended;
        }
        if state.consecutive_failures >= self.config.max_consecutive_failures {
            let reason = format!(
                "{} consecutive step failures; last: {}",
                state.consecutive_failures, error
            );
            self.finish(entry, RunStatus::Failed, &reason).await;
            return StepFlow::Ended;
        }
        StepFlow::Next
    }
}
