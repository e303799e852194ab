//! Top-level batch driver: generates or restores the variation list,
//! admits and dispatches runs, checkpoints progress, and assembles the
//! final summary.

use crate::checkpoint::{self, BatchCheckpoint, FailedRun};
use crate::config::ExperimentConfig;
use crate::error::{RunError, Severity};
use crate::executor::{ExecutorStatus, ScenarioExecutor};
use crate::ledger::{CostLedger, LedgerSummary};
use crate::ratelimit::RateLimitGovernor;
use crate::scheduler::TaskScheduler;
use crate::variations::{self, Variation};
use anyhow::{anyhow, Result};
use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Attempts per run before a persistent rate limit is recorded as a
/// run failure.
const MAX_ATTEMPTS_PER_RUN: u32 = 3;

/// How many failed runs the summary preview shows before deferring to
/// the detail file.
const FAILED_PREVIEW_LIMIT: usize = 5;

/// Batch lifecycle. A budget pause is a normal terminal state,
/// distinguishable from completion and from failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Configured,
    Running,
    PausedBudget,
    Completed,
    Failed,
}

/// Outcome classification of one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
    BudgetExceeded,
    CostLimitExceeded,
}

/// Stable run identifier: pure function of (variation_id, run_number),
/// which is what lets resume match prior work purely by id.
pub fn run_id(variation_id: u32, run_number: u32) -> String {
    format!("var-{:03}-run-{:03}", variation_id, run_number)
}

/// Transient dispatch descriptor for one (variation, run-number) pair.
#[derive(Debug, Clone)]
pub struct RunTask {
    pub run_id: String,
    pub variation_id: u32,
    pub run_number: u32,
}

impl RunTask {
    pub fn new(variation_id: u32, run_number: u32) -> Self {
        Self {
            run_id: run_id(variation_id, run_number),
            variation_id,
            run_number,
        }
    }
}

/// Result of one execution attempt. Never mutated after creation.
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub run_id: String,
    pub variation_id: u32,
    pub status: RunStatus,
    pub cost: f64,
    pub error: Option<String>,
    /// Typed marker carried from `RunError::RateLimited`; the error
    /// text is display-only and never inspected.
    pub rate_limited: bool,
    pub output_dir: Option<PathBuf>,
}

/// Per-run progress event for display layers.
#[derive(Debug, Clone)]
pub struct RunProgress {
    pub run_id: String,
    pub status: RunStatus,
    pub cost: f64,
}

pub type ProgressHook = Box<dyn Fn(&RunProgress) + Send + Sync>;

/// Dry-run preview: what the batch would do, with no execution and no
/// checkpoint writes.
#[derive(Debug, Clone, Serialize)]
pub struct BatchPlan {
    pub experiment_name: String,
    pub variation_count: usize,
    pub runs_per_variation: u32,
    pub total_runs: usize,
    pub already_completed: usize,
    pub remaining_runs: usize,
    pub max_parallel: usize,
    pub budget_limit: Option<f64>,
    pub cost_per_run_limit: Option<f64>,
    /// Ceiling on what the remaining runs can spend, when a per-run
    /// limit exists.
    pub projected_max_spend: Option<f64>,
}

/// Aggregate written on every terminal state.
#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub experiment_name: String,
    pub state: BatchState,
    pub total_runs: usize,
    pub completed_runs: usize,
    pub failed_runs: usize,
    pub duration_secs: f64,
    pub ledger: LedgerSummary,
    pub failed: Vec<FailedRun>,
    /// Full detail lives here; displays show a truncated preview.
    pub detail_path: PathBuf,
}

impl BatchSummary {
    /// Human preview: counts plus at most `FAILED_PREVIEW_LIMIT`
    /// failed runs, with a pointer to the full detail file.
    pub fn preview(&self) -> String {
        let mut lines = vec![
            format!("experiment: {}", self.experiment_name),
            format!("state: {:?}", self.state),
            format!(
                "runs: {} total, {} completed, {} failed",
                self.total_runs, self.completed_runs, self.failed_runs
            ),
            format!("spent: {:.2}", self.ledger.total_spent),
            format!("duration: {:.1}s", self.duration_secs),
        ];
        if !self.failed.is_empty() {
            lines.push("failed runs:".to_string());
            for failed in self.failed.iter().take(FAILED_PREVIEW_LIMIT) {
                lines.push(format!("  {} [{}]: {}", failed.run_id, failed.status, failed.error));
            }
            if self.failed.len() > FAILED_PREVIEW_LIMIT {
                lines.push(format!(
                    "  ... {} more, see {}",
                    self.failed.len() - FAILED_PREVIEW_LIMIT,
                    self.detail_path.display()
                ));
            }
        }
        lines.join("\n")
    }
}

/// Internal outcome of one dispatched task body.
enum TaskOutcome {
    Ran(RunRecord),
    Denied(String),
    Skipped,
}

pub struct BatchOrchestrator {
    config: ExperimentConfig,
    executor: Arc<dyn ScenarioExecutor>,
    ledger: Arc<Mutex<CostLedger>>,
    scheduler: TaskScheduler,
    checkpoint: BatchCheckpoint,
    state: BatchState,
    progress: Option<ProgressHook>,
    runs_since_checkpoint: u32,
}

impl BatchOrchestrator {
    /// Fresh batch: generate the variation list and start cold.
    pub fn new(config: ExperimentConfig, executor: Arc<dyn ScenarioExecutor>) -> Result<Self> {
        config.validate()?;
        let variations = variations::generate(&config.variations);
        let ledger = CostLedger::new(config.budget_limit, config.cost_per_run_limit);
        let checkpoint = BatchCheckpoint::new(&config.name, variations);
        Ok(Self::assemble(config, executor, ledger, checkpoint))
    }

    /// Resume from the checkpoint in the configured output dir. A
    /// missing or unreadable checkpoint falls back to a cold start.
    pub fn resume(config: ExperimentConfig, executor: Arc<dyn ScenarioExecutor>) -> Result<Self> {
        config.validate()?;
        match checkpoint::load_for_resume(&config.output_dir) {
            Some((checkpoint, mut ledger)) => {
                ledger.rebase_limits(config.budget_limit, config.cost_per_run_limit);
                info!(
                    experiment = %checkpoint.experiment_name,
                    completed = checkpoint.completed_runs.len(),
                    "resuming from checkpoint"
                );
                Ok(Self::assemble(config, executor, ledger, checkpoint))
            }
            None => Self::new(config, executor),
        }
    }

    fn assemble(
        config: ExperimentConfig,
        executor: Arc<dyn ScenarioExecutor>,
        ledger: CostLedger,
        checkpoint: BatchCheckpoint,
    ) -> Self {
        let governor = Arc::new(RateLimitGovernor::new());
        let scheduler = TaskScheduler::new(config.max_parallel, governor);
        Self {
            config,
            executor,
            ledger: Arc::new(Mutex::new(ledger)),
            scheduler,
            checkpoint,
            state: BatchState::Configured,
            progress: None,
            runs_since_checkpoint: 0,
        }
    }

    pub fn set_progress(&mut self, hook: ProgressHook) {
        self.progress = Some(hook);
    }

    pub fn state(&self) -> BatchState {
        self.state
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    pub fn variations(&self) -> &[Variation] {
        &self.checkpoint.variations
    }

    fn total_runs(&self) -> usize {
        self.checkpoint.variations.len() * self.config.runs_per_variation as usize
    }

    /// Candidate tasks in declared order: the full (variation ×
    /// run-number) space minus the completed-id set. Admission is NOT
    /// evaluated here; it happens immediately before each dispatch.
    fn candidate_tasks(&self) -> Vec<RunTask> {
        let completed = &self.checkpoint.completed_runs;
        let mut tasks = Vec::new();
        for variation in &self.checkpoint.variations {
            for run_number in 1..=self.config.runs_per_variation {
                let task = RunTask::new(variation.id, run_number);
                if !completed.contains(&task.run_id) {
                    tasks.push(task);
                }
            }
        }
        tasks
    }

    /// Dry-run preview. No execution, no writes.
    pub fn plan(&self) -> BatchPlan {
        let total = self.total_runs();
        let remaining = self.candidate_tasks().len();
        BatchPlan {
            experiment_name: self.config.name.clone(),
            variation_count: self.checkpoint.variations.len(),
            runs_per_variation: self.config.runs_per_variation,
            total_runs: total,
            already_completed: total - remaining,
            remaining_runs: remaining,
            max_parallel: self.config.max_parallel,
            budget_limit: self.config.budget_limit,
            cost_per_run_limit: self.config.cost_per_run_limit,
            projected_max_spend: self
                .config
                .cost_per_run_limit
                .map(|limit| limit * remaining as f64),
        }
    }

    /// Drive the batch to a terminal state. Only a fatal error
    /// propagates as `Err`; budget pause and run failures are normal
    /// outcomes described by the returned summary.
    pub async fn run(&mut self) -> Result<BatchSummary> {
        simlab_core::ensure_dir(&self.config.output_dir)?;
        self.state = BatchState::Running;
        info!(
            experiment = %self.config.name,
            variations = self.checkpoint.variations.len(),
            runs_per_variation = self.config.runs_per_variation,
            max_parallel = self.config.max_parallel,
            "starting batch"
        );

        let fatal = if self.config.sequential() {
            self.run_sequential().await
        } else {
            self.run_parallel().await
        };

        match fatal {
            None => {
                if self.state == BatchState::Running {
                    self.state = BatchState::Completed;
                }
                self.finalize()?;
                Ok(self.summarize().await)
            }
            Some(message) => {
                self.state = BatchState::Failed;
                self.finalize()?;
                let summary = self.summarize().await;
                warn!(preview = %summary.preview(), "batch failed");
                Err(anyhow!("fatal_batch_error: {}", message))
            }
        }
    }

    /// Strict declared order, one run at a time. Returns a fatal
    /// message if the batch must halt.
    async fn run_sequential(&mut self) -> Option<String> {
        let tasks = self.candidate_tasks();
        for task in tasks {
            {
                let ledger = self.ledger.lock().await;
                let admission = ledger.can_start_run();
                if !admission.allowed {
                    let reason = admission.reason.unwrap_or_default();
                    info!(run_id = %task.run_id, %reason, "budget admission denied, pausing batch");
                    self.state = BatchState::PausedBudget;
                    if let Err(e) = self.persist_progress() {
                        return Some(format!("checkpoint_write_failed: {}", e));
                    }
                    return None;
                }
            }

            let outcome = self.dispatch_with_retry(&task).await;
            match outcome {
                Ok(TaskOutcome::Ran(record)) => {
                    self.apply_record(record);
                    self.runs_since_checkpoint += 1;
                    if self.runs_since_checkpoint >= self.config.checkpoint_interval {
                        if let Err(e) = self.persist_progress() {
                            return Some(format!("checkpoint_write_failed: {}", e));
                        }
                        self.runs_since_checkpoint = 0;
                    }
                }
                Ok(TaskOutcome::Denied(_)) | Ok(TaskOutcome::Skipped) => {}
                Err(message) => return Some(message),
            }
        }
        None
    }

    /// Pre-enumerated candidate list dispatched through the bounded
    /// scheduler; admission is re-checked inside each task at dispatch
    /// time. Rate-limited tasks get further rounds; the checkpoint is
    /// written once after the batch (single-writer rule).
    async fn run_parallel(&mut self) -> Option<String> {
        let halt = AtomicBool::new(false);
        let mut pending = self.candidate_tasks();
        let mut fatal_message: Option<String> = None;
        let mut any_denied = false;

        for attempt in 1..=MAX_ATTEMPTS_PER_RUN {
            if pending.is_empty() || fatal_message.is_some() {
                break;
            }
            // Inner scope: the task closures and progress adapter
            // borrow `self` immutably; results are owned, so record
            // application below can take `self` mutably again.
            let results = {
                let this: &Self = &*self;
                let batch: Vec<(String, _)> = pending
                    .iter()
                    .filter_map(|task| {
                        let variation = this
                            .checkpoint
                            .variations
                            .iter()
                            .find(|v| v.id == task.variation_id)?
                            .clone();
                        let task = task.clone();
                        let halt = &halt;
                        Some((task.run_id.clone(), move || {
                            this.run_task(task, variation, halt)
                        }))
                    })
                    .collect();

                let progress = this.progress.as_deref();
                let on_progress = move |task_id: &str, result: &Result<TaskOutcome, RunError>| {
                    if let Some(hook) = progress {
                        if let Ok(TaskOutcome::Ran(record)) = result {
                            hook(&RunProgress {
                                run_id: task_id.to_string(),
                                status: record.status,
                                cost: record.cost,
                            });
                        }
                    }
                };
                this.scheduler.execute_batch(batch, Some(&on_progress)).await
            };

            let mut retry = Vec::new();
            for (task_id, result) in results {
                match result {
                    Ok(TaskOutcome::Ran(record)) => self.apply_record(record),
                    Ok(TaskOutcome::Denied(reason)) => {
                        debug!(run_id = %task_id, %reason, "admission denied at dispatch");
                        any_denied = true;
                    }
                    Ok(TaskOutcome::Skipped) => {}
                    Err(RunError::Fatal(message)) => {
                        fatal_message.get_or_insert(message);
                    }
                    Err(RunError::RateLimited { .. }) if attempt < MAX_ATTEMPTS_PER_RUN => {
                        debug!(run_id = %task_id, attempt, "rate limited, queueing retry round");
                        retry.push(task_id);
                    }
                    Err(e) => {
                        let record = self.failure_record(&task_id, &e).await;
                        self.emit_progress(&record);
                        self.apply_record(record);
                    }
                }
            }
            pending.retain(|task| retry.contains(&task.run_id));
        }

        if fatal_message.is_some() {
            return fatal_message;
        }
        if any_denied {
            self.state = BatchState::PausedBudget;
        }
        if let Err(e) = self.persist_progress() {
            return Some(format!("checkpoint_write_failed: {}", e));
        }
        None
    }

    /// Sequential-mode dispatch: up to `MAX_ATTEMPTS_PER_RUN` attempts
    /// while the upstream keeps rate limiting; the governor's cooldown
    /// gates each retry. Returns `Err(message)` only for fatal errors.
    async fn dispatch_with_retry(&self, task: &RunTask) -> Result<TaskOutcome, String> {
        let Some(variation) = self
            .checkpoint
            .variations
            .iter()
            .find(|v| v.id == task.variation_id)
            .cloned()
        else {
            return Err(format!("variation_missing: {}", task.variation_id));
        };
        let halt = AtomicBool::new(false);

        for attempt in 1..=MAX_ATTEMPTS_PER_RUN {
            let result = self
                .scheduler
                .execute_one(self.run_task(task.clone(), variation.clone(), &halt))
                .await;
            match result {
                Ok(outcome) => {
                    if let TaskOutcome::Ran(record) = &outcome {
                        self.emit_progress(record);
                    }
                    return Ok(outcome);
                }
                Err(RunError::Fatal(message)) => return Err(message),
                Err(RunError::RateLimited { .. }) if attempt < MAX_ATTEMPTS_PER_RUN => {
                    debug!(run_id = %task.run_id, attempt, "rate limited, retrying after cooldown");
                }
                Err(e) => {
                    let record = self.failure_record(&task.run_id, &e).await;
                    self.emit_progress(&record);
                    return Ok(TaskOutcome::Ran(record));
                }
            }
        }
        unreachable!("retry loop always returns within MAX_ATTEMPTS_PER_RUN")
    }

    /// The per-task body dispatched through the scheduler: admission
    /// check at dispatch time, scenario materialization into a scratch
    /// working copy (removed on every path), the opaque executor call,
    /// then cost recording under a single ledger lock.
    async fn run_task(
        &self,
        task: RunTask,
        variation: Variation,
        halt: &AtomicBool,
    ) -> Result<TaskOutcome, RunError> {
        if halt.load(Ordering::SeqCst) {
            return Ok(TaskOutcome::Skipped);
        }
        {
            let ledger = self.ledger.lock().await;
            let admission = ledger.can_start_run();
            if !admission.allowed {
                return Ok(TaskOutcome::Denied(admission.reason.unwrap_or_default()));
            }
        }

        let output_dir = self.config.output_dir.join("runs").join(&task.run_id);
        let outcome = self.execute_isolated(&variation, &task, &output_dir).await;
        match outcome {
            Ok(outcome) => {
                // check-then-record under one lock so concurrent
                // workers never interleave partial updates.
                let mut ledger = self.ledger.lock().await;
                let record = match outcome.status {
                    ExecutorStatus::Completed => {
                        let check = ledger.check_run_cost(outcome.total_cost);
                        ledger.record_run_cost(
                            &task.run_id,
                            task.variation_id,
                            outcome.total_cost,
                            true,
                        );
                        RunRecord {
                            run_id: task.run_id.clone(),
                            variation_id: task.variation_id,
                            status: if check.within_limit {
                                RunStatus::Success
                            } else {
                                RunStatus::CostLimitExceeded
                            },
                            cost: outcome.total_cost,
                            error: check.reason,
                            rate_limited: false,
                            output_dir: Some(output_dir),
                        }
                    }
                    ExecutorStatus::Paused | ExecutorStatus::Failed => {
                        ledger.record_run_cost(
                            &task.run_id,
                            task.variation_id,
                            outcome.total_cost,
                            false,
                        );
                        let detail = match outcome.status {
                            ExecutorStatus::Paused => "scenario paused before completion",
                            _ => "executor reported failure",
                        };
                        RunRecord {
                            run_id: task.run_id.clone(),
                            variation_id: task.variation_id,
                            status: RunStatus::Failed,
                            cost: outcome.total_cost,
                            error: Some(detail.to_string()),
                            rate_limited: false,
                            output_dir: Some(output_dir),
                        }
                    }
                };
                Ok(TaskOutcome::Ran(record))
            }
            Err(e) => {
                if e.is_fatal() {
                    halt.store(true, Ordering::SeqCst);
                }
                Err(e)
            }
        }
    }

    /// Materialize the variation's scenario snapshot into a transient
    /// working copy and invoke the executor against an isolated output
    /// dir. The scratch dir is removed on every exit path by its Drop
    /// guard.
    ///
    /// `scenario_path` may be a single YAML file or a directory; a
    /// directory is copied whole (prompt files and other assets ride
    /// along) and the variation is applied to its `scenario.yaml`.
    async fn execute_isolated(
        &self,
        variation: &Variation,
        task: &RunTask,
        output_dir: &Path,
    ) -> Result<crate::executor::RunOutcome, RunError> {
        let scratch = simlab_core::ScratchDir::create(
            self.config.output_dir.join("work").join(&task.run_id),
        )
        .map_err(|e| RunError::scenario(Severity::Medium, format!("workdir_failed: {}", e)))?;
        let snapshot = scratch.path().join("scenario.yaml");
        let base = if self.config.scenario_path.is_dir() {
            simlab_core::copy_dir_recursive(&self.config.scenario_path, scratch.path())
                .map_err(|e| {
                    RunError::scenario(Severity::Medium, format!("workdir_failed: {}", e))
                })?;
            snapshot.clone()
        } else {
            self.config.scenario_path.clone()
        };
        variations::apply(variation, &base, &snapshot)
            .map_err(|e| RunError::fatal(format!("scenario_materialize_failed: {}", e)))?;
        simlab_core::ensure_dir(output_dir)
            .map_err(|e| RunError::scenario(Severity::Medium, format!("outdir_failed: {}", e)))?;
        self.executor
            .run(&snapshot, output_dir, self.config.cost_per_run_limit)
            .await
    }

    /// Build the failure record for an error that escaped the task
    /// body (ordinary failures and exhausted rate-limit retries).
    async fn failure_record(&self, run_id: &str, error: &RunError) -> RunRecord {
        let variation_id = parse_variation_id(run_id).unwrap_or(0);
        {
            let mut ledger = self.ledger.lock().await;
            ledger.record_run_cost(run_id, variation_id, 0.0, false);
        }
        if error.severity() == Severity::High {
            warn!(run_id = %run_id, error = %error, "run failed");
        } else {
            debug!(run_id = %run_id, error = %error, "run failed");
        }
        RunRecord {
            run_id: run_id.to_string(),
            variation_id,
            status: RunStatus::Failed,
            cost: 0.0,
            error: Some(error.to_string()),
            rate_limited: error.is_rate_limited(),
            output_dir: None,
        }
    }

    fn emit_progress(&self, record: &RunRecord) {
        if let Some(hook) = self.progress.as_deref() {
            hook(&RunProgress {
                run_id: record.run_id.clone(),
                status: record.status,
                cost: record.cost,
            });
        }
    }

    /// Fold one record into the completed/failed sets. Over-limit
    /// completions still count as (degraded) completions: the work was
    /// done and re-running it would only spend more. A completion
    /// supersedes any stale failed entry for the same id (a resumed
    /// batch retries runs that failed before the checkpoint).
    fn apply_record(&mut self, record: RunRecord) {
        match record.status {
            RunStatus::Success | RunStatus::CostLimitExceeded => {
                self.checkpoint
                    .failed_runs
                    .retain(|f| f.run_id != record.run_id);
                self.checkpoint.completed_runs.insert(record.run_id);
            }
            RunStatus::Failed => {
                let status = if record.rate_limited {
                    "rate_limited"
                } else {
                    "failed"
                };
                self.checkpoint
                    .failed_runs
                    .retain(|f| f.run_id != record.run_id);
                self.checkpoint.failed_runs.push(FailedRun {
                    run_id: record.run_id,
                    error: record.error.unwrap_or_default(),
                    status: status.to_string(),
                });
            }
            RunStatus::BudgetExceeded => {}
        }
    }

    /// Persist checkpoint + ledger. Orchestrator-only writer.
    fn persist_progress(&self) -> Result<()> {
        self.checkpoint.save(&self.config.output_dir)?;
        let ledger = self
            .ledger
            .try_lock()
            .map_err(|_| anyhow!("ledger_lock_contended: checkpoint while workers active"))?;
        ledger.save(&BatchCheckpoint::ledger_path_in(&self.config.output_dir))
    }

    fn finalize(&mut self) -> Result<()> {
        self.checkpoint.end_time = Some(Utc::now());
        {
            let mut ledger = self
                .ledger
                .try_lock()
                .map_err(|_| anyhow!("ledger_lock_contended: finalize while workers active"))?;
            ledger.mark_ended();
        }
        self.persist_progress()
    }

    async fn summarize(&self) -> BatchSummary {
        let ledger = self.ledger.lock().await;
        let duration = (Utc::now() - self.checkpoint.start_time)
            .to_std()
            .unwrap_or_default();
        let detail_path = self.config.output_dir.join("summary.json");
        let summary = BatchSummary {
            experiment_name: self.config.name.clone(),
            state: self.state,
            total_runs: self.total_runs(),
            completed_runs: self.checkpoint.completed_runs.len(),
            failed_runs: self.checkpoint.failed_runs.len(),
            duration_secs: duration.as_secs_f64(),
            ledger: ledger.summary(),
            failed: self.checkpoint.failed_runs.clone(),
            detail_path,
        };
        if let Ok(value) = serde_json::to_value(&summary) {
            if let Err(e) = simlab_core::atomic_write_json_pretty(&summary.detail_path, &value) {
                warn!(error = %e, "summary write failed");
            }
        }
        summary
    }
}

fn parse_variation_id(run_id: &str) -> Option<u32> {
    run_id
        .strip_prefix("var-")?
        .split('-')
        .next()?
        .parse()
        .ok()
}
