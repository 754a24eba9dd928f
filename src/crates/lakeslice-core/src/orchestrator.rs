//! Sync orchestration: waves, a bounded worker pool, retries, checkpoints
//!
//! # Run lifecycle
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │ run(run_id, graph, resolve_spec, cancel)                          │
//! │   1. DependencyResolver: graph -> waves (cycle => SyncError)      │
//! │   2. checkpoint: create + record plan                             │
//! │   3. resolve every table's SampleSpec (invalid => FailedTerminal) │
//! └──────────────┬────────────────────────────────────────────────────┘
//!                ↓ for each wave, strictly in order
//! ┌───────────────────────────────────────────────────────────────────┐
//! │ wave i                                                            │
//! │   • invalid spec                  -> Failed (zero attempts)       │
//! │   • dependency failed or skipped  -> Skipped (no remote call)     │
//! │   • otherwise spawn a job once a worker slot is free              │
//! │       (Semaphore of max_parallelism permits)                      │
//! │   • barrier: wait until every job of the wave is terminal         │
//! │   • checkpoint: record wave completion                            │
//! └──────────────┬────────────────────────────────────────────────────┘
//!                ↓
//! ┌───────────────────────────────────────────────────────────────────┐
//! │ checkpoint: mark Completed / Failed / Aborted -> SyncSummary      │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each job walks the [`TableState`] machine: an attempt that fails with a
//! retryable error waits out the policy's backoff and starts again; a
//! terminal error or exhausted attempts end the table as failed. Table
//! failures never abort the run; only planning and checkpoint I/O do.
//!
//! # Cancellation
//!
//! Once the token fires no new table is started. Tables already running are
//! allowed to finish their current attempt so no output is half-written; a
//! table waiting out a retry backoff ends as failed. Tables never started are
//! listed in [`SyncSummary::not_started`] and the run is marked `aborted`. A
//! run whose every table had already finished when the token fired keeps its
//! completed or failed status.

use crate::cancel::CancellationToken;
use crate::error::{ExtractionError, Result, SampleSpecError, SyncError};
use crate::extraction::ExtractionJob;
use crate::graph::{Edge, TableDescriptor, TableGraph};
use crate::resolver::{BreakPolicy, DependencyResolver, Wave, WavePlan};
use crate::retry::{RetryPolicy, TableEvent, TableState};
use crate::source::{FormatConfig, RemoteStore, TableWriter};
use crate::spec::{SampleSpec, SampleSpecPatch};
use lakeslice_checkpoint::{
    CheckpointError, CheckpointStore, ExtractionResult, RunStatus, TableOutcome,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Emitted after every table reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub table: String,
    pub outcome: TableOutcome,
    /// Tables terminal so far in this run, including this one
    pub completed: usize,
    pub total: usize,
}

/// Synchronous progress callback. Keep it cheap; buffer on the caller's side
/// if consumption needs backpressure.
pub type ProgressCallback = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

/// Execution settings for a run.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    pub max_parallelism: usize,
    pub retry: RetryPolicy,
    /// Per-attempt limit; expiry counts as a retryable failure
    pub table_timeout: Option<Duration>,
    pub break_policy: BreakPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_parallelism: 4,
            retry: RetryPolicy::default(),
            table_timeout: None,
            break_policy: BreakPolicy::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_parallelism == 0 {
            return Err(SyncError::Configuration(
                "max_parallelism must be at least 1".to_string(),
            ));
        }
        self.retry.validate().map_err(SyncError::Configuration)
    }
}

/// Options for [`SyncOrchestrator::resume`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResumeOptions {
    /// Keep previously failed tables failed instead of retrying them; their
    /// dependents stay skipped
    pub skip_failed: bool,
}

/// Outcome of a run (or of one resumed attempt of it).
#[derive(Debug, Clone)]
pub struct SyncSummary {
    pub run_id: String,
    pub status: RunStatus,
    pub waves: Vec<Wave>,
    pub broken_edges: Vec<Edge>,
    /// Every table that reached a terminal state, in plan order
    pub results: Vec<ExtractionResult>,
    /// Tables never started because the run was cancelled
    pub not_started: Vec<String>,
    /// Tables that succeeded in an earlier attempt and were not re-run
    pub carried_over: Vec<String>,
    pub duration: Duration,
}

impl SyncSummary {
    pub fn result(&self, table: &str) -> Option<&ExtractionResult> {
        self.results
            .iter()
            .find(|r| r.table_name.eq_ignore_ascii_case(table))
    }

    fn names_with(&self, outcome: TableOutcome) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| r.outcome() == outcome)
            .map(|r| r.table_name.as_str())
            .collect()
    }

    pub fn succeeded(&self) -> Vec<&str> {
        self.names_with(TableOutcome::Succeeded)
    }

    pub fn failed(&self) -> Vec<&str> {
        self.names_with(TableOutcome::Failed)
    }

    pub fn skipped(&self) -> Vec<&str> {
        self.names_with(TableOutcome::Skipped)
    }

    pub fn table_count(&self) -> usize {
        self.results.len() + self.not_started.len()
    }
}

/// Drives sync runs. Built per run (or per process) with its collaborators
/// injected; holds no global state.
pub struct SyncOrchestrator {
    job: Arc<ExtractionJob>,
    checkpoints: Arc<dyn CheckpointStore>,
    config: OrchestratorConfig,
    progress: Option<ProgressCallback>,
    caller_override: Option<SampleSpecPatch>,
}

impl std::fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("config", &self.config)
            .field("format", self.job.format())
            .field("caller_override", &self.caller_override)
            .finish_non_exhaustive()
    }
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        writer: Arc<dyn TableWriter>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            job: Arc::new(ExtractionJob::new(store, writer, FormatConfig::default())),
            checkpoints,
            config: OrchestratorConfig::default(),
            progress: None,
            caller_override: None,
        }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Output settings handed to the writer.
    pub fn with_format(mut self, format: FormatConfig) -> Self {
        self.job = Arc::new(self.job.with_format(format));
        self
    }

    /// Sampling override the caller resolves specs with. It is stored in the
    /// checkpoint so a resume can resolve the same specs.
    pub fn with_caller_override(mut self, patch: Option<SampleSpecPatch>) -> Self {
        self.caller_override = patch;
        self
    }

    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(callback));
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn checkpoints(&self) -> &Arc<dyn CheckpointStore> {
        &self.checkpoints
    }

    /// Resolve the graph into waves with the configured break policy.
    pub fn plan(&self, graph: &TableGraph) -> Result<WavePlan> {
        Ok(DependencyResolver::new(self.config.break_policy).resolve(graph)?)
    }

    /// Run a fresh sync of every table in `graph` under `run_id`.
    pub async fn run<F>(
        &self,
        run_id: &str,
        graph: &TableGraph,
        resolve_spec: F,
        cancel: &CancellationToken,
    ) -> Result<SyncSummary>
    where
        F: Fn(&str) -> std::result::Result<SampleSpec, SampleSpecError> + Sync,
    {
        self.config.validate()?;
        for dangling in graph.dangling_references() {
            warn!(
                table = %dangling.table,
                column = %dangling.column,
                referenced = %dangling.referenced_table,
                "Foreign key references a table outside the sync; ignored for ordering"
            );
        }

        let plan = self.plan(graph)?;
        let mut checkpoint = self.checkpoints.create(run_id).await?;
        if self.caller_override.is_some() {
            checkpoint.caller_override = self.encoded_caller_override()?;
            self.checkpoints.save(&checkpoint).await?;
        }
        let (waves, broken) = plan.to_checkpoint_plan();
        self.checkpoints.record_plan(run_id, waves, broken).await?;

        info!(
            run_id,
            tables = plan.table_count(),
            waves = plan.waves.len(),
            max_parallelism = self.config.max_parallelism,
            "Starting sync run"
        );
        self.execute(run_id, graph, &plan, &resolve_spec, AttemptSeed::default(), cancel)
            .await
    }

    /// Continue an earlier run: tables that succeeded are not touched, the
    /// rest are re-planned among themselves and run under the same `run_id`.
    pub async fn resume<F>(
        &self,
        run_id: &str,
        graph: &TableGraph,
        resolve_spec: F,
        options: ResumeOptions,
        cancel: &CancellationToken,
    ) -> Result<SyncSummary>
    where
        F: Fn(&str) -> std::result::Result<SampleSpec, SampleSpecError> + Sync,
    {
        self.config.validate()?;
        let mut checkpoint = self
            .checkpoints
            .load(run_id)
            .await?
            .ok_or_else(|| SyncError::RunNotFound(run_id.to_string()))?;

        let planned = match checkpoint.planned_tables() {
            tables if tables.is_empty() => graph
                .table_names()
                .into_iter()
                .map(str::to_string)
                .collect(),
            tables => tables,
        };
        let succeeded = lowercase(&checkpoint.succeeded_tables());
        let previously_failed = lowercase(&checkpoint.failed_tables());

        let mut seed = AttemptSeed::default();
        let mut remaining = Vec::new();
        for table in planned {
            if succeeded.contains(&table.to_lowercase()) {
                seed.carried_over.push(table);
            } else if graph.contains(&table) {
                remaining.push(table);
            } else {
                warn!(run_id, table = %table, "Table from the original plan is no longer listed by the store");
                let result = ExtractionResult::failed(
                    &table,
                    "table is no longer listed by the store",
                    Duration::ZERO,
                    0,
                );
                checkpoint.results.insert(table, result.clone());
                seed.vanished.push(result);
            }
        }

        let subgraph = graph.subgraph(&remaining);
        let plan = self.plan(&subgraph)?;

        // Under skip_failed, earlier failures are carried as-is so their
        // dependents are skipped again rather than attempted.
        if options.skip_failed {
            for table in plan.tables() {
                let key = table.to_lowercase();
                if previously_failed.contains(&key) {
                    if let Some(previous) = checkpoint
                        .results
                        .values()
                        .find(|r| r.table_name.eq_ignore_ascii_case(table))
                    {
                        seed.preset.insert(key, previous.clone());
                    }
                }
            }
        }

        if self.caller_override.is_some() {
            checkpoint.caller_override = self.encoded_caller_override()?;
        }
        checkpoint.reopen();
        self.checkpoints.save(&checkpoint).await?;
        let (waves, broken) = plan.to_checkpoint_plan();
        self.checkpoints.record_plan(run_id, waves, broken).await?;

        info!(
            run_id,
            resume = checkpoint.resumes,
            carried_over = seed.carried_over.len(),
            remaining = plan.table_count(),
            skip_failed = options.skip_failed,
            "Resuming sync run"
        );
        self.execute(run_id, &subgraph, &plan, &resolve_spec, seed, cancel)
            .await
    }

    /// Sampling override stored by the run's first attempt (or its latest
    /// resume), if any.
    pub async fn stored_caller_override(&self, run_id: &str) -> Result<Option<SampleSpecPatch>> {
        let checkpoint = self
            .checkpoints
            .load(run_id)
            .await?
            .ok_or_else(|| SyncError::RunNotFound(run_id.to_string()))?;
        checkpoint
            .caller_override
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| {
                SyncError::Configuration(format!(
                    "stored sampling override of run '{run_id}' is unreadable: {e}"
                ))
            })
    }

    fn encoded_caller_override(&self) -> Result<Option<serde_json::Value>> {
        self.caller_override
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| SyncError::Configuration(format!("cannot store sampling override: {e}")))
    }

    /// Output locations written by the run, for the caller to delete.
    pub async fn rollback(&self, run_id: &str) -> Result<Vec<String>> {
        match self.checkpoints.rollback(run_id).await {
            Ok(locations) => Ok(locations),
            Err(CheckpointError::NotFound(_)) => Err(SyncError::RunNotFound(run_id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn execute(
        &self,
        run_id: &str,
        graph: &TableGraph,
        plan: &WavePlan,
        resolve_spec: &(dyn Fn(&str) -> std::result::Result<SampleSpec, SampleSpecError> + Sync),
        seed: AttemptSeed,
        cancel: &CancellationToken,
    ) -> Result<SyncSummary> {
        let started = Instant::now();
        let total = plan.table_count();
        let AttemptSeed {
            mut preset,
            carried_over,
            vanished,
        } = seed;

        // Specs are validated before anything is scheduled.
        let mut specs: BTreeMap<String, SampleSpec> = BTreeMap::new();
        let mut rejected: BTreeMap<String, String> = BTreeMap::new();
        for table in plan.tables() {
            let key = table.to_lowercase();
            if preset.contains_key(&key) {
                continue;
            }
            match resolve_spec(table) {
                Ok(spec) => {
                    debug!(table, spec = %spec, "Resolved sample spec");
                    specs.insert(key, spec);
                }
                Err(e) => {
                    warn!(table, error = %e, "Invalid sample spec; table will not be extracted");
                    rejected.insert(key, e.to_string());
                }
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_parallelism));
        let retry = &self.config.retry;
        let mut blocked: BTreeSet<String> = BTreeSet::new();
        let mut results = vanished;
        let mut not_started = Vec::new();
        let mut interrupted = false;
        let mut completed = 0usize;

        for (wave_index, wave) in plan.waves.iter().enumerate() {
            if !cancel.is_cancelled() {
                info!(run_id, wave = wave_index, tables = ?wave, "Starting wave");
            }

            let mut wave_results: Vec<ExtractionResult> = Vec::with_capacity(wave.len());
            let mut in_flight: BTreeSet<String> = BTreeSet::new();
            let mut workers = JoinSet::new();

            for table in wave {
                let key = table.to_lowercase();

                if !cancel.is_cancelled() {
                    if let Some(result) = preset.remove(&key) {
                        blocked.insert(key);
                        completed += 1;
                        self.emit(&result, completed, total);
                        wave_results.push(result);
                        continue;
                    }
                }

                let event = if cancel.is_cancelled() {
                    Some(TableEvent::Cancel)
                } else if let Some(error) = rejected.remove(&key) {
                    Some(TableEvent::Reject { error })
                } else if let Some(dep) = graph
                    .dependencies_of(table)
                    .into_iter()
                    .find(|dep| blocked.contains(&dep.to_lowercase()))
                {
                    warn!(run_id, table = %table, dependency = dep, "Skipping table; dependency did not succeed");
                    Some(TableEvent::Skip {
                        reason: format!("dependency '{dep}' did not succeed"),
                    })
                } else {
                    None
                };

                let event = match (event, graph.get(table), specs.get(&key)) {
                    (Some(event), _, _) => event,
                    (None, Some(descriptor), Some(spec)) => {
                        let permit = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => None,
                            permit = semaphore.clone().acquire_owned() => permit.ok(),
                        };
                        match permit {
                            Some(permit) => {
                                in_flight.insert(table.clone());
                                let job = Arc::clone(&self.job);
                                let descriptor = descriptor.clone();
                                let spec = spec.clone();
                                let retry = retry.clone();
                                let timeout = self.config.table_timeout;
                                let cancel = cancel.clone();
                                workers.spawn(async move {
                                    let run = run_table(
                                        &job,
                                        &descriptor,
                                        &spec,
                                        &retry,
                                        timeout,
                                        &cancel,
                                    )
                                    .await;
                                    drop(permit);
                                    run
                                });
                                continue;
                            }
                            None => TableEvent::Cancel,
                        }
                    }
                    (None, _, _) => TableEvent::Reject {
                        error: "table missing from graph".to_string(),
                    },
                };

                match settle_unstarted(table, event, retry) {
                    Some(result) => {
                        blocked.insert(key);
                        completed += 1;
                        self.emit(&result, completed, total);
                        wave_results.push(result);
                    }
                    None => not_started.push(table.clone()),
                }
            }

            // Wave barrier
            while let Some(joined) = workers.join_next().await {
                match joined {
                    Ok(TableRun { result, cancelled }) => {
                        in_flight.remove(&result.table_name);
                        interrupted |= cancelled;
                        if !result.success {
                            let downstream = graph.transitive_dependents(&result.table_name);
                            if !downstream.is_empty() {
                                warn!(
                                    run_id,
                                    table = %result.table_name,
                                    downstream = ?downstream,
                                    "Table failed; its dependents will be skipped"
                                );
                            }
                            blocked.insert(result.table_name.to_lowercase());
                        }
                        completed += 1;
                        self.emit(&result, completed, total);
                        wave_results.push(result);
                    }
                    Err(e) => error!(run_id, error = %e, "Extraction worker did not complete"),
                }
            }
            for table in std::mem::take(&mut in_flight) {
                let result =
                    ExtractionResult::failed(&table, "extraction worker aborted", Duration::ZERO, 0);
                blocked.insert(table.to_lowercase());
                completed += 1;
                self.emit(&result, completed, total);
                wave_results.push(result);
            }

            wave_results.sort_by_key(|r| wave.iter().position(|t| *t == r.table_name));
            if !wave_results.is_empty() {
                self.checkpoints
                    .record_wave_completion(run_id, wave_index, wave_results.clone())
                    .await?;
                info!(
                    run_id,
                    wave = wave_index,
                    succeeded = wave_results.iter().filter(|r| r.success).count(),
                    unsuccessful = wave_results.iter().filter(|r| !r.success).count(),
                    "Wave finished"
                );
            }
            results.extend(wave_results);
        }

        // The token alone does not abort a run: it must have kept a table
        // from starting or from retrying.
        let status = if interrupted || !not_started.is_empty() {
            RunStatus::Aborted
        } else if results.iter().all(|r| r.success) {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };
        self.checkpoints.mark_terminal(run_id, status).await?;

        let summary = SyncSummary {
            run_id: run_id.to_string(),
            status,
            waves: plan.waves.clone(),
            broken_edges: plan.broken_edges.clone(),
            results,
            not_started,
            carried_over,
            duration: started.elapsed(),
        };
        match status {
            RunStatus::Aborted => error!(
                run_id,
                finished = summary.results.len(),
                not_started = summary.not_started.len(),
                "Sync run aborted"
            ),
            _ => info!(
                run_id,
                status = %status,
                succeeded = summary.succeeded().len(),
                failed = summary.failed().len(),
                skipped = summary.skipped().len(),
                duration_ms = summary.duration.as_millis() as u64,
                "Sync run finished"
            ),
        }
        Ok(summary)
    }

    fn emit(&self, result: &ExtractionResult, completed: usize, total: usize) {
        if let Some(callback) = &self.progress {
            callback(&ProgressEvent {
                table: result.table_name.clone(),
                outcome: result.outcome(),
                completed,
                total,
            });
        }
    }
}

/// State carried into an attempt from an earlier one.
#[derive(Debug, Default)]
struct AttemptSeed {
    /// Lowercase table name -> result to record without running the table
    preset: BTreeMap<String, ExtractionResult>,
    carried_over: Vec<String>,
    /// Planned tables the store no longer lists
    vanished: Vec<ExtractionResult>,
}

fn lowercase(names: &BTreeSet<String>) -> BTreeSet<String> {
    names.iter().map(|n| n.to_lowercase()).collect()
}

/// Settle a table that gets no extraction attempt. `None` means it was
/// cancelled before it started and has no result to record.
fn settle_unstarted(
    table: &str,
    event: TableEvent,
    retry: &RetryPolicy,
) -> Option<ExtractionResult> {
    match TableState::Pending.on(event, retry) {
        TableState::Cancelled => None,
        TableState::Skipped { reason } => Some(ExtractionResult::skipped(table, reason)),
        TableState::FailedTerminal { attempts, error } => Some(ExtractionResult::failed(
            table,
            error,
            Duration::ZERO,
            attempts,
        )),
        other => Some(ExtractionResult::failed(
            table,
            format!("unexpected table state {other:?}"),
            Duration::ZERO,
            other.attempts(),
        )),
    }
}

/// How one table's extraction ended.
struct TableRun {
    result: ExtractionResult,
    /// Cancellation cut a retry backoff short
    cancelled: bool,
}

/// Drive one table through the state machine until it is terminal.
async fn run_table(
    job: &ExtractionJob,
    table: &TableDescriptor,
    spec: &SampleSpec,
    retry: &RetryPolicy,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> TableRun {
    let started = Instant::now();
    let mut state = TableState::Pending;

    loop {
        state = state.on(TableEvent::Start, retry);
        let attempt = state.attempts();
        debug!(table = %table.name, attempt, "Starting extraction attempt");

        let outcome = match timeout {
            Some(limit) => tokio::time::timeout(limit, job.attempt(table, spec))
                .await
                .unwrap_or(Err(ExtractionError::Timeout(limit))),
            None => job.attempt(table, spec).await,
        };

        let err = match outcome {
            Ok(output) => {
                state = state.on(TableEvent::Succeed, retry);
                info!(
                    table = %table.name,
                    rows = output.sampled_row_count,
                    attempts = state.attempts(),
                    location = %output.output_location,
                    "Table extracted"
                );
                return TableRun {
                    result: ExtractionResult::succeeded(
                        &table.name,
                        output.sampled_row_count,
                        output.source_row_count,
                        output.output_location,
                        started.elapsed(),
                        state.attempts(),
                    ),
                    cancelled: false,
                };
            }
            Err(err) => err,
        };

        state = state.on(
            TableEvent::Fail {
                error: err.to_string(),
                retryable: err.is_retryable(),
            },
            retry,
        );

        let mut cancelled = false;
        if let TableState::FailedRetryable { attempt, error } = &state {
            let delay = retry.calculate_delay(attempt - 1);
            warn!(
                table = %table.name,
                attempt = *attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Extraction failed; retrying"
            );
            let interrupted = tokio::select! {
                _ = tokio::time::sleep(delay) => false,
                _ = cancel.cancelled() => true,
            };
            if !interrupted {
                continue;
            }
            cancelled = true;
            state = state.on(TableEvent::Cancel, retry);
        }

        let (attempts, error) = match state {
            TableState::FailedTerminal { attempts, error } => (attempts, error),
            other => (other.attempts(), format!("unexpected table state {other:?}")),
        };
        error!(table = %table.name, attempts, error = %error, "Extraction failed");
        return TableRun {
            result: ExtractionResult::failed(&table.name, error, started.elapsed(), attempts),
            cancelled,
        };
    }
}
