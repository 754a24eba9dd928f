//! Core checkpoint data structures for resumable sync runs
//!
//! This module defines the persisted shape of a sync run: **[`SyncCheckpoint`]**,
//! the per-table **[`ExtractionResult`]**, and the run-level **[`RunStatus`]**.
//!
//! # Lifecycle
//!
//! ```text
//! create(run_id)            status = running, completedWaveIndex = null
//!     │
//!     ↓ record_plan(waves)
//! record_wave(0, results)   completedWaveIndex = 0, results += wave 0
//! record_wave(1, results)   completedWaveIndex = 1, results += wave 1
//!     │
//!     ↓
//! mark_terminal(status)     status ∈ {completed, failed, aborted}
//! ```
//!
//! A resumed run reopens the same checkpoint: status goes back to `running`,
//! `resumes` is incremented, and `completedWaveIndex` restarts against the
//! re-derived plan. Results from the earlier attempt stay in `results` until a
//! newer result for the same table replaces them.
//!
//! # On-disk shape
//!
//! ```json
//! {
//!   "runId": "20261018T101500-3f2a9c1e",
//!   "startedAt": "2026-10-18T10:15:00Z",
//!   "completedWaveIndex": 1,
//!   "status": "completed",
//!   "results": {
//!     "orders": {
//!       "tableName": "orders",
//!       "success": true,
//!       "sampledRowCount": 5000,
//!       "sourceRowCount": null,
//!       "outputLocation": "./data/orders.jsonl",
//!       "error": null,
//!       "durationMs": 812
//!     }
//!   }
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

/// Generate a fresh, sortable run identifier (`<utc timestamp>-<8 hex chars>`).
pub fn generate_run_id() -> String {
    let stamp = Utc::now().format("%Y%m%dT%H%M%S");
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", stamp, &suffix[..8])
}

/// Run-level status of a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The run is in progress (or crashed while in progress)
    Running,
    /// Every table reached a terminal state and all of them succeeded
    Completed,
    /// Every table reached a terminal state and at least one failed or was skipped
    Failed,
    /// The run was cancelled before every table was attempted
    Aborted,
}

impl RunStatus {
    /// Whether the status ends a run.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Aborted => "aborted",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome of a single table, derived from an [`ExtractionResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableOutcome {
    Succeeded,
    Failed,
    Skipped,
}

impl fmt::Display for TableOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TableOutcome::Succeeded => "succeeded",
            TableOutcome::Failed => "failed",
            TableOutcome::Skipped => "skipped",
        })
    }
}

/// Outcome of one table's extraction.
///
/// Created once when the table reaches a terminal state and never mutated
/// afterwards. Skipped tables are recorded too (`skipped = true`) so the
/// checkpoint always enumerates every table that was planned and reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionResult {
    pub table_name: String,
    pub success: bool,
    pub sampled_row_count: u64,
    pub source_row_count: Option<u64>,
    pub output_location: Option<String>,
    pub error: Option<String>,
    #[serde(rename = "durationMs", with = "duration_millis")]
    pub duration: Duration,
    /// Number of attempts made, including the successful one
    #[serde(default)]
    pub attempts: u32,
    /// The table was not attempted because an upstream table failed
    #[serde(default)]
    pub skipped: bool,
}

impl ExtractionResult {
    /// Result for a table whose rows were written.
    pub fn succeeded(
        table_name: impl Into<String>,
        sampled_row_count: u64,
        source_row_count: Option<u64>,
        output_location: impl Into<String>,
        duration: Duration,
        attempts: u32,
    ) -> Self {
        Self {
            table_name: table_name.into(),
            success: true,
            sampled_row_count,
            source_row_count,
            output_location: Some(output_location.into()),
            error: None,
            duration,
            attempts,
            skipped: false,
        }
    }

    /// Result for a table that reached a terminal failure.
    pub fn failed(
        table_name: impl Into<String>,
        error: impl Into<String>,
        duration: Duration,
        attempts: u32,
    ) -> Self {
        Self {
            table_name: table_name.into(),
            success: false,
            sampled_row_count: 0,
            source_row_count: None,
            output_location: None,
            error: Some(error.into()),
            duration,
            attempts,
            skipped: false,
        }
    }

    /// Result for a table that was never attempted because a dependency failed.
    pub fn skipped(table_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            success: false,
            sampled_row_count: 0,
            source_row_count: None,
            output_location: None,
            error: Some(reason.into()),
            duration: Duration::ZERO,
            attempts: 0,
            skipped: true,
        }
    }

    pub fn outcome(&self) -> TableOutcome {
        if self.success {
            TableOutcome::Succeeded
        } else if self.skipped {
            TableOutcome::Skipped
        } else {
            TableOutcome::Failed
        }
    }
}

/// A dependency edge that was removed to break a cycle, kept for auditing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EdgeRecord {
    pub from: String,
    pub to: String,
}

/// Completed/total counts for a run, as reported by status queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunProgress {
    pub completed: usize,
    pub total: usize,
}

impl RunProgress {
    /// Whole-number completion percentage; an empty plan counts as done.
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        ((self.completed.min(self.total) * 100) / self.total) as u8
    }
}

/// Durable record of one sync run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCheckpoint {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Index of the last wave whose tables all reached a terminal state
    pub completed_wave_index: Option<usize>,
    pub status: RunStatus,
    /// Wave plan of the current attempt, table names per wave
    #[serde(default)]
    pub waves: Vec<Vec<String>>,
    #[serde(default)]
    pub broken_edges: Vec<EdgeRecord>,
    /// How many times the run has been resumed
    #[serde(default)]
    pub resumes: u32,
    /// Sampling override the run was started with, reapplied when it resumes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_override: Option<serde_json::Value>,
    pub results: BTreeMap<String, ExtractionResult>,
}

impl SyncCheckpoint {
    /// Fresh checkpoint in `running` state with no plan and no results.
    pub fn new(run_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.into(),
            started_at: now,
            updated_at: now,
            finished_at: None,
            completed_wave_index: None,
            status: RunStatus::Running,
            waves: Vec::new(),
            broken_edges: Vec::new(),
            resumes: 0,
            caller_override: None,
            results: BTreeMap::new(),
        }
    }

    /// Record the wave plan for the current attempt.
    pub fn set_plan(&mut self, waves: Vec<Vec<String>>, broken_edges: Vec<EdgeRecord>) {
        self.waves = waves;
        self.broken_edges = broken_edges;
        self.completed_wave_index = None;
        self.touch();
    }

    /// Append a finished wave's results and advance `completed_wave_index`.
    ///
    /// A result for a table already present (from an earlier attempt of a
    /// resumed run) is replaced by the newer one.
    pub fn record_wave(&mut self, wave_index: usize, results: Vec<ExtractionResult>) {
        for result in results {
            self.results.insert(result.table_name.clone(), result);
        }
        self.completed_wave_index = Some(
            self.completed_wave_index
                .map_or(wave_index, |current| current.max(wave_index)),
        );
        self.touch();
    }

    /// Reopen a terminal checkpoint for a resumed attempt.
    pub fn reopen(&mut self) {
        self.status = RunStatus::Running;
        self.finished_at = None;
        self.resumes += 1;
        self.touch();
    }

    pub fn mark_terminal(&mut self, status: RunStatus) {
        self.status = status;
        if status.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Every table the run covers: the current plan plus tables settled by
    /// an earlier attempt (a resumed attempt only plans what is left).
    pub fn planned_tables(&self) -> BTreeSet<String> {
        self.waves
            .iter()
            .flatten()
            .chain(self.results.keys())
            .cloned()
            .collect()
    }

    fn tables_with(&self, outcome: TableOutcome) -> BTreeSet<String> {
        self.results
            .values()
            .filter(|r| r.outcome() == outcome)
            .map(|r| r.table_name.clone())
            .collect()
    }

    pub fn succeeded_tables(&self) -> BTreeSet<String> {
        self.tables_with(TableOutcome::Succeeded)
    }

    pub fn failed_tables(&self) -> BTreeSet<String> {
        self.tables_with(TableOutcome::Failed)
    }

    pub fn skipped_tables(&self) -> BTreeSet<String> {
        self.tables_with(TableOutcome::Skipped)
    }

    /// Output locations written by this run, in table-name order.
    pub fn output_locations(&self) -> Vec<String> {
        self.results
            .values()
            .filter_map(|r| r.output_location.clone())
            .collect()
    }

    /// Completed/total counts over every table of the run.
    pub fn progress(&self) -> RunProgress {
        let planned = self.planned_tables();
        let completed = planned
            .iter()
            .filter(|table| self.results.contains_key(*table))
            .count();
        RunProgress {
            completed,
            total: planned.len(),
        }
    }
}

/// Listing entry for a stored run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub table_count: usize,
}

impl From<&SyncCheckpoint> for RunSummary {
    fn from(checkpoint: &SyncCheckpoint) -> Self {
        Self {
            run_id: checkpoint.run_id.clone(),
            status: checkpoint.status,
            started_at: checkpoint.started_at,
            table_count: checkpoint.planned_tables().len(),
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(table: &str, rows: u64) -> ExtractionResult {
        ExtractionResult::succeeded(
            table,
            rows,
            None,
            format!("out/{}.jsonl", table),
            Duration::from_millis(5),
            1,
        )
    }

    #[test]
    fn test_new_checkpoint_is_running() {
        let cp = SyncCheckpoint::new("run-1");
        assert_eq!(cp.status, RunStatus::Running);
        assert!(cp.completed_wave_index.is_none());
        assert!(cp.results.is_empty());
    }

    #[test]
    fn test_record_wave_advances_index() {
        let mut cp = SyncCheckpoint::new("run-1");
        cp.set_plan(vec![vec!["a".into()], vec!["b".into()]], vec![]);

        cp.record_wave(0, vec![ok("a", 10)]);
        assert_eq!(cp.completed_wave_index, Some(0));
        assert_eq!(cp.progress(), RunProgress { completed: 1, total: 2 });

        cp.record_wave(1, vec![ExtractionResult::failed("b", "boom", Duration::ZERO, 3)]);
        assert_eq!(cp.completed_wave_index, Some(1));
        assert_eq!(cp.progress().percent(), 100);
    }

    #[test]
    fn test_outcome_sets() {
        let mut cp = SyncCheckpoint::new("run-1");
        cp.record_wave(
            0,
            vec![
                ok("a", 1),
                ExtractionResult::failed("b", "auth", Duration::ZERO, 1),
                ExtractionResult::skipped("c", "upstream table `b` failed"),
            ],
        );

        assert_eq!(cp.succeeded_tables(), BTreeSet::from(["a".to_string()]));
        assert_eq!(cp.failed_tables(), BTreeSet::from(["b".to_string()]));
        assert_eq!(cp.skipped_tables(), BTreeSet::from(["c".to_string()]));
        assert_eq!(cp.output_locations(), vec!["out/a.jsonl".to_string()]);
    }

    #[test]
    fn test_newer_result_replaces_older() {
        let mut cp = SyncCheckpoint::new("run-1");
        cp.record_wave(0, vec![ExtractionResult::failed("a", "timeout", Duration::ZERO, 3)]);
        cp.reopen();
        cp.record_wave(0, vec![ok("a", 7)]);

        assert_eq!(cp.results["a"].sampled_row_count, 7);
        assert_eq!(cp.resumes, 1);
    }

    #[test]
    fn test_replanned_attempt_keeps_settled_tables() {
        let mut cp = SyncCheckpoint::new("run-1");
        cp.set_plan(vec![vec!["a".into()], vec!["b".into()]], vec![]);
        cp.record_wave(0, vec![ok("a", 1)]);
        cp.record_wave(1, vec![ExtractionResult::failed("b", "boom", Duration::ZERO, 1)]);

        cp.reopen();
        cp.set_plan(vec![vec!["b".into()]], vec![]);

        assert_eq!(
            cp.planned_tables(),
            BTreeSet::from(["a".to_string(), "b".to_string()])
        );
        assert_eq!(cp.progress(), RunProgress { completed: 2, total: 2 });
    }

    #[test]
    fn test_mark_terminal_sets_finish_time() {
        let mut cp = SyncCheckpoint::new("run-1");
        cp.mark_terminal(RunStatus::Aborted);
        assert!(cp.finished_at.is_some());
        assert!(cp.status.is_terminal());
    }

    #[test]
    fn test_json_uses_camel_case_keys() {
        let mut cp = SyncCheckpoint::new("run-1");
        cp.record_wave(0, vec![ok("orders", 50)]);
        let json = serde_json::to_value(&cp).unwrap();

        assert_eq!(json["runId"], "run-1");
        assert_eq!(json["completedWaveIndex"], 0);
        assert_eq!(json["status"], "running");
        assert_eq!(json["results"]["orders"]["sampledRowCount"], 50);
        assert_eq!(json["results"]["orders"]["durationMs"], 5);
        assert!(json.get("callerOverride").is_none());
    }

    #[test]
    fn test_caller_override_is_optional_on_disk() {
        let mut cp = SyncCheckpoint::new("run-1");
        cp.caller_override = Some(serde_json::json!({ "row_budget": 3 }));
        let json = serde_json::to_value(&cp).unwrap();
        assert_eq!(json["callerOverride"]["row_budget"], 3);

        // Records written before the field existed still load
        let mut legacy = json.clone();
        legacy.as_object_mut().unwrap().remove("callerOverride");
        let loaded: SyncCheckpoint = serde_json::from_value(legacy).unwrap();
        assert!(loaded.caller_override.is_none());
    }

    #[test]
    fn test_generated_run_ids_are_unique() {
        let a = generate_run_id();
        let b = generate_run_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), "20261018T101500-3f2a9c1e".len());
    }
}
