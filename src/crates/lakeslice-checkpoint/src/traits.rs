//! Checkpoint storage trait for custom backend implementations
//!
//! [`CheckpointStore`] is the storage contract the sync orchestrator writes
//! through. Backends implement four primitive operations (`create`, `save`,
//! `load`, `list_runs`) plus `delete`; everything else (recording the plan,
//! recording a finished wave, marking a run terminal, rollback) is provided on
//! top of those primitives so every backend gets the same semantics.
//!
//! # Durability contract
//!
//! `save` replaces the single record kept per run. A backend must make that
//! replacement atomic: a reader never observes a partially written record,
//! only the previous or the new one. [`FileCheckpointStore`] does this with
//! write-to-temp-then-rename.
//!
//! # Ownership
//!
//! One orchestrator owns one `run_id`. No optimistic locking is attempted; if
//! two writers race on the same run, the last `save` wins.
//!
//! # Implementing a backend
//!
//! ```rust,ignore
//! use async_trait::async_trait;
//! use lakeslice_checkpoint::{CheckpointStore, RunSummary, SyncCheckpoint, Result};
//!
//! struct SqliteCheckpointStore { /* pool */ }
//!
//! #[async_trait]
//! impl CheckpointStore for SqliteCheckpointStore {
//!     async fn create(&self, run_id: &str) -> Result<SyncCheckpoint> { /* INSERT */ }
//!     async fn save(&self, checkpoint: &SyncCheckpoint) -> Result<()> { /* UPSERT in a tx */ }
//!     async fn load(&self, run_id: &str) -> Result<Option<SyncCheckpoint>> { /* SELECT */ }
//!     async fn list_runs(&self) -> Result<Vec<RunSummary>> { /* SELECT ... ORDER BY */ }
//!     async fn delete(&self, run_id: &str) -> Result<bool> { /* DELETE */ }
//! }
//! ```
//!
//! [`FileCheckpointStore`]: crate::file::FileCheckpointStore

use crate::checkpoint::{EdgeRecord, ExtractionResult, RunStatus, RunSummary, SyncCheckpoint};
use crate::error::{CheckpointError, Result};
use async_trait::async_trait;
use tracing::debug;

/// Durable storage for sync-run checkpoints.
///
/// Implementations must be `Send + Sync` for use behind `Arc<dyn CheckpointStore>`.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Create the checkpoint for a new run.
    ///
    /// Fails with [`CheckpointError::AlreadyExists`] if the run id is taken.
    async fn create(&self, run_id: &str) -> Result<SyncCheckpoint>;

    /// Atomically replace the stored record for `checkpoint.run_id`.
    async fn save(&self, checkpoint: &SyncCheckpoint) -> Result<()>;

    /// Load the last fully written checkpoint for a run, if any.
    async fn load(&self, run_id: &str) -> Result<Option<SyncCheckpoint>>;

    /// All stored runs, most recently started first.
    async fn list_runs(&self) -> Result<Vec<RunSummary>>;

    /// Remove a run's checkpoint. Returns whether anything was removed.
    async fn delete(&self, run_id: &str) -> Result<bool>;

    /// Load a checkpoint that must exist.
    async fn require(&self, run_id: &str) -> Result<SyncCheckpoint> {
        self.load(run_id)
            .await?
            .ok_or_else(|| CheckpointError::NotFound(run_id.to_string()))
    }

    /// Store the wave plan of the current attempt.
    async fn record_plan(
        &self,
        run_id: &str,
        waves: Vec<Vec<String>>,
        broken_edges: Vec<EdgeRecord>,
    ) -> Result<SyncCheckpoint> {
        let mut checkpoint = self.require(run_id).await?;
        checkpoint.set_plan(waves, broken_edges);
        self.save(&checkpoint).await?;
        Ok(checkpoint)
    }

    /// Record that every table of `wave_index` reached a terminal state.
    async fn record_wave_completion(
        &self,
        run_id: &str,
        wave_index: usize,
        results: Vec<ExtractionResult>,
    ) -> Result<SyncCheckpoint> {
        let mut checkpoint = self.require(run_id).await?;
        debug!(run_id, wave = wave_index, tables = results.len(), "Recording wave completion");
        checkpoint.record_wave(wave_index, results);
        self.save(&checkpoint).await?;
        Ok(checkpoint)
    }

    /// Move the run to a terminal (or, for resumes, running) status.
    async fn mark_terminal(&self, run_id: &str, status: RunStatus) -> Result<SyncCheckpoint> {
        let mut checkpoint = self.require(run_id).await?;
        checkpoint.mark_terminal(status);
        self.save(&checkpoint).await?;
        Ok(checkpoint)
    }

    /// Output locations written by the run, so a caller can delete them.
    ///
    /// The store never touches the outputs itself.
    async fn rollback(&self, run_id: &str) -> Result<Vec<String>> {
        Ok(self.require(run_id).await?.output_locations())
    }

    /// The most recently started run, if any.
    async fn latest_run(&self) -> Result<Option<RunSummary>> {
        Ok(self.list_runs().await?.into_iter().next())
    }
}
