//! # lakeslice-checkpoint - Resumable Sync-Run State
//!
//! **Durable checkpoints for multi-table sync runs.** A checkpoint records which
//! tables of a run succeeded, failed, or were skipped, how far through the wave
//! plan the run got, and where each table's output was written. It is what
//! makes a run resumable (re-run only what did not succeed) and auditable
//! (list prior runs, enumerate their outputs for rollback).
//!
//! ## Core Concepts
//!
//! - [`SyncCheckpoint`] - one record per run: status, plan, completed wave, results
//! - [`ExtractionResult`] - write-once outcome of a single table
//! - [`CheckpointStore`] - storage contract (`create` / `save` / `load` / `list_runs`),
//!   with wave recording, terminal marking and rollback provided on top
//! - [`InMemoryCheckpointStore`] - reference backend for tests
//! - [`FileCheckpointStore`] - one JSON document per run, replaced atomically
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use lakeslice_checkpoint::{CheckpointStore, FileCheckpointStore, RunStatus};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = FileCheckpointStore::open(".lakeslice/runs").await?;
//!
//!     let run_id = lakeslice_checkpoint::generate_run_id();
//!     store.create(&run_id).await?;
//!     store.mark_terminal(&run_id, RunStatus::Completed).await?;
//!
//!     for run in store.list_runs().await? {
//!         println!("{} {} ({} tables)", run.run_id, run.status, run.table_count);
//!     }
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod error;
pub mod file;
pub mod memory;
pub mod traits;

pub use checkpoint::{
    generate_run_id, EdgeRecord, ExtractionResult, RunProgress, RunStatus, RunSummary,
    SyncCheckpoint, TableOutcome,
};
pub use error::{CheckpointError, Result};
pub use file::FileCheckpointStore;
pub use memory::InMemoryCheckpointStore;
pub use traits::CheckpointStore;
