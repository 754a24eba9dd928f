//! # lakeslice-core - Sync Orchestration Engine
//!
//! **Pull a bounded, representative slice of a remote tabular store onto local
//! storage.** The hard part is not talking to the store or writing files; it is
//! deciding what to sync, in which order, how much in parallel, and how to
//! recover when part of a run fails. That is what this crate does.
//!
//! ## Overview
//!
//! ```text
//!  RemoteStore::list_tables
//!          │
//!          ↓
//!     TableGraph ──(declared + inferred foreign keys)
//!          │
//!          ↓ DependencyResolver (Kahn waves, cycle policy)
//!     WavePlan [[customers, orders], [order_items]]
//!          │
//!          ↓ SyncOrchestrator (bounded pool per wave, retry, skip, cancel)
//!   ExtractionJob ── SampleSpec → ExtractionRequest → RemoteStore → TableWriter
//!          │
//!          ↓ CheckpointStore (one record per run, updated per wave)
//!     SyncSummary
//! ```
//!
//! ## Core Concepts
//!
//! - [`TableGraph`] - tables and the edges `A -> B` ("A references B")
//! - [`DependencyResolver`] - produces waves; dependencies always land in an
//!   earlier wave, ties ordered by name
//! - [`SampleSpecResolver`] - caller > per-table > global, merged field by field,
//!   validated into a typed [`SampleSpec`]
//! - [`SyncOrchestrator`] - runs, resumes and rolls back runs
//! - [`RetryPolicy`] / [`TableState`] - retry as explicit state transitions
//! - [`RemoteStore`] / [`TableWriter`] - the two collaborator seams
//!
//! ## Quick Start
//!
//! ```rust
//! use lakeslice_core::{
//!     CancellationToken, InMemoryStore, MemoryWriter, SampleSpecPatch, SampleSpecResolver,
//!     Strategy, SyncOrchestrator, TableDescriptor, TableGraph,
//! };
//! use lakeslice_checkpoint::InMemoryCheckpointStore;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = InMemoryStore::new();
//! store.insert_table(TableDescriptor::new("customers"), vec![]);
//! store.insert_table(
//!     TableDescriptor::new("orders").with_foreign_key("customer_id", "customers", "id"),
//!     vec![],
//! );
//!
//! let graph = TableGraph::new(lakeslice_core::RemoteStore::list_tables(&store).await?)?;
//! let specs = SampleSpecResolver::new(
//!     SampleSpecPatch::strategy(Strategy::Random).with_row_budget(1_000),
//!     [("orders", SampleSpecPatch::strategy(Strategy::Full))],
//! );
//!
//! let orchestrator = SyncOrchestrator::new(
//!     Arc::new(store),
//!     Arc::new(MemoryWriter::new()),
//!     Arc::new(InMemoryCheckpointStore::new()),
//! );
//! let summary = orchestrator
//!     .run("run-1", &graph, |t| specs.resolve(t, None), &CancellationToken::new())
//!     .await?;
//!
//! assert_eq!(summary.waves, vec![vec!["customers"], vec!["orders"]]);
//! # Ok(())
//! # }
//! ```

pub mod cancel;
pub mod error;
pub mod extraction;
pub mod graph;
pub mod memory;
pub mod orchestrator;
pub mod resolver;
pub mod retry;
pub mod source;
pub mod spec;

pub use cancel::CancellationToken;
pub use error::{
    CyclicDependencyError, ExtractionError, Result, SampleSpecError, StoreError, StoreErrorKind,
    SyncError, WriterError,
};
pub use extraction::{check_query, ExtractionJob, ExtractionOutput};
pub use graph::{Column, DanglingReference, Edge, ForeignKey, TableDescriptor, TableGraph};
pub use memory::{InMemoryStore, MemoryWriter};
pub use orchestrator::{
    OrchestratorConfig, ProgressCallback, ProgressEvent, ResumeOptions, SyncOrchestrator,
    SyncSummary,
};
pub use resolver::{BreakPolicy, DependencyResolver, Wave, WavePlan};
pub use retry::{RetryPolicy, TableEvent, TableState};
pub use source::{
    ExtractionRequest, FormatConfig, OutputFormat, RemoteStore, Row, RowStream, TableStream,
    TableWriter, WriteReceipt,
};
pub use spec::{SampleSpec, SampleSpecPatch, SampleSpecResolver, Strategy};
