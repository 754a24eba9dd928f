//! Glue between configuration, the fixture catalog, the file writer and the
//! checkpoint directory. Every subcommand goes through [`App`].

use crate::catalog::Catalog;
use crate::config::LakesliceConfig;
use crate::writer::{remove_outputs, FileWriter};
use anyhow::{bail, Context, Result};
use lakeslice_checkpoint::{CheckpointStore, FileCheckpointStore, RunSummary, SyncCheckpoint};
use lakeslice_core::{
    CancellationToken, InMemoryStore, ProgressCallback, RemoteStore, ResumeOptions, SampleSpecPatch,
    SyncOrchestrator, SyncSummary, TableGraph, TableWriter, WavePlan,
};
use std::sync::Arc;
use tracing::info;

pub struct App {
    config: LakesliceConfig,
    checkpoints: Arc<FileCheckpointStore>,
    writer: Arc<dyn TableWriter>,
}

impl App {
    pub fn new(config: LakesliceConfig) -> Self {
        let checkpoints = Arc::new(FileCheckpointStore::new(config.state.dir.clone()));
        Self {
            config,
            checkpoints,
            writer: Arc::new(FileWriter::new()),
        }
    }

    /// Swap the output writer (tests use the in-memory one).
    pub fn with_writer(mut self, writer: Arc<dyn TableWriter>) -> Self {
        self.writer = writer;
        self
    }

    pub fn config(&self) -> &LakesliceConfig {
        &self.config
    }

    /// The table graph the configuration selects from `store`.
    pub async fn graph(&self, store: &InMemoryStore) -> Result<TableGraph> {
        let tables = store.list_tables().await.context("Failed to list tables")?;
        let mut graph = TableGraph::new(tables)?;
        if self.config.graph.infer_foreign_keys {
            graph = graph.with_inferred_foreign_keys();
        }
        if !self.config.graph.include.is_empty() || !self.config.graph.exclude.is_empty() {
            graph = graph.retain(&self.config.graph.include, &self.config.graph.exclude);
        }
        if graph.is_empty() {
            bail!("No tables selected for sync");
        }
        Ok(graph)
    }

    pub async fn plan(&self, catalog: Catalog) -> Result<(TableGraph, WavePlan)> {
        let store = catalog.into_store();
        let graph = self.graph(&store).await?;
        let plan = self.orchestrator(&store, None).plan(&graph)?;
        Ok((graph, plan))
    }

    pub async fn run(
        &self,
        catalog: Catalog,
        run_id: &str,
        caller: Option<&SampleSpecPatch>,
        cancel: &CancellationToken,
        progress: Option<ProgressCallback>,
    ) -> Result<SyncSummary> {
        let store = catalog.into_store();
        let graph = self.graph(&store).await?;
        let specs = self.config.spec_resolver();

        info!(run_id, tables = graph.len(), "Running sync");
        let summary = self
            .orchestrator(&store, progress)
            .with_caller_override(caller.cloned())
            .run(run_id, &graph, |table| specs.resolve(table, caller), cancel)
            .await?;
        Ok(summary)
    }

    /// Resume `run_id` with the sampling override its run was started with.
    /// A `caller` override given here is layered on top of the stored one.
    pub async fn resume(
        &self,
        catalog: Catalog,
        run_id: &str,
        caller: Option<&SampleSpecPatch>,
        options: ResumeOptions,
        cancel: &CancellationToken,
        progress: Option<ProgressCallback>,
    ) -> Result<SyncSummary> {
        let store = catalog.into_store();
        let graph = self.graph(&store).await?;
        let specs = self.config.spec_resolver();

        let orchestrator = self.orchestrator(&store, progress);
        let stored = orchestrator.stored_caller_override(run_id).await?;
        let effective = match (caller, stored) {
            (Some(caller), Some(stored)) => Some(caller.over(&stored)),
            (caller, stored) => caller.cloned().or(stored),
        };
        if effective.is_some() {
            info!(run_id, caller_override = ?effective, "Resuming with sampling override");
        }

        let summary = orchestrator
            .with_caller_override(effective.clone())
            .resume(
                run_id,
                &graph,
                |table| specs.resolve(table, effective.as_ref()),
                options,
                cancel,
            )
            .await?;
        Ok(summary)
    }

    pub async fn status(&self, run_id: Option<&str>) -> Result<SyncCheckpoint> {
        let run_id = match run_id {
            Some(id) => id.to_string(),
            None => match self.checkpoints.latest_run().await? {
                Some(latest) => latest.run_id,
                None => bail!("No runs recorded in {}", self.config.state.dir.display()),
            },
        };
        Ok(self.checkpoints.require(&run_id).await?)
    }

    pub async fn runs(&self) -> Result<Vec<RunSummary>> {
        Ok(self.checkpoints.list_runs().await?)
    }

    /// Output locations of `run_id`; deleted (with the checkpoint) when
    /// `delete` is set.
    pub async fn rollback(&self, run_id: &str, delete: bool) -> Result<Vec<String>> {
        let locations = self.checkpoints.rollback(run_id).await?;
        if delete {
            let removed = remove_outputs(&locations).await?;
            self.checkpoints.delete(run_id).await?;
            info!(run_id, removed, "Rolled back run");
        }
        Ok(locations)
    }

    fn orchestrator(
        &self,
        store: &InMemoryStore,
        progress: Option<ProgressCallback>,
    ) -> SyncOrchestrator {
        let orchestrator = SyncOrchestrator::new(
            Arc::new(store.clone()),
            Arc::clone(&self.writer),
            self.checkpoints.clone(),
        )
        .with_config(self.config.orchestrator_config())
        .with_format(self.config.format_config());

        match progress {
            Some(callback) => orchestrator.on_progress(move |event| callback(event)),
            None => orchestrator,
        }
    }
}
