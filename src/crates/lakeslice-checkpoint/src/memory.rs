//! In-memory checkpoint storage for development and testing
//!
//! [`InMemoryCheckpointStore`] keeps one [`SyncCheckpoint`] per run in an
//! `Arc<RwLock<HashMap>>`. Clones share the same storage, so a test can hand a
//! clone to the orchestrator and inspect the original afterwards. Nothing
//! survives a process restart; use [`FileCheckpointStore`] for that.
//!
//! [`FileCheckpointStore`]: crate::file::FileCheckpointStore

use crate::{
    checkpoint::{RunSummary, SyncCheckpoint},
    error::{CheckpointError, Result},
    traits::CheckpointStore,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

type CheckpointStorage = Arc<RwLock<HashMap<String, SyncCheckpoint>>>;

/// Thread-safe in-memory checkpoint store
#[derive(Debug, Clone, Default)]
pub struct InMemoryCheckpointStore {
    storage: CheckpointStorage,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of runs being tracked
    pub async fn run_count(&self) -> usize {
        self.storage.read().await.len()
    }

    /// Clear all checkpoints (useful for testing)
    pub async fn clear(&self) {
        self.storage.write().await.clear();
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn create(&self, run_id: &str) -> Result<SyncCheckpoint> {
        let mut storage = self.storage.write().await;
        if storage.contains_key(run_id) {
            return Err(CheckpointError::AlreadyExists(run_id.to_string()));
        }
        let checkpoint = SyncCheckpoint::new(run_id);
        storage.insert(run_id.to_string(), checkpoint.clone());
        Ok(checkpoint)
    }

    async fn save(&self, checkpoint: &SyncCheckpoint) -> Result<()> {
        self.storage
            .write()
            .await
            .insert(checkpoint.run_id.clone(), checkpoint.clone());
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<Option<SyncCheckpoint>> {
        Ok(self.storage.read().await.get(run_id).cloned())
    }

    async fn list_runs(&self) -> Result<Vec<RunSummary>> {
        let storage = self.storage.read().await;
        let mut runs: Vec<RunSummary> = storage.values().map(RunSummary::from).collect();
        runs.sort_by(|a, b| {
            b.started_at
                .cmp(&a.started_at)
                .then_with(|| b.run_id.cmp(&a.run_id))
        });
        Ok(runs)
    }

    async fn delete(&self, run_id: &str) -> Result<bool> {
        Ok(self.storage.write().await.remove(run_id).is_some())
    }
}
