//! File-backed checkpoint storage
//!
//! One pretty-printed JSON document per run at `<dir>/<run_id>.json`. Every
//! save writes a uniquely named temp file in the same directory, fsyncs it,
//! and renames it over the previous record, so a crash mid-write leaves
//! either the old or the new record on disk, never a torn one.

use crate::{
    checkpoint::{RunSummary, SyncCheckpoint},
    error::{CheckpointError, Result},
    traits::CheckpointStore,
};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

const EXTENSION: &str = "json";

/// Checkpoint store that keeps one JSON file per run in a directory.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    /// Store rooted at `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store rooted at `dir`, creating the directory now.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let store = Self::new(dir);
        fs::create_dir_all(&store.dir).await?;
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the record for `run_id`.
    pub fn path_for(&self, run_id: &str) -> Result<PathBuf> {
        validate_run_id(run_id)?;
        Ok(self.dir.join(format!("{}.{}", run_id, EXTENSION)))
    }

    async fn read_record(path: &Path) -> Result<Option<SyncCheckpoint>> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_atomically(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;

        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| CheckpointError::Invalid(format!("bad path: {}", path.display())))?;
        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4().simple()));

        let mut file = fs::File::create(&tmp).await?;
        let written = async {
            file.write_all(bytes).await?;
            file.sync_all().await
        }
        .await;
        drop(file);

        if let Err(e) = written {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        if let Err(e) = fs::rename(&tmp, path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }
}

/// Run ids become file names, so only a conservative character set is allowed.
fn validate_run_id(run_id: &str) -> Result<()> {
    let valid = !run_id.is_empty()
        && !run_id.starts_with('.')
        && run_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(CheckpointError::Invalid(format!(
            "run id '{}' may only contain ASCII letters, digits, '-', '_' and '.'",
            run_id
        )))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn create(&self, run_id: &str) -> Result<SyncCheckpoint> {
        let path = self.path_for(run_id)?;
        if fs::try_exists(&path).await? {
            return Err(CheckpointError::AlreadyExists(run_id.to_string()));
        }
        let checkpoint = SyncCheckpoint::new(run_id);
        self.save(&checkpoint).await?;
        Ok(checkpoint)
    }

    async fn save(&self, checkpoint: &SyncCheckpoint) -> Result<()> {
        let path = self.path_for(&checkpoint.run_id)?;
        let bytes = serde_json::to_vec_pretty(checkpoint)?;
        self.write_atomically(&path, &bytes).await?;
        debug!(run_id = %checkpoint.run_id, path = %path.display(), "Checkpoint saved");
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<Option<SyncCheckpoint>> {
        let path = self.path_for(run_id)?;
        Self::read_record(&path).await
    }

    async fn list_runs(&self) -> Result<Vec<RunSummary>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut runs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_record = path.extension().and_then(|e| e.to_str()) == Some(EXTENSION)
                && !entry.file_name().to_string_lossy().starts_with('.');
            if !is_record {
                continue;
            }
            match Self::read_record(&path).await {
                Ok(Some(checkpoint)) => runs.push(RunSummary::from(&checkpoint)),
                Ok(None) => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable checkpoint");
                }
            }
        }

        runs.sort_by(|a, b| {
            b.started_at
                .cmp(&a.started_at)
                .then_with(|| b.run_id.cmp(&a.run_id))
        });
        Ok(runs)
    }

    async fn delete(&self, run_id: &str) -> Result<bool> {
        let path = self.path_for(run_id)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{ExtractionResult, RunStatus};
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_save_and_reload_across_instances() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        store.create("run-1").await.unwrap();
        store
            .record_wave_completion(
                "run-1",
                0,
                vec![ExtractionResult::succeeded(
                    "orders",
                    50,
                    Some(50),
                    "out/orders.jsonl",
                    Duration::from_millis(3),
                    1,
                )],
            )
            .await
            .unwrap();

        let reopened = FileCheckpointStore::new(dir.path());
        let cp = reopened.require("run-1").await.unwrap();
        assert_eq!(cp.results["orders"].sampled_row_count, 50);
        assert_eq!(cp.completed_wave_index, Some(0));
    }

    #[tokio::test]
    async fn test_no_temp_files_left_behind() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        store.create("run-1").await.unwrap();
        store.mark_terminal("run-1", RunStatus::Completed).await.unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["run-1.json".to_string()]);
    }

    #[tokio::test]
    async fn test_rejects_path_like_run_ids() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path());

        for bad in ["", "../escape", "a/b", ".hidden"] {
            assert!(
                matches!(store.create(bad).await, Err(CheckpointError::Invalid(_))),
                "run id {:?} should be rejected",
                bad
            );
        }
    }

    #[tokio::test]
    async fn test_list_runs_ignores_foreign_files() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        store.create("run-a").await.unwrap();
        store.create("run-b").await.unwrap();
        std::fs::write(dir.path().join("notes.txt"), "hello").unwrap();
        std::fs::write(dir.path().join("broken.json"), "{not json").unwrap();

        let runs = store.list_runs().await.unwrap();
        let mut ids: Vec<_> = runs.into_iter().map(|r| r.run_id).collect();
        ids.sort();
        assert_eq!(ids, vec!["run-a", "run-b"]);
    }

    #[tokio::test]
    async fn test_list_runs_on_missing_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("not-yet"));
        assert!(store.list_runs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::open(dir.path()).await.unwrap();
        store.create("run-1").await.unwrap();

        assert!(store.delete("run-1").await.unwrap());
        assert!(!store.delete("run-1").await.unwrap());
        assert!(store.load("run-1").await.unwrap().is_none());
    }
}
