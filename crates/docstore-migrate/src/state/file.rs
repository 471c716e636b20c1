//! File-based checkpoint store.
//!
//! All checkpoints live in one JSON document:
//!
//! ```json
//! { "version": 1, "checkpoints": { "events": { "collection_id": "events", ... } } }
//! ```
//!
//! Every write replaces the whole file atomically (temp file, then rename),
//! so a crash leaves either the old or the new contents on disk.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{MigrateError, Result};
use crate::state::backend::CheckpointStore;
use crate::state::Checkpoint;

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointFile {
    version: u32,
    #[serde(default)]
    checkpoints: BTreeMap<String, Checkpoint>,
}

impl Default for CheckpointFile {
    fn default() -> Self {
        Self {
            version: FORMAT_VERSION,
            checkpoints: BTreeMap::new(),
        }
    }
}

/// Checkpoint store persisted to a local JSON file.
pub struct FileCheckpointStore {
    path: PathBuf,
    /// Serializes read-modify-write cycles within this process.
    lock: Mutex<()>,
}

impl FileCheckpointStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_file(&self) -> Result<CheckpointFile> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(CheckpointFile::default())
            }
            Err(e) => return Err(e.into()),
        };
        let file: CheckpointFile = serde_json::from_str(&content).map_err(|e| {
            MigrateError::Checkpoint(format!(
                "checkpoint file {} is not valid: {}",
                self.path.display(),
                e
            ))
        })?;
        if file.version != FORMAT_VERSION {
            return Err(MigrateError::Checkpoint(format!(
                "checkpoint file {} has unsupported version {}",
                self.path.display(),
                file.version
            )));
        }
        Ok(file)
    }

    async fn write_file(&self, file: &CheckpointFile) -> Result<()> {
        let content = serde_json::to_string_pretty(file)?;
        let temp_path = self.path.with_extension("tmp");

        // Contents must be on disk before the rename makes them visible
        let mut temp = tokio::fs::File::create(&temp_path).await?;
        temp.write_all(content.as_bytes()).await?;
        temp.sync_all().await?;
        drop(temp);

        tokio::fs::rename(&temp_path, &self.path).await?;
        sync_parent_dir(&self.path).await
    }
}

/// Persist the directory entry created by a rename.
#[cfg(unix)]
async fn sync_parent_dir(path: &Path) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    tokio::fs::File::open(parent).await?.sync_all().await?;
    Ok(())
}

#[cfg(not(unix))]
async fn sync_parent_dir(_path: &Path) -> Result<()> {
    Ok(())
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn ensure_ready(&self) -> Result<()> {
        let _guard = self.lock.lock().await;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        if tokio::fs::try_exists(&self.path).await? {
            // Parse to surface corruption before any collection starts
            let file = self.read_file().await?;
            debug!(
                "Using checkpoint file {} ({} checkpoints)",
                self.path.display(),
                file.checkpoints.len()
            );
        } else {
            self.write_file(&CheckpointFile::default()).await?;
            debug!("Created checkpoint file {}", self.path.display());
        }
        Ok(())
    }

    async fn get_checkpoint(&self, collection_id: &str) -> Result<Option<Checkpoint>> {
        let _guard = self.lock.lock().await;
        let mut file = self.read_file().await?;
        Ok(file.checkpoints.remove(collection_id))
    }

    async fn set_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut file = self.read_file().await?;
        file.checkpoints
            .insert(checkpoint.collection_id.clone(), checkpoint.clone());
        self.write_file(&file).await
    }

    async fn list_checkpoints(&self) -> Result<Vec<Checkpoint>> {
        let _guard = self.lock.lock().await;
        Ok(self.read_file().await?.checkpoints.into_values().collect())
    }

    async fn delete_checkpoint(&self, collection_id: &str) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let mut file = self.read_file().await?;
        let existed = file.checkpoints.remove(collection_id).is_some();
        if existed {
            self.write_file(&file).await?;
        }
        Ok(existed)
    }

    fn backend_type(&self) -> &'static str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Boundary, SortValue};
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> FileCheckpointStore {
        FileCheckpointStore::new(dir.path().join("state").join("checkpoints.json"))
    }

    #[tokio::test]
    async fn test_ensure_ready_creates_file() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.ensure_ready().await.unwrap();
        assert!(store.path().exists());
        assert!(store.list_checkpoints().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ensure_ready_twice_preserves_checkpoints() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.ensure_ready().await.unwrap();
        store
            .set_checkpoint(&Checkpoint::new("events", "name", &Boundary::new("Dana".into()), 2))
            .await
            .unwrap();

        store.ensure_ready().await.unwrap();
        store.ensure_ready().await.unwrap();

        let cp = store.get_checkpoint("events").await.unwrap().unwrap();
        assert_eq!(cp.last_value, Some(SortValue::Text("Dana".into())));
    }

    #[tokio::test]
    async fn test_missing_file_reads_as_empty() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        assert!(store.get_checkpoint("events").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_round_trip_date_and_tiebreak() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.ensure_ready().await.unwrap();

        let created = Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap();
        let boundary = Boundary::with_tiebreak(
            SortValue::Date(created),
            SortValue::ObjectId("65a1b2c3d4e5f60718293a4b".into()),
        );
        store
            .set_checkpoint(&Checkpoint::new("logs", "created", &boundary, 250))
            .await
            .unwrap();

        // A fresh handle sees what the first one wrote
        let reopened = store_in(&dir);
        let cp = reopened.get_checkpoint("logs").await.unwrap().unwrap();
        assert_eq!(cp.boundary(), Some(boundary));
        assert_eq!(cp.documents_transferred, 250);
    }

    #[tokio::test]
    async fn test_delete_checkpoint() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.ensure_ready().await.unwrap();
        store
            .set_checkpoint(&Checkpoint::new("events", "name", &Boundary::new("Eve".into()), 1))
            .await
            .unwrap();

        assert!(store.delete_checkpoint("events").await.unwrap());
        assert!(!store.delete_checkpoint("events").await.unwrap());
        assert!(store.get_checkpoint("events").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_replaces_file_without_leftover_temp() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.ensure_ready().await.unwrap();
        for (value, count) in [("Dana", 2), ("Bob", 4)] {
            store
                .set_checkpoint(&Checkpoint::new("events", "name", &Boundary::new(value.into()), count))
                .await
                .unwrap();
        }

        assert!(!store.path().with_extension("tmp").exists());
        let on_disk: CheckpointFile =
            serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap();
        let cp = &on_disk.checkpoints["events"];
        assert_eq!(cp.last_value, Some(SortValue::Text("Bob".into())));
        assert_eq!(cp.documents_transferred, 4);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_reported() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        std::fs::write(store.path(), "not json").unwrap();
        let err = store.ensure_ready().await.unwrap_err();
        assert!(err.to_string().contains("not valid"));
    }
}
