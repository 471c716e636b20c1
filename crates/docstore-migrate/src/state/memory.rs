//! In-process checkpoint store.
//!
//! Checkpoints live only as long as the process. Used for dry runs, the
//! `memory` checkpoint backend and tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::state::backend::CheckpointStore;
use crate::state::Checkpoint;

/// Checkpoint store backed by a map.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    checkpoints: RwLock<BTreeMap<String, Checkpoint>>,
    writes: AtomicUsize,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with checkpoints.
    pub fn with_checkpoints(checkpoints: impl IntoIterator<Item = Checkpoint>) -> Self {
        let map = checkpoints
            .into_iter()
            .map(|cp| (cp.collection_id.clone(), cp))
            .collect();
        Self {
            checkpoints: RwLock::new(map),
            writes: AtomicUsize::new(0),
        }
    }

    /// Number of `set_checkpoint` calls served.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn ensure_ready(&self) -> Result<()> {
        Ok(())
    }

    async fn get_checkpoint(&self, collection_id: &str) -> Result<Option<Checkpoint>> {
        Ok(self.checkpoints.read().await.get(collection_id).cloned())
    }

    async fn set_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.checkpoints
            .write()
            .await
            .insert(checkpoint.collection_id.clone(), checkpoint.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list_checkpoints(&self) -> Result<Vec<Checkpoint>> {
        Ok(self.checkpoints.read().await.values().cloned().collect())
    }

    async fn delete_checkpoint(&self, collection_id: &str) -> Result<bool> {
        Ok(self.checkpoints.write().await.remove(collection_id).is_some())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}
