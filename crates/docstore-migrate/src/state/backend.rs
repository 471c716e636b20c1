//! Checkpoint store trait.
//!
//! The engine works with `Arc<dyn CheckpointStore>` without knowing the
//! concrete backend.

use async_trait::async_trait;

use super::Checkpoint;
use crate::error::Result;

/// Key/value persistence of per-collection checkpoints.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync` to allow sharing across async tasks.
///
/// # Example
///
/// ```rust,ignore
/// let store: Arc<dyn CheckpointStore> = Arc::new(PgCheckpointStore::new(pool, "docstore_migrate", "checkpoints"));
/// store.ensure_ready().await?;
/// if let Some(cp) = store.get_checkpoint("events").await? {
///     println!("resuming at {:?}", cp.last_value);
/// }
/// ```
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Create the backing table or file if it does not exist.
    ///
    /// Idempotent: "already exists" is success and existing checkpoints are
    /// left untouched.
    async fn ensure_ready(&self) -> Result<()>;

    /// Load the checkpoint for a collection.
    ///
    /// A collection that was never checkpointed yields `Ok(None)`.
    async fn get_checkpoint(&self, collection_id: &str) -> Result<Option<Checkpoint>>;

    /// Create or overwrite the checkpoint for `checkpoint.collection_id`.
    async fn set_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// All stored checkpoints, ordered by collection name.
    async fn list_checkpoints(&self) -> Result<Vec<Checkpoint>>;

    /// Remove a checkpoint. Returns whether one existed.
    ///
    /// Operator cleanup only; the transfer engine never deletes checkpoints.
    async fn delete_checkpoint(&self, collection_id: &str) -> Result<bool>;

    /// Get the backend type name for logging/debugging.
    fn backend_type(&self) -> &'static str;
}
