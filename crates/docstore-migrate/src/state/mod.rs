//! Checkpoint persistence for resume capability.
//!
//! A [`Checkpoint`] records the sort key of the last document written for a
//! collection. It is created by the first successful batch, overwritten after
//! every later batch, and never deleted by the engine.
//!
//! Backends implement [`CheckpointStore`]:
//!
//! - [`PgCheckpointStore`]: PostgreSQL table keyed by collection name
//! - [`FileCheckpointStore`]: local JSON file with atomic replace
//! - [`MemoryCheckpointStore`]: in-process map for dry runs and tests

pub mod backend;
pub mod db;
pub mod file;
pub mod memory;

pub use backend::CheckpointStore;
pub use db::PgCheckpointStore;
pub use file::FileCheckpointStore;
pub use memory::MemoryCheckpointStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{Boundary, SortValue};

/// Persisted resume point for one collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Collection name (unique key).
    pub collection_id: String,

    /// Sort field the checkpoint was recorded for.
    pub sort_field: String,

    /// Sort-field value of the last transferred document.
    pub last_value: Option<SortValue>,

    /// Tie-breaker value of the last transferred document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_tiebreak: Option<SortValue>,

    /// Documents transferred for this collection across all runs.
    #[serde(default)]
    pub documents_transferred: u64,

    /// When the checkpoint was last written.
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Create a checkpoint at `boundary`.
    pub fn new(
        collection_id: impl Into<String>,
        sort_field: impl Into<String>,
        boundary: &Boundary,
        documents_transferred: u64,
    ) -> Self {
        Self {
            collection_id: collection_id.into(),
            sort_field: sort_field.into(),
            last_value: Some(boundary.value.clone()),
            last_tiebreak: boundary.tiebreak.clone(),
            documents_transferred,
            updated_at: Utc::now(),
        }
    }

    /// Resume boundary, or `None` if nothing has been recorded yet.
    pub fn boundary(&self) -> Option<Boundary> {
        self.last_value.clone().map(|value| Boundary {
            value,
            tiebreak: self.last_tiebreak.clone(),
        })
    }
}
