//! Store contracts used by the transfer engine.
//!
//! - [`RecordSource`]: pages ordered documents out of a collection
//! - [`RecordSink`]: bulk-inserts a batch of documents into a collection
//!
//! The engine receives already-constructed handles (`Arc<dyn RecordSource>`,
//! `Arc<dyn RecordSink>`); it never opens or caches connections itself.

use async_trait::async_trait;

use crate::error::Result;

use super::value::{Boundary, Document, SortSpec};

/// Read ordered pages of documents from a source store.
///
/// # Contract
///
/// - With a boundary, only documents whose key is strictly below it are
///   eligible. With a tie breaker the comparison is on the composite
///   `(field, tie_breaker)` key.
/// - Results are ordered by key descending, so the last document of a page
///   carries the smallest key of the page.
/// - At most `limit` documents are returned; an empty page means the
///   eligible set is exhausted.
/// - Paging has no side effects and may be repeated after a failure.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn page(
        &self,
        collection: &str,
        boundary: Option<&Boundary>,
        sort: &SortSpec,
        limit: usize,
    ) -> Result<Vec<Document>>;

    /// Store type name for logging.
    fn source_type(&self) -> &'static str;
}

/// Result of a batch insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertOutcome {
    /// Number of documents durably written.
    pub inserted: usize,
    /// Whether documents were written in input order.
    pub ordered: bool,
}

impl InsertOutcome {
    /// All `count` documents written in order.
    pub fn complete(count: usize) -> Self {
        Self {
            inserted: count,
            ordered: true,
        }
    }

    /// Whether this outcome covers the whole submitted batch.
    pub fn covers(&self, submitted: usize) -> bool {
        self.ordered && self.inserted == submitted
    }
}

/// Write batches of documents to a destination store.
///
/// A sink that cannot tell which documents of a failed batch were written
/// must make batches all-or-nothing. Sinks that can tell report a partial
/// write as [`MigrateError::PartialWrite`](crate::error::MigrateError::PartialWrite).
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Make the destination collection ready for inserts. Idempotent.
    async fn prepare(&self, _collection: &str) -> Result<()> {
        Ok(())
    }

    async fn insert_batch(&self, collection: &str, documents: &[Document]) -> Result<InsertOutcome>;

    /// Store type name for logging.
    fn sink_type(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_outcome_covers() {
        assert!(InsertOutcome::complete(3).covers(3));
        assert!(!InsertOutcome::complete(2).covers(3));
        let unordered = InsertOutcome {
            inserted: 3,
            ordered: false,
        };
        assert!(!unordered.covers(3));
    }
}
