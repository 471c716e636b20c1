//! Store wrappers that count calls and inject failures.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use docstore_migrate::core::{Boundary, Document, InsertOutcome, RecordSink, RecordSource, SortSpec};
use docstore_migrate::drivers::MemoryDocumentStore;
use docstore_migrate::error::{Component, MigrateError, Result};
use docstore_migrate::state::{Checkpoint, CheckpointStore, MemoryCheckpointStore};
use serde_json::{json, Value};

pub fn doc(value: Value) -> Document {
    value.as_object().cloned().expect("document must be an object")
}

pub fn named(names: &[&str]) -> Vec<Document> {
    names.iter().map(|n| doc(json!({ "name": n }))).collect()
}

pub fn names_of(docs: &[Document]) -> Vec<String> {
    docs.iter()
        .map(|d| d["name"].as_str().unwrap_or_default().to_string())
        .collect()
}

/// Source that records every page request.
pub struct RecordingSource {
    inner: MemoryDocumentStore,
    pub calls: Mutex<Vec<(String, Option<Boundary>)>>,
    pub pages: Mutex<Vec<Vec<Document>>>,
}

impl RecordingSource {
    pub fn new(inner: MemoryDocumentStore) -> Self {
        Self {
            inner,
            calls: Mutex::new(Vec::new()),
            pages: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn page_names(&self) -> Vec<Vec<String>> {
        self.pages.lock().unwrap().iter().map(|p| names_of(p)).collect()
    }
}

#[async_trait]
impl RecordSource for RecordingSource {
    async fn page(
        &self,
        collection: &str,
        boundary: Option<&Boundary>,
        sort: &SortSpec,
        limit: usize,
    ) -> Result<Vec<Document>> {
        self.calls
            .lock()
            .unwrap()
            .push((collection.to_string(), boundary.cloned()));
        let page = self.inner.page(collection, boundary, sort, limit).await?;
        self.pages.lock().unwrap().push(page.clone());
        Ok(page)
    }

    fn source_type(&self) -> &'static str {
        "recording"
    }
}

/// Source that ignores the boundary and always returns the same page.
pub struct StuckSource {
    pub page: Vec<Document>,
}

#[async_trait]
impl RecordSource for StuckSource {
    async fn page(
        &self,
        _collection: &str,
        _boundary: Option<&Boundary>,
        _sort: &SortSpec,
        _limit: usize,
    ) -> Result<Vec<Document>> {
        Ok(self.page.clone())
    }

    fn source_type(&self) -> &'static str {
        "stuck"
    }
}

/// How a [`FaultySink`] misbehaves for selected collections.
#[derive(Clone, Copy)]
pub enum SinkFault {
    /// Reject the write.
    Reject,
    /// Report that only the first document was written.
    Partial,
    /// Refuse to connect.
    Unreachable,
}

/// Sink over a memory store that fails for selected collections.
pub struct FaultySink {
    pub inner: Arc<MemoryDocumentStore>,
    failing: HashSet<String>,
    fault: SinkFault,
    pub inserts: AtomicUsize,
}

impl FaultySink {
    pub fn new(inner: Arc<MemoryDocumentStore>) -> Self {
        Self {
            inner,
            failing: HashSet::new(),
            fault: SinkFault::Reject,
            inserts: AtomicUsize::new(0),
        }
    }

    pub fn failing(mut self, collection: &str, fault: SinkFault) -> Self {
        self.failing.insert(collection.to_string());
        self.fault = fault;
        self
    }

    pub fn insert_count(&self) -> usize {
        self.inserts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordSink for FaultySink {
    async fn prepare(&self, collection: &str) -> Result<()> {
        self.inner.prepare(collection).await
    }

    async fn insert_batch(&self, collection: &str, documents: &[Document]) -> Result<InsertOutcome> {
        self.inserts.fetch_add(1, Ordering::SeqCst);
        if !self.failing.contains(collection) {
            return self.inner.insert_batch(collection, documents).await;
        }
        match self.fault {
            SinkFault::Reject => Err(MigrateError::sink(collection, "write rejected")),
            SinkFault::Partial => {
                self.inner.insert_batch(collection, &documents[..1]).await?;
                Ok(InsertOutcome {
                    inserted: 1,
                    ordered: true,
                })
            }
            SinkFault::Unreachable => Err(MigrateError::connectivity(Component::Sink, "connection refused")),
        }
    }

    fn sink_type(&self) -> &'static str {
        "faulty"
    }
}

/// Checkpoint store whose writes fail after a number of successes.
pub struct FlakyCheckpoints {
    pub inner: Arc<MemoryCheckpointStore>,
    succeed_writes: usize,
    writes: AtomicUsize,
    pub ensure_calls: AtomicUsize,
}

impl FlakyCheckpoints {
    pub fn new(inner: Arc<MemoryCheckpointStore>, succeed_writes: usize) -> Self {
        Self {
            inner,
            succeed_writes,
            writes: AtomicUsize::new(0),
            ensure_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl CheckpointStore for FlakyCheckpoints {
    async fn ensure_ready(&self) -> Result<()> {
        self.ensure_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.ensure_ready().await
    }

    async fn get_checkpoint(&self, collection_id: &str) -> Result<Option<Checkpoint>> {
        self.inner.get_checkpoint(collection_id).await
    }

    async fn set_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let n = self.writes.fetch_add(1, Ordering::SeqCst);
        if n >= self.succeed_writes {
            return Err(MigrateError::connectivity(Component::Checkpoint, "timed out"));
        }
        self.inner.set_checkpoint(checkpoint).await
    }

    async fn list_checkpoints(&self) -> Result<Vec<Checkpoint>> {
        self.inner.list_checkpoints().await
    }

    async fn delete_checkpoint(&self, collection_id: &str) -> Result<bool> {
        self.inner.delete_checkpoint(collection_id).await
    }

    fn backend_type(&self) -> &'static str {
        "flaky"
    }
}
