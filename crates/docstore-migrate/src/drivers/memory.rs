//! In-process document store.
//!
//! Serves as both source and destination. Collections can be seeded from a
//! JSON file shaped as `{ "<collection>": [ {..}, {..} ] }`, which makes the
//! store usable for local trial runs without a database.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::{Boundary, Document, InsertOutcome, RecordSink, RecordSource, SortSpec};
use crate::error::{MigrateError, Result};

/// Collections of documents held in memory.
#[derive(Default)]
pub struct MemoryDocumentStore {
    collections: RwLock<HashMap<String, Vec<Document>>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a collection.
    pub fn with_collection(self, name: impl Into<String>, documents: Vec<Document>) -> Self {
        self.collections
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.into(), documents);
        self
    }

    /// Load collections from a JSON seed file.
    pub fn from_seed_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let value: Value = serde_json::from_str(&content)?;
        let Value::Object(map) = value else {
            return Err(MigrateError::Config(format!(
                "seed file {} must contain an object of collections",
                path.display()
            )));
        };

        let mut collections = HashMap::new();
        for (name, docs) in map {
            let Value::Array(items) = docs else {
                return Err(MigrateError::Config(format!(
                    "seed collection '{}' must be an array of documents",
                    name
                )));
            };
            let documents = items
                .into_iter()
                .map(|item| match item {
                    Value::Object(doc) => Ok(doc),
                    other => Err(MigrateError::Config(format!(
                        "seed collection '{}' contains a non-object: {}",
                        name, other
                    ))),
                })
                .collect::<Result<Vec<_>>>()?;
            collections.insert(name, documents);
        }

        Ok(Self {
            collections: RwLock::new(collections),
        })
    }

    /// Snapshot of a collection's documents in insertion order.
    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.collections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of documents in a collection.
    pub fn len(&self, collection: &str) -> usize {
        self.collections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(collection)
            .map_or(0, Vec::len)
    }

    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }
}

#[async_trait]
impl RecordSource for MemoryDocumentStore {
    async fn page(
        &self,
        collection: &str,
        boundary: Option<&Boundary>,
        sort: &SortSpec,
        limit: usize,
    ) -> Result<Vec<Document>> {
        let guard = self.collections.read().unwrap_or_else(|e| e.into_inner());
        let Some(docs) = guard.get(collection) else {
            return Ok(Vec::new());
        };

        // Documents without a usable key sort last, like a descending index
        // puts missing fields after every value. They never pass a boundary.
        let mut keyed: Vec<(Option<Boundary>, &Document)> = docs
            .iter()
            .map(|doc| (Boundary::from_document(doc, sort).ok(), doc))
            .filter(|(key, _)| match (boundary, key) {
                (None, _) => true,
                (Some(bound), Some(key)) => bound.admits(key),
                (Some(_), None) => false,
            })
            .collect();

        keyed.sort_by(|(a, _), (b, _)| match (a, b) {
            (Some(a), Some(b)) => b.cmp(a),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        });
        keyed.truncate(limit);

        Ok(keyed.into_iter().map(|(_, doc)| doc.clone()).collect())
    }

    fn source_type(&self) -> &'static str {
        "memory"
    }
}

#[async_trait]
impl RecordSink for MemoryDocumentStore {
    async fn prepare(&self, collection: &str) -> Result<()> {
        self.collections
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(collection.to_string())
            .or_default();
        Ok(())
    }

    async fn insert_batch(&self, collection: &str, documents: &[Document]) -> Result<InsertOutcome> {
        self.collections
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(collection.to_string())
            .or_default()
            .extend_from_slice(documents);
        Ok(InsertOutcome::complete(documents.len()))
    }

    fn sink_type(&self) -> &'static str {
        "memory"
    }
}
