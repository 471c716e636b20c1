//! Configuration type definitions.

use std::fmt;
use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{SortSpec, SortValue};
use crate::error::{MigrateError, Result};

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Store documents are read from.
    pub source: StoreConfig,

    /// Store documents are written to.
    pub destination: StoreConfig,

    /// Where per-collection checkpoints are persisted.
    pub checkpoint: CheckpointConfig,

    /// Transfer behavior.
    #[serde(default)]
    pub transfer: TransferSettings,

    /// Collections to transfer, in processing order.
    pub collections: Vec<CollectionSpec>,
}

/// Document store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreType {
    /// PostgreSQL, one JSONB table per collection.
    Postgres,
    /// MongoDB (requires the `mongodb` cargo feature).
    Mongodb,
    /// In-process store, optionally seeded from a JSON file.
    Memory,
}

/// Source or destination store configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend type.
    pub r#type: StoreType,

    /// Connection URL (postgres://... or mongodb://...).
    #[serde(default)]
    pub url: String,

    /// Database name (MongoDB).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,

    /// Schema holding collection tables (PostgreSQL, default: "public").
    #[serde(default = "default_public_schema")]
    pub schema: String,

    /// JSON file of `{ "collection": [documents...] }` (memory store).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<PathBuf>,

    /// Maximum pooled connections (default: 4).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Checkpoint store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointBackend {
    /// PostgreSQL table keyed by collection name.
    Postgres,
    /// Local JSON file.
    File,
    /// In-process map (lost on exit).
    Memory,
}

/// Checkpoint store configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Backend type.
    pub r#type: CheckpointBackend,

    /// Connection URL (PostgreSQL).
    #[serde(default)]
    pub url: String,

    /// Schema for the checkpoint table (default: "docstore_migrate").
    #[serde(default = "default_checkpoint_schema")]
    pub schema: String,

    /// Checkpoint table name (default: "checkpoints").
    #[serde(default = "default_checkpoint_table")]
    pub table: String,

    /// Checkpoint file path (file backend).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// Maximum pooled connections (default: 4).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Transfer behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    /// Documents per batch (default: 250).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Collections transferred at the same time (default: 1).
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
        }
    }
}

/// One collection to transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSpec {
    /// Collection name, also the checkpoint key.
    #[serde(default)]
    pub name: String,

    /// Field used to order pages and detect progress.
    #[serde(default)]
    pub sort_field: String,

    /// Starting boundary when no checkpoint exists. Absent means every
    /// document is eligible.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_value: Option<InitialValue>,

    /// Secondary field making the sort key unique.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tie_breaker: Option<String>,

    /// Per-collection batch size override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,

    /// Destination collection name (defaults to `name`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
}

impl CollectionSpec {
    pub fn new(name: impl Into<String>, sort_field: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sort_field: sort_field.into(),
            initial_value: None,
            tie_breaker: None,
            batch_size: None,
            destination: None,
        }
    }

    pub fn with_initial_value(mut self, value: impl Into<SortValue>) -> Self {
        self.initial_value = Some(InitialValue::Value(value.into()));
        self
    }

    pub fn with_tie_breaker(mut self, field: impl Into<String>) -> Self {
        self.tie_breaker = Some(field.into());
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// Name of the collection written to.
    pub fn destination_name(&self) -> &str {
        self.destination.as_deref().unwrap_or(&self.name)
    }

    /// Sort fields for paging.
    pub fn sort_spec(&self) -> SortSpec {
        SortSpec {
            field: self.sort_field.clone(),
            tie_breaker: self.tie_breaker.clone(),
        }
    }

    /// Validate this collection on its own.
    ///
    /// Runs before any store I/O for the collection, so a bad entry fails
    /// only itself.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(MigrateError::Config("collection name is required".into()));
        }
        if self.sort_field.trim().is_empty() {
            return Err(MigrateError::Config(format!(
                "collections[{}].sort_field is required",
                self.name
            )));
        }
        if let Some(tb) = &self.tie_breaker {
            if tb.trim().is_empty() {
                return Err(MigrateError::Config(format!(
                    "collections[{}].tie_breaker must not be empty",
                    self.name
                )));
            }
            if tb == &self.sort_field {
                return Err(MigrateError::Config(format!(
                    "collections[{}].tie_breaker must differ from sort_field",
                    self.name
                )));
            }
        }
        if let Some(0) = self.batch_size {
            return Err(MigrateError::Config(format!(
                "collections[{}].batch_size must be at least 1",
                self.name
            )));
        }
        if let Some(dest) = &self.destination {
            if dest.trim().is_empty() {
                return Err(MigrateError::Config(format!(
                    "collections[{}].destination must not be empty",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// Starting boundary as written in configuration.
///
/// `{ "$date": "now" }` stays unresolved until a collection starts, so the
/// configuration (and its hash) is the same on every run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum InitialValue {
    /// The time the collection starts.
    Now,
    Value(SortValue),
}

impl InitialValue {
    /// The boundary value for a run starting now.
    pub fn resolve(&self) -> SortValue {
        match self {
            InitialValue::Now => SortValue::Date(Utc::now()),
            InitialValue::Value(value) => value.clone(),
        }
    }
}

impl From<SortValue> for InitialValue {
    fn from(value: SortValue) -> Self {
        InitialValue::Value(value)
    }
}

impl TryFrom<Value> for InitialValue {
    type Error = String;

    fn try_from(raw: Value) -> std::result::Result<Self, Self::Error> {
        if let Value::Object(map) = &raw {
            if map.len() == 1 {
                if let Some(Value::String(s)) = map.get("$date") {
                    if s.eq_ignore_ascii_case("now") {
                        return Ok(InitialValue::Now);
                    }
                }
            }
        }
        serde_json::from_value::<SortValue>(raw)
            .map(InitialValue::Value)
            .map_err(|e| format!("invalid initial_value: {}", e))
    }
}

impl From<InitialValue> for Value {
    fn from(value: InitialValue) -> Self {
        match value {
            InitialValue::Now => serde_json::json!({ "$date": "now" }),
            InitialValue::Value(v) => v.to_json(),
        }
    }
}

/// Hide the password part of a connection URL.
pub fn redact_url(url: &str) -> String {
    let Some(scheme_end) = url.find("://") else {
        return url.to_string();
    };
    let rest = &url[scheme_end + 3..];
    let authority_end = rest.find('/').unwrap_or(rest.len());
    match rest[..authority_end].rfind('@') {
        Some(at) => {
            let userinfo = &rest[..at];
            let user = userinfo.split(':').next().unwrap_or("");
            format!(
                "{}{}:[REDACTED]@{}",
                &url[..scheme_end + 3],
                user,
                &rest[at + 1..]
            )
        }
        None => url.to_string(),
    }
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("type", &self.r#type)
            .field("url", &redact_url(&self.url))
            .field("database", &self.database)
            .field("schema", &self.schema)
            .field("seed", &self.seed)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

impl fmt::Debug for CheckpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckpointConfig")
            .field("type", &self.r#type)
            .field("url", &redact_url(&self.url))
            .field("schema", &self.schema)
            .field("table", &self.table)
            .field("path", &self.path)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

fn default_public_schema() -> String {
    "public".to_string()
}

fn default_checkpoint_schema() -> String {
    "docstore_migrate".to_string()
}

fn default_checkpoint_table() -> String {
    "checkpoints".to_string()
}

fn default_max_connections() -> usize {
    4
}

fn default_batch_size() -> usize {
    250
}

fn default_concurrency() -> usize {
    1
}
