//! Store driver implementations.
//!
//! Each driver implements the core store traits for one database:
//!
//! - [`postgres`]: JSONB document tables on PostgreSQL
//! - [`mongodb`]: MongoDB collections (feature `mongodb`)
//! - [`memory`]: in-process collections, optionally seeded from a file
//!
//! The `connect_*` functions turn configuration into the trait objects the
//! engine is handed. Nothing below the orchestrator opens connections.

pub mod memory;
#[cfg(feature = "mongodb")]
pub mod mongodb;
pub mod postgres;

pub use memory::MemoryDocumentStore;
#[cfg(feature = "mongodb")]
pub use self::mongodb::MongoDocumentStore;
pub use postgres::PgDocumentStore;

use std::sync::Arc;

use tracing::debug;

use crate::config::{CheckpointBackend, CheckpointConfig, StoreConfig, StoreType};
use crate::core::{RecordSink, RecordSource};
use crate::error::{Component, MigrateError, Result};
use crate::state::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore, PgCheckpointStore};

/// Open the configured source store.
pub async fn connect_source(config: &StoreConfig) -> Result<Arc<dyn RecordSource>> {
    debug!("Connecting source store ({:?})", config.r#type);
    match config.r#type {
        StoreType::Postgres => {
            let pool = postgres::connect_pool(&config.url, config.max_connections, Component::Source).await?;
            Ok(Arc::new(PgDocumentStore::new(pool, config.schema.clone())))
        }
        StoreType::Mongodb => connect_mongo(config, Component::Source)
            .await
            .map(|s| s as Arc<dyn RecordSource>),
        StoreType::Memory => Ok(Arc::new(memory_store(config)?)),
    }
}

/// Open the configured destination store.
pub async fn connect_sink(config: &StoreConfig) -> Result<Arc<dyn RecordSink>> {
    debug!("Connecting destination store ({:?})", config.r#type);
    match config.r#type {
        StoreType::Postgres => {
            let pool = postgres::connect_pool(&config.url, config.max_connections, Component::Sink).await?;
            Ok(Arc::new(PgDocumentStore::new(pool, config.schema.clone())))
        }
        StoreType::Mongodb => connect_mongo(config, Component::Sink)
            .await
            .map(|s| s as Arc<dyn RecordSink>),
        StoreType::Memory => Ok(Arc::new(memory_store(config)?)),
    }
}

/// Open the configured checkpoint store.
pub async fn connect_checkpoints(config: &CheckpointConfig) -> Result<Arc<dyn CheckpointStore>> {
    match config.r#type {
        CheckpointBackend::Postgres => {
            let store = PgCheckpointStore::connect(
                &config.url,
                &config.schema,
                &config.table,
                config.max_connections,
            )
            .await?;
            Ok(Arc::new(store))
        }
        CheckpointBackend::File => {
            let path = config.path.as_ref().ok_or_else(|| {
                MigrateError::Config("checkpoint.path is required for the file backend".into())
            })?;
            Ok(Arc::new(FileCheckpointStore::new(path)))
        }
        CheckpointBackend::Memory => Ok(Arc::new(MemoryCheckpointStore::new())),
    }
}

fn memory_store(config: &StoreConfig) -> Result<MemoryDocumentStore> {
    match &config.seed {
        Some(path) => MemoryDocumentStore::from_seed_file(path),
        None => Ok(MemoryDocumentStore::new()),
    }
}

#[cfg(feature = "mongodb")]
async fn connect_mongo(config: &StoreConfig, component: Component) -> Result<Arc<MongoDocumentStore>> {
    let database = config.database.as_deref().ok_or_else(|| {
        MigrateError::Config(format!("{} requires a database name", component))
    })?;
    Ok(Arc::new(
        MongoDocumentStore::connect(&config.url, database, component).await?,
    ))
}

#[cfg(not(feature = "mongodb"))]
async fn connect_mongo(_config: &StoreConfig, component: Component) -> Result<Arc<MemoryDocumentStore>> {
    Err(MigrateError::Config(format!(
        "{} type 'mongodb' requires building with the `mongodb` feature",
        component
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn memory_config() -> StoreConfig {
        StoreConfig {
            r#type: StoreType::Memory,
            url: String::new(),
            database: None,
            schema: "public".into(),
            seed: None,
            max_connections: 1,
        }
    }

    #[tokio::test]
    async fn test_connect_memory_stores() {
        let source = connect_source(&memory_config()).await.unwrap();
        assert_eq!(source.source_type(), "memory");
        let sink = connect_sink(&memory_config()).await.unwrap();
        assert_eq!(sink.sink_type(), "memory");
    }

    #[tokio::test]
    async fn test_connect_missing_seed_fails() {
        let mut config = memory_config();
        config.seed = Some(PathBuf::from("/nonexistent/seed.json"));
        assert!(connect_source(&config).await.is_err());
    }

    #[tokio::test]
    async fn test_connect_file_checkpoints() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = CheckpointConfig {
            r#type: CheckpointBackend::File,
            url: String::new(),
            schema: "docstore_migrate".into(),
            table: "checkpoints".into(),
            path: Some(dir.path().join("cp.json")),
            max_connections: 1,
        };
        let store = connect_checkpoints(&config).await.unwrap();
        assert_eq!(store.backend_type(), "file");
    }

    #[cfg(not(feature = "mongodb"))]
    #[tokio::test]
    async fn test_mongodb_without_feature_is_config_error() {
        let mut config = memory_config();
        config.r#type = StoreType::Mongodb;
        let err = connect_source(&config).await.err().unwrap();
        assert!(matches!(err, MigrateError::Config(_)));
    }
}
