//! # docstore-migrate
//!
//! Checkpointed, resumable batch transfer of document collections.
//!
//! Collections are copied from a source store to a destination store in
//! bounded pages, newest sort key first. After every batch the sort key of
//! its last document is persisted as a checkpoint, so an interrupted run
//! continues where it stopped instead of starting over:
//!
//! - **Stores** for PostgreSQL (JSONB), MongoDB (default feature `mongodb`) and memory
//! - **Checkpoints** in PostgreSQL, a JSON file, or memory
//! - **Failure isolation**: one failed collection never stops the others
//! - **At-least-once** delivery across crashes between write and checkpoint
//!
//! ## Example
//!
//! ```rust,no_run
//! use docstore_migrate::{Config, Orchestrator};
//!
//! #[tokio::main]
//! async fn main() -> docstore_migrate::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let orchestrator = Orchestrator::connect(config).await?;
//!     let report = orchestrator.run().await?;
//!     println!("Transferred {} documents", report.documents_transferred);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod drivers;
pub mod error;
pub mod orchestrator;
pub mod state;
pub mod transfer;

// Re-exports for convenient access
pub use config::{
    CheckpointConfig, CollectionSpec, Config, InitialValue, StoreConfig, TransferSettings,
};
pub use self::core::{Boundary, Document, InsertOutcome, RecordSink, RecordSource, SortSpec, SortValue};
pub use error::{MigrateError, Result};
pub use orchestrator::{CollectionCheckpoint, Orchestrator, RunStatus, TransferReport};
pub use state::{Checkpoint, CheckpointStore};
pub use transfer::{CollectionOutcome, CollectionStatus, Phase, TransferConfig, TransferEngine, TransferStats};
