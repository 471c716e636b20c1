//! Error types for the transfer library.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// The store role an error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Source,
    Sink,
    Checkpoint,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Component::Source => "source store",
            Component::Sink => "destination store",
            Component::Checkpoint => "checkpoint store",
        };
        f.write_str(name)
    }
}

/// Main error type for transfer operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, bad collection spec)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A store was unreachable or timed out
    #[error("{component} unreachable: {message}")]
    Connectivity {
        component: Component,
        message: String,
    },

    /// The source store rejected a page query
    #[error("Source error for collection {collection}: {message}")]
    Source { collection: String, message: String },

    /// The destination store rejected a write
    #[error("Destination error for collection {collection}: {message}")]
    Sink { collection: String, message: String },

    /// The destination accepted only part of a batch
    #[error("Partial write to collection {collection}: {written} of {submitted} documents written")]
    PartialWrite {
        collection: String,
        submitted: usize,
        written: usize,
    },

    /// The batch was written but its checkpoint could not be persisted
    #[error("Checkpoint write failed for collection {collection} after its batch was written")]
    CheckpointWrite {
        collection: String,
        #[source]
        source: Box<MigrateError>,
    },

    /// Checkpoint store error other than connectivity
    #[error("Checkpoint store error: {0}")]
    Checkpoint(String),

    /// A document cannot provide a usable sort key
    #[error("Document error in collection {collection}: {message}")]
    Document { collection: String, message: String },

    /// Unexpected failure while driving a collection
    #[error("Transfer failed for collection {collection}: {message}")]
    Transfer { collection: String, message: String },

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Transfer was cancelled (SIGINT, etc.)
    #[error("Transfer cancelled")]
    Cancelled,
}

/// Flat classification of [`MigrateError`] for reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    Connectivity,
    Source,
    Sink,
    PartialWrite,
    CheckpointWrite,
    Checkpoint,
    Document,
    Internal,
    Io,
    Serialization,
    Cancelled,
}

impl MigrateError {
    /// Create a Connectivity error for the given store role
    pub fn connectivity(component: Component, message: impl Into<String>) -> Self {
        MigrateError::Connectivity {
            component,
            message: message.into(),
        }
    }

    /// Create a Source error
    pub fn source(collection: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Source {
            collection: collection.into(),
            message: message.into(),
        }
    }

    /// Create a Sink error
    pub fn sink(collection: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Sink {
            collection: collection.into(),
            message: message.into(),
        }
    }

    /// Create a Document error
    pub fn document(collection: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Document {
            collection: collection.into(),
            message: message.into(),
        }
    }

    /// Create a Transfer error
    pub fn transfer(collection: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Transfer {
            collection: collection.into(),
            message: message.into(),
        }
    }

    /// Wrap a failed checkpoint persist that followed a successful batch write
    pub fn checkpoint_write(collection: impl Into<String>, source: MigrateError) -> Self {
        MigrateError::CheckpointWrite {
            collection: collection.into(),
            source: Box::new(source),
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MigrateError::Config(_) => ErrorKind::Config,
            MigrateError::Connectivity { .. } => ErrorKind::Connectivity,
            MigrateError::Source { .. } => ErrorKind::Source,
            MigrateError::Sink { .. } => ErrorKind::Sink,
            MigrateError::PartialWrite { .. } => ErrorKind::PartialWrite,
            MigrateError::CheckpointWrite { .. } => ErrorKind::CheckpointWrite,
            MigrateError::Checkpoint(_) => ErrorKind::Checkpoint,
            MigrateError::Document { .. } => ErrorKind::Document,
            MigrateError::Transfer { .. } => ErrorKind::Internal,
            MigrateError::Io(_) => ErrorKind::Io,
            MigrateError::Yaml(_) | MigrateError::Json(_) => ErrorKind::Serialization,
            MigrateError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether re-running the process is expected to make progress.
    ///
    /// Re-running resumes from the last durable checkpoint, so any failure
    /// caused by the environment rather than by configuration or data is
    /// retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            MigrateError::Connectivity { .. }
            | MigrateError::PartialWrite { .. }
            | MigrateError::Cancelled => true,
            MigrateError::CheckpointWrite { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_) | MigrateError::Yaml(_) => 2,
            MigrateError::Cancelled => 130,
            _ => 1,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for transfer operations.
pub type Result<T> = std::result::Result<T, MigrateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_write_inherits_retryability() {
        let transient = MigrateError::checkpoint_write(
            "events",
            MigrateError::connectivity(Component::Checkpoint, "connection reset"),
        );
        assert!(transient.is_retryable());
        assert_eq!(transient.kind(), ErrorKind::CheckpointWrite);

        let permanent =
            MigrateError::checkpoint_write("events", MigrateError::Checkpoint("permission denied".into()));
        assert!(!permanent.is_retryable());
    }

    #[test]
    fn test_format_detailed_includes_cause() {
        let err = MigrateError::checkpoint_write(
            "events",
            MigrateError::connectivity(Component::Checkpoint, "timed out"),
        );
        let detailed = err.format_detailed();
        assert!(detailed.contains("Checkpoint write failed for collection events"));
        assert!(detailed.contains("Caused by:"));
        assert!(detailed.contains("checkpoint store unreachable: timed out"));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(MigrateError::Config("bad".into()).exit_code(), 2);
        assert_eq!(MigrateError::Cancelled.exit_code(), 130);
        assert_eq!(MigrateError::source("events", "boom").exit_code(), 1);
    }

    #[test]
    fn test_config_error_not_retryable() {
        assert!(!MigrateError::Config("missing sort_field".into()).is_retryable());
        assert!(MigrateError::connectivity(Component::Source, "refused").is_retryable());
    }
}
