//! Core abstractions for store-agnostic collection transfer.
//!
//! - [`value`]: documents, sort values and resume boundaries
//! - [`traits`]: the source and sink contracts implemented by drivers

pub mod traits;
pub mod value;

pub use traits::{InsertOutcome, RecordSink, RecordSource};
pub use value::{lookup, Boundary, Document, SortSpec, SortValue};
