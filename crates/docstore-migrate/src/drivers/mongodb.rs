//! MongoDB driver (enabled by the `mongodb` feature).
//!
//! Documents cross the engine boundary as canonical extended JSON, so
//! ObjectIds, dates and 64-bit integers survive the trip unchanged.

use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::{doc, Bson, Document as BsonDocument};
use mongodb::error::{Error as MongoError, ErrorKind as MongoErrorKind};
use mongodb::{Client, Collection, Database};
use serde_json::Value;
use tracing::{debug, info};

use crate::config::redact_url;
use crate::core::{Boundary, Document, InsertOutcome, RecordSink, RecordSource, SortSpec, SortValue};
use crate::error::{Component, MigrateError, Result};

/// Source and sink over one MongoDB database.
pub struct MongoDocumentStore {
    database: Database,
}

impl MongoDocumentStore {
    /// Connect and verify the server answers a ping.
    pub async fn connect(url: &str, database: &str, component: Component) -> Result<Self> {
        let client = Client::with_uri_str(url).await.map_err(|e| {
            MigrateError::Config(format!(
                "invalid MongoDB url for {} '{}': {}",
                component,
                redact_url(url),
                e
            ))
        })?;
        let database = client.database(database);
        database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| MigrateError::connectivity(component, e.to_string()))?;

        info!("Connected to MongoDB {}: {}", component, redact_url(url));
        Ok(Self { database })
    }

    fn collection(&self, name: &str) -> Collection<BsonDocument> {
        self.database.collection(name)
    }
}

fn is_connectivity(e: &MongoError) -> bool {
    matches!(
        *e.kind,
        MongoErrorKind::Io(_)
            | MongoErrorKind::ServerSelection { .. }
            | MongoErrorKind::ConnectionPoolCleared { .. }
    )
}

fn map_error(component: Component, collection: &str, e: MongoError) -> MigrateError {
    if is_connectivity(&e) {
        return MigrateError::connectivity(component, e.to_string());
    }
    match component {
        Component::Sink => MigrateError::sink(collection, e.to_string()),
        _ => MigrateError::source(collection, e.to_string()),
    }
}

fn to_bson(collection: &str, value: &SortValue) -> Result<Bson> {
    Bson::try_from(value.to_json()).map_err(|e| {
        MigrateError::document(collection, format!("cannot encode sort value {}: {}", value, e))
    })
}

/// Filter selecting documents strictly below `boundary`.
fn boundary_filter(collection: &str, boundary: &Boundary, sort: &SortSpec) -> Result<BsonDocument> {
    let value = to_bson(collection, &boundary.value)?;
    match (&sort.tie_breaker, &boundary.tiebreak) {
        (Some(tb_field), Some(tb_value)) => {
            let tb_value = to_bson(collection, tb_value)?;
            Ok(doc! {
                "$or": [
                    { sort.field.as_str(): { "$lt": value.clone() } },
                    { sort.field.as_str(): value, tb_field.as_str(): { "$lt": tb_value } },
                ]
            })
        }
        _ => Ok(doc! { sort.field.as_str(): { "$lt": value } }),
    }
}

fn sort_document(sort: &SortSpec) -> BsonDocument {
    let mut order = doc! { sort.field.as_str(): -1 };
    if let Some(tb) = &sort.tie_breaker {
        order.insert(tb.as_str(), -1);
    }
    order
}

fn to_json_document(collection: &str, doc: BsonDocument) -> Result<Document> {
    match Bson::Document(doc).into_canonical_extjson() {
        Value::Object(map) => Ok(map),
        other => Err(MigrateError::document(
            collection,
            format!("unexpected document encoding: {}", other),
        )),
    }
}

fn to_bson_document(collection: &str, doc: &Document) -> Result<BsonDocument> {
    match Bson::try_from(Value::Object(doc.clone())) {
        Ok(Bson::Document(d)) => Ok(d),
        Ok(other) => Err(MigrateError::document(
            collection,
            format!("document decoded as {:?}", other.element_type()),
        )),
        Err(e) => Err(MigrateError::document(collection, e.to_string())),
    }
}

/// Documents written by an ordered insert that reported errors at the given
/// batch indexes.
///
/// Ordered inserts stop at the first failure, so everything before the
/// lowest failed index was written. With only a write concern error nothing
/// is known to be durable.
fn written_prefix(failed_indexes: impl IntoIterator<Item = usize>) -> usize {
    failed_indexes.into_iter().min().unwrap_or(0)
}

#[async_trait]
impl RecordSource for MongoDocumentStore {
    async fn page(
        &self,
        collection: &str,
        boundary: Option<&Boundary>,
        sort: &SortSpec,
        limit: usize,
    ) -> Result<Vec<Document>> {
        let filter = match boundary {
            Some(b) => boundary_filter(collection, b, sort)?,
            None => BsonDocument::new(),
        };
        debug!("{}: find {} sort {}", collection, filter, sort_document(sort));

        let cursor = self
            .collection(collection)
            .find(filter)
            .sort(sort_document(sort))
            .limit(i64::try_from(limit).unwrap_or(i64::MAX))
            .await
            .map_err(|e| map_error(Component::Source, collection, e))?;
        let docs: Vec<BsonDocument> = cursor
            .try_collect()
            .await
            .map_err(|e| map_error(Component::Source, collection, e))?;

        docs.into_iter()
            .map(|d| to_json_document(collection, d))
            .collect()
    }

    fn source_type(&self) -> &'static str {
        "mongodb"
    }
}

#[async_trait]
impl RecordSink for MongoDocumentStore {
    async fn insert_batch(&self, collection: &str, documents: &[Document]) -> Result<InsertOutcome> {
        if documents.is_empty() {
            return Ok(InsertOutcome::complete(0));
        }
        let docs = documents
            .iter()
            .map(|d| to_bson_document(collection, d))
            .collect::<Result<Vec<_>>>()?;

        match self.collection(collection).insert_many(docs).ordered(true).await {
            Ok(result) => Ok(InsertOutcome {
                inserted: result.inserted_ids.len(),
                ordered: true,
            }),
            Err(e) => {
                if let MongoErrorKind::InsertMany(failure) = e.kind.as_ref() {
                    let failed = failure
                        .write_errors
                        .iter()
                        .flatten()
                        .map(|w| w.index);
                    return Err(MigrateError::PartialWrite {
                        collection: collection.to_string(),
                        submitted: documents.len(),
                        written: written_prefix(failed),
                    });
                }
                Err(map_error(Component::Sink, collection, e))
            }
        }
    }

    fn sink_type(&self) -> &'static str {
        "mongodb"
    }
}
