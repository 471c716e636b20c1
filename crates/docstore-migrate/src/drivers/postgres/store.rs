//! JSONB document collections on PostgreSQL.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use serde_json::Value;
use tokio_postgres::types::ToSql;
use tracing::debug;

use super::{field_path, is_already_exists, pool_error, qualify_table, query_error, quote_ident};
use crate::core::{Boundary, Document, InsertOutcome, RecordSink, RecordSource, SortSpec, SortValue};
use crate::error::{Component, MigrateError, Result};

/// Source and sink over JSONB tables in one schema.
pub struct PgDocumentStore {
    pool: Pool,
    schema: String,
}

impl PgDocumentStore {
    pub fn new(pool: Pool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }

    fn table(&self, collection: &str) -> String {
        qualify_table(&self.schema, collection)
    }
}

/// SQL projection of a JSONB value `v` onto a typed, totally ordered key
/// `(rank, num, txt, flag, ts)`.
///
/// `rank` follows [`SortValue`]'s cross-kind order, with `-1` for a missing
/// or unsortable value. Extended JSON wrappers are unwrapped to numbers,
/// ObjectId text and timestamps. Unused columns hold fixed defaults so row
/// comparisons never meet NULL.
const SORT_KEY_COLUMNS: &str = "\
CASE \
 WHEN v IS NULL THEN -1 \
 WHEN jsonb_typeof(v) = 'null' THEN 0 \
 WHEN jsonb_typeof(v) = 'number' THEN 1 \
 WHEN jsonb_typeof(v) = 'string' THEN 2 \
 WHEN jsonb_typeof(v) = 'boolean' THEN 4 \
 WHEN jsonb_typeof(v) <> 'object' THEN -1 \
 WHEN v ?| array['$numberInt', '$numberLong', '$numberDouble'] THEN 1 \
 WHEN v ? '$oid' THEN 3 \
 WHEN v ? '$date' THEN 5 \
 ELSE -1 END AS rank, \
COALESCE(CASE \
 WHEN jsonb_typeof(v) = 'number' THEN (v #>> '{}')::numeric \
 WHEN jsonb_typeof(v) = 'object' \
  THEN COALESCE(v ->> '$numberInt', v ->> '$numberLong', v ->> '$numberDouble')::numeric \
 END, 0) AS num, \
COALESCE(CASE \
 WHEN jsonb_typeof(v) = 'string' THEN v #>> '{}' \
 WHEN jsonb_typeof(v) = 'object' THEN lower(v ->> '$oid') \
 END, '') AS txt, \
COALESCE(CASE WHEN jsonb_typeof(v) = 'boolean' THEN (v #>> '{}')::boolean END, false) AS flag, \
COALESCE(CASE \
 WHEN jsonb_typeof(v) <> 'object' THEN NULL \
 WHEN jsonb_typeof(v -> '$date') = 'string' THEN (v ->> '$date')::timestamptz \
 WHEN jsonb_typeof(v -> '$date') = 'number' \
  THEN 'epoch'::timestamptz + (v ->> '$date')::bigint * interval '1 millisecond' \
 WHEN jsonb_typeof(v -> '$date') = 'object' \
  THEN 'epoch'::timestamptz + (v #>> '{$date,$numberLong}')::bigint * interval '1 millisecond' \
 END, 'epoch'::timestamptz) AS ts";

/// How a page query restricts documents to those below the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageFilter {
    /// First page: every document.
    Unbounded,
    /// Compare the sort field only.
    Primary,
    /// Compare `(sort_field, tie_breaker)` lexicographically.
    Composite,
}

/// Boundary value as bind parameters matching [`SORT_KEY_COLUMNS`].
struct KeyParams {
    rank: i32,
    num: String,
    txt: String,
    flag: bool,
    ts: DateTime<Utc>,
}

impl KeyParams {
    fn new(value: &SortValue) -> Self {
        let mut key = Self {
            rank: i32::from(value.rank()),
            num: "0".to_string(),
            txt: String::new(),
            flag: false,
            ts: DateTime::<Utc>::UNIX_EPOCH,
        };
        match value {
            SortValue::Null => {}
            SortValue::Int(i) => key.num = i.to_string(),
            SortValue::Float(f) => key.num = numeric_literal(*f),
            SortValue::Text(s) | SortValue::ObjectId(s) => key.txt = s.clone(),
            SortValue::Bool(b) => key.flag = *b,
            SortValue::Date(dt) => key.ts = *dt,
        }
        key
    }

    fn push<'a>(&'a self, params: &mut Vec<&'a (dyn ToSql + Sync)>) {
        params.push(&self.rank);
        params.push(&self.num);
        params.push(&self.txt);
        params.push(&self.flag);
        params.push(&self.ts);
    }
}

/// Text accepted by a `numeric` cast.
fn numeric_literal(f: f64) -> String {
    if f.is_nan() {
        "NaN".to_string()
    } else if f.is_infinite() {
        if f > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else {
        // Display never uses exponent notation
        format!("{}", f)
    }
}

/// Key columns of `alias` in comparison form.
fn key_tuple(alias: &str) -> String {
    format!(
        "{a}.rank, {a}.num, {a}.txt COLLATE \"C\", {a}.flag, {a}.ts",
        a = alias
    )
}

/// Bind placeholders for one [`KeyParams`] starting at `$first`.
fn param_tuple(first: usize) -> String {
    format!(
        "${}::int, ${}::text::numeric, ${}::text COLLATE \"C\", ${}::boolean, ${}::timestamptz",
        first,
        first + 1,
        first + 2,
        first + 3,
        first + 4
    )
}

fn key_order(alias: &str) -> String {
    format!(
        "{a}.rank DESC, {a}.num DESC, {a}.txt COLLATE \"C\" DESC, {a}.flag DESC, {a}.ts DESC",
        a = alias
    )
}

/// Page size as a `bigint`, saturating instead of wrapping.
fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// Page query for a collection table.
///
/// Parameters: `$1` sort path, `$2` tie-breaker path (when configured),
/// then five boundary parameters per compared key, then the limit.
fn build_page_query(table: &str, has_tiebreak: bool, filter: PageFilter) -> String {
    let mut sql = format!(
        "SELECT t.doc FROM {} AS t \
         CROSS JOIN LATERAL (SELECT t.doc #> $1::text[] AS v) AS sv \
         CROSS JOIN LATERAL (SELECT {} FROM (SELECT sv.v AS v) AS s) AS k",
        table, SORT_KEY_COLUMNS
    );
    if has_tiebreak {
        sql.push_str(&format!(
            " CROSS JOIN LATERAL (SELECT t.doc #> $2::text[] AS v) AS tv \
             CROSS JOIN LATERAL (SELECT {} FROM (SELECT tv.v AS v) AS s) AS k2",
            SORT_KEY_COLUMNS
        ));
    }

    let mut next = if has_tiebreak { 3 } else { 2 };
    // Documents without a usable key never pass a boundary
    let keyed = if has_tiebreak {
        "k.rank >= 0 AND k2.rank >= 0"
    } else {
        "k.rank >= 0"
    };
    match filter {
        PageFilter::Unbounded => {}
        PageFilter::Primary => {
            sql.push_str(&format!(
                " WHERE {} AND ({}) < ({})",
                keyed,
                key_tuple("k"),
                param_tuple(next)
            ));
            next += 5;
        }
        PageFilter::Composite => {
            sql.push_str(&format!(
                " WHERE {} AND ({}, {}) < ({}, {})",
                keyed,
                key_tuple("k"),
                key_tuple("k2"),
                param_tuple(next),
                param_tuple(next + 5)
            ));
            next += 10;
        }
    }

    sql.push_str(" ORDER BY ");
    sql.push_str(&key_order("k"));
    if has_tiebreak {
        sql.push_str(", ");
        sql.push_str(&key_order("k2"));
    }
    sql.push_str(&format!(" LIMIT ${}::bigint", next));
    sql
}

#[async_trait]
impl RecordSource for PgDocumentStore {
    async fn page(
        &self,
        collection: &str,
        boundary: Option<&Boundary>,
        sort: &SortSpec,
        limit: usize,
    ) -> Result<Vec<Document>> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| pool_error(Component::Source, e))?;

        let sort_path = field_path(&sort.field);
        let tiebreak_path = sort.tie_breaker.as_deref().map(field_path);
        // A boundary without a recorded tie-breaker value compares on the
        // primary value alone.
        let filter = match boundary {
            None => PageFilter::Unbounded,
            Some(b) if tiebreak_path.is_some() && b.tiebreak.is_some() => PageFilter::Composite,
            Some(_) => PageFilter::Primary,
        };

        let primary_key = boundary.map(|b| KeyParams::new(&b.value));
        let tiebreak_key = match filter {
            PageFilter::Composite => boundary
                .and_then(|b| b.tiebreak.as_ref())
                .map(KeyParams::new),
            _ => None,
        };
        let limit = limit_param(limit);

        let mut params: Vec<&(dyn ToSql + Sync)> = vec![&sort_path];
        if let Some(path) = &tiebreak_path {
            params.push(path);
        }
        if let Some(key) = &primary_key {
            key.push(&mut params);
        }
        if let Some(key) = &tiebreak_key {
            key.push(&mut params);
        }
        params.push(&limit);

        let query = build_page_query(&self.table(collection), tiebreak_path.is_some(), filter);
        debug!("{}: {}", collection, query);

        let rows = client
            .query(query.as_str(), &params)
            .await
            .map_err(|e| query_error(Component::Source, collection, e))?;

        rows.iter()
            .map(|row| {
                let doc: Value = row
                    .try_get(0)
                    .map_err(|e| MigrateError::source(collection, e.to_string()))?;
                match doc {
                    Value::Object(map) => Ok(map),
                    other => Err(MigrateError::document(
                        collection,
                        format!("stored document is not an object: {}", other),
                    )),
                }
            })
            .collect()
    }

    fn source_type(&self) -> &'static str {
        "postgres"
    }
}

#[async_trait]
impl RecordSink for PgDocumentStore {
    async fn prepare(&self, collection: &str) -> Result<()> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| pool_error(Component::Sink, e))?;

        let statements = [
            format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(&self.schema)),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (id BIGSERIAL PRIMARY KEY, doc JSONB NOT NULL)",
                self.table(collection)
            ),
        ];
        for sql in &statements {
            if let Err(e) = client.batch_execute(sql).await {
                if !is_already_exists(&e) {
                    return Err(query_error(Component::Sink, collection, e));
                }
            }
        }
        Ok(())
    }

    async fn insert_batch(&self, collection: &str, documents: &[Document]) -> Result<InsertOutcome> {
        if documents.is_empty() {
            return Ok(InsertOutcome::complete(0));
        }

        let client = self
            .pool
            .get()
            .await
            .map_err(|e| pool_error(Component::Sink, e))?;

        // One statement inserts the whole batch, so it is all-or-nothing.
        // WITH ORDINALITY keeps BIGSERIAL ids in input order.
        let sql = format!(
            "INSERT INTO {} (doc) \
             SELECT elem FROM jsonb_array_elements($1::jsonb) WITH ORDINALITY AS t(elem, pos) \
             ORDER BY pos",
            self.table(collection)
        );
        let payload = Value::Array(documents.iter().cloned().map(Value::Object).collect());

        let inserted = client
            .execute(sql.as_str(), &[&payload])
            .await
            .map_err(|e| query_error(Component::Sink, collection, e))?;

        Ok(InsertOutcome {
            inserted: usize::try_from(inserted).unwrap_or(usize::MAX),
            ordered: true,
        })
    }

    fn sink_type(&self) -> &'static str {
        "postgres"
    }
}
