//! PostgreSQL driver.
//!
//! Collections are stored as tables of JSONB documents:
//!
//! ```sql
//! CREATE TABLE <schema>.<collection> (id BIGSERIAL PRIMARY KEY, doc JSONB NOT NULL)
//! ```
//!
//! The same pool helpers back [`PgCheckpointStore`](crate::state::PgCheckpointStore).

mod store;

pub use store::PgDocumentStore;

use deadpool_postgres::{Manager, ManagerConfig, Pool, PoolError, RecyclingMethod};
use tokio_postgres::error::SqlState;
use tokio_postgres::NoTls;
use tracing::info;

use crate::config::redact_url;
use crate::error::{Component, MigrateError, Result};

/// Build a connection pool and verify connectivity.
pub async fn connect_pool(url: &str, max_connections: usize, component: Component) -> Result<Pool> {
    let pg_config: tokio_postgres::Config = url.parse().map_err(|e| {
        MigrateError::Config(format!(
            "invalid PostgreSQL url for {} '{}': {}",
            component,
            redact_url(url),
            e
        ))
    })?;

    let mut mgr_config = ManagerConfig::default();
    mgr_config.recycling_method = RecyclingMethod::Fast;

    let mgr = Manager::from_config(pg_config, NoTls, mgr_config);
    let pool = Pool::builder(mgr)
        .max_size(max_connections)
        .build()
        .map_err(|e| MigrateError::connectivity(component, format!("failed to create pool: {}", e)))?;

    // Test connection
    let client = pool
        .get()
        .await
        .map_err(|e| pool_error(component, e))?;
    client
        .simple_query("SELECT 1")
        .await
        .map_err(|e| MigrateError::connectivity(component, e.to_string()))?;

    info!("Connected to PostgreSQL {}: {}", component, redact_url(url));

    Ok(pool)
}

/// Map a pool checkout failure.
pub(crate) fn pool_error(component: Component, e: PoolError) -> MigrateError {
    match e {
        PoolError::Backend(e) => MigrateError::connectivity(component, e.to_string()),
        other => MigrateError::connectivity(component, format!("pool error: {}", other)),
    }
}

/// Map a query failure: server-reported errors belong to the store role,
/// everything else (closed socket, IO, timeout) is connectivity.
pub(crate) fn query_error(component: Component, collection: &str, e: tokio_postgres::Error) -> MigrateError {
    if e.as_db_error().is_none() {
        return MigrateError::connectivity(component, e.to_string());
    }
    let message = e
        .as_db_error()
        .map(|db| db.message().to_string())
        .unwrap_or_else(|| e.to_string());
    match component {
        Component::Source => MigrateError::source(collection, message),
        Component::Sink => MigrateError::sink(collection, message),
        Component::Checkpoint => MigrateError::Checkpoint(message),
    }
}

/// Whether a DDL failure only means the object is already there.
///
/// Concurrent `CREATE ... IF NOT EXISTS` can still race on the catalog and
/// fail with a unique violation.
pub(crate) fn is_already_exists(e: &tokio_postgres::Error) -> bool {
    matches!(
        e.code(),
        Some(code) if *code == SqlState::DUPLICATE_SCHEMA
            || *code == SqlState::DUPLICATE_TABLE
            || *code == SqlState::DUPLICATE_OBJECT
            || *code == SqlState::UNIQUE_VIOLATION
    )
}

/// Quote a PostgreSQL identifier.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Qualify a PostgreSQL table name with schema and proper quoting.
pub(crate) fn qualify_table(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

/// Split a dotted field path into the `text[]` form used by `#>`.
pub(crate) fn field_path(field: &str) -> Vec<String> {
    field.split('.').map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("events"), "\"events\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_qualify_table() {
        assert_eq!(qualify_table("public", "events"), "\"public\".\"events\"");
    }

    #[test]
    fn test_field_path() {
        assert_eq!(field_path("meta.created"), vec!["meta", "created"]);
        assert_eq!(field_path("name"), vec!["name"]);
    }
}
