//! SQLite-backed implementation of `BackingStore`.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Number, Value};
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Column, Row, Sqlite, SqlitePool, TypeInfo, ValueRef};
use tracing::{debug, trace};
use vocabmirror_core::{BackingStore, DatabaseConfig, MirrorError, MirrorResult, Record, Statement};

/// SQLite mirror database.
///
/// DDL is transactional in SQLite, so multi-statement swaps applied through
/// [`BackingStore::execute_all`] are atomic.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connects to a SQLite database using the configured DSN (e.g. `sqlite:///tmp/mirror.db`),
    /// creating the file if it does not exist.
    pub async fn connect(config: &DatabaseConfig) -> MirrorResult<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)
            .map_err(sqlite_err)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(config.acquire_timeout_secs));
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect_with(options)
            .await
            .map_err(sqlite_err)?;
        debug!(url = %config.url, "connected to sqlite mirror");
        Ok(Self { pool })
    }

    /// Wraps an existing pool.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl BackingStore for SqliteStore {
    fn dialect(&self) -> &'static str {
        "sqlite"
    }

    async fn execute(&self, statement: &Statement) -> MirrorResult<u64> {
        trace!(sql = %statement.sql, "sqlite execute");
        let result = bind_params(sqlx::query(&statement.sql), &statement.params)
            .execute(&self.pool)
            .await
            .map_err(sqlite_err)?;
        Ok(result.rows_affected())
    }

    async fn execute_all(&self, statements: &[Statement]) -> MirrorResult<u64> {
        let mut tx = self.pool.begin().await.map_err(sqlite_err)?;
        let mut affected = 0;
        for statement in statements {
            trace!(sql = %statement.sql, "sqlite execute in transaction");
            affected += bind_params(sqlx::query(&statement.sql), &statement.params)
                .execute(&mut *tx)
                .await
                .map_err(sqlite_err)?
                .rows_affected();
        }
        tx.commit().await.map_err(sqlite_err)?;
        Ok(affected)
    }

    async fn query(&self, statement: &Statement) -> MirrorResult<Vec<Record>> {
        trace!(sql = %statement.sql, "sqlite query");
        let rows = bind_params(sqlx::query(&statement.sql), &statement.params)
            .fetch_all(&self.pool)
            .await
            .map_err(sqlite_err)?;
        rows.iter().map(row_to_record).collect()
    }

    async fn table_exists(&self, name: &str) -> MirrorResult<bool> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?")
                .bind(name)
                .fetch_one(&self.pool)
                .await
                .map_err(sqlite_err)?;
        Ok(count > 0)
    }
}

fn bind_params<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    params: &'q [Value],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for value in params {
        query = match value {
            Value::Null => query.bind(None::<String>),
            Value::Bool(flag) => query.bind(*flag),
            Value::Number(number) => match number.as_i64() {
                Some(int) => query.bind(int),
                None => query.bind(number.as_f64()),
            },
            Value::String(text) => query.bind(text.as_str()),
            // Nested payloads are stored as their JSON text.
            other => query.bind(other.to_string()),
        };
    }
    query
}

fn row_to_record(row: &SqliteRow) -> MirrorResult<Record> {
    let mut record = Record::new();
    for column in row.columns() {
        let idx = column.ordinal();
        let raw = row.try_get_raw(idx).map_err(sqlite_err)?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            let storage_class = raw.type_info().name().to_string();
            match storage_class.as_str() {
                "INTEGER" | "BOOLEAN" => {
                    Value::from(row.try_get_unchecked::<i64, _>(idx).map_err(sqlite_err)?)
                }
                "REAL" => {
                    let real = row.try_get_unchecked::<f64, _>(idx).map_err(sqlite_err)?;
                    Number::from_f64(real).map(Value::Number).unwrap_or(Value::Null)
                }
                "BLOB" => Value::String(hex::encode(
                    row.try_get_unchecked::<Vec<u8>, _>(idx).map_err(sqlite_err)?,
                )),
                _ => Value::String(row.try_get_unchecked::<String, _>(idx).map_err(sqlite_err)?),
            }
        };
        record.insert(column.name().to_string(), value);
    }
    Ok(record)
}

pub(crate) fn sqlite_err(err: sqlx::Error) -> MirrorError {
    MirrorError::database(format!("sqlite query failed: {err}"))
}
