#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use vocabmirror_core::{
    BackingStore, DatabaseConfig, MirrorConfig, MirrorError, MirrorResult, Record, Statement,
};
use vocabmirror_sql::{bootstrap, SqliteStore};

/// Connects to a fresh SQLite file and creates the bookkeeping tables.
pub async fn sqlite_store(config: &MirrorConfig) -> (Arc<SqliteStore>, NamedTempFile) {
    let tmp = NamedTempFile::new().expect("temp file");
    let database = DatabaseConfig {
        url: format!("sqlite://{}", tmp.path().display()),
        ..DatabaseConfig::default()
    };
    let store = SqliteStore::connect(&database).await.expect("connect");
    bootstrap(&store, config).await.expect("bootstrap");
    (Arc::new(store), tmp)
}

/// Wraps a store, counting attempts per SQL text and failing chosen statements.
pub struct FlakyStore {
    inner: Arc<dyn BackingStore>,
    attempts: Mutex<HashMap<String, usize>>,
    failures: Mutex<HashMap<String, usize>>,
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn BackingStore>) -> Self {
        Self {
            inner,
            attempts: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// The next `times` attempts of `sql` fail.
    pub fn fail(&self, sql: &str, times: usize) {
        self.failures.lock().unwrap().insert(sql.to_string(), times);
    }

    /// Attempts of `sql` so far, failed ones included.
    pub fn attempts(&self, sql: &str) -> usize {
        self.attempts.lock().unwrap().get(sql).copied().unwrap_or(0)
    }

    fn attempt(&self, statement: &Statement) -> MirrorResult<()> {
        *self
            .attempts
            .lock()
            .unwrap()
            .entry(statement.sql.clone())
            .or_default() += 1;
        let mut failures = self.failures.lock().unwrap();
        match failures.get_mut(&statement.sql) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(MirrorError::database(format!("injected failure: {}", statement.sql)))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl BackingStore for FlakyStore {
    fn dialect(&self) -> &'static str {
        self.inner.dialect()
    }

    async fn execute(&self, statement: &Statement) -> MirrorResult<u64> {
        self.attempt(statement)?;
        self.inner.execute(statement).await
    }

    async fn execute_all(&self, statements: &[Statement]) -> MirrorResult<u64> {
        for statement in statements {
            self.attempt(statement)?;
        }
        self.inner.execute_all(statements).await
    }

    async fn query(&self, statement: &Statement) -> MirrorResult<Vec<Record>> {
        self.inner.query(statement).await
    }

    async fn table_exists(&self, name: &str) -> MirrorResult<bool> {
        self.inner.table_exists(name).await
    }
}

/// Rows of `table` ordered by `order_by`.
pub async fn rows(store: &dyn BackingStore, table: &str, order_by: &str) -> Vec<Record> {
    store
        .query(&Statement::new(format!(
            "SELECT * FROM \"{table}\" ORDER BY \"{order_by}\""
        )))
        .await
        .expect("query rows")
}
