#![allow(dead_code)]

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use tempfile::NamedTempFile;
use vocabmirror_core::mocks::{ManualClock, MockUpstreamClient};
use vocabmirror_core::types::keys;
use vocabmirror_core::{
    BackingStore, DatabaseConfig, FailureKind, FetchOutcome, KnownFailure, MirrorConfig,
    MirrorError, MirrorResult, Record, Statement,
};
use vocabmirror_mirror::RefreshCoordinator;
use vocabmirror_sql::{bootstrap, SqliteStore};

pub const CONFIG: &str = r#"
[refresh]
buffer_hours = 2

[[tables]]
name = "code_sets"
key_column = "codeset_id"
columns = ["codeset_id", "concept_set_name"]
indexes = [["concept_set_name"]]

[[tables]]
name = "concept_set_members"
key_column = "codeset_id"
columns = ["codeset_id", "concept_id"]
grouped = true

[[derived]]
name = "codeset_counts"
depends_on = ["concept_set_members"]
select = "SELECT codeset_id, COUNT(*) AS members FROM concept_set_members GROUP BY codeset_id"
indexes = [["codeset_id"]]

[[derived]]
name = "codeset_summary"
depends_on = ["code_sets", "codeset_counts"]
select = """
SELECT s.codeset_id, s.concept_set_name, c.members
FROM code_sets s LEFT JOIN codeset_counts c ON c.codeset_id = s.codeset_id
"""
"#;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 6, 8, 0, 0).unwrap()
}

type Action = Pin<Box<dyn Future<Output = ()> + Send>>;

struct Hook {
    matches: Box<dyn Fn(&Statement) -> bool + Send + Sync>,
    action: Action,
}

/// Store wrapper that runs an action right before a matching statement, or
/// fails statements by SQL prefix.
pub struct HookedStore {
    inner: Arc<dyn BackingStore>,
    hooks: Mutex<Vec<Hook>>,
    failures: Mutex<Vec<(String, usize)>>,
}

impl HookedStore {
    pub fn new(inner: Arc<dyn BackingStore>) -> Self {
        Self {
            inner,
            hooks: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
        }
    }

    /// Runs `action` once, before the first statement `matches` accepts.
    pub fn before<M, F>(&self, matches: M, action: F)
    where
        M: Fn(&Statement) -> bool + Send + Sync + 'static,
        F: Future<Output = ()> + Send + 'static,
    {
        self.hooks.lock().unwrap().push(Hook {
            matches: Box::new(matches),
            action: Box::pin(action),
        });
    }

    /// The next `times` statements starting with `prefix` fail.
    pub fn fail_prefix(&self, prefix: &str, times: usize) {
        self.failures.lock().unwrap().push((prefix.to_string(), times));
    }

    async fn intercept(&self, statements: &[Statement]) -> MirrorResult<()> {
        let fired = {
            let mut hooks = self.hooks.lock().unwrap();
            hooks
                .iter()
                .position(|hook| statements.iter().any(|s| (hook.matches)(s)))
                .map(|idx| hooks.remove(idx))
        };
        if let Some(hook) = fired {
            hook.action.await;
        }
        let mut failures = self.failures.lock().unwrap();
        for statement in statements {
            for (prefix, remaining) in failures.iter_mut() {
                if *remaining > 0 && statement.sql.trim_start().starts_with(prefix.as_str()) {
                    *remaining -= 1;
                    return Err(MirrorError::database(format!("injected failure: {prefix}")));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BackingStore for HookedStore {
    fn dialect(&self) -> &'static str {
        self.inner.dialect()
    }

    fn transactional_ddl(&self) -> bool {
        self.inner.transactional_ddl()
    }

    async fn execute(&self, statement: &Statement) -> MirrorResult<u64> {
        self.intercept(std::slice::from_ref(statement)).await?;
        self.inner.execute(statement).await
    }

    async fn execute_all(&self, statements: &[Statement]) -> MirrorResult<u64> {
        self.intercept(statements).await?;
        self.inner.execute_all(statements).await
    }

    async fn query(&self, statement: &Statement) -> MirrorResult<Vec<Record>> {
        self.inner.query(statement).await
    }

    async fn table_exists(&self, name: &str) -> MirrorResult<bool> {
        self.inner.table_exists(name).await
    }
}

/// Whether `statement` binds `value` as a parameter.
pub fn binds(statement: &Statement, value: &str) -> bool {
    statement.params.iter().any(|p| p.as_str() == Some(value))
}

pub struct Harness {
    pub coordinator: Arc<RefreshCoordinator>,
    pub client: Arc<MockUpstreamClient>,
    pub clock: Arc<ManualClock>,
    pub store: Arc<SqliteStore>,
    pub hooks: Arc<HookedStore>,
    _tmp: NamedTempFile,
}

impl Harness {
    pub async fn new(now: DateTime<Utc>) -> Self {
        let config = MirrorConfig::from_toml_str(CONFIG).expect("config");
        let tmp = NamedTempFile::new().expect("temp file");
        let database = DatabaseConfig {
            url: format!("sqlite://{}", tmp.path().display()),
            ..DatabaseConfig::default()
        };
        let store = Arc::new(SqliteStore::connect(&database).await.expect("connect"));
        bootstrap(store.as_ref(), &config).await.expect("bootstrap");

        let client = Arc::new(MockUpstreamClient::new());
        let clock = Arc::new(ManualClock::new(now));
        let hooks = Arc::new(HookedStore::new(store.clone()));
        let coordinator = RefreshCoordinator::new(config, hooks.clone(), client.clone(), clock.clone())
            .expect("coordinator");
        Self {
            coordinator: Arc::new(coordinator),
            client,
            clock,
            store,
            hooks,
            _tmp: tmp,
        }
    }

    /// A second coordinator on the same database, client and clock, bypassing the hooks.
    pub fn other_coordinator(&self) -> Arc<RefreshCoordinator> {
        let config = MirrorConfig::from_toml_str(CONFIG).expect("config");
        Arc::new(
            RefreshCoordinator::new(config, self.store.clone(), self.client.clone(), self.clock.clone())
                .expect("coordinator"),
        )
    }

    /// Pretends an earlier cycle succeeded with `end_time = at`.
    pub async fn seed_last_success(&self, at: DateTime<Utc>) {
        self.coordinator
            .status()
            .set_timestamp(keys::LAST_REFRESH_SUCCESS, at)
            .await
            .expect("seed last success");
    }

    pub async fn var(&self, key: &str) -> Option<String> {
        self.coordinator.status().get(key).await.expect("manage var")
    }

    pub async fn rows(&self, table: &str, order_by: &str) -> Vec<Record> {
        self.store
            .query(&Statement::new(format!(
                "SELECT * FROM \"{table}\" ORDER BY {order_by}"
            )))
            .await
            .expect("query rows")
    }
}

pub fn record(value: Value) -> Record {
    value.as_object().cloned().expect("object")
}

pub fn fetched(table: &str, value: Value) -> FetchOutcome {
    FetchOutcome::Fetched {
        table: table.to_string(),
        record: record(value),
    }
}

pub fn known_failure(table: &str, primary_key: &str, kind: FailureKind) -> FetchOutcome {
    FetchOutcome::KnownFailure(KnownFailure {
        table: table.to_string(),
        primary_key: primary_key.to_string(),
        kind,
        comment: "truncated by the per-object channel".to_string(),
    })
}
