//! Abstractions over the collaborators the refresh engine consumes.
//!
//! The engine never talks to a database driver or an HTTP client directly; it is
//! written against these traits so the SQLite store, the registry client, and the
//! test doubles in [`crate::mocks`] are interchangeable.

use crate::error::MirrorResult;
use crate::types::{quote_ident, ChangeBatch, Record, Statement};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Transactional relational store holding the mirror.
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Short dialect name for logs (`sqlite`, ...).
    fn dialect(&self) -> &'static str;

    /// Whether DDL participates in transactions.
    ///
    /// When `false`, multi-statement swaps run statement by statement and the
    /// exposure window between renames is logged.
    fn transactional_ddl(&self) -> bool {
        true
    }

    /// Executes one statement and returns the number of affected rows.
    async fn execute(&self, statement: &Statement) -> MirrorResult<u64>;

    /// Executes all statements in a single transaction.
    ///
    /// Either every statement is applied or none is.
    async fn execute_all(&self, statements: &[Statement]) -> MirrorResult<u64>;

    /// Runs a query and returns its rows.
    async fn query(&self, statement: &Statement) -> MirrorResult<Vec<Record>>;

    /// Whether a table with this name exists.
    async fn table_exists(&self, name: &str) -> MirrorResult<bool>;

    /// Renames a table.
    async fn rename_table(&self, from: &str, to: &str) -> MirrorResult<()> {
        let sql = format!(
            "ALTER TABLE {} RENAME TO {}",
            quote_ident(from)?,
            quote_ident(to)?
        );
        self.execute(&Statement::new(sql)).await.map(|_| ())
    }

    /// Drops a table if it exists.
    async fn drop_table(&self, name: &str) -> MirrorResult<()> {
        let sql = format!("DROP TABLE IF EXISTS {}", quote_ident(name)?);
        self.execute(&Statement::new(sql)).await.map(|_| ())
    }
}

/// Client of the upstream registry that owns the source of truth.
///
/// Retrying transient transport failures is the client's job; an error returned
/// here is final for the current cycle.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Fetches every record changed in `[since, until)`.
    ///
    /// Records that match a known failure signature are returned as
    /// `FetchOutcome::KnownFailure` instead of failing the call.
    async fn fetch_changes(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> MirrorResult<ChangeBatch>;

    /// Fetches a complete dataset through the bulk export channel.
    async fn fetch_bulk_export(&self, dataset: &str) -> MirrorResult<Vec<Record>>;
}

/// Source of "now", injected so cycles can be replayed deterministically.
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
