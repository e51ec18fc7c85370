//! Append-mostly log of per-record fetch failures and their resolution.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;
use vocabmirror_core::{
    format_timestamp, parse_timestamp, BackingStore, FailureKind, FetchAuditRecord, KnownFailure,
    MirrorError, MirrorResult, Record, Statement,
};

const SELECT_COLUMNS: &str =
    "SELECT id, table_name, primary_key, status_initially, comment, created_at, success_datetime \
     FROM fetch_audit";

/// Inserts unless the same `(table, primary_key, kind)` is already open.
const INSERT_IF_NOT_OPEN: &str = r#"INSERT INTO fetch_audit
        (table_name, primary_key, status_initially, comment, created_at)
    SELECT ?, ?, ?, ?, ?
    WHERE NOT EXISTS (
        SELECT 1 FROM fetch_audit
        WHERE table_name = ? AND primary_key = ? AND status_initially = ?
          AND success_datetime IS NULL
    )"#;

/// Fetch audit log over the `fetch_audit` table.
///
/// Records are never deleted; resolution sets `success_datetime` exactly once.
#[derive(Clone)]
pub struct FetchAuditLog {
    store: Arc<dyn BackingStore>,
}

impl FetchAuditLog {
    /// Create an audit log on top of `store`.
    pub fn new(store: Arc<dyn BackingStore>) -> Self {
        Self { store }
    }

    /// Records a known failure; returns `false` if an identical open record exists.
    pub async fn record(&self, failure: &KnownFailure, at: DateTime<Utc>) -> MirrorResult<bool> {
        let kind = failure.kind.as_str();
        let inserted = self
            .store
            .execute(
                &Statement::new(INSERT_IF_NOT_OPEN)
                    .bind(failure.table.as_str())
                    .bind(failure.primary_key.as_str())
                    .bind(kind)
                    .bind(failure.comment.as_str())
                    .bind(format_timestamp(at))
                    .bind(failure.table.as_str())
                    .bind(failure.primary_key.as_str())
                    .bind(kind),
            )
            .await?;
        if inserted == 0 {
            debug!(
                table = %failure.table,
                primary_key = %failure.primary_key,
                kind,
                "failure already open; not recorded again"
            );
        }
        Ok(inserted > 0)
    }

    /// Open records, optionally restricted to `kinds`, oldest first.
    pub async fn open_failures(
        &self,
        kinds: Option<&[FailureKind]>,
    ) -> MirrorResult<Vec<FetchAuditRecord>> {
        let statement = match kinds {
            Some([]) => return Ok(Vec::new()),
            Some(kinds) => {
                let placeholders = vec!["?"; kinds.len()].join(", ");
                let mut statement = Statement::new(format!(
                    "{SELECT_COLUMNS} WHERE success_datetime IS NULL \
                     AND status_initially IN ({placeholders}) ORDER BY id"
                ));
                for kind in kinds {
                    statement = statement.bind(kind.as_str());
                }
                statement
            }
            None => Statement::new(format!(
                "{SELECT_COLUMNS} WHERE success_datetime IS NULL ORDER BY id"
            )),
        };
        self.fetch(&statement).await
    }

    /// Every record, oldest first.
    pub async fn all(&self) -> MirrorResult<Vec<FetchAuditRecord>> {
        self.fetch(&Statement::new(format!("{SELECT_COLUMNS} ORDER BY id")))
            .await
    }

    /// Record by id.
    pub async fn get(&self, id: i64) -> MirrorResult<Option<FetchAuditRecord>> {
        let records = self
            .fetch(&Statement::new(format!("{SELECT_COLUMNS} WHERE id = ?")).bind(id))
            .await?;
        Ok(records.into_iter().next())
    }

    /// Closes the given records; already closed ones are left untouched.
    ///
    /// Returns the number of records that changed state.
    pub async fn mark_resolved(&self, ids: &[i64], at: DateTime<Utc>) -> MirrorResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let at = format_timestamp(at);
        let statements: Vec<Statement> = ids
            .iter()
            .map(|id| {
                Statement::new(
                    "UPDATE fetch_audit SET success_datetime = ? \
                     WHERE id = ? AND success_datetime IS NULL",
                )
                .bind(at.as_str())
                .bind(*id)
            })
            .collect();
        self.store.execute_all(&statements).await
    }

    /// Number of open records per kind.
    pub async fn open_counts(&self) -> MirrorResult<BTreeMap<FailureKind, u64>> {
        let rows = self
            .store
            .query(&Statement::new(
                "SELECT status_initially, COUNT(*) AS open_count FROM fetch_audit \
                 WHERE success_datetime IS NULL GROUP BY status_initially",
            ))
            .await?;
        let mut counts = BTreeMap::new();
        for row in rows {
            let kind: FailureKind = text(&row, "status_initially")?.parse()?;
            let open = row.get("open_count").and_then(Value::as_u64).unwrap_or(0);
            counts.insert(kind, open);
        }
        Ok(counts)
    }

    /// Total number of open records.
    pub async fn count_open(&self) -> MirrorResult<u64> {
        Ok(self.open_counts().await?.values().sum())
    }

    async fn fetch(&self, statement: &Statement) -> MirrorResult<Vec<FetchAuditRecord>> {
        self.store
            .query(statement)
            .await?
            .iter()
            .map(row_to_record)
            .collect()
    }
}

fn text<'a>(row: &'a Record, column: &str) -> MirrorResult<&'a str> {
    row.get(column)
        .and_then(Value::as_str)
        .ok_or_else(|| MirrorError::invalid_state(format!("fetch_audit.{column} is not text")))
}

fn row_to_record(row: &Record) -> MirrorResult<FetchAuditRecord> {
    let id = row
        .get("id")
        .and_then(Value::as_i64)
        .ok_or_else(|| MirrorError::invalid_state("fetch_audit.id is not an integer"))?;
    let success_datetime = match row.get("success_datetime") {
        Some(Value::String(ts)) => Some(parse_timestamp(ts)?),
        _ => None,
    };
    Ok(FetchAuditRecord {
        id,
        table: text(row, "table_name")?.to_string(),
        primary_key: text(row, "primary_key")?.to_string(),
        status_initially: text(row, "status_initially")?.parse()?,
        comment: row
            .get("comment")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        created_at: parse_timestamp(text(row, "created_at")?)?,
        success_datetime,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::SqliteStore;
    use chrono::TimeZone;
    use tempfile::NamedTempFile;
    use vocabmirror_core::{DatabaseConfig, MirrorConfig};

    async fn audit() -> (FetchAuditLog, NamedTempFile) {
        let tmp = NamedTempFile::new().unwrap();
        let config = DatabaseConfig {
            url: format!("sqlite://{}", tmp.path().display()),
            ..DatabaseConfig::default()
        };
        let store: Arc<dyn BackingStore> = Arc::new(SqliteStore::connect(&config).await.unwrap());
        crate::schema::bootstrap(store.as_ref(), &MirrorConfig::default())
            .await
            .unwrap();
        (FetchAuditLog::new(store), tmp)
    }

    fn failure(pk: &str, kind: FailureKind) -> KnownFailure {
        KnownFailure {
            table: "code_sets".into(),
            primary_key: pk.into(),
            kind,
            comment: "truncated".into(),
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn duplicate_open_failure_is_not_recorded_twice() {
        let (audit, _tmp) = audit().await;
        assert!(audit.record(&failure("1", FailureKind::ZeroMembers), t0()).await.unwrap());
        assert!(!audit.record(&failure("1", FailureKind::ZeroMembers), t0()).await.unwrap());
        assert!(audit.record(&failure("1", FailureKind::ExcessiveItems), t0()).await.unwrap());
        assert_eq!(audit.count_open().await.unwrap(), 2);

        let open = audit.open_failures(None).await.unwrap();
        audit.mark_resolved(&[open[0].id], t0()).await.unwrap();
        // Once closed, a recurrence opens a new record.
        assert!(audit.record(&failure("1", FailureKind::ZeroMembers), t0()).await.unwrap());
        assert_eq!(audit.all().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn open_failures_filter_by_kind() {
        let (audit, _tmp) = audit().await;
        audit.record(&failure("1", FailureKind::ZeroMembers), t0()).await.unwrap();
        audit.record(&failure("2", FailureKind::ExcessiveMembers), t0()).await.unwrap();

        let members = audit
            .open_failures(Some(&[FailureKind::ExcessiveMembers]))
            .await
            .unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].primary_key, "2");
        assert_eq!(members[0].comment, "truncated");
        assert!(members[0].is_open());
        assert!(audit.open_failures(Some(&[])).await.unwrap().is_empty());

        let counts = audit.open_counts().await.unwrap();
        assert_eq!(counts.get(&FailureKind::ZeroMembers), Some(&1));
    }

    #[tokio::test]
    async fn resolving_a_closed_record_is_a_no_op() {
        let (audit, _tmp) = audit().await;
        audit.record(&failure("9", FailureKind::ExcessiveMembers), t0()).await.unwrap();
        let id = audit.open_failures(None).await.unwrap()[0].id;

        let first = t0() + chrono::Duration::hours(1);
        assert_eq!(audit.mark_resolved(&[id], first).await.unwrap(), 1);
        let closed = audit.get(id).await.unwrap().unwrap();
        assert_eq!(closed.success_datetime, Some(first));

        let second = first + chrono::Duration::hours(1);
        assert_eq!(audit.mark_resolved(&[id], second).await.unwrap(), 0);
        assert_eq!(audit.get(id).await.unwrap().unwrap(), closed);
        assert_eq!(audit.count_open().await.unwrap(), 0);
    }
}
