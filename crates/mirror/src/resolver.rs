//! Repair of records the incremental channel could not fetch completely.
//!
//! Open audit records are grouped by the bulk export dataset their failure kind
//! maps to. Each dataset is fetched once (or reused from [`ExportCache`]),
//! filtered down to the open primary keys and merged into the base table fed by
//! that dataset. Only records whose key was found are closed; the rest stay open
//! and are reported.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use vocabmirror_core::types::{key_string, keys};
use vocabmirror_core::{
    BackingStore, FailureKind, FetchAuditRecord, MirrorConfig, MirrorResult, Record,
    UpstreamClient,
};
use vocabmirror_observability::{record_resolution, set_open_failures};
use vocabmirror_sql::{merge_statements, FetchAuditLog, StatusStore};

struct CachedExport {
    fetched_at: DateTime<Utc>,
    rows: Arc<Vec<Record>>,
}

/// In-process cache of bulk exports, keyed by dataset.
#[derive(Default)]
pub struct ExportCache {
    entries: Mutex<HashMap<String, CachedExport>>,
}

impl ExportCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, CachedExport>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Rows of `dataset` if they were fetched less than `max_age` before `now`.
    pub fn get(&self, dataset: &str, now: DateTime<Utc>, max_age: Duration) -> Option<Arc<Vec<Record>>> {
        self.entries()
            .get(dataset)
            .filter(|entry| now - entry.fetched_at < max_age)
            .map(|entry| entry.rows.clone())
    }

    /// Stores a freshly fetched export.
    pub fn insert(&self, dataset: &str, fetched_at: DateTime<Utc>, rows: Vec<Record>) -> Arc<Vec<Record>> {
        let rows = Arc::new(rows);
        self.entries().insert(
            dataset.to_string(),
            CachedExport {
                fetched_at,
                rows: rows.clone(),
            },
        );
        rows
    }

    /// Forgets `dataset`.
    pub fn invalidate(&self, dataset: &str) {
        self.entries().remove(dataset);
    }

    /// Number of cached datasets, fresh or not.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Whether nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

/// Outcome of one resolution pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResolutionReport {
    /// Audit record ids closed by this pass.
    pub resolved: Vec<i64>,
    /// Records that remain open.
    pub still_open: Vec<FetchAuditRecord>,
    /// Datasets or kinds that could not be processed.
    pub errors: Vec<String>,
    /// Base tables rows were merged into.
    pub tables_written: BTreeSet<String>,
}

/// Backfills open fetch failures from the bulk export channel.
#[derive(Clone)]
pub struct FetchFailureResolver {
    config: Arc<MirrorConfig>,
    store: Arc<dyn BackingStore>,
    status: StatusStore,
    audit: FetchAuditLog,
    client: Arc<dyn UpstreamClient>,
    cache: Arc<ExportCache>,
}

impl FetchFailureResolver {
    /// Create a resolver with its own export cache.
    pub fn new(
        config: Arc<MirrorConfig>,
        store: Arc<dyn BackingStore>,
        status: StatusStore,
        audit: FetchAuditLog,
        client: Arc<dyn UpstreamClient>,
    ) -> Self {
        Self {
            config,
            store,
            status,
            audit,
            client,
            cache: Arc::new(ExportCache::new()),
        }
    }

    /// Shared export cache.
    pub fn cache(&self) -> &ExportCache {
        &self.cache
    }

    /// Resolves open failures, optionally only those of `kinds`.
    ///
    /// A dataset that cannot be fetched leaves its records open and is reported
    /// in `errors`; store failures abort the pass.
    pub async fn resolve_open_failures(
        &self,
        kinds: Option<&[FailureKind]>,
        now: DateTime<Utc>,
    ) -> MirrorResult<ResolutionReport> {
        let open = self.audit.open_failures(kinds).await?;
        let mut report = ResolutionReport::default();

        let mut by_dataset: BTreeMap<String, Vec<FetchAuditRecord>> = BTreeMap::new();
        for record in open {
            match self.config.resolver.dataset_for(record.status_initially) {
                Some(dataset) => by_dataset.entry(dataset.to_string()).or_default().push(record),
                None => {
                    warn!(kind = %record.status_initially, id = record.id, "no export dataset configured for failure kind");
                    report
                        .errors
                        .push(format!("no export dataset configured for {}", record.status_initially));
                    report.still_open.push(record);
                }
            }
        }

        for (dataset, records) in by_dataset {
            self.resolve_dataset(&dataset, records, now, &mut report).await?;
        }

        record_resolution(report.resolved.len(), report.still_open.len());
        set_open_failures(self.audit.count_open().await?);
        if !report.resolved.is_empty() || !report.still_open.is_empty() {
            info!(
                resolved = report.resolved.len(),
                still_open = report.still_open.len(),
                errors = report.errors.len(),
                "fetch failures processed"
            );
        }
        Ok(report)
    }

    async fn resolve_dataset(
        &self,
        dataset: &str,
        records: Vec<FetchAuditRecord>,
        now: DateTime<Utc>,
        report: &mut ResolutionReport,
    ) -> MirrorResult<()> {
        let Some(spec) = self.config.table_for_dataset(dataset) else {
            warn!(dataset, open = records.len(), "no base table is fed by export dataset");
            report
                .errors
                .push(format!("no base table is fed by export dataset '{dataset}'"));
            report.still_open.extend(records);
            return Ok(());
        };

        let rows = match self.export(dataset, now).await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(dataset, error = %err, open = records.len(), "bulk export unavailable; failures left open");
                report.errors.push(format!("{dataset}: {err}"));
                report.still_open.extend(records);
                return Ok(());
            }
        };

        let wanted: BTreeSet<&str> = records.iter().map(|r| r.primary_key.as_str()).collect();
        let mut found = BTreeSet::new();
        let mut matched = Vec::new();
        for row in rows.iter() {
            let Some(key) = row.get(&spec.key_column).and_then(key_string) else {
                continue;
            };
            if wanted.contains(key.as_str()) {
                found.insert(key);
                matched.push(row.clone());
            }
        }

        if !matched.is_empty() {
            let statements = merge_statements(spec, &matched)?;
            self.store.execute_all(&statements).await?;
            self.status
                .set_timestamp(&keys::last_updated(&spec.name), now)
                .await?;
            report.tables_written.insert(spec.name.clone());
            debug!(table = %spec.name, rows = matched.len(), "backfilled rows merged");
        }

        let (done, missing): (Vec<_>, Vec<_>) = records
            .into_iter()
            .partition(|record| found.contains(&record.primary_key));
        let ids: Vec<i64> = done.iter().map(|record| record.id).collect();
        self.audit.mark_resolved(&ids, now).await?;
        for record in &missing {
            warn!(
                table = %record.table,
                primary_key = %record.primary_key,
                kind = %record.status_initially,
                dataset,
                "record not found in bulk export; left open"
            );
        }
        report.resolved.extend(ids);
        report.still_open.extend(missing);
        Ok(())
    }

    async fn export(&self, dataset: &str, now: DateTime<Utc>) -> MirrorResult<Arc<Vec<Record>>> {
        let max_age = self.config.resolver.export_max_age();
        if let Some(rows) = self.cache.get(dataset, now, max_age) {
            debug!(dataset, rows = rows.len(), "reusing cached bulk export");
            return Ok(rows);
        }
        let rows = self.client.fetch_bulk_export(dataset).await?;
        info!(dataset, rows = rows.len(), "bulk export fetched");
        Ok(self.cache.insert(dataset, now, rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn cache_entries_expire_after_max_age() {
        let cache = ExportCache::new();
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let row = json!({"codeset_id": 1}).as_object().cloned().unwrap();
        cache.insert("members", t0, vec![row]);

        let max_age = Duration::hours(24);
        assert_eq!(cache.get("members", t0 + Duration::hours(23), max_age).unwrap().len(), 1);
        assert!(cache.get("members", t0 + Duration::hours(24), max_age).is_none());
        assert!(cache.get("items", t0, max_age).is_none());

        cache.invalidate("members");
        assert!(cache.is_empty());
    }
}
