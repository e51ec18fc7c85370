//! Fetch window computation and population of base tables.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use vocabmirror_core::types::keys;
use vocabmirror_core::{
    BackingStore, BaseTableSpec, FetchWindow, MirrorConfig, MirrorError, MirrorResult,
    UpstreamClient,
};
use vocabmirror_observability::{record_known_failure, record_rows_fetched};
use vocabmirror_sql::{
    base_table_indexes, create_table, insert_statements, merge_statements, AtomicTableSwapper,
    FetchAuditLog, StatusStore,
};

/// Parameters of a refresh request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshRequest {
    /// Explicit lower bound; defaults to `last_refresh_success`.
    pub since: Option<DateTime<Utc>>,
    /// Accept a `since` newer than the last successful refresh.
    pub force_non_contiguity: bool,
    /// Look-back subtracted from the lower bound; defaults to configuration.
    pub buffer_hours: Option<u32>,
    /// Bulk-load every base table instead of fetching incrementally.
    pub full_reload: bool,
}

impl RefreshRequest {
    /// Request for the cycle run after a queued request: no explicit `since`,
    /// same buffer.
    pub fn follow_up(&self) -> Self {
        Self {
            since: None,
            force_non_contiguity: false,
            buffer_hours: self.buffer_hours,
            full_reload: false,
        }
    }
}

/// What a cycle fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FetchPlan {
    /// Changes in a window from the incremental channel.
    Incremental(FetchWindow),
    /// Every base table from the bulk export channel.
    BulkLoad {
        /// Reference point recorded as `last_refresh_success` on success.
        until: DateTime<Utc>,
    },
}

impl FetchPlan {
    /// Upper bound of the cycle; becomes the next cycle's reference point.
    pub fn until(&self) -> DateTime<Utc> {
        match self {
            FetchPlan::Incremental(window) => window.until,
            FetchPlan::BulkLoad { until } => *until,
        }
    }
}

/// Rows and failures written by one fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FetchSummary {
    /// Rows written per base table.
    pub rows: BTreeMap<String, usize>,
    /// Known failures newly recorded in the audit log.
    pub failures_recorded: usize,
    /// Known failures reported by the registry, including ones already open.
    pub failures_seen: usize,
}

impl FetchSummary {
    /// Tables written by the fetch.
    pub fn tables_written(&self) -> BTreeSet<String> {
        self.rows.keys().cloned().collect()
    }
}

/// Computes fetch windows and writes fetched data into base tables.
#[derive(Clone)]
pub struct IncrementalFetcher {
    config: Arc<MirrorConfig>,
    store: Arc<dyn BackingStore>,
    status: StatusStore,
    audit: FetchAuditLog,
    swapper: AtomicTableSwapper,
    client: Arc<dyn UpstreamClient>,
}

impl IncrementalFetcher {
    /// Create a fetcher.
    pub fn new(
        config: Arc<MirrorConfig>,
        store: Arc<dyn BackingStore>,
        status: StatusStore,
        audit: FetchAuditLog,
        client: Arc<dyn UpstreamClient>,
    ) -> Self {
        let swapper = AtomicTableSwapper::new(store.clone());
        Self {
            config,
            store,
            status,
            audit,
            swapper,
            client,
        }
    }

    /// Decides what a cycle started at `now` fetches. Reads only.
    ///
    /// # Errors
    ///
    /// `GapWouldForm` when `since` is newer than the last successful refresh and
    /// `force_non_contiguity` is not set.
    pub async fn compute_window(
        &self,
        request: &RefreshRequest,
        now: DateTime<Utc>,
    ) -> MirrorResult<FetchPlan> {
        let until = now + self.config.refresh.end_time_offset();
        if request.full_reload {
            return Ok(FetchPlan::BulkLoad { until });
        }
        let last_success = self.status.get_timestamp(keys::LAST_REFRESH_SUCCESS).await?;
        let lower = match (request.since, last_success) {
            (Some(since), Some(last_success))
                if since > last_success && !request.force_non_contiguity =>
            {
                return Err(MirrorError::GapWouldForm {
                    since,
                    last_success,
                });
            }
            (Some(since), Some(last_success)) if since > last_success => {
                warn!(%since, %last_success, "forcing non-contiguous refresh window");
                since
            }
            (Some(since), _) => since,
            (None, Some(last_success)) => last_success,
            (None, None) => {
                info!("no previous successful refresh; bulk loading base tables");
                return Ok(FetchPlan::BulkLoad { until });
            }
        };
        let buffer_hours = request
            .buffer_hours
            .unwrap_or(self.config.refresh.buffer_hours);
        let since = lower - Duration::hours(i64::from(buffer_hours));
        debug!(%since, %until, buffer_hours, "computed fetch window");
        Ok(FetchPlan::Incremental(FetchWindow { since, until }))
    }

    /// Executes a plan.
    pub async fn fetch(&self, plan: &FetchPlan, now: DateTime<Utc>) -> MirrorResult<FetchSummary> {
        match plan {
            FetchPlan::Incremental(window) => self.fetch_window(window, now).await,
            FetchPlan::BulkLoad { .. } => self.bulk_load(now).await,
        }
    }

    /// Merges every change in `window` into the base tables and records known
    /// failures in the audit log.
    pub async fn fetch_window(
        &self,
        window: &FetchWindow,
        now: DateTime<Utc>,
    ) -> MirrorResult<FetchSummary> {
        let batch = self.client.fetch_changes(window.since, window.until).await?;
        let (records, failures) = batch.partition();
        let mut summary = FetchSummary::default();

        for (table, rows) in records {
            let Some(spec) = self.config.base_table(&table) else {
                warn!(table = %table, rows = rows.len(), "registry returned rows for an unmirrored table");
                continue;
            };
            let statements = merge_statements(spec, &rows)?;
            if statements.is_empty() {
                continue;
            }
            self.store.execute_all(&statements).await?;
            self.status
                .set_timestamp(&keys::last_updated(&spec.name), now)
                .await?;
            record_rows_fetched(&spec.name, rows.len());
            summary.rows.insert(spec.name.clone(), rows.len());
        }

        summary.failures_seen = failures.len();
        for failure in &failures {
            if self.audit.record(failure, now).await? {
                record_known_failure(&failure.table, &failure.primary_key, failure.kind.as_str());
                summary.failures_recorded += 1;
            }
        }
        info!(
            since = %window.since,
            until = %window.until,
            tables = summary.rows.len(),
            failures = summary.failures_seen,
            "incremental fetch applied"
        );
        Ok(summary)
    }

    /// Replaces every base table from its bulk export.
    pub async fn bulk_load(&self, now: DateTime<Utc>) -> MirrorResult<FetchSummary> {
        let mut summary = FetchSummary::default();
        for spec in &self.config.tables {
            let rows = self.reload_table(spec, now).await?;
            summary.rows.insert(spec.name.clone(), rows);
        }
        Ok(summary)
    }

    /// Replaces one base table from its bulk export without exposing a partial table.
    pub async fn reload_table(&self, spec: &BaseTableSpec, now: DateTime<Utc>) -> MirrorResult<usize> {
        let dataset = spec.dataset().to_string();
        let client = self.client.clone();
        let store = self.store.clone();
        let columns = spec.columns.clone();

        let rows = self
            .swapper
            .replace_table(&spec.name, &base_table_indexes(spec), move |staging| async move {
                let rows = client.fetch_bulk_export(&dataset).await?;
                let mut statements = vec![create_table(&staging, &columns, false)?];
                statements.extend(insert_statements(&staging, &columns, &rows)?);
                store.execute_all(&statements).await?;
                Ok(rows.len())
            })
            .await?;

        self.status
            .set_timestamp(&keys::last_updated(&spec.name), now)
            .await?;
        record_rows_fetched(&spec.name, rows);
        info!(table = %spec.name, dataset = spec.dataset(), rows, "base table reloaded");
        Ok(rows)
    }
}
