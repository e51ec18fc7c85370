//! Single-flight refresh coordinator.
//!
//! A refresh request computes its fetch window, then competes for the gate in
//! `manage` (`refresh_status`). The winner runs a cycle: fetch, rebuild stale
//! derived tables, resolve open fetch failures, record the outcome, release the
//! gate. A loser leaves `new_request_while_refreshing` behind and returns
//! [`RefreshOutcome::AlreadyRunning`]; the winner checks that signal after every
//! cycle and runs a follow-up cycle while it is set.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;
use vocabmirror_core::types::keys;
use vocabmirror_core::{
    format_timestamp, BackingStore, Clock, DependencyGraph, FailureKind, MirrorConfig,
    MirrorError, MirrorResult, UpstreamClient,
};
use vocabmirror_observability::{record_refresh_failure, record_refresh_latency};
use vocabmirror_sql::{CheckpointedDdlRunner, FetchAuditLog, StatusStore};

use crate::fetcher::{FetchPlan, IncrementalFetcher, RefreshRequest};
use crate::rebuild::RebuildPlanner;
use crate::resolver::{FetchFailureResolver, ResolutionReport};

/// What one cycle did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    /// Id of the cycle's tracing span.
    pub run_id: Uuid,
    /// Window or bulk load the cycle fetched.
    pub plan: FetchPlan,
    /// Rows written per base table.
    pub rows: BTreeMap<String, usize>,
    /// Known failures newly recorded.
    pub failures_recorded: usize,
    /// Derived tables rebuilt, in rebuild order.
    pub tables_rebuilt: Vec<String>,
    /// Failure resolution pass run at the end of the cycle.
    pub resolution: ResolutionReport,
}

/// Cycles run by one `run_refresh` call.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RefreshReport {
    /// Successful cycles, oldest first; the last one is the final cycle.
    pub cycles: Vec<CycleReport>,
    /// Messages of failed cycles that were followed by another cycle.
    pub earlier_errors: Vec<String>,
}

impl RefreshReport {
    /// The final cycle.
    pub fn last_cycle(&self) -> Option<&CycleReport> {
        self.cycles.last()
    }
}

/// Result of a refresh request that did not fail.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "report", rename_all = "snake_case")]
pub enum RefreshOutcome {
    /// This call held the gate and its final cycle succeeded.
    Completed(RefreshReport),
    /// Another caller holds the gate; it will run a follow-up cycle.
    AlreadyRunning,
}

impl RefreshOutcome {
    /// Whether the request was queued behind a running cycle.
    pub fn is_already_running(&self) -> bool {
        matches!(self, RefreshOutcome::AlreadyRunning)
    }

    /// Report of a completed request.
    pub fn report(&self) -> Option<&RefreshReport> {
        match self {
            RefreshOutcome::Completed(report) => Some(report),
            RefreshOutcome::AlreadyRunning => None,
        }
    }
}

/// Result of an operator-triggered bulk reload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReloadReport {
    /// Reloaded base table.
    pub table: String,
    /// Rows loaded.
    pub rows: usize,
    /// Derived tables rebuilt afterwards.
    pub tables_rebuilt: Vec<String>,
    /// Refresh requested while the reload held the gate, run right after it.
    pub follow_up: Option<RefreshOutcome>,
}

/// Owns the refresh components and runs cycles under the single-flight gate.
pub struct RefreshCoordinator {
    config: Arc<MirrorConfig>,
    graph: Arc<DependencyGraph>,
    store: Arc<dyn BackingStore>,
    status: StatusStore,
    audit: FetchAuditLog,
    fetcher: IncrementalFetcher,
    planner: RebuildPlanner,
    runner: CheckpointedDdlRunner,
    resolver: FetchFailureResolver,
    clock: Arc<dyn Clock>,
}

impl RefreshCoordinator {
    /// Wires the engine together.
    ///
    /// # Errors
    ///
    /// Rejected configuration, including `CycleDetected` for cyclic derived tables.
    pub fn new(
        config: MirrorConfig,
        store: Arc<dyn BackingStore>,
        client: Arc<dyn UpstreamClient>,
        clock: Arc<dyn Clock>,
    ) -> MirrorResult<Self> {
        config.validate()?;
        let graph = Arc::new(config.dependency_graph()?);
        let config = Arc::new(config);
        let status = StatusStore::new(store.clone());
        let audit = FetchAuditLog::new(store.clone());
        let fetcher = IncrementalFetcher::new(
            config.clone(),
            store.clone(),
            status.clone(),
            audit.clone(),
            client.clone(),
        );
        let planner = RebuildPlanner::new(config.clone(), graph.clone(), status.clone());
        let runner = CheckpointedDdlRunner::new(store.clone(), status.clone());
        let resolver = FetchFailureResolver::new(
            config.clone(),
            store.clone(),
            status.clone(),
            audit.clone(),
            client,
        );
        Ok(Self {
            config,
            graph,
            store,
            status,
            audit,
            fetcher,
            planner,
            runner,
            resolver,
            clock,
        })
    }

    /// Configuration the engine runs with.
    pub fn config(&self) -> &MirrorConfig {
        &self.config
    }

    /// Dependency graph of base and derived tables.
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Backing store.
    pub fn store(&self) -> &Arc<dyn BackingStore> {
        &self.store
    }

    /// `manage` variables.
    pub fn status(&self) -> &StatusStore {
        &self.status
    }

    /// Fetch audit log.
    pub fn audit(&self) -> &FetchAuditLog {
        &self.audit
    }

    /// Failure resolver, including its export cache.
    pub fn resolver(&self) -> &FetchFailureResolver {
        &self.resolver
    }

    /// Runs a refresh, or queues one behind the cycle currently running.
    ///
    /// The window is validated before the gate is touched, so a rejected
    /// request (`GapWouldForm`) writes nothing. The error of a failed final
    /// cycle is returned after the outcome was recorded in `manage`.
    pub async fn run_refresh(&self, request: RefreshRequest) -> MirrorResult<RefreshOutcome> {
        let stale_after = self.config.refresh.stale_active_after();
        let mut now = self.clock.now();
        let mut plan = self.fetcher.compute_window(&request, now).await?;

        if !self.status.try_activate(now, stale_after).await? {
            let token = pending_token(now);
            self.status
                .set(keys::NEW_REQUEST_WHILE_REFRESHING, &token)
                .await?;
            // The holder may have released between the two checks and missed the signal.
            if !self.status.try_activate(now, stale_after).await? {
                info!("refresh already running; follow-up cycle requested");
                return Ok(RefreshOutcome::AlreadyRunning);
            }
            // Another caller may have replaced the signal meanwhile; theirs must survive.
            self.status
                .delete_if(keys::NEW_REQUEST_WHILE_REFRESHING, &token)
                .await?;
        }

        let mut report = RefreshReport::default();
        let mut request = request;
        loop {
            let result = self.run_cycle(&plan, now).await;

            if self
                .status
                .take(keys::NEW_REQUEST_WHILE_REFRESHING)
                .await?
                .is_none()
            {
                return finish(report, result);
            }

            request = request.follow_up();
            now = self.clock.now();
            plan = match self.fetcher.compute_window(&request, now).await {
                Ok(plan) => plan,
                Err(err) => {
                    error!(error = %err, "unable to plan follow-up cycle; request kept pending");
                    self.status
                        .set(keys::NEW_REQUEST_WHILE_REFRESHING, &pending_token(now))
                        .await?;
                    return finish(report, result);
                }
            };
            if !self.status.try_activate(now, stale_after).await? {
                info!("another caller took over the follow-up cycle");
                return finish(report, result);
            }
            info!("request arrived during the cycle; running follow-up cycle");
            match result {
                Ok(cycle) => report.cycles.push(cycle),
                Err(err) => report.earlier_errors.push(err.to_string()),
            }
        }
    }

    async fn run_cycle(&self, plan: &FetchPlan, now: DateTime<Utc>) -> MirrorResult<CycleReport> {
        let run_id = Uuid::new_v4();
        let span = info_span!("refresh_cycle", %run_id);
        async move {
            let started = Instant::now();
            info!(plan = ?plan, "refresh cycle started");

            let result = match self.execute_cycle(run_id, plan, now).await {
                Ok(cycle) => {
                    let until = format_timestamp(plan.until());
                    self.status
                        .set_many(&[
                            (keys::LAST_REFRESH_SUCCESS, until),
                            (keys::LAST_REFRESH_RESULT, keys::RESULT_SUCCESS.to_string()),
                        ])
                        .await
                        .map(|()| cycle)
                }
                Err(err) => Err(err),
            };

            match &result {
                Ok(cycle) => {
                    record_refresh_latency(run_id, started.elapsed(), cycle.tables_rebuilt.len());
                    info!(
                        tables = cycle.rows.len(),
                        rebuilt = cycle.tables_rebuilt.len(),
                        failures_recorded = cycle.failures_recorded,
                        "refresh cycle completed"
                    );
                }
                Err(err) => {
                    error!(error = %err, "refresh cycle failed");
                    record_refresh_failure(run_id, &err.to_string());
                    if let Err(state_err) = self
                        .status
                        .set_many(&[
                            (keys::LAST_REFRESH_RESULT, keys::RESULT_ERROR.to_string()),
                            (keys::LAST_REFRESH_ERROR_MESSAGE, err.to_string()),
                        ])
                        .await
                    {
                        error!(error = %state_err, "failed to record refresh failure");
                    }
                }
            }

            let released = self.release().await;
            match (result, released) {
                (Ok(cycle), Ok(())) => Ok(cycle),
                (Err(err), released) => {
                    if let Err(release_err) = released {
                        error!(error = %release_err, "failed to release refresh gate");
                    }
                    Err(err)
                }
                (Ok(_), Err(release_err)) => Err(release_err),
            }
        }
        .instrument(span)
        .await
    }

    async fn execute_cycle(
        &self,
        run_id: Uuid,
        plan: &FetchPlan,
        now: DateTime<Utc>,
    ) -> MirrorResult<CycleReport> {
        self.status
            .set_timestamp(keys::LAST_REFRESH_REQUEST, now)
            .await?;

        let fetched = self.fetcher.fetch(plan, now).await?;
        let rebuild = self
            .planner
            .rebuild(&self.runner, &fetched.tables_written(), now)
            .await?;
        let mut tables_rebuilt = rebuild.tables_rebuilt;

        let resolved_at = self.clock.now();
        let resolution = self
            .resolver
            .resolve_open_failures(None, resolved_at)
            .await?;
        if !resolution.tables_written.is_empty() {
            let again = self
                .planner
                .rebuild(&self.runner, &resolution.tables_written, resolved_at)
                .await?;
            for table in again.tables_rebuilt {
                if !tables_rebuilt.contains(&table) {
                    tables_rebuilt.push(table);
                }
            }
        }

        Ok(CycleReport {
            run_id,
            plan: *plan,
            rows: fetched.rows,
            failures_recorded: fetched.failures_recorded,
            tables_rebuilt,
            resolution,
        })
    }

    async fn release(&self) -> MirrorResult<()> {
        let exited = format_timestamp(self.clock.now());
        self.status
            .set_many(&[
                (keys::REFRESH_STATUS, keys::STATUS_INACTIVE.to_string()),
                (keys::LAST_REFRESH_EXITED, exited),
            ])
            .await
    }

    /// Runs a resolution pass outside a refresh cycle.
    ///
    /// Backfilled tables are stamped stale; the next cycle rebuilds their
    /// dependents.
    pub async fn resolve(&self, kinds: Option<&[FailureKind]>) -> MirrorResult<ResolutionReport> {
        self.resolver
            .resolve_open_failures(kinds, self.clock.now())
            .await
    }

    /// Bulk-replaces one base table and rebuilds its dependents.
    ///
    /// Runs under the refresh gate; returns `None` if a cycle is running. A
    /// refresh requested meanwhile runs once the gate is released, whether or
    /// not the reload succeeded.
    pub async fn reload_table(&self, name: &str) -> MirrorResult<Option<ReloadReport>> {
        let spec = self
            .config
            .base_table(name)
            .ok_or_else(|| MirrorError::config(format!("'{name}' is not a mirrored base table")))?;
        let now = self.clock.now();
        if !self
            .status
            .try_activate(now, self.config.refresh.stale_active_after())
            .await?
        {
            warn!(table = name, "refresh running; reload not started");
            return Ok(None);
        }

        let span = info_span!("table_reload", table = name);
        let result = async {
            self.status
                .set_timestamp(keys::LAST_REFRESH_REQUEST, now)
                .await?;
            let rows = self.fetcher.reload_table(spec, now).await?;
            let written = BTreeSet::from([spec.name.clone()]);
            let rebuild = self.planner.rebuild(&self.runner, &written, now).await?;
            Ok::<_, MirrorError>(ReloadReport {
                table: spec.name.clone(),
                rows,
                tables_rebuilt: rebuild.tables_rebuilt,
                follow_up: None,
            })
        }
        .instrument(span)
        .await;

        if let Err(err) = &result {
            error!(table = name, error = %err, "table reload failed");
        }
        self.release().await?;
        let follow_up = self.run_requested_refresh().await;
        let mut report = result?;
        report.follow_up = follow_up;
        Ok(Some(report))
    }

    /// Runs the refresh a caller queued while a reload held the gate.
    async fn run_requested_refresh(&self) -> Option<RefreshOutcome> {
        match self.status.take(keys::NEW_REQUEST_WHILE_REFRESHING).await {
            Ok(Some(_)) => {}
            Ok(None) => return None,
            Err(err) => {
                error!(error = %err, "failed to read pending refresh request");
                return None;
            }
        }
        info!("refresh requested during the reload; running it now");
        match self.run_refresh(RefreshRequest::default()).await {
            Ok(outcome) => Some(outcome),
            Err(err) => {
                error!(error = %err, "requested refresh failed");
                None
            }
        }
    }
}

/// Value of the pending-request signal; unique per caller.
fn pending_token(now: DateTime<Utc>) -> String {
    format!("{} {}", format_timestamp(now), Uuid::new_v4())
}

fn finish(
    mut report: RefreshReport,
    result: MirrorResult<CycleReport>,
) -> MirrorResult<RefreshOutcome> {
    let cycle = result?;
    report.cycles.push(cycle);
    Ok(RefreshOutcome::Completed(report))
}
