use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

static CYCLES_COMPLETED_TOTAL: AtomicU64 = AtomicU64::new(0);
static CYCLE_FAILURES_TOTAL: AtomicU64 = AtomicU64::new(0);
static ROWS_FETCHED_TOTAL: AtomicU64 = AtomicU64::new(0);
static KNOWN_FAILURES_TOTAL: AtomicU64 = AtomicU64::new(0);
static DDL_STEP_FAILURES_TOTAL: AtomicU64 = AtomicU64::new(0);
static TABLE_SWAPS_TOTAL: AtomicU64 = AtomicU64::new(0);
static RESOLVED_TOTAL: AtomicU64 = AtomicU64::new(0);
static OPEN_FAILURES: AtomicU64 = AtomicU64::new(0);

/// Process-wide totals, as reported by `status`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Totals {
    /// Refresh cycles that finished successfully.
    pub cycles_completed: u64,
    /// Refresh cycles that finished with an error.
    pub cycle_failures: u64,
    /// Rows merged from the incremental channel.
    pub rows_fetched: u64,
    /// Known per-record failures recorded in the audit log.
    pub known_failures: u64,
    /// DDL steps that failed.
    pub ddl_step_failures: u64,
    /// Tables swapped in.
    pub table_swaps: u64,
    /// Audit records closed by the resolver.
    pub resolved: u64,
    /// Last observed number of open audit records.
    pub open_failures: u64,
}

/// Reads the current totals.
pub fn totals() -> Totals {
    Totals {
        cycles_completed: CYCLES_COMPLETED_TOTAL.load(Ordering::Relaxed),
        cycle_failures: CYCLE_FAILURES_TOTAL.load(Ordering::Relaxed),
        rows_fetched: ROWS_FETCHED_TOTAL.load(Ordering::Relaxed),
        known_failures: KNOWN_FAILURES_TOTAL.load(Ordering::Relaxed),
        ddl_step_failures: DDL_STEP_FAILURES_TOTAL.load(Ordering::Relaxed),
        table_swaps: TABLE_SWAPS_TOTAL.load(Ordering::Relaxed),
        resolved: RESOLVED_TOTAL.load(Ordering::Relaxed),
        open_failures: OPEN_FAILURES.load(Ordering::Relaxed),
    }
}

fn duration_ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

/// Records refresh cycle latency and increments the completed cycles counter.
pub fn record_refresh_latency(run_id: Uuid, duration: Duration, tables_rebuilt: usize) {
    let total = CYCLES_COMPLETED_TOTAL.fetch_add(1, Ordering::Relaxed) + 1;
    info!(
        metric = "refresh_latency_ms",
        run_id = %run_id,
        latency_ms = duration_ms(duration),
        tables_rebuilt,
        cycles_completed_total = total
    );
}

/// Marks a refresh cycle failure for observability logs.
pub fn record_refresh_failure(run_id: Uuid, error: &str) {
    let total = CYCLE_FAILURES_TOTAL.fetch_add(1, Ordering::Relaxed) + 1;
    warn!(
        metric = "refresh_failure",
        run_id = %run_id,
        error,
        cycle_failures_total = total
    );
}

/// Records rows merged into a base table.
pub fn record_rows_fetched(table: &str, rows: usize) {
    let total = ROWS_FETCHED_TOTAL.fetch_add(rows as u64, Ordering::Relaxed) + rows as u64;
    info!(metric = "rows_fetched", table, rows, rows_fetched_total = total);
}

/// Records a known per-record failure written to the audit log.
pub fn record_known_failure(table: &str, primary_key: &str, kind: &str) {
    let total = KNOWN_FAILURES_TOTAL.fetch_add(1, Ordering::Relaxed) + 1;
    warn!(
        metric = "known_failure",
        table,
        primary_key,
        kind,
        known_failures_total = total
    );
}

/// Records the outcome of one DDL step.
pub fn record_ddl_step(job: &str, step: usize, ok: bool) {
    if ok {
        debug!(metric = "ddl_step", job, step, ok);
    } else {
        let total = DDL_STEP_FAILURES_TOTAL.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(metric = "ddl_step", job, step, ok, ddl_step_failures_total = total);
    }
}

/// Records a table swapped in under its live name.
pub fn record_table_swap(table: &str, transactional: bool) {
    let total = TABLE_SWAPS_TOTAL.fetch_add(1, Ordering::Relaxed) + 1;
    info!(
        metric = "table_swap",
        table,
        transactional,
        table_swaps_total = total
    );
}

/// Records the result of a failure resolution pass.
pub fn record_resolution(resolved: usize, still_open: usize) {
    let total = RESOLVED_TOTAL.fetch_add(resolved as u64, Ordering::Relaxed) + resolved as u64;
    info!(
        metric = "failure_resolution",
        resolved,
        still_open,
        resolved_total = total
    );
}

/// Sets the open audit records gauge and logs the change.
pub fn set_open_failures(open: u64) {
    OPEN_FAILURES.store(open, Ordering::Relaxed);
    info!(metric = "open_failures_gauge", open);
}
