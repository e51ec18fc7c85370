//! Derived-table rebuild planning.
//!
//! Stale tables are the ones written in the current cycle plus any table whose
//! `last_updated_<table>` is newer than the last completed rebuild job. Their
//! closure under the dependency graph is rendered into a checkpointed script:
//! for each derived table, one step builds `<table>_new` from its select and a
//! second step swaps it in.
//!
//! A failed job resumes at its checkpoint only while the inputs of the steps
//! before it are unchanged; a table written after the checkpointed run started
//! that feeds one of those steps restarts the job from the first step.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use vocabmirror_core::types::keys;
use vocabmirror_core::{
    format_timestamp, quote_ident, DependencyGraph, MirrorConfig, MirrorResult, Statement,
};
use vocabmirror_sql::{staging_name, CheckpointedDdlRunner, DdlRunSummary, DdlStep, StatusStore};

/// Rendered rebuild of a set of stale tables.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RebuildPlan {
    /// Stale tables in rebuild order, base tables included.
    pub closure: Vec<String>,
    /// Derived tables the script rebuilds, in order.
    pub derived: Vec<String>,
    /// The script.
    pub steps: Vec<DdlStep>,
    /// Derived table each step builds, parallel to `steps`.
    pub step_tables: Vec<String>,
}

/// Result of running a rebuild.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RebuildSummary {
    /// Derived tables rebuilt.
    pub tables_rebuilt: Vec<String>,
    /// Runner outcome.
    pub ddl: DdlRunSummary,
}

/// Plans and runs derived-table rebuilds.
#[derive(Clone)]
pub struct RebuildPlanner {
    config: Arc<MirrorConfig>,
    graph: Arc<DependencyGraph>,
    status: StatusStore,
}

impl RebuildPlanner {
    /// Create a planner over a validated configuration.
    pub fn new(config: Arc<MirrorConfig>, graph: Arc<DependencyGraph>, status: StatusStore) -> Self {
        Self {
            config,
            graph,
            status,
        }
    }

    /// DDL job name used for checkpoint keys.
    pub fn job(&self) -> &str {
        &self.config.refresh.derived_job
    }

    /// `written` plus every table updated after the last completed rebuild.
    pub async fn changed_tables(&self, written: &BTreeSet<String>) -> MirrorResult<BTreeSet<String>> {
        let completed = self
            .status
            .get_timestamp(&keys::last_completed(self.job()))
            .await?;
        let mut changed = written.clone();
        for table in self.graph.tables() {
            if changed.contains(table) {
                continue;
            }
            let updated = self.status.get_timestamp(&keys::last_updated(table)).await?;
            let stale = match (updated, completed) {
                (Some(updated), Some(completed)) => updated > completed,
                (Some(_), None) => true,
                (None, _) => false,
            };
            if stale {
                debug!(table, "table left stale by an earlier cycle");
                changed.insert(table.to_string());
            }
        }
        Ok(changed)
    }

    /// Renders the rebuild script for `changed`.
    pub fn plan(&self, changed: &BTreeSet<String>) -> MirrorResult<RebuildPlan> {
        let closure = self.graph.stale_closure(changed);
        let mut derived = Vec::new();
        let mut steps = Vec::new();
        let mut step_tables = Vec::new();
        for table in &closure {
            let Some(spec) = self.config.derived_table(table) else {
                continue;
            };
            let staging = quote_ident(&staging_name(&spec.name))?;
            steps.push(DdlStep::Statements(vec![
                Statement::new(format!("DROP TABLE IF EXISTS {staging}")),
                Statement::new(format!("CREATE TABLE {staging} AS {}", spec.select.trim())),
            ]));
            steps.push(DdlStep::SwapIn {
                table: spec.name.clone(),
                indexes: spec.indexes.clone(),
            });
            step_tables.extend([spec.name.clone(), spec.name.clone()]);
            derived.push(spec.name.clone());
        }
        Ok(RebuildPlan {
            closure,
            derived,
            steps,
            step_tables,
        })
    }

    /// Tables of `changed` written after the checkpointed run started, plus `written`.
    async fn changed_since_checkpoint(
        &self,
        runner: &CheckpointedDdlRunner,
        changed: &BTreeSet<String>,
        written: &BTreeSet<String>,
    ) -> MirrorResult<BTreeSet<String>> {
        let Some(checkpoint_at) = runner.checkpoint_at(self.job()).await? else {
            return Ok(changed.clone());
        };
        let mut fresh = written.clone();
        for table in changed {
            let updated = self.status.get_timestamp(&keys::last_updated(table)).await?;
            if updated.is_some_and(|updated| updated > checkpoint_at) {
                fresh.insert(table.clone());
            }
        }
        Ok(fresh)
    }

    /// Rebuilds everything made stale by `written`, resuming an interrupted job.
    pub async fn rebuild(
        &self,
        runner: &CheckpointedDdlRunner,
        written: &BTreeSet<String>,
        now: DateTime<Utc>,
    ) -> MirrorResult<RebuildSummary> {
        let changed = self.changed_tables(written).await?;
        let plan = self.plan(&changed)?;

        let resume = runner.resume_point(self.job(), &plan.steps).await?;
        if resume > 0 {
            let fresh = self.changed_since_checkpoint(runner, &changed, written).await?;
            let affected: BTreeSet<String> = self.graph.stale_closure(&fresh).into_iter().collect();
            if let Some(table) = plan.step_tables[..resume]
                .iter()
                .find(|table| affected.contains(*table))
            {
                warn!(
                    job = self.job(),
                    table = %table,
                    checkpoint = resume,
                    "inputs changed since checkpoint; rebuilding from the first step"
                );
                runner.discard_checkpoint(self.job()).await?;
            }
        }

        if !plan.derived.is_empty() {
            info!(
                changed = changed.len(),
                derived = ?plan.derived,
                steps = plan.steps.len(),
                "rebuilding derived tables"
            );
        }
        let ddl = runner.run(self.job(), &plan.steps, now).await?;
        if !plan.derived.is_empty() {
            let stamp = format_timestamp(now);
            let updated: Vec<String> = plan.derived.iter().map(|t| keys::last_updated(t)).collect();
            let entries: Vec<(&str, String)> = updated
                .iter()
                .map(|key| (key.as_str(), stamp.clone()))
                .collect();
            self.status.set_many(&entries).await?;
        }
        Ok(RebuildSummary {
            tables_rebuilt: plan.derived,
            ddl,
        })
    }
}
