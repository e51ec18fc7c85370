//! Checkpointed execution of rendered rebuild scripts.
//!
//! A job is an ordered list of [`DdlStep`]s rendered once per run. Progress is
//! persisted in `manage` after every step as a one-based position:
//!
//! * `last_step_<job>`: steps `1..=n` are applied, resume at `n + 1`
//! * `last_step_<job>_digest`: SHA-256 of the script the position refers to
//! * `last_step_<job>_at`: when the run that wrote the position started
//! * `last_completed_<job>`: when the job last ran to completion
//!
//! A failing step leaves the position before it, so the next run retries that
//! step and everything after it and never repeats an applied step. A stored
//! digest that does not match the new script discards the position.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};
use vocabmirror_core::types::keys;
use vocabmirror_core::{format_timestamp, BackingStore, MirrorError, MirrorResult, Statement};
use vocabmirror_observability::record_ddl_step;

use crate::status::StatusStore;
use crate::swap::AtomicTableSwapper;

/// One checkpointed unit of a rebuild script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DdlStep {
    /// Statements applied in one transaction.
    Statements(Vec<Statement>),
    /// Atomic swap of `<table>_new` under `table`, then index creation.
    SwapIn {
        /// Live table name.
        table: String,
        /// Index column lists rebuilt on the swapped-in table.
        indexes: Vec<Vec<String>>,
    },
}

impl DdlStep {
    /// Step made of a single statement.
    pub fn statement(statement: Statement) -> Self {
        DdlStep::Statements(vec![statement])
    }

    fn describe(&self) -> String {
        match self {
            DdlStep::Statements(statements) => statements
                .first()
                .map(|s| s.sql.split_whitespace().take(6).collect::<Vec<_>>().join(" "))
                .unwrap_or_default(),
            DdlStep::SwapIn { table, .. } => format!("swap in {table}"),
        }
    }
}

/// SHA-256 of the serialized script.
pub fn script_digest(steps: &[DdlStep]) -> MirrorResult<String> {
    let encoded = serde_json::to_vec(steps)?;
    Ok(hex::encode(Sha256::digest(&encoded)))
}

/// What a runner invocation did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DdlRunSummary {
    /// Job name.
    pub job: String,
    /// Steps in the script.
    pub total_steps: usize,
    /// Position the run started from (0 = beginning).
    pub resumed_from: usize,
    /// One-based positions executed by this run.
    pub executed: Vec<usize>,
}

/// Runs rebuild scripts with a persisted checkpoint.
#[derive(Clone)]
pub struct CheckpointedDdlRunner {
    store: Arc<dyn BackingStore>,
    status: StatusStore,
    swapper: AtomicTableSwapper,
}

impl CheckpointedDdlRunner {
    /// Create a runner persisting its checkpoints through `status`.
    pub fn new(store: Arc<dyn BackingStore>, status: StatusStore) -> Self {
        let swapper = AtomicTableSwapper::new(store.clone());
        Self {
            store,
            status,
            swapper,
        }
    }

    /// Persisted checkpoint of `job`.
    pub async fn checkpoint(&self, job: &str) -> MirrorResult<usize> {
        Ok(self
            .status
            .get_u64(&keys::last_step(job))
            .await?
            .map(|n| n as usize)
            .unwrap_or(0))
    }

    /// Start time of the run that wrote the checkpoint of `job`.
    pub async fn checkpoint_at(&self, job: &str) -> MirrorResult<Option<DateTime<Utc>>> {
        self.status.get_timestamp(&keys::last_step_at(job)).await
    }

    /// Position a run of `steps` would resume from: the persisted checkpoint,
    /// or 0 when it belongs to a different script.
    pub async fn resume_point(&self, job: &str, steps: &[DdlStep]) -> MirrorResult<usize> {
        let position = self.checkpoint(job).await?;
        if position == 0 {
            return Ok(0);
        }
        let digest = script_digest(steps)?;
        let stored_digest = self.status.get(&keys::last_step_digest(job)).await?;
        if stored_digest.as_deref() != Some(digest.as_str()) {
            warn!(job, checkpoint = position, "script changed since checkpoint; restarting job");
            return Ok(0);
        }
        if position > steps.len() {
            warn!(job, checkpoint = position, steps = steps.len(), "checkpoint beyond script; restarting job");
            return Ok(0);
        }
        Ok(position)
    }

    /// Forgets the checkpoint of `job`; the next run starts at the first step.
    pub async fn discard_checkpoint(&self, job: &str) -> MirrorResult<()> {
        self.status.set(&keys::last_step(job), "0").await
    }

    /// Runs `steps` for `job`, resuming after the persisted checkpoint.
    ///
    /// # Errors
    ///
    /// `DdlStep` with the one-based position of the failing step; the checkpoint
    /// then points at the step before it.
    pub async fn run(
        &self,
        job: &str,
        steps: &[DdlStep],
        now: DateTime<Utc>,
    ) -> MirrorResult<DdlRunSummary> {
        let step_key = keys::last_step(job);
        let digest_key = keys::last_step_digest(job);
        let at_key = keys::last_step_at(job);
        let digest = script_digest(steps)?;

        let position = self.resume_point(job, steps).await?;
        self.status
            .set_many(&[
                (step_key.as_str(), position.to_string()),
                (digest_key.as_str(), digest),
                (at_key.as_str(), format_timestamp(now)),
            ])
            .await?;
        if position > 0 {
            info!(job, resume_at = position + 1, steps = steps.len(), "resuming ddl job");
        }

        let mut executed = Vec::new();
        for (idx, step) in steps.iter().enumerate().skip(position) {
            let n = idx + 1;
            debug!(job, step = n, of = steps.len(), what = %step.describe(), "ddl step");
            match self.execute_step(step).await {
                Ok(()) => {
                    record_ddl_step(job, n, true);
                    self.status.set(&step_key, &n.to_string()).await?;
                    executed.push(n);
                }
                Err(err) => {
                    record_ddl_step(job, n, false);
                    if let Err(persist_err) = self.status.set(&step_key, &(n - 1).to_string()).await {
                        error!(job, step = n, error = %persist_err, "failed to persist ddl checkpoint");
                    }
                    return Err(MirrorError::DdlStep {
                        job: job.to_string(),
                        step: n,
                        message: err.to_string(),
                    });
                }
            }
        }

        let completed_key = keys::last_completed(job);
        self.status
            .set_many(&[
                (step_key.as_str(), "0".to_string()),
                (completed_key.as_str(), format_timestamp(now)),
            ])
            .await?;
        info!(job, executed = executed.len(), steps = steps.len(), "ddl job completed");
        Ok(DdlRunSummary {
            job: job.to_string(),
            total_steps: steps.len(),
            resumed_from: position,
            executed,
        })
    }

    async fn execute_step(&self, step: &DdlStep) -> MirrorResult<()> {
        match step {
            DdlStep::Statements(statements) if self.store.transactional_ddl() => {
                self.store.execute_all(statements).await.map(|_| ())
            }
            DdlStep::Statements(statements) => {
                for statement in statements {
                    self.store.execute(statement).await?;
                }
                Ok(())
            }
            DdlStep::SwapIn { table, indexes } => self.swapper.swap_in(table, indexes).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_tracks_script_content() {
        let a = vec![DdlStep::statement(Statement::new("CREATE TABLE a (x)"))];
        let b = vec![DdlStep::statement(Statement::new("CREATE TABLE b (x)"))];
        assert_eq!(script_digest(&a).unwrap(), script_digest(&a.clone()).unwrap());
        assert_ne!(script_digest(&a).unwrap(), script_digest(&b).unwrap());
        assert_eq!(script_digest(&a).unwrap().len(), 64);
    }

    #[test]
    fn steps_describe_themselves() {
        let swap = DdlStep::SwapIn {
            table: "counts".into(),
            indexes: Vec::new(),
        };
        assert_eq!(swap.describe(), "swap in counts");
        let create = DdlStep::statement(Statement::new("CREATE TABLE counts_new AS SELECT 1"));
        assert_eq!(create.describe(), "CREATE TABLE counts_new AS SELECT 1");
    }
}
