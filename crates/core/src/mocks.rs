//! Mock implementations of traits for testing.

use crate::error::{MirrorError, MirrorResult};
use crate::traits::{Clock, UpstreamClient};
use crate::types::{ChangeBatch, Record};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Scripted upstream registry.
///
/// `fetch_changes` pops scripted batches in order and returns an empty batch once
/// the script runs out. Every call's window is recorded.
#[derive(Default)]
pub struct MockUpstreamClient {
    batches: Mutex<VecDeque<MirrorResult<ChangeBatch>>>,
    exports: Mutex<HashMap<String, Vec<Record>>>,
    failing_exports: Mutex<HashMap<String, String>>,
    calls: Mutex<Vec<(DateTime<Utc>, DateTime<Utc>)>>,
    export_calls: Mutex<Vec<String>>,
    hold: Mutex<Option<Arc<Notify>>>,
    entered: Notify,
}

impl MockUpstreamClient {
    /// Create a new mock client with an empty script.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a batch for the next `fetch_changes` call.
    pub fn push_batch(&self, batch: ChangeBatch) {
        self.batches.lock().unwrap().push_back(Ok(batch));
    }

    /// Queue an error for the next `fetch_changes` call.
    pub fn push_error(&self, error: MirrorError) {
        self.batches.lock().unwrap().push_back(Err(error));
    }

    /// Serve `rows` for bulk exports of `dataset`.
    pub fn set_export(&self, dataset: &str, rows: Vec<Record>) {
        self.exports.lock().unwrap().insert(dataset.to_string(), rows);
    }

    /// Make bulk exports of `dataset` fail with an upstream error.
    pub fn fail_export(&self, dataset: &str, message: &str) {
        self.failing_exports
            .lock()
            .unwrap()
            .insert(dataset.to_string(), message.to_string());
    }

    /// Windows passed to `fetch_changes`, in call order.
    pub fn calls(&self) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
        self.calls.lock().unwrap().clone()
    }

    /// Datasets passed to `fetch_bulk_export`, in call order.
    pub fn export_calls(&self) -> Vec<String> {
        self.export_calls.lock().unwrap().clone()
    }

    /// Block `fetch_changes` calls until [`release`](Self::release) is called.
    pub fn hold_fetches(&self) {
        *self.hold.lock().unwrap() = Some(Arc::new(Notify::new()));
    }

    /// Unblock a held fetch; later fetches no longer block.
    pub fn release(&self) {
        if let Some(gate) = self.hold.lock().unwrap().take() {
            gate.notify_one();
        }
    }

    /// Resolves once a `fetch_changes` call has started.
    pub async fn fetch_started(&self) {
        self.entered.notified().await;
    }
}

#[async_trait::async_trait]
impl UpstreamClient for MockUpstreamClient {
    async fn fetch_changes(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> MirrorResult<ChangeBatch> {
        self.calls.lock().unwrap().push((since, until));
        self.entered.notify_one();
        let gate = self.hold.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.batches
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(ChangeBatch::default()))
    }

    async fn fetch_bulk_export(&self, dataset: &str) -> MirrorResult<Vec<Record>> {
        self.export_calls.lock().unwrap().push(dataset.to_string());
        if let Some(message) = self.failing_exports.lock().unwrap().get(dataset) {
            return Err(MirrorError::Upstream(message.clone()));
        }
        Ok(self
            .exports
            .lock()
            .unwrap()
            .get(dataset)
            .cloned()
            .unwrap_or_default())
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a clock frozen at `now`.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Jump to `now`.
    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }

    /// Move forward by `by`.
    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}
