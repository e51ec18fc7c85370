use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::coordinator::{RefreshCoordinator, RefreshOutcome};
use crate::fetcher::RefreshRequest;
use vocabmirror_core::MirrorResult;

/// Background service that requests a refresh on a fixed cadence.
pub struct RefreshService {
    coordinator: Arc<RefreshCoordinator>,
    poll_interval: Duration,
}

impl RefreshService {
    /// Creates a service polling at the configured `poll_interval_secs`.
    pub fn new(coordinator: Arc<RefreshCoordinator>) -> Self {
        let poll_interval = coordinator.config().refresh.poll_interval();
        Self {
            coordinator,
            poll_interval,
        }
    }

    /// Sets the polling interval between refresh requests.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Polling interval.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Requests one incremental refresh with default parameters.
    pub async fn run_once(&self) -> MirrorResult<RefreshOutcome> {
        let outcome = self
            .coordinator
            .run_refresh(RefreshRequest::default())
            .await?;
        match &outcome {
            RefreshOutcome::Completed(report) => debug!(
                cycles = report.cycles.len(),
                earlier_errors = report.earlier_errors.len(),
                "scheduled refresh completed"
            ),
            RefreshOutcome::AlreadyRunning => {
                debug!("scheduled refresh queued behind running cycle")
            }
        }
        Ok(outcome)
    }

    /// Runs refreshes until cancelled. Failed cycles are logged and retried at
    /// the next tick.
    pub async fn run_forever(&self) {
        loop {
            self.tick().await;
            sleep(self.poll_interval).await;
        }
    }

    /// Runs refreshes until `shutdown` resolves. A cycle in progress is finished
    /// before returning.
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(poll_interval_secs = self.poll_interval.as_secs(), "refresh service started");
        loop {
            self.tick().await;
            tokio::select! {
                _ = &mut shutdown => break,
                _ = sleep(self.poll_interval) => {}
            }
        }
        info!("refresh service stopped");
    }

    async fn tick(&self) {
        if let Err(err) = self.run_once().await {
            if err.is_retryable() {
                warn!(error = %err, "scheduled refresh failed; will retry");
            } else {
                error!(error = %err, "scheduled refresh failed");
            }
        }
    }
}
