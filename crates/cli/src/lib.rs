use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tracing::info;
use vocabmirror_core::{
    BackingStore, Clock, DependentTree, FailureKind, MirrorConfig, SystemClock, UpstreamClient,
    RESERVED_TABLES,
};
use vocabmirror_mirror::{
    HttpRegistryClient, RefreshCoordinator, RefreshOutcome, RefreshRequest, RefreshService,
    ReloadReport, ResolutionReport,
};
use vocabmirror_observability::{totals, Totals};
use vocabmirror_sql::{bootstrap, SqliteStore};

/// Installs the `tracing` subscriber; `RUST_LOG` overrides the `info` default.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Reads the configuration file and applies `VOCABMIRROR_*` overrides.
pub fn load_config(path: &Path) -> Result<MirrorConfig> {
    MirrorConfig::load(path).with_context(|| format!("unable to load config {}", path.display()))
}

/// `manage` variables and open audit counts.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    /// Every `manage` variable.
    pub vars: BTreeMap<String, String>,
    /// Open fetch failures per kind.
    pub open_failures: BTreeMap<String, u64>,
    /// Counters of this process since it started.
    pub process_totals: Totals,
}

/// Rebuild order for a set of changed tables.
#[derive(Debug, Serialize)]
pub struct GraphReport {
    /// Changed tables and their dependents, in rebuild order.
    pub stale_closure: Vec<String>,
    /// Dependents of each changed table.
    pub dependents: Vec<DependentTree>,
}

/// A connected engine.
pub struct App {
    coordinator: Arc<RefreshCoordinator>,
}

impl App {
    /// Connects to the configured database and registry, creating the schema
    /// if needed.
    pub async fn connect(config: MirrorConfig) -> Result<Self> {
        let client = HttpRegistryClient::new(&config.registry)?;
        Self::with_client(config, Arc::new(client), Arc::new(SystemClock)).await
    }

    /// Like [`App::connect`] with an explicit registry client and clock.
    pub async fn with_client(
        config: MirrorConfig,
        client: Arc<dyn UpstreamClient>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let store = SqliteStore::connect(&config.database)
            .await
            .with_context(|| format!("unable to open {}", config.database.url))?;
        bootstrap(&store, &config).await?;
        let store: Arc<dyn BackingStore> = Arc::new(store);
        let coordinator = RefreshCoordinator::new(config, store, client, clock)?;
        Ok(Self {
            coordinator: Arc::new(coordinator),
        })
    }

    /// Underlying coordinator.
    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.coordinator
    }

    /// Tables the schema bootstrap manages.
    pub fn managed_tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = RESERVED_TABLES.iter().map(|t| t.to_string()).collect();
        tables.extend(self.coordinator.config().tables.iter().map(|t| t.name.clone()));
        tables
    }

    /// Runs (or queues) a refresh.
    pub async fn refresh(&self, request: RefreshRequest) -> Result<RefreshOutcome> {
        Ok(self.coordinator.run_refresh(request).await?)
    }

    /// Resolves open failures, restricted to `kinds` unless empty.
    pub async fn resolve(&self, kinds: &[FailureKind]) -> Result<ResolutionReport> {
        let filter = (!kinds.is_empty()).then_some(kinds);
        Ok(self.coordinator.resolve(filter).await?)
    }

    /// Bulk-replaces one base table.
    pub async fn reload(&self, table: &str) -> Result<ReloadReport> {
        match self.coordinator.reload_table(table).await? {
            Some(report) => Ok(report),
            None => bail!("a refresh cycle is running; retry the reload once it finished"),
        }
    }

    /// Current `manage` variables and open failure counts.
    pub async fn status(&self) -> Result<StatusReport> {
        let vars = self.coordinator.status().snapshot().await?;
        let open_failures = self
            .coordinator
            .audit()
            .open_counts()
            .await?
            .into_iter()
            .map(|(kind, count)| (kind.as_str().to_string(), count))
            .collect();
        Ok(StatusReport {
            vars,
            open_failures,
            process_totals: totals(),
        })
    }

    /// Rebuild order if `tables` changed.
    pub fn graph(&self, tables: &[String]) -> Result<GraphReport> {
        let graph = self.coordinator.graph();
        for table in tables {
            if !graph.tables().any(|known| known == table) {
                bail!("unknown table '{table}'");
            }
        }
        Ok(GraphReport {
            stale_closure: graph.stale_closure(tables),
            dependents: tables
                .iter()
                .map(|table| graph.recursive_dependents(table))
                .collect(),
        })
    }

    /// Polls for refreshes until `shutdown` resolves.
    pub async fn serve<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let service = RefreshService::new(self.coordinator.clone());
        info!(
            poll_interval_secs = service.poll_interval().as_secs(),
            "serving scheduled refreshes"
        );
        service.run_until(shutdown).await;
    }
}
