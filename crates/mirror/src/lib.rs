//! vocabmirror-mirror
//!
//! Refresh engine for the vocabulary mirror: incremental fetch, derived-table
//! rebuilds, fetch failure resolution and the single-flight coordinator.

#![warn(missing_docs)]

/// Single-flight refresh coordinator.
pub mod coordinator;
/// Fetch window computation and base table population.
pub mod fetcher;
/// Derived-table rebuild planning.
pub mod rebuild;
/// Backfill of open fetch failures.
pub mod resolver;
/// Polling refresh service.
pub mod service;
/// HTTP registry client.
pub mod upstream;

pub use coordinator::{CycleReport, RefreshCoordinator, RefreshOutcome, RefreshReport, ReloadReport};
pub use fetcher::{FetchPlan, FetchSummary, IncrementalFetcher, RefreshRequest};
pub use rebuild::{RebuildPlan, RebuildPlanner, RebuildSummary};
pub use resolver::{ExportCache, FetchFailureResolver, ResolutionReport};
pub use service::RefreshService;
pub use upstream::{HttpRegistryClient, RetryPolicy};
