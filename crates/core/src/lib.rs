//! vocabmirror-core
//!
//! Domain types, configuration, and the collaborator traits of the vocabulary
//! mirror refresh engine.

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod graph;
pub mod mocks;
pub mod traits;
pub mod types;

pub use config::{
    BaseTableSpec, DatabaseConfig, DerivedTableSpec, MirrorConfig, RefreshConfig, RegistryConfig,
    ResolverConfig, RESERVED_TABLES,
};
pub use error::{MirrorError, MirrorResult};
pub use graph::{DependencyGraph, DependentTree};
pub use traits::{BackingStore, Clock, SystemClock, UpstreamClient};
pub use types::{
    format_timestamp, keys, parse_timestamp, quote_ident, validate_identifier, ChangeBatch,
    FailureKind, FetchAuditRecord, FetchOutcome, FetchWindow, KnownFailure, Record, Statement,
};
