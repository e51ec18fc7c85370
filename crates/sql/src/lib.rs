//! vocabmirror-sql
//!
//! SQLite backing store and the durable state the refresh engine keeps in it.

#![warn(missing_docs)]

/// Append-mostly fetch failure log.
pub mod audit;
/// Checkpointed rebuild script runner.
pub mod ddl;
/// Row merge rendering for base tables.
pub mod rows;
/// Schema bootstrap and DDL helpers.
pub mod schema;
/// SQLite-backed `BackingStore`.
pub mod sqlite;
/// `manage` key/value variables and the single-flight gate.
pub mod status;
/// Build-alongside-then-swap table replacement.
pub mod swap;

pub use audit::FetchAuditLog;
pub use ddl::{script_digest, CheckpointedDdlRunner, DdlRunSummary, DdlStep};
pub use rows::{insert_statement, insert_statements, merge_statements};
pub use schema::{base_table_indexes, bootstrap, create_index, create_table, index_name};
pub use sqlite::SqliteStore;
pub use status::StatusStore;
pub use swap::{retired_name, staging_name, AtomicTableSwapper};
