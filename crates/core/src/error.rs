//! Error types for the refresh engine.
//!
//! This module defines the single error taxonomy shared by every vocabmirror crate:
//!
//! **Caller and configuration errors** (never retried):
//! - `GapWouldForm`: an explicit `since` would leave an interval nobody fetches
//! - `CycleDetected`: derived-table dependencies are not acyclic
//! - `Config` / `InvalidIdentifier`: rejected configuration
//!
//! **Collaborator errors:**
//! - `UpstreamTransient`: network or rate-limit failure after the client exhausted its retries
//! - `Upstream`: any other registry failure
//! - `Database`: a statement issued to the backing store failed
//!
//! **Engine errors:**
//! - `DdlStep`: a rebuild statement failed; the checkpoint still points before it
//! - `InvalidState`: persisted state could not be interpreted
//!
//! Per-record fetch failures with a known signature are deliberately absent: they are
//! data (`FetchOutcome::KnownFailure`), not errors.

use chrono::{DateTime, Utc};
use std::io;
use thiserror::Error;

/// Errors surfaced by the refresh engine and its collaborators.
#[derive(Debug, Error)]
pub enum MirrorError {
    /// An explicit `since` newer than the last successful refresh would skip data.
    #[error(
        "refreshing since {since} would leave a gap after the last successful refresh at \
         {last_success}; pass force_non_contiguity to override"
    )]
    GapWouldForm {
        /// Requested lower bound.
        since: DateTime<Utc>,
        /// Recorded `last_refresh_success`.
        last_success: DateTime<Utc>,
    },

    /// Derived-table dependencies contain a cycle.
    #[error("dependency cycle detected: {}", cycle.join(" -> "))]
    CycleDetected {
        /// Tables participating in (or blocked by) the cycle.
        cycle: Vec<String>,
    },

    /// Network or rate-limit failure reported after retries were exhausted.
    #[error("upstream registry unavailable: {0}")]
    UpstreamTransient(String),

    /// Non-retryable failure reported by the upstream registry.
    #[error("upstream registry error: {0}")]
    Upstream(String),

    /// A rebuild statement failed; the job checkpoint was left before it.
    #[error("ddl job '{job}' failed at step {step}: {message}")]
    DdlStep {
        /// Job name (checkpoint key suffix).
        job: String,
        /// One-based step index that failed.
        step: usize,
        /// Underlying failure.
        message: String,
    },

    /// Backing store failure.
    #[error("database error: {0}")]
    Database(String),

    /// Rejected configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A table or column name that is not a plain SQL identifier.
    #[error("invalid identifier '{0}'")]
    InvalidIdentifier(String),

    /// Persisted state could not be interpreted.
    #[error("invalid mirror state: {0}")]
    InvalidState(String),

    /// JSON encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem failure (configuration files).
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Result alias used across the workspace.
pub type MirrorResult<T> = Result<T, MirrorError>;

impl MirrorError {
    /// Create a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database(message.into())
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create an invalid state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    /// Whether a later attempt of the same operation may succeed.
    ///
    /// Only upstream transport failures qualify. The engine itself never retries;
    /// callers (the scheduler) use this to decide whether to alert or just wait.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::UpstreamTransient(_))
    }
}

impl From<toml::de::Error> for MirrorError {
    fn from(value: toml::de::Error) -> Self {
        Self::Config(value.to_string())
    }
}
