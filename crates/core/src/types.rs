//! Domain types shared by the storage layer and the refresh engine.

use crate::error::{MirrorError, MirrorResult};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// A row as exchanged with the backing store and the upstream registry.
pub type Record = serde_json::Map<String, Value>;

/// A bound statement parameter.
pub type SqlValue = Value;

/// Well-known keys of the `manage` key/value table.
pub mod keys {
    /// `active` while a refresh cycle holds the single-flight gate.
    pub const REFRESH_STATUS: &str = "refresh_status";
    /// When the current (or last) cycle was started.
    pub const LAST_REFRESH_REQUEST: &str = "last_refresh_request";
    /// `end_time` of the last successful cycle; the next cycle's lower bound.
    pub const LAST_REFRESH_SUCCESS: &str = "last_refresh_success";
    /// When the last cycle released the gate.
    pub const LAST_REFRESH_EXITED: &str = "last_refresh_exited";
    /// `success` or `error`.
    pub const LAST_REFRESH_RESULT: &str = "last_refresh_result";
    /// Message of the last failed cycle.
    pub const LAST_REFRESH_ERROR_MESSAGE: &str = "last_refresh_error_message";
    /// Present while a request that arrived mid-cycle waits for a follow-up cycle.
    pub const NEW_REQUEST_WHILE_REFRESHING: &str = "new_request_while_refreshing";

    /// Value of `refresh_status` while a cycle runs.
    pub const STATUS_ACTIVE: &str = "active";
    /// Value of `refresh_status` while idle.
    pub const STATUS_INACTIVE: &str = "inactive";
    /// Value of `last_refresh_result` after a successful cycle.
    pub const RESULT_SUCCESS: &str = "success";
    /// Value of `last_refresh_result` after a failed cycle.
    pub const RESULT_ERROR: &str = "error";

    /// Per-table staleness timestamp.
    pub fn last_updated(table: &str) -> String {
        format!("last_updated_{table}")
    }

    /// DDL checkpoint position of a job.
    pub fn last_step(job: &str) -> String {
        format!("last_step_{job}")
    }

    /// Fingerprint of the script the checkpoint of a job refers to.
    pub fn last_step_digest(job: &str) -> String {
        format!("last_step_{job}_digest")
    }

    /// When the run the checkpoint of a job belongs to started.
    pub fn last_step_at(job: &str) -> String {
        format!("last_step_{job}_at")
    }

    /// Completion timestamp of a job.
    pub fn last_completed(job: &str) -> String {
        format!("last_completed_{job}")
    }
}

/// Formats a timestamp the way `manage` stores it.
///
/// Fixed microsecond precision keeps lexical and chronological order identical,
/// which the single-flight takeover query relies on.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parses a timestamp written by [`format_timestamp`] (or any RFC 3339 value).
pub fn parse_timestamp(value: &str) -> MirrorResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| MirrorError::invalid_state(format!("bad timestamp '{value}': {err}")))
}

/// Known per-record failure signatures reported by the registry client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// The concept set version reported zero members; it is probably too new.
    #[serde(rename = "fail-0-members")]
    ZeroMembers,
    /// The per-object channel truncated the expression items.
    #[serde(rename = "fail-excessive-items")]
    ExcessiveItems,
    /// The per-object channel truncated the member list.
    #[serde(rename = "fail-excessive-members")]
    ExcessiveMembers,
}

impl FailureKind {
    /// All kinds, in storage order.
    pub const ALL: [FailureKind; 3] = [
        FailureKind::ZeroMembers,
        FailureKind::ExcessiveItems,
        FailureKind::ExcessiveMembers,
    ];

    /// Value stored in `fetch_audit.status_initially`.
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::ZeroMembers => "fail-0-members",
            FailureKind::ExcessiveItems => "fail-excessive-items",
            FailureKind::ExcessiveMembers => "fail-excessive-members",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureKind {
    type Err = MirrorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FailureKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| MirrorError::invalid_state(format!("unknown failure kind '{s}'")))
    }
}

/// One row of the fetch audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchAuditRecord {
    /// Surrogate id assigned by the store.
    pub id: i64,
    /// Table the failed record belongs to.
    pub table: String,
    /// Primary key of the failed record.
    pub primary_key: String,
    /// Failure signature observed when the record was first fetched.
    pub status_initially: FailureKind,
    /// Free-form detail from the registry client.
    pub comment: String,
    /// When the failure was recorded.
    pub created_at: DateTime<Utc>,
    /// When a resolution pass backfilled the record; `None` while open.
    pub success_datetime: Option<DateTime<Utc>>,
}

impl FetchAuditRecord {
    /// Whether the record still awaits resolution.
    pub fn is_open(&self) -> bool {
        self.success_datetime.is_none()
    }
}

/// A per-record failure the registry client recognised instead of aborting the batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownFailure {
    /// Table the record belongs to.
    pub table: String,
    /// Primary key of the record.
    pub primary_key: String,
    /// Recognised signature.
    pub kind: FailureKind,
    /// Detail for the audit trail.
    #[serde(default)]
    pub comment: String,
}

/// Result of fetching one record from the incremental channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FetchOutcome {
    /// The record was fetched completely.
    Fetched {
        /// Destination table.
        table: String,
        /// Row content.
        record: Record,
    },
    /// The record matched a known failure signature; the batch continues.
    KnownFailure(KnownFailure),
}

/// Everything the incremental channel returned for one window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeBatch {
    /// Per-record outcomes in upstream order.
    pub outcomes: Vec<FetchOutcome>,
}

impl ChangeBatch {
    /// Splits the outcomes into records grouped by table and the known failures.
    pub fn partition(self) -> (BTreeMap<String, Vec<Record>>, Vec<KnownFailure>) {
        let mut records: BTreeMap<String, Vec<Record>> = BTreeMap::new();
        let mut failures = Vec::new();
        for outcome in self.outcomes {
            match outcome {
                FetchOutcome::Fetched { table, record } => {
                    records.entry(table).or_default().push(record)
                }
                FetchOutcome::KnownFailure(failure) => failures.push(failure),
            }
        }
        (records, failures)
    }
}

/// Half-open interval `[since, until)` requested from the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchWindow {
    /// Inclusive lower bound.
    pub since: DateTime<Utc>,
    /// Exclusive upper bound; becomes the next cycle's `last_refresh_success`.
    pub until: DateTime<Utc>,
}

/// A SQL statement with positional parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    /// SQL text using `?` placeholders.
    pub sql: String,
    /// Parameters in placeholder order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<SqlValue>,
}

impl Statement {
    /// Statement without parameters.
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// Appends a parameter.
    pub fn bind(mut self, value: impl Into<SqlValue>) -> Self {
        self.params.push(value.into());
        self
    }
}

/// Checks that `name` is a plain identifier (`[A-Za-z_][A-Za-z0-9_]*`).
///
/// Table and column names come from configuration and upstream payloads and are
/// interpolated into DDL, so anything else is rejected.
pub fn validate_identifier(name: &str) -> MirrorResult<&str> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if valid {
        Ok(name)
    } else {
        Err(MirrorError::InvalidIdentifier(name.to_string()))
    }
}

/// Double-quotes a validated identifier.
pub fn quote_ident(name: &str) -> MirrorResult<String> {
    validate_identifier(name).map(|name| format!("\"{name}\""))
}

/// Renders a record value as the string form used for primary keys.
pub fn key_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn failure_kind_round_trips_through_storage_form() {
        for kind in FailureKind::ALL {
            assert_eq!(kind.as_str().parse::<FailureKind>().unwrap(), kind);
        }
        assert!("fail-unknown".parse::<FailureKind>().is_err());
    }

    #[test]
    fn failure_kind_serde_uses_wire_names() {
        let encoded = serde_json::to_string(&FailureKind::ZeroMembers).unwrap();
        assert_eq!(encoded, "\"fail-0-members\"");
    }

    #[test]
    fn timestamps_sort_lexically() {
        let early = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();
        let late = early + chrono::Duration::microseconds(1);
        let (a, b) = (format_timestamp(early), format_timestamp(late));
        assert!(a < b);
        assert_eq!(parse_timestamp(&a).unwrap(), early);
    }

    #[test]
    fn change_batch_partitions_by_table() {
        let batch: ChangeBatch = serde_json::from_value(json!({
            "outcomes": [
                {"status": "fetched", "table": "code_sets", "record": {"codeset_id": 1}},
                {"status": "known_failure", "table": "code_sets", "primary_key": "2",
                 "kind": "fail-excessive-members", "comment": "truncated"},
                {"status": "fetched", "table": "code_sets", "record": {"codeset_id": 3}}
            ]
        }))
        .unwrap();
        let (records, failures) = batch.partition();
        assert_eq!(records["code_sets"].len(), 2);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].kind, FailureKind::ExcessiveMembers);
    }

    #[test]
    fn identifiers_are_validated() {
        assert!(validate_identifier("concept_set_members").is_ok());
        assert!(validate_identifier("_tmp1").is_ok());
        assert!(validate_identifier("1abc").is_err());
        assert!(validate_identifier("code sets").is_err());
        assert!(validate_identifier("x\";DROP").is_err());
        assert!(validate_identifier("").is_err());
        assert_eq!(quote_ident("concept").unwrap(), "\"concept\"");
    }

    #[test]
    fn key_string_normalises_numbers() {
        assert_eq!(key_string(&json!(42)), Some("42".to_string()));
        assert_eq!(key_string(&json!("42")), Some("42".to_string()));
        assert_eq!(key_string(&Value::Null), None);
    }
}
