//! Configuration for the mirror: database, registry, refresh policy, and the
//! static table layout the dependency graph is built from.
//!
//! ## Precedence (highest to lowest)
//!
//! 1. Environment variables (`VOCABMIRROR_*`)
//! 2. Config file (TOML)
//! 3. Hardcoded defaults

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{MirrorError, MirrorResult};
use crate::graph::DependencyGraph;
use crate::types::{validate_identifier, FailureKind};

/// Overrides `database.url`.
pub const ENV_DATABASE_URL: &str = "VOCABMIRROR_DATABASE_URL";
/// Overrides `registry.base_url`.
pub const ENV_REGISTRY_URL: &str = "VOCABMIRROR_REGISTRY_URL";
/// Overrides `registry.token`.
pub const ENV_REGISTRY_TOKEN: &str = "VOCABMIRROR_REGISTRY_TOKEN";
/// Overrides `refresh.buffer_hours`.
pub const ENV_BUFFER_HOURS: &str = "VOCABMIRROR_BUFFER_HOURS";

/// Bookkeeping tables created next to the mirrored ones.
pub const RESERVED_TABLES: &[&str] = &["manage", "fetch_audit"];

/// Suffixes of the sibling tables a swap builds and retires.
const SWAP_SUFFIXES: &[&str] = &["_new", "_old"];

fn check_table_name(name: &str) -> MirrorResult<()> {
    validate_identifier(name)?;
    if RESERVED_TABLES.contains(&name) {
        return Err(MirrorError::config(format!(
            "table name '{name}' is reserved for bookkeeping"
        )));
    }
    if let Some(suffix) = SWAP_SUFFIXES.iter().find(|suffix| name.ends_with(*suffix)) {
        return Err(MirrorError::config(format!(
            "table name '{name}' ends in '{suffix}', which table swaps use"
        )));
    }
    Ok(())
}

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    /// `[database]`
    pub database: DatabaseConfig,
    /// `[registry]`
    pub registry: RegistryConfig,
    /// `[refresh]`
    pub refresh: RefreshConfig,
    /// `[resolver]`
    pub resolver: ResolverConfig,
    /// `[[tables]]`: base tables mirrored from upstream.
    pub tables: Vec<BaseTableSpec>,
    /// `[[derived]]`: tables computed from other tables.
    pub derived: Vec<DerivedTableSpec>,
}

/// Backing store connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Connection URL (`sqlite://path/to/mirror.db`).
    pub url: String,
    /// Maximum pool size.
    pub max_connections: u32,
    /// Seconds to wait for a pooled connection.
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://vocabmirror.db".to_string(),
            max_connections: 5,
            acquire_timeout_secs: 30,
        }
    }
}

/// Upstream registry client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// API root; `/changes` and `/exports/{dataset}` are resolved against it.
    pub base_url: String,
    /// Bearer token.
    pub token: Option<String>,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    /// Retries after the first attempt for 429/5xx/transport failures.
    pub max_retries: u32,
    /// First backoff delay.
    pub initial_backoff_ms: u64,
    /// Backoff ceiling.
    pub max_backoff_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api".to_string(),
            token: None,
            timeout_secs: 60,
            max_retries: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
        }
    }
}

/// Refresh cycle policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    /// Default look-back subtracted from the window's lower bound.
    pub buffer_hours: u32,
    /// Forward offset added to "now" to form the window's upper bound.
    pub end_time_offset_secs: u64,
    /// Age after which an `active` flag is considered abandoned by a crashed process.
    pub stale_active_after_secs: u64,
    /// Cadence of the polling service.
    pub poll_interval_secs: u64,
    /// DDL job name for derived-table rebuilds.
    pub derived_job: String,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            buffer_hours: 2,
            end_time_offset_secs: 1,
            stale_active_after_secs: 6 * 60 * 60,
            poll_interval_secs: 60 * 60,
            derived_job: "derived_tables".to_string(),
        }
    }
}

impl RefreshConfig {
    /// Offset added to "now" for the window's upper bound.
    pub fn end_time_offset(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.end_time_offset_secs).unwrap_or(i64::MAX))
    }

    /// Age after which an `active` flag may be taken over.
    pub fn stale_active_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.stale_active_after_secs).unwrap_or(i64::MAX))
    }

    /// Polling cadence.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Failure resolution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Bulk exports younger than this are reused.
    pub export_max_age_secs: u64,
    /// Bulk export dataset each failure kind is repaired from, keyed by the
    /// kind's storage form (`fail-0-members`, ...).
    pub datasets: BTreeMap<String, String>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        let datasets = [
            (FailureKind::ZeroMembers, "concept_set_members"),
            (FailureKind::ExcessiveItems, "concept_set_version_item"),
            (FailureKind::ExcessiveMembers, "concept_set_members"),
        ]
        .into_iter()
        .map(|(kind, dataset)| (kind.as_str().to_string(), dataset.to_string()))
        .collect();
        Self {
            export_max_age_secs: 24 * 60 * 60,
            datasets,
        }
    }
}

impl ResolverConfig {
    /// Maximum age of a reusable bulk export.
    pub fn export_max_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.export_max_age_secs).unwrap_or(i64::MAX))
    }

    /// Dataset failures of `kind` are repaired from, if configured.
    pub fn dataset_for(&self, kind: FailureKind) -> Option<&str> {
        self.datasets.get(kind.as_str()).map(String::as_str)
    }
}

/// A base table mirrored from the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseTableSpec {
    /// Table name in the mirror.
    pub name: String,
    /// Column incoming rows are merged on.
    pub key_column: String,
    /// Columns written to the table, in order.
    pub columns: Vec<String>,
    /// Several rows share one key (a code set's members); an incoming batch
    /// replaces the whole group. Otherwise the last record per key wins.
    #[serde(default)]
    pub grouped: bool,
    /// Bulk export dataset; defaults to `name`.
    #[serde(default)]
    pub dataset: Option<String>,
    /// Secondary indexes, one column list each.
    #[serde(default)]
    pub indexes: Vec<Vec<String>>,
}

impl BaseTableSpec {
    /// Bulk export dataset backing this table.
    pub fn dataset(&self) -> &str {
        self.dataset.as_deref().unwrap_or(&self.name)
    }
}

/// A table computed from other tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedTableSpec {
    /// Table name in the mirror.
    pub name: String,
    /// Tables the `select` reads from.
    pub depends_on: Vec<String>,
    /// Query producing the table content.
    pub select: String,
    /// Secondary indexes, one column list each.
    #[serde(default)]
    pub indexes: Vec<Vec<String>>,
}

impl MirrorConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(content: &str) -> MirrorResult<Self> {
        let config: MirrorConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a TOML file, applies environment overrides, and validates.
    pub fn load(path: impl AsRef<Path>) -> MirrorResult<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "loading mirror config");
        let content = std::fs::read_to_string(path)?;
        let mut config: MirrorConfig = toml::from_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Applies `VOCABMIRROR_*` environment variables.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies overrides from an arbitrary lookup (environment in production).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_DATABASE_URL) {
            self.database.url = url;
        }
        if let Some(url) = lookup(ENV_REGISTRY_URL) {
            self.registry.base_url = url;
        }
        if let Some(token) = lookup(ENV_REGISTRY_TOKEN) {
            self.registry.token = Some(token);
        }
        if let Some(hours) = lookup(ENV_BUFFER_HOURS).and_then(|v| v.parse::<u32>().ok()) {
            self.refresh.buffer_hours = hours;
        }
    }

    /// Checks identifiers, reserved and swap-suffixed table names, table
    /// uniqueness, key columns, and acyclicity.
    pub fn validate(&self) -> MirrorResult<()> {
        let mut names = BTreeSet::new();
        for table in &self.tables {
            check_table_name(&table.name)?;
            validate_identifier(&table.key_column)?;
            if table.columns.is_empty() {
                return Err(MirrorError::config(format!(
                    "table '{}' declares no columns",
                    table.name
                )));
            }
            for column in table.columns.iter().chain(table.indexes.iter().flatten()) {
                validate_identifier(column)?;
            }
            if !table.columns.contains(&table.key_column) {
                return Err(MirrorError::config(format!(
                    "key column '{}' of table '{}' is not among its columns",
                    table.key_column, table.name
                )));
            }
            if !names.insert(table.name.as_str()) {
                return Err(MirrorError::config(format!(
                    "table '{}' is declared twice",
                    table.name
                )));
            }
        }
        for derived in &self.derived {
            check_table_name(&derived.name)?;
            for column in derived.indexes.iter().flatten() {
                validate_identifier(column)?;
            }
            for dependency in &derived.depends_on {
                validate_identifier(dependency)?;
            }
            if derived.depends_on.is_empty() {
                return Err(MirrorError::config(format!(
                    "derived table '{}' has no dependencies",
                    derived.name
                )));
            }
            if !names.insert(derived.name.as_str()) {
                return Err(MirrorError::config(format!(
                    "table '{}' is declared twice",
                    derived.name
                )));
            }
        }
        for derived in &self.derived {
            if let Some(unknown) = derived.depends_on.iter().find(|d| !names.contains(d.as_str())) {
                return Err(MirrorError::config(format!(
                    "derived table '{}' depends on undeclared table '{unknown}'",
                    derived.name
                )));
            }
        }
        for kind in self.resolver.datasets.keys() {
            kind.parse::<FailureKind>()
                .map_err(|_| MirrorError::config(format!("unknown failure kind '{kind}'")))?;
        }
        for dataset in self.resolver.datasets.values() {
            if !self.tables.iter().any(|t| t.dataset() == dataset) {
                debug!(dataset, "resolver dataset has no base table; failures of that kind stay open");
            }
        }
        self.dependency_graph().map(|_| ())
    }

    /// Builds the dependency graph of all configured tables.
    pub fn dependency_graph(&self) -> MirrorResult<DependencyGraph> {
        let base = self
            .tables
            .iter()
            .map(|t| (t.name.clone(), Vec::<String>::new()));
        let derived = self
            .derived
            .iter()
            .map(|d| (d.name.clone(), d.depends_on.clone()));
        DependencyGraph::new(base.chain(derived))
    }

    /// Base table by name.
    pub fn base_table(&self, name: &str) -> Option<&BaseTableSpec> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Base table fed by a bulk export dataset.
    pub fn table_for_dataset(&self, dataset: &str) -> Option<&BaseTableSpec> {
        self.tables.iter().find(|t| t.dataset() == dataset)
    }

    /// Derived table by name.
    pub fn derived_table(&self, name: &str) -> Option<&DerivedTableSpec> {
        self.derived.iter().find(|d| d.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    const SAMPLE: &str = r#"
[database]
url = "sqlite:///tmp/mirror.db"

[refresh]
buffer_hours = 4

[resolver.datasets]
"fail-0-members" = "concept_set_members"
"fail-excessive-members" = "concept_set_members"

[[tables]]
name = "code_sets"
key_column = "codeset_id"
columns = ["codeset_id", "concept_set_name"]
indexes = [["concept_set_name"]]

[[tables]]
name = "concept_set_members"
key_column = "codeset_id"
columns = ["codeset_id", "concept_id"]
grouped = true

[[derived]]
name = "members_per_codeset"
depends_on = ["concept_set_members"]
select = "SELECT codeset_id, COUNT(*) AS n FROM concept_set_members GROUP BY codeset_id"
indexes = [["codeset_id"]]
"#;

    #[test]
    fn parses_sample_with_defaults() {
        let config = MirrorConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.database.url, "sqlite:///tmp/mirror.db");
        assert_eq!(config.database.max_connections, 5);
        assert_eq!(config.refresh.buffer_hours, 4);
        assert_eq!(config.refresh.end_time_offset_secs, 1);
        assert_eq!(config.tables.len(), 2);
        assert_eq!(config.tables[0].dataset(), "code_sets");
        assert_eq!(
            config.resolver.dataset_for(FailureKind::ZeroMembers),
            Some("concept_set_members")
        );
        assert_eq!(config.resolver.dataset_for(FailureKind::ExcessiveItems), None);
        assert_eq!(
            MirrorConfig::default().resolver.dataset_for(FailureKind::ExcessiveItems),
            Some("concept_set_version_item")
        );
        let graph = config.dependency_graph().unwrap();
        assert_eq!(
            graph.stale_closure(["concept_set_members"]),
            vec!["concept_set_members", "members_per_codeset"]
        );
    }

    #[test]
    fn env_overrides_take_precedence() {
        let mut config = MirrorConfig::from_toml_str(SAMPLE).unwrap();
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_DATABASE_URL, "sqlite:///var/lib/mirror.db"),
            (ENV_REGISTRY_TOKEN, "secret"),
            (ENV_BUFFER_HOURS, "not-a-number"),
        ]);
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.database.url, "sqlite:///var/lib/mirror.db");
        assert_eq!(config.registry.token.as_deref(), Some("secret"));
        assert_eq!(config.refresh.buffer_hours, 4);
    }

    #[test]
    fn rejects_cyclic_derived_tables() {
        let doc = r#"
[[derived]]
name = "a"
depends_on = ["b"]
select = "SELECT 1"

[[derived]]
name = "b"
depends_on = ["a"]
select = "SELECT 1"
"#;
        assert!(matches!(
            MirrorConfig::from_toml_str(doc),
            Err(MirrorError::CycleDetected { .. })
        ));
    }

    #[test]
    fn rejects_dependency_on_undeclared_table() {
        let doc = r#"
[[derived]]
name = "counts"
depends_on = ["members"]
select = "SELECT 1"
"#;
        let err = MirrorConfig::from_toml_str(doc).unwrap_err();
        assert!(err.to_string().contains("undeclared table 'members'"));
    }

    #[test]
    fn rejects_reserved_and_swap_suffixed_names() {
        for name in ["manage", "fetch_audit", "code_sets_new", "code_sets_old"] {
            let doc = format!(
                r#"
[[tables]]
name = "{name}"
key_column = "id"
columns = ["id"]
"#
            );
            assert!(
                matches!(MirrorConfig::from_toml_str(&doc), Err(MirrorError::Config(_))),
                "{name} accepted"
            );
        }
        let derived = r#"
[[tables]]
name = "members"
key_column = "id"
columns = ["id"]

[[derived]]
name = "counts_old"
depends_on = ["members"]
select = "SELECT 1"
"#;
        let err = MirrorConfig::from_toml_str(derived).unwrap_err();
        assert!(err.to_string().contains("counts_old"));
    }

    #[test]
    fn rejects_unknown_failure_kind() {
        let doc = r#"
[resolver.datasets]
"fail-sometimes" = "concept_set_members"
"#;
        assert!(matches!(
            MirrorConfig::from_toml_str(doc),
            Err(MirrorError::Config(_))
        ));
    }

    #[test]
    fn rejects_key_column_outside_columns() {
        let doc = r#"
[[tables]]
name = "code_sets"
key_column = "id"
columns = ["codeset_id"]
"#;
        assert!(matches!(
            MirrorConfig::from_toml_str(doc),
            Err(MirrorError::Config(_))
        ));
    }

    #[test]
    fn rejects_unsafe_identifiers() {
        let doc = r#"
[[tables]]
name = "code sets; DROP TABLE manage"
key_column = "id"
columns = ["id"]
"#;
        assert!(matches!(
            MirrorConfig::from_toml_str(doc),
            Err(MirrorError::InvalidIdentifier(_))
        ));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = MirrorConfig::load(file.path()).unwrap();
        assert_eq!(config.derived[0].name, "members_per_codeset");
    }
}
