//! Schema bootstrap and DDL rendering helpers.

use tracing::info;
use vocabmirror_core::{
    quote_ident, BackingStore, BaseTableSpec, MirrorConfig, MirrorResult, Statement,
};

const CREATE_MANAGE: &str = r#"CREATE TABLE IF NOT EXISTS manage (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )"#;

const CREATE_FETCH_AUDIT: &str = r#"CREATE TABLE IF NOT EXISTS fetch_audit (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        table_name TEXT NOT NULL,
        primary_key TEXT NOT NULL,
        status_initially TEXT NOT NULL,
        comment TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL,
        success_datetime TEXT
    )"#;

const CREATE_FETCH_AUDIT_INDEX: &str = "CREATE INDEX IF NOT EXISTS idx_fetch_audit_open \
     ON fetch_audit (table_name, status_initially, success_datetime)";

/// Creates the bookkeeping tables and every configured base table.
///
/// Idempotent; existing tables are left as they are.
pub async fn bootstrap(store: &dyn BackingStore, config: &MirrorConfig) -> MirrorResult<()> {
    let mut statements = vec![
        Statement::new(CREATE_MANAGE),
        Statement::new(CREATE_FETCH_AUDIT),
        Statement::new(CREATE_FETCH_AUDIT_INDEX),
    ];
    for table in &config.tables {
        statements.push(create_table(&table.name, &table.columns, true)?);
        for columns in base_table_indexes(table) {
            statements.push(create_index(&table.name, &columns, true)?);
        }
    }
    store.execute_all(&statements).await?;
    info!(
        dialect = store.dialect(),
        base_tables = config.tables.len(),
        "mirror schema bootstrapped"
    );
    Ok(())
}

/// Indexes of a base table: the merge key first, then the configured ones.
pub fn base_table_indexes(table: &BaseTableSpec) -> Vec<Vec<String>> {
    let mut indexes = vec![vec![table.key_column.clone()]];
    for columns in &table.indexes {
        if !indexes.contains(columns) {
            indexes.push(columns.clone());
        }
    }
    indexes
}

/// `CREATE TABLE` with untyped columns; values keep the storage class they arrive with.
pub fn create_table(table: &str, columns: &[String], if_not_exists: bool) -> MirrorResult<Statement> {
    let columns = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<MirrorResult<Vec<_>>>()?;
    Ok(Statement::new(format!(
        "CREATE TABLE {}{} ({})",
        if if_not_exists { "IF NOT EXISTS " } else { "" },
        quote_ident(table)?,
        columns.join(", ")
    )))
}

/// Name of the index on `columns` of `table`.
///
/// Index names are global in SQLite, so the name is derived from the live table
/// name and the index is created only after a swap has freed it.
pub fn index_name(table: &str, columns: &[String]) -> String {
    format!("idx_{}_{}", table, columns.join("_"))
}

/// `CREATE INDEX` on `columns` of `table`.
pub fn create_index(table: &str, columns: &[String], if_not_exists: bool) -> MirrorResult<Statement> {
    let quoted = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<MirrorResult<Vec<_>>>()?;
    Ok(Statement::new(format!(
        "CREATE INDEX {}{} ON {} ({})",
        if if_not_exists { "IF NOT EXISTS " } else { "" },
        quote_ident(&index_name(table, columns))?,
        quote_ident(table)?,
        quoted.join(", ")
    )))
}
