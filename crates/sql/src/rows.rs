//! Rendering of row writes for base tables.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;
use tracing::{debug, warn};
use vocabmirror_core::types::key_string;
use vocabmirror_core::{quote_ident, BaseTableSpec, MirrorResult, Record, Statement};

/// Keys per `DELETE ... IN (...)`, well below SQLite's parameter limit.
const DELETE_CHUNK: usize = 500;

/// `INSERT` of one record, writing only `columns`; absent fields become NULL.
pub fn insert_statement(table: &str, columns: &[String], record: &Record) -> MirrorResult<Statement> {
    let quoted = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<MirrorResult<Vec<_>>>()?;
    let mut statement = Statement::new(format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(table)?,
        quoted.join(", "),
        vec!["?"; columns.len()].join(", ")
    ));
    for column in columns {
        statement = statement.bind(record.get(column).cloned().unwrap_or(Value::Null));
    }
    Ok(statement)
}

/// Inserts of `records` into `table` (typically a `_new` staging table).
pub fn insert_statements(
    table: &str,
    columns: &[String],
    records: &[Record],
) -> MirrorResult<Vec<Statement>> {
    records
        .iter()
        .map(|record| insert_statement(table, columns, record))
        .collect()
}

/// Statements merging `records` into a base table by its key column.
///
/// Every row carrying an incoming key is deleted, then the incoming rows are
/// inserted. For a `grouped` table the key identifies the group of rows one
/// upstream record replaces (a code set's members share its id) and all incoming
/// rows are kept; otherwise the last record per key wins. Run them through
/// `execute_all` so readers see either the old or the new rows. Records without
/// a key are skipped.
pub fn merge_statements(table: &BaseTableSpec, records: &[Record]) -> MirrorResult<Vec<Statement>> {
    let mut keys: BTreeMap<String, Value> = BTreeMap::new();
    let mut rows: Vec<(String, &Record)> = Vec::with_capacity(records.len());
    for record in records {
        let Some(value) = record.get(&table.key_column) else {
            continue;
        };
        if let Some(key) = key_string(value) {
            keys.entry(key.clone()).or_insert_with(|| value.clone());
            rows.push((key, record));
        }
    }
    let skipped = records.len() - rows.len();
    if skipped > 0 {
        warn!(table = %table.name, skipped, "records without key column skipped");
    }
    if !table.grouped {
        let mut last = BTreeMap::new();
        for (idx, (key, _)) in rows.iter().enumerate() {
            last.insert(key.clone(), idx);
        }
        let keep: BTreeSet<usize> = last.into_values().collect();
        let superseded = rows.len() - keep.len();
        if superseded > 0 {
            debug!(table = %table.name, superseded, "records superseded by a later one with the same key");
        }
        rows = rows
            .into_iter()
            .enumerate()
            .filter(|(idx, _)| keep.contains(idx))
            .map(|(_, row)| row)
            .collect();
    }
    if rows.is_empty() {
        return Ok(Vec::new());
    }

    let name = quote_ident(&table.name)?;
    let key = quote_ident(&table.key_column)?;
    let keys: Vec<Value> = keys.into_values().collect();
    let mut statements = Vec::new();
    for chunk in keys.chunks(DELETE_CHUNK) {
        let mut delete = Statement::new(format!(
            "DELETE FROM {name} WHERE {key} IN ({})",
            vec!["?"; chunk.len()].join(", ")
        ));
        for value in chunk {
            delete = delete.bind(value.clone());
        }
        statements.push(delete);
    }
    for (_, record) in rows {
        statements.push(insert_statement(&table.name, &table.columns, record)?);
    }
    Ok(statements)
}
