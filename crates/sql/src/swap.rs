//! Build-alongside-then-swap replacement of live tables.

use std::future::Future;
use std::sync::Arc;

use tracing::{error, info, warn};
use vocabmirror_core::{
    quote_ident, validate_identifier, BackingStore, MirrorError, MirrorResult, Statement,
};
use vocabmirror_observability::record_table_swap;

use crate::schema::create_index;

/// Name of the staging table built next to `table`.
pub fn staging_name(table: &str) -> String {
    format!("{table}_new")
}

/// Name `table` is moved to while its replacement is renamed in.
pub fn retired_name(table: &str) -> String {
    format!("{table}_old")
}

/// Replaces tables without ever exposing a half-built one under the live name.
#[derive(Clone)]
pub struct AtomicTableSwapper {
    store: Arc<dyn BackingStore>,
}

impl AtomicTableSwapper {
    /// Create a swapper on top of `store`.
    pub fn new(store: Arc<dyn BackingStore>) -> Self {
        Self { store }
    }

    /// Builds `<name>_new` with `loader`, then swaps it in.
    ///
    /// `loader` receives the staging table name and must create and populate it;
    /// its output is returned once the swap succeeded. If it fails, the live
    /// table is untouched and the staging table is dropped.
    pub async fn replace_table<F, Fut, T>(
        &self,
        name: &str,
        indexes: &[Vec<String>],
        loader: F,
    ) -> MirrorResult<T>
    where
        F: FnOnce(String) -> Fut + Send,
        Fut: Future<Output = MirrorResult<T>> + Send,
    {
        validate_identifier(name)?;
        let staging = staging_name(name);
        self.store.drop_table(&staging).await?;

        let loaded = match loader(staging.clone()).await {
            Ok(loaded) => loaded,
            Err(err) => {
                warn!(table = name, error = %err, "loader failed; discarding staging table");
                if let Err(drop_err) = self.store.drop_table(&staging).await {
                    error!(table = %staging, error = %drop_err, "failed to drop staging table");
                }
                return Err(err);
            }
        };

        self.swap_in(name, indexes).await?;
        Ok(loaded)
    }

    /// Moves `<name>_new` under the live name and rebuilds `indexes` on it.
    ///
    /// On stores with transactional DDL the renames, the drop of the retired
    /// table and the index creation commit together. Otherwise they run one by
    /// one and a crash between the two renames leaves `name` absent until the
    /// swap is re-run.
    pub async fn swap_in(&self, name: &str, indexes: &[Vec<String>]) -> MirrorResult<()> {
        let staging = staging_name(name);
        let retired = retired_name(name);
        if !self.store.table_exists(&staging).await? {
            return Err(MirrorError::invalid_state(format!(
                "staging table '{staging}' does not exist"
            )));
        }

        let mut statements = vec![Statement::new(format!(
            "DROP TABLE IF EXISTS {}",
            quote_ident(&retired)?
        ))];
        if self.store.table_exists(name).await? {
            statements.push(rename(name, &retired)?);
        }
        statements.push(rename(&staging, name)?);
        statements.push(Statement::new(format!(
            "DROP TABLE IF EXISTS {}",
            quote_ident(&retired)?
        )));
        for columns in indexes {
            statements.push(create_index(name, columns, false)?);
        }

        let transactional = self.store.transactional_ddl();
        if transactional {
            self.store.execute_all(&statements).await?;
        } else {
            warn!(
                table = name,
                dialect = self.store.dialect(),
                "store lacks transactional DDL; swap runs statement by statement"
            );
            for statement in &statements {
                self.store.execute(statement).await?;
            }
        }
        record_table_swap(name, transactional);
        info!(table = name, indexes = indexes.len(), "table swapped in");
        Ok(())
    }
}

fn rename(from: &str, to: &str) -> MirrorResult<Statement> {
    Ok(Statement::new(format!(
        "ALTER TABLE {} RENAME TO {}",
        quote_ident(from)?,
        quote_ident(to)?
    )))
}
