//! Durable key/value store of named flags and timestamps (`manage` variables).

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tracing::{debug, warn};
use vocabmirror_core::types::keys;
use vocabmirror_core::{
    format_timestamp, parse_timestamp, BackingStore, MirrorError, MirrorResult, Statement,
};

/// Conditional upsert that acquires the single-flight gate.
///
/// Succeeds when the flag is not `active`, or when it is `active` but the holder
/// started before the cutoff and never exited (a process that died mid-cycle).
/// Comparing against `last_refresh_exited` keeps a freshly acquired gate, whose
/// `last_refresh_request` still belongs to the previous cycle, from being taken over.
const TRY_ACTIVATE: &str = r#"INSERT INTO manage (key, value) VALUES (?, ?)
    ON CONFLICT (key) DO UPDATE SET value = excluded.value
    WHERE manage.value <> ?
       OR EXISTS (
           SELECT 1 FROM manage r
           WHERE r.key = ? AND r.value < ?
             AND NOT EXISTS (
                 SELECT 1 FROM manage e WHERE e.key = ? AND e.value >= r.value
             )
       )"#;

/// Service object over the `manage` table.
///
/// Writes use delete-then-insert in one transaction; the gate is the only
/// conditional write.
#[derive(Clone)]
pub struct StatusStore {
    store: Arc<dyn BackingStore>,
}

impl StatusStore {
    /// Create a status store on top of `store`.
    pub fn new(store: Arc<dyn BackingStore>) -> Self {
        Self { store }
    }

    /// Current value of `key`.
    pub async fn get(&self, key: &str) -> MirrorResult<Option<String>> {
        let rows = self
            .store
            .query(&Statement::new("SELECT value FROM manage WHERE key = ?").bind(key))
            .await?;
        Ok(rows.into_iter().next().and_then(|mut row| match row.remove("value") {
            Some(Value::String(value)) => Some(value),
            Some(Value::Null) | None => None,
            Some(other) => Some(other.to_string()),
        }))
    }

    /// Sets `key` to `value`.
    pub async fn set(&self, key: &str, value: &str) -> MirrorResult<()> {
        self.store
            .execute_all(&[
                Statement::new("DELETE FROM manage WHERE key = ?").bind(key),
                Statement::new("INSERT INTO manage (key, value) VALUES (?, ?)")
                    .bind(key)
                    .bind(value),
            ])
            .await?;
        debug!(key, value, "manage variable set");
        Ok(())
    }

    /// Sets several keys in one transaction.
    pub async fn set_many(&self, entries: &[(&str, String)]) -> MirrorResult<()> {
        let mut statements = Vec::with_capacity(entries.len() * 2);
        for (key, value) in entries {
            statements.push(Statement::new("DELETE FROM manage WHERE key = ?").bind(*key));
            statements.push(
                Statement::new("INSERT INTO manage (key, value) VALUES (?, ?)")
                    .bind(*key)
                    .bind(value.as_str()),
            );
        }
        self.store.execute_all(&statements).await.map(|_| ())
    }

    /// Timestamp stored under `key`.
    pub async fn get_timestamp(&self, key: &str) -> MirrorResult<Option<DateTime<Utc>>> {
        self.get(key)
            .await?
            .map(|value| parse_timestamp(&value))
            .transpose()
    }

    /// Stores a timestamp under `key`.
    pub async fn set_timestamp(&self, key: &str, ts: DateTime<Utc>) -> MirrorResult<()> {
        self.set(key, &format_timestamp(ts)).await
    }

    /// Integer stored under `key`.
    pub async fn get_u64(&self, key: &str) -> MirrorResult<Option<u64>> {
        self.get(key)
            .await?
            .map(|value| {
                value.parse::<u64>().map_err(|err| {
                    MirrorError::invalid_state(format!("manage '{key}' = '{value}': {err}"))
                })
            })
            .transpose()
    }

    /// Deletes `key`; returns whether it existed.
    pub async fn delete(&self, key: &str) -> MirrorResult<bool> {
        let removed = self
            .store
            .execute(&Statement::new("DELETE FROM manage WHERE key = ?").bind(key))
            .await?;
        Ok(removed > 0)
    }

    /// Deletes `key` only while it still holds `value`; returns whether it did.
    pub async fn delete_if(&self, key: &str, value: &str) -> MirrorResult<bool> {
        let removed = self
            .store
            .execute(
                &Statement::new("DELETE FROM manage WHERE key = ? AND value = ?")
                    .bind(key)
                    .bind(value),
            )
            .await?;
        Ok(removed > 0)
    }

    /// Consumes a one-shot signal: returns its value and deletes it.
    ///
    /// Only the caller whose delete removed the row gets the value.
    pub async fn take(&self, key: &str) -> MirrorResult<Option<String>> {
        let Some(value) = self.get(key).await? else {
            return Ok(None);
        };
        if self.delete(key).await? {
            Ok(Some(value))
        } else {
            Ok(None)
        }
    }

    /// Atomically flips `refresh_status` to `active` unless another cycle holds it.
    ///
    /// Returns `true` when the caller now owns the gate.
    pub async fn try_activate(
        &self,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> MirrorResult<bool> {
        let previous = self.get(keys::REFRESH_STATUS).await?;
        let cutoff = format_timestamp(now - stale_after);
        let acquired = self
            .store
            .execute(
                &Statement::new(TRY_ACTIVATE)
                    .bind(keys::REFRESH_STATUS)
                    .bind(keys::STATUS_ACTIVE)
                    .bind(keys::STATUS_ACTIVE)
                    .bind(keys::LAST_REFRESH_REQUEST)
                    .bind(cutoff)
                    .bind(keys::LAST_REFRESH_EXITED),
            )
            .await?
            == 1;
        if acquired && previous.as_deref() == Some(keys::STATUS_ACTIVE) {
            let started = self.get(keys::LAST_REFRESH_REQUEST).await?;
            warn!(
                abandoned_request = started.as_deref().unwrap_or("unknown"),
                "took over refresh gate from a cycle that never exited"
            );
        }
        Ok(acquired)
    }

    /// Whether a cycle currently holds the gate.
    pub async fn is_active(&self) -> MirrorResult<bool> {
        Ok(self.get(keys::REFRESH_STATUS).await?.as_deref() == Some(keys::STATUS_ACTIVE))
    }

    /// All variables, sorted by key.
    pub async fn snapshot(&self) -> MirrorResult<BTreeMap<String, String>> {
        let rows = self
            .store
            .query(&Statement::new("SELECT key, value FROM manage ORDER BY key"))
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| match (row.get("key"), row.get("value")) {
                (Some(Value::String(key)), Some(Value::String(value))) => {
                    Some((key.clone(), value.clone()))
                }
                _ => None,
            })
            .collect())
    }
}
