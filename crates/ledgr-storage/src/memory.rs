//! In-process ledger store with fault injection, used by tests and offline runs.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use async_trait::async_trait;
use chrono::NaiveDate;
use ledgr_core::DateWindow;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::{tables, ConflictPolicy, LedgerStore, Row, StoreError, TableSpec, WriteOutcome};

#[derive(Debug, Default)]
struct MemoryState {
    columns: HashMap<&'static str, BTreeSet<String>>,
    /// Capabilities reported to callers when they differ from the real columns.
    advertised: HashMap<&'static str, BTreeSet<String>>,
    rows: BTreeMap<(&'static str, String), Row>,
    failing_keys: HashSet<(&'static str, String)>,
    writes: usize,
}

#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let columns = tables::ALL
            .iter()
            .map(|t| (t.name, t.columns.iter().map(|c| c.to_string()).collect()))
            .collect();
        Self {
            state: Mutex::new(MemoryState {
                columns,
                ..MemoryState::default()
            }),
        }
    }

    /// Remove a column from the destination schema and from advertised capabilities.
    pub async fn drop_column(&self, table: &TableSpec, column: &str) {
        let mut state = self.state.lock().await;
        if let Some(cols) = state.columns.get_mut(table.name) {
            cols.remove(column);
        }
        state.advertised.remove(table.name);
    }

    /// Remove a column while still advertising the old capabilities, so writes discover
    /// the drift only when they are rejected.
    pub async fn drop_column_unannounced(&self, table: &TableSpec, column: &str) {
        let mut state = self.state.lock().await;
        let current = state.columns.get(table.name).cloned().unwrap_or_default();
        state.advertised.entry(table.name).or_insert(current);
        if let Some(cols) = state.columns.get_mut(table.name) {
            cols.remove(column);
        }
    }

    /// Make every write to `key` fail with a persistence error.
    pub async fn fail_writes_for(&self, table: &TableSpec, key: &str) {
        self.state
            .lock()
            .await
            .failing_keys
            .insert((table.name, key.to_string()));
    }

    pub async fn clear_failures(&self) {
        self.state.lock().await.failing_keys.clear();
    }

    pub async fn rows(&self, table: &TableSpec) -> Vec<Row> {
        let state = self.state.lock().await;
        state
            .rows
            .iter()
            .filter(|((name, _), _)| *name == table.name)
            .map(|(_, row)| row.clone())
            .collect()
    }

    pub async fn get(&self, table: &TableSpec, key: &str) -> Option<Row> {
        let state = self.state.lock().await;
        state.rows.get(&(table.name, key.to_string())).cloned()
    }

    pub async fn write_count(&self) -> usize {
        self.state.lock().await.writes
    }
}

fn row_date(row: &Row, column: &str) -> Option<NaiveDate> {
    row.get(column)
        .and_then(Value::as_str)
        .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn supported_fields(&self, table: &TableSpec) -> Result<BTreeSet<String>, StoreError> {
        let state = self.state.lock().await;
        let fields = state
            .advertised
            .get(table.name)
            .or_else(|| state.columns.get(table.name))
            .cloned()
            .unwrap_or_default();
        Ok(fields)
    }

    async fn write_row(
        &self,
        table: &TableSpec,
        row: &Row,
        policy: ConflictPolicy,
    ) -> Result<WriteOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let key = table.key_of(row)?;

        if state.failing_keys.contains(&(table.name, key.clone())) {
            return Err(StoreError::Persistence(format!(
                "write to {} rejected for key {key}",
                table.name
            )));
        }

        let columns = state.columns.get(table.name).cloned().unwrap_or_default();
        let unknown: Vec<String> = row
            .keys()
            .filter(|field| !columns.contains(*field))
            .cloned()
            .collect();
        if !unknown.is_empty() {
            return Err(StoreError::SchemaDrift {
                table: table.name.to_string(),
                fields: unknown,
            });
        }

        state.writes += 1;
        let slot = (table.name, key);
        match (policy, state.rows.get_mut(&slot)) {
            (ConflictPolicy::InsertIfAbsent, Some(_)) => Ok(WriteOutcome::Unchanged),
            (ConflictPolicy::Overwrite, Some(existing)) => {
                for (field, value) in row {
                    existing.insert(field.clone(), value.clone());
                }
                Ok(WriteOutcome::Written)
            }
            (_, None) => {
                state.rows.insert(slot, row.clone());
                Ok(WriteOutcome::Written)
            }
        }
    }

    async fn scan(
        &self,
        table: &TableSpec,
        client_id: &str,
        window: Option<&DateWindow>,
    ) -> Result<Vec<Row>, StoreError> {
        let state = self.state.lock().await;
        let rows = state
            .rows
            .iter()
            .filter(|((name, _), _)| *name == table.name)
            .map(|(_, row)| row)
            .filter(|row| row.get("client_id").and_then(Value::as_str) == Some(client_id))
            .filter(|row| match (table.date_column, window) {
                (Some(column), Some(window)) => {
                    row_date(row, column).is_some_and(|d| window.contains(d))
                }
                _ => true,
            })
            .cloned()
            .collect();
        Ok(rows)
    }
}
