//! Idempotent, schema-drift tolerant row writes.
//!
//! Before writing, the destination's supported fields are read and unsupported fields are
//! stripped. If a write is still rejected for unknown fields (the schema changed under us),
//! exactly those fields are removed and the write retried, up to a fixed bound. Any other
//! rejection is fatal for the batch: the failing row is recorded and the rest are skipped.

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::{error, warn};

use crate::{ConflictPolicy, LedgerStore, Row, StoreError, TableSpec, WriteOutcome};

pub const DEFAULT_MAX_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowFailure {
    pub key: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpsertReport {
    pub table: String,
    pub written: usize,
    pub unchanged: usize,
    pub failures: Vec<RowFailure>,
    pub not_attempted: usize,
    pub dropped_fields: BTreeSet<String>,
}

impl UpsertReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && self.not_attempted == 0
    }

    pub fn first_error(&self) -> Option<&str> {
        self.failures.first().map(|f| f.error.as_str())
    }
}

pub struct UpsertLayer<'a> {
    store: &'a dyn LedgerStore,
    max_attempts: usize,
}

impl<'a> UpsertLayer<'a> {
    pub fn new(store: &'a dyn LedgerStore) -> Self {
        Self {
            store,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Insert or overwrite each row by its composite key.
    pub async fn upsert(&self, table: &TableSpec, rows: Vec<Row>) -> Result<UpsertReport, StoreError> {
        self.write_all(table, rows, ConflictPolicy::Overwrite).await
    }

    /// Insert rows whose key is absent; existing rows are never touched.
    pub async fn fill_gaps(&self, table: &TableSpec, rows: Vec<Row>) -> Result<UpsertReport, StoreError> {
        self.write_all(table, rows, ConflictPolicy::InsertIfAbsent).await
    }

    async fn write_all(
        &self,
        table: &TableSpec,
        rows: Vec<Row>,
        policy: ConflictPolicy,
    ) -> Result<UpsertReport, StoreError> {
        let mut report = UpsertReport {
            table: table.name.to_string(),
            ..UpsertReport::default()
        };
        let mut supported = self.store.supported_fields(table).await?;

        if let Some(missing) = table.key_columns.iter().find(|k| !supported.contains(**k)) {
            report.failures.push(RowFailure {
                key: String::new(),
                error: format!("destination {} lacks key column {missing}", table.name),
            });
            report.not_attempted = rows.len();
            return Ok(report);
        }

        let total = rows.len();
        for (index, mut row) in rows.into_iter().enumerate() {
            let key = match table.key_of(&row) {
                Ok(key) => key,
                Err(err) => {
                    report.failures.push(RowFailure {
                        key: format!("#{index}"),
                        error: err.to_string(),
                    });
                    report.not_attempted = total - index - 1;
                    return Ok(report);
                }
            };

            row.retain(|field, _| {
                if supported.contains(field) {
                    true
                } else {
                    report.dropped_fields.insert(field.clone());
                    false
                }
            });

            let mut attempt = 0;
            loop {
                attempt += 1;
                match self.store.write_row(table, &row, policy).await {
                    Ok(WriteOutcome::Written) => {
                        report.written += 1;
                        break;
                    }
                    Ok(WriteOutcome::Unchanged) => {
                        report.unchanged += 1;
                        break;
                    }
                    Err(StoreError::SchemaDrift { fields, .. }) if attempt < self.max_attempts => {
                        let removable: Vec<String> = fields
                            .into_iter()
                            .filter(|f| !table.is_key_column(f) && row.contains_key(f))
                            .collect();
                        if removable.is_empty() {
                            let message = format!(
                                "{} rejected a write for fields that cannot be dropped",
                                table.name
                            );
                            return Ok(fail_batch(report, key, message, total - index - 1));
                        }
                        for field in removable {
                            warn!(table = table.name, %field, %key, "destination dropped field; retrying without it");
                            row.remove(&field);
                            supported.remove(&field);
                            report.dropped_fields.insert(field);
                        }
                    }
                    Err(StoreError::SchemaDrift { fields, .. }) => {
                        let message = format!(
                            "schema drift on {} persisted after {attempt} attempts: {fields:?}",
                            table.name
                        );
                        return Ok(fail_batch(report, key, message, total - index - 1));
                    }
                    Err(err) => {
                        return Ok(fail_batch(report, key, err.to_string(), total - index - 1));
                    }
                }
            }
        }

        Ok(report)
    }
}

fn fail_batch(mut report: UpsertReport, key: String, message: String, remaining: usize) -> UpsertReport {
    error!(table = %report.table, %key, error = %message, "row write failed; stopping batch");
    report.failures.push(RowFailure { key, error: message });
    report.not_attempted = remaining;
    report
}
