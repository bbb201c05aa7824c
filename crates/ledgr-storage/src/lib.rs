//! Ledger persistence contract, stores, the idempotent upsert layer and upstream HTTP utilities.

use std::collections::BTreeSet;

use async_trait::async_trait;
use ledgr_core::{DateWindow, LedgerError};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use thiserror::Error;

pub mod http;
pub mod memory;
pub mod postgres;
pub mod upsert;

pub use http::{
    BackoffPolicy, FetchError, FetchedResponse, HttpClientConfig, HttpFetcher, HttpMethod,
    HttpRequest, TokenBucketConfig,
};
pub use memory::MemoryStore;
pub use postgres::PgLedgerStore;
pub use upsert::{RowFailure, UpsertLayer, UpsertReport, DEFAULT_MAX_ATTEMPTS};

pub const CRATE_NAME: &str = "ledgr-storage";

/// A stored row: column name to JSON value.
pub type Row = serde_json::Map<String, Value>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("schema drift on {table}: unknown fields {fields:?}")]
    SchemaDrift { table: String, fields: Vec<String> },
    #[error("row for {table} is missing key column {column}")]
    MissingKey { table: String, column: String },
    #[error("invalid identifier {0:?}")]
    InvalidIdentifier(String),
    #[error("row encoding failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Persistence(String),
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::SchemaDrift { table, fields } => LedgerError::SchemaDrift { table, fields },
            other => LedgerError::Persistence(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Insert, or overwrite the provided columns of an existing row.
    Overwrite,
    /// Insert only when no row with the same key exists.
    InsertIfAbsent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    Unchanged,
}

/// Static description of a destination table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSpec {
    pub name: &'static str,
    pub key_columns: &'static [&'static str],
    pub date_column: Option<&'static str>,
    pub columns: &'static [&'static str],
}

impl TableSpec {
    /// Composite key of a row, key values joined with `|`.
    pub fn key_of(&self, row: &Row) -> Result<String, StoreError> {
        let mut parts = Vec::with_capacity(self.key_columns.len());
        for column in self.key_columns {
            let value = row
                .get(*column)
                .filter(|v| !v.is_null())
                .ok_or_else(|| StoreError::MissingKey {
                    table: self.name.to_string(),
                    column: column.to_string(),
                })?;
            parts.push(match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            });
        }
        Ok(parts.join("|"))
    }

    pub fn is_key_column(&self, column: &str) -> bool {
        self.key_columns.contains(&column)
    }
}

pub mod tables {
    use super::TableSpec;

    pub const SOURCE_DAILY: TableSpec = TableSpec {
        name: "source_daily",
        key_columns: &["client_id", "date", "source"],
        date_column: Some("date"),
        columns: &[
            "client_id", "date", "source", "revenue", "gross_sales", "refunds", "orders", "units",
            "paid_spend",
        ],
    };

    pub const LINE_ITEM_DAILY: TableSpec = TableSpec {
        name: "line_item_daily",
        key_columns: &["client_id", "date", "cost_unit_id"],
        date_column: Some("date"),
        columns: &[
            "client_id", "date", "cost_unit_id", "secondary_key", "units", "line_revenue",
            "unit_cost",
        ],
    };

    pub const PRODUCT_COSTS: TableSpec = TableSpec {
        name: "product_costs",
        key_columns: &["client_id", "cost_key"],
        date_column: None,
        columns: &["client_id", "cost_key", "unit_cost"],
    };

    pub const COST_SETTINGS: TableSpec = TableSpec {
        name: "cost_settings",
        key_columns: &["client_id"],
        date_column: None,
        columns: &[
            "client_id", "fallback_margin", "average_cost_per_unit", "fee_rate", "fee_fixed",
            "pick_pack_per_order", "shipping_subsidy_per_order", "materials_per_order",
            "other_variable_pct", "fixed_daily", "actual_threshold", "hybrid_threshold",
            "mode_override",
        ],
    };

    pub const COVERAGE_DAILY: TableSpec = TableSpec {
        name: "coverage_daily",
        key_columns: &["client_id", "date"],
        date_column: Some("date"),
        columns: &[
            "client_id", "date", "product_cogs_known", "revenue_with_cogs", "units_with_cogs",
            "estimated_cogs_missing",
        ],
    };

    pub const PROFIT_DAILY: TableSpec = TableSpec {
        name: "profit_daily",
        key_columns: &["client_id", "date"],
        date_column: Some("date"),
        columns: &[
            "client_id", "date", "revenue", "orders", "units", "paid_spend", "cogs",
            "processing_fees", "variable_costs", "fixed_costs", "contribution_profit",
            "spend_efficiency", "profit_efficiency", "coverage", "mode", "confidence",
        ],
    };

    pub const ALL: [TableSpec; 6] = [
        SOURCE_DAILY,
        LINE_ITEM_DAILY,
        PRODUCT_COSTS,
        COST_SETTINGS,
        COVERAGE_DAILY,
        PROFIT_DAILY,
    ];
}

/// Key-value ledger store with composite-key writes and client/date range scans.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Columns the destination currently accepts for `table`.
    async fn supported_fields(&self, table: &TableSpec) -> Result<BTreeSet<String>, StoreError>;

    async fn write_row(
        &self,
        table: &TableSpec,
        row: &Row,
        policy: ConflictPolicy,
    ) -> Result<WriteOutcome, StoreError>;

    /// Rows of one client, restricted to `window` when the table is date-keyed.
    async fn scan(
        &self,
        table: &TableSpec,
        client_id: &str,
        window: Option<&DateWindow>,
    ) -> Result<Vec<Row>, StoreError>;
}

pub fn to_row<T: Serialize>(record: &T) -> Result<Row, StoreError> {
    match serde_json::to_value(record)? {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::Persistence(format!(
            "record did not encode to an object: {other}"
        ))),
    }
}

pub fn from_row<T: DeserializeOwned>(row: Row) -> Result<T, StoreError> {
    Ok(serde_json::from_value(Value::Object(row))?)
}

pub async fn scan_typed<T: DeserializeOwned>(
    store: &dyn LedgerStore,
    table: &TableSpec,
    client_id: &str,
    window: Option<&DateWindow>,
) -> Result<Vec<T>, StoreError> {
    store
        .scan(table, client_id, window)
        .await?
        .into_iter()
        .map(from_row)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use ledgr_core::{CostSettings, SourceDay};

    #[test]
    fn key_of_joins_key_columns_in_order() {
        let day = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let row = to_row(&SourceDay::zero("acme", day, "meta")).unwrap();
        assert_eq!(tables::SOURCE_DAILY.key_of(&row).unwrap(), "acme|2026-03-01|meta");
    }

    #[test]
    fn key_of_rejects_missing_key() {
        let mut row = Row::new();
        row.insert("client_id".into(), Value::String("acme".into()));
        let err = tables::COVERAGE_DAILY.key_of(&row).unwrap_err();
        assert!(matches!(err, StoreError::MissingKey { column, .. } if column == "date"));
    }

    #[test]
    fn typed_records_encode_only_known_columns() {
        let day = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let row = to_row(&SourceDay::zero("acme", day, "meta")).unwrap();
        for field in row.keys() {
            assert!(tables::SOURCE_DAILY.columns.contains(&field.as_str()), "{field}");
        }
        let settings = to_row(&CostSettings::for_client("acme")).unwrap();
        for field in settings.keys() {
            assert!(tables::COST_SETTINGS.columns.contains(&field.as_str()), "{field}");
        }
    }

    #[test]
    fn drift_maps_into_ledger_taxonomy() {
        let err: LedgerError = StoreError::SchemaDrift {
            table: "profit_daily".into(),
            fields: vec!["coverage".into()],
        }
        .into();
        assert!(matches!(err, LedgerError::SchemaDrift { .. }));
        let err: LedgerError = StoreError::Persistence("boom".into()).into();
        assert_eq!(err, LedgerError::Persistence("boom".into()));
    }
}
