//! Postgres-backed ledger store.

use std::collections::BTreeSet;

use async_trait::async_trait;
use ledgr_core::DateWindow;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Row as _};
use tracing::debug;

use crate::{ConflictPolicy, LedgerStore, Row, StoreError, TableSpec, WriteOutcome};

const UNDEFINED_COLUMN: &str = "42703";

#[derive(Debug, Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Persistence(format!("running migrations: {e}")))
    }
}

fn ident(name: &str) -> Result<String, StoreError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(format!("\"{name}\""))
    } else {
        Err(StoreError::InvalidIdentifier(name.to_string()))
    }
}

fn insert_sql(table: &TableSpec, row: &Row, policy: ConflictPolicy) -> Result<String, StoreError> {
    let table_name = ident(table.name)?;
    let columns = row
        .keys()
        .map(|c| ident(c))
        .collect::<Result<Vec<_>, _>>()?;
    let keys = table
        .key_columns
        .iter()
        .map(|c| ident(c))
        .collect::<Result<Vec<_>, _>>()?;
    let updates = row
        .keys()
        .filter(|c| !table.is_key_column(c))
        .map(|c| ident(c).map(|q| format!("{q} = EXCLUDED.{q}")))
        .collect::<Result<Vec<_>, _>>()?;

    let action = match policy {
        ConflictPolicy::Overwrite if !updates.is_empty() => {
            format!("DO UPDATE SET {}", updates.join(", "))
        }
        _ => "DO NOTHING".to_string(),
    };
    let column_list = columns.join(", ");

    Ok(format!(
        "INSERT INTO {table_name} ({column_list}) \
         SELECT {column_list} FROM jsonb_populate_record(NULL::{table_name}, $1) \
         ON CONFLICT ({}) {action}",
        keys.join(", ")
    ))
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn supported_fields(&self, table: &TableSpec) -> Result<BTreeSet<String>, StoreError> {
        let rows = sqlx::query(
            "SELECT column_name::text AS column_name FROM information_schema.columns \
             WHERE table_schema = current_schema() AND table_name = $1",
        )
        .bind(table.name)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| r.try_get::<String, _>("column_name").map_err(StoreError::from))
            .collect()
    }

    async fn write_row(
        &self,
        table: &TableSpec,
        row: &Row,
        policy: ConflictPolicy,
    ) -> Result<WriteOutcome, StoreError> {
        table.key_of(row)?;
        let sql = insert_sql(table, row, policy)?;

        match sqlx::query(&sql)
            .bind(Json(row.clone()))
            .execute(&self.pool)
            .await
        {
            Ok(done) if done.rows_affected() == 0 => Ok(WriteOutcome::Unchanged),
            Ok(_) => Ok(WriteOutcome::Written),
            Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some(UNDEFINED_COLUMN) => {
                // re-read capabilities instead of parsing the error text
                let supported = self.supported_fields(table).await?;
                let fields: Vec<String> = row
                    .keys()
                    .filter(|f| !supported.contains(*f))
                    .cloned()
                    .collect();
                debug!(table = table.name, ?fields, "undefined column on write");
                if fields.is_empty() {
                    Err(StoreError::Persistence(db.to_string()))
                } else {
                    Err(StoreError::SchemaDrift {
                        table: table.name.to_string(),
                        fields,
                    })
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn scan(
        &self,
        table: &TableSpec,
        client_id: &str,
        window: Option<&DateWindow>,
    ) -> Result<Vec<Row>, StoreError> {
        let table_name = ident(table.name)?;
        let order_by = table
            .key_columns
            .iter()
            .map(|c| ident(c))
            .collect::<Result<Vec<_>, _>>()?
            .join(", ");

        let rows = match (table.date_column, window) {
            (Some(column), Some(window)) => {
                let column = ident(column)?;
                let sql = format!(
                    "SELECT to_jsonb(t) AS row FROM {table_name} t \
                     WHERE client_id = $1 AND {column} BETWEEN $2 AND $3 ORDER BY {order_by}"
                );
                sqlx::query(&sql)
                    .bind(client_id)
                    .bind(window.start)
                    .bind(window.end)
                    .fetch_all(&self.pool)
                    .await?
            }
            _ => {
                let sql = format!(
                    "SELECT to_jsonb(t) AS row FROM {table_name} t WHERE client_id = $1 ORDER BY {order_by}"
                );
                sqlx::query(&sql).bind(client_id).fetch_all(&self.pool).await?
            }
        };

        rows.iter()
            .map(|r| {
                r.try_get::<Json<Row>, _>("row")
                    .map(|json| json.0)
                    .map_err(StoreError::from)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables;
    use serde_json::json;

    fn row(value: serde_json::Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn overwrite_sql_updates_non_key_columns() {
        let r = row(json!({"client_id": "acme", "date": "2026-03-01", "revenue": 10.0}));
        let sql = insert_sql(&tables::COVERAGE_DAILY, &r, ConflictPolicy::Overwrite).unwrap();
        assert!(sql.contains("jsonb_populate_record(NULL::\"coverage_daily\", $1)"));
        assert!(sql.contains("ON CONFLICT (\"client_id\", \"date\") DO UPDATE SET \"revenue\" = EXCLUDED.\"revenue\""));
    }

    #[test]
    fn gap_fill_sql_never_updates() {
        let r = row(json!({"client_id": "acme", "date": "2026-03-01", "revenue": 0.0}));
        let sql = insert_sql(&tables::COVERAGE_DAILY, &r, ConflictPolicy::InsertIfAbsent).unwrap();
        assert!(sql.ends_with("DO NOTHING"));
    }

    #[test]
    fn hostile_identifiers_are_rejected() {
        let r = row(json!({"client_id": "acme", "date": "2026-03-01", "x\"; DROP TABLE y; --": 1}));
        assert!(matches!(
            insert_sql(&tables::COVERAGE_DAILY, &r, ConflictPolicy::Overwrite),
            Err(StoreError::InvalidIdentifier(_))
        ));
    }
}
