//! Core domain model, error taxonomy and the pure ledger algorithms.

use chrono::{Datelike, Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod allocation;
pub mod bucket;
pub mod coverage;
pub mod events;

pub use allocation::{allocate, AllocationMode, Confidence};
pub use bucket::{BucketZone, DayBucketer};
pub use coverage::{aggregate_coverage, clamp_to_activity, coverage_fraction, UnitCostLookup};
pub use events::{AdInsightRow, RawLineItem, RawOrder, RawRefund};

pub const CRATE_NAME: &str = "ledgr-core";

/// Source label used for storefront revenue rows in `source_daily`.
pub const STOREFRONT_SOURCE: &str = "storefront";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LedgerError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("invalid date window: {0}")]
    InvalidWindow(String),
    #[error("upstream fetch failed for {provider} (status {status}): {message}")]
    UpstreamFetch {
        provider: String,
        status: u16,
        message: String,
    },
    #[error("schema drift on {table}: unknown fields {fields:?}")]
    SchemaDrift { table: String, fields: Vec<String> },
    #[error("persistence error: {0}")]
    Persistence(String),
}

impl LedgerError {
    /// Status reported in step outcomes for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Unauthorized(_) => 401,
            Self::InvalidWindow(_) => 400,
            Self::UpstreamFetch { status, .. } => *status,
            Self::SchemaDrift { .. } | Self::Persistence(_) => 500,
        }
    }
}

/// Clamp violation noticed while deriving a record. Logged by callers, never raised.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataIntegrityWarning {
    pub client_id: String,
    pub date: NaiveDate,
    pub field: &'static str,
    pub observed: f64,
    pub limit: f64,
}

/// Inclusive calendar-day window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

pub const DEFAULT_WINDOW_DAYS: i64 = 30;

impl DateWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, LedgerError> {
        if start > end {
            return Err(LedgerError::InvalidWindow(format!(
                "start {start} is after end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    /// The default window: 30 days ending yesterday, so a partial "today" is never ingested.
    pub fn default_ending_yesterday(today: NaiveDate) -> Self {
        let end = today - Duration::days(1);
        Self {
            start: end - Duration::days(DEFAULT_WINDOW_DAYS - 1),
            end,
        }
    }

    /// Resolve optional `YYYY-MM-DD` bounds; missing bounds fall back to the default window.
    pub fn resolve(
        start: Option<&str>,
        end: Option<&str>,
        today: NaiveDate,
    ) -> Result<Self, LedgerError> {
        let default = Self::default_ending_yesterday(today);
        let end = match end {
            Some(raw) => parse_day(raw)?,
            None => default.end,
        };
        let start = match start {
            Some(raw) => parse_day(raw)?,
            None => end - Duration::days(DEFAULT_WINDOW_DAYS - 1),
        };
        Self::new(start, end)
    }

    pub fn contains(&self, day: NaiveDate) -> bool {
        day >= self.start && day <= self.end
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.start.iter_days().take_while(move |d| *d <= self.end)
    }

    pub fn len_days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    /// Split into calendar-month chunks clipped to the window.
    pub fn month_chunks(&self) -> Vec<DateWindow> {
        let mut chunks = Vec::new();
        let mut cursor = self.start;
        while cursor <= self.end {
            let next_month = if cursor.month() == 12 {
                NaiveDate::from_ymd_opt(cursor.year() + 1, 1, 1)
            } else {
                NaiveDate::from_ymd_opt(cursor.year(), cursor.month() + 1, 1)
            };
            let month_end = next_month
                .map(|d| d - Duration::days(1))
                .unwrap_or(self.end);
            let end = month_end.min(self.end);
            chunks.push(DateWindow { start: cursor, end });
            cursor = end + Duration::days(1);
        }
        chunks
    }
}

impl std::fmt::Display for DateWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

fn parse_day(raw: &str) -> Result<NaiveDate, LedgerError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| LedgerError::InvalidWindow(format!("malformed date {raw:?}")))
}

/// Per-source raw facts for one day, as written by an ingestion step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDay {
    pub client_id: String,
    pub date: NaiveDate,
    pub source: String,
    #[serde(default)]
    pub revenue: f64,
    #[serde(default)]
    pub gross_sales: f64,
    #[serde(default)]
    pub refunds: f64,
    #[serde(default)]
    pub orders: i64,
    #[serde(default)]
    pub units: i64,
    #[serde(default)]
    pub paid_spend: f64,
}

impl SourceDay {
    pub fn zero(client_id: &str, date: NaiveDate, source: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            date,
            source: source.to_string(),
            revenue: 0.0,
            gross_sales: 0.0,
            refunds: 0.0,
            orders: 0,
            units: 0,
            paid_spend: 0.0,
        }
    }
}

/// Merged per-day activity across every source of a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyActivity {
    pub client_id: String,
    pub date: NaiveDate,
    pub revenue: f64,
    pub orders: i64,
    pub units: i64,
    pub paid_spend: f64,
}

impl DailyActivity {
    pub fn empty(client_id: &str, date: NaiveDate) -> Self {
        Self {
            client_id: client_id.to_string(),
            date,
            revenue: 0.0,
            orders: 0,
            units: 0,
            paid_spend: 0.0,
        }
    }

    pub fn absorb(&mut self, part: &SourceDay) {
        self.revenue += part.revenue;
        self.orders += part.orders;
        self.units += part.units;
        self.paid_spend += part.paid_spend;
    }
}

/// Line-level sales for one cost unit on one day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItemAggregate {
    pub client_id: String,
    pub date: NaiveDate,
    pub cost_unit_id: String,
    #[serde(default)]
    pub secondary_key: Option<String>,
    #[serde(default)]
    pub units: i64,
    #[serde(default)]
    pub line_revenue: f64,
    #[serde(default)]
    pub unit_cost: Option<f64>,
}

/// Manually maintained unit cost, keyed by cost unit id or SKU.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductCost {
    pub client_id: String,
    pub cost_key: String,
    pub unit_cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageRecord {
    pub client_id: String,
    pub date: NaiveDate,
    #[serde(default)]
    pub product_cogs_known: f64,
    #[serde(default)]
    pub revenue_with_cogs: f64,
    #[serde(default)]
    pub units_with_cogs: i64,
    #[serde(default)]
    pub estimated_cogs_missing: f64,
}

impl CoverageRecord {
    pub fn empty(client_id: &str, date: NaiveDate) -> Self {
        Self {
            client_id: client_id.to_string(),
            date,
            product_cogs_known: 0.0,
            revenue_with_cogs: 0.0,
            units_with_cogs: 0,
            estimated_cogs_missing: 0.0,
        }
    }

    pub fn rounded(&self) -> Self {
        Self {
            product_cogs_known: round_money(self.product_cogs_known),
            revenue_with_cogs: round_money(self.revenue_with_cogs),
            estimated_cogs_missing: round_money(self.estimated_cogs_missing),
            ..self.clone()
        }
    }
}

pub const DEFAULT_FALLBACK_MARGIN: f64 = 0.5;
pub const DEFAULT_ACTUAL_THRESHOLD: f64 = 0.95;
pub const DEFAULT_HYBRID_THRESHOLD: f64 = 0.25;

/// Per-client cost assumptions. Owned by client configuration; read-only to the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostSettings {
    pub client_id: String,
    /// Gross-margin assumption used for uncovered revenue.
    pub fallback_margin: Option<f64>,
    pub average_cost_per_unit: Option<f64>,
    pub fee_rate: f64,
    pub fee_fixed: f64,
    pub pick_pack_per_order: f64,
    pub shipping_subsidy_per_order: f64,
    pub materials_per_order: f64,
    pub other_variable_pct: f64,
    pub fixed_daily: f64,
    pub actual_threshold: f64,
    pub hybrid_threshold: f64,
    pub mode_override: Option<AllocationMode>,
}

impl Default for CostSettings {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            fallback_margin: None,
            average_cost_per_unit: None,
            fee_rate: 0.029,
            fee_fixed: 0.30,
            pick_pack_per_order: 0.0,
            shipping_subsidy_per_order: 0.0,
            materials_per_order: 0.0,
            other_variable_pct: 0.0,
            fixed_daily: 0.0,
            actual_threshold: DEFAULT_ACTUAL_THRESHOLD,
            hybrid_threshold: DEFAULT_HYBRID_THRESHOLD,
            mode_override: None,
        }
    }
}

impl CostSettings {
    pub fn for_client(client_id: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            ..Self::default()
        }
    }

    /// Configured margin clamped to [0, 1], or 0.5 when unset or not finite.
    pub fn effective_margin(&self) -> f64 {
        match self.fallback_margin {
            Some(m) if m.is_finite() => m.clamp(0.0, 1.0),
            _ => DEFAULT_FALLBACK_MARGIN,
        }
    }
}

/// Terminal per-day ledger row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfitSummary {
    pub client_id: String,
    pub date: NaiveDate,
    #[serde(default)]
    pub revenue: f64,
    #[serde(default)]
    pub orders: i64,
    #[serde(default)]
    pub units: i64,
    #[serde(default)]
    pub paid_spend: f64,
    #[serde(default)]
    pub cogs: f64,
    #[serde(default)]
    pub processing_fees: f64,
    #[serde(default)]
    pub variable_costs: f64,
    #[serde(default)]
    pub fixed_costs: f64,
    #[serde(default)]
    pub contribution_profit: f64,
    #[serde(default)]
    pub spend_efficiency: f64,
    #[serde(default)]
    pub profit_efficiency: f64,
    #[serde(default)]
    pub coverage: f64,
    pub mode: AllocationMode,
    pub confidence: Confidence,
}

impl ProfitSummary {
    /// Money rounded to cents, ratios to four places. Applied once, at persistence.
    pub fn rounded(&self) -> Self {
        Self {
            revenue: round_money(self.revenue),
            paid_spend: round_money(self.paid_spend),
            cogs: round_money(self.cogs),
            processing_fees: round_money(self.processing_fees),
            variable_costs: round_money(self.variable_costs),
            fixed_costs: round_money(self.fixed_costs),
            contribution_profit: round_money(self.contribution_profit),
            spend_efficiency: round_to(self.spend_efficiency, 4),
            profit_efficiency: round_to(self.profit_efficiency, 4),
            coverage: round_to(self.coverage, 4),
            ..self.clone()
        }
    }
}

pub fn round_money(value: f64) -> f64 {
    round_to(value, 2)
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    let rounded = (value * factor).round() / factor;
    // avoid persisting -0.0
    if rounded == 0.0 {
        0.0
    } else {
        rounded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn default_window_is_thirty_days_ending_yesterday() {
        let window = DateWindow::default_ending_yesterday(day("2026-03-15"));
        assert_eq!(window.end, day("2026-03-14"));
        assert_eq!(window.start, day("2026-02-13"));
        assert_eq!(window.len_days(), 30);
    }

    #[test]
    fn resolve_rejects_inverted_and_malformed_windows() {
        let today = day("2026-03-15");
        assert!(matches!(
            DateWindow::resolve(Some("2026-03-10"), Some("2026-03-01"), today),
            Err(LedgerError::InvalidWindow(_))
        ));
        assert!(matches!(
            DateWindow::resolve(Some("03/01/2026"), None, today),
            Err(LedgerError::InvalidWindow(_))
        ));
        let only_end = DateWindow::resolve(None, Some("2026-01-31"), today).unwrap();
        assert_eq!(only_end.start, day("2026-01-02"));
    }

    #[test]
    fn month_chunks_clip_to_window() {
        let window = DateWindow::new(day("2025-11-20"), day("2026-01-05")).unwrap();
        let chunks = window.month_chunks();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], DateWindow::new(day("2025-11-20"), day("2025-11-30")).unwrap());
        assert_eq!(chunks[1], DateWindow::new(day("2025-12-01"), day("2025-12-31")).unwrap());
        assert_eq!(chunks[2], DateWindow::new(day("2026-01-01"), day("2026-01-05")).unwrap());
    }

    #[test]
    fn effective_margin_clamps_and_defaults() {
        let mut settings = CostSettings::default();
        assert_eq!(settings.effective_margin(), 0.5);
        settings.fallback_margin = Some(1.7);
        assert_eq!(settings.effective_margin(), 1.0);
        settings.fallback_margin = Some(-0.2);
        assert_eq!(settings.effective_margin(), 0.0);
    }

    #[test]
    fn settings_decode_with_missing_fields() {
        let settings: CostSettings =
            serde_json::from_str(r#"{"client_id":"acme","fallback_margin":0.6}"#).unwrap();
        assert_eq!(settings.fee_rate, 0.029);
        assert_eq!(settings.actual_threshold, 0.95);
        assert_eq!(settings.fallback_margin, Some(0.6));
    }

    #[test]
    fn rounding_never_produces_negative_zero() {
        assert_eq!(round_money(-0.001).to_bits(), 0.0f64.to_bits());
        assert_eq!(round_money(12.345_1), 12.35);
    }
}
