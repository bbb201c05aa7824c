//! The five pipeline steps. Each one is independent and idempotent for a (client, window).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use ledgr_adapters::{
    fetch_all_insights, fetch_all_orders, AdSpendSource, CredentialStore, ProviderCredential,
    SourceError, StorefrontSource,
};
use ledgr_core::{
    aggregate_coverage, allocate, clamp_to_activity, BucketZone, CostSettings, DailyActivity,
    DateWindow, DayBucketer, LedgerError, LineItemAggregate, ProductCost, SourceDay,
    STOREFRONT_SOURCE,
};
use ledgr_storage::{
    from_row, scan_typed, tables, to_row, LedgerStore, Row, StoreError, TableSpec, UpsertLayer,
    UpsertReport,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::AccessGrant;

pub const STEP_STOREFRONT_REVENUE: &str = "storefront_revenue_sync";
pub const STEP_LINE_ITEM_COGS: &str = "line_item_cogs_sync";
pub const STEP_RECOMPUTE: &str = "recompute";

pub fn ad_step_name(provider: &str) -> String {
    format!("{provider}_spend_sync")
}

/// Everything a step needs to know about the invocation it is part of.
#[derive(Debug, Clone)]
pub struct StepRequest {
    pub run_id: Uuid,
    pub client_id: String,
    pub window: DateWindow,
    pub zone: BucketZone,
    pub grant: AccessGrant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepResult {
    Done { count: usize },
    /// Nothing to do, e.g. an optional provider the client has not connected.
    Skipped { reason: String },
}

/// Normalized per-step outcome reported by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step: String,
    pub ok: bool,
    pub status: u16,
    pub count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub skipped: bool,
}

impl StepOutcome {
    pub fn from_result(step: &str, result: Result<StepResult, LedgerError>) -> Self {
        match result {
            Ok(StepResult::Done { count }) => Self {
                step: step.to_string(),
                ok: true,
                status: 200,
                count,
                error: None,
                skipped: false,
            },
            Ok(StepResult::Skipped { reason }) => Self {
                step: step.to_string(),
                ok: true,
                status: 204,
                count: 0,
                error: Some(reason),
                skipped: true,
            },
            Err(err) => Self {
                step: step.to_string(),
                ok: false,
                status: err.http_status(),
                count: 0,
                error: Some(err.to_string()),
                skipped: false,
            },
        }
    }
}

#[async_trait]
pub trait SyncStep: Send + Sync {
    fn name(&self) -> String;
    async fn run(&self, request: &StepRequest) -> Result<StepResult, LedgerError>;
}

/// Shared, explicitly constructed collaborators for every step.
#[derive(Clone)]
pub struct StepDeps {
    pub store: Arc<dyn LedgerStore>,
    pub credentials: Arc<dyn CredentialStore>,
    pub max_pages: usize,
    pub upsert_max_attempts: usize,
}

impl StepDeps {
    fn upserter(&self) -> UpsertLayer<'_> {
        UpsertLayer::new(self.store.as_ref()).with_max_attempts(self.upsert_max_attempts)
    }

    async fn credential(
        &self,
        client_id: &str,
        provider: &str,
    ) -> Result<Option<ProviderCredential>, LedgerError> {
        self.credentials
            .lookup(client_id, provider)
            .await
            .map_err(|e| LedgerError::Persistence(format!("credential lookup for {provider}: {e:#}")))
    }

    async fn required_credential(
        &self,
        client_id: &str,
        provider: &str,
    ) -> Result<ProviderCredential, LedgerError> {
        self.credential(client_id, provider).await?.ok_or_else(|| {
            SourceError::NotConnected {
                provider: provider.to_string(),
                reason: format!("client {client_id} has no {provider} credential"),
            }
            .into()
        })
    }

    async fn upsert(&self, table: &TableSpec, rows: Vec<Row>) -> Result<UpsertReport, LedgerError> {
        let report = self.upserter().upsert(table, rows).await?;
        check_report(report)
    }

    async fn fill_gaps(&self, table: &TableSpec, rows: Vec<Row>) -> Result<UpsertReport, LedgerError> {
        let report = self.upserter().fill_gaps(table, rows).await?;
        check_report(report)
    }

    /// Upsert observed days and gap-fill the rest of the window with zero rows.
    async fn write_source_days(
        &self,
        request: &StepRequest,
        source: &str,
        observed: BTreeMap<NaiveDate, SourceDay>,
    ) -> Result<usize, LedgerError> {
        let gaps: Vec<Row> = request
            .window
            .days()
            .filter(|day| !observed.contains_key(day))
            .map(|day| to_row(&SourceDay::zero(&request.client_id, day, source)))
            .collect::<Result<_, _>>()
            .map_err(LedgerError::from)?;
        let rows: Vec<Row> = observed
            .values()
            .map(to_row)
            .collect::<Result<_, _>>()
            .map_err(LedgerError::from)?;

        let written = self.upsert(&tables::SOURCE_DAILY, rows).await?;
        let filled = self.fill_gaps(&tables::SOURCE_DAILY, gaps).await?;
        if !written.dropped_fields.is_empty() {
            warn!(fields = ?written.dropped_fields, "source_daily written without some fields");
        }
        Ok(written.written + filled.written)
    }
}

fn check_report(report: UpsertReport) -> Result<UpsertReport, LedgerError> {
    if report.is_complete() {
        return Ok(report);
    }
    let detail = report.first_error().unwrap_or("batch incomplete").to_string();
    Err(LedgerError::Persistence(format!(
        "{}: {} written, {} not attempted: {detail}",
        report.table, report.written, report.not_attempted
    )))
}

pub struct StorefrontRevenueStep {
    deps: StepDeps,
    source: Arc<dyn StorefrontSource>,
}

impl StorefrontRevenueStep {
    pub fn new(deps: StepDeps, source: Arc<dyn StorefrontSource>) -> Self {
        Self { deps, source }
    }
}

#[async_trait]
impl SyncStep for StorefrontRevenueStep {
    fn name(&self) -> String {
        STEP_STOREFRONT_REVENUE.to_string()
    }

    async fn run(&self, request: &StepRequest) -> Result<StepResult, LedgerError> {
        let provider = self.source.provider();
        let credential = self.deps.required_credential(&request.client_id, provider).await?;
        let orders =
            fetch_all_orders(self.source.as_ref(), &credential, &request.window, self.deps.max_pages)
                .await?;

        let bucketer = DayBucketer::new(request.zone);
        let (days, stats) =
            bucketer.revenue_by_day(&request.client_id, STOREFRONT_SOURCE, &request.window, &orders);
        info!(orders = orders.len(), active_days = days.len(), ?stats, "storefront orders bucketed");

        let count = self
            .deps
            .write_source_days(request, STOREFRONT_SOURCE, days)
            .await?;
        Ok(StepResult::Done { count })
    }
}

pub struct AdSpendStep {
    deps: StepDeps,
    source: Arc<dyn AdSpendSource>,
    required: bool,
}

impl AdSpendStep {
    /// An optional step is skipped when the client has not connected the provider.
    pub fn new(deps: StepDeps, source: Arc<dyn AdSpendSource>, required: bool) -> Self {
        Self {
            deps,
            source,
            required,
        }
    }
}

#[async_trait]
impl SyncStep for AdSpendStep {
    fn name(&self) -> String {
        ad_step_name(self.source.provider())
    }

    async fn run(&self, request: &StepRequest) -> Result<StepResult, LedgerError> {
        let provider = self.source.provider();
        let credential = match self.deps.credential(&request.client_id, provider).await? {
            Some(credential) => credential,
            None if self.required => {
                return Err(SourceError::NotConnected {
                    provider: provider.to_string(),
                    reason: format!("client {} has no {provider} credential", request.client_id),
                }
                .into())
            }
            None => {
                return Ok(StepResult::Skipped {
                    reason: format!("{provider} not connected"),
                })
            }
        };

        let rows =
            fetch_all_insights(self.source.as_ref(), &credential, &request.window, self.deps.max_pages)
                .await?;
        let bucketer = DayBucketer::new(request.zone);
        let (days, stats) = bucketer.spend_by_day(&request.client_id, provider, &request.window, &rows);
        info!(rows = rows.len(), active_days = days.len(), ?stats, provider, "ad spend bucketed");

        let count = self.deps.write_source_days(request, provider, days).await?;
        Ok(StepResult::Done { count })
    }
}

pub struct LineItemCogsStep {
    deps: StepDeps,
    source: Arc<dyn StorefrontSource>,
}

impl LineItemCogsStep {
    pub fn new(deps: StepDeps, source: Arc<dyn StorefrontSource>) -> Self {
        Self { deps, source }
    }

    /// Stored rows in the window that this pass did not observe, zeroed. Rows that are
    /// already zero are left alone.
    async fn superseded_rows(
        &self,
        request: &StepRequest,
        observed: &[LineItemAggregate],
    ) -> Result<Vec<LineItemAggregate>, LedgerError> {
        let seen: BTreeSet<(NaiveDate, &str)> = observed
            .iter()
            .map(|a| (a.date, a.cost_unit_id.as_str()))
            .collect();
        let stored: Vec<LineItemAggregate> = scan_typed(
            self.deps.store.as_ref(),
            &tables::LINE_ITEM_DAILY,
            &request.client_id,
            Some(&request.window),
        )
        .await?;

        Ok(stored
            .into_iter()
            .filter(|row| !seen.contains(&(row.date, row.cost_unit_id.as_str())))
            .filter(|row| row.units != 0 || row.line_revenue != 0.0)
            .map(|row| LineItemAggregate {
                units: 0,
                line_revenue: 0.0,
                unit_cost: None,
                ..row
            })
            .collect())
    }
}

#[async_trait]
impl SyncStep for LineItemCogsStep {
    fn name(&self) -> String {
        STEP_LINE_ITEM_COGS.to_string()
    }

    async fn run(&self, request: &StepRequest) -> Result<StepResult, LedgerError> {
        let provider = self.source.provider();
        let credential = self.deps.required_credential(&request.client_id, provider).await?;
        let orders =
            fetch_all_orders(self.source.as_ref(), &credential, &request.window, self.deps.max_pages)
                .await?;

        let bucketer = DayBucketer::new(request.zone);
        let (mut aggregates, _) = bucketer.line_items_by_day(&request.client_id, &request.window, &orders);
        let ids: Vec<String> = aggregates
            .iter()
            .map(|a| a.cost_unit_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let costs = if ids.is_empty() {
            BTreeMap::new()
        } else {
            self.source.fetch_unit_costs(&credential, &ids).await?
        };
        info!(line_items = aggregates.len(), cost_units = ids.len(), costed = costs.len(), "line items aggregated");

        let cost_rows: Vec<Row> = costs
            .iter()
            .map(|(key, unit_cost)| {
                to_row(&ProductCost {
                    client_id: request.client_id.clone(),
                    cost_key: key.clone(),
                    unit_cost: *unit_cost,
                })
            })
            .collect::<Result<_, _>>()
            .map_err(LedgerError::from)?;
        self.deps.upsert(&tables::PRODUCT_COSTS, cost_rows).await?;

        for aggregate in &mut aggregates {
            aggregate.unit_cost = costs.get(&aggregate.cost_unit_id).copied();
        }
        let superseded = self.superseded_rows(request, &aggregates).await?;
        if !superseded.is_empty() {
            info!(superseded = superseded.len(), "zeroing line items no longer reported upstream");
        }
        let rows: Vec<Row> = aggregates
            .iter()
            .chain(superseded.iter())
            .map(to_row)
            .collect::<Result<_, _>>()
            .map_err(LedgerError::from)?;
        let report = self.deps.upsert(&tables::LINE_ITEM_DAILY, rows).await?;
        Ok(StepResult::Done {
            count: report.written,
        })
    }
}

/// Derives coverage and profit for every day of the window from stored raw facts.
pub struct RecomputeStep {
    deps: StepDeps,
}

impl RecomputeStep {
    pub fn new(deps: StepDeps) -> Self {
        Self { deps }
    }

    async fn load_settings(&self, client_id: &str) -> Result<CostSettings, StoreError> {
        let rows = self
            .deps
            .store
            .scan(&tables::COST_SETTINGS, client_id, None)
            .await?;
        match rows.into_iter().next() {
            Some(row) => {
                let mut settings: CostSettings = from_row(row)?;
                settings.client_id = client_id.to_string();
                Ok(settings)
            }
            None => Ok(CostSettings::for_client(client_id)),
        }
    }
}

#[async_trait]
impl SyncStep for RecomputeStep {
    fn name(&self) -> String {
        STEP_RECOMPUTE.to_string()
    }

    async fn run(&self, request: &StepRequest) -> Result<StepResult, LedgerError> {
        let client_id = request.client_id.as_str();
        let window = &request.window;
        let store = self.deps.store.as_ref();

        let settings = self.load_settings(client_id).await?;
        let source_days: Vec<SourceDay> =
            scan_typed(store, &tables::SOURCE_DAILY, client_id, Some(window)).await?;
        let line_items: Vec<LineItemAggregate> =
            scan_typed(store, &tables::LINE_ITEM_DAILY, client_id, Some(window)).await?;
        let product_costs: Vec<ProductCost> =
            scan_typed(store, &tables::PRODUCT_COSTS, client_id, None).await?;
        let lookup: BTreeMap<String, f64> = product_costs
            .into_iter()
            .map(|c| (c.cost_key, c.unit_cost))
            .collect();

        let mut activity: BTreeMap<NaiveDate, DailyActivity> = BTreeMap::new();
        for part in &source_days {
            activity
                .entry(part.date)
                .or_insert_with(|| DailyActivity::empty(client_id, part.date))
                .absorb(part);
        }
        let mut items_by_day: BTreeMap<NaiveDate, Vec<LineItemAggregate>> = BTreeMap::new();
        for item in line_items {
            items_by_day.entry(item.date).or_default().push(item);
        }

        let mut coverage_rows = Vec::new();
        let mut profit_rows = Vec::new();
        let mut warnings = 0usize;
        for day in window.days() {
            let day_activity = activity
                .remove(&day)
                .unwrap_or_else(|| DailyActivity::empty(client_id, day));
            let items = items_by_day.remove(&day).unwrap_or_default();

            let raw = aggregate_coverage(client_id, day, &items, &lookup, &settings);
            let (coverage, day_warnings) = clamp_to_activity(&raw, &day_activity, &settings);
            for w in &day_warnings {
                warn!(
                    client_id = %w.client_id,
                    date = %w.date,
                    field = w.field,
                    observed = w.observed,
                    limit = w.limit,
                    "coverage exceeded day totals; clamped"
                );
            }
            warnings += day_warnings.len();

            let summary = allocate(&day_activity, &coverage, &settings);
            coverage_rows.push(to_row(&coverage.rounded())?);
            profit_rows.push(to_row(&summary.rounded())?);
        }

        self.deps.upsert(&tables::COVERAGE_DAILY, coverage_rows).await?;
        let report = self.deps.upsert(&tables::PROFIT_DAILY, profit_rows).await?;
        info!(days = report.written, warnings, "ledger recomputed");
        Ok(StepResult::Done {
            count: report.written,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::PipelineAuth;
    use ledgr_adapters::{Page, StaticCredentialStore};
    use ledgr_core::{AdInsightRow, RawLineItem, RawOrder};
    use ledgr_storage::MemoryStore;

    pub(crate) struct FakeStorefront {
        pub orders: Vec<RawOrder>,
        pub costs: BTreeMap<String, f64>,
    }

    #[async_trait]
    impl StorefrontSource for FakeStorefront {
        fn provider(&self) -> &'static str {
            "shopify"
        }

        async fn fetch_orders_page(
            &self,
            _credential: &ProviderCredential,
            _window: &DateWindow,
            _cursor: Option<String>,
        ) -> Result<Page<RawOrder>, SourceError> {
            Ok(Page::last(self.orders.clone()))
        }

        async fn fetch_unit_costs(
            &self,
            _credential: &ProviderCredential,
            ids: &[String],
        ) -> Result<BTreeMap<String, f64>, SourceError> {
            Ok(self
                .costs
                .iter()
                .filter(|(k, _)| ids.contains(k))
                .map(|(k, v)| (k.clone(), *v))
                .collect())
        }
    }

    struct FakeAds(Vec<AdInsightRow>);

    #[async_trait]
    impl AdSpendSource for FakeAds {
        fn provider(&self) -> &'static str {
            "meta"
        }

        async fn fetch_insights_page(
            &self,
            _credential: &ProviderCredential,
            _window: &DateWindow,
            _cursor: Option<String>,
        ) -> Result<Page<AdInsightRow>, SourceError> {
            Ok(Page::last(self.0.clone()))
        }
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
    }

    fn request() -> StepRequest {
        StepRequest {
            run_id: Uuid::nil(),
            client_id: "acme".into(),
            window: DateWindow::new(day(1), day(3)).unwrap(),
            zone: BucketZone::Utc,
            grant: PipelineAuth::internal("test"),
        }
    }

    fn deps(store: Arc<MemoryStore>, connected: &[&str]) -> StepDeps {
        let mut creds = StaticCredentialStore::new();
        for provider in connected {
            creds.insert("acme", provider, ProviderCredential::new("acct", "secret"));
        }
        StepDeps {
            store,
            credentials: Arc::new(creds),
            max_pages: 10,
            upsert_max_attempts: 8,
        }
    }

    fn order(id: &str, processed: &str, subtotal: f64, item: (&str, i64, f64)) -> RawOrder {
        RawOrder {
            id: id.into(),
            processed_at: Some(processed.into()),
            created_at: None,
            updated_at: None,
            subtotal,
            test: false,
            line_items: vec![RawLineItem {
                cost_unit_id: item.0.into(),
                secondary_key: None,
                quantity: item.1,
                line_revenue: item.2,
            }],
            refunds: vec![],
        }
    }

    #[tokio::test]
    async fn storefront_step_writes_active_days_and_gap_fills_the_rest() {
        let store = Arc::new(MemoryStore::new());
        let source = Arc::new(FakeStorefront {
            orders: vec![order("1", "2026-03-02T10:00:00Z", 100.0, ("v1", 2, 100.0))],
            costs: BTreeMap::new(),
        });
        let step = StorefrontRevenueStep::new(deps(store.clone(), &["shopify"]), source);
        let result = step.run(&request()).await.unwrap();
        assert_eq!(result, StepResult::Done { count: 3 });

        let rows: Vec<SourceDay> = scan_typed(store.as_ref(), &tables::SOURCE_DAILY, "acme", None)
            .await
            .unwrap();
        assert_eq!(rows.len(), 3);
        let active = rows.iter().find(|r| r.date == day(2)).unwrap();
        assert_eq!(active.revenue, 100.0);
        assert_eq!(active.units, 2);
    }

    #[tokio::test]
    async fn unconnected_storefront_fails_with_412() {
        let store = Arc::new(MemoryStore::new());
        let source = Arc::new(FakeStorefront {
            orders: vec![],
            costs: BTreeMap::new(),
        });
        let step = StorefrontRevenueStep::new(deps(store, &[]), source);
        let err = step.run(&request()).await.unwrap_err();
        assert_eq!(err.http_status(), 412);
    }

    #[tokio::test]
    async fn optional_ad_step_skips_when_not_connected() {
        let store = Arc::new(MemoryStore::new());
        let step = AdSpendStep::new(deps(store.clone(), &[]), Arc::new(FakeAds(vec![])), false);
        let outcome = StepOutcome::from_result(&step.name(), step.run(&request()).await);
        assert!(outcome.ok && outcome.skipped);
        assert_eq!(outcome.status, 204);
        assert_eq!(outcome.step, "meta_spend_sync");
        assert_eq!(store.write_count().await, 0);
    }

    #[tokio::test]
    async fn recompute_produces_one_profit_row_per_window_day() {
        let store = Arc::new(MemoryStore::new());
        let deps = deps(store.clone(), &["shopify", "meta"]);
        let source = Arc::new(FakeStorefront {
            orders: vec![order("1", "2026-03-01T10:00:00Z", 1000.0, ("v1", 50, 900.0))],
            costs: BTreeMap::from([("v1".to_string(), 9.6)]),
        });
        let ads = Arc::new(FakeAds(vec![AdInsightRow {
            date: Some("2026-03-01".into()),
            timestamp: None,
            spend: 200.0,
        }]));

        StorefrontRevenueStep::new(deps.clone(), source.clone()).run(&request()).await.unwrap();
        AdSpendStep::new(deps.clone(), ads, false).run(&request()).await.unwrap();
        LineItemCogsStep::new(deps.clone(), source).run(&request()).await.unwrap();
        let result = RecomputeStep::new(deps).run(&request()).await.unwrap();
        assert_eq!(result, StepResult::Done { count: 3 });

        let profit: Vec<ledgr_core::ProfitSummary> =
            scan_typed(store.as_ref(), &tables::PROFIT_DAILY, "acme", None).await.unwrap();
        assert_eq!(profit.len(), 3);
        let first = &profit[0];
        assert_eq!(first.date, day(1));
        assert_eq!(first.paid_spend, 200.0);
        assert_eq!(first.mode, ledgr_core::AllocationMode::Hybrid);
        // 50 units at 9.60 known, 100 uncovered revenue at the 0.5 default margin
        assert_eq!(first.cogs, 530.0);
        assert_eq!(profit[1].revenue, 0.0);
        assert_eq!(profit[1].spend_efficiency, 0.0);
    }

    #[tokio::test]
    async fn incomplete_batch_is_a_persistence_failure() {
        let store = Arc::new(MemoryStore::new());
        store
            .fail_writes_for(&tables::SOURCE_DAILY, "acme|2026-03-02|storefront")
            .await;
        let source = Arc::new(FakeStorefront {
            orders: vec![order("1", "2026-03-02T10:00:00Z", 10.0, ("v1", 1, 10.0))],
            costs: BTreeMap::new(),
        });
        let step = StorefrontRevenueStep::new(deps(store, &["shopify"]), source);
        let err = step.run(&request()).await.unwrap_err();
        assert!(matches!(err, LedgerError::Persistence(_)));
        assert_eq!(err.http_status(), 500);
    }
}
