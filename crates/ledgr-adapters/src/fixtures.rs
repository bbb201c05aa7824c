//! Fixture-backed sources for offline runs and tests.
//!
//! Files live at `<root>/<provider>/<account_ref>.json` and hold the same payload shape the
//! live provider returns for a single page; they are served back in fixed-size pages.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use ledgr_core::{AdInsightRow, DateWindow, RawOrder};
use serde::Deserialize;

use crate::shopify::{normalize_orders, OrdersEnvelope, ShopifyOrder};
use crate::{
    decode_body, google, meta, AdSpendSource, Page, ProviderCredential, SourceError,
    StorefrontSource, PROVIDER_GOOGLE, PROVIDER_META, PROVIDER_SHOPIFY,
};

pub const DEFAULT_PAGE_SIZE: usize = 50;

fn fixture_path(root: &Path, provider: &str, account_ref: &str) -> Result<PathBuf, SourceError> {
    let safe = !account_ref.is_empty()
        && account_ref
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        && !account_ref.starts_with('.');
    if !safe {
        return Err(SourceError::decode(provider, format!("unusable account ref {account_ref:?}")));
    }
    Ok(root.join(provider).join(format!("{account_ref}.json")))
}

fn read_fixture(root: &Path, provider: &str, account_ref: &str) -> Result<Vec<u8>, SourceError> {
    let path = fixture_path(root, provider, account_ref)?;
    fs::read(&path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => SourceError::Http {
            provider: provider.to_string(),
            status: 404,
            message: format!("no fixture at {}", path.display()),
        },
        _ => SourceError::Transport {
            provider: provider.to_string(),
            message: format!("reading {}: {e}", path.display()),
        },
    })
}

fn page_of<T>(mut items: Vec<T>, cursor: Option<&str>, page_size: usize, provider: &str) -> Result<Page<T>, SourceError> {
    let offset = match cursor {
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|_| SourceError::decode(provider, format!("bad fixture cursor {raw:?}")))?,
        None => 0,
    };
    let page_size = page_size.max(1);
    let total = items.len();
    let start = offset.min(total);
    let end = (start + page_size).min(total);
    let page: Vec<T> = items.drain(start..end).collect();
    Ok(Page {
        items: page,
        next_cursor: (end < total).then(|| end.to_string()),
    })
}

#[derive(Debug, Deserialize)]
struct StorefrontFixture {
    #[serde(default)]
    orders: Vec<ShopifyOrder>,
    #[serde(default)]
    unit_costs: BTreeMap<String, f64>,
}

#[derive(Debug, Clone)]
pub struct FixtureStorefront {
    root: PathBuf,
    page_size: usize,
}

impl FixtureStorefront {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    fn load(&self, credential: &ProviderCredential) -> Result<StorefrontFixture, SourceError> {
        let body = read_fixture(&self.root, PROVIDER_SHOPIFY, &credential.account_ref)?;
        decode_body(PROVIDER_SHOPIFY, &body)
    }
}

#[async_trait]
impl StorefrontSource for FixtureStorefront {
    fn provider(&self) -> &'static str {
        PROVIDER_SHOPIFY
    }

    async fn fetch_orders_page(
        &self,
        credential: &ProviderCredential,
        _window: &DateWindow,
        cursor: Option<String>,
    ) -> Result<Page<RawOrder>, SourceError> {
        let fixture = self.load(credential)?;
        let orders = normalize_orders(OrdersEnvelope {
            orders: fixture.orders,
        });
        page_of(orders, cursor.as_deref(), self.page_size, PROVIDER_SHOPIFY)
    }

    async fn fetch_unit_costs(
        &self,
        credential: &ProviderCredential,
        cost_unit_ids: &[String],
    ) -> Result<BTreeMap<String, f64>, SourceError> {
        let fixture = self.load(credential)?;
        Ok(fixture
            .unit_costs
            .into_iter()
            .filter(|(id, cost)| cost_unit_ids.contains(id) && cost.is_finite() && *cost >= 0.0)
            .collect())
    }
}

#[derive(Debug, Clone)]
pub struct FixtureAdSpend {
    provider: &'static str,
    root: PathBuf,
    page_size: usize,
}

impl FixtureAdSpend {
    pub fn meta(root: impl Into<PathBuf>) -> Self {
        Self {
            provider: PROVIDER_META,
            root: root.into(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn google(root: impl Into<PathBuf>) -> Self {
        Self {
            provider: PROVIDER_GOOGLE,
            root: root.into(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }
}

#[async_trait]
impl AdSpendSource for FixtureAdSpend {
    fn provider(&self) -> &'static str {
        self.provider
    }

    async fn fetch_insights_page(
        &self,
        credential: &ProviderCredential,
        window: &DateWindow,
        cursor: Option<String>,
    ) -> Result<Page<AdInsightRow>, SourceError> {
        let body = read_fixture(&self.root, self.provider, &credential.account_ref)?;
        let rows = if self.provider == PROVIDER_GOOGLE {
            google::rows_from(decode_body(self.provider, &body)?).items
        } else {
            meta::rows_from(decode_body(self.provider, &body)?).items
        };
        // the live APIs only return days inside the requested range
        let rows: Vec<AdInsightRow> = rows
            .into_iter()
            .filter(|row| {
                row.date
                    .as_deref()
                    .and_then(|d| chrono::NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
                    .map_or(true, |d| window.contains(d))
            })
            .collect();
        page_of(rows, cursor.as_deref(), self.page_size, self.provider)
    }
}
