//! Shopify-style storefront over the Admin REST API (orders) and GraphQL API (unit costs).

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use ledgr_core::{DateWindow, RawLineItem, RawOrder, RawRefund};
use ledgr_storage::{HttpFetcher, HttpRequest};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::{
    decode_body, flexible_f64, flexible_id, Page, ProviderCredential, SourceError,
    StorefrontSource, PROVIDER_SHOPIFY,
};

pub const DEFAULT_API_VERSION: &str = "2024-07";
const PAGE_LIMIT: usize = 250;
const COST_BATCH: usize = 100;
const ORDER_FIELDS: &str =
    "id,processed_at,created_at,updated_at,subtotal_price,test,line_items,refunds";

#[derive(Debug, Deserialize)]
pub(crate) struct OrdersEnvelope {
    #[serde(default)]
    pub orders: Vec<ShopifyOrder>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ShopifyOrder {
    #[serde(default, deserialize_with = "flexible_id")]
    id: Option<String>,
    processed_at: Option<String>,
    created_at: Option<String>,
    updated_at: Option<String>,
    #[serde(default, deserialize_with = "flexible_f64")]
    subtotal_price: f64,
    #[serde(default)]
    test: bool,
    #[serde(default)]
    line_items: Vec<ShopifyLineItem>,
    #[serde(default)]
    refunds: Vec<ShopifyRefund>,
}

#[derive(Debug, Deserialize)]
struct ShopifyLineItem {
    #[serde(default, deserialize_with = "flexible_id")]
    id: Option<String>,
    #[serde(default, deserialize_with = "flexible_id")]
    variant_id: Option<String>,
    #[serde(default, deserialize_with = "flexible_id")]
    product_id: Option<String>,
    sku: Option<String>,
    #[serde(default)]
    quantity: i64,
    #[serde(default, deserialize_with = "flexible_f64")]
    price: f64,
    #[serde(default, deserialize_with = "flexible_f64")]
    total_discount: f64,
}

#[derive(Debug, Deserialize)]
struct ShopifyRefund {
    #[serde(default, deserialize_with = "flexible_id")]
    id: Option<String>,
    created_at: Option<String>,
    #[serde(default)]
    refund_line_items: Vec<ShopifyRefundLine>,
    #[serde(default)]
    transactions: Vec<ShopifyTransaction>,
}

#[derive(Debug, Deserialize)]
struct ShopifyRefundLine {
    #[serde(default)]
    quantity: i64,
    #[serde(default, deserialize_with = "flexible_f64")]
    subtotal: f64,
}

#[derive(Debug, Deserialize)]
struct ShopifyTransaction {
    #[serde(default)]
    kind: String,
    #[serde(default)]
    status: String,
    #[serde(default, deserialize_with = "flexible_f64")]
    amount: f64,
}

impl ShopifyLineItem {
    /// Variant id when present; otherwise a product- or line-scoped id that never matches a cost.
    fn cost_unit_id(&self) -> String {
        match (&self.variant_id, &self.product_id, &self.id) {
            (Some(variant), _, _) => variant.clone(),
            (None, Some(product), _) => format!("product:{product}"),
            (None, None, Some(line)) => format!("line:{line}"),
            (None, None, None) => "unknown".to_string(),
        }
    }
}

impl ShopifyRefund {
    /// Merchandise amount refunded. Refunds with no line items (e.g. goodwill refunds) fall
    /// back to the sum of successful refund transactions.
    fn amount(&self) -> f64 {
        if !self.refund_line_items.is_empty() {
            return self.refund_line_items.iter().map(|l| l.subtotal).sum();
        }
        self.transactions
            .iter()
            .filter(|t| t.kind == "refund" && t.status == "success")
            .map(|t| t.amount)
            .sum()
    }
}

pub(crate) fn normalize_orders(envelope: OrdersEnvelope) -> Vec<RawOrder> {
    envelope
        .orders
        .into_iter()
        .filter_map(|order| {
            let id = order.id?;
            let refunds = order
                .refunds
                .iter()
                .enumerate()
                .map(|(index, refund)| RawRefund {
                    id: refund.id.clone().unwrap_or_else(|| format!("{id}:refund:{index}")),
                    created_at: refund.created_at.clone(),
                    amount: refund.amount(),
                    quantity: refund.refund_line_items.iter().map(|l| l.quantity).sum(),
                })
                .collect();
            let line_items = order
                .line_items
                .iter()
                .map(|item| RawLineItem {
                    cost_unit_id: item.cost_unit_id(),
                    secondary_key: item.sku.clone().filter(|s| !s.trim().is_empty()),
                    quantity: item.quantity,
                    line_revenue: item.price * item.quantity as f64 - item.total_discount,
                })
                .collect();
            Some(RawOrder {
                id,
                processed_at: order.processed_at,
                created_at: order.created_at,
                updated_at: order.updated_at,
                subtotal: order.subtotal_price,
                test: order.test,
                line_items,
                refunds,
            })
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct GraphQlEnvelope {
    data: Option<NodesData>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct NodesData {
    #[serde(default)]
    nodes: Vec<Option<VariantNode>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VariantNode {
    id: String,
    inventory_item: Option<InventoryItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InventoryItem {
    unit_cost: Option<MoneyV2>,
}

#[derive(Debug, Deserialize)]
struct MoneyV2 {
    #[serde(deserialize_with = "flexible_f64")]
    amount: f64,
}

const VARIANT_GID: &str = "gid://shopify/ProductVariant/";

const UNIT_COST_QUERY: &str = "query UnitCosts($ids: [ID!]!) { \
     nodes(ids: $ids) { ... on ProductVariant { id inventoryItem { unitCost { amount } } } } }";

fn parse_unit_costs(body: &[u8]) -> Result<BTreeMap<String, f64>, SourceError> {
    let envelope: GraphQlEnvelope = decode_body(PROVIDER_SHOPIFY, body)?;
    if let Some(first) = envelope.errors.first() {
        let throttled = first.message.to_ascii_lowercase().contains("throttled");
        return Err(SourceError::Api {
            provider: PROVIDER_SHOPIFY.to_string(),
            status: if throttled { 429 } else { 200 },
            code: if throttled { "THROTTLED" } else { "GRAPHQL" }.to_string(),
            message: first.message.clone(),
        });
    }
    let nodes = envelope.data.map(|d| d.nodes).unwrap_or_default();
    Ok(nodes
        .into_iter()
        .flatten()
        .filter_map(|node| {
            let cost = node.inventory_item?.unit_cost?.amount;
            let id = node.id.strip_prefix(VARIANT_GID).unwrap_or(&node.id).to_string();
            (cost.is_finite() && cost >= 0.0).then_some((id, cost))
        })
        .collect())
}

#[derive(Debug, Clone)]
pub struct ShopifyStorefront {
    http: Arc<HttpFetcher>,
    api_version: String,
    base_url: Option<String>,
}

impl ShopifyStorefront {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self {
            http,
            api_version: DEFAULT_API_VERSION.to_string(),
            base_url: None,
        }
    }

    pub fn with_api_version(mut self, version: impl Into<String>) -> Self {
        self.api_version = version.into();
        self
    }

    /// Send every request to `base_url` instead of the shop's own domain.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    fn admin_root(&self, credential: &ProviderCredential) -> String {
        let root = match &self.base_url {
            Some(base) => base.trim_end_matches('/').to_string(),
            None if credential.account_ref.contains('.') => {
                format!("https://{}", credential.account_ref)
            }
            None => format!("https://{}.myshopify.com", credential.account_ref),
        };
        format!("{root}/admin/api/{}", self.api_version)
    }

    fn orders_url(&self, credential: &ProviderCredential, window: &DateWindow) -> Result<String, SourceError> {
        // a day of slack covers zones ahead of UTC
        let since = window.start - Duration::days(1);
        let url = reqwest::Url::parse_with_params(
            &format!("{}/orders.json", self.admin_root(credential)),
            &[
                ("status", "any".to_string()),
                ("limit", PAGE_LIMIT.to_string()),
                ("updated_at_min", format!("{since}T00:00:00Z")),
                ("fields", ORDER_FIELDS.to_string()),
            ],
        )
        .map_err(|e| SourceError::decode(PROVIDER_SHOPIFY, format!("building orders url: {e}")))?;
        Ok(url.to_string())
    }
}

#[async_trait]
impl StorefrontSource for ShopifyStorefront {
    fn provider(&self) -> &'static str {
        PROVIDER_SHOPIFY
    }

    async fn fetch_orders_page(
        &self,
        credential: &ProviderCredential,
        window: &DateWindow,
        cursor: Option<String>,
    ) -> Result<Page<RawOrder>, SourceError> {
        // the cursor is the `Link: rel="next"` url, which already carries every parameter
        let url = match cursor {
            Some(next) => next,
            None => self.orders_url(credential, window)?,
        };
        let request = HttpRequest::get(url).header("X-Shopify-Access-Token", &credential.credential);
        let response = self
            .http
            .fetch(PROVIDER_SHOPIFY, &request)
            .await
            .map_err(|e| SourceError::from_fetch(PROVIDER_SHOPIFY, e))?;
        let envelope: OrdersEnvelope = decode_body(PROVIDER_SHOPIFY, &response.body)?;
        let items = normalize_orders(envelope);
        debug!(orders = items.len(), has_next = response.next_link.is_some(), "shopify orders page");
        Ok(Page {
            items,
            next_cursor: response.next_link,
        })
    }

    async fn fetch_unit_costs(
        &self,
        credential: &ProviderCredential,
        cost_unit_ids: &[String],
    ) -> Result<BTreeMap<String, f64>, SourceError> {
        let variant_ids: Vec<&String> = cost_unit_ids
            .iter()
            .filter(|id| !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()))
            .collect();
        let url = format!("{}/graphql.json", self.admin_root(credential));
        let mut costs = BTreeMap::new();

        for batch in variant_ids.chunks(COST_BATCH) {
            let ids: Vec<String> = batch.iter().map(|id| format!("{VARIANT_GID}{id}")).collect();
            let request = HttpRequest::post_json(
                url.clone(),
                json!({ "query": UNIT_COST_QUERY, "variables": { "ids": ids } }),
            )
            .header("X-Shopify-Access-Token", &credential.credential);
            let response = self
                .http
                .fetch(PROVIDER_SHOPIFY, &request)
                .await
                .map_err(|e| SourceError::from_fetch(PROVIDER_SHOPIFY, e))?;
            costs.extend(parse_unit_costs(&response.body)?);
        }

        Ok(costs)
    }
}
