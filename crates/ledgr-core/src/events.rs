//! Normalized raw events handed from source adapters into the sync pipeline.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawOrder {
    pub id: String,
    pub processed_at: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    /// Merchandise revenue after discounts, before tax and shipping.
    pub subtotal: f64,
    #[serde(default)]
    pub test: bool,
    #[serde(default)]
    pub line_items: Vec<RawLineItem>,
    #[serde(default)]
    pub refunds: Vec<RawRefund>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawLineItem {
    pub cost_unit_id: String,
    pub secondary_key: Option<String>,
    pub quantity: i64,
    pub line_revenue: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRefund {
    pub id: String,
    pub created_at: Option<String>,
    pub amount: f64,
    #[serde(default)]
    pub quantity: i64,
}

/// One spend row from an ad platform. `date` is the platform's own day, already in the
/// ad account's zone; `timestamp` is only used when no day is given.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdInsightRow {
    pub date: Option<String>,
    pub timestamp: Option<String>,
    pub spend: f64,
}
