//! Cost allocation: blends known and estimated COGS into one profit figure per day.

use serde::{Deserialize, Serialize};

use crate::coverage::coverage_fraction;
use crate::{CostSettings, CoverageRecord, DailyActivity, ProfitSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationMode {
    /// Nearly all revenue has a measured unit cost.
    Actual,
    Hybrid,
    /// COGS is estimated from margin or average unit cost.
    Modeled,
}

impl AllocationMode {
    pub fn confidence(self) -> Confidence {
        match self {
            Self::Actual => Confidence::High,
            Self::Hybrid => Confidence::Medium,
            Self::Modeled => Confidence::Low,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Actual => "actual",
            Self::Hybrid => "hybrid",
            Self::Modeled => "modeled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// Mode for a coverage fraction. A configured override short-circuits the thresholds.
pub fn select_mode(coverage: f64, settings: &CostSettings) -> AllocationMode {
    if let Some(mode) = settings.mode_override {
        return mode;
    }
    let actual = sanitize_threshold(settings.actual_threshold, crate::DEFAULT_ACTUAL_THRESHOLD);
    let hybrid =
        sanitize_threshold(settings.hybrid_threshold, crate::DEFAULT_HYBRID_THRESHOLD).min(actual);

    if coverage >= actual {
        AllocationMode::Actual
    } else if coverage >= hybrid {
        AllocationMode::Hybrid
    } else {
        AllocationMode::Modeled
    }
}

fn sanitize_threshold(value: f64, default: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        default
    }
}

/// COGS for a fully modeled day. A flat average cost per unit only applies when no
/// margin is configured.
fn modeled_cogs(revenue: f64, units: i64, settings: &CostSettings) -> f64 {
    match (settings.fallback_margin, settings.average_cost_per_unit) {
        (None, Some(avg)) if avg.is_finite() => units as f64 * avg,
        _ => revenue * (1.0 - settings.effective_margin()),
    }
}

/// Allocate costs for one day. `coverage` must already be clamped to the day's totals.
/// Values are left unrounded; call [`ProfitSummary::rounded`] when persisting.
pub fn allocate(
    activity: &DailyActivity,
    coverage: &CoverageRecord,
    settings: &CostSettings,
) -> ProfitSummary {
    let revenue = activity.revenue;
    let fraction = coverage_fraction(coverage, revenue);
    let mode = select_mode(fraction, settings);

    let cogs = match mode {
        AllocationMode::Actual => coverage.product_cogs_known + coverage.estimated_cogs_missing,
        AllocationMode::Hybrid => {
            let uncovered_revenue = (revenue - coverage.revenue_with_cogs).max(0.0);
            coverage.product_cogs_known + uncovered_revenue * (1.0 - settings.effective_margin())
        }
        AllocationMode::Modeled => modeled_cogs(revenue, activity.units, settings),
    };

    let orders = activity.orders as f64;
    let processing_fees = revenue * settings.fee_rate + orders * settings.fee_fixed;
    let variable_costs = orders
        * (settings.pick_pack_per_order
            + settings.shipping_subsidy_per_order
            + settings.materials_per_order)
        + revenue * settings.other_variable_pct;
    let fixed_costs = settings.fixed_daily;
    let paid_spend = activity.paid_spend;

    let contribution_profit =
        revenue - (cogs + processing_fees + variable_costs + fixed_costs + paid_spend);

    let (spend_efficiency, profit_efficiency) = if paid_spend > 0.0 {
        (revenue / paid_spend, contribution_profit / paid_spend)
    } else {
        (0.0, 0.0)
    };

    ProfitSummary {
        client_id: activity.client_id.clone(),
        date: activity.date,
        revenue,
        orders: activity.orders,
        units: activity.units,
        paid_spend,
        cogs,
        processing_fees,
        variable_costs,
        fixed_costs,
        contribution_profit,
        spend_efficiency,
        profit_efficiency,
        coverage: fraction,
        mode,
        confidence: mode.confidence(),
    }
}
