//! Coverage aggregation: how much of a day's revenue carries a trustworthy product cost.

use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;

use crate::{CostSettings, CoverageRecord, DailyActivity, DataIntegrityWarning, LineItemAggregate};

pub trait UnitCostLookup {
    fn unit_cost(&self, key: &str) -> Option<f64>;
}

impl UnitCostLookup for HashMap<String, f64> {
    fn unit_cost(&self, key: &str) -> Option<f64> {
        self.get(key).copied()
    }
}

impl UnitCostLookup for BTreeMap<String, f64> {
    fn unit_cost(&self, key: &str) -> Option<f64> {
        self.get(key).copied()
    }
}

fn usable(cost: Option<f64>) -> Option<f64> {
    cost.filter(|c| c.is_finite() && *c >= 0.0)
}

/// First usable cost wins: the line's own resolved cost, then the lookup by cost unit,
/// then the lookup by secondary key. Costs from several keys are never blended.
pub fn resolve_unit_cost(item: &LineItemAggregate, lookup: &dyn UnitCostLookup) -> Option<f64> {
    usable(item.unit_cost)
        .or_else(|| usable(lookup.unit_cost(&item.cost_unit_id)))
        .or_else(|| {
            item.secondary_key
                .as_deref()
                .and_then(|key| usable(lookup.unit_cost(key)))
        })
}

/// Raw coverage for one day. The result is not yet clamped against the day's totals;
/// pass it through [`clamp_to_activity`] before use.
pub fn aggregate_coverage(
    client_id: &str,
    date: NaiveDate,
    items: &[LineItemAggregate],
    lookup: &dyn UnitCostLookup,
    settings: &CostSettings,
) -> CoverageRecord {
    let missing_rate = 1.0 - settings.effective_margin();
    let mut record = CoverageRecord::empty(client_id, date);

    for item in items.iter().filter(|i| i.date == date) {
        match resolve_unit_cost(item, lookup) {
            Some(cost) => {
                record.product_cogs_known += item.units as f64 * cost;
                record.revenue_with_cogs += item.line_revenue;
                record.units_with_cogs += item.units;
            }
            None => record.estimated_cogs_missing += item.line_revenue * missing_rate,
        }
    }

    record
}

/// Clamp a coverage record so it never claims more revenue or units than the day has.
///
/// When covered revenue overshoots, known COGS is scaled down by the same factor so the
/// covered unit economics are preserved.
pub fn clamp_to_activity(
    record: &CoverageRecord,
    activity: &DailyActivity,
    settings: &CostSettings,
) -> (CoverageRecord, Vec<DataIntegrityWarning>) {
    let mut warnings = Vec::new();
    let mut clamped = record.clone();
    let revenue_cap = activity.revenue.max(0.0);
    let units_cap = activity.units.max(0);

    if clamped.revenue_with_cogs > revenue_cap {
        warnings.push(DataIntegrityWarning {
            client_id: activity.client_id.clone(),
            date: activity.date,
            field: "revenue_with_cogs",
            observed: clamped.revenue_with_cogs,
            limit: revenue_cap,
        });
        let factor = if clamped.revenue_with_cogs > 0.0 {
            revenue_cap / clamped.revenue_with_cogs
        } else {
            0.0
        };
        clamped.product_cogs_known *= factor;
        clamped.revenue_with_cogs = revenue_cap;
    }
    clamped.revenue_with_cogs = clamped.revenue_with_cogs.max(0.0);
    clamped.product_cogs_known = clamped.product_cogs_known.max(0.0);

    if clamped.units_with_cogs > units_cap {
        warnings.push(DataIntegrityWarning {
            client_id: activity.client_id.clone(),
            date: activity.date,
            field: "units_with_cogs",
            observed: clamped.units_with_cogs as f64,
            limit: units_cap as f64,
        });
        clamped.units_with_cogs = units_cap;
    }
    clamped.units_with_cogs = clamped.units_with_cogs.max(0);

    let uncovered = (revenue_cap - clamped.revenue_with_cogs).max(0.0);
    let missing_cap = uncovered * (1.0 - settings.effective_margin());
    clamped.estimated_cogs_missing = clamped.estimated_cogs_missing.clamp(0.0, missing_cap);

    (clamped, warnings)
}

/// Coverage fraction of a clamped record, in [0, 1].
pub fn coverage_fraction(record: &CoverageRecord, revenue: f64) -> f64 {
    if revenue > 0.0 {
        (record.revenue_with_cogs / revenue).clamp(0.0, 1.0)
    } else {
        0.0
    }
}
