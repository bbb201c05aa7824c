//! Day-bucketing of raw timestamped events into calendar-day keys.
//!
//! Orders land on the day of their `processed_at` timestamp (falling back to `created_at`),
//! converted into the client's zone using the offset in force at that instant. Refunds land
//! on their own creation day, so a late return reduces revenue on the day it happens.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;

use crate::events::{AdInsightRow, RawOrder};
use crate::{DateWindow, LineItemAggregate, SourceDay};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BucketZone {
    #[default]
    Utc,
    Named(Tz),
}

impl BucketZone {
    /// `None`, empty and `UTC` map to UTC; anything else must be an IANA zone name.
    pub fn parse(name: Option<&str>) -> Option<Self> {
        match name.map(str::trim) {
            None | Some("") => Some(Self::Utc),
            Some(n) if n.eq_ignore_ascii_case("utc") => Some(Self::Utc),
            Some(n) => n.parse::<Tz>().ok().map(Self::Named),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Utc => "UTC",
            Self::Named(tz) => tz.name(),
        }
    }

    pub fn local_day(&self, instant: DateTime<Utc>) -> NaiveDate {
        match self {
            Self::Utc => instant.date_naive(),
            Self::Named(tz) => instant.with_timezone(tz).date_naive(),
        }
    }
}

/// Counters for events that could not be bucketed or were collapsed as duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BucketStats {
    pub orders_seen: usize,
    pub duplicate_orders: usize,
    pub test_orders: usize,
    pub skipped_orders: usize,
    pub skipped_refunds: usize,
    pub skipped_rows: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DayBucketer {
    zone: BucketZone,
}

impl DayBucketer {
    pub fn new(zone: BucketZone) -> Self {
        Self { zone }
    }

    pub fn zone(&self) -> BucketZone {
        self.zone
    }

    /// Day key for an event, preferring `processed` over `created`. A present but
    /// malformed `processed` timestamp yields `None` rather than falling through.
    pub fn day_key(&self, processed: Option<&str>, created: Option<&str>) -> Option<NaiveDate> {
        let chosen = match processed.map(str::trim).filter(|s| !s.is_empty()) {
            Some(ts) => ts,
            None => created.map(str::trim).filter(|s| !s.is_empty())?,
        };
        parse_instant(chosen).map(|instant| self.zone.local_day(instant))
    }

    /// Storefront revenue per day inside `window`, with refunds netted on their own day.
    pub fn revenue_by_day(
        &self,
        client_id: &str,
        source: &str,
        window: &DateWindow,
        orders: &[RawOrder],
    ) -> (BTreeMap<NaiveDate, SourceDay>, BucketStats) {
        let mut stats = BucketStats::default();
        let orders = dedupe_orders(orders, &mut stats);
        let mut days: BTreeMap<NaiveDate, SourceDay> = BTreeMap::new();

        for order in &orders {
            if order.test {
                stats.test_orders += 1;
                continue;
            }

            match self.day_key(order.processed_at.as_deref(), order.created_at.as_deref()) {
                Some(day) if window.contains(day) => {
                    let entry = days
                        .entry(day)
                        .or_insert_with(|| SourceDay::zero(client_id, day, source));
                    entry.gross_sales += order.subtotal;
                    entry.revenue += order.subtotal;
                    entry.orders += 1;
                    entry.units += order.line_items.iter().map(|li| li.quantity).sum::<i64>();
                }
                Some(_) => {}
                None => stats.skipped_orders += 1,
            }

            let mut seen_refunds = Vec::new();
            for refund in &order.refunds {
                if seen_refunds.contains(&refund.id.as_str()) {
                    continue;
                }
                seen_refunds.push(refund.id.as_str());

                let Some(day) = self.day_key(None, refund.created_at.as_deref()) else {
                    stats.skipped_refunds += 1;
                    continue;
                };
                if !window.contains(day) {
                    continue;
                }
                let entry = days
                    .entry(day)
                    .or_insert_with(|| SourceDay::zero(client_id, day, source));
                entry.refunds += refund.amount;
                entry.revenue -= refund.amount;
                entry.units -= refund.quantity;
            }
        }

        (days, stats)
    }

    /// Line-item sales per (day, cost unit), bucketed on the owning order's day.
    pub fn line_items_by_day(
        &self,
        client_id: &str,
        window: &DateWindow,
        orders: &[RawOrder],
    ) -> (Vec<LineItemAggregate>, BucketStats) {
        let mut stats = BucketStats::default();
        let orders = dedupe_orders(orders, &mut stats);
        let mut grouped: BTreeMap<(NaiveDate, String), LineItemAggregate> = BTreeMap::new();

        for order in &orders {
            if order.test {
                stats.test_orders += 1;
                continue;
            }
            let Some(day) = self.day_key(order.processed_at.as_deref(), order.created_at.as_deref())
            else {
                stats.skipped_orders += 1;
                continue;
            };
            if !window.contains(day) {
                continue;
            }
            for item in &order.line_items {
                let entry = grouped
                    .entry((day, item.cost_unit_id.clone()))
                    .or_insert_with(|| LineItemAggregate {
                        client_id: client_id.to_string(),
                        date: day,
                        cost_unit_id: item.cost_unit_id.clone(),
                        secondary_key: None,
                        units: 0,
                        line_revenue: 0.0,
                        unit_cost: None,
                    });
                if entry.secondary_key.is_none() {
                    entry.secondary_key = item.secondary_key.clone();
                }
                entry.units += item.quantity;
                entry.line_revenue += item.line_revenue;
            }
        }

        (grouped.into_values().collect(), stats)
    }

    /// Ad spend per day inside `window`.
    pub fn spend_by_day(
        &self,
        client_id: &str,
        source: &str,
        window: &DateWindow,
        rows: &[AdInsightRow],
    ) -> (BTreeMap<NaiveDate, SourceDay>, BucketStats) {
        let mut stats = BucketStats::default();
        let mut days: BTreeMap<NaiveDate, SourceDay> = BTreeMap::new();

        for row in rows {
            let day = match row.date.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
                Some(raw) => NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok(),
                None => self.day_key(None, row.timestamp.as_deref()),
            };
            let Some(day) = day else {
                stats.skipped_rows += 1;
                continue;
            };
            if !window.contains(day) || !row.spend.is_finite() {
                continue;
            }
            days.entry(day)
                .or_insert_with(|| SourceDay::zero(client_id, day, source))
                .paid_spend += row.spend;
        }

        (days, stats)
    }
}

/// Parse an ISO-8601 instant. Timestamps without an offset are taken as UTC.
pub fn parse_instant(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::<FixedOffset>::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    None
}

/// Collapse orders delivered more than once, keeping the most recently updated copy.
fn dedupe_orders(orders: &[RawOrder], stats: &mut BucketStats) -> Vec<RawOrder> {
    let mut latest: HashMap<&str, &RawOrder> = HashMap::new();
    let mut order_of_arrival: Vec<&str> = Vec::new();

    for order in orders {
        stats.orders_seen += 1;
        match latest.get(order.id.as_str()).copied() {
            None => {
                order_of_arrival.push(order.id.as_str());
                latest.insert(order.id.as_str(), order);
            }
            Some(existing) => {
                stats.duplicate_orders += 1;
                let newer = match (
                    order.updated_at.as_deref().and_then(parse_instant),
                    existing.updated_at.as_deref().and_then(parse_instant),
                ) {
                    (Some(candidate), Some(current)) => candidate >= current,
                    (Some(_), None) => true,
                    _ => false,
                };
                if newer {
                    latest.insert(order.id.as_str(), order);
                }
            }
        }
    }

    order_of_arrival
        .into_iter()
        .filter_map(|id| latest.get(id).map(|o| (*o).clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{RawLineItem, RawRefund};

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn window(start: &str, end: &str) -> DateWindow {
        DateWindow::new(day(start), day(end)).unwrap()
    }

    fn order(id: &str, processed: &str, subtotal: f64) -> RawOrder {
        RawOrder {
            id: id.to_string(),
            processed_at: Some(processed.to_string()),
            created_at: None,
            updated_at: Some(processed.to_string()),
            subtotal,
            test: false,
            line_items: vec![RawLineItem {
                cost_unit_id: format!("variant-{id}"),
                secondary_key: Some(format!("SKU-{id}")),
                quantity: 2,
                line_revenue: subtotal,
            }],
            refunds: Vec::new(),
        }
    }

    #[test]
    fn processed_timestamp_wins_over_created() {
        let bucketer = DayBucketer::default();
        assert_eq!(
            bucketer.day_key(Some("2026-03-02T01:00:00Z"), Some("2026-03-01T23:00:00Z")),
            Some(day("2026-03-02"))
        );
        assert_eq!(
            bucketer.day_key(None, Some("2026-03-01T23:00:00Z")),
            Some(day("2026-03-01"))
        );
        assert_eq!(bucketer.day_key(Some("  "), Some("2026-03-01T23:00:00Z")), Some(day("2026-03-01")));
    }

    #[test]
    fn malformed_or_missing_timestamps_have_no_day() {
        let bucketer = DayBucketer::default();
        assert_eq!(bucketer.day_key(None, None), None);
        assert_eq!(bucketer.day_key(Some("yesterday"), Some("2026-03-01T00:00:00Z")), None);
        assert_eq!(bucketer.day_key(None, Some("2026-13-45T00:00:00Z")), None);
    }

    #[test]
    fn zone_offset_follows_daylight_saving() {
        let bucketer = DayBucketer::new(BucketZone::parse(Some("America/New_York")).unwrap());
        // EST (-05:00): 04:30Z is still the previous local day
        assert_eq!(
            bucketer.day_key(Some("2026-03-07T04:30:00Z"), None),
            Some(day("2026-03-06"))
        );
        // EDT (-04:00) after the March 8 transition: 04:30Z is already the same local day
        assert_eq!(
            bucketer.day_key(Some("2026-03-10T04:30:00Z"), None),
            Some(day("2026-03-10"))
        );
        assert_eq!(
            bucketer.day_key(Some("2026-03-10T03:30:00Z"), None),
            Some(day("2026-03-09"))
        );
    }

    #[test]
    fn unknown_zone_name_is_rejected() {
        assert_eq!(BucketZone::parse(Some("Mars/Olympus")), None);
        assert_eq!(BucketZone::parse(Some("utc")), Some(BucketZone::Utc));
        assert_eq!(BucketZone::parse(None), Some(BucketZone::Utc));
    }

    #[test]
    fn refund_lands_on_its_own_day_and_window_total_is_net() {
        let mut first = order("1", "2026-03-01T10:00:00Z", 100.0);
        first.refunds.push(RawRefund {
            id: "r1".into(),
            created_at: Some("2026-03-04T09:00:00Z".into()),
            amount: 40.0,
            quantity: 1,
        });
        let second = order("2", "2026-03-02T10:00:00Z", 50.0);

        let bucketer = DayBucketer::default();
        let (days, stats) = bucketer.revenue_by_day(
            "acme",
            "storefront",
            &window("2026-03-01", "2026-03-05"),
            &[first, second],
        );

        assert_eq!(days[&day("2026-03-01")].revenue, 100.0);
        assert_eq!(days[&day("2026-03-04")].revenue, -40.0);
        assert_eq!(days[&day("2026-03-04")].refunds, 40.0);
        assert_eq!(days[&day("2026-03-04")].orders, 0);
        assert_eq!(days[&day("2026-03-04")].units, -1);
        let total: f64 = days.values().map(|d| d.revenue).sum();
        assert_eq!(total, 150.0 - 40.0);
        assert_eq!(stats.skipped_refunds, 0);
    }

    #[test]
    fn refund_for_order_before_window_still_counts() {
        let mut old = order("1", "2026-02-20T10:00:00Z", 80.0);
        old.refunds.push(RawRefund {
            id: "r1".into(),
            created_at: Some("2026-03-02T12:00:00Z".into()),
            amount: 80.0,
            quantity: 2,
        });
        let (days, _) = DayBucketer::default().revenue_by_day(
            "acme",
            "storefront",
            &window("2026-03-01", "2026-03-05"),
            &[old],
        );
        assert_eq!(days.len(), 1);
        assert_eq!(days[&day("2026-03-02")].revenue, -80.0);
    }

    #[test]
    fn duplicate_orders_keep_latest_copy_and_skip_test_orders() {
        let stale = order("1", "2026-03-01T10:00:00Z", 100.0);
        let mut fresh = stale.clone();
        fresh.subtotal = 90.0;
        fresh.updated_at = Some("2026-03-01T12:00:00Z".into());
        let mut test = order("9", "2026-03-01T10:00:00Z", 999.0);
        test.test = true;

        let (days, stats) = DayBucketer::default().revenue_by_day(
            "acme",
            "storefront",
            &window("2026-03-01", "2026-03-01"),
            &[stale, fresh, test],
        );
        assert_eq!(days[&day("2026-03-01")].revenue, 90.0);
        assert_eq!(days[&day("2026-03-01")].orders, 1);
        assert_eq!(stats.duplicate_orders, 1);
        assert_eq!(stats.test_orders, 1);
    }

    #[test]
    fn line_items_group_by_day_and_cost_unit() {
        let a = order("1", "2026-03-01T10:00:00Z", 30.0);
        let mut b = order("2", "2026-03-01T11:00:00Z", 20.0);
        b.line_items[0].cost_unit_id = "variant-1".into();
        let (items, _) = DayBucketer::default().line_items_by_day(
            "acme",
            &window("2026-03-01", "2026-03-01"),
            &[a, b],
        );
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].units, 4);
        assert_eq!(items[0].line_revenue, 50.0);
        assert_eq!(items[0].secondary_key.as_deref(), Some("SKU-1"));
    }

    #[test]
    fn ad_rows_prefer_provider_day() {
        let rows = vec![
            AdInsightRow { date: Some("2026-03-01".into()), timestamp: None, spend: 12.5 },
            AdInsightRow { date: Some("2026-03-01".into()), timestamp: None, spend: 7.5 },
            AdInsightRow { date: None, timestamp: Some("2026-03-02T23:30:00Z".into()), spend: 5.0 },
            AdInsightRow { date: Some("not-a-day".into()), timestamp: None, spend: 1.0 },
        ];
        let (days, stats) = DayBucketer::default().spend_by_day(
            "acme",
            "meta",
            &window("2026-03-01", "2026-03-02"),
            &rows,
        );
        assert_eq!(days[&day("2026-03-01")].paid_spend, 20.0);
        assert_eq!(days[&day("2026-03-02")].paid_spend, 5.0);
        assert_eq!(stats.skipped_rows, 1);
    }
}
