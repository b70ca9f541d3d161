//! Order normalisation: source order payloads to fact rows.
//!
//! Everything here is pure. The handlers build an [`OrdersBatch`] from the
//! fetched page set, and the writer persists it in one transaction. Monetary
//! fields are never silently coalesced: an order with no usable total is a
//! schema mismatch, while a missing order currency is only a warning and
//! inherits the shop currency.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rust_decimal::Decimal;
use tracing::warn;

use crate::common::SyncError;

/// An order as fetched from the commerce source, after decoding but before
/// normalisation. `payload` is the unmodified source object for the raw
/// landing table.
#[derive(Debug, Clone)]
pub struct SourceOrder {
    pub external_id: String,
    pub name: Option<String>,
    pub order_number: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub currency: Option<String>,
    pub current_total: Option<Decimal>,
    pub total: Option<Decimal>,
    pub total_refunds: Option<Decimal>,
    pub financial_status: Option<String>,
    pub fulfillment_status: Option<String>,
    pub payload: serde_json::Value,
}

/// Normalised per-order fact row.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderFact {
    pub order_name: String,
    pub gross: Decimal,
    pub net: Decimal,
    pub refund_total: Decimal,
    pub currency: String,
    pub order_date: NaiveDate,
    pub order_status: Option<String>,
}

/// Raw landing row for one order.
#[derive(Debug, Clone)]
pub struct RawOrder {
    pub external_id: String,
    pub payload: serde_json::Value,
    pub source_created_at: DateTime<Utc>,
    pub source_updated_at: DateTime<Utc>,
}

/// Everything one commerce run writes, plus the cursor candidate.
#[derive(Debug, Default)]
pub struct OrdersBatch {
    pub raw: Vec<RawOrder>,
    pub facts: Vec<OrderFact>,
    pub dates: BTreeSet<NaiveDate>,
    /// Greatest `updated_at` across the batch, ISO-8601 UTC.
    pub max_updated_at: Option<String>,
}

impl OrdersBatch {
    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }
}

/// Normalise one source order into a fact row.
pub fn normalize_order(order: &SourceOrder, shop_currency: &str) -> Result<OrderFact, SyncError> {
    let gross = match order.current_total.or(order.total) {
        Some(total) => total,
        None => {
            return Err(SyncError::SchemaMismatch(format!(
                "order {} has no current total and no total",
                order.external_id
            )));
        }
    };
    let refund_total = order.total_refunds.unwrap_or(Decimal::ZERO);
    let net = (gross - refund_total).max(Decimal::ZERO);

    let currency = match &order.currency {
        Some(c) => c.clone(),
        None => {
            warn!(
                order_id = %order.external_id,
                shop_currency,
                "order missing currency, inheriting shop currency"
            );
            shop_currency.to_string()
        }
    };

    Ok(OrderFact {
        order_name: order_display_name(order),
        gross,
        net,
        refund_total,
        currency,
        order_date: order.created_at.date_naive(),
        order_status: order_status(
            order.financial_status.as_deref(),
            order.fulfillment_status.as_deref(),
        ),
    })
}

/// Build the batch a run persists from its deduplicated order set.
pub fn build_orders_batch(
    orders: &[SourceOrder],
    shop_currency: &str,
) -> Result<OrdersBatch, SyncError> {
    let mut batch = OrdersBatch::default();

    for order in orders {
        let fact = normalize_order(order, shop_currency)?;
        batch.dates.insert(fact.order_date);
        batch.facts.push(fact);
        batch.raw.push(RawOrder {
            external_id: order.external_id.clone(),
            payload: order.payload.clone(),
            source_created_at: order.created_at,
            source_updated_at: order.updated_at,
        });

        let updated = iso_utc(order.updated_at);
        if batch
            .max_updated_at
            .as_deref()
            .map(|current| updated.as_str() > current)
            .unwrap_or(true)
        {
            batch.max_updated_at = Some(updated);
        }
    }

    Ok(batch)
}

/// ISO-8601 UTC with a trailing Z, the cursor wire format.
pub fn iso_utc(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Combined financial / fulfilment status, skipping nulls.
fn order_status(financial: Option<&str>, fulfillment: Option<&str>) -> Option<String> {
    match (financial, fulfillment) {
        (Some(f), Some(u)) => Some(format!("{} / {}", f, u)),
        (Some(f), None) => Some(f.to_string()),
        (None, Some(u)) => Some(u.to_string()),
        (None, None) => None,
    }
}

/// Order name fallback chain: source name, `#<order_number>`, then the tail
/// of the external id.
fn order_display_name(order: &SourceOrder) -> String {
    if let Some(name) = &order.name {
        return name.clone();
    }
    if let Some(number) = order.order_number {
        return format!("#{}", number);
    }
    let tail = order
        .external_id
        .rsplit('/')
        .next()
        .unwrap_or(&order.external_id);
    format!("order_{}", tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn order(created: &str, updated: &str) -> SourceOrder {
        SourceOrder {
            external_id: "gid://commerce/Order/1001".to_string(),
            name: Some("#1001".to_string()),
            order_number: Some(1001),
            created_at: created.parse().unwrap(),
            updated_at: updated.parse().unwrap(),
            currency: Some("AUD".to_string()),
            current_total: None,
            total: Some(Decimal::new(150, 0)),
            total_refunds: None,
            financial_status: Some("paid".to_string()),
            fulfillment_status: Some("fulfilled".to_string()),
            payload: serde_json::json!({"id": "gid://commerce/Order/1001"}),
        }
    }

    #[test]
    fn gross_prefers_current_total() {
        let mut o = order("2026-01-20T10:00:00Z", "2026-01-21T09:00:00Z");
        o.current_total = Some(Decimal::new(140, 0));
        let fact = normalize_order(&o, "AUD").unwrap();
        assert_eq!(fact.gross, Decimal::new(140, 0));
    }

    #[test]
    fn net_subtracts_refunds_and_floors_at_zero() {
        let mut o = order("2026-01-22T08:00:00Z", "2026-01-22T08:00:00Z");
        o.total = Some(Decimal::new(80, 0));
        o.total_refunds = Some(Decimal::new(10, 0));
        let fact = normalize_order(&o, "AUD").unwrap();
        assert_eq!(fact.net, Decimal::new(70, 0));

        o.total_refunds = Some(Decimal::new(500, 0));
        let fact = normalize_order(&o, "AUD").unwrap();
        assert_eq!(fact.net, Decimal::ZERO);
    }

    #[test]
    fn missing_totals_is_schema_mismatch() {
        let mut o = order("2026-01-20T10:00:00Z", "2026-01-20T10:00:00Z");
        o.current_total = None;
        o.total = None;
        let err = normalize_order(&o, "AUD").unwrap_err();
        assert_eq!(err.error_code(), "schema_mismatch");
    }

    #[test]
    fn missing_currency_inherits_shop() {
        let mut o = order("2026-01-20T10:00:00Z", "2026-01-20T10:00:00Z");
        o.currency = None;
        let fact = normalize_order(&o, "NZD").unwrap();
        assert_eq!(fact.currency, "NZD");
    }

    #[test]
    fn status_concatenation_skips_nulls() {
        assert_eq!(
            order_status(Some("paid"), Some("fulfilled")).as_deref(),
            Some("paid / fulfilled")
        );
        assert_eq!(order_status(Some("refunded"), None).as_deref(), Some("refunded"));
        assert_eq!(order_status(None, Some("partial")).as_deref(), Some("partial"));
        assert_eq!(order_status(None, None), None);
    }

    #[test]
    fn name_fallback_chain() {
        let mut o = order("2026-01-20T10:00:00Z", "2026-01-20T10:00:00Z");
        assert_eq!(order_display_name(&o), "#1001");

        o.name = None;
        assert_eq!(order_display_name(&o), "#1001");

        o.order_number = None;
        assert_eq!(order_display_name(&o), "order_1001");
    }

    #[test]
    fn order_date_is_the_utc_day() {
        let o = order("2026-01-20T23:59:59Z", "2026-01-21T00:00:01Z");
        let fact = normalize_order(&o, "AUD").unwrap();
        assert_eq!(
            fact.order_date,
            NaiveDate::from_ymd_opt(2026, 1, 20).unwrap()
        );
    }

    #[test]
    fn batch_dates_are_exactly_the_order_dates() {
        let orders = vec![
            order("2026-01-20T10:00:00Z", "2026-01-21T09:00:00Z"),
            {
                let mut o = order("2026-01-22T08:00:00Z", "2026-01-22T08:00:00Z");
                o.external_id = "gid://commerce/Order/1002".into();
                o
            },
            {
                // Same day as the first: no extra date bucket.
                let mut o = order("2026-01-20T18:00:00Z", "2026-01-20T18:00:00Z");
                o.external_id = "gid://commerce/Order/1003".into();
                o
            },
        ];
        let batch = build_orders_batch(&orders, "AUD").unwrap();
        let expected: BTreeSet<NaiveDate> = [
            NaiveDate::from_ymd_opt(2026, 1, 20).unwrap(),
            NaiveDate::from_ymd_opt(2026, 1, 22).unwrap(),
        ]
        .into();
        assert_eq!(batch.dates, expected);
        assert_eq!(batch.facts.len(), 3);
    }

    #[test]
    fn batch_tracks_max_updated_at() {
        let orders = vec![
            order("2026-01-20T10:00:00Z", "2026-01-21T09:00:00Z"),
            {
                let mut o = order("2026-01-22T08:00:00Z", "2026-01-22T08:00:00Z");
                o.external_id = "gid://commerce/Order/1002".into();
                o
            },
        ];
        let batch = build_orders_batch(&orders, "AUD").unwrap();
        assert_eq!(batch.max_updated_at.as_deref(), Some("2026-01-22T08:00:00Z"));
    }

    #[test]
    fn iso_format_matches_cursor_wire_format() {
        let ts = Utc.with_ymd_and_hms(2026, 1, 22, 8, 0, 0).unwrap();
        assert_eq!(iso_utc(ts), "2026-01-22T08:00:00Z");
    }
}
