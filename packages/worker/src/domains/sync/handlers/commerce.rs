//! Commerce sync handlers.
//!
//! `window_fill` re-fetches a fixed trailing window by creation time and only
//! initialises the update cursor when none exists; `fresh` fetches forward
//! from the cursor by update time and advances it, never backwards. Both land
//! through the same warehouse transaction.

use std::collections::HashSet;
use std::time::Instant;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::common::SyncError;
use crate::domains::integrations::Integration;
use crate::domains::sync::models::cursor::{
    self, CursorUpdate, LAST_SYNCED_ORDER_UPDATED_AT,
};
use crate::domains::sync::models::JobType;
use crate::domains::warehouse::orders::{build_orders_batch, SourceOrder};
use crate::kernel::commerce_client::{OrderFilter, OrdersSource};

use super::SyncDeps;

/// Whole-pagination ceiling. A filtered orders sweep that cannot finish
/// inside this window behaves like a bulk query that never became ready.
const PAGINATION_DEADLINE_SECS: u64 = 300;

#[derive(Debug, Serialize)]
pub struct WindowFillStats {
    pub fetched_orders: usize,
    pub persisted_orders: usize,
    pub dates_affected: Vec<NaiveDate>,
    pub api_calls: u32,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub cursor_initialized: bool,
}

#[derive(Debug, Serialize)]
pub struct FreshStats {
    pub fetched_orders: usize,
    pub persisted_orders: usize,
    pub dates_affected: Vec<NaiveDate>,
    pub api_calls: u32,
    pub cursor_previous: Option<String>,
    pub cursor_next: Option<String>,
    pub cursor_advanced: bool,
}

/// Everything one paginated fetch produced, deduplicated by external id.
#[derive(Debug, Default)]
pub struct FetchedOrders {
    pub orders: Vec<SourceOrder>,
    pub fetched: usize,
    pub api_calls: u32,
}

/// Drive the source until exhaustion.
///
/// The handler owns the stop conditions: in-run dedup by external id, the
/// missing-cursor defence (a page claiming more data but carrying no cursor
/// terminates pagination with a warning rather than looping), and the
/// 300-second pagination deadline.
pub async fn collect_orders(
    source: &dyn OrdersSource,
    filter: &OrderFilter,
) -> Result<FetchedOrders, SyncError> {
    let started = Instant::now();
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = FetchedOrders::default();
    let mut after: Option<String> = None;

    loop {
        if started.elapsed().as_secs() > PAGINATION_DEADLINE_SECS {
            return Err(SyncError::BulkNotReady {
                elapsed_secs: started.elapsed().as_secs(),
            });
        }

        let page = source.fetch_page(filter, after.as_deref()).await?;
        out.api_calls += 1;
        out.fetched += page.orders.len();

        for order in page.orders {
            if seen.insert(order.external_id.clone()) {
                out.orders.push(order);
            }
        }

        if !page.has_next_page {
            return Ok(out);
        }
        match page.end_cursor {
            Some(next) => after = Some(next),
            None => {
                warn!("source reported another page but sent no cursor, terminating pagination");
                return Ok(out);
            }
        }
    }
}

/// Backfill the trailing window by creation time.
pub async fn run_window_fill(
    source: &dyn OrdersSource,
    integration: &Integration,
    deps: &SyncDeps,
) -> Result<WindowFillStats, SyncError> {
    let window_end = Utc::now();
    let window_start = window_end - Duration::days(deps.config.commerce_window_days);
    let filter = OrderFilter::created_since(window_start);

    let fetched = collect_orders(source, &filter).await?;
    let shop_currency = integration.account_currency(&deps.pool).await?;
    let batch = build_orders_batch(&fetched.orders, &shop_currency)?;

    let existing = cursor::fetch(
        integration.id,
        JobType::CommerceFresh,
        LAST_SYNCED_ORDER_UPDATED_AT,
        &deps.pool,
    )
    .await?;
    let cursor_update =
        window_fill_cursor_update(existing.as_deref(), batch.max_updated_at.as_deref());

    let outcome = deps
        .warehouse
        .persist_orders(integration, &batch, cursor_update.as_ref())
        .await?;

    info!(
        integration_id = %integration.id,
        fetched = fetched.fetched,
        persisted = outcome.persisted,
        dates = outcome.dates.len(),
        cursor_initialized = outcome.cursor_written,
        "commerce window fill complete"
    );

    Ok(WindowFillStats {
        fetched_orders: fetched.fetched,
        persisted_orders: outcome.persisted,
        dates_affected: outcome.dates,
        api_calls: fetched.api_calls,
        window_start,
        window_end,
        cursor_initialized: outcome.cursor_written,
    })
}

/// Incremental sync by update time from the stored cursor.
pub async fn run_fresh(
    source: &dyn OrdersSource,
    integration: &Integration,
    deps: &SyncDeps,
) -> Result<FreshStats, SyncError> {
    let previous = cursor::fetch(
        integration.id,
        JobType::CommerceFresh,
        LAST_SYNCED_ORDER_UPDATED_AT,
        &deps.pool,
    )
    .await?;

    let since = match previous.as_deref() {
        Some(raw) => raw.parse::<DateTime<Utc>>().map_err(|e| {
            SyncError::SchemaMismatch(format!("stored cursor {raw:?} is not a timestamp: {e}"))
        })?,
        // No watermark yet: fall back to the trailing window. Deeper history
        // needs an explicit window_fill.
        None => Utc::now() - Duration::days(deps.config.commerce_window_days),
    };
    let filter = OrderFilter::updated_since(since);

    let fetched = collect_orders(source, &filter).await?;
    let shop_currency = integration.account_currency(&deps.pool).await?;
    let batch = build_orders_batch(&fetched.orders, &shop_currency)?;

    let next = cursor::next_cursor(previous.as_deref(), batch.max_updated_at.as_deref());
    let cursor_update = next.clone().map(|value| CursorUpdate {
        job_type: JobType::CommerceFresh,
        key: LAST_SYNCED_ORDER_UPDATED_AT,
        value,
        only_if_absent: false,
    });

    let outcome = deps
        .warehouse
        .persist_orders(integration, &batch, cursor_update.as_ref())
        .await?;

    let cursor_next = next.clone().or_else(|| previous.clone());
    info!(
        integration_id = %integration.id,
        fetched = fetched.fetched,
        persisted = outcome.persisted,
        dates = outcome.dates.len(),
        cursor_advanced = outcome.cursor_written,
        "commerce fresh sync complete"
    );

    Ok(FreshStats {
        fetched_orders: fetched.fetched,
        persisted_orders: outcome.persisted,
        dates_affected: outcome.dates,
        api_calls: fetched.api_calls,
        cursor_previous: previous,
        cursor_next,
        cursor_advanced: outcome.cursor_written,
    })
}

/// The fresh-run window fallback, exposed for tests.
pub fn fresh_fallback_since(now: DateTime<Utc>, window_days: i64) -> DateTime<Utc> {
    now - Duration::days(window_days)
}

/// Initialise-only cursor semantics for window_fill: an existing cursor
/// belongs to the fresh runs and is left alone; an absent one is seeded with
/// the greatest `updated_at` the fill observed.
pub fn window_fill_cursor_update(
    existing: Option<&str>,
    max_updated_at: Option<&str>,
) -> Option<CursorUpdate> {
    match (existing, max_updated_at) {
        (None, Some(max_updated)) => Some(CursorUpdate {
            job_type: JobType::CommerceFresh,
            key: LAST_SYNCED_ORDER_UPDATED_AT,
            value: max_updated.to_string(),
            only_if_absent: true,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::commerce_client::OrdersPage;
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use std::sync::Mutex;

    struct PagedSource {
        pages: Mutex<Vec<OrdersPage>>,
    }

    impl PagedSource {
        fn new(pages: Vec<OrdersPage>) -> Self {
            Self {
                pages: Mutex::new(pages),
            }
        }
    }

    #[async_trait]
    impl OrdersSource for PagedSource {
        async fn fetch_page(
            &self,
            _filter: &OrderFilter,
            _after: Option<&str>,
        ) -> Result<OrdersPage, SyncError> {
            let mut pages = self.pages.lock().unwrap();
            if pages.is_empty() {
                return Ok(OrdersPage::default());
            }
            Ok(pages.remove(0))
        }
    }

    fn order(id: &str, created: &str, updated: &str, total: i64) -> SourceOrder {
        SourceOrder {
            external_id: id.to_string(),
            name: None,
            order_number: None,
            created_at: created.parse().unwrap(),
            updated_at: updated.parse().unwrap(),
            currency: Some("AUD".to_string()),
            current_total: None,
            total: Some(Decimal::new(total, 0)),
            total_refunds: None,
            financial_status: Some("paid".to_string()),
            fulfillment_status: None,
            payload: serde_json::json!({"id": id}),
        }
    }

    #[tokio::test]
    async fn collects_across_pages_and_dedups() {
        let o1 = order("o1", "2026-01-20T10:00:00Z", "2026-01-21T09:00:00Z", 150);
        let o2 = order("o2", "2026-01-22T08:00:00Z", "2026-01-22T08:00:00Z", 80);
        let source = PagedSource::new(vec![
            OrdersPage {
                orders: vec![o1.clone(), o2.clone()],
                has_next_page: true,
                end_cursor: Some("cursor-1".to_string()),
            },
            OrdersPage {
                // o2 appears again on the second page; the run keeps one copy.
                orders: vec![o2.clone()],
                has_next_page: false,
                end_cursor: None,
            },
        ]);

        let filter = OrderFilter::updated_since("2026-01-01T00:00:00Z".parse().unwrap());
        let fetched = collect_orders(&source, &filter).await.unwrap();
        assert_eq!(fetched.api_calls, 2);
        assert_eq!(fetched.fetched, 3);
        assert_eq!(fetched.orders.len(), 2);
    }

    #[tokio::test]
    async fn missing_cursor_with_next_page_terminates() {
        let source = PagedSource::new(vec![OrdersPage {
            orders: vec![order("o1", "2026-01-20T10:00:00Z", "2026-01-20T10:00:00Z", 10)],
            has_next_page: true,
            end_cursor: None,
        }]);

        let filter = OrderFilter::created_since("2026-01-01T00:00:00Z".parse().unwrap());
        let fetched = collect_orders(&source, &filter).await.unwrap();
        assert_eq!(fetched.orders.len(), 1);
        assert_eq!(fetched.api_calls, 1);
    }

    #[test]
    fn fallback_window_is_the_configured_days() {
        let now: DateTime<Utc> = "2026-01-27T00:00:00Z".parse().unwrap();
        assert_eq!(
            fresh_fallback_since(now, 7),
            "2026-01-20T00:00:00Z".parse::<DateTime<Utc>>().unwrap()
        );
    }
}
