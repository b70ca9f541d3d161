//! End-to-end handler scenarios driven through mock sources.
//!
//! The warehouse is represented by the batch a handler would commit: the
//! fetch, dedup, normalisation, date-bucketing and cursor decisions all run
//! for real, against in-memory pages or a local HTTP stub.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde_json::json;

use worker_core::common::SyncError;
use worker_core::domains::sync::handlers::commerce::{
    collect_orders, window_fill_cursor_update,
};
use worker_core::domains::sync::models::cursor::next_cursor;
use worker_core::domains::warehouse::orders::{build_orders_batch, SourceOrder};
use worker_core::domains::warehouse::writer::summary_row;
use worker_core::kernel::ads_client::{AdsClient, InsightsSource};
use worker_core::kernel::commerce_client::{OrderFilter, OrdersPage, OrdersSource};
use worker_core::Config;

struct PagedSource {
    pages: Mutex<Vec<OrdersPage>>,
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

fn source_order(
    id: &str,
    created: &str,
    updated: &str,
    total: i64,
    refunds: i64,
    financial: &str,
    fulfillment: Option<&str>,
) -> SourceOrder {
    SourceOrder {
        external_id: id.to_string(),
        name: None,
        order_number: None,
        created_at: created.parse().unwrap(),
        updated_at: updated.parse().unwrap(),
        currency: Some("AUD".to_string()),
        current_total: None,
        total: Some(Decimal::new(total, 0)),
        total_refunds: (refunds > 0).then(|| Decimal::new(refunds, 0)),
        financial_status: Some(financial.to_string()),
        fulfillment_status: fulfillment.map(|s| s.to_string()),
        payload: json!({"id": id}),
    }
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// Scenario A: first fresh run with no cursor row lands both orders, buckets
/// them on their creation dates, and seeds the cursor from the greatest
/// observed update time.
#[tokio::test]
async fn fresh_with_empty_cursor_lands_both_orders() {
    let o1 = source_order(
        "o1",
        "2026-01-20T10:00:00Z",
        "2026-01-21T09:00:00Z",
        150,
        0,
        "paid",
        Some("fulfilled"),
    );
    let o2 = source_order(
        "o2",
        "2026-01-22T08:00:00Z",
        "2026-01-22T08:00:00Z",
        80,
        10,
        "refunded",
        None,
    );
    let source = PagedSource {
        pages: Mutex::new(vec![OrdersPage {
            orders: vec![o1, o2],
            has_next_page: false,
            end_cursor: None,
        }]),
    };

    let filter = OrderFilter::updated_since("2026-01-15T00:00:00Z".parse().unwrap());
    let fetched = collect_orders(&source, &filter).await.unwrap();
    let batch = build_orders_batch(&fetched.orders, "AUD").unwrap();

    assert_eq!(batch.facts.len(), 2);
    assert_eq!(
        batch.dates.iter().copied().collect::<Vec<_>>(),
        vec![date(2026, 1, 20), date(2026, 1, 22)]
    );

    let jan20: Vec<_> = batch
        .facts
        .iter()
        .filter(|f| f.order_date == date(2026, 1, 20))
        .collect();
    assert_eq!(jan20.len(), 1);
    assert_eq!(jan20[0].net, Decimal::new(150, 0));
    assert_eq!(jan20[0].order_status.as_deref(), Some("paid / fulfilled"));

    let jan22: Vec<_> = batch
        .facts
        .iter()
        .filter(|f| f.order_date == date(2026, 1, 22))
        .collect();
    assert_eq!(jan22.len(), 1);
    assert_eq!(jan22[0].net, Decimal::new(70, 0));
    assert_eq!(jan22[0].order_status.as_deref(), Some("refunded"));

    // Empty cursor initialises to the maximum observed updated_at.
    let next = next_cursor(None, batch.max_updated_at.as_deref());
    assert_eq!(next.as_deref(), Some("2026-01-22T08:00:00Z"));
}

/// Scenario B: a second fresh run that fetches nothing does not move the
/// cursor and has nothing to write.
#[tokio::test]
async fn second_fresh_with_nothing_new_is_a_noop() {
    let source = PagedSource {
        pages: Mutex::new(vec![]),
    };
    let filter = OrderFilter::updated_since("2026-01-22T08:00:00Z".parse().unwrap());
    let fetched = collect_orders(&source, &filter).await.unwrap();
    let batch = build_orders_batch(&fetched.orders, "AUD").unwrap();

    assert!(batch.is_empty());
    assert_eq!(
        next_cursor(Some("2026-01-22T08:00:00Z"), batch.max_updated_at.as_deref()),
        None
    );
}

/// Scenario E: window_fill with an existing cursor leaves it alone; without
/// one it seeds an initialise-only write.
#[test]
fn window_fill_initialises_cursor_only_if_missing() {
    let untouched =
        window_fill_cursor_update(Some("2026-01-22T08:00:00Z"), Some("2026-01-25T00:00:00Z"));
    assert!(untouched.is_none());

    let seeded = window_fill_cursor_update(None, Some("2026-01-25T00:00:00Z")).unwrap();
    assert!(seeded.only_if_absent);
    assert_eq!(seeded.value, "2026-01-25T00:00:00Z");

    assert!(window_fill_cursor_update(None, None).is_none());
}

/// Daily summary law over the scenario A numbers: 2026-01-22 has one order,
/// 70 net, no spend.
#[test]
fn summary_law_holds_for_the_scenario_numbers() {
    let (net, spend, mer, orders, aov) = summary_row(Decimal::new(70, 0), Decimal::ZERO, 1);
    assert_eq!(net, Decimal::new(70, 0));
    assert_eq!(spend, Decimal::ZERO);
    assert_eq!(mer, None);
    assert_eq!(orders, 1);
    assert_eq!(aov, Decimal::new(70, 0));

    let (_, _, mer, _, _) = summary_row(Decimal::new(70, 0), Decimal::new(35, 0), 1);
    assert_eq!(mer, Some(Decimal::new(2, 0)));
}

/// Scenario C: the ads client absorbs a 429 with one retry and the run
/// completes with the retry count surfaced in the day's stats.
#[tokio::test]
async fn ads_429_then_success_retries_once() {
    let hits = Arc::new(AtomicU32::new(0));

    async fn insights(State(hits): State<Arc<AtomicU32>>) -> axum::response::Response {
        if hits.fetch_add(1, Ordering::SeqCst) == 0 {
            (
                StatusCode::TOO_MANY_REQUESTS,
                [("retry-after", "1")],
                "rate limited",
            )
                .into_response()
        } else {
            Json(json!({
                "data": [{
                    "ad_id": "a1",
                    "spend": "12.50",
                    "impressions": "1000",
                    "clicks": "37",
                    "purchases": "2",
                    "purchase_value": "80.00",
                    "currency": "AUD"
                }],
                "paging": {}
            }))
            .into_response()
        }
    }

    let app = Router::new()
        .route("/v2/:account/insights", get(insights))
        .with_state(hits.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let config = test_config(Some(format!("http://{}/v2", addr)));
    let client = AdsClient::new("test-token".to_string(), &config).unwrap();

    let day = client
        .fetch_day("act_1234", date(2026, 1, 20))
        .await
        .unwrap();

    assert_eq!(day.retries, 1);
    assert_eq!(day.ads.len(), 1);
    assert_eq!(day.ads[0].spend, Decimal::new(1250, 2));
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

fn test_config(ads_api_base_url: Option<String>) -> Config {
    Config {
        database_url: "postgres://localhost/unused".to_string(),
        poll_interval_ms: 5000,
        commerce_api_version: "2025-01".to_string(),
        commerce_window_days: 7,
        ads_attribution_window_days: 7,
        commerce_fresh_sched_minutes: 60,
        ads_fresh_sched_minutes: 60,
        cron_secret: None,
        ads_jobs_enabled: true,
        health_port: 0,
        ads_api_base_url,
        ipv4_override: None::<Ipv4Addr>,
    }
}
