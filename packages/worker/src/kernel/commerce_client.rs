//! Commerce GraphQL client.
//!
//! Fetches the orders connection page by page, surfacing the cost telemetry
//! of every response to [`CostThrottle`] and sleeping out the computed delay
//! before handing the page back. The handler drives the pagination loop and
//! owns the stop conditions; the client owns per-call retries and the typed
//! error mapping.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::common::SyncError;
use crate::config::Config;
use crate::domains::integrations::Integration;
use crate::domains::warehouse::orders::{iso_utc, SourceOrder};
use crate::kernel::throttle::{Backoff, CostTelemetry, CostThrottle};

/// Orders per page; the connection's maximum.
const PAGE_SIZE: i64 = 100;

/// Header carrying the offline token.
const ACCESS_TOKEN_HEADER: &str = "X-Commerce-Access-Token";

const ORDERS_QUERY: &str = r#"
query WorkerOrders($first: Int!, $after: String, $query: String, $sortKey: OrderSortKeys) {
  orders(first: $first, after: $after, query: $query, sortKey: $sortKey) {
    pageInfo {
      hasNextPage
      endCursor
    }
    nodes {
      id
      name
      number
      createdAt
      updatedAt
      currencyCode
      displayFinancialStatus
      displayFulfillmentStatus
      currentTotalPriceSet { shopMoney { amount } }
      totalPriceSet { shopMoney { amount } }
      totalRefundedSet { shopMoney { amount } }
    }
  }
}
"#;

/// Which order timestamp the fetch filters and sorts by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderFilterField {
    CreatedAt,
    UpdatedAt,
}

/// Filter for one paginated orders fetch.
#[derive(Debug, Clone)]
pub struct OrderFilter {
    pub field: OrderFilterField,
    pub since: DateTime<Utc>,
}

impl OrderFilter {
    pub fn created_since(since: DateTime<Utc>) -> Self {
        Self {
            field: OrderFilterField::CreatedAt,
            since,
        }
    }

    pub fn updated_since(since: DateTime<Utc>) -> Self {
        Self {
            field: OrderFilterField::UpdatedAt,
            since,
        }
    }

    fn query_string(&self) -> String {
        let field = match self.field {
            OrderFilterField::CreatedAt => "created_at",
            OrderFilterField::UpdatedAt => "updated_at",
        };
        format!("{}:>='{}'", field, iso_utc(self.since))
    }

    fn sort_key(&self) -> &'static str {
        match self.field {
            OrderFilterField::CreatedAt => "CREATED_AT",
            OrderFilterField::UpdatedAt => "UPDATED_AT",
        }
    }
}

/// One page of the orders connection.
#[derive(Debug, Default)]
pub struct OrdersPage {
    pub orders: Vec<SourceOrder>,
    pub has_next_page: bool,
    pub end_cursor: Option<String>,
}

/// Seam between the commerce handlers and the GraphQL transport, so the
/// handlers can be driven by an in-memory source in tests.
#[async_trait]
pub trait OrdersSource: Send + Sync {
    async fn fetch_page(
        &self,
        filter: &OrderFilter,
        after: Option<&str>,
    ) -> Result<OrdersPage, SyncError>;
}

pub struct CommerceClient {
    http: reqwest::Client,
    endpoint: String,
    token: String,
    throttle: CostThrottle,
    backoff: Backoff,
}

impl CommerceClient {
    /// Build a client for one integration. `external_ref` is the shop
    /// domain; an `IPV4_OVERRIDE` pins it for resolvers without IPv6.
    pub fn new(integration: &Integration, token: String, config: &Config) -> Result<Self, SyncError> {
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(60));
        if let Some(ip) = config.ipv4_override {
            builder = builder.resolve(&integration.external_ref, SocketAddr::from((ip, 443)));
        }
        let http = builder
            .build()
            .map_err(|e| SyncError::Other(anyhow::anyhow!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            endpoint: format!(
                "https://{}/admin/api/{}/graphql.json",
                integration.external_ref, config.commerce_api_version
            ),
            token,
            throttle: CostThrottle,
            backoff: Backoff::ads(),
        })
    }

    async fn execute(
        &self,
        filter: &OrderFilter,
        after: Option<&str>,
    ) -> Result<PageAttempt, SyncError> {
        let body = json!({
            "query": ORDERS_QUERY,
            "variables": {
                "first": PAGE_SIZE,
                "after": after,
                "query": filter.query_string(),
                "sortKey": filter.sort_key(),
            },
        });

        let response = self
            .http
            .post(&self.endpoint)
            .header(ACCESS_TOKEN_HEADER, &self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                SyncError::SourceUnavailable(format!("commerce request failed: {e}"))
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(SyncError::Auth(format!("commerce API returned {status}")));
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Ok(PageAttempt::Throttled(None));
        }
        if status.is_server_error() {
            return Ok(PageAttempt::ServerError(status.as_u16()));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(SyncError::Other(anyhow::anyhow!(
                "commerce API error {status}: {text}"
            )));
        }

        let envelope: GraphQlEnvelope = response.json().await.map_err(|e| {
            SyncError::SchemaMismatch(format!("undecodable commerce response: {e}"))
        })?;

        let telemetry = envelope.cost_telemetry();

        if let Some(errors) = &envelope.errors {
            if errors.iter().any(|e| e.code() == Some("THROTTLED")) {
                return Ok(PageAttempt::Throttled(telemetry));
            }
            if errors.iter().any(|e| e.code() == Some("ACCESS_DENIED")) {
                return Err(SyncError::Auth("commerce API denied access".to_string()));
            }
            let first = errors.first().map(|e| e.message.clone()).unwrap_or_default();
            return Err(SyncError::SchemaMismatch(format!(
                "commerce GraphQL error: {first}"
            )));
        }

        let connection = envelope
            .data
            .and_then(|d| d.orders)
            .ok_or_else(|| {
                SyncError::SchemaMismatch("commerce response missing orders connection".to_string())
            })?;

        let mut orders = Vec::with_capacity(connection.nodes.len());
        for node in connection.nodes {
            orders.push(decode_order(node)?);
        }

        Ok(PageAttempt::Page(
            OrdersPage {
                orders,
                has_next_page: connection.page_info.has_next_page,
                end_cursor: connection.page_info.end_cursor,
            },
            telemetry,
        ))
    }
}

#[async_trait]
impl OrdersSource for CommerceClient {
    async fn fetch_page(
        &self,
        filter: &OrderFilter,
        after: Option<&str>,
    ) -> Result<OrdersPage, SyncError> {
        let mut attempt = 0u32;
        loop {
            match self.execute(filter, after).await? {
                PageAttempt::Page(page, telemetry) => {
                    // Reactive wait before the next call, per the telemetry
                    // this response carried.
                    let delay = self.throttle.delay_after(telemetry.as_ref());
                    if !delay.is_zero() {
                        debug!(delay_ms = delay.as_millis() as u64, "cost throttle wait");
                        tokio::time::sleep(delay).await;
                    }
                    return Ok(page);
                }
                PageAttempt::Throttled(telemetry) => {
                    attempt += 1;
                    if attempt >= self.backoff.max_attempts {
                        return Err(SyncError::RateLimited(
                            "commerce API throttled after retries".to_string(),
                        ));
                    }
                    let wait = self
                        .throttle
                        .delay_after(telemetry.as_ref())
                        .max(self.backoff.next_delay(attempt - 1, None));
                    warn!(attempt, wait_ms = wait.as_millis() as u64, "commerce throttled, retrying");
                    tokio::time::sleep(wait).await;
                }
                PageAttempt::ServerError(status) => {
                    attempt += 1;
                    if attempt >= self.backoff.max_attempts {
                        return Err(SyncError::SourceUnavailable(format!(
                            "commerce API {status} after retries"
                        )));
                    }
                    let wait = self.backoff.next_delay(attempt - 1, None);
                    warn!(attempt, status, "commerce server error, retrying");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}

enum PageAttempt {
    Page(OrdersPage, Option<CostTelemetry>),
    Throttled(Option<CostTelemetry>),
    ServerError(u16),
}

// Wire types. Nodes are kept as raw JSON first so the landing table stores
// the payload exactly as the source sent it.

#[derive(Deserialize)]
struct GraphQlEnvelope {
    data: Option<GraphQlData>,
    errors: Option<Vec<GraphQlError>>,
    extensions: Option<GraphQlExtensions>,
}

impl GraphQlEnvelope {
    fn cost_telemetry(&self) -> Option<CostTelemetry> {
        let cost = self.extensions.as_ref()?.cost.as_ref()?;
        let throttle = cost.throttle_status.as_ref()?;
        Some(CostTelemetry {
            currently_available: throttle.currently_available,
            maximum_available: throttle.maximum_available,
            restore_rate: throttle.restore_rate,
            requested_query_cost: cost.requested_query_cost?,
        })
    }
}

#[derive(Deserialize)]
struct GraphQlError {
    message: String,
    extensions: Option<GraphQlErrorExtensions>,
}

impl GraphQlError {
    fn code(&self) -> Option<&str> {
        self.extensions.as_ref()?.code.as_deref()
    }
}

#[derive(Deserialize)]
struct GraphQlErrorExtensions {
    code: Option<String>,
}

#[derive(Deserialize)]
struct GraphQlExtensions {
    cost: Option<GraphQlCost>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphQlCost {
    requested_query_cost: Option<f64>,
    throttle_status: Option<GraphQlThrottleStatus>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphQlThrottleStatus {
    maximum_available: f64,
    currently_available: f64,
    restore_rate: f64,
}

#[derive(Deserialize)]
struct GraphQlData {
    orders: Option<OrdersConnection>,
}

#[derive(Deserialize)]
struct OrdersConnection {
    #[serde(rename = "pageInfo")]
    page_info: PageInfo,
    nodes: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    has_next_page: bool,
    end_cursor: Option<String>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderNode {
    id: String,
    name: Option<String>,
    number: Option<i64>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    currency_code: Option<String>,
    display_financial_status: Option<String>,
    display_fulfillment_status: Option<String>,
    current_total_price_set: Option<MoneyBag>,
    total_price_set: Option<MoneyBag>,
    total_refunded_set: Option<MoneyBag>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MoneyBag {
    shop_money: Option<Money>,
}

#[derive(Serialize, Deserialize)]
struct Money {
    amount: String,
}

fn decode_order(raw: serde_json::Value) -> Result<SourceOrder, SyncError> {
    let node: OrderNode = serde_json::from_value(raw.clone()).map_err(|e| {
        SyncError::SchemaMismatch(format!("undecodable order node: {e}; fragment: {}", fragment(&raw)))
    })?;

    Ok(SourceOrder {
        current_total: decode_amount(&node.current_total_price_set, &node.id)?,
        total: decode_amount(&node.total_price_set, &node.id)?,
        total_refunds: decode_amount(&node.total_refunded_set, &node.id)?,
        external_id: node.id,
        name: node.name,
        order_number: node.number,
        created_at: node.created_at,
        updated_at: node.updated_at,
        currency: node.currency_code,
        financial_status: node.display_financial_status,
        fulfillment_status: node.display_fulfillment_status,
        payload: raw,
    })
}

fn decode_amount(bag: &Option<MoneyBag>, order_id: &str) -> Result<Option<Decimal>, SyncError> {
    let Some(money) = bag.as_ref().and_then(|b| b.shop_money.as_ref()) else {
        return Ok(None);
    };
    Decimal::from_str(&money.amount)
        .map(Some)
        .map_err(|e| SyncError::SchemaMismatch(format!("order {order_id} amount: {e}")))
}

/// A short prefix of the offending payload for the logs.
fn fragment(value: &serde_json::Value) -> String {
    let mut s = value.to_string();
    s.truncate(200);
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_query_string_and_sort_key() {
        let since = "2026-01-22T08:00:00Z".parse().unwrap();
        let filter = OrderFilter::updated_since(since);
        assert_eq!(filter.query_string(), "updated_at:>='2026-01-22T08:00:00Z'");
        assert_eq!(filter.sort_key(), "UPDATED_AT");

        let filter = OrderFilter::created_since(since);
        assert_eq!(filter.query_string(), "created_at:>='2026-01-22T08:00:00Z'");
        assert_eq!(filter.sort_key(), "CREATED_AT");
    }

    #[test]
    fn decodes_an_order_node_and_keeps_the_payload() {
        let raw = serde_json::json!({
            "id": "gid://commerce/Order/1001",
            "name": "#1001",
            "number": 1001,
            "createdAt": "2026-01-20T10:00:00Z",
            "updatedAt": "2026-01-21T09:00:00Z",
            "currencyCode": "AUD",
            "displayFinancialStatus": "paid",
            "displayFulfillmentStatus": "fulfilled",
            "currentTotalPriceSet": {"shopMoney": {"amount": "150.00"}},
            "totalPriceSet": {"shopMoney": {"amount": "150.00"}},
            "totalRefundedSet": {"shopMoney": {"amount": "0.00"}}
        });
        let order = decode_order(raw.clone()).unwrap();
        assert_eq!(order.external_id, "gid://commerce/Order/1001");
        assert_eq!(order.current_total, Some(Decimal::new(15000, 2)));
        assert_eq!(order.payload, raw);
    }

    #[test]
    fn garbage_amount_is_schema_mismatch() {
        let raw = serde_json::json!({
            "id": "gid://commerce/Order/1002",
            "createdAt": "2026-01-20T10:00:00Z",
            "updatedAt": "2026-01-20T10:00:00Z",
            "totalPriceSet": {"shopMoney": {"amount": "not-a-number"}}
        });
        let err = decode_order(raw).unwrap_err();
        assert_eq!(err.error_code(), "schema_mismatch");
    }

    #[test]
    fn telemetry_extraction_requires_the_full_record() {
        let envelope: GraphQlEnvelope = serde_json::from_value(serde_json::json!({
            "data": {"orders": {"pageInfo": {"hasNextPage": false, "endCursor": null}, "nodes": []}},
            "extensions": {"cost": {
                "requestedQueryCost": 252.0,
                "throttleStatus": {
                    "maximumAvailable": 2000.0,
                    "currentlyAvailable": 1748.0,
                    "restoreRate": 100.0
                }
            }}
        }))
        .unwrap();
        let t = envelope.cost_telemetry().unwrap();
        assert_eq!(t.requested_query_cost, 252.0);
        assert_eq!(t.currently_available, 1748.0);

        let bare: GraphQlEnvelope = serde_json::from_value(serde_json::json!({"data": null})).unwrap();
        assert!(bare.cost_telemetry().is_none());
    }
}
