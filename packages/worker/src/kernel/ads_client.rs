//! Ads insights REST client.
//!
//! One call per (ad-account, day) at ad level, following `paging.next` until
//! exhaustion. The API has no cost telemetry; 429 and 5xx responses are
//! absorbed with the bounded exponential backoff of [`Backoff::ads`],
//! honouring `Retry-After` when the server sends one.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::warn;

use crate::common::SyncError;
use crate::config::Config;
use crate::domains::warehouse::ads::AdInsight;
use crate::kernel::throttle::Backoff;

const DEFAULT_BASE_URL: &str = "https://graph.ads-platform.com/v19.0";

/// Upper bound on `paging.next` follows per day; a next-link loop beyond
/// this is treated as a schema mismatch rather than an infinite fetch.
const MAX_PAGES_PER_DAY: u32 = 50;

/// Ad-level rows for one day, plus how many retries the fetch burned.
#[derive(Debug, Default)]
pub struct DayInsights {
    pub ads: Vec<AdInsight>,
    pub api_calls: u32,
    pub retries: u32,
}

/// Seam between the ads handlers and the REST transport.
#[async_trait]
pub trait InsightsSource: Send + Sync {
    async fn fetch_day(&self, ad_account: &str, day: NaiveDate) -> Result<DayInsights, SyncError>;
}

pub struct AdsClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    backoff: Backoff,
}

impl AdsClient {
    pub fn new(token: String, config: &Config) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| SyncError::Other(anyhow::anyhow!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: config
                .ads_api_base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            token,
            backoff: Backoff::ads(),
        })
    }

    /// One GET with the backoff loop around it. Returns the decoded page and
    /// the number of retries this call needed.
    async fn get_page(&self, url: &str, with_params: bool, ad_account: &str, day: NaiveDate)
        -> Result<(InsightsPage, u32), SyncError>
    {
        let mut retries = 0u32;
        loop {
            let mut request = self.http.get(url).bearer_auth(&self.token);
            if with_params {
                let time_range = format!(r#"{{"since":"{day}","until":"{day}"}}"#);
                request = request.query(&[
                    ("level", "ad"),
                    ("fields", "ad_id,spend,impressions,clicks,purchases,purchase_value,currency"),
                    (
                        "filtering",
                        r#"[{"field":"ad.effective_status","operator":"IN","value":["ACTIVE","PAUSED"]}]"#,
                    ),
                    ("time_range", time_range.as_str()),
                ]);
            }

            let response = request.send().await.map_err(|e| {
                SyncError::SourceUnavailable(format!("ads request failed: {e}"))
            })?;

            let status = response.status();
            if status.is_success() {
                let page: InsightsPage = response.json().await.map_err(|e| {
                    SyncError::SchemaMismatch(format!("undecodable ads response: {e}"))
                })?;
                return Ok((page, retries));
            }

            if status == reqwest::StatusCode::UNAUTHORIZED
                || status == reqwest::StatusCode::FORBIDDEN
            {
                return Err(SyncError::Auth(format!("ads API returned {status}")));
            }

            let retryable = status == reqwest::StatusCode::TOO_MANY_REQUESTS
                || status.is_server_error();
            if !retryable {
                let text = response.text().await.unwrap_or_default();
                return Err(SyncError::Other(anyhow::anyhow!(
                    "ads API error {status}: {text}"
                )));
            }

            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);

            retries += 1;
            if retries >= self.backoff.max_attempts {
                return Err(if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                    SyncError::RateLimited(format!(
                        "ads API 429 for {ad_account} {day} after {retries} attempts"
                    ))
                } else {
                    SyncError::SourceUnavailable(format!(
                        "ads API {status} for {ad_account} {day} after {retries} attempts"
                    ))
                });
            }

            let wait = self.backoff.next_delay(retries - 1, retry_after);
            warn!(
                %status,
                ad_account,
                %day,
                attempt = retries,
                wait_ms = wait.as_millis() as u64,
                "ads API retryable failure, backing off"
            );
            tokio::time::sleep(wait).await;
        }
    }
}

#[async_trait]
impl InsightsSource for AdsClient {
    async fn fetch_day(&self, ad_account: &str, day: NaiveDate) -> Result<DayInsights, SyncError> {
        let mut out = DayInsights::default();
        let first_url = format!("{}/{}/insights", self.base_url, ad_account);
        let mut next: Option<String> = None;
        let mut pages = 0u32;

        loop {
            let (page, retries) = match &next {
                None => self.get_page(&first_url, true, ad_account, day).await?,
                Some(url) => self.get_page(url, false, ad_account, day).await?,
            };
            out.api_calls += 1;
            out.retries += retries;

            for row in page.data {
                out.ads.push(decode_insight(row)?);
            }

            match page.paging.and_then(|p| p.next) {
                Some(url) => {
                    pages += 1;
                    if pages >= MAX_PAGES_PER_DAY {
                        return Err(SyncError::SchemaMismatch(format!(
                            "ads paging exceeded {MAX_PAGES_PER_DAY} pages for {ad_account} {day}"
                        )));
                    }
                    next = Some(url);
                }
                None => return Ok(out),
            }
        }
    }
}

// Wire types. Numeric fields arrive as strings; missing count fields read as
// zero, matching how the API omits them for days without delivery.

#[derive(Deserialize)]
struct InsightsPage {
    #[serde(default)]
    data: Vec<serde_json::Value>,
    paging: Option<Paging>,
}

#[derive(Deserialize)]
struct Paging {
    next: Option<String>,
}

#[derive(Deserialize)]
struct InsightRow {
    ad_id: String,
    spend: Option<String>,
    impressions: Option<String>,
    clicks: Option<String>,
    purchases: Option<String>,
    purchase_value: Option<String>,
    currency: Option<String>,
}

fn decode_insight(raw: serde_json::Value) -> Result<AdInsight, SyncError> {
    let row: InsightRow = serde_json::from_value(raw.clone()).map_err(|e| {
        let mut fragment = raw.to_string();
        fragment.truncate(200);
        SyncError::SchemaMismatch(format!("undecodable insight row: {e}; fragment: {fragment}"))
    })?;

    Ok(AdInsight {
        spend: decimal_field(&row.spend, &row.ad_id, "spend")?,
        impressions: int_field(&row.impressions, &row.ad_id, "impressions")?,
        clicks: int_field(&row.clicks, &row.ad_id, "clicks")?,
        purchases: int_field(&row.purchases, &row.ad_id, "purchases")?,
        purchase_value: decimal_field(&row.purchase_value, &row.ad_id, "purchase_value")?,
        currency: row.currency,
        ad_id: row.ad_id,
        payload: raw,
    })
}

fn decimal_field(raw: &Option<String>, ad_id: &str, field: &str) -> Result<Decimal, SyncError> {
    match raw {
        None => Ok(Decimal::ZERO),
        Some(v) => Decimal::from_str(v)
            .map_err(|e| SyncError::SchemaMismatch(format!("ad {ad_id} {field}: {e}"))),
    }
}

fn int_field(raw: &Option<String>, ad_id: &str, field: &str) -> Result<i64, SyncError> {
    match raw {
        None => Ok(0),
        Some(v) => v
            .parse::<i64>()
            .map_err(|e| SyncError::SchemaMismatch(format!("ad {ad_id} {field}: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_an_insight_row() {
        let raw = serde_json::json!({
            "ad_id": "238471",
            "spend": "12.50",
            "impressions": "1000",
            "clicks": "37",
            "purchases": "2",
            "purchase_value": "80.00",
            "currency": "AUD"
        });
        let insight = decode_insight(raw.clone()).unwrap();
        assert_eq!(insight.ad_id, "238471");
        assert_eq!(insight.spend, Decimal::new(1250, 2));
        assert_eq!(insight.impressions, 1000);
        assert_eq!(insight.payload, raw);
    }

    #[test]
    fn missing_count_fields_read_as_zero() {
        let raw = serde_json::json!({"ad_id": "238471"});
        let insight = decode_insight(raw).unwrap();
        assert_eq!(insight.spend, Decimal::ZERO);
        assert_eq!(insight.impressions, 0);
        assert_eq!(insight.purchases, 0);
    }

    #[test]
    fn garbage_numbers_are_schema_mismatch() {
        let raw = serde_json::json!({"ad_id": "238471", "spend": "lots"});
        let err = decode_insight(raw).unwrap_err();
        assert_eq!(err.error_code(), "schema_mismatch");
    }
}
