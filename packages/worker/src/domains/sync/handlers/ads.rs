//! Ads sync handlers.
//!
//! Both job types re-fetch the attribution window a day at a time, so there
//! is no persistent cursor: `window_fill` covers the window ending today,
//! `fresh` the window ending yesterday. Every touched date is rebuilt
//! through the warehouse transaction.

use chrono::{Duration, NaiveDate, Utc};
use serde::Serialize;
use tracing::info;

use crate::common::SyncError;
use crate::domains::integrations::Integration;
use crate::domains::warehouse::ads::AdsBatch;
use crate::kernel::ads_client::InsightsSource;

use super::SyncDeps;

#[derive(Debug, Serialize)]
pub struct AdsWindowStats {
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    pub days: usize,
    pub ad_rows: usize,
    pub dates_affected: Vec<NaiveDate>,
    pub api_calls: u32,
    pub retries: u32,
}

/// Inclusive bounds of the window a run fetches.
pub fn window_bounds(today: NaiveDate, window_days: i64, ends_yesterday: bool) -> (NaiveDate, NaiveDate) {
    let end = if ends_yesterday {
        today - Duration::days(1)
    } else {
        today
    };
    let start = end - Duration::days(window_days.max(1) - 1);
    (start, end)
}

/// The inclusive day range a run fetches.
pub fn window_dates(today: NaiveDate, window_days: i64, ends_yesterday: bool) -> Vec<NaiveDate> {
    let (start, end) = window_bounds(today, window_days, ends_yesterday);
    let mut dates = Vec::with_capacity(window_days.max(1) as usize);
    let mut day = start;
    while day <= end {
        dates.push(day);
        day += Duration::days(1);
    }
    dates
}

/// Fetch and land the attribution window for one ad-account integration.
pub async fn run_window(
    source: &dyn InsightsSource,
    integration: &Integration,
    deps: &SyncDeps,
    ends_yesterday: bool,
) -> Result<AdsWindowStats, SyncError> {
    let today = Utc::now().date_naive();
    let (window_start, window_end) = window_bounds(
        today,
        deps.config.ads_attribution_window_days,
        ends_yesterday,
    );
    let dates = window_dates(today, deps.config.ads_attribution_window_days, ends_yesterday);
    let account_currency = integration.account_currency(&deps.pool).await?;

    let mut batch = AdsBatch::default();
    let mut api_calls = 0u32;
    let mut retries = 0u32;
    let mut ad_rows = 0usize;

    for day in &dates {
        let insights = source.fetch_day(&integration.external_ref, *day).await?;
        api_calls += insights.api_calls;
        retries += insights.retries;
        ad_rows += insights.ads.len();
        batch.add_day(*day, &insights.ads, &account_currency);
    }

    let outcome = deps.warehouse.persist_ads(integration, &batch).await?;

    info!(
        integration_id = %integration.id,
        days = dates.len(),
        ad_rows,
        retries,
        "ads window sync complete"
    );

    Ok(AdsWindowStats {
        window_start,
        window_end,
        days: dates.len(),
        ad_rows,
        dates_affected: outcome.dates,
        api_calls,
        retries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn window_fill_ends_today() {
        let dates = window_dates(date(2026, 1, 27), 7, false);
        assert_eq!(dates.len(), 7);
        assert_eq!(dates[0], date(2026, 1, 21));
        assert_eq!(*dates.last().unwrap(), date(2026, 1, 27));
    }

    #[test]
    fn fresh_ends_yesterday() {
        let dates = window_dates(date(2026, 1, 27), 7, true);
        assert_eq!(dates.len(), 7);
        assert_eq!(dates[0], date(2026, 1, 20));
        assert_eq!(*dates.last().unwrap(), date(2026, 1, 26));
    }

    #[test]
    fn one_day_window_is_a_single_day() {
        let dates = window_dates(date(2026, 1, 27), 1, true);
        assert_eq!(dates, vec![date(2026, 1, 26)]);
    }

    #[test]
    fn window_crosses_month_boundaries() {
        let dates = window_dates(date(2026, 2, 2), 7, false);
        assert_eq!(dates[0], date(2026, 1, 27));
        assert_eq!(*dates.last().unwrap(), date(2026, 2, 2));
    }
}
