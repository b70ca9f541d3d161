//! Ads insight aggregation: per-ad daily rows to per-(ad-account, date)
//! facts. Pure, like the order normalisation next door.

use std::collections::BTreeSet;

use chrono::NaiveDate;
use rust_decimal::Decimal;

/// One ad-level row from the insights API for a single day.
#[derive(Debug, Clone)]
pub struct AdInsight {
    pub ad_id: String,
    pub spend: Decimal,
    pub impressions: i64,
    pub clicks: i64,
    pub purchases: i64,
    pub purchase_value: Decimal,
    pub currency: Option<String>,
    pub payload: serde_json::Value,
}

/// Per-(ad-account, date) fact row: the sum over all ads that day.
#[derive(Debug, Clone, PartialEq)]
pub struct AdsDayFact {
    pub insight_date: NaiveDate,
    pub spend: Decimal,
    pub impressions: i64,
    pub clicks: i64,
    pub purchases: i64,
    pub purchase_value: Decimal,
    pub currency: String,
}

/// Raw landing row for one (date, ad) pair.
#[derive(Debug, Clone)]
pub struct RawAdInsight {
    pub insight_date: NaiveDate,
    pub ad_id: String,
    pub payload: serde_json::Value,
}

/// Everything one ads run writes.
#[derive(Debug, Default)]
pub struct AdsBatch {
    pub raw: Vec<RawAdInsight>,
    pub facts: Vec<AdsDayFact>,
    pub dates: BTreeSet<NaiveDate>,
}

impl AdsBatch {
    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }

    /// Fold one day's ad-level rows into the batch. Days with no rows still
    /// produce a zeroed fact so a previously non-zero day gets corrected.
    pub fn add_day(&mut self, date: NaiveDate, ads: &[AdInsight], account_currency: &str) {
        let mut fact = AdsDayFact {
            insight_date: date,
            spend: Decimal::ZERO,
            impressions: 0,
            clicks: 0,
            purchases: 0,
            purchase_value: Decimal::ZERO,
            currency: account_currency.to_string(),
        };

        for ad in ads {
            fact.spend += ad.spend;
            fact.impressions += ad.impressions;
            fact.clicks += ad.clicks;
            fact.purchases += ad.purchases;
            fact.purchase_value += ad.purchase_value;
            if let Some(currency) = &ad.currency {
                fact.currency = currency.clone();
            }
            self.raw.push(RawAdInsight {
                insight_date: date,
                ad_id: ad.ad_id.clone(),
                payload: ad.payload.clone(),
            });
        }

        self.dates.insert(date);
        self.facts.push(fact);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insight(ad_id: &str, spend: i64, impressions: i64, clicks: i64) -> AdInsight {
        AdInsight {
            ad_id: ad_id.to_string(),
            spend: Decimal::new(spend, 2),
            impressions,
            clicks,
            purchases: 1,
            purchase_value: Decimal::new(spend * 3, 2),
            currency: Some("AUD".to_string()),
            payload: serde_json::json!({"ad_id": ad_id}),
        }
    }

    #[test]
    fn day_aggregate_sums_across_ads() {
        let date = NaiveDate::from_ymd_opt(2026, 1, 20).unwrap();
        let mut batch = AdsBatch::default();
        batch.add_day(date, &[insight("a1", 1250, 100, 7), insight("a2", 750, 50, 3)], "AUD");

        assert_eq!(batch.facts.len(), 1);
        let fact = &batch.facts[0];
        assert_eq!(fact.spend, Decimal::new(2000, 2));
        assert_eq!(fact.impressions, 150);
        assert_eq!(fact.clicks, 10);
        assert_eq!(fact.purchases, 2);
        assert_eq!(fact.purchase_value, Decimal::new(6000, 2));
        assert_eq!(batch.raw.len(), 2);
        assert!(batch.dates.contains(&date));
    }

    #[test]
    fn empty_day_still_lands_a_zeroed_fact() {
        let date = NaiveDate::from_ymd_opt(2026, 1, 21).unwrap();
        let mut batch = AdsBatch::default();
        batch.add_day(date, &[], "AUD");

        assert_eq!(batch.facts.len(), 1);
        assert_eq!(batch.facts[0].spend, Decimal::ZERO);
        assert_eq!(batch.facts[0].currency, "AUD");
        assert!(batch.raw.is_empty());
        assert!(batch.dates.contains(&date));
    }
}
