//! Transactional warehouse writes.
//!
//! One transaction per run covers the raw upsert, the fact replace, the
//! per-source daily rebuild, the blended daily summary rebuild, and the
//! optional cursor write. A date touched by any fact is always rebuilt
//! end-to-end; a rolled-back transaction leaves every table untouched.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use crate::common::SyncError;
use crate::domains::integrations::Integration;
use crate::domains::sync::models::cursor::{self, CursorUpdate};

use super::ads::AdsBatch;
use super::orders::OrdersBatch;

/// Statement parameter ceiling: rows per batched insert.
const MAX_BATCH_ROWS: usize = 1000;

/// What a persist call committed.
#[derive(Debug, Clone)]
pub struct PersistOutcome {
    pub persisted: usize,
    pub dates: Vec<NaiveDate>,
    pub cursor_written: bool,
}

#[derive(Clone)]
pub struct Warehouse {
    pool: PgPool,
}

impl Warehouse {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Land one commerce run: raw upsert, fact replace by order name, daily
    /// commerce metrics and daily summary rebuilt for every touched date,
    /// plus the handler's cursor write, all in one transaction.
    pub async fn persist_orders(
        &self,
        integration: &Integration,
        batch: &OrdersBatch,
        cursor_update: Option<&CursorUpdate>,
    ) -> Result<PersistOutcome, SyncError> {
        if batch.is_empty() && cursor_update.is_none() {
            return Ok(PersistOutcome {
                persisted: 0,
                dates: Vec::new(),
                cursor_written: false,
            });
        }

        let dates: Vec<NaiveDate> = batch.dates.iter().copied().collect();
        let mut tx = self.pool.begin().await.map_err(SyncError::DbWrite)?;

        for chunk in batch.raw.chunks(MAX_BATCH_ROWS) {
            let external_ids: Vec<&str> = chunk.iter().map(|r| r.external_id.as_str()).collect();
            let payloads: Vec<serde_json::Value> = chunk.iter().map(|r| r.payload.clone()).collect();
            let created: Vec<chrono::DateTime<chrono::Utc>> =
                chunk.iter().map(|r| r.source_created_at).collect();
            let updated: Vec<chrono::DateTime<chrono::Utc>> =
                chunk.iter().map(|r| r.source_updated_at).collect();

            sqlx::query(
                r#"
                INSERT INTO raw_orders
                    (integration_id, external_id, payload, source_created_at, source_updated_at, landed_at)
                SELECT $1, v.external_id, v.payload, v.created_at, v.updated_at, NOW()
                FROM UNNEST($2::text[], $3::jsonb[], $4::timestamptz[], $5::timestamptz[])
                    AS v(external_id, payload, created_at, updated_at)
                ON CONFLICT (integration_id, external_id) DO UPDATE
                SET payload = EXCLUDED.payload,
                    source_created_at = EXCLUDED.source_created_at,
                    source_updated_at = EXCLUDED.source_updated_at,
                    landed_at = NOW()
                "#,
            )
            .bind(integration.id)
            .bind(&external_ids)
            .bind(&payloads)
            .bind(&created)
            .bind(&updated)
            .execute(&mut *tx)
            .await?;
        }

        if !batch.facts.is_empty() {
            let names: Vec<&str> = batch.facts.iter().map(|f| f.order_name.as_str()).collect();
            sqlx::query(
                r#"
                DELETE FROM fact_orders
                WHERE integration_id = $1 AND order_name = ANY($2::text[])
                "#,
            )
            .bind(integration.id)
            .bind(&names)
            .execute(&mut *tx)
            .await?;

            for chunk in batch.facts.chunks(MAX_BATCH_ROWS) {
                let names: Vec<&str> = chunk.iter().map(|f| f.order_name.as_str()).collect();
                let gross: Vec<Decimal> = chunk.iter().map(|f| f.gross).collect();
                let net: Vec<Decimal> = chunk.iter().map(|f| f.net).collect();
                let refunds: Vec<Decimal> = chunk.iter().map(|f| f.refund_total).collect();
                let currencies: Vec<&str> = chunk.iter().map(|f| f.currency.as_str()).collect();
                let order_dates: Vec<NaiveDate> = chunk.iter().map(|f| f.order_date).collect();
                let statuses: Vec<Option<String>> =
                    chunk.iter().map(|f| f.order_status.clone()).collect();

                sqlx::query(
                    r#"
                    INSERT INTO fact_orders
                        (integration_id, account_id, shop_ref, order_name, gross, net,
                         refund_total, currency, order_date, order_status)
                    SELECT $1, $2, $3, v.order_name, v.gross, v.net,
                           v.refund_total, v.currency, v.order_date, v.order_status
                    FROM UNNEST($4::text[], $5::numeric[], $6::numeric[], $7::numeric[],
                                $8::text[], $9::date[], $10::text[])
                        AS v(order_name, gross, net, refund_total, currency, order_date, order_status)
                    "#,
                )
                .bind(integration.id)
                .bind(integration.account_id)
                .bind(&integration.external_ref)
                .bind(&names)
                .bind(&gross)
                .bind(&net)
                .bind(&refunds)
                .bind(&currencies)
                .bind(&order_dates)
                .bind(&statuses)
                .execute(&mut *tx)
                .await?;
            }
        }

        if !dates.is_empty() {
            rebuild_commerce_daily(integration, &dates, &mut tx).await?;
            rebuild_daily_summary(integration.account_id, &dates, &mut tx).await?;
        }

        let mut cursor_written = false;
        if let Some(update) = cursor_update {
            cursor_written = cursor::apply(integration.id, update, &mut *tx).await?;
        }

        tx.commit().await.map_err(SyncError::DbWrite)?;
        debug!(
            integration_id = %integration.id,
            orders = batch.facts.len(),
            dates = dates.len(),
            cursor_written,
            "commerce batch committed"
        );

        Ok(PersistOutcome {
            persisted: batch.facts.len(),
            dates,
            cursor_written,
        })
    }

    /// Land one ads run: raw upsert keyed (integration, date, ad), fact
    /// replace per (ad-account, date), daily ads metrics and daily summary
    /// rebuilt for the touched dates.
    pub async fn persist_ads(
        &self,
        integration: &Integration,
        batch: &AdsBatch,
    ) -> Result<PersistOutcome, SyncError> {
        if batch.is_empty() {
            return Ok(PersistOutcome {
                persisted: 0,
                dates: Vec::new(),
                cursor_written: false,
            });
        }

        let dates: Vec<NaiveDate> = batch.dates.iter().copied().collect();
        let mut tx = self.pool.begin().await.map_err(SyncError::DbWrite)?;

        for chunk in batch.raw.chunks(MAX_BATCH_ROWS) {
            let insight_dates: Vec<NaiveDate> = chunk.iter().map(|r| r.insight_date).collect();
            let ad_ids: Vec<&str> = chunk.iter().map(|r| r.ad_id.as_str()).collect();
            let payloads: Vec<serde_json::Value> = chunk.iter().map(|r| r.payload.clone()).collect();

            sqlx::query(
                r#"
                INSERT INTO raw_ads_insights (integration_id, insight_date, ad_id, payload, landed_at)
                SELECT $1, v.insight_date, v.ad_id, v.payload, NOW()
                FROM UNNEST($2::date[], $3::text[], $4::jsonb[]) AS v(insight_date, ad_id, payload)
                ON CONFLICT (integration_id, insight_date, ad_id) DO UPDATE
                SET payload = EXCLUDED.payload, landed_at = NOW()
                "#,
            )
            .bind(integration.id)
            .bind(&insight_dates)
            .bind(&ad_ids)
            .bind(&payloads)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            DELETE FROM fact_ads_daily
            WHERE integration_id = $1 AND insight_date = ANY($2::date[])
            "#,
        )
        .bind(integration.id)
        .bind(&dates)
        .execute(&mut *tx)
        .await?;

        for chunk in batch.facts.chunks(MAX_BATCH_ROWS) {
            let insight_dates: Vec<NaiveDate> = chunk.iter().map(|f| f.insight_date).collect();
            let spend: Vec<Decimal> = chunk.iter().map(|f| f.spend).collect();
            let impressions: Vec<i64> = chunk.iter().map(|f| f.impressions).collect();
            let clicks: Vec<i64> = chunk.iter().map(|f| f.clicks).collect();
            let purchases: Vec<i64> = chunk.iter().map(|f| f.purchases).collect();
            let purchase_values: Vec<Decimal> = chunk.iter().map(|f| f.purchase_value).collect();
            let currencies: Vec<&str> = chunk.iter().map(|f| f.currency.as_str()).collect();

            sqlx::query(
                r#"
                INSERT INTO fact_ads_daily
                    (integration_id, account_id, ad_account_ref, insight_date, spend,
                     impressions, clicks, purchases, purchase_value, currency)
                SELECT $1, $2, $3, v.insight_date, v.spend,
                       v.impressions, v.clicks, v.purchases, v.purchase_value, v.currency
                FROM UNNEST($4::date[], $5::numeric[], $6::int8[], $7::int8[],
                            $8::int8[], $9::numeric[], $10::text[])
                    AS v(insight_date, spend, impressions, clicks, purchases, purchase_value, currency)
                "#,
            )
            .bind(integration.id)
            .bind(integration.account_id)
            .bind(&integration.external_ref)
            .bind(&insight_dates)
            .bind(&spend)
            .bind(&impressions)
            .bind(&clicks)
            .bind(&purchases)
            .bind(&purchase_values)
            .bind(&currencies)
            .execute(&mut *tx)
            .await?;
        }

        rebuild_ads_daily(integration, &dates, &mut tx).await?;
        rebuild_daily_summary(integration.account_id, &dates, &mut tx).await?;

        tx.commit().await.map_err(SyncError::DbWrite)?;
        debug!(
            integration_id = %integration.id,
            days = batch.facts.len(),
            "ads batch committed"
        );

        Ok(PersistOutcome {
            persisted: batch.facts.len(),
            dates,
            cursor_written: false,
        })
    }
}

/// Delete-and-recompute the commerce daily metrics for the touched dates,
/// aggregating the committed fact rows.
async fn rebuild_commerce_daily(
    integration: &Integration,
    dates: &[NaiveDate],
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
) -> Result<(), SyncError> {
    sqlx::query(
        r#"
        DELETE FROM daily_commerce_metrics
        WHERE integration_id = $1 AND metric_date = ANY($2::date[])
        "#,
    )
    .bind(integration.id)
    .bind(dates)
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO daily_commerce_metrics
            (integration_id, account_id, shop_ref, metric_date, orders,
             revenue_gross, revenue_net, refunds)
        SELECT f.integration_id, f.account_id, f.shop_ref, f.order_date, COUNT(*),
               SUM(f.gross), SUM(f.net), SUM(f.refund_total)
        FROM fact_orders f
        WHERE f.integration_id = $1 AND f.order_date = ANY($2::date[])
        GROUP BY f.integration_id, f.account_id, f.shop_ref, f.order_date
        "#,
    )
    .bind(integration.id)
    .bind(dates)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Delete-and-recompute the ads daily metrics for the touched dates.
async fn rebuild_ads_daily(
    integration: &Integration,
    dates: &[NaiveDate],
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
) -> Result<(), SyncError> {
    sqlx::query(
        r#"
        DELETE FROM daily_ads_metrics
        WHERE integration_id = $1 AND metric_date = ANY($2::date[])
        "#,
    )
    .bind(integration.id)
    .bind(dates)
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO daily_ads_metrics
            (integration_id, account_id, ad_account_ref, metric_date, spend,
             impressions, clicks, purchases, purchase_value)
        SELECT f.integration_id, f.account_id, f.ad_account_ref, f.insight_date, SUM(f.spend),
               SUM(f.impressions), SUM(f.clicks), SUM(f.purchases), SUM(f.purchase_value)
        FROM fact_ads_daily f
        WHERE f.integration_id = $1 AND f.insight_date = ANY($2::date[])
        GROUP BY f.integration_id, f.account_id, f.ad_account_ref, f.insight_date
        "#,
    )
    .bind(integration.id)
    .bind(dates)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Rebuild the blended daily summary for (account, dates) from whatever both
/// per-source daily tables hold at this point in the transaction.
///
/// MER = revenue_net / ads_spend when spend > 0 else NULL.
/// AOV = revenue_net / orders when orders > 0 else 0.
async fn rebuild_daily_summary(
    account_id: Uuid,
    dates: &[NaiveDate],
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
) -> Result<(), SyncError> {
    sqlx::query(
        r#"
        DELETE FROM daily_summary
        WHERE account_id = $1 AND summary_date = ANY($2::date[])
        "#,
    )
    .bind(account_id)
    .bind(dates)
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO daily_summary
            (account_id, summary_date, revenue_net, ads_spend, mer, orders, aov)
        SELECT $1, d.day,
               COALESCE(c.revenue_net, 0),
               COALESCE(a.spend, 0),
               CASE WHEN COALESCE(a.spend, 0) > 0
                    THEN COALESCE(c.revenue_net, 0) / a.spend
                    ELSE NULL END,
               COALESCE(c.orders, 0),
               CASE WHEN COALESCE(c.orders, 0) > 0
                    THEN COALESCE(c.revenue_net, 0) / c.orders
                    ELSE 0 END
        FROM UNNEST($2::date[]) AS d(day)
        LEFT JOIN (
            SELECT metric_date, SUM(revenue_net) AS revenue_net, SUM(orders) AS orders
            FROM daily_commerce_metrics
            WHERE account_id = $1
            GROUP BY metric_date
        ) c ON c.metric_date = d.day
        LEFT JOIN (
            SELECT metric_date, SUM(spend) AS spend
            FROM daily_ads_metrics
            WHERE account_id = $1
            GROUP BY metric_date
        ) a ON a.metric_date = d.day
        "#,
    )
    .bind(account_id)
    .bind(dates)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// The summary law as a pure function, mirrored by the SQL above. Used by
/// tests and kept next to the SQL so the two cannot drift silently.
pub fn summary_row(
    revenue_net: Decimal,
    ads_spend: Decimal,
    orders: i64,
) -> (Decimal, Decimal, Option<Decimal>, i64, Decimal) {
    let mer = if ads_spend > Decimal::ZERO {
        Some(revenue_net / ads_spend)
    } else {
        None
    };
    let aov = if orders > 0 {
        revenue_net / Decimal::from(orders)
    } else {
        Decimal::ZERO
    };
    (revenue_net, ads_spend, mer, orders, aov)
}
