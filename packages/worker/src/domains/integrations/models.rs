//! Integration model: the link between a tenant account and one external
//! source instance (one shop, one ad-account).
//!
//! The worker reads integrations and their secrets; the only mutation it ever
//! performs is flipping `status` to `error` when a source rejects the stored
//! credentials.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

/// Secret key under which the commerce offline token is stored.
pub const COMMERCE_OFFLINE_TOKEN: &str = "commerce_offline_token";

/// Secret key under which the ads access token is stored.
pub const ADS_ACCESS_TOKEN: &str = "ads_access_token";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "integration_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum IntegrationType {
    Commerce,
    Ads,
}

impl IntegrationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntegrationType::Commerce => "commerce",
            IntegrationType::Ads => "ads",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "integration_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum IntegrationStatus {
    Connected,
    Active,
    Error,
    Disconnected,
}

#[derive(FromRow, Debug, Clone)]
pub struct Integration {
    pub id: Uuid,
    pub account_id: Uuid,
    pub integration_type: IntegrationType,
    pub status: IntegrationStatus,
    /// Reference to the external object: the shop domain for commerce, the
    /// ad-account id for ads.
    pub external_ref: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Integration {
    pub async fn find_by_id(id: Uuid, pool: &PgPool) -> Result<Self> {
        let integration = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, account_id, integration_type, status, external_ref,
                   created_at, updated_at
            FROM integrations
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_one(pool)
        .await?;

        Ok(integration)
    }

    /// Fetch a secret value for this integration by key.
    pub async fn secret(&self, key: &str, pool: &PgPool) -> Result<Option<String>> {
        let value: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT secret_value
            FROM integration_secrets
            WHERE integration_id = $1 AND secret_key = $2
            "#,
        )
        .bind(self.id)
        .bind(key)
        .fetch_optional(pool)
        .await?;

        Ok(value.map(|(v,)| v))
    }

    /// Currency of the owning account. The onboarding flow rejects
    /// integrations whose currency disagrees with the account's, so this is
    /// also the shop/ad-account currency fallback for fact rows.
    pub async fn account_currency(&self, pool: &PgPool) -> Result<String> {
        let (currency,): (String,) = sqlx::query_as(
            r#"
            SELECT currency FROM accounts WHERE id = $1
            "#,
        )
        .bind(self.account_id)
        .fetch_one(pool)
        .await?;

        Ok(currency)
    }

    /// Mark the integration as errored after a fatal auth failure.
    pub async fn mark_error(id: Uuid, pool: &PgPool) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE integrations
            SET status = 'error', updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(pool)
        .await?;

        Ok(())
    }
}
