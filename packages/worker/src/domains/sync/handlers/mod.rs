//! Job handlers: one function per job type, dispatched on the closed
//! [`JobType`] enum. Handlers are idempotent — re-running the same
//! {integration, job type, window} converges to the same warehouse state —
//! and return a stats value the dispatcher records on the run.

pub mod ads;
pub mod commerce;

use sqlx::PgPool;

use crate::common::SyncError;
use crate::config::Config;
use crate::domains::integrations::models::{ADS_ACCESS_TOKEN, COMMERCE_OFFLINE_TOKEN};
use crate::domains::integrations::Integration;
use crate::domains::sync::models::{JobType, SyncRun};
use crate::domains::warehouse::Warehouse;
use crate::kernel::ads_client::AdsClient;
use crate::kernel::commerce_client::CommerceClient;

/// Shared dependencies handed to every handler.
#[derive(Clone)]
pub struct SyncDeps {
    pub pool: PgPool,
    pub config: Config,
    pub warehouse: Warehouse,
}

impl SyncDeps {
    pub fn new(pool: PgPool, config: Config) -> Self {
        let warehouse = Warehouse::new(pool.clone());
        Self {
            pool,
            config,
            warehouse,
        }
    }
}

/// Execute one claimed run. Resolves the integration and its credentials,
/// builds the source client, and hands off to the job's handler.
pub async fn execute(
    job_type: JobType,
    run: &SyncRun,
    deps: &SyncDeps,
) -> Result<serde_json::Value, SyncError> {
    let integration = Integration::find_by_id(run.integration_id, &deps.pool).await?;

    let stats = match job_type {
        JobType::CommerceFresh | JobType::CommerceWindowFill => {
            let token = integration
                .secret(COMMERCE_OFFLINE_TOKEN, &deps.pool)
                .await?
                .ok_or_else(|| {
                    SyncError::Auth(format!("integration {} has no offline token", integration.id))
                })?;
            let client = CommerceClient::new(&integration, token, &deps.config)?;

            match job_type {
                JobType::CommerceFresh => {
                    serde_json::to_value(commerce::run_fresh(&client, &integration, deps).await?)
                }
                _ => serde_json::to_value(
                    commerce::run_window_fill(&client, &integration, deps).await?,
                ),
            }
        }
        JobType::AdsFresh | JobType::AdsWindowFill => {
            let token = integration
                .secret(ADS_ACCESS_TOKEN, &deps.pool)
                .await?
                .ok_or_else(|| {
                    SyncError::Auth(format!("integration {} has no ads token", integration.id))
                })?;
            let client = AdsClient::new(token, &deps.config)?;
            let ends_yesterday = job_type == JobType::AdsFresh;

            serde_json::to_value(ads::run_window(&client, &integration, deps, ends_yesterday).await?)
        }
    };

    stats.map_err(|e| SyncError::Other(anyhow::anyhow!("failed to serialize run stats: {e}")))
}
