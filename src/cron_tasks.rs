use crate::Config;
use crate::database::postgres_repository::PostgresRepository;
use crate::db::init_pool;
use crate::error::app_error::AppError;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, JsonSchema)]
pub struct SweepResult {
    pub codes_expired: u64,
    pub codes_used_up: u64,
    pub locks_cleared: u64,
}

/// Persist the status changes that reads would otherwise apply lazily: expired
/// and exhausted codes, and account locks past their expiry.
pub async fn sweep(repo: &PostgresRepository, now: DateTime<Utc>) -> Result<SweepResult, AppError> {
    let (codes_expired, codes_used_up) = repo.sweep_redeem_codes(now).await?;
    let locks_cleared = repo.clear_expired_locks(now).await?;

    let result = SweepResult {
        codes_expired,
        codes_used_up,
        locks_cleared,
    };
    info!(
        codes_expired = result.codes_expired,
        codes_used_up = result.codes_used_up,
        locks_cleared = result.locks_cleared,
        "sweep completed"
    );

    Ok(result)
}

pub async fn run_sweep(config: &Config) -> Result<SweepResult, String> {
    let pool = init_pool(&config.database)
        .await
        .map_err(|err| format!("Failed to initialize database pool: {err}"))?;

    let repo = PostgresRepository::new(pool.clone());
    let result = sweep(&repo, Utc::now()).await.map_err(|err| format!("Sweep failed: {err:?}"));

    pool.close().await;

    result
}
