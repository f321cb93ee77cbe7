use crate::database::postgres_repository::PostgresRepository;
use crate::error::app_error::AppError;
use crate::models::pagination::PaginationParams;
use crate::models::redeem_code::{RedeemCode, RedeemCodeRow, RedeemCodeStatus};
use crate::models::redemption::{NewRedemptionHistory, RedemptionHistoryEntry};
use crate::models::vip::{VipPlan, VipStatus};
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

/// Entry point for redemption storage.
#[async_trait::async_trait]
pub trait RedemptionRepository: Send + Sync {
    /// Open a unit of work. Dropping it without `commit` rolls everything back.
    async fn begin_redemption(&self) -> Result<Box<dyn RedemptionUnitOfWork>, AppError>;

    /// Append a `failed` history row outside of any unit of work.
    async fn record_failed_redemption(&self, entry: &NewRedemptionHistory) -> Result<(), AppError>;
}

/// Reads and writes that must succeed or fail together for one redemption.
///
/// `lock_code` takes an exclusive lock on the code row that is held until the
/// unit of work ends, so concurrent redemptions of the same code serialize
/// while different codes proceed independently.
#[async_trait::async_trait]
pub trait RedemptionUnitOfWork: Send {
    async fn lock_code(&mut self, code: &str) -> Result<Option<RedeemCode>, AppError>;
    async fn has_successful_redemption(&mut self, code_id: &Uuid, user_id: &Uuid) -> Result<bool, AppError>;
    async fn update_code_usage(&mut self, code_id: &Uuid, used_count: i32, status: RedeemCodeStatus) -> Result<(), AppError>;
    /// Add `amount` to the user's balance and return the new balance.
    async fn credit_balance(&mut self, user_id: &Uuid, amount: i64, reason: &str) -> Result<i64, AppError>;
    async fn get_vip_plan(&mut self, plan_id: &Uuid) -> Result<Option<VipPlan>, AppError>;
    /// Current VIP record, locked for update.
    async fn get_vip_status(&mut self, user_id: &Uuid) -> Result<Option<VipStatus>, AppError>;
    async fn save_vip_status(&mut self, user_id: &Uuid, status: &VipStatus) -> Result<(), AppError>;
    async fn insert_history(&mut self, entry: &NewRedemptionHistory) -> Result<RedemptionHistoryEntry, AppError>;
    async fn commit(self: Box<Self>) -> Result<(), AppError>;
}

const HISTORY_COLUMNS: &str = "id, code_id, user_id, amount_granted, status, message, redeemed_at, snapshot";

pub struct PgRedemptionUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

#[async_trait::async_trait]
impl RedemptionRepository for PostgresRepository {
    async fn begin_redemption(&self) -> Result<Box<dyn RedemptionUnitOfWork>, AppError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgRedemptionUnitOfWork { tx }))
    }

    async fn record_failed_redemption(&self, entry: &NewRedemptionHistory) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO redemption_history (code_id, user_id, amount_granted, status, message, snapshot)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(entry.code_id)
        .bind(entry.user_id)
        .bind(entry.amount_granted)
        .bind(entry.status)
        .bind(&entry.message)
        .bind(sqlx::types::Json(&entry.snapshot))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl RedemptionUnitOfWork for PgRedemptionUnitOfWork {
    async fn lock_code(&mut self, code: &str) -> Result<Option<RedeemCode>, AppError> {
        let row = sqlx::query_as::<_, RedeemCodeRow>(
            r#"
            SELECT id, code, kind, amount, vip_plan_id, vip_level, max_uses, used_count, status, expires_at, created_by, created_at
            FROM redeem_codes
            WHERE code = $1
            FOR UPDATE
            "#,
        )
        .bind(code)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(RedeemCode::try_from).transpose()
    }

    async fn has_successful_redemption(&mut self, code_id: &Uuid, user_id: &Uuid) -> Result<bool, AppError> {
        let exists = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM redemption_history
                WHERE code_id = $1 AND user_id = $2 AND status = 'success'
            )
            "#,
        )
        .bind(code_id)
        .bind(user_id)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(exists)
    }

    async fn update_code_usage(&mut self, code_id: &Uuid, used_count: i32, status: RedeemCodeStatus) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE redeem_codes
            SET used_count = $2, status = $3, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(code_id)
        .bind(used_count)
        .bind(status)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn credit_balance(&mut self, user_id: &Uuid, amount: i64, reason: &str) -> Result<i64, AppError> {
        let balance = sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE users
            SET credits = credits + $2
            WHERE id = $1
            RETURNING credits
            "#,
        )
        .bind(user_id)
        .bind(amount)
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or(AppError::UserNotFound)?;

        sqlx::query(
            r#"
            INSERT INTO credit_transactions (user_id, amount, balance_after, reason)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(user_id)
        .bind(amount)
        .bind(balance)
        .bind(reason)
        .execute(&mut *self.tx)
        .await?;

        Ok(balance)
    }

    async fn get_vip_plan(&mut self, plan_id: &Uuid) -> Result<Option<VipPlan>, AppError> {
        let plan = sqlx::query_as::<_, VipPlan>(
            r#"
            SELECT id, name, duration_months, duration_days, level
            FROM vip_plans
            WHERE id = $1
            "#,
        )
        .bind(plan_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(plan)
    }

    async fn get_vip_status(&mut self, user_id: &Uuid) -> Result<Option<VipStatus>, AppError> {
        // Materialize the row first so FOR UPDATE always has something to lock;
        // two first-time grants for one user must not both see "no record".
        sqlx::query("INSERT INTO user_vip (user_id) VALUES ($1) ON CONFLICT (user_id) DO NOTHING")
            .bind(user_id)
            .execute(&mut *self.tx)
            .await?;

        let status = sqlx::query_as::<_, VipStatus>(
            r#"
            SELECT is_vip, vip_expire_date, vip_level
            FROM user_vip
            WHERE user_id = $1
            FOR UPDATE
            "#,
        )
        .bind(user_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(status.filter(|status| status.is_vip))
    }

    async fn save_vip_status(&mut self, user_id: &Uuid, status: &VipStatus) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE user_vip
            SET is_vip = $2, vip_expire_date = $3, vip_level = $4, updated_at = now()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(status.is_vip)
        .bind(status.vip_expire_date)
        .bind(status.vip_level)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn insert_history(&mut self, entry: &NewRedemptionHistory) -> Result<RedemptionHistoryEntry, AppError> {
        let query = format!(
            r#"
            INSERT INTO redemption_history (code_id, user_id, amount_granted, status, message, snapshot)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {HISTORY_COLUMNS}
            "#
        );

        let history = sqlx::query_as::<_, RedemptionHistoryEntry>(&query)
            .bind(entry.code_id)
            .bind(entry.user_id)
            .bind(entry.amount_granted)
            .bind(entry.status)
            .bind(&entry.message)
            .bind(sqlx::types::Json(&entry.snapshot))
            .fetch_one(&mut *self.tx)
            .await?;

        Ok(history)
    }

    async fn commit(self: Box<Self>) -> Result<(), AppError> {
        self.tx.commit().await?;
        Ok(())
    }
}

impl PostgresRepository {
    pub async fn list_redemption_history(&self, user_id: &Uuid, params: &PaginationParams) -> Result<(Vec<RedemptionHistoryEntry>, i64), AppError> {
        let total = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM redemption_history WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;

        let query = format!(
            r#"
            SELECT {HISTORY_COLUMNS}
            FROM redemption_history
            WHERE user_id = $1
            ORDER BY redeemed_at DESC
            LIMIT $2 OFFSET $3
            "#
        );

        let entries = sqlx::query_as::<_, RedemptionHistoryEntry>(&query)
            .bind(user_id)
            .bind(params.effective_limit())
            .bind(params.offset())
            .fetch_all(&self.pool)
            .await?;

        Ok((entries, total))
    }
}
