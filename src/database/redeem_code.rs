use crate::database::postgres_repository::PostgresRepository;
use crate::error::app_error::AppError;
use crate::models::pagination::PaginationParams;
use crate::models::redeem_code::{NewRedeemCode, RedeemCode, RedeemCodeRow, RedeemCodeStatus};
use crate::models::vip::VipPlan;
use chrono::{DateTime, Utc};
use uuid::Uuid;

const CODE_COLUMNS: &str = "id, code, kind, amount, vip_plan_id, vip_level, max_uses, used_count, status, expires_at, created_by, created_at";

impl PostgresRepository {
    /// Insert all codes or none. A duplicate code surfaces as `Conflict`.
    pub async fn create_redeem_codes(&self, codes: &[NewRedeemCode]) -> Result<Vec<RedeemCode>, AppError> {
        let query = format!(
            r#"
            INSERT INTO redeem_codes (code, kind, amount, vip_plan_id, vip_level, max_uses, expires_at, created_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {CODE_COLUMNS}
            "#
        );

        let mut tx = self.pool.begin().await?;
        let mut created = Vec::with_capacity(codes.len());

        for code in codes {
            let (kind, amount, vip_plan_id, vip_level) = code.reward.to_columns();
            let row = sqlx::query_as::<_, RedeemCodeRow>(&query)
                .bind(&code.code)
                .bind(kind)
                .bind(amount)
                .bind(vip_plan_id)
                .bind(vip_level)
                .bind(code.max_uses)
                .bind(code.expires_at)
                .bind(code.created_by)
                .fetch_one(&mut *tx)
                .await?;
            created.push(RedeemCode::try_from(row)?);
        }

        tx.commit().await?;

        Ok(created)
    }

    pub async fn get_redeem_code(&self, code: &str) -> Result<Option<RedeemCode>, AppError> {
        let query = format!("SELECT {CODE_COLUMNS} FROM redeem_codes WHERE code = $1");
        let row = sqlx::query_as::<_, RedeemCodeRow>(&query).bind(code).fetch_optional(&self.pool).await?;

        row.map(RedeemCode::try_from).transpose()
    }

    pub async fn list_redeem_codes(&self, status: Option<RedeemCodeStatus>, params: &PaginationParams) -> Result<(Vec<RedeemCode>, i64), AppError> {
        let total = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM redeem_codes WHERE ($1::text IS NULL OR status = $1)")
            .bind(status)
            .fetch_one(&self.pool)
            .await?;

        let query = format!(
            r#"
            SELECT {CODE_COLUMNS}
            FROM redeem_codes
            WHERE ($1::text IS NULL OR status = $1)
            ORDER BY created_at DESC, code
            LIMIT $2 OFFSET $3
            "#
        );

        let rows = sqlx::query_as::<_, RedeemCodeRow>(&query)
            .bind(status)
            .bind(params.effective_limit())
            .bind(params.offset())
            .fetch_all(&self.pool)
            .await?;

        let codes = rows.into_iter().map(RedeemCode::try_from).collect::<Result<Vec<_>, _>>()?;

        Ok((codes, total))
    }

    /// Manual activate/deactivate. Holds the row lock so the check cannot race
    /// a redemption of the same code.
    pub async fn update_redeem_code_status(&self, code: &str, target: RedeemCodeStatus, now: DateTime<Utc>) -> Result<RedeemCode, AppError> {
        let mut tx = self.pool.begin().await?;

        let query = format!("SELECT {CODE_COLUMNS} FROM redeem_codes WHERE code = $1 FOR UPDATE");
        let row = sqlx::query_as::<_, RedeemCodeRow>(&query)
            .bind(code)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("redeem code {}", code)))?;

        let mut redeem_code = RedeemCode::try_from(row)?;
        let status = redeem_code.admin_transition(target, now)?;

        sqlx::query("UPDATE redeem_codes SET status = $2, updated_at = now() WHERE id = $1")
            .bind(redeem_code.id)
            .bind(status)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        redeem_code.status = status;
        Ok(redeem_code)
    }

    /// Bring stored statuses in line with expiry and usage. Returns the number
    /// of codes moved to `expired` and to `used_up`.
    ///
    /// Only `active` codes move, expiry first, matching the order redemption
    /// checks them in.
    pub async fn sweep_redeem_codes(&self, now: DateTime<Utc>) -> Result<(u64, u64), AppError> {
        let expired = sqlx::query(
            r#"
            UPDATE redeem_codes
            SET status = 'expired', updated_at = now()
            WHERE status = 'active'
              AND expires_at IS NOT NULL
              AND expires_at <= $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        let used_up = sqlx::query(
            r#"
            UPDATE redeem_codes
            SET status = 'used_up', updated_at = now()
            WHERE status = 'active'
              AND used_count >= max_uses
            "#,
        )
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok((expired, used_up))
    }

    pub async fn get_vip_plan(&self, plan_id: &Uuid) -> Result<Option<VipPlan>, AppError> {
        let plan = sqlx::query_as::<_, VipPlan>("SELECT id, name, duration_months, duration_days, level FROM vip_plans WHERE id = $1")
            .bind(plan_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(plan)
    }

    pub async fn list_vip_plans(&self) -> Result<Vec<VipPlan>, AppError> {
        let plans = sqlx::query_as::<_, VipPlan>("SELECT id, name, duration_months, duration_days, level FROM vip_plans ORDER BY level, name")
            .fetch_all(&self.pool)
            .await?;

        Ok(plans)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RedemptionConfig;
    use crate::error::redemption::RedemptionError;
    use crate::models::redeem_code::RedeemReward;
    use crate::service::redemption::RedemptionEngine;
    use crate::test_utils::{create_test_code, create_test_user, setup_test_db};
    use chrono::Duration;
    use sqlx::PgPool;
    use std::sync::Arc;

    async fn set_usage(pool: &PgPool, code: &RedeemCode, used_count: i32, status: &str) {
        sqlx::query("UPDATE redeem_codes SET used_count = $2, status = $3 WHERE id = $1")
            .bind(code.id)
            .bind(used_count)
            .bind(status)
            .execute(pool)
            .await
            .unwrap();
    }

    #[tokio::test]
    #[ignore = "requires database"]
    async fn test_create_redeem_codes_is_all_or_nothing() {
        let pool = setup_test_db().await;
        let repo = PostgresRepository::new(pool.clone());
        let existing = create_test_code(&pool, RedeemReward::Credits { amount: 10 }, 1, None).await;

        let fresh = format!("TEST-{}", Uuid::new_v4().simple().to_string().to_uppercase());
        let batch: Vec<NewRedeemCode> = [fresh.clone(), existing.code.clone()]
            .into_iter()
            .map(|code| NewRedeemCode {
                code,
                reward: RedeemReward::Credits { amount: 10 },
                max_uses: 1,
                expires_at: None,
                created_by: None,
            })
            .collect();

        assert!(matches!(repo.create_redeem_codes(&batch).await, Err(AppError::Conflict(_))));
        assert!(repo.get_redeem_code(&fresh).await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore = "requires database"]
    async fn test_sweep_only_moves_active_codes() {
        let pool = setup_test_db().await;
        let repo = PostgresRepository::new(pool.clone());
        let now = Utc::now();
        let past = Some(now - Duration::days(1));

        let expired = create_test_code(&pool, RedeemReward::Credits { amount: 1 }, 5, past).await;
        let exhausted = create_test_code(&pool, RedeemReward::Credits { amount: 1 }, 1, None).await;
        set_usage(&pool, &exhausted, 1, "active").await;
        let used_up_and_expired = create_test_code(&pool, RedeemReward::Credits { amount: 1 }, 1, past).await;
        set_usage(&pool, &used_up_and_expired, 1, "used_up").await;

        repo.sweep_redeem_codes(now).await.unwrap();

        let status_of = |code: RedeemCode| {
            let repo = repo.clone();
            async move { repo.get_redeem_code(&code.code).await.unwrap().unwrap().status }
        };
        assert_eq!(status_of(expired).await, RedeemCodeStatus::Expired);
        assert_eq!(status_of(exhausted).await, RedeemCodeStatus::UsedUp);
        assert_eq!(status_of(used_up_and_expired.clone()).await, RedeemCodeStatus::UsedUp);

        let user = create_test_user(&pool, 0).await;
        let engine = RedemptionEngine::new(Arc::new(repo.clone()), RedemptionConfig::default());
        assert_eq!(engine.redeem(&used_up_and_expired.code, &user.id).await, Err(RedemptionError::CodeExhausted));
    }
}
