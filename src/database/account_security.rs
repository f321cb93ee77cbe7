use crate::database::audit::SecurityAuditEvent;
use crate::database::postgres_repository::PostgresRepository;
use crate::error::app_error::AppError;
use crate::models::account_security::AccountSecurityState;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value as JsonValue;

const STATE_COLUMNS: &str = "failed_login_attempts, is_locked, lock_reason, locked_at, lock_expires_at, last_failed_login_at";

/// Storage for the lockout fields of a login identity.
#[async_trait::async_trait]
pub trait AccountSecurityRepository: Send + Sync {
    /// `None` when no account exists for `identity`.
    async fn get_security_state(&self, identity: &str) -> Result<Option<AccountSecurityState>, AppError>;
    async fn save_security_state(&self, identity: &str, state: &AccountSecurityState) -> Result<(), AppError>;
    /// Count one failure in a single atomic step and return the new state.
    /// A stale lock is cleared first, so the count restarts at one.
    ///
    /// `None`, with nothing written, when no account exists for `identity` or
    /// an unexpired lock is in force at `now`.
    async fn increment_failed_attempts(&self, identity: &str, now: DateTime<Utc>) -> Result<Option<AccountSecurityState>, AppError>;
    /// Lock `identity` for `duration` from `now`, provided it is not locked
    /// already and still has at least `min_failed_attempts` failures.
    /// `None` when either condition no longer holds.
    async fn lock_account(
        &self,
        identity: &str,
        min_failed_attempts: i32,
        reason: &str,
        now: DateTime<Utc>,
        duration: Duration,
    ) -> Result<Option<AccountSecurityState>, AppError>;
    async fn log_security_event(&self, identity: &str, event_type: &str, success: bool, metadata: JsonValue) -> Result<(), AppError>;
}

#[async_trait::async_trait]
impl AccountSecurityRepository for PostgresRepository {
    async fn get_security_state(&self, identity: &str) -> Result<Option<AccountSecurityState>, AppError> {
        let query = format!("SELECT {STATE_COLUMNS} FROM users WHERE email = $1");
        let state = sqlx::query_as::<_, AccountSecurityState>(&query)
            .bind(identity)
            .fetch_optional(&self.pool)
            .await?;

        Ok(state)
    }

    async fn save_security_state(&self, identity: &str, state: &AccountSecurityState) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE users
            SET failed_login_attempts = $2,
                is_locked = $3,
                lock_reason = $4,
                locked_at = $5,
                lock_expires_at = $6,
                last_failed_login_at = $7
            WHERE email = $1
            "#,
        )
        .bind(identity)
        .bind(state.failed_login_attempts)
        .bind(state.is_locked)
        .bind(&state.lock_reason)
        .bind(state.locked_at)
        .bind(state.lock_expires_at)
        .bind(state.last_failed_login_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn increment_failed_attempts(&self, identity: &str, now: DateTime<Utc>) -> Result<Option<AccountSecurityState>, AppError> {
        // Rows under a live lock are filtered out; any lock left is stale.
        let query = format!(
            r#"
            UPDATE users
            SET failed_login_attempts = CASE WHEN is_locked THEN 1 ELSE failed_login_attempts + 1 END,
                is_locked = FALSE,
                lock_reason = NULL,
                locked_at = NULL,
                lock_expires_at = NULL,
                last_failed_login_at = $2
            WHERE email = $1
              AND NOT (is_locked AND lock_expires_at IS NOT NULL AND lock_expires_at > $2)
            RETURNING {STATE_COLUMNS}
            "#
        );

        let state = sqlx::query_as::<_, AccountSecurityState>(&query)
            .bind(identity)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

        Ok(state)
    }

    async fn lock_account(
        &self,
        identity: &str,
        min_failed_attempts: i32,
        reason: &str,
        now: DateTime<Utc>,
        duration: Duration,
    ) -> Result<Option<AccountSecurityState>, AppError> {
        let query = format!(
            r#"
            UPDATE users
            SET is_locked = TRUE,
                lock_reason = $3,
                locked_at = $4,
                lock_expires_at = $5
            WHERE email = $1
              AND NOT is_locked
              AND failed_login_attempts >= $2
            RETURNING {STATE_COLUMNS}
            "#
        );

        let state = sqlx::query_as::<_, AccountSecurityState>(&query)
            .bind(identity)
            .bind(min_failed_attempts)
            .bind(reason)
            .bind(now)
            .bind(now + duration)
            .fetch_optional(&self.pool)
            .await?;

        Ok(state)
    }

    async fn log_security_event(&self, identity: &str, event_type: &str, success: bool, metadata: JsonValue) -> Result<(), AppError> {
        self.create_security_audit_log(SecurityAuditEvent::new(event_type, success).identity(identity).metadata(metadata))
            .await
    }
}

impl PostgresRepository {
    /// Clear locks whose expiry has passed. Same effect as the lazy check in
    /// `AccountLockManager::check_lock`, applied in bulk.
    pub async fn clear_expired_locks(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET failed_login_attempts = 0,
                is_locked = FALSE,
                lock_reason = NULL,
                locked_at = NULL,
                lock_expires_at = NULL,
                last_failed_login_at = NULL
            WHERE is_locked
              AND (lock_expires_at IS NULL OR lock_expires_at <= $1)
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
