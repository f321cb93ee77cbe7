use crate::config::AccountLockConfig;
use crate::database::account_security::AccountSecurityRepository;
use crate::error::app_error::AppError;
use crate::models::account_security::{AccountSecurityState, LockResult, LockStatus};
use crate::models::audit::audit_events;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};

const FAILED_LOGIN_REASON: &str = "too many failed login attempts";

/// Lock duration after `failed_attempts` consecutive failures.
///
/// `base × min(failed − threshold + 1, max_multiplier)`, capped at the
/// configured maximum. Counts below the threshold get the base duration.
pub fn progressive_lockout(failed_attempts: i32, config: &AccountLockConfig) -> Duration {
    let max_multiplier = i64::from(config.max_multiplier.max(1));
    let steps = (i64::from(failed_attempts) - i64::from(config.max_failed_attempts) + 1).clamp(1, max_multiplier);
    let minutes = config.base_lock_minutes.saturating_mul(steps).min(config.max_lock_minutes);

    Duration::minutes(minutes.max(0))
}

/// Progressive lockout per login identity.
///
/// Callers check the lock before verifying credentials and only record a
/// failure when `check_lock` reported the identity as unlocked. A failure
/// recorded against an unexpired lock is ignored rather than extending it.
pub struct AccountLockManager {
    config: AccountLockConfig,
    repo: Arc<dyn AccountSecurityRepository>,
}

impl AccountLockManager {
    pub fn new(config: AccountLockConfig, repo: Arc<dyn AccountSecurityRepository>) -> Self {
        Self { config, repo }
    }

    fn threshold(&self) -> i32 {
        self.config.max_failed_attempts.max(1)
    }

    pub async fn check_lock(&self, identity: &str) -> LockStatus {
        self.check_lock_at(identity, Utc::now()).await
    }

    /// Storage errors report the identity as unlocked.
    pub async fn check_lock_at(&self, identity: &str, now: DateTime<Utc>) -> LockStatus {
        let mut state = match self.repo.get_security_state(identity).await {
            Ok(Some(state)) => state,
            Ok(None) => return LockStatus::unlocked(self.threshold()),
            Err(e) => {
                warn!(identity = %identity, error = %e, "lock check failed, treating account as unlocked");
                return LockStatus::unlocked(self.threshold());
            }
        };

        if state.is_locked_at(now) {
            return LockStatus {
                is_locked: true,
                lock_reason: state.lock_reason,
                lock_expires_at: state.lock_expires_at,
                remaining_attempts: None,
            };
        }

        if state.has_stale_lock(now) {
            let expired_at = state.lock_expires_at;
            state.clear();
            if let Err(e) = self.repo.save_security_state(identity, &state).await {
                warn!(identity = %identity, error = %e, "failed to persist expired lock");
            }
            self.log_event(identity, audit_events::ACCOUNT_LOCK_EXPIRED, true, json!({ "lock_expires_at": expired_at }))
                .await;
            info!(identity = %identity, "account lock expired");
        }

        LockStatus::unlocked(self.threshold() - state.failed_login_attempts)
    }

    pub async fn record_failure(&self, identity: &str) -> LockResult {
        self.record_failure_at(identity, Utc::now()).await
    }

    /// Count one failed authentication. Never fails; storage errors are logged
    /// and reported as an unrecorded result.
    ///
    /// The count is incremented atomically in storage and the lock decision is
    /// taken on the returned count, so concurrent failures are never lost.
    pub async fn record_failure_at(&self, identity: &str, now: DateTime<Utc>) -> LockResult {
        let threshold = self.threshold();

        let state = match self.repo.increment_failed_attempts(identity, now).await {
            Ok(Some(state)) => state,
            Ok(None) => return self.unrecorded_failure(identity, now).await,
            Err(e) => {
                error!(identity = %identity, error = %e, "failed to record login failure");
                return LockResult::unrecorded(threshold);
            }
        };

        let failed_attempts = state.failed_login_attempts;
        if failed_attempts < threshold {
            return LockResult {
                recorded: true,
                failed_attempts,
                is_locked: false,
                lock_expires_at: None,
                lock_duration: None,
                remaining_attempts: threshold - failed_attempts,
            };
        }

        let duration = progressive_lockout(failed_attempts, &self.config);
        match self.repo.lock_account(identity, threshold, FAILED_LOGIN_REASON, now, duration).await {
            Ok(Some(locked)) => {
                warn!(
                    identity = %identity,
                    failed_attempts = locked.failed_login_attempts,
                    lock_minutes = duration.num_minutes(),
                    "account locked"
                );
                self.log_event(
                    identity,
                    audit_events::ACCOUNT_LOCKED,
                    false,
                    json!({
                        "failed_attempts": locked.failed_login_attempts,
                        "lock_minutes": duration.num_minutes(),
                        "lock_expires_at": locked.lock_expires_at,
                    }),
                )
                .await;

                LockResult {
                    recorded: true,
                    failed_attempts: locked.failed_login_attempts,
                    is_locked: true,
                    lock_expires_at: locked.lock_expires_at,
                    lock_duration: Some(duration),
                    remaining_attempts: 0,
                }
            }
            // Another failure locked first, or a success reset the count.
            Ok(None) => self.current_result(identity, failed_attempts, now).await,
            Err(e) => {
                error!(identity = %identity, error = %e, "failed to lock account");
                LockResult {
                    recorded: true,
                    failed_attempts,
                    is_locked: false,
                    lock_expires_at: None,
                    lock_duration: None,
                    remaining_attempts: 0,
                }
            }
        }
    }

    /// Result for a failure that storage refused to count.
    async fn unrecorded_failure(&self, identity: &str, now: DateTime<Utc>) -> LockResult {
        match self.repo.get_security_state(identity).await {
            Ok(Some(state)) if state.is_locked_at(now) => {
                warn!(identity = %identity, "failure recorded against an active lock, ignoring");
                LockResult {
                    recorded: false,
                    failed_attempts: state.failed_login_attempts,
                    is_locked: true,
                    lock_expires_at: state.lock_expires_at,
                    lock_duration: None,
                    remaining_attempts: 0,
                }
            }
            _ => LockResult::unrecorded(self.threshold()),
        }
    }

    async fn current_result(&self, identity: &str, failed_attempts: i32, now: DateTime<Utc>) -> LockResult {
        let threshold = self.threshold();
        let state = match self.repo.get_security_state(identity).await {
            Ok(Some(state)) => state,
            _ => AccountSecurityState {
                failed_login_attempts: failed_attempts,
                ..AccountSecurityState::default()
            },
        };
        let is_locked = state.is_locked_at(now);

        LockResult {
            recorded: true,
            failed_attempts: state.failed_login_attempts,
            is_locked,
            lock_expires_at: state.lock_expires_at.filter(|_| is_locked),
            lock_duration: None,
            remaining_attempts: (threshold - state.failed_login_attempts).max(0),
        }
    }

    /// Reset to the all-clear state.
    pub async fn record_success(&self, identity: &str) {
        if let Err(e) = self.repo.save_security_state(identity, &AccountSecurityState::default()).await {
            warn!(identity = %identity, error = %e, "failed to reset security state after login");
        }
    }

    /// Administrative unlock. Unlike the other operations, errors propagate.
    pub async fn unlock(&self, identity: &str, reason: &str) -> Result<(), AppError> {
        let mut state = self.repo.get_security_state(identity).await?.ok_or(AppError::UserNotFound)?;
        let was_locked = state.is_locked;

        state.clear();
        self.repo.save_security_state(identity, &state).await?;
        self.repo
            .log_security_event(identity, audit_events::ACCOUNT_UNLOCKED, true, json!({ "reason": reason, "was_locked": was_locked }))
            .await?;

        info!(identity = %identity, reason = %reason, "account unlocked");
        Ok(())
    }

    async fn log_event(&self, identity: &str, event_type: &str, success: bool, metadata: serde_json::Value) {
        if let Err(e) = self.repo.log_security_event(identity, event_type, success, metadata).await {
            warn!(identity = %identity, event_type = event_type, error = %e, "failed to write security audit log");
        }
    }
}
