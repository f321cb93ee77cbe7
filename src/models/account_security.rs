use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Lockout bookkeeping stored on the user row.
///
/// `is_locked` implies `lock_expires_at` is set; [`AccountSecurityState::lock`]
/// is the only way to set both.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct AccountSecurityState {
    pub failed_login_attempts: i32,
    pub is_locked: bool,
    pub lock_reason: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub last_failed_login_at: Option<DateTime<Utc>>,
}

impl AccountSecurityState {
    /// True when the lock is still in force at `now`.
    pub fn is_locked_at(&self, now: DateTime<Utc>) -> bool {
        matches!((self.is_locked, self.lock_expires_at), (true, Some(expires_at)) if expires_at > now)
    }

    /// True when the row says locked but the lock no longer applies.
    pub fn has_stale_lock(&self, now: DateTime<Utc>) -> bool {
        self.is_locked && !self.is_locked_at(now)
    }

    pub fn lock(&mut self, reason: impl Into<String>, now: DateTime<Utc>, duration: chrono::Duration) {
        self.is_locked = true;
        self.lock_reason = Some(reason.into());
        self.locked_at = Some(now);
        self.lock_expires_at = Some(now + duration);
    }

    /// The all-clear state.
    pub fn clear(&mut self) {
        *self = AccountSecurityState::default();
    }
}

/// Answer to "may this identity attempt to authenticate right now?".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, JsonSchema)]
pub struct LockStatus {
    pub is_locked: bool,
    pub lock_reason: Option<String>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub remaining_attempts: Option<i32>,
}

impl LockStatus {
    pub fn unlocked(remaining_attempts: i32) -> Self {
        Self {
            is_locked: false,
            lock_reason: None,
            lock_expires_at: None,
            remaining_attempts: Some(remaining_attempts.max(0)),
        }
    }
}

/// Outcome of recording one failed authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockResult {
    /// False when the failure could not be persisted.
    pub recorded: bool,
    pub failed_attempts: i32,
    pub is_locked: bool,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub lock_duration: Option<chrono::Duration>,
    pub remaining_attempts: i32,
}

impl LockResult {
    pub fn unrecorded(threshold: i32) -> Self {
        Self {
            recorded: false,
            failed_attempts: 0,
            is_locked: false,
            lock_expires_at: None,
            lock_duration: None,
            remaining_attempts: threshold,
        }
    }
}

#[derive(Debug, Deserialize, Validate, JsonSchema)]
pub struct UnlockRequest {
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 1, max = 255))]
    pub reason: String,
}

#[derive(Debug, Serialize, JsonSchema)]
pub struct UnlockResponse {
    pub message: String,
}
