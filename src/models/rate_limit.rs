use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Endpoint classes with their own window and threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitPolicy {
    Login,
    Signup,
    EmailVerification,
    PasswordChange,
    PublicApi,
    Redeem,
}

impl RateLimitPolicy {
    pub const ALL: [RateLimitPolicy; 6] = [
        RateLimitPolicy::Login,
        RateLimitPolicy::Signup,
        RateLimitPolicy::EmailVerification,
        RateLimitPolicy::PasswordChange,
        RateLimitPolicy::PublicApi,
        RateLimitPolicy::Redeem,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RateLimitPolicy::Login => "login",
            RateLimitPolicy::Signup => "signup",
            RateLimitPolicy::EmailVerification => "email_verification",
            RateLimitPolicy::PasswordChange => "password_change",
            RateLimitPolicy::PublicApi => "public_api",
            RateLimitPolicy::Redeem => "redeem",
        }
    }

    /// Build the counter key for `identifier` under this policy.
    pub fn key(self, identifier: impl Into<String>) -> RateLimitKey {
        RateLimitKey {
            policy: self,
            identifier: identifier.into(),
        }
    }
}

impl fmt::Display for RateLimitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A counter key. Only constructible through [`RateLimitPolicy::key`], so every
/// call site shares one storage format.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    policy: RateLimitPolicy,
    identifier: String,
}

impl RateLimitKey {
    pub fn policy(&self) -> RateLimitPolicy {
        self.policy
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn storage_key(&self) -> String {
        format!("{}:{}", self.policy.as_str(), self.identifier)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowLimit {
    pub window_ms: u64,
    pub max_attempts: u32,
}

impl WindowLimit {
    /// Longest accepted window, 30 days.
    pub const MAX_WINDOW_MS: u64 = 30 * 24 * 60 * 60 * 1000;

    pub const fn new(window_ms: u64, max_attempts: u32) -> Self {
        Self { window_ms, max_attempts }
    }

    /// Window length, never longer than [`WindowLimit::MAX_WINDOW_MS`].
    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.window_ms.min(Self::MAX_WINDOW_MS) as i64)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.window_ms == 0 || self.window_ms > Self::MAX_WINDOW_MS {
            return Err(format!("window_ms must be between 1 and {}", Self::MAX_WINDOW_MS));
        }
        Ok(())
    }
}

/// Counter state for one (policy, identifier) pair within its current window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitRecord {
    pub count: u32,
    pub window_reset_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    pub retry_after_seconds: Option<u64>,
}

impl RateLimitDecision {
    pub fn allow(remaining: u32, reset_at: DateTime<Utc>) -> Self {
        Self {
            allowed: true,
            remaining,
            reset_at,
            retry_after_seconds: None,
        }
    }

    pub fn deny(reset_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            reset_at,
            retry_after_seconds: Some(retry_after_seconds(reset_at, now)),
        }
    }
}

/// `ceil((reset_at - now) / 1000)` in seconds, never below one.
pub fn retry_after_seconds(reset_at: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let remaining_ms = (reset_at - now).num_milliseconds().max(0) as u64;
    remaining_ms.div_ceil(1000).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn keys_are_namespaced_by_policy() {
        let login = RateLimitPolicy::Login.key("10.0.0.1");
        let signup = RateLimitPolicy::Signup.key("10.0.0.1");

        assert_ne!(login, signup);
        assert_eq!(login.storage_key(), "login:10.0.0.1");
        assert_eq!(signup.storage_key(), "signup:10.0.0.1");
        assert_eq!(login.identifier(), "10.0.0.1");
    }

    #[test]
    fn retry_after_rounds_up() {
        let now = Utc::now();
        assert_eq!(retry_after_seconds(now + Duration::milliseconds(1), now), 1);
        assert_eq!(retry_after_seconds(now + Duration::milliseconds(1000), now), 1);
        assert_eq!(retry_after_seconds(now + Duration::milliseconds(1001), now), 2);
        assert_eq!(retry_after_seconds(now + Duration::seconds(60), now), 60);
    }

    #[test]
    fn window_is_capped() {
        let limit = WindowLimit::new(u64::MAX, 1);
        assert_eq!(limit.window(), Duration::milliseconds(WindowLimit::MAX_WINDOW_MS as i64));
        assert!(Utc::now().checked_add_signed(limit.window()).is_some());
        assert!(limit.validate().is_err());
        assert!(WindowLimit::new(0, 1).validate().is_err());
        assert!(WindowLimit::new(WindowLimit::MAX_WINDOW_MS, 0).validate().is_ok());
    }

    #[test]
    fn policy_names_are_distinct() {
        let mut names: Vec<&str> = RateLimitPolicy::ALL.iter().map(|p| p.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), RateLimitPolicy::ALL.len());
    }
}
