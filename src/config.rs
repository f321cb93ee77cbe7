use crate::models::rate_limit::{RateLimitPolicy, WindowLimit};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

pub const DEFAULT_API_BASE_PATH: &str = "/api/v1";

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub cors: CorsConfig,
    pub api: ApiConfig,
    pub rate_limit: RateLimitConfig,
    pub account_lock: AccountLockConfig,
    pub redemption: RedemptionConfig,
    pub cron: CronConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout: u64,
    pub acquire_timeout: u64,
    pub run_migrations: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub address: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub json_format: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
    pub allow_credentials: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ApiConfig {
    pub base_path: String,
    pub enable_swagger: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitBackend {
    Memory,
    Redis,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RateLimitConfig {
    pub backend: RateLimitBackend,
    pub redis_url: String,
    pub cleanup_interval_seconds: u64,
    pub require_client_ip: bool,
    pub policies: PolicyLimits,
}

/// Window and threshold for every named policy.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PolicyLimits {
    pub login: WindowLimit,
    pub signup: WindowLimit,
    pub email_verification: WindowLimit,
    pub password_change: WindowLimit,
    pub public_api: WindowLimit,
    pub redeem: WindowLimit,
}

impl PolicyLimits {
    pub fn limit_for(&self, policy: RateLimitPolicy) -> WindowLimit {
        match policy {
            RateLimitPolicy::Login => self.login,
            RateLimitPolicy::Signup => self.signup,
            RateLimitPolicy::EmailVerification => self.email_verification,
            RateLimitPolicy::PasswordChange => self.password_change,
            RateLimitPolicy::PublicApi => self.public_api,
            RateLimitPolicy::Redeem => self.redeem,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        for policy in RateLimitPolicy::ALL {
            self.limit_for(policy)
                .validate()
                .map_err(|e| format!("rate_limit.policies.{}: {}", policy, e))?;
        }
        Ok(())
    }

    /// Longest window across policies; stale records older than this are garbage.
    pub fn longest_window_ms(&self) -> u64 {
        RateLimitPolicy::ALL.iter().map(|policy| self.limit_for(*policy).window_ms).max().unwrap_or(0)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AccountLockConfig {
    /// Consecutive failures that trigger a lock.
    pub max_failed_attempts: i32,
    pub base_lock_minutes: i64,
    pub max_lock_minutes: i64,
    /// Upper bound on the progressive multiplier applied to the base duration.
    pub max_multiplier: i32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RedemptionConfig {
    /// Length of generated codes, excluding any prefix.
    pub code_length: usize,
    pub max_batch_size: usize,
    /// Write `failed` history rows for rejected redemptions of existing codes.
    pub record_failures: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct CronConfig {
    pub auth_token: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/ledger_guard".to_string(),
            max_connections: 16,
            min_connections: 4,
            connection_timeout: 5,
            acquire_timeout: 5,
            run_migrations: true,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            address: "127.0.0.1".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["http://localhost:3000".to_string()],
            allow_credentials: true,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_path: DEFAULT_API_BASE_PATH.to_string(),
            enable_swagger: true,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            backend: RateLimitBackend::Memory,
            redis_url: "redis://127.0.0.1/".to_string(),
            cleanup_interval_seconds: 60,
            require_client_ip: false,
            policies: PolicyLimits::default(),
        }
    }
}

impl Default for PolicyLimits {
    fn default() -> Self {
        Self {
            login: WindowLimit::new(15 * 60 * 1000, 10),
            signup: WindowLimit::new(60 * 60 * 1000, 5),
            email_verification: WindowLimit::new(10 * 60 * 1000, 3),
            password_change: WindowLimit::new(15 * 60 * 1000, 5),
            public_api: WindowLimit::new(60 * 1000, 100),
            redeem: WindowLimit::new(60 * 1000, 10),
        }
    }
}

impl Default for AccountLockConfig {
    fn default() -> Self {
        Self {
            max_failed_attempts: 5,
            base_lock_minutes: 15,
            max_lock_minutes: 24 * 60,
            max_multiplier: 10,
        }
    }
}

impl Default for RedemptionConfig {
    fn default() -> Self {
        Self {
            code_length: 16,
            max_batch_size: 500,
            record_failures: true,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources in priority order:
    /// 1. Built-in defaults
    /// 2. Guard.toml (base configuration file)
    /// 3. Environment variables (prefixed with LEDGER_GUARD_, nested with `__`)
    /// 4. DATABASE_URL environment variable
    pub fn load() -> Result<Self, figment::Error> {
        let config: Config = Self::figment().extract()?;
        config.rate_limit.policies.validate().map_err(figment::Error::from)?;
        Ok(config)
    }

    fn figment() -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("Guard.toml").nested())
            .merge(Env::prefixed("LEDGER_GUARD_").split("__"))
            .merge(Env::raw().only(&["DATABASE_URL"]).map(|_| "database.url".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_match_lockout_schedule() {
        let config = Config::default();
        assert_eq!(config.account_lock.max_failed_attempts, 5);
        assert_eq!(config.account_lock.base_lock_minutes, 15);
        assert_eq!(config.account_lock.max_lock_minutes, 1440);
        assert_eq!(config.account_lock.max_multiplier, 10);
    }

    #[test]
    fn env_overrides_nested_values() {
        Jail::expect_with(|jail| {
            jail.set_env("LEDGER_GUARD_ACCOUNT_LOCK__MAX_FAILED_ATTEMPTS", "3");
            jail.set_env("LEDGER_GUARD_RATE_LIMIT__POLICIES__LOGIN__MAX_ATTEMPTS", "7");
            jail.set_env("DATABASE_URL", "postgres://db/test");

            let config = Config::load()?;
            assert_eq!(config.account_lock.max_failed_attempts, 3);
            assert_eq!(config.rate_limit.policies.login.max_attempts, 7);
            assert_eq!(config.rate_limit.policies.login.window_ms, 15 * 60 * 1000);
            assert_eq!(config.database.url, "postgres://db/test");
            Ok(())
        });
    }

    #[test]
    fn toml_file_is_layered_over_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "Guard.toml",
                r#"
                [default.redemption]
                code_length = 12

                [default.rate_limit]
                backend = "redis"
                "#,
            )?;

            let config = Config::load()?;
            assert_eq!(config.redemption.code_length, 12);
            assert_eq!(config.redemption.max_batch_size, 500);
            assert_eq!(config.rate_limit.backend, RateLimitBackend::Redis);
            Ok(())
        });
    }

    #[test]
    fn oversized_window_is_rejected() {
        Jail::expect_with(|jail| {
            jail.set_env("LEDGER_GUARD_RATE_LIMIT__POLICIES__REDEEM__WINDOW_MS", "999999999999999");

            let err = Config::load().expect_err("window above the cap must fail to load");
            assert!(err.to_string().contains("rate_limit.policies.redeem"));
            Ok(())
        });
    }

    #[test]
    fn longest_window_covers_all_policies() {
        let limits = PolicyLimits::default();
        assert_eq!(limits.longest_window_ms(), 60 * 60 * 1000);
    }
}
