use crate::config::{PolicyLimits, RateLimitBackend, RateLimitConfig};
use crate::models::rate_limit::{RateLimitDecision, RateLimitKey, RateLimitRecord, WindowLimit};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum RateLimitStoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("rate limit store unavailable: {0}")]
    Unavailable(String),
}

/// Result of counting one request against a window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowHit {
    pub record: RateLimitRecord,
    pub allowed: bool,
}

/// Fixed-window counter storage.
///
/// `hit` starts a fresh window (count 1) when there is no record or the
/// record's window has ended, increments while under `limit.max_attempts`,
/// and otherwise reports a denial without incrementing.
#[async_trait]
pub trait WindowStore: Send + Sync {
    async fn hit(&self, key: &str, limit: WindowLimit, now: DateTime<Utc>) -> Result<WindowHit, RateLimitStoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    records: HashMap<String, RateLimitRecord>,
    last_purge: Option<DateTime<Utc>>,
}

/// Process-local store. Counters are lost on restart.
#[derive(Debug)]
pub struct MemoryWindowStore {
    state: Mutex<MemoryState>,
    purge_interval: Duration,
}

impl MemoryWindowStore {
    pub fn new(purge_interval: std::time::Duration) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            purge_interval: Duration::from_std(purge_interval).unwrap_or_else(|_| Duration::seconds(60)),
        }
    }

    /// Drop every record whose window has ended.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut state = self.state.lock().await;
        Self::purge_locked(&mut state, now)
    }

    fn purge_locked(state: &mut MemoryState, now: DateTime<Utc>) -> usize {
        let before = state.records.len();
        state.records.retain(|_, record| record.window_reset_at > now);
        state.last_purge = Some(now);
        before - state.records.len()
    }

    pub fn spawn_cleanup_task(self: Arc<Self>, interval: std::time::Duration) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let purged = self.purge_expired(Utc::now()).await;
                if purged > 0 {
                    debug!(purged = purged, "purged expired rate limit windows");
                }
            }
        });
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.state.lock().await.records.len()
    }
}

#[async_trait]
impl WindowStore for MemoryWindowStore {
    async fn hit(&self, key: &str, limit: WindowLimit, now: DateTime<Utc>) -> Result<WindowHit, RateLimitStoreError> {
        let mut state = self.state.lock().await;

        // Lazy purge, at most once per interval.
        if state.last_purge.is_none_or(|last| now - last >= self.purge_interval) {
            Self::purge_locked(&mut state, now);
        }

        let record = state.records.entry(key.to_string()).or_insert_with(|| RateLimitRecord {
            count: 0,
            window_reset_at: now + limit.window(),
        });

        if now >= record.window_reset_at {
            record.count = 0;
            record.window_reset_at = now + limit.window();
        }

        let allowed = record.count < limit.max_attempts;
        if allowed {
            record.count += 1;
        }

        Ok(WindowHit {
            record: record.clone(),
            allowed,
        })
    }
}

/// Start a window with count 1, increment while under the limit, never
/// increment a denied request. Returns `{count, pttl, allowed}`.
const FIXED_WINDOW_SCRIPT: &str = r#"
local count = tonumber(redis.call('GET', KEYS[1]) or '0')
local ttl = redis.call('PTTL', KEYS[1])
local window = tonumber(ARGV[1])
local max = tonumber(ARGV[2])
if count == 0 or ttl <= 0 then
  count = 0
  ttl = window
  redis.call('SET', KEYS[1], 0, 'PX', window)
end
if count < max then
  count = redis.call('INCR', KEYS[1])
  return {count, ttl, 1}
end
return {count, ttl, 0}
"#;

/// Shared store for multi-instance deployments. Keys expire with their window.
pub struct RedisWindowStore {
    connection_manager: ConnectionManager,
    script: redis::Script,
    prefix: String,
}

impl RedisWindowStore {
    pub async fn connect(url: &str) -> Result<Self, RateLimitStoreError> {
        let client = redis::Client::open(url)?;
        let connection_manager = ConnectionManager::new(client).await?;

        let mut conn = connection_manager.clone();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;

        debug!("connected to redis for rate limiting");

        Ok(Self {
            connection_manager,
            script: redis::Script::new(FIXED_WINDOW_SCRIPT),
            prefix: "rate_limit:".to_string(),
        })
    }
}

#[async_trait]
impl WindowStore for RedisWindowStore {
    async fn hit(&self, key: &str, limit: WindowLimit, now: DateTime<Utc>) -> Result<WindowHit, RateLimitStoreError> {
        let mut conn = self.connection_manager.clone();
        let (count, ttl_ms, allowed): (i64, i64, i64) = self
            .script
            .key(format!("{}{}", self.prefix, key))
            .arg(limit.window().num_milliseconds())
            .arg(limit.max_attempts)
            .invoke_async(&mut conn)
            .await?;

        Ok(WindowHit {
            record: RateLimitRecord {
                count: u32::try_from(count).unwrap_or(u32::MAX),
                window_reset_at: now + Duration::milliseconds(ttl_ms.max(0)),
            },
            allowed: allowed == 1,
        })
    }
}

/// Named-policy limiter over an injected [`WindowStore`].
pub struct RateLimiter {
    limits: PolicyLimits,
    store: Arc<dyn WindowStore>,
    require_client_ip: bool,
}

impl RateLimiter {
    pub fn new(limits: PolicyLimits, store: Arc<dyn WindowStore>) -> Self {
        Self {
            limits,
            store,
            require_client_ip: false,
        }
    }

    /// Build the configured backend. A memory store also gets its cleanup task.
    pub async fn from_config(config: &RateLimitConfig) -> Result<Self, RateLimitStoreError> {
        let store: Arc<dyn WindowStore> = match config.backend {
            RateLimitBackend::Memory => {
                let interval = std::time::Duration::from_secs(config.cleanup_interval_seconds.max(1));
                let store = Arc::new(MemoryWindowStore::new(interval));
                store.clone().spawn_cleanup_task(interval);
                store
            }
            RateLimitBackend::Redis => Arc::new(RedisWindowStore::connect(&config.redis_url).await?),
        };

        info!(backend = ?config.backend, "rate limiter ready");

        Ok(Self {
            limits: config.policies.clone(),
            store,
            require_client_ip: config.require_client_ip,
        })
    }

    pub fn require_client_ip(&self) -> bool {
        self.require_client_ip
    }

    pub async fn check(&self, key: &RateLimitKey) -> RateLimitDecision {
        self.check_at(key, Utc::now()).await
    }

    /// Count one request for `key`. Store faults allow the request.
    pub async fn check_at(&self, key: &RateLimitKey, now: DateTime<Utc>) -> RateLimitDecision {
        let limit = self.limits.limit_for(key.policy());

        match self.store.hit(&key.storage_key(), limit, now).await {
            Ok(WindowHit { record, allowed: true }) => RateLimitDecision::allow(limit.max_attempts.saturating_sub(record.count), record.window_reset_at),
            Ok(WindowHit { record, allowed: false }) => RateLimitDecision::deny(record.window_reset_at, now),
            Err(e) => {
                warn!(policy = %key.policy(), error = %e, "rate limit store failed, allowing request");
                RateLimitDecision::allow(limit.max_attempts, now + limit.window())
            }
        }
    }
}
