use crate::database::account_security::AccountSecurityRepository;
use crate::database::postgres_repository::PostgresRepository;
use crate::database::redemption::{RedemptionRepository, RedemptionUnitOfWork};
use crate::error::app_error::AppError;
use crate::models::account_security::AccountSecurityState;
use crate::models::redeem_code::{NewRedeemCode, RedeemCode, RedeemCodeStatus, RedeemReward};
use crate::models::redemption::{NewRedemptionHistory, RedemptionHistoryEntry, RedemptionStatus};
use crate::models::vip::{VipPlan, VipStatus};
use chrono::{DateTime, Duration, Utc};
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// An active code with a random upper-case name and no expiry.
pub fn sample_code(reward: RedeemReward, max_uses: i32) -> RedeemCode {
    RedeemCode {
        id: Uuid::new_v4(),
        code: format!("TEST-{}", Uuid::new_v4().simple().to_string().to_uppercase()),
        reward,
        max_uses,
        used_count: 0,
        status: RedeemCodeStatus::Active,
        expires_at: None,
        created_by: None,
        created_at: Utc::now(),
    }
}

/// Pool on `DATABASE_URL` with migrations applied. Tests share the database,
/// so every row they create carries a fresh random key.
pub async fn setup_test_db() -> PgPool {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for database tests");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .expect("Failed to connect to test database");
    sqlx::migrate!().run(&pool).await.expect("Failed to run migrations");
    pool
}

pub struct TestUser {
    pub id: Uuid,
    pub email: String,
}

pub async fn create_test_user(pool: &PgPool, credits: i64) -> TestUser {
    let email = format!("user-{}@example.com", Uuid::new_v4().simple());
    let id = sqlx::query_scalar::<_, Uuid>("INSERT INTO users (name, email, password_hash, credits) VALUES ('Test', $1, 'x', $2) RETURNING id")
        .bind(&email)
        .bind(credits)
        .fetch_one(pool)
        .await
        .expect("Failed to create test user");

    TestUser { id, email }
}

pub async fn create_test_code(pool: &PgPool, reward: RedeemReward, max_uses: i32, expires_at: Option<DateTime<Utc>>) -> RedeemCode {
    let new_code = NewRedeemCode {
        code: format!("TEST-{}", Uuid::new_v4().simple().to_string().to_uppercase()),
        reward,
        max_uses,
        expires_at,
        created_by: None,
    };

    PostgresRepository::new(pool.clone())
        .create_redeem_codes(std::slice::from_ref(&new_code))
        .await
        .expect("Failed to create test code")
        .remove(0)
}

pub async fn create_test_vip_plan(pool: &PgPool, duration_months: i32, duration_days: i32, level: i32) -> VipPlan {
    sqlx::query_as::<_, VipPlan>(
        r#"
        INSERT INTO vip_plans (name, duration_months, duration_days, level)
        VALUES ($1, $2, $3, $4)
        RETURNING id, name, duration_months, duration_days, level
        "#,
    )
    .bind(format!("Plan {}", Uuid::new_v4().simple()))
    .bind(duration_months)
    .bind(duration_days)
    .bind(level)
    .fetch_one(pool)
    .await
    .expect("Failed to create test VIP plan")
}

fn unavailable() -> AppError {
    AppError::db("test store unavailable", sqlx::Error::PoolTimedOut)
}

#[derive(Default)]
pub struct MemorySecurityRepository {
    states: Mutex<HashMap<String, AccountSecurityState>>,
    events: Mutex<Vec<String>>,
}

impl MemorySecurityRepository {
    pub fn with_accounts(identities: &[&str]) -> Self {
        let states = identities
            .iter()
            .map(|identity| (identity.to_string(), AccountSecurityState::default()))
            .collect();

        Self {
            states: Mutex::new(states),
            events: Mutex::new(Vec::new()),
        }
    }

    pub async fn state(&self, identity: &str) -> Option<AccountSecurityState> {
        self.states.lock().await.get(identity).cloned()
    }

    pub async fn set_state(&self, identity: &str, state: AccountSecurityState) {
        self.states.lock().await.insert(identity.to_string(), state);
    }

    /// Event types logged so far, oldest first.
    pub async fn events(&self) -> Vec<String> {
        self.events.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl AccountSecurityRepository for MemorySecurityRepository {
    async fn get_security_state(&self, identity: &str) -> Result<Option<AccountSecurityState>, AppError> {
        Ok(self.state(identity).await)
    }

    async fn save_security_state(&self, identity: &str, state: &AccountSecurityState) -> Result<(), AppError> {
        if let Some(stored) = self.states.lock().await.get_mut(identity) {
            *stored = state.clone();
        }
        Ok(())
    }

    async fn increment_failed_attempts(&self, identity: &str, now: DateTime<Utc>) -> Result<Option<AccountSecurityState>, AppError> {
        let mut states = self.states.lock().await;
        let Some(state) = states.get_mut(identity) else {
            return Ok(None);
        };
        if state.is_locked_at(now) {
            return Ok(None);
        }
        if state.has_stale_lock(now) {
            state.clear();
        }

        state.failed_login_attempts += 1;
        state.last_failed_login_at = Some(now);
        Ok(Some(state.clone()))
    }

    async fn lock_account(
        &self,
        identity: &str,
        min_failed_attempts: i32,
        reason: &str,
        now: DateTime<Utc>,
        duration: Duration,
    ) -> Result<Option<AccountSecurityState>, AppError> {
        let mut states = self.states.lock().await;
        let Some(state) = states.get_mut(identity) else {
            return Ok(None);
        };
        if state.is_locked || state.failed_login_attempts < min_failed_attempts {
            return Ok(None);
        }

        state.lock(reason, now, duration);
        Ok(Some(state.clone()))
    }

    async fn log_security_event(&self, _identity: &str, event_type: &str, _success: bool, _metadata: JsonValue) -> Result<(), AppError> {
        self.events.lock().await.push(event_type.to_string());
        Ok(())
    }
}

/// Every call fails as if the database were down.
pub struct FailingSecurityRepository;

#[async_trait::async_trait]
impl AccountSecurityRepository for FailingSecurityRepository {
    async fn get_security_state(&self, _identity: &str) -> Result<Option<AccountSecurityState>, AppError> {
        Err(unavailable())
    }

    async fn save_security_state(&self, _identity: &str, _state: &AccountSecurityState) -> Result<(), AppError> {
        Err(unavailable())
    }

    async fn increment_failed_attempts(&self, _identity: &str, _now: DateTime<Utc>) -> Result<Option<AccountSecurityState>, AppError> {
        Err(unavailable())
    }

    async fn lock_account(
        &self,
        _identity: &str,
        _min_failed_attempts: i32,
        _reason: &str,
        _now: DateTime<Utc>,
        _duration: Duration,
    ) -> Result<Option<AccountSecurityState>, AppError> {
        Err(unavailable())
    }

    async fn log_security_event(&self, _identity: &str, _event_type: &str, _success: bool, _metadata: JsonValue) -> Result<(), AppError> {
        Err(unavailable())
    }
}

/// Everything a redemption reads or writes.
#[derive(Debug, Clone, Default)]
pub struct RedemptionStore {
    /// Keyed by normalized code.
    pub codes: HashMap<String, RedeemCode>,
    pub history: Vec<RedemptionHistoryEntry>,
    pub balances: HashMap<Uuid, i64>,
    pub vip: HashMap<Uuid, VipStatus>,
    pub plans: HashMap<Uuid, VipPlan>,
    /// `(user_id, amount, reason)` per credit grant.
    pub ledger: Vec<(Uuid, i64, String)>,
}

impl RedemptionStore {
    pub fn history_with(&self, status: RedemptionStatus) -> Vec<&RedemptionHistoryEntry> {
        self.history.iter().filter(|entry| entry.status == status).collect()
    }

    fn to_entry(entry: &NewRedemptionHistory) -> RedemptionHistoryEntry {
        RedemptionHistoryEntry {
            id: Uuid::new_v4(),
            code_id: entry.code_id,
            user_id: entry.user_id,
            amount_granted: entry.amount_granted,
            status: entry.status,
            message: entry.message.clone(),
            redeemed_at: Utc::now(),
            snapshot: sqlx::types::Json(entry.snapshot.clone()),
        }
    }
}

/// In-memory redemption storage. A unit of work holds the whole store and
/// edits a staged copy, so units of work run one at a time and dropping one
/// discards its writes.
pub struct MemoryRedemptionRepository {
    store: Arc<Mutex<RedemptionStore>>,
    fail_history: Arc<AtomicBool>,
}

impl MemoryRedemptionRepository {
    pub fn new(store: RedemptionStore) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
            fail_history: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn snapshot(&self) -> RedemptionStore {
        self.store.lock().await.clone()
    }

    /// Make `insert_history` fail inside units of work.
    pub fn fail_history_inserts(&self, fail: bool) {
        self.fail_history.store(fail, Ordering::SeqCst);
    }
}

struct MemoryUnitOfWork {
    guard: OwnedMutexGuard<RedemptionStore>,
    staged: RedemptionStore,
    fail_history: bool,
}

#[async_trait::async_trait]
impl RedemptionRepository for MemoryRedemptionRepository {
    async fn begin_redemption(&self) -> Result<Box<dyn RedemptionUnitOfWork>, AppError> {
        let guard = self.store.clone().lock_owned().await;
        let staged = guard.clone();

        Ok(Box::new(MemoryUnitOfWork {
            guard,
            staged,
            fail_history: self.fail_history.load(Ordering::SeqCst),
        }))
    }

    async fn record_failed_redemption(&self, entry: &NewRedemptionHistory) -> Result<(), AppError> {
        self.store.lock().await.history.push(RedemptionStore::to_entry(entry));
        Ok(())
    }
}

#[async_trait::async_trait]
impl RedemptionUnitOfWork for MemoryUnitOfWork {
    async fn lock_code(&mut self, code: &str) -> Result<Option<RedeemCode>, AppError> {
        Ok(self.staged.codes.get(code).cloned())
    }

    async fn has_successful_redemption(&mut self, code_id: &Uuid, user_id: &Uuid) -> Result<bool, AppError> {
        Ok(self
            .staged
            .history
            .iter()
            .any(|entry| entry.code_id == *code_id && entry.user_id == *user_id && entry.status == RedemptionStatus::Success))
    }

    async fn update_code_usage(&mut self, code_id: &Uuid, used_count: i32, status: RedeemCodeStatus) -> Result<(), AppError> {
        let code = self
            .staged
            .codes
            .values_mut()
            .find(|code| code.id == *code_id)
            .ok_or_else(|| AppError::NotFound("redeem code".to_string()))?;
        code.used_count = used_count;
        code.status = status;
        Ok(())
    }

    async fn credit_balance(&mut self, user_id: &Uuid, amount: i64, reason: &str) -> Result<i64, AppError> {
        let balance = self.staged.balances.get_mut(user_id).ok_or(AppError::UserNotFound)?;
        *balance += amount;
        let balance = *balance;
        self.staged.ledger.push((*user_id, amount, reason.to_string()));
        Ok(balance)
    }

    async fn get_vip_plan(&mut self, plan_id: &Uuid) -> Result<Option<VipPlan>, AppError> {
        Ok(self.staged.plans.get(plan_id).cloned())
    }

    async fn get_vip_status(&mut self, user_id: &Uuid) -> Result<Option<VipStatus>, AppError> {
        Ok(self.staged.vip.get(user_id).filter(|status| status.is_vip).cloned())
    }

    async fn save_vip_status(&mut self, user_id: &Uuid, status: &VipStatus) -> Result<(), AppError> {
        self.staged.vip.insert(*user_id, status.clone());
        Ok(())
    }

    async fn insert_history(&mut self, entry: &NewRedemptionHistory) -> Result<RedemptionHistoryEntry, AppError> {
        if self.fail_history {
            return Err(unavailable());
        }

        if entry.status == RedemptionStatus::Success && self.has_successful_redemption(&entry.code_id, &entry.user_id).await? {
            return Err(AppError::Conflict("redemption_history_success_once".to_string()));
        }

        let history = RedemptionStore::to_entry(entry);
        self.staged.history.push(history.clone());
        Ok(history)
    }

    async fn commit(self: Box<Self>) -> Result<(), AppError> {
        let MemoryUnitOfWork { mut guard, staged, .. } = *self;
        *guard = staged;
        Ok(())
    }
}
