use crate::config::RedemptionConfig;
use crate::database::redemption::{RedemptionRepository, RedemptionUnitOfWork};
use crate::error::app_error::AppError;
use crate::error::redemption::RedemptionError;
use crate::models::redeem_code::{RedeemCode, RedeemCodeStatus, RedeemReward, normalize_code};
use crate::models::redemption::{NewRedemptionHistory, RedemptionGrant, RedemptionResult, RedemptionStatus};
use crate::models::vip::{VipExtension, VipStatus};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// A validation failure, plus the status correction it uncovered, if any.
struct Rejection {
    error: RedemptionError,
    correction: Option<RedeemCodeStatus>,
}

impl Rejection {
    fn new(error: RedemptionError) -> Self {
        Self { error, correction: None }
    }

    fn correcting(error: RedemptionError, status: RedeemCodeStatus) -> Self {
        Self {
            error,
            correction: Some(status),
        }
    }
}

/// Exactly-once redemption of credits and VIP codes.
///
/// Each call runs in one unit of work that holds the code row lock from
/// lookup to commit, so redemptions of one code are serialized and
/// `used_count` never loses an update.
pub struct RedemptionEngine {
    repo: Arc<dyn RedemptionRepository>,
    config: RedemptionConfig,
}

impl RedemptionEngine {
    pub fn new(repo: Arc<dyn RedemptionRepository>, config: RedemptionConfig) -> Self {
        Self { repo, config }
    }

    pub async fn redeem(&self, code: &str, user_id: &Uuid) -> Result<RedemptionResult, RedemptionError> {
        self.redeem_at(code, user_id, Utc::now()).await
    }

    pub async fn redeem_at(&self, code: &str, user_id: &Uuid, now: DateTime<Utc>) -> Result<RedemptionResult, RedemptionError> {
        let normalized = normalize_code(code);

        let mut uow = self.repo.begin_redemption().await.map_err(|e| internal(&normalized, e))?;

        let redeem_code = match uow.lock_code(&normalized).await {
            Ok(Some(redeem_code)) => redeem_code,
            Ok(None) => return Err(RedemptionError::CodeNotFound),
            Err(e) => return Err(internal(&normalized, e)),
        };

        let validation = self.validate(uow.as_mut(), &redeem_code, user_id, now).await;
        if let Err(rejection) = validation {
            if let Some(status) = rejection.correction {
                self.commit_correction(uow, &redeem_code, status).await;
            } else {
                drop(uow);
            }
            self.record_failure(&redeem_code, user_id, &rejection.error).await;
            return Err(rejection.error);
        }

        // The unit of work must be gone before a failed row is written.
        let applied = self.apply(uow.as_mut(), &redeem_code, user_id, now).await;
        let result = match applied {
            Ok(result) => uow.commit().await.map(|_| result),
            Err(e) => {
                drop(uow);
                Err(e)
            }
        };

        match result {
            Ok(result) => {
                info!(code = %redeem_code.code, user_id = %user_id, history_id = %result.history_id, "code redeemed");
                Ok(result)
            }
            Err(e) => {
                let failure = match e {
                    AppError::Conflict(_) => RedemptionError::AlreadyRedeemed,
                    e => internal(&redeem_code.code, e),
                };
                self.record_failure(&redeem_code, user_id, &failure).await;
                Err(failure)
            }
        }
    }

    async fn validate(&self, uow: &mut dyn RedemptionUnitOfWork, code: &RedeemCode, user_id: &Uuid, now: DateTime<Utc>) -> Result<(), Rejection> {
        match code.status {
            RedeemCodeStatus::Active => {}
            RedeemCodeStatus::Inactive => return Err(Rejection::new(RedemptionError::CodeUnavailable)),
            RedeemCodeStatus::Expired => return Err(Rejection::new(RedemptionError::CodeExpired)),
            RedeemCodeStatus::UsedUp => return Err(Rejection::new(RedemptionError::CodeExhausted)),
        }

        if code.is_expired_at(now) {
            return Err(Rejection::correcting(RedemptionError::CodeExpired, RedeemCodeStatus::Expired));
        }

        if code.is_exhausted() {
            return Err(Rejection::correcting(RedemptionError::CodeExhausted, RedeemCodeStatus::UsedUp));
        }

        match uow.has_successful_redemption(&code.id, user_id).await {
            Ok(false) => Ok(()),
            Ok(true) => Err(Rejection::new(RedemptionError::AlreadyRedeemed)),
            Err(e) => Err(Rejection::new(internal(&code.code, e))),
        }
    }

    /// Persist a lazily detected status on its own, independent of any later
    /// redemption of the code.
    async fn commit_correction(&self, mut uow: Box<dyn RedemptionUnitOfWork>, code: &RedeemCode, status: RedeemCodeStatus) {
        let outcome = match uow.update_code_usage(&code.id, code.used_count, status).await {
            Ok(()) => uow.commit().await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => info!(code = %code.code, status = ?status, "corrected code status"),
            Err(e) => warn!(code = %code.code, status = ?status, error = %e, "failed to correct code status"),
        }
    }

    async fn apply(&self, uow: &mut dyn RedemptionUnitOfWork, code: &RedeemCode, user_id: &Uuid, now: DateTime<Utc>) -> Result<RedemptionResult, AppError> {
        let used_count = code.used_count + 1;
        let status = code.derive_status(used_count, now);
        uow.update_code_usage(&code.id, used_count, status).await?;

        let (grant, message) = match &code.reward {
            RedeemReward::Credits { amount } => {
                let new_balance = uow.credit_balance(user_id, *amount, &format!("redeem code {}", code.code)).await?;
                let grant = RedemptionGrant::Credits {
                    amount: *amount,
                    new_balance,
                };
                (grant, format!("Redeemed {} credits", amount))
            }
            reward => {
                let extension = self.vip_extension(uow, reward).await?;
                let current = uow.get_vip_status(user_id).await?;
                let vip = VipStatus::extended(current.as_ref(), &extension, now)
                    .ok_or_else(|| AppError::BadRequest("VIP expiry is out of range".to_string()))?;
                uow.save_vip_status(user_id, &vip).await?;

                let vip_expire_date = vip.vip_expire_date.unwrap_or(now);
                let grant = RedemptionGrant::Vip {
                    vip_expire_date,
                    vip_level: vip.vip_level,
                };
                (grant, format!("VIP extended to {}", vip_expire_date.to_rfc3339()))
            }
        };

        let mut snapshot = code.snapshot();
        snapshot.used_count = used_count;

        let history = uow
            .insert_history(&NewRedemptionHistory {
                code_id: code.id,
                user_id: *user_id,
                amount_granted: code.reward.amount(),
                status: RedemptionStatus::Success,
                message,
                snapshot,
            })
            .await?;

        Ok(RedemptionResult {
            history_id: history.id,
            code: code.code.clone(),
            reward: code.reward.clone(),
            grant,
            redeemed_at: history.redeemed_at,
        })
    }

    async fn vip_extension(&self, uow: &mut dyn RedemptionUnitOfWork, reward: &RedeemReward) -> Result<VipExtension, AppError> {
        let extension = match reward {
            RedeemReward::VipPlan { plan_id } => {
                let plan = uow
                    .get_vip_plan(plan_id)
                    .await?
                    .ok_or_else(|| AppError::NotFound(format!("VIP plan {}", plan_id)))?;
                VipExtension::from_plan(&plan)?
            }
            RedeemReward::VipDuration { months } => VipExtension {
                months: *months,
                days: 0,
                level: None,
            },
            RedeemReward::VipDays { days } => VipExtension {
                months: 0,
                days: *days,
                level: None,
            },
            RedeemReward::VipLevel { level, days } => VipExtension {
                months: 0,
                days: *days,
                level: Some(*level),
            },
            RedeemReward::Credits { .. } => return Err(AppError::BadRequest("credits code has no VIP terms".to_string())),
        };

        Ok(extension)
    }

    /// Best-effort `failed` history row, written outside any unit of work.
    async fn record_failure(&self, code: &RedeemCode, user_id: &Uuid, failure: &RedemptionError) {
        if !self.config.record_failures {
            return;
        }

        let entry = NewRedemptionHistory {
            code_id: code.id,
            user_id: *user_id,
            amount_granted: 0,
            status: RedemptionStatus::Failed,
            message: format!("{}: {}", failure.reason(), failure),
            snapshot: code.snapshot(),
        };

        if let Err(e) = self.repo.record_failed_redemption(&entry).await {
            warn!(code = %code.code, user_id = %user_id, error = %e, "failed to record failed redemption");
        }
    }
}

fn internal(code: &str, e: AppError) -> RedemptionError {
    error!(code = %code, error = ?e, "redemption failed");
    RedemptionError::Internal(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::vip::VipPlan;
    use crate::test_utils::{MemoryRedemptionRepository, RedemptionStore, sample_code};
    use chrono::Duration;

    fn engine(repo: Arc<MemoryRedemptionRepository>) -> RedemptionEngine {
        RedemptionEngine::new(repo, RedemptionConfig::default())
    }

    fn store_with(code: RedeemCode, users: &[Uuid]) -> RedemptionStore {
        let mut store = RedemptionStore::default();
        store.codes.insert(code.code.clone(), code);
        for user in users {
            store.balances.insert(*user, 100);
        }
        store
    }

    #[tokio::test]
    async fn same_user_redeems_once() {
        let user = Uuid::new_v4();
        let code = sample_code(RedeemReward::Credits { amount: 50 }, 10);
        let repo = Arc::new(MemoryRedemptionRepository::new(store_with(code.clone(), &[user])));
        let engine = engine(repo.clone());

        let result = engine.redeem(&code.code, &user).await.unwrap();
        assert_eq!(result.grant, RedemptionGrant::Credits { amount: 50, new_balance: 150 });

        let again = engine.redeem(&code.code, &user).await;
        assert_eq!(again, Err(RedemptionError::AlreadyRedeemed));

        let store = repo.snapshot().await;
        assert_eq!(store.balances[&user], 150);
        assert_eq!(store.codes[&code.code].used_count, 1);
        assert_eq!(store.ledger.len(), 1);
        assert_eq!(store.history_with(RedemptionStatus::Success).len(), 1);
        assert_eq!(store.history_with(RedemptionStatus::Failed).len(), 1);
    }

    #[tokio::test]
    async fn fourth_user_finds_the_code_exhausted() {
        let users: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
        let code = sample_code(RedeemReward::Credits { amount: 10 }, 3);
        let repo = Arc::new(MemoryRedemptionRepository::new(store_with(code.clone(), &users)));
        let engine = engine(repo.clone());

        for user in &users[..3] {
            engine.redeem(&code.code, user).await.unwrap();
        }

        let store = repo.snapshot().await;
        assert_eq!(store.codes[&code.code].status, RedeemCodeStatus::UsedUp);
        assert_eq!(store.codes[&code.code].used_count, 3);

        assert_eq!(engine.redeem(&code.code, &users[3]).await, Err(RedemptionError::CodeExhausted));
        assert_eq!(repo.snapshot().await.balances[&users[3]], 100);
    }

    #[tokio::test]
    async fn vip_time_stacks_on_active_vip() {
        let user = Uuid::new_v4();
        let now = Utc::now();
        let code = sample_code(RedeemReward::VipDays { days: 30 }, 5);
        let mut store = store_with(code.clone(), &[user]);
        store.vip.insert(
            user,
            VipStatus {
                is_vip: true,
                vip_expire_date: Some(now + Duration::days(10)),
                vip_level: 1,
            },
        );
        let repo = Arc::new(MemoryRedemptionRepository::new(store));

        let result = engine(repo.clone()).redeem_at(&code.code, &user, now).await.unwrap();

        let expected = now + Duration::days(40);
        assert_eq!(
            result.grant,
            RedemptionGrant::Vip {
                vip_expire_date: expected,
                vip_level: 1
            }
        );
        assert_eq!(repo.snapshot().await.vip[&user].vip_expire_date, Some(expected));
    }

    #[tokio::test]
    async fn vip_plan_is_resolved_inside_the_unit_of_work() {
        let user = Uuid::new_v4();
        let now = Utc::now();
        let plan = VipPlan {
            id: Uuid::new_v4(),
            name: "Gold".to_string(),
            duration_months: 0,
            duration_days: 14,
            level: 3,
        };
        let code = sample_code(RedeemReward::VipPlan { plan_id: plan.id }, 1);
        let mut store = store_with(code.clone(), &[user]);
        store.plans.insert(plan.id, plan);
        let repo = Arc::new(MemoryRedemptionRepository::new(store));

        let result = engine(repo).redeem_at(&code.code, &user, now).await.unwrap();
        assert_eq!(
            result.grant,
            RedemptionGrant::Vip {
                vip_expire_date: now + Duration::days(14),
                vip_level: 3
            }
        );
    }

    #[tokio::test]
    async fn missing_vip_plan_rolls_back() {
        let user = Uuid::new_v4();
        let code = sample_code(RedeemReward::VipPlan { plan_id: Uuid::new_v4() }, 1);
        let repo = Arc::new(MemoryRedemptionRepository::new(store_with(code.clone(), &[user])));

        let result = engine(repo.clone()).redeem(&code.code, &user).await;
        assert!(matches!(result, Err(RedemptionError::Internal(_))));

        let store = repo.snapshot().await;
        assert_eq!(store.codes[&code.code].used_count, 0);
        assert_eq!(store.codes[&code.code].status, RedeemCodeStatus::Active);
    }

    #[tokio::test]
    async fn empty_vip_plan_rolls_back() {
        let user = Uuid::new_v4();
        let plan = VipPlan {
            id: Uuid::new_v4(),
            name: "Empty".to_string(),
            duration_months: 0,
            duration_days: 0,
            level: 2,
        };
        let code = sample_code(RedeemReward::VipPlan { plan_id: plan.id }, 1);
        let mut store = store_with(code.clone(), &[user]);
        store.plans.insert(plan.id, plan);
        let repo = Arc::new(MemoryRedemptionRepository::new(store));

        let result = engine(repo.clone()).redeem(&code.code, &user).await;
        assert!(matches!(result, Err(RedemptionError::Internal(_))));

        let store = repo.snapshot().await;
        assert_eq!(store.codes[&code.code].used_count, 0);
        assert!(store.vip.is_empty());
        assert!(store.history_with(RedemptionStatus::Success).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_single_use_redemption_has_one_winner() {
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let code = sample_code(RedeemReward::Credits { amount: 25 }, 1);
        let repo = Arc::new(MemoryRedemptionRepository::new(store_with(code.clone(), &[first, second])));
        let engine = Arc::new(engine(repo.clone()));

        let a = tokio::spawn({
            let engine = engine.clone();
            let code = code.code.clone();
            async move { engine.redeem(&code, &first).await }
        });
        let b = tokio::spawn({
            let engine = engine.clone();
            let code = code.code.clone();
            async move { engine.redeem(&code, &second).await }
        });

        let results = [a.await.unwrap(), b.await.unwrap()];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results.contains(&Err(RedemptionError::CodeExhausted)));

        let store = repo.snapshot().await;
        assert_eq!(store.codes[&code.code].used_count, 1);
        assert_eq!(store.balances[&first] + store.balances[&second], 225);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn same_user_racing_on_multi_use_code_wins_once() {
        let user = Uuid::new_v4();
        let code = sample_code(RedeemReward::Credits { amount: 30 }, 5);
        let repo = Arc::new(MemoryRedemptionRepository::new(store_with(code.clone(), &[user])));
        let engine = Arc::new(engine(repo.clone()));

        let tasks: Vec<_> = (0..2)
            .map(|_| {
                let engine = engine.clone();
                let code = code.code.clone();
                tokio::spawn(async move { engine.redeem(&code, &user).await })
            })
            .collect();
        let mut results = Vec::new();
        for task in tasks {
            results.push(task.await.unwrap());
        }

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results.contains(&Err(RedemptionError::AlreadyRedeemed)));

        let store = repo.snapshot().await;
        assert_eq!(store.balances[&user], 130);
        assert_eq!(store.codes[&code.code].used_count, 1);
        assert_eq!(store.codes[&code.code].status, RedeemCodeStatus::Active);
        assert_eq!(store.history_with(RedemptionStatus::Success).len(), 1);
    }

    #[tokio::test]
    async fn expiry_is_corrected_on_detection() {
        let user = Uuid::new_v4();
        let now = Utc::now();
        let mut code = sample_code(RedeemReward::Credits { amount: 5 }, 10);
        code.expires_at = Some(now - Duration::minutes(1));
        let repo = Arc::new(MemoryRedemptionRepository::new(store_with(code.clone(), &[user])));

        let result = engine(repo.clone()).redeem_at(&code.code, &user, now).await;
        assert_eq!(result, Err(RedemptionError::CodeExpired));

        let store = repo.snapshot().await;
        assert_eq!(store.codes[&code.code].status, RedeemCodeStatus::Expired);
        assert_eq!(store.balances[&user], 100);
    }

    #[tokio::test]
    async fn exhausted_active_code_is_corrected() {
        let user = Uuid::new_v4();
        let mut code = sample_code(RedeemReward::Credits { amount: 5 }, 2);
        code.used_count = 2;
        let repo = Arc::new(MemoryRedemptionRepository::new(store_with(code.clone(), &[user])));

        assert_eq!(engine(repo.clone()).redeem(&code.code, &user).await, Err(RedemptionError::CodeExhausted));
        assert_eq!(repo.snapshot().await.codes[&code.code].status, RedeemCodeStatus::UsedUp);
    }

    #[tokio::test]
    async fn inactive_and_unknown_codes_are_rejected() {
        let user = Uuid::new_v4();
        let mut code = sample_code(RedeemReward::Credits { amount: 5 }, 2);
        code.status = RedeemCodeStatus::Inactive;
        let repo = Arc::new(MemoryRedemptionRepository::new(store_with(code.clone(), &[user])));
        let engine = engine(repo);

        assert_eq!(engine.redeem(&code.code, &user).await, Err(RedemptionError::CodeUnavailable));
        assert_eq!(engine.redeem("NO-SUCH-CODE", &user).await, Err(RedemptionError::CodeNotFound));
    }

    #[tokio::test]
    async fn lookup_is_case_insensitive() {
        let user = Uuid::new_v4();
        let code = sample_code(RedeemReward::Credits { amount: 5 }, 2);
        let repo = Arc::new(MemoryRedemptionRepository::new(store_with(code.clone(), &[user])));

        let lowered = format!("  {}  ", code.code.to_lowercase());
        assert!(engine(repo).redeem(&lowered, &user).await.is_ok());
    }

    #[tokio::test]
    async fn history_failure_rolls_back_the_grant() {
        let user = Uuid::new_v4();
        let code = sample_code(RedeemReward::Credits { amount: 40 }, 5);
        let repo = Arc::new(MemoryRedemptionRepository::new(store_with(code.clone(), &[user])));
        repo.fail_history_inserts(true);

        let result = engine(repo.clone()).redeem(&code.code, &user).await;
        assert!(matches!(result, Err(RedemptionError::Internal(_))));

        let store = repo.snapshot().await;
        assert_eq!(store.balances[&user], 100);
        assert_eq!(store.codes[&code.code].used_count, 0);
        assert!(store.ledger.is_empty());
        assert!(store.history_with(RedemptionStatus::Success).is_empty());
        assert_eq!(store.history_with(RedemptionStatus::Failed).len(), 1);

        repo.fail_history_inserts(false);
        assert!(engine(repo.clone()).redeem(&code.code, &user).await.is_ok());
    }

    #[tokio::test]
    async fn failures_are_not_recorded_when_disabled() {
        let user = Uuid::new_v4();
        let mut code = sample_code(RedeemReward::Credits { amount: 5 }, 2);
        code.status = RedeemCodeStatus::Inactive;
        let repo = Arc::new(MemoryRedemptionRepository::new(store_with(code.clone(), &[user])));
        let engine = RedemptionEngine::new(
            repo.clone(),
            RedemptionConfig {
                record_failures: false,
                ..RedemptionConfig::default()
            },
        );

        assert!(engine.redeem(&code.code, &user).await.is_err());
        assert!(repo.snapshot().await.history.is_empty());
    }
}
