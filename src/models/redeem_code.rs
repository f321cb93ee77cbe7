use crate::error::app_error::AppError;
use chrono::{DateTime, Utc};
use regex::Regex;
use rocket::FromFormField;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use uuid::Uuid;
use validator::{Validate, ValidationError};

/// Accepted code shape, checked before normalization.
pub static CODE_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(?i)[A-Z0-9][A-Z0-9-]{3,63}$").expect("valid code pattern"));

/// Canonical form used for storage and lookup.
pub fn normalize_code(raw: &str) -> String {
    raw.trim().to_uppercase()
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, JsonSchema, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum RedeemCodeKind {
    Credits,
    VipPlan,
    VipDuration,
    VipDays,
    VipLevel,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, JsonSchema, sqlx::Type, FromFormField)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RedeemCodeStatus {
    #[field(value = "active")]
    Active,
    #[field(value = "inactive")]
    Inactive,
    #[field(value = "expired")]
    Expired,
    #[field(value = "used_up")]
    UsedUp,
}

/// What a code grants. Each kind carries exactly the payload it needs.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, JsonSchema)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum RedeemReward {
    Credits { amount: i64 },
    VipPlan { plan_id: Uuid },
    VipDuration { months: u32 },
    VipDays { days: u32 },
    /// Raises the VIP level and grants `days` of VIP time at that level.
    VipLevel { level: i32, days: u32 },
}

impl RedeemReward {
    pub fn kind(&self) -> RedeemCodeKind {
        match self {
            RedeemReward::Credits { .. } => RedeemCodeKind::Credits,
            RedeemReward::VipPlan { .. } => RedeemCodeKind::VipPlan,
            RedeemReward::VipDuration { .. } => RedeemCodeKind::VipDuration,
            RedeemReward::VipDays { .. } => RedeemCodeKind::VipDays,
            RedeemReward::VipLevel { .. } => RedeemCodeKind::VipLevel,
        }
    }

    /// Numeric payload recorded as `amount_granted` in history.
    pub fn amount(&self) -> i64 {
        match self {
            RedeemReward::Credits { amount } => *amount,
            RedeemReward::VipPlan { .. } => 0,
            RedeemReward::VipDuration { months } => i64::from(*months),
            RedeemReward::VipDays { days } => i64::from(*days),
            RedeemReward::VipLevel { days, .. } => i64::from(*days),
        }
    }

    pub fn validate_terms(&self) -> Result<(), ValidationError> {
        let valid = match self {
            RedeemReward::Credits { amount } => *amount > 0,
            RedeemReward::VipPlan { .. } => true,
            RedeemReward::VipDuration { months } => (1..=120).contains(months),
            RedeemReward::VipDays { days } => (1..=3650).contains(days),
            RedeemReward::VipLevel { level, days } => *level > 0 && (1..=3650).contains(days),
        };

        if valid {
            Ok(())
        } else {
            Err(ValidationError::new("invalid_reward").with_message("reward amount is out of range".into()))
        }
    }

    /// Split into the `(kind, amount, vip_plan_id, vip_level)` column layout.
    pub fn to_columns(&self) -> (RedeemCodeKind, i64, Option<Uuid>, Option<i32>) {
        match self {
            RedeemReward::Credits { amount } => (RedeemCodeKind::Credits, *amount, None, None),
            RedeemReward::VipPlan { plan_id } => (RedeemCodeKind::VipPlan, 0, Some(*plan_id), None),
            RedeemReward::VipDuration { months } => (RedeemCodeKind::VipDuration, i64::from(*months), None, None),
            RedeemReward::VipDays { days } => (RedeemCodeKind::VipDays, i64::from(*days), None, None),
            RedeemReward::VipLevel { level, days } => (RedeemCodeKind::VipLevel, i64::from(*days), None, Some(*level)),
        }
    }

    pub fn from_columns(kind: RedeemCodeKind, amount: i64, vip_plan_id: Option<Uuid>, vip_level: Option<i32>) -> Result<Self, AppError> {
        let as_u32 = |value: i64| u32::try_from(value).map_err(|_| AppError::BadRequest(format!("invalid {:?} amount {}", kind, value)));

        match kind {
            RedeemCodeKind::Credits => Ok(RedeemReward::Credits { amount }),
            RedeemCodeKind::VipPlan => vip_plan_id
                .map(|plan_id| RedeemReward::VipPlan { plan_id })
                .ok_or_else(|| AppError::BadRequest("vip-plan code without a plan".to_string())),
            RedeemCodeKind::VipDuration => Ok(RedeemReward::VipDuration { months: as_u32(amount)? }),
            RedeemCodeKind::VipDays => Ok(RedeemReward::VipDays { days: as_u32(amount)? }),
            RedeemCodeKind::VipLevel => {
                let level = vip_level.ok_or_else(|| AppError::BadRequest("vip-level code without a level".to_string()))?;
                Ok(RedeemReward::VipLevel {
                    level,
                    days: as_u32(amount)?,
                })
            }
        }
    }
}

/// Raw `redeem_codes` row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RedeemCodeRow {
    pub id: Uuid,
    pub code: String,
    pub kind: RedeemCodeKind,
    pub amount: i64,
    pub vip_plan_id: Option<Uuid>,
    pub vip_level: Option<i32>,
    pub max_uses: i32,
    pub used_count: i32,
    pub status: RedeemCodeStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, JsonSchema)]
pub struct RedeemCode {
    pub id: Uuid,
    pub code: String,
    pub reward: RedeemReward,
    pub max_uses: i32,
    pub used_count: i32,
    pub status: RedeemCodeStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<RedeemCodeRow> for RedeemCode {
    type Error = AppError;

    fn try_from(row: RedeemCodeRow) -> Result<Self, Self::Error> {
        Ok(Self {
            reward: RedeemReward::from_columns(row.kind, row.amount, row.vip_plan_id, row.vip_level)?,
            id: row.id,
            code: row.code,
            max_uses: row.max_uses,
            used_count: row.used_count,
            status: row.status,
            expires_at: row.expires_at,
            created_by: row.created_by,
            created_at: row.created_at,
        })
    }
}

impl RedeemCode {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    pub fn is_exhausted(&self) -> bool {
        self.used_count >= self.max_uses
    }

    /// Status a code should carry after `used_count` uses at `now`.
    /// Expiry wins over exhaustion.
    pub fn derive_status(&self, used_count: i32, now: DateTime<Utc>) -> RedeemCodeStatus {
        if self.is_expired_at(now) {
            RedeemCodeStatus::Expired
        } else if used_count >= self.max_uses {
            RedeemCodeStatus::UsedUp
        } else {
            RedeemCodeStatus::Active
        }
    }

    /// Admins may only toggle between `active` and `inactive`; the terminal
    /// states follow from usage and expiry.
    pub fn admin_transition(&self, target: RedeemCodeStatus, now: DateTime<Utc>) -> Result<RedeemCodeStatus, AppError> {
        match target {
            RedeemCodeStatus::Inactive => Ok(RedeemCodeStatus::Inactive),
            RedeemCodeStatus::Active if self.is_expired_at(now) => Err(AppError::BadRequest(format!("code {} has expired", self.code))),
            RedeemCodeStatus::Active if self.is_exhausted() => Err(AppError::BadRequest(format!("code {} is used up", self.code))),
            RedeemCodeStatus::Active => Ok(RedeemCodeStatus::Active),
            RedeemCodeStatus::Expired | RedeemCodeStatus::UsedUp => Err(AppError::BadRequest(format!("status {:?} cannot be set manually", target))),
        }
    }

    /// Frozen copy of the terms, stored with each history row.
    pub fn snapshot(&self) -> RedeemCodeSnapshot {
        RedeemCodeSnapshot {
            code: self.code.clone(),
            reward: self.reward.clone(),
            max_uses: self.max_uses,
            used_count: self.used_count,
            expires_at: self.expires_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RedeemCodeSnapshot {
    pub code: String,
    pub reward: RedeemReward,
    pub max_uses: i32,
    pub used_count: i32,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Insert payload for a new code, already normalized.
#[derive(Debug, Clone)]
pub struct NewRedeemCode {
    pub code: String,
    pub reward: RedeemReward,
    pub max_uses: i32,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_by: Option<Uuid>,
}

fn validate_reward(reward: &RedeemReward) -> Result<(), ValidationError> {
    reward.validate_terms()
}

fn validate_future(expires_at: &DateTime<Utc>) -> Result<(), ValidationError> {
    if *expires_at > Utc::now() {
        Ok(())
    } else {
        Err(ValidationError::new("expires_at_in_past"))
    }
}

#[derive(Debug, Deserialize, Validate, JsonSchema)]
pub struct CreateRedeemCodeRequest {
    #[schemars(regex(path = "CODE_PATTERN"))]
    #[validate(regex(path = *CODE_PATTERN))]
    pub code: String,
    #[validate(custom(function = "validate_reward"))]
    pub reward: RedeemReward,
    #[validate(range(min = 1, max = 1_000_000))]
    pub max_uses: i32,
    #[validate(custom(function = "validate_future"))]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize, Validate, JsonSchema)]
pub struct GenerateRedeemCodesRequest {
    #[validate(range(min = 1))]
    pub count: usize,
    #[validate(length(max = 16))]
    pub prefix: Option<String>,
    #[validate(custom(function = "validate_reward"))]
    pub reward: RedeemReward,
    #[validate(range(min = 1, max = 1_000_000))]
    pub max_uses: i32,
    #[validate(custom(function = "validate_future"))]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct UpdateRedeemCodeStatusRequest {
    pub status: RedeemCodeStatus,
}

#[derive(Debug, Serialize, JsonSchema)]
pub struct GeneratedCodesResponse {
    pub codes: Vec<RedeemCode>,
}
