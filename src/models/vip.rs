use crate::error::app_error::AppError;
use chrono::{DateTime, Duration, Months, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Level granted by VIP time that does not name one.
pub const DEFAULT_VIP_LEVEL: i32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, sqlx::FromRow)]
pub struct VipPlan {
    pub id: Uuid,
    pub name: String,
    pub duration_months: i32,
    pub duration_days: i32,
    pub level: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema, sqlx::FromRow)]
pub struct VipStatus {
    pub is_vip: bool,
    pub vip_expire_date: Option<DateTime<Utc>>,
    pub vip_level: i32,
}

/// VIP time to add on redemption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VipExtension {
    pub months: u32,
    pub days: u32,
    pub level: Option<i32>,
}

impl VipExtension {
    /// Fails for plans with a negative duration or no duration at all.
    pub fn from_plan(plan: &VipPlan) -> Result<Self, AppError> {
        let invalid = || AppError::BadRequest(format!("VIP plan {} has an invalid duration", plan.name));

        let months = u32::try_from(plan.duration_months).map_err(|_| invalid())?;
        let days = u32::try_from(plan.duration_days).map_err(|_| invalid())?;
        if months == 0 && days == 0 {
            return Err(invalid());
        }

        Ok(Self {
            months,
            days,
            level: Some(plan.level),
        })
    }
}

impl VipStatus {
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.is_vip && self.vip_expire_date.is_some_and(|expires| expires > now)
    }

    /// Apply `extension`, stacking on top of any VIP time still running at `now`.
    ///
    /// Returns `None` only if the resulting date is out of range.
    pub fn extended(current: Option<&VipStatus>, extension: &VipExtension, now: DateTime<Utc>) -> Option<VipStatus> {
        let active = current.filter(|status| status.is_active_at(now));

        let base = active.and_then(|status| status.vip_expire_date).unwrap_or(now);
        let expires = base
            .checked_add_months(Months::new(extension.months))?
            .checked_add_signed(Duration::days(i64::from(extension.days)))?;

        let current_level = active.map_or(0, |status| status.vip_level);
        let vip_level = match extension.level {
            Some(level) => level.max(current_level),
            None => current_level.max(DEFAULT_VIP_LEVEL),
        };

        Some(VipStatus {
            is_vip: true,
            vip_expire_date: Some(expires),
            vip_level,
        })
    }
}
