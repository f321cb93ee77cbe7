use crate::models::redeem_code::{RedeemCodeSnapshot, RedeemReward};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, JsonSchema, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RedemptionStatus {
    Success,
    Failed,
}

/// Append-only audit row. At most one `Success` row exists per (code, user).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RedemptionHistoryEntry {
    pub id: Uuid,
    pub code_id: Uuid,
    pub user_id: Uuid,
    pub amount_granted: i64,
    pub status: RedemptionStatus,
    pub message: String,
    pub redeemed_at: DateTime<Utc>,
    pub snapshot: sqlx::types::Json<RedeemCodeSnapshot>,
}

#[derive(Debug, Clone)]
pub struct NewRedemptionHistory {
    pub code_id: Uuid,
    pub user_id: Uuid,
    pub amount_granted: i64,
    pub status: RedemptionStatus,
    pub message: String,
    pub snapshot: RedeemCodeSnapshot,
}

/// What the user ended up with after a successful redemption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RedemptionGrant {
    Credits { amount: i64, new_balance: i64 },
    Vip { vip_expire_date: DateTime<Utc>, vip_level: i32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, JsonSchema)]
pub struct RedemptionResult {
    pub history_id: Uuid,
    pub code: String,
    pub reward: RedeemReward,
    pub grant: RedemptionGrant,
    pub redeemed_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Validate, JsonSchema)]
pub struct RedeemRequest {
    #[validate(length(min = 1, max = 64))]
    pub code: String,
}

#[derive(Debug, Serialize, JsonSchema)]
pub struct RedemptionHistoryResponse {
    pub id: Uuid,
    pub code: String,
    pub reward: RedeemReward,
    pub amount_granted: i64,
    pub status: RedemptionStatus,
    pub message: String,
    pub redeemed_at: DateTime<Utc>,
}

impl From<&RedemptionHistoryEntry> for RedemptionHistoryResponse {
    fn from(entry: &RedemptionHistoryEntry) -> Self {
        Self {
            id: entry.id,
            code: entry.snapshot.code.clone(),
            reward: entry.snapshot.reward.clone(),
            amount_granted: entry.amount_granted,
            status: entry.status,
            message: entry.message.clone(),
            redeemed_at: entry.redeemed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_response_reads_frozen_terms() {
        let snapshot = RedeemCodeSnapshot {
            code: "SPRING-2026".to_string(),
            reward: RedeemReward::Credits { amount: 50 },
            max_uses: 10,
            used_count: 3,
            expires_at: None,
        };
        let entry = RedemptionHistoryEntry {
            id: Uuid::new_v4(),
            code_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            amount_granted: 50,
            status: RedemptionStatus::Success,
            message: "Redeemed 50 credits".to_string(),
            redeemed_at: Utc::now(),
            snapshot: sqlx::types::Json(snapshot),
        };

        let response = RedemptionHistoryResponse::from(&entry);
        assert_eq!(response.code, "SPRING-2026");
        assert_eq!(response.reward, RedeemReward::Credits { amount: 50 });
        assert_eq!(response.status, RedemptionStatus::Success);
    }

    #[test]
    fn grant_serializes_with_type_tag() {
        let grant = RedemptionGrant::Credits { amount: 10, new_balance: 110 };
        let json = serde_json::to_value(&grant).unwrap();
        assert_eq!(json["type"], "credits");
        assert_eq!(json["new_balance"], 110);
    }
}
