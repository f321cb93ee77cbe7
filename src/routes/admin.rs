use crate::auth::AdminUser;
use crate::config::Config;
use crate::database::audit::SecurityAuditEvent;
use crate::database::postgres_repository::PostgresRepository;
use crate::error::app_error::AppError;
use crate::middleware::ClientIp;
use crate::models::account_security::{LockStatus, UnlockRequest, UnlockResponse};
use crate::models::audit::audit_events;
use crate::models::pagination::{PaginatedResponse, PaginationParams};
use crate::models::redeem_code::{
    CreateRedeemCodeRequest, GenerateRedeemCodesRequest, GeneratedCodesResponse, NewRedeemCode, RedeemCode, RedeemCodeStatus, RedeemReward,
    UpdateRedeemCodeStatusRequest, normalize_code,
};
use crate::models::user::normalize_email;
use crate::models::vip::VipPlan;
use crate::service::account_lock::AccountLockManager;
use crate::service::code_generator::{generate_codes, is_valid_code};
use chrono::Utc;
use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{State, get, post, put};
use rocket_okapi::openapi;
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use validator::Validate;

async fn ensure_reward_target(repo: &PostgresRepository, reward: &RedeemReward) -> Result<(), AppError> {
    if let RedeemReward::VipPlan { plan_id } = reward
        && repo.get_vip_plan(plan_id).await?.is_none()
    {
        return Err(AppError::BadRequest(format!("VIP plan {} does not exist", plan_id)));
    }
    Ok(())
}

/// Create a single redeem code with a chosen value
#[openapi(tag = "Admin")]
#[post("/codes", data = "<payload>")]
pub async fn create_code(
    pool: &State<PgPool>,
    admin: AdminUser,
    client_ip: ClientIp,
    payload: Json<CreateRedeemCodeRequest>,
) -> Result<(Status, Json<RedeemCode>), AppError> {
    payload.validate()?;

    let repo = PostgresRepository::new(pool.inner().clone());
    ensure_reward_target(&repo, &payload.reward).await?;

    let new_code = NewRedeemCode {
        code: normalize_code(&payload.code),
        reward: payload.reward.clone(),
        max_uses: payload.max_uses,
        expires_at: payload.expires_at,
        created_by: Some(admin.0.id),
    };

    let mut created = repo.create_redeem_codes(std::slice::from_ref(&new_code)).await.map_err(|e| match e {
        AppError::Conflict(_) => AppError::Conflict(format!("Code {} already exists", new_code.code)),
        other => other,
    })?;
    let code = created.pop().ok_or_else(|| AppError::NotFound("Created code not returned".to_string()))?;

    let _ = repo
        .create_security_audit_log(
            SecurityAuditEvent::new(audit_events::REDEEM_CODES_CREATED, true)
                .user(&admin.0.id)
                .ip(client_ip.0)
                .metadata(json!({ "count": 1, "codes": [code.code], "reward": code.reward })),
        )
        .await;

    Ok((Status::Created, Json(code)))
}

/// Generate a batch of random codes sharing the same terms
#[openapi(tag = "Admin")]
#[post("/codes/generate", data = "<payload>")]
pub async fn generate_code_batch(
    pool: &State<PgPool>,
    config: &State<Config>,
    admin: AdminUser,
    client_ip: ClientIp,
    payload: Json<GenerateRedeemCodesRequest>,
) -> Result<(Status, Json<GeneratedCodesResponse>), AppError> {
    payload.validate()?;

    let settings = &config.redemption;
    if payload.count > settings.max_batch_size {
        return Err(AppError::BadRequest(format!("At most {} codes can be generated at once", settings.max_batch_size)));
    }

    let repo = PostgresRepository::new(pool.inner().clone());
    ensure_reward_target(&repo, &payload.reward).await?;

    let new_codes: Vec<NewRedeemCode> = generate_codes(payload.prefix.as_deref(), settings.code_length, payload.count)
        .into_iter()
        .map(|code| NewRedeemCode {
            code,
            reward: payload.reward.clone(),
            max_uses: payload.max_uses,
            expires_at: payload.expires_at,
            created_by: Some(admin.0.id),
        })
        .collect();

    if let Some(bad) = new_codes.iter().find(|code| !is_valid_code(&code.code)) {
        return Err(AppError::BadRequest(format!("Prefix produces invalid code {}", bad.code)));
    }

    let codes = repo.create_redeem_codes(&new_codes).await?;

    let _ = repo
        .create_security_audit_log(
            SecurityAuditEvent::new(audit_events::REDEEM_CODES_CREATED, true)
                .user(&admin.0.id)
                .ip(client_ip.0)
                .metadata(json!({ "count": codes.len(), "prefix": payload.prefix, "reward": payload.reward })),
        )
        .await;

    Ok((Status::Created, Json(GeneratedCodesResponse { codes })))
}

/// List redeem codes, optionally filtered by status
#[openapi(tag = "Admin")]
#[get("/codes?<status>&<page>&<limit>")]
pub async fn list_codes(
    pool: &State<PgPool>,
    _admin: AdminUser,
    status: Option<RedeemCodeStatus>,
    page: Option<i64>,
    limit: Option<i64>,
) -> Result<Json<PaginatedResponse<RedeemCode>>, AppError> {
    let repo = PostgresRepository::new(pool.inner().clone());
    let params = PaginationParams::new(page, limit);

    let (codes, total) = repo.list_redeem_codes(status, &params).await?;
    Ok(Json(PaginatedResponse::new(codes, &params, total)))
}

#[openapi(tag = "Admin")]
#[get("/codes/<code>")]
pub async fn get_code(pool: &State<PgPool>, _admin: AdminUser, code: &str) -> Result<Json<RedeemCode>, AppError> {
    let repo = PostgresRepository::new(pool.inner().clone());
    let normalized = normalize_code(code);

    repo.get_redeem_code(&normalized)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Redeem code {} not found", normalized)))
}

/// Activate or deactivate a code
///
/// Only `active` and `inactive` can be requested. Expired or used-up codes
/// cannot be reactivated.
#[openapi(tag = "Admin")]
#[put("/codes/<code>/status", data = "<payload>")]
pub async fn put_code_status(
    pool: &State<PgPool>,
    admin: AdminUser,
    client_ip: ClientIp,
    code: &str,
    payload: Json<UpdateRedeemCodeStatusRequest>,
) -> Result<Json<RedeemCode>, AppError> {
    let repo = PostgresRepository::new(pool.inner().clone());
    let updated = repo.update_redeem_code_status(&normalize_code(code), payload.status, Utc::now()).await?;

    let _ = repo
        .create_security_audit_log(
            SecurityAuditEvent::new(audit_events::REDEEM_CODE_STATUS_CHANGED, true)
                .user(&admin.0.id)
                .ip(client_ip.0)
                .metadata(json!({ "code": updated.code, "status": updated.status })),
        )
        .await;

    Ok(Json(updated))
}

/// Current lock state of an account
#[openapi(tag = "Admin")]
#[get("/locks?<email>")]
pub async fn get_lock_status(lock_manager: &State<Arc<AccountLockManager>>, _admin: AdminUser, email: &str) -> Json<LockStatus> {
    Json(lock_manager.check_lock(&normalize_email(email)).await)
}

/// Clear the lock and failure counter of an account
#[openapi(tag = "Admin")]
#[post("/unlock", data = "<payload>")]
pub async fn post_unlock(
    lock_manager: &State<Arc<AccountLockManager>>,
    _admin: AdminUser,
    payload: Json<UnlockRequest>,
) -> Result<Json<UnlockResponse>, AppError> {
    payload.validate()?;

    let email = normalize_email(&payload.email);
    lock_manager.unlock(&email, payload.reason.trim()).await?;

    Ok(Json(UnlockResponse {
        message: format!("Account {} unlocked", email),
    }))
}

#[openapi(tag = "Admin")]
#[get("/vip-plans")]
pub async fn list_vip_plans(pool: &State<PgPool>, _admin: AdminUser) -> Result<Json<Vec<VipPlan>>, AppError> {
    let repo = PostgresRepository::new(pool.inner().clone());
    Ok(Json(repo.list_vip_plans().await?))
}

pub fn routes() -> (Vec<rocket::Route>, okapi::openapi3::OpenApi) {
    rocket_okapi::openapi_get_routes_spec![
        create_code,
        generate_code_batch,
        list_codes,
        get_code,
        put_code_status,
        get_lock_status,
        post_unlock,
        list_vip_plans
    ]
}
