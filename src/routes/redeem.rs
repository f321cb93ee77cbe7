use crate::auth::CurrentUser;
use crate::database::audit::SecurityAuditEvent;
use crate::database::postgres_repository::PostgresRepository;
use crate::error::app_error::AppError;
use crate::middleware::ClientIp;
use crate::middleware::rate_limit::RedeemRateLimit;
use crate::models::audit::audit_events;
use crate::models::pagination::{PaginatedResponse, PaginationParams};
use crate::models::redemption::{RedeemRequest, RedemptionHistoryResponse, RedemptionResult};
use crate::service::redemption::RedemptionEngine;
use rocket::serde::json::Json;
use rocket::{State, get, post};
use rocket_okapi::openapi;
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use validator::Validate;

/// Redeem a code for the logged-in user
///
/// Each user can redeem a given code once. Rejections answer `400`, or
/// `404` for codes that do not exist.
#[openapi(tag = "Redeem")]
#[post("/", data = "<payload>")]
pub async fn post_redeem(
    pool: &State<PgPool>,
    engine: &State<Arc<RedemptionEngine>>,
    current_user: CurrentUser,
    client_ip: ClientIp,
    _rate_limit: RedeemRateLimit,
    payload: Json<RedeemRequest>,
) -> Result<Json<RedemptionResult>, AppError> {
    payload.validate()?;

    let repo = PostgresRepository::new(pool.inner().clone());
    let outcome = engine.redeem(&payload.code, &current_user.id).await;

    let event = match &outcome {
        Ok(result) => SecurityAuditEvent::new(audit_events::REDEEM_SUCCESS, true).metadata(json!({
            "code": result.code,
            "history_id": result.history_id,
            "reward": result.reward,
        })),
        Err(err) => SecurityAuditEvent::new(audit_events::REDEEM_FAILED, false).metadata(json!({
            "code": payload.code.trim(),
            "reason": err.reason(),
        })),
    };
    let _ = repo
        .create_security_audit_log(event.user(&current_user.id).ip(client_ip.0))
        .await;

    Ok(Json(outcome?))
}

/// Redemption history of the logged-in user, newest first
#[openapi(tag = "Redeem")]
#[get("/history?<page>&<limit>")]
pub async fn get_history(
    pool: &State<PgPool>,
    current_user: CurrentUser,
    page: Option<i64>,
    limit: Option<i64>,
) -> Result<Json<PaginatedResponse<RedemptionHistoryResponse>>, AppError> {
    let repo = PostgresRepository::new(pool.inner().clone());
    let params = PaginationParams::new(page, limit);

    let (entries, total) = repo.list_redemption_history(&current_user.id, &params).await?;
    let responses: Vec<RedemptionHistoryResponse> = entries.iter().map(RedemptionHistoryResponse::from).collect();

    Ok(Json(PaginatedResponse::new(responses, &params, total)))
}

pub fn routes() -> (Vec<rocket::Route>, okapi::openapi3::OpenApi) {
    rocket_okapi::openapi_get_routes_spec![post_redeem, get_history]
}
