use crate::auth::{CurrentUser, USER_COOKIE, user_cookie_value};
use crate::database::audit::SecurityAuditEvent;
use crate::database::postgres_repository::PostgresRepository;
use crate::error::app_error::AppError;
use crate::middleware::rate_limit::{LoginRateLimit, PasswordChangeRateLimit, SignupRateLimit};
use crate::middleware::{ClientIp, UserAgent};
use crate::models::audit::audit_events;
use crate::models::user::{ChangePasswordRequest, LoginRequest, UserProfileResponse, UserRequest, UserResponse, normalize_email};
use crate::service::account_lock::AccountLockManager;
use rocket::http::{Cookie, CookieJar, Status};
use rocket::serde::json::Json;
use rocket::{State, get, post, put};
use rocket_okapi::openapi;
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use validator::Validate;

/// Create a new user
#[openapi(tag = "Users")]
#[post("/", data = "<payload>")]
pub async fn post_user(pool: &State<PgPool>, _rate_limit: SignupRateLimit, payload: Json<UserRequest>) -> Result<(Status, Json<UserResponse>), AppError> {
    payload.validate()?;

    let repo = PostgresRepository::new(pool.inner().clone());
    let email = normalize_email(&payload.email);

    let user = repo.create_user(payload.name.trim(), &email, &payload.password).await?;
    Ok((Status::Created, Json(UserResponse::from(&user))))
}

/// Log in with email and password
///
/// Locked accounts answer `423 Locked` with a `Retry-After` header. Every
/// wrong password counts towards the progressive lockout.
#[openapi(tag = "Users")]
#[post("/login", data = "<payload>")]
pub async fn post_user_login(
    pool: &State<PgPool>,
    lock_manager: &State<Arc<AccountLockManager>>,
    cookies: &CookieJar<'_>,
    client_ip: ClientIp,
    user_agent: UserAgent,
    _rate_limit: LoginRateLimit,
    payload: Json<LoginRequest>,
) -> Result<Json<UserResponse>, AppError> {
    payload.validate()?;

    let repo = PostgresRepository::new(pool.inner().clone());
    let email = normalize_email(&payload.email);

    let lock = lock_manager.check_lock(&email).await;
    if lock.is_locked
        && let Some(until) = lock.lock_expires_at
    {
        PostgresRepository::dummy_verify(&payload.password);
        let _ = repo
            .create_security_audit_log(
                SecurityAuditEvent::new(audit_events::LOGIN_FAILED, false)
                    .identity(&email)
                    .ip(client_ip.0)
                    .user_agent(user_agent.0)
                    .metadata(json!({ "reason": "account_locked" })),
            )
            .await;
        return Err(AppError::account_locked(until));
    }

    let Some(user) = repo.get_user_by_email(&email).await? else {
        PostgresRepository::dummy_verify(&payload.password);
        let _ = repo
            .create_security_audit_log(
                SecurityAuditEvent::new(audit_events::LOGIN_FAILED, false)
                    .identity(&email)
                    .ip(client_ip.0)
                    .user_agent(user_agent.0)
                    .metadata(json!({ "reason": "unknown_email" })),
            )
            .await;
        return Err(AppError::InvalidCredentials);
    };

    match repo.verify_password(&user, &payload.password) {
        Ok(()) => {
            lock_manager.record_success(&email).await;
            cookies.add_private(Cookie::build((USER_COOKIE, user_cookie_value(&user.id, &user.email))).path("/").build());

            let _ = repo
                .create_security_audit_log(
                    SecurityAuditEvent::new(audit_events::LOGIN_SUCCESS, true)
                        .user(&user.id)
                        .identity(&email)
                        .ip(client_ip.0)
                        .user_agent(user_agent.0),
                )
                .await;

            Ok(Json(UserResponse::from(&user)))
        }
        Err(AppError::InvalidCredentials) => {
            let result = lock_manager.record_failure(&email).await;

            let _ = repo
                .create_security_audit_log(
                    SecurityAuditEvent::new(audit_events::LOGIN_FAILED, false)
                        .user(&user.id)
                        .identity(&email)
                        .ip(client_ip.0)
                        .user_agent(user_agent.0)
                        .metadata(json!({
                            "reason": "invalid_password",
                            "failed_attempts": result.failed_attempts,
                            "remaining_attempts": result.remaining_attempts,
                        })),
                )
                .await;

            match (result.is_locked, result.lock_expires_at) {
                (true, Some(until)) => Err(AppError::account_locked(until)),
                _ => Err(AppError::InvalidCredentials),
            }
        }
        Err(e) => Err(e),
    }
}

/// Log out and clear the session cookie
#[openapi(tag = "Users")]
#[post("/logout")]
pub async fn post_user_logout(pool: &State<PgPool>, current_user: CurrentUser, cookies: &CookieJar<'_>) -> Status {
    cookies.remove_private(Cookie::build(USER_COOKIE).path("/").build());

    let repo = PostgresRepository::new(pool.inner().clone());
    let _ = repo
        .create_security_audit_log(SecurityAuditEvent::new(audit_events::LOGOUT, true).user(&current_user.id))
        .await;

    Status::Ok
}

/// Profile of the logged-in user, with credit balance and VIP status
#[openapi(tag = "Users")]
#[get("/me")]
pub async fn get_me(pool: &State<PgPool>, current_user: CurrentUser) -> Result<Json<UserProfileResponse>, AppError> {
    let repo = PostgresRepository::new(pool.inner().clone());
    let profile = repo.get_user_profile(&current_user.id).await?;
    Ok(Json(profile))
}

/// Change the password of the logged-in user
///
/// A wrong current password counts as a failed login for lockout purposes.
#[openapi(tag = "Users")]
#[put("/password", data = "<payload>")]
pub async fn put_password(
    pool: &State<PgPool>,
    lock_manager: &State<Arc<AccountLockManager>>,
    current_user: CurrentUser,
    client_ip: ClientIp,
    _rate_limit: PasswordChangeRateLimit,
    payload: Json<ChangePasswordRequest>,
) -> Result<Status, AppError> {
    payload.validate()?;

    let repo = PostgresRepository::new(pool.inner().clone());

    let lock = lock_manager.check_lock(&current_user.email).await;
    if lock.is_locked
        && let Some(until) = lock.lock_expires_at
    {
        return Err(AppError::account_locked(until));
    }

    match repo.change_password(&current_user.id, &payload.current_password, &payload.new_password).await {
        Ok(()) => {
            let _ = repo
                .create_security_audit_log(
                    SecurityAuditEvent::new(audit_events::PASSWORD_CHANGED, true)
                        .user(&current_user.id)
                        .ip(client_ip.0),
                )
                .await;
            Ok(Status::NoContent)
        }
        Err(AppError::BadRequest(message)) => {
            let result = lock_manager.record_failure(&current_user.email).await;
            match (result.is_locked, result.lock_expires_at) {
                (true, Some(until)) => Err(AppError::account_locked(until)),
                _ => Err(AppError::BadRequest(message)),
            }
        }
        Err(e) => Err(e),
    }
}

pub fn routes() -> (Vec<rocket::Route>, okapi::openapi3::OpenApi) {
    rocket_okapi::openapi_get_routes_spec![post_user, post_user_login, post_user_logout, get_me, put_password]
}
