use crate::config::Config;
use crate::cron_tasks::{SweepResult, sweep};
use crate::database::postgres_repository::PostgresRepository;
use crate::error::app_error::AppError;
use chrono::Utc;
use rocket::http::Status;
use rocket::outcome::Outcome;
use rocket::request::{FromRequest, Outcome as RequestOutcome, Request};
use rocket::serde::json::Json;
use rocket::{State, post, routes};
use sqlx::PgPool;

pub(crate) const CRON_TOKEN_HEADER: &str = "x-cron-token";

pub(crate) struct CronAuth;

#[rocket::async_trait]
impl<'r> FromRequest<'r> for CronAuth {
    type Error = AppError;

    async fn from_request(req: &'r Request<'_>) -> RequestOutcome<Self, Self::Error> {
        let config = match req.rocket().state::<Config>() {
            Some(config) => config,
            None => return Outcome::Error((Status::InternalServerError, AppError::Unauthorized)),
        };

        if config.cron.auth_token.is_empty() {
            return Outcome::Error((Status::BadRequest, AppError::BadRequest("Cron auth token is not configured".to_string())));
        }

        match req.headers().get_one(CRON_TOKEN_HEADER) {
            Some(token) if token == config.cron.auth_token => Outcome::Success(CronAuth),
            _ => Outcome::Error((Status::Forbidden, AppError::Forbidden)),
        }
    }
}

#[post("/sweep")]
pub async fn post_sweep(pool: &State<PgPool>, _cron_auth: CronAuth) -> Result<Json<SweepResult>, AppError> {
    let repo = PostgresRepository::new(pool.inner().clone());
    let result = sweep(&repo, Utc::now()).await?;
    Ok(Json(result))
}

pub fn routes() -> Vec<rocket::Route> {
    routes![post_sweep]
}
