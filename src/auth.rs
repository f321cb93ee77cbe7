use crate::database::postgres_repository::PostgresRepository;
use crate::error::app_error::AppError;
use rocket::http::Status;
use rocket::outcome::Outcome;
use rocket::request::{FromRequest, Outcome as RequestOutcome, Request};
use rocket_okapi::r#gen::OpenApiGenerator;
use rocket_okapi::okapi::openapi3::{Object, RefOr, Response, Responses, SecurityRequirement, SecurityScheme, SecuritySchemeData};
use rocket_okapi::request::{OpenApiFromRequest, RequestHeaderInput};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

pub(crate) const USER_COOKIE: &str = "user";

#[derive(Debug, Clone, Serialize)]
pub struct CurrentUser {
    pub id: Uuid,
    pub email: String,
}

/// Caller with `users.is_admin` set.
#[derive(Debug, Clone)]
pub struct AdminUser(pub CurrentUser);

pub(crate) fn user_cookie_value(id: &Uuid, email: &str) -> String {
    format!("{}:{}", id, email)
}

/// Parse the private `user` cookie, `"<uuid>:<email>"`.
pub(crate) fn parse_user_cookie_value(value: &str) -> Option<(Uuid, String)> {
    let (id, email) = value.split_once(':')?;
    let id = Uuid::parse_str(id).ok()?;
    if email.is_empty() {
        return None;
    }
    Some((id, email.to_string()))
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for CurrentUser {
    type Error = AppError;

    async fn from_request(req: &'r Request<'_>) -> RequestOutcome<Self, Self::Error> {
        let cookies = req.cookies();
        if let Some(cookie) = cookies.get_private(USER_COOKIE)
            && let Some((id, email)) = parse_user_cookie_value(cookie.value())
        {
            let current_user = CurrentUser { id, email };
            req.local_cache(|| Some(current_user.clone()));
            return Outcome::Success(current_user);
        }

        Outcome::Error((Status::Unauthorized, AppError::Unauthorized))
    }
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for AdminUser {
    type Error = AppError;

    async fn from_request(req: &'r Request<'_>) -> RequestOutcome<Self, Self::Error> {
        let current_user = match CurrentUser::from_request(req).await {
            Outcome::Success(user) => user,
            Outcome::Error(e) => return Outcome::Error(e),
            Outcome::Forward(status) => return Outcome::Forward(status),
        };

        let pool = match req.rocket().state::<PgPool>() {
            Some(pool) => pool,
            None => return Outcome::Error((Status::InternalServerError, AppError::Forbidden)),
        };

        let repo = PostgresRepository::new(pool.clone());
        match repo.is_admin(&current_user.id).await {
            Ok(true) => Outcome::Success(AdminUser(current_user)),
            Ok(false) => Outcome::Error((Status::Forbidden, AppError::Forbidden)),
            Err(err) => Outcome::Error((Status::InternalServerError, err)),
        }
    }
}

fn cookie_security() -> (SecurityScheme, SecurityRequirement) {
    let security_scheme = SecurityScheme {
        description: Some("Cookie-based authentication. Log in via POST /users/login to obtain the session cookie.".to_string()),
        data: SecuritySchemeData::ApiKey {
            name: USER_COOKIE.to_string(),
            location: "cookie".to_string(),
        },
        extensions: Object::default(),
    };

    let mut security_req = SecurityRequirement::new();
    security_req.insert("cookieAuth".to_string(), Vec::new());

    (security_scheme, security_req)
}

fn auth_responses(codes: &[(&str, &str)]) -> Responses {
    let mut responses = Responses::default();
    for (code, description) in codes {
        responses.responses.insert(
            code.to_string(),
            RefOr::Object(Response {
                description: description.to_string(),
                ..Default::default()
            }),
        );
    }
    responses
}

impl<'a> OpenApiFromRequest<'a> for CurrentUser {
    fn from_request_input(_gen: &mut OpenApiGenerator, _name: String, _required: bool) -> rocket_okapi::Result<RequestHeaderInput> {
        let (scheme, requirement) = cookie_security();
        Ok(RequestHeaderInput::Security("cookieAuth".to_string(), scheme, requirement))
    }

    fn get_responses(_gen: &mut OpenApiGenerator) -> rocket_okapi::Result<Responses> {
        Ok(auth_responses(&[("401", "Unauthorized - Authentication required")]))
    }
}

impl<'a> OpenApiFromRequest<'a> for AdminUser {
    fn from_request_input(_gen: &mut OpenApiGenerator, _name: String, _required: bool) -> rocket_okapi::Result<RequestHeaderInput> {
        let (scheme, requirement) = cookie_security();
        Ok(RequestHeaderInput::Security("cookieAuth".to_string(), scheme, requirement))
    }

    fn get_responses(_gen: &mut OpenApiGenerator) -> rocket_okapi::Result<Responses> {
        Ok(auth_responses(&[
            ("401", "Unauthorized - Authentication required"),
            ("403", "Forbidden - Administrator access required"),
        ]))
    }
}
