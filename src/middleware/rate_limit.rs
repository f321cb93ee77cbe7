use std::marker::PhantomData;
use std::sync::Arc;

use crate::auth::parse_user_cookie_value;
use crate::middleware::RequestId;
use crate::models::rate_limit::RateLimitPolicy;
use crate::service::rate_limiter::RateLimiter;
use rocket::http::Status;
use rocket::request::{FromRequest, Outcome, Request};
use rocket_okapi::r#gen::OpenApiGenerator;
use rocket_okapi::okapi::openapi3::{RefOr, Response as OpenApiResponse, Responses};
use rocket_okapi::request::{OpenApiFromRequest, RequestHeaderInput};
use tracing::{info, warn};

/// Binds a request guard to one policy and decides what identifies the caller.
pub trait PolicyGuard: Send + Sync + 'static {
    const POLICY: RateLimitPolicy;

    fn identifier(request: &Request<'_>) -> Option<String> {
        client_ip(request)
    }
}

pub struct LoginPolicy;
pub struct SignupPolicy;
pub struct PasswordChangePolicy;
pub struct RedeemPolicy;
pub struct PublicApiPolicy;

impl PolicyGuard for LoginPolicy {
    const POLICY: RateLimitPolicy = RateLimitPolicy::Login;
}

impl PolicyGuard for SignupPolicy {
    const POLICY: RateLimitPolicy = RateLimitPolicy::Signup;
}

impl PolicyGuard for PasswordChangePolicy {
    const POLICY: RateLimitPolicy = RateLimitPolicy::PasswordChange;

    fn identifier(request: &Request<'_>) -> Option<String> {
        user_id(request).or_else(|| client_ip(request))
    }
}

impl PolicyGuard for RedeemPolicy {
    const POLICY: RateLimitPolicy = RateLimitPolicy::Redeem;

    fn identifier(request: &Request<'_>) -> Option<String> {
        user_id(request).or_else(|| client_ip(request))
    }
}

impl PolicyGuard for PublicApiPolicy {
    const POLICY: RateLimitPolicy = RateLimitPolicy::PublicApi;
}

/// Request guard that counts the request against `P`'s window and fails with
/// `429` once the window is spent.
pub struct RateLimited<P: PolicyGuard>(PhantomData<P>);

pub type LoginRateLimit = RateLimited<LoginPolicy>;
pub type SignupRateLimit = RateLimited<SignupPolicy>;
pub type PasswordChangeRateLimit = RateLimited<PasswordChangePolicy>;
pub type RedeemRateLimit = RateLimited<RedeemPolicy>;
pub type PublicApiRateLimit = RateLimited<PublicApiPolicy>;

/// Seconds until the caller may retry, read by the `429` catcher.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RateLimitRetryAfter(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitError {
    TooManyRequests,
    MissingClientIp,
}

impl RateLimitError {
    fn status(self) -> Status {
        match self {
            RateLimitError::TooManyRequests => Status::TooManyRequests,
            RateLimitError::MissingClientIp => Status::BadRequest,
        }
    }
}

#[rocket::async_trait]
impl<'r, P: PolicyGuard> FromRequest<'r> for RateLimited<P> {
    type Error = RateLimitError;

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let limiter = match request.rocket().state::<Arc<RateLimiter>>() {
            Some(limiter) => limiter,
            None => return Outcome::Success(RateLimited(PhantomData)),
        };

        let identifier = match P::identifier(request) {
            Some(identifier) => identifier,
            None if limiter.require_client_ip() => {
                warn!(request_id = %RequestId::of(request), policy = %P::POLICY, "client ip unavailable for rate limiting");
                return Outcome::Error((RateLimitError::MissingClientIp.status(), RateLimitError::MissingClientIp));
            }
            None => "missing-ip".to_string(),
        };

        let decision = limiter.check(&P::POLICY.key(identifier)).await;
        if decision.allowed {
            return Outcome::Success(RateLimited(PhantomData));
        }

        let retry_after = decision.retry_after_seconds.unwrap_or(1);
        request.local_cache(|| Some(RateLimitRetryAfter(retry_after)));
        info!(
            request_id = %RequestId::of(request),
            policy = %P::POLICY,
            method = %request.method(),
            uri = %request.uri(),
            retry_after_secs = retry_after,
            "rate limit exceeded"
        );

        Outcome::Error((RateLimitError::TooManyRequests.status(), RateLimitError::TooManyRequests))
    }
}

impl<'a, P: PolicyGuard> OpenApiFromRequest<'a> for RateLimited<P> {
    fn from_request_input(_gen: &mut OpenApiGenerator, _name: String, _required: bool) -> rocket_okapi::Result<RequestHeaderInput> {
        Ok(RequestHeaderInput::None)
    }

    fn get_responses(_gen: &mut OpenApiGenerator) -> rocket_okapi::Result<Responses> {
        let mut responses = Responses::default();
        responses.responses.insert(
            "429".to_string(),
            RefOr::Object(OpenApiResponse {
                description: "Too Many Requests".to_string(),
                ..Default::default()
            }),
        );
        Ok(responses)
    }
}

fn client_ip(request: &Request<'_>) -> Option<String> {
    request.client_ip().map(|addr| addr.to_string())
}

fn user_id(request: &Request<'_>) -> Option<String> {
    let cookie = request.cookies().get_private("user")?;
    let (id, _) = parse_user_cookie_value(cookie.value())?;
    Some(id.to_string())
}
