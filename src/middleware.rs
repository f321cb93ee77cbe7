pub mod rate_limit;

use rocket::fairing::{Fairing, Info, Kind};
use rocket::http::{Header, Status};
use rocket::request::{FromRequest, Outcome, Request};
use rocket::{Data, Response};
use rocket_okapi::r#gen::OpenApiGenerator;
use rocket_okapi::request::{OpenApiFromRequest, RequestHeaderInput};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Request ID that is attached to every request for tracking
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn new() -> Self {
        RequestId(Uuid::new_v4().to_string())
    }

    /// The id assigned by [`RequestLogger`], or `"unknown"` outside of it.
    pub fn of(request: &Request<'_>) -> String {
        request
            .local_cache(|| None::<RequestId>)
            .as_ref()
            .map(|r| r.0.clone())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for RequestId {
    type Error = ();

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        if let Some(request_id) = request.local_cache(|| None::<RequestId>).as_ref() {
            return Outcome::Success(request_id.clone());
        }

        Outcome::Success(RequestId::new())
    }
}

/// Rate limit and lockout responses are expected traffic, not failures.
fn is_abuse_signal(status: Status) -> bool {
    status == Status::TooManyRequests || status.code == 423
}

/// Fairing that adds request ID to all requests and logs request/response information
pub struct RequestLogger;

#[rocket::async_trait]
impl Fairing for RequestLogger {
    fn info(&self) -> Info {
        Info {
            name: "Request Logger",
            kind: Kind::Request | Kind::Response,
        }
    }

    async fn on_request(&self, request: &mut Request<'_>, _: &mut Data<'_>) {
        let request_id = RequestId::new();

        request.local_cache(|| Some(request_id.clone()));

        info!(
            request_id = %request_id.0,
            method = %request.method(),
            uri = %request.uri(),
            "incoming request"
        );
    }

    async fn on_response<'r>(&self, request: &'r Request<'_>, response: &mut Response<'r>) {
        let request_id = RequestId::of(request);
        let status = response.status();
        let method = request.method();
        let uri = request.uri();

        response.set_header(Header::new("X-Request-Id", request_id.clone()));
        response.set_header(Header::new("X-Content-Type-Options", "nosniff"));
        response.set_header(Header::new("X-Frame-Options", "DENY"));
        response.set_header(Header::new("Cache-Control", "no-store"));

        if status.class().is_server_error() {
            error!(request_id = %request_id, method = %method, uri = %uri, status = %status.code, "request failed");
        } else if is_abuse_signal(status) {
            info!(request_id = %request_id, method = %method, uri = %uri, status = %status.code, "request throttled");
        } else if status.class().is_client_error() {
            warn!(request_id = %request_id, method = %method, uri = %uri, status = %status.code, "request rejected");
        } else {
            info!(request_id = %request_id, method = %method, uri = %uri, status = %status.code, "request completed");
        }
    }
}

/// `User-Agent` header, for audit rows.
pub struct UserAgent(pub Option<String>);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for UserAgent {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, ()> {
        let ua = req.headers().get_one("User-Agent").map(|s| s.to_string());
        Outcome::Success(UserAgent(ua))
    }
}

impl<'a> OpenApiFromRequest<'a> for UserAgent {
    fn from_request_input(_gen: &mut OpenApiGenerator, _name: String, _required: bool) -> rocket_okapi::Result<RequestHeaderInput> {
        Ok(RequestHeaderInput::None)
    }
}

/// Client address as Rocket resolves it (honours the configured IP header).
pub struct ClientIp(pub Option<String>);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for ClientIp {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, ()> {
        let ip = req.client_ip().map(|ip| ip.to_string());
        Outcome::Success(ClientIp(ip))
    }
}

impl<'a> OpenApiFromRequest<'a> for ClientIp {
    fn from_request_input(_gen: &mut OpenApiGenerator, _name: String, _required: bool) -> rocket_okapi::Result<RequestHeaderInput> {
        Ok(RequestHeaderInput::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_unique_uuids() {
        let first = RequestId::new();
        let second = RequestId::default();
        assert!(Uuid::parse_str(&first.0).is_ok());
        assert_ne!(first.0, second.0);
    }

    #[test]
    fn throttling_statuses_are_abuse_signals() {
        assert!(is_abuse_signal(Status::TooManyRequests));
        assert!(is_abuse_signal(Status::new(423)));
        assert!(!is_abuse_signal(Status::Unauthorized));
        assert!(!is_abuse_signal(Status::InternalServerError));
    }
}
