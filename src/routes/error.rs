use crate::middleware::rate_limit::RateLimitRetryAfter;
use rocket::http::Header;
use rocket::serde::Serialize;
use rocket::serde::json::Json;
use rocket::{Request, Responder, catch};

#[derive(Serialize)]
#[serde(crate = "rocket::serde")]
pub struct Error {
    pub message: String,
}

impl Error {
    fn new(message: impl Into<String>) -> Json<Self> {
        Json(Error { message: message.into() })
    }
}

#[derive(Responder)]
#[response(status = 429)]
pub struct TooManyRequests {
    body: Json<Error>,
    retry_after: Header<'static>,
}

#[catch(401)]
pub fn unauthorized(_: &Request) -> Json<Error> {
    Error::new("Unauthorized")
}

#[catch(403)]
pub fn forbidden(_: &Request) -> Json<Error> {
    Error::new("Forbidden")
}

#[catch(404)]
pub fn not_found(_: &Request) -> Json<Error> {
    Error::new("Not found")
}

#[catch(409)]
pub fn conflict(_: &Request) -> Json<Error> {
    Error::new("Conflict")
}

#[catch(429)]
pub fn too_many_requests(req: &Request) -> TooManyRequests {
    let retry_after = req.local_cache(|| None::<RateLimitRetryAfter>).map_or(1, |r| r.0);

    TooManyRequests {
        body: Error::new(format!("Too many requests. Try again in {} seconds.", retry_after)),
        retry_after: Header::new("Retry-After", retry_after.to_string()),
    }
}
