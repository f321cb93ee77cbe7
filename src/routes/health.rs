use crate::middleware::rate_limit::PublicApiRateLimit;
use rocket::get;
use rocket::http::Status;
use rocket_okapi::openapi;

/// Liveness check
#[openapi(tag = "Health")]
#[get("/")]
pub async fn healthcheck(_rate_limit: PublicApiRateLimit) -> Status {
    Status::Ok
}

pub fn routes() -> (Vec<rocket::Route>, okapi::openapi3::OpenApi) {
    rocket_okapi::openapi_get_routes_spec![healthcheck]
}
