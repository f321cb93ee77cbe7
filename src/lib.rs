mod auth;
mod config;
mod cron_tasks;
mod database;
mod db;
mod error;
mod middleware;
mod models;
mod routes;
mod service;

#[cfg(test)]
pub mod test_utils;

pub use config::Config;
pub use cron_tasks::{SweepResult, run_sweep};

use crate::database::account_security::AccountSecurityRepository;
use crate::database::postgres_repository::PostgresRepository;
use crate::database::redemption::RedemptionRepository;
use crate::db::stage_db;
use crate::middleware::RequestLogger;
use crate::routes as app_routes;
use crate::service::account_lock::AccountLockManager;
use crate::service::rate_limiter::RateLimiter;
use crate::service::redemption::RedemptionEngine;
use rocket::fairing::AdHoc;
use rocket::{Build, Rocket, catchers, http::Method};
use rocket_cors::{AllowedOrigins, CorsOptions};
use rocket_okapi::swagger_ui::{SwaggerUIConfig, make_swagger_ui};
use rocket_okapi::{get_openapi_route, okapi::merge::marge_spec_list};
use sqlx::PgPool;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn init_tracing(log_level: &str, json_format: bool) {
    // RUST_LOG overrides the configured level, e.g.
    //   RUST_LOG=ledger_guard::service=debug
    //   RUST_LOG=info,ledger_guard::middleware=trace
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_line_number(true);

    // Tests build several rockets per process; only the first subscriber sticks.
    if json_format {
        let _ = subscriber.json().try_init();
    } else {
        let _ = subscriber.try_init();
    }
}

fn ensure_rocket_secret_key() {
    let profile = std::env::var("ROCKET_PROFILE").unwrap_or_else(|_| "debug".to_string());

    if profile != "debug" && std::env::var("ROCKET_SECRET_KEY").is_err() {
        panic!(
            "ROCKET_SECRET_KEY is required for profile '{}'. Generate one with: openssl rand -base64 32",
            profile
        );
    }
}

fn build_cors(cors_config: &config::CorsConfig) -> CorsOptions {
    let is_wildcard = cors_config.allowed_origins.len() == 1 && cors_config.allowed_origins[0] == "*";

    if is_wildcard && cors_config.allow_credentials {
        panic!(
            "Invalid CORS configuration: Cannot use wildcard origins (*) with credentials enabled. \
            Either set specific origins or disable credentials."
        );
    }

    let allowed_origins = if cors_config.allowed_origins.is_empty() {
        AllowedOrigins::some_exact::<&str>(&[])
    } else if is_wildcard {
        AllowedOrigins::all()
    } else {
        AllowedOrigins::some_exact(&cors_config.allowed_origins.iter().map(String::as_str).collect::<Vec<_>>())
    };

    CorsOptions {
        allowed_origins,
        allowed_methods: vec![Method::Get, Method::Post, Method::Put, Method::Options, Method::Head]
            .into_iter()
            .map(From::from)
            .collect(),
        allowed_headers: rocket_cors::AllowedHeaders::some(&["Content-Type", "Accept"]),
        allow_credentials: cors_config.allow_credentials,
        expose_headers: ["Retry-After", "X-Request-Id"].iter().map(|h| h.to_string()).collect(),
        ..Default::default()
    }
}

fn get_swagger_config(openapi_url: &str) -> SwaggerUIConfig {
    SwaggerUIConfig {
        url: openapi_url.to_string(),
        ..Default::default()
    }
}

fn normalize_base_path(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return config::DEFAULT_API_BASE_PATH.to_string();
    }

    let mut normalized = if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    };

    while normalized.ends_with('/') && normalized.len() > 1 {
        normalized.pop();
    }

    normalized
}

fn join_base_path(base_path: &str, path: &str) -> String {
    let base = base_path.trim_end_matches('/');
    let suffix = path.trim_start_matches('/');

    if base.is_empty() {
        format!("/{}", suffix)
    } else {
        format!("{}/{}", base, suffix)
    }
}

struct RouteSpec {
    path: &'static str,
    routes: Vec<rocket::Route>,
    openapi: rocket_okapi::okapi::openapi3::OpenApi,
}

fn collect_route_specs() -> Vec<RouteSpec> {
    let (user_routes, user_openapi) = app_routes::user::routes();
    let (redeem_routes, redeem_openapi) = app_routes::redeem::routes();
    let (admin_routes, admin_openapi) = app_routes::admin::routes();
    let (health_routes, health_openapi) = app_routes::health::routes();

    vec![
        RouteSpec {
            path: "/users",
            routes: user_routes,
            openapi: user_openapi,
        },
        RouteSpec {
            path: "/redeem",
            routes: redeem_routes,
            openapi: redeem_openapi,
        },
        RouteSpec {
            path: "/admin",
            routes: admin_routes,
            openapi: admin_openapi,
        },
        RouteSpec {
            path: "/health",
            routes: health_routes,
            openapi: health_openapi,
        },
    ]
}

fn mount_api_routes(mut rocket: Rocket<Build>, base_path: &str, enable_swagger: bool) -> Rocket<Build> {
    let route_specs = collect_route_specs();

    if enable_swagger {
        let mut openapi_list = Vec::new();
        for spec in route_specs {
            rocket = rocket.mount(format!("{}{}", base_path, spec.path), spec.routes);
            openapi_list.push((spec.path, spec.openapi));
        }

        let openapi_docs = match marge_spec_list(&openapi_list) {
            Ok(docs) => docs,
            Err(err) => panic!("Could not merge OpenAPI spec: {}", err),
        };

        let settings = rocket_okapi::settings::OpenApiSettings::default();
        rocket = rocket.mount(base_path, vec![get_openapi_route(openapi_docs, &settings)]);

        let docs_path = join_base_path(base_path, "docs");
        let openapi_url = join_base_path(base_path, "openapi.json");
        rocket = rocket.mount(docs_path, make_swagger_ui(&get_swagger_config(&openapi_url)));
    } else {
        for spec in route_specs {
            rocket = rocket.mount(format!("{}{}", base_path, spec.path), spec.routes);
        }
    }

    // Cron endpoints are internal and stay out of the published spec.
    rocket.mount(join_base_path(base_path, "cron"), app_routes::cron::routes())
}

/// Rate limiter, lock manager and redemption engine, built once the pool exists.
fn stage_services(config: Config) -> AdHoc {
    AdHoc::try_on_ignite("Security services", |rocket| async move {
        let limiter = match RateLimiter::from_config(&config.rate_limit).await {
            Ok(limiter) => Arc::new(limiter),
            Err(e) => {
                tracing::error!("Failed to initialize rate limiter: {}", e);
                return Err(rocket);
            }
        };

        let pool = match rocket.state::<PgPool>() {
            Some(pool) => pool.clone(),
            None => {
                tracing::error!("Database pool must be staged before security services");
                return Err(rocket);
            }
        };
        let repo = Arc::new(PostgresRepository::new(pool));

        let security_repo: Arc<dyn AccountSecurityRepository> = repo.clone();
        let lock_manager = Arc::new(AccountLockManager::new(config.account_lock.clone(), security_repo));

        let redemption_repo: Arc<dyn RedemptionRepository> = repo;
        let engine = Arc::new(RedemptionEngine::new(redemption_repo, config.redemption.clone()));

        Ok(rocket.manage(limiter).manage(lock_manager).manage(engine))
    })
}

pub fn build_rocket(config: Config) -> Rocket<Build> {
    init_tracing(&config.logging.level, config.logging.json_format);
    ensure_rocket_secret_key();

    let cors = build_cors(&config.cors).to_cors().expect("Failed to create CORS fairing");

    let base_path = normalize_base_path(&config.api.base_path);
    let enable_swagger = config.api.enable_swagger;

    let figment = rocket::Config::figment()
        .merge(("port", config.server.port))
        .merge(("address", config.server.address.clone()));

    let mut rocket = rocket::custom(figment)
        .attach(cors)
        .attach(RequestLogger)
        .attach(stage_db(config.database.clone()))
        .attach(stage_services(config.clone()))
        .manage(config);

    rocket = mount_api_routes(rocket, &base_path, enable_swagger);

    rocket.register(
        base_path.as_str(),
        catchers![
            app_routes::error::unauthorized,
            app_routes::error::forbidden,
            app_routes::error::not_found,
            app_routes::error::conflict,
            app_routes::error::too_many_requests
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_path_is_normalized() {
        assert_eq!(normalize_base_path(""), config::DEFAULT_API_BASE_PATH);
        assert_eq!(normalize_base_path("api/"), "/api");
        assert_eq!(normalize_base_path("/api/v2//"), "/api/v2");
    }

    #[test]
    fn join_handles_slashes() {
        assert_eq!(join_base_path("/api/v1", "/docs"), "/api/v1/docs");
        assert_eq!(join_base_path("/", "openapi.json"), "/openapi.json");
    }

    #[test]
    fn openapi_specs_merge() {
        let specs: Vec<(&str, _)> = collect_route_specs().into_iter().map(|spec| (spec.path, spec.openapi)).collect();
        assert!(marge_spec_list(&specs).is_ok());
    }

    #[test]
    #[should_panic(expected = "wildcard origins")]
    fn wildcard_cors_with_credentials_is_rejected() {
        let cors = config::CorsConfig {
            allowed_origins: vec!["*".to_string()],
            allow_credentials: true,
        };
        build_cors(&cors);
    }
}
