use ledger_guard::{Config, build_rocket};
use rocket::{Build, Rocket};

#[rocket::launch]
fn rocket() -> Rocket<Build> {
    dotenvy::dotenv().ok();

    let config = Config::load().expect("Failed to load configuration");
    build_rocket(config)
}
