pub mod admin;
pub mod cron;
pub mod error;
pub mod health;
pub mod redeem;
pub mod user;
