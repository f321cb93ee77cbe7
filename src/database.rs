pub mod account_security;
pub mod audit;
pub mod postgres_repository;
pub mod redeem_code;
pub mod redemption;
pub mod user;
