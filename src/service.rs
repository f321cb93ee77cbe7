pub mod account_lock;
pub mod code_generator;
pub mod rate_limiter;
pub mod redemption;
