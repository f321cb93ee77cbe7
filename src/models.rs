pub mod account_security;
pub mod audit;
pub mod pagination;
pub mod rate_limit;
pub mod redeem_code;
pub mod redemption;
pub mod user;
pub mod vip;
