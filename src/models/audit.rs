/// Event types for security audit log
pub mod audit_events {
    // Authentication events
    pub const LOGIN_SUCCESS: &str = "login_success";
    pub const LOGIN_FAILED: &str = "login_failed";
    pub const LOGOUT: &str = "logout";
    pub const PASSWORD_CHANGED: &str = "password_changed";

    // Lockout events
    pub const ACCOUNT_LOCKED: &str = "account_locked";
    pub const ACCOUNT_UNLOCKED: &str = "account_unlocked";
    pub const ACCOUNT_LOCK_EXPIRED: &str = "account_lock_expired";

    // Redemption events
    pub const REDEEM_SUCCESS: &str = "redeem_success";
    pub const REDEEM_FAILED: &str = "redeem_failed";
    pub const REDEEM_CODES_CREATED: &str = "redeem_codes_created";
    pub const REDEEM_CODE_STATUS_CHANGED: &str = "redeem_code_status_changed";
}
