use rocket::http::Status;
use thiserror::Error;

/// Typed outcome of a rejected redemption.
///
/// Every variant except `Internal` is an expected business result: the code
/// was checked and refused without granting anything.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RedemptionError {
    #[error("Redeem code not found")]
    CodeNotFound,
    #[error("Redeem code is not available")]
    CodeUnavailable,
    #[error("Redeem code has expired")]
    CodeExpired,
    #[error("Redeem code has reached its usage limit")]
    CodeExhausted,
    #[error("You have already redeemed this code")]
    AlreadyRedeemed,
    #[error("Redemption failed, please try again later")]
    Internal(String),
}

impl RedemptionError {
    /// Stable machine-readable reason, stored on failed history rows.
    pub fn reason(&self) -> &'static str {
        match self {
            RedemptionError::CodeNotFound => "code_not_found",
            RedemptionError::CodeUnavailable => "code_unavailable",
            RedemptionError::CodeExpired => "code_expired",
            RedemptionError::CodeExhausted => "code_exhausted",
            RedemptionError::AlreadyRedeemed => "already_redeemed",
            RedemptionError::Internal(_) => "internal_error",
        }
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, RedemptionError::Internal(_))
    }
}

impl From<&RedemptionError> for Status {
    fn from(e: &RedemptionError) -> Self {
        match e {
            RedemptionError::CodeNotFound => Status::NotFound,
            RedemptionError::CodeUnavailable => Status::BadRequest,
            RedemptionError::CodeExpired => Status::BadRequest,
            RedemptionError::CodeExhausted => Status::BadRequest,
            RedemptionError::AlreadyRedeemed => Status::BadRequest,
            RedemptionError::Internal(_) => Status::InternalServerError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_match_the_route_contract() {
        assert_eq!(Status::from(&RedemptionError::CodeNotFound), Status::NotFound);
        assert_eq!(Status::from(&RedemptionError::CodeUnavailable), Status::BadRequest);
        assert_eq!(Status::from(&RedemptionError::CodeExpired), Status::BadRequest);
        assert_eq!(Status::from(&RedemptionError::CodeExhausted), Status::BadRequest);
        assert_eq!(Status::from(&RedemptionError::AlreadyRedeemed), Status::BadRequest);
        assert_eq!(Status::from(&RedemptionError::Internal("boom".to_string())), Status::InternalServerError);
    }

    #[test]
    fn internal_message_is_not_leaked() {
        let err = RedemptionError::Internal("connection reset by peer".to_string());
        assert!(!err.to_string().contains("connection reset"));
        assert!(err.is_internal());
        assert_eq!(err.reason(), "internal_error");
    }
}
