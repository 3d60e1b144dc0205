//! Saga Error Types

use thiserror::Error;

use crate::ledger::{AccountId, LedgerError};
use crate::money::MoneyError;
use crate::rates::RateError;

/// How the orchestrator and callers should treat a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected before any side effect
    Validation,
    /// Recorded FAILED, never retried
    Business,
    /// Lock contention; retried up to the attempt ceiling
    Conflict,
    /// Source debited and the refund failed
    CompensationFailure,
    /// Recorded FAILED, surfaced as internal
    Infrastructure,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SagaError {
    // === Validation Errors ===
    #[error("{0}")]
    BadRequest(String),

    /// Unknown or foreign resource; account ownership failures land here too
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Forbidden(String),

    // === Business Errors ===
    #[error("Account {0} not found")]
    AccountNotFound(AccountId),

    #[error("Account {0} is not active")]
    AccountInactive(AccountId),

    #[error("Insufficient funds on account {0}")]
    InsufficientFunds(AccountId),

    #[error("{0}")]
    LimitExceeded(String),

    #[error("{0}")]
    ExternalServiceUnavailable(String),

    // === Contention ===
    #[error("{0}")]
    Conflict(String),

    // === Severe ===
    #[error("Compensation failed: {0}")]
    CompensationFailed(String),

    // === System Errors ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl SagaError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SagaError::BadRequest(_) | SagaError::NotFound(_) | SagaError::Forbidden(_) => {
                ErrorKind::Validation
            }
            SagaError::AccountNotFound(_)
            | SagaError::AccountInactive(_)
            | SagaError::InsufficientFunds(_)
            | SagaError::LimitExceeded(_)
            | SagaError::ExternalServiceUnavailable(_) => ErrorKind::Business,
            SagaError::Conflict(_) => ErrorKind::Conflict,
            SagaError::CompensationFailed(_) => ErrorKind::CompensationFailure,
            SagaError::Internal(_) | SagaError::Database(_) => ErrorKind::Infrastructure,
        }
    }

    #[inline]
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }

    pub fn code(&self) -> &'static str {
        match self {
            SagaError::BadRequest(_) => "BAD_REQUEST",
            SagaError::NotFound(_) => "NOT_FOUND",
            SagaError::Forbidden(_) => "FORBIDDEN",
            SagaError::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            SagaError::AccountInactive(_) => "ACCOUNT_INACTIVE",
            SagaError::InsufficientFunds(_) => "INSUFFICIENT_FUNDS",
            SagaError::LimitExceeded(_) => "LIMIT_EXCEEDED",
            SagaError::ExternalServiceUnavailable(_) => "EXTERNAL_SERVICE_UNAVAILABLE",
            SagaError::Conflict(_) => "CONFLICT",
            SagaError::CompensationFailed(_) => "COMPENSATION_FAILED",
            SagaError::Internal(_) => "INTERNAL_ERROR",
            SagaError::Database(_) => "DATABASE_ERROR",
        }
    }

    /// Get HTTP status code suggestion
    pub fn http_status(&self) -> u16 {
        match self {
            SagaError::BadRequest(_) => 400,
            SagaError::Forbidden(_) => 403,
            SagaError::NotFound(_) => 404,
            SagaError::Conflict(_) => 409,
            SagaError::AccountNotFound(_)
            | SagaError::AccountInactive(_)
            | SagaError::InsufficientFunds(_)
            | SagaError::LimitExceeded(_) => 422,
            SagaError::ExternalServiceUnavailable(_) => 503,
            SagaError::CompensationFailed(_) | SagaError::Internal(_) | SagaError::Database(_) => {
                500
            }
        }
    }
}

impl From<LedgerError> for SagaError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::AccountNotFound(id) => SagaError::AccountNotFound(id),
            LedgerError::AccountInactive(id) => SagaError::AccountInactive(id),
            LedgerError::InsufficientFunds { account_id, .. } => {
                SagaError::InsufficientFunds(account_id)
            }
            LedgerError::InvalidAmount => SagaError::BadRequest(e.to_string()),
            LedgerError::LockConflict(_) => SagaError::Conflict(e.to_string()),
            LedgerError::Unavailable(msg) => SagaError::Internal(msg),
        }
    }
}

impl From<RateError> for SagaError {
    fn from(e: RateError) -> Self {
        SagaError::ExternalServiceUnavailable(e.to_string())
    }
}

impl From<MoneyError> for SagaError {
    fn from(e: MoneyError) -> Self {
        SagaError::BadRequest(e.to_string())
    }
}

impl From<sqlx::Error> for SagaError {
    fn from(e: sqlx::Error) -> Self {
        SagaError::Database(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    #[test]
    fn test_kinds() {
        assert_eq!(SagaError::BadRequest("x".into()).kind(), ErrorKind::Validation);
        assert_eq!(SagaError::InsufficientFunds(1).kind(), ErrorKind::Business);
        assert_eq!(
            SagaError::ExternalServiceUnavailable("down".into()).kind(),
            ErrorKind::Business
        );
        assert_eq!(SagaError::Conflict("busy".into()).kind(), ErrorKind::Conflict);
        assert_eq!(
            SagaError::CompensationFailed("x".into()).kind(),
            ErrorKind::CompensationFailure
        );
        assert_eq!(SagaError::Database("x".into()).kind(), ErrorKind::Infrastructure);
    }

    #[test]
    fn test_only_conflict_is_retryable() {
        assert!(SagaError::Conflict("busy".into()).is_retryable());
        assert!(!SagaError::Internal("boom".into()).is_retryable());
        assert!(!SagaError::LimitExceeded("over".into()).is_retryable());
    }

    #[test]
    fn test_from_ledger_error() {
        assert_eq!(
            SagaError::from(LedgerError::LockConflict(3)),
            SagaError::Conflict("Account 3 is locked by another operation".into())
        );
        assert_eq!(
            SagaError::from(LedgerError::InsufficientFunds {
                account_id: 4,
                balance: Decimal::ZERO,
                requested: Decimal::ONE,
            }),
            SagaError::InsufficientFunds(4)
        );
        assert!(matches!(
            SagaError::from(LedgerError::Unavailable("io".into())),
            SagaError::Internal(_)
        ));
    }

    #[test]
    fn test_http_status() {
        assert_eq!(SagaError::NotFound("x".into()).http_status(), 404);
        assert_eq!(SagaError::Forbidden("x".into()).http_status(), 403);
        assert_eq!(SagaError::Conflict("x".into()).http_status(), 409);
        assert_eq!(SagaError::InsufficientFunds(1).http_status(), 422);
        assert_eq!(SagaError::CompensationFailed("x".into()).http_status(), 500);
    }

    #[test]
    fn test_display() {
        assert_eq!(
            SagaError::CompensationFailed("refund of 100 to account 1".into()).to_string(),
            "Compensation failed: refund of 100 to account 1"
        );
    }
}
