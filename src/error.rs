//! Engine Error Types
//!
//! One error enum for the whole core. Variants are grouped by kind; the kind
//! decides whether a caller may retry. The HTTP layer maps `api_code()` and
//! `http_status()` onto its responses.

use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;

use crate::kv::KvError;
use crate::money::MoneyError;

/// Stable decimal response codes shared with the HTTP layer.
pub mod codes {
    pub const SUCCESS: i32 = 200;
    pub const INVALID_PARAMS: i32 = 20001;
    pub const AUTH: i32 = 20002;
    pub const NOT_FOUND: i32 = 20003;
    pub const FORBIDDEN: i32 = 20004;
    pub const RATE_LIMITED: i32 = 20005;
    pub const INTERNAL: i32 = 20006;
    pub const INTERNAL_ERROR: i32 = 500;
}

/// Error classification, not a type hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Caller supplied something wrong. Never retry.
    Validation,
    /// Request is well-formed but the business rules refuse it.
    Business,
    /// Lost a race. Retry per policy.
    Concurrency,
    /// Backing store or key-value store unavailable.
    Infra,
    /// Bug or recovered panic.
    Internal,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    // === Validation Errors ===
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Illegal transition {from} -> {to} by {operator}")]
    IllegalTransition {
        from: String,
        to: String,
        operator: String,
    },

    #[error("Amount mismatch: expected {expected}, got {actual}")]
    AmountMismatch { expected: Decimal, actual: Decimal },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    // === Business Errors ===
    #[error("Insufficient stock: available {available}, requested {requested}")]
    InsufficientStock { available: i32, requested: i32 },

    #[error("Insufficient balance")]
    InsufficientBalance,

    #[error("Goods {0} is off-shelf or deleted")]
    GoodsUnavailable(i64),

    #[error("Duplicate submission, please do not place the same order twice")]
    DuplicateSubmission,

    #[error("Room unavailable: {0}")]
    RoomUnavailable(String),

    // === Concurrency Errors ===
    #[error("System busy, please retry later: {0}")]
    SystemBusy(String),

    #[error("Lock already held: {0}")]
    AlreadyHeld(String),

    #[error("Optimistic conflict: {0}")]
    OptimisticConflict(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    // === Infra Errors ===
    #[error("Lock backend unavailable: {0}")]
    LockBackendUnavailable(String),

    #[error("Database unavailable: {0}")]
    DatabaseUnavailable(String),

    // === Internal ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidArgument(_)
            | EngineError::InvalidState(_)
            | EngineError::IllegalTransition { .. }
            | EngineError::AmountMismatch { .. }
            | EngineError::NotFound(_)
            | EngineError::Forbidden(_) => ErrorKind::Validation,
            EngineError::InsufficientStock { .. }
            | EngineError::InsufficientBalance
            | EngineError::GoodsUnavailable(_)
            | EngineError::DuplicateSubmission
            | EngineError::RoomUnavailable(_) => ErrorKind::Business,
            EngineError::SystemBusy(_)
            | EngineError::AlreadyHeld(_)
            | EngineError::OptimisticConflict(_)
            | EngineError::Timeout(_) => ErrorKind::Concurrency,
            EngineError::LockBackendUnavailable(_) | EngineError::DatabaseUnavailable(_) => {
                ErrorKind::Infra
            }
            EngineError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Lost a race for a lock or a row; the same call may succeed later.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Concurrency
    }

    /// Symbolic code for logs and API bodies.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidArgument(_) => "INVALID_ARGUMENT",
            EngineError::InvalidState(_) => "INVALID_STATE",
            EngineError::IllegalTransition { .. } => "ILLEGAL_TRANSITION",
            EngineError::AmountMismatch { .. } => "AMOUNT_MISMATCH",
            EngineError::NotFound(_) => "NOT_FOUND",
            EngineError::Forbidden(_) => "FORBIDDEN",
            EngineError::InsufficientStock { .. } => "INSUFFICIENT_STOCK",
            EngineError::InsufficientBalance => "INSUFFICIENT_BALANCE",
            EngineError::GoodsUnavailable(_) => "GOODS_UNAVAILABLE",
            EngineError::DuplicateSubmission => "DUPLICATE_SUBMISSION",
            EngineError::RoomUnavailable(_) => "ROOM_UNAVAILABLE",
            EngineError::SystemBusy(_) => "SYSTEM_BUSY",
            EngineError::AlreadyHeld(_) => "ALREADY_HELD",
            EngineError::OptimisticConflict(_) => "OPTIMISTIC_CONFLICT",
            EngineError::Timeout(_) => "TIMEOUT",
            EngineError::LockBackendUnavailable(_) => "LOCK_BACKEND_UNAVAILABLE",
            EngineError::DatabaseUnavailable(_) => "DATABASE_UNAVAILABLE",
            EngineError::Internal(_) => "INTERNAL",
        }
    }

    /// Decimal response code, see [`codes`].
    pub fn api_code(&self) -> i32 {
        match self {
            EngineError::NotFound(_) => codes::NOT_FOUND,
            EngineError::Forbidden(_) => codes::FORBIDDEN,
            EngineError::Internal(_) => codes::INTERNAL_ERROR,
            other => match other.kind() {
                ErrorKind::Validation | ErrorKind::Business => codes::INVALID_PARAMS,
                ErrorKind::Concurrency => codes::RATE_LIMITED,
                ErrorKind::Infra => codes::INTERNAL,
                ErrorKind::Internal => codes::INTERNAL_ERROR,
            },
        }
    }

    /// Get HTTP status code suggestion
    pub fn http_status(&self) -> u16 {
        match self {
            EngineError::NotFound(_) => 404,
            EngineError::Forbidden(_) => 403,
            EngineError::DuplicateSubmission
            | EngineError::IllegalTransition { .. }
            | EngineError::InvalidState(_) => 409,
            EngineError::InsufficientStock { .. }
            | EngineError::InsufficientBalance
            | EngineError::GoodsUnavailable(_)
            | EngineError::RoomUnavailable(_) => 422,
            EngineError::InvalidArgument(_) | EngineError::AmountMismatch { .. } => 400,
            EngineError::SystemBusy(_)
            | EngineError::AlreadyHeld(_)
            | EngineError::OptimisticConflict(_) => 429,
            EngineError::Timeout(_) => 504,
            EngineError::LockBackendUnavailable(_) | EngineError::DatabaseUnavailable(_) => 503,
            EngineError::Internal(_) => 500,
        }
    }

    /// Render for an API response. `expose_detail = false` is production mode:
    /// internal and infra messages are replaced by a generic text.
    pub fn to_body(&self, path: &str, expose_detail: bool) -> ErrorBody {
        let message = match self.kind() {
            ErrorKind::Internal | ErrorKind::Infra if !expose_detail => {
                "internal server error".to_string()
            }
            _ => self.to_string(),
        };
        ErrorBody {
            code: self.api_code(),
            error: self.code(),
            message,
            path: path.to_string(),
        }
    }
}

/// Serializable error envelope echoed to the caller.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ErrorBody {
    pub code: i32,
    pub error: &'static str,
    pub message: String,
    pub path: String,
}

pub type EngineResult<T> = Result<T, EngineError>;

impl From<sqlx::Error> for EngineError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::RowNotFound => EngineError::NotFound("row".into()),
            sqlx::Error::Database(db) => match db.code().as_deref() {
                // serialization_failure / deadlock_detected
                Some("40001") | Some("40P01") => EngineError::OptimisticConflict(db.to_string()),
                // check_violation: stock / balance CHECK constraints
                Some("23514") => EngineError::OptimisticConflict(db.to_string()),
                _ => EngineError::DatabaseUnavailable(e.to_string()),
            },
            _ => EngineError::DatabaseUnavailable(e.to_string()),
        }
    }
}

impl From<KvError> for EngineError {
    fn from(e: KvError) -> Self {
        EngineError::LockBackendUnavailable(e.to_string())
    }
}

impl From<MoneyError> for EngineError {
    fn from(e: MoneyError) -> Self {
        EngineError::InvalidArgument(e.to_string())
    }
}

impl From<validator::ValidationErrors> for EngineError {
    fn from(e: validator::ValidationErrors) -> Self {
        EngineError::InvalidArgument(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(EngineError::InvalidArgument("x".into()).kind(), ErrorKind::Validation);
        assert_eq!(EngineError::DuplicateSubmission.kind(), ErrorKind::Business);
        assert_eq!(EngineError::SystemBusy("x".into()).kind(), ErrorKind::Concurrency);
        assert_eq!(
            EngineError::LockBackendUnavailable("x".into()).kind(),
            ErrorKind::Infra
        );
        assert_eq!(EngineError::Internal("x".into()).kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_retryable_only_for_concurrency() {
        assert!(EngineError::AlreadyHeld("k".into()).is_retryable());
        assert!(EngineError::OptimisticConflict("k".into()).is_retryable());
        assert!(!EngineError::InsufficientStock { available: 0, requested: 1 }.is_retryable());
        assert!(!EngineError::DatabaseUnavailable("down".into()).is_retryable());
    }

    #[test]
    fn test_api_codes() {
        assert_eq!(EngineError::InvalidArgument("q".into()).api_code(), 20001);
        assert_eq!(EngineError::InsufficientBalance.api_code(), 20001);
        assert_eq!(EngineError::NotFound("order".into()).api_code(), 20003);
        assert_eq!(EngineError::Forbidden("order".into()).api_code(), 20004);
        assert_eq!(EngineError::SystemBusy("lock".into()).api_code(), 20005);
        assert_eq!(EngineError::DatabaseUnavailable("pg".into()).api_code(), 20006);
        assert_eq!(EngineError::Internal("boom".into()).api_code(), 500);
    }

    #[test]
    fn test_http_status() {
        assert_eq!(EngineError::NotFound("x".into()).http_status(), 404);
        assert_eq!(EngineError::DuplicateSubmission.http_status(), 409);
        assert_eq!(EngineError::InsufficientBalance.http_status(), 422);
        assert_eq!(EngineError::SystemBusy("x".into()).http_status(), 429);
        assert_eq!(EngineError::Internal("x".into()).http_status(), 500);
    }

    #[test]
    fn test_body_hides_internal_detail_in_production() {
        let err = EngineError::DatabaseUnavailable("password=hunter2".into());
        let body = err.to_body("/api/orders", false);
        assert_eq!(body.code, 20006);
        assert_eq!(body.message, "internal server error");
        assert_eq!(body.path, "/api/orders");

        let debug = err.to_body("/api/orders", true);
        assert!(debug.message.contains("hunter2"));

        let business = EngineError::DuplicateSubmission.to_body("/api/orders", false);
        assert_eq!(business.error, "DUPLICATE_SUBMISSION");
        assert!(business.message.contains("Duplicate"));
    }

    #[test]
    fn test_display() {
        let err = EngineError::InsufficientStock {
            available: 2,
            requested: 5,
        };
        assert_eq!(err.to_string(), "Insufficient stock: available 2, requested 5");
    }
}
