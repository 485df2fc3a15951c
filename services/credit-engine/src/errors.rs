use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BalanceError>;

/// Failures reported by a ledger backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Unknown client: {0}")]
    UnknownClient(String),

    #[error("Ledger storage unavailable: {0}")]
    StorageUnavailable(String),
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        LedgerError::StorageUnavailable(err.to_string())
    }
}

/// Failures reported by a cache backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache storage unavailable: {0}")]
    StorageUnavailable(String),
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        CacheError::StorageUnavailable(err.to_string())
    }
}

/// The coordinator's external error contract.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BalanceError {
    #[error("Insufficient credit: required {required}, available {available}")]
    InsufficientCredit { required: i64, available: i64 },

    #[error("Client not found")]
    ClientNotFound,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl From<LedgerError> for BalanceError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::UnknownClient(_) => BalanceError::ClientNotFound,
            LedgerError::StorageUnavailable(msg) => BalanceError::Internal(msg),
        }
    }
}

impl From<CacheError> for BalanceError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::StorageUnavailable(msg) => BalanceError::Internal(msg),
        }
    }
}

impl ResponseError for BalanceError {
    fn error_response(&self) -> HttpResponse {
        let status_code = self.status_code();

        // Store details stay in the logs
        let error_message = match self {
            BalanceError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        };

        HttpResponse::build(status_code).json(json!({
            "error": {
                "code": status_code.as_u16(),
                "message": error_message,
                "type": self.error_type()
            }
        }))
    }

    fn status_code(&self) -> StatusCode {
        match self {
            BalanceError::InsufficientCredit { .. } => StatusCode::PAYMENT_REQUIRED,
            BalanceError::ClientNotFound => StatusCode::UNAUTHORIZED,
            BalanceError::Validation(_) => StatusCode::BAD_REQUEST,
            BalanceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl BalanceError {
    fn error_type(&self) -> &str {
        match self {
            BalanceError::InsufficientCredit { .. } => "insufficient_credit",
            BalanceError::ClientNotFound => "unauthorized",
            BalanceError::Validation(_) => "validation_error",
            BalanceError::Internal(_) => "internal_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_client_maps_to_client_not_found() {
        let err: BalanceError = LedgerError::UnknownClient("tok1".to_string()).into();
        assert_eq!(err, BalanceError::ClientNotFound);
    }

    #[test]
    fn test_storage_failures_map_to_internal() {
        let err: BalanceError = LedgerError::StorageUnavailable("pool timed out".to_string()).into();
        assert!(matches!(err, BalanceError::Internal(_)));

        let err: BalanceError = CacheError::StorageUnavailable("connection reset".to_string()).into();
        assert!(matches!(err, BalanceError::Internal(_)));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            BalanceError::InsufficientCredit { required: 1, available: 0 }.status_code(),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(BalanceError::ClientNotFound.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            BalanceError::Validation("amount".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            BalanceError::Internal("boom".to_string()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
