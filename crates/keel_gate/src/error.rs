//! SQL-visible error taxonomy for document operations.

use keel_store::response::{OpResponse, PgErrorCode, TxnErrorCode};
use keel_store::session::StorageError;
use thiserror::Error;

pub type ExecResult<T> = Result<T, ExecError>;

/// Execution failure surfaced to the statement layer.
///
/// Errors are sticky: the first failure is stored on the op and returned by
/// every subsequent entry point, so the type is cloneable by construction.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExecError {
    /// Entry into a canceled or misused operation.
    #[error("illegal state: {0}")]
    IllegalState(String),
    /// The storage layer rejected a write as a duplicate key. Kept distinct
    /// from `QueryLayer` so an upper layer can replace the message with one
    /// naming the offending index.
    #[error("{message}")]
    AlreadyPresent {
        message: String,
        pg_code: PgErrorCode,
        txn_code: Option<TxnErrorCode>,
    },
    /// Any other storage sub-request failure.
    #[error("{message}")]
    QueryLayer {
        message: String,
        pg_code: PgErrorCode,
        txn_code: Option<TxnErrorCode>,
    },
    /// Transport-level session failure (apply or flush).
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ExecError {
    /// SQL error code attached to the failure, when one was classified.
    pub fn pg_error_code(&self) -> Option<PgErrorCode> {
        match self {
            ExecError::AlreadyPresent { pg_code, .. } | ExecError::QueryLayer { pg_code, .. } => {
                Some(*pg_code)
            }
            _ => None,
        }
    }

    /// Transaction error code attached to the failure, when present.
    pub fn txn_error_code(&self) -> Option<TxnErrorCode> {
        match self {
            ExecError::AlreadyPresent { txn_code, .. } | ExecError::QueryLayer { txn_code, .. } => {
                *txn_code
            }
            _ => None,
        }
    }

    /// Classify one failed sub-response. Returns `None` when the response
    /// succeeded. The SQL error code defaults to `InternalError` and the
    /// transaction code to none when the storage layer omitted them.
    pub fn from_failed_response(response: &OpResponse) -> Option<ExecError> {
        if response.succeeded() {
            return None;
        }
        let pg_code = response.pg_error_code.unwrap_or(PgErrorCode::InternalError);
        let txn_code = response.txn_error_code;
        let message = response.error_message.clone();
        Some(match response.status {
            keel_store::response::ResponseStatus::DuplicateKey => ExecError::AlreadyPresent {
                message,
                pg_code,
                txn_code,
            },
            _ => ExecError::QueryLayer {
                message,
                pg_code,
                txn_code,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_store::response::ResponseStatus;

    #[test]
    fn duplicate_key_classifies_as_already_present() {
        let mut response = OpResponse::error(ResponseStatus::DuplicateKey, "dup");
        response.pg_error_code = Some(PgErrorCode::UniqueViolation);
        response.txn_error_code = Some(TxnErrorCode::Conflict);

        let err = ExecError::from_failed_response(&response).expect("failed response");
        assert!(matches!(err, ExecError::AlreadyPresent { .. }));
        assert_eq!(err.pg_error_code(), Some(PgErrorCode::UniqueViolation));
        assert_eq!(err.txn_error_code(), Some(TxnErrorCode::Conflict));
    }

    #[test]
    fn other_failures_classify_as_query_layer_with_defaults() {
        let response = OpResponse::error(ResponseStatus::RuntimeError, "boom");
        let err = ExecError::from_failed_response(&response).expect("failed response");
        assert!(matches!(err, ExecError::QueryLayer { .. }));
        assert_eq!(err.pg_error_code(), Some(PgErrorCode::InternalError));
        assert_eq!(err.txn_error_code(), None);
    }

    #[test]
    fn successful_response_yields_no_error() {
        assert_eq!(ExecError::from_failed_response(&OpResponse::default()), None);
    }
}
