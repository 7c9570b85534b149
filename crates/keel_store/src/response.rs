//! Per-operation responses returned by the tablet storage layer.

use bytes::Bytes;

use crate::request::PagingState;

/// Completion status of one storage sub-request, mirroring the tablet
/// server's wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseStatus {
    #[default]
    Ok,
    SchemaVersionMismatch,
    RuntimeError,
    UsageError,
    RestartRequired,
    DuplicateKey,
}

/// SQL-visible error code attached to a failed response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PgErrorCode {
    InternalError,
    UniqueViolation,
    SerializationFailure,
    QueryCanceled,
}

impl PgErrorCode {
    /// Five-character SQLSTATE for wire reporting.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            PgErrorCode::InternalError => "XX000",
            PgErrorCode::UniqueViolation => "23505",
            PgErrorCode::SerializationFailure => "40001",
            PgErrorCode::QueryCanceled => "57014",
        }
    }
}

/// Transaction-layer error code attached to a failed response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnErrorCode {
    Aborted,
    ReadRestartRequired,
    Conflict,
}

/// One sub-response from the storage layer.
///
/// `rows_data` is an opaque blob of encoded rows; the gateway moves it into
/// its result cache without inspecting it.
#[derive(Debug, Clone, Default)]
pub struct OpResponse {
    pub status: ResponseStatus,
    pub error_message: String,
    pub pg_error_code: Option<PgErrorCode>,
    pub txn_error_code: Option<TxnErrorCode>,
    pub paging_state: Option<PagingState>,
    pub rows_affected_count: u64,
    pub rows_data: Bytes,
}

impl OpResponse {
    /// Successful response carrying a rows blob and no continuation.
    pub fn with_rows(rows_data: Bytes) -> OpResponse {
        OpResponse {
            rows_data,
            ..OpResponse::default()
        }
    }

    /// Successful response carrying a rows blob and a continuation token.
    pub fn with_rows_and_paging(rows_data: Bytes, paging_state: PagingState) -> OpResponse {
        OpResponse {
            rows_data,
            paging_state: Some(paging_state),
            ..OpResponse::default()
        }
    }

    /// Failed response with the given status and message.
    pub fn error(status: ResponseStatus, message: impl Into<String>) -> OpResponse {
        OpResponse {
            status,
            error_message: message.into(),
            ..OpResponse::default()
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == ResponseStatus::Ok
    }
}
