//! Write execution: single-shot dispatch, duplicate-key classification, and
//! the buffered-write bypass.

mod common;

use anyhow::Result;
use bytes::Bytes;
use common::{Round, ScriptedSession};
use keel_gate::{ExecError, ExecFlags, RequestSent, WriteDocOp};
use keel_store::op::WriteOp;
use keel_store::request::{Datum, WriteKind, WriteRequest};
use keel_store::response::{OpResponse, PgErrorCode, ResponseStatus, TxnErrorCode};
use keel_store::session::StorageError;

fn insert_op() -> std::sync::Arc<WriteOp> {
    WriteOp::new(WriteRequest::new(
        100,
        WriteKind::Insert,
        vec![Datum::Int64(1), Datum::Int64(7), Datum::Text("pending".to_string())],
    ))
}

#[test]
fn write_caches_returning_rows_and_captures_rows_affected() -> Result<()> {
    let mut response = OpResponse::with_rows(Bytes::from_static(b"W1"));
    response.rows_affected_count = 3;
    let session = ScriptedSession::new(vec![Round::ok(vec![response])]);
    let op = WriteDocOp::with_flags(session, insert_op(), ExecFlags::default());

    assert_eq!(op.execute()?, RequestSent(true));
    assert_eq!(op.fetch()?, Some(Bytes::from_static(b"W1")));
    assert_eq!(op.rows_affected_count(), 3);
    assert_eq!(op.fetch()?, None, "writes are single-shot");
    assert!(op.end_of_result()?);
    Ok(())
}

#[test]
fn duplicate_key_surfaces_as_already_present_with_both_codes() {
    let mut response = OpResponse::error(ResponseStatus::DuplicateKey, "dup");
    response.pg_error_code = Some(PgErrorCode::UniqueViolation);
    response.txn_error_code = Some(TxnErrorCode::Conflict);
    let session = ScriptedSession::new(vec![Round::ok(vec![response])]);
    let op = WriteDocOp::with_flags(session, insert_op(), ExecFlags::default());

    op.execute().expect("dispatch succeeds");
    let err = op.fetch().expect_err("duplicate key fails the fetch");
    match &err {
        ExecError::AlreadyPresent { message, .. } => assert_eq!(message, "dup"),
        other => panic!("expected AlreadyPresent, got {other:?}"),
    }
    assert_eq!(err.pg_error_code(), Some(PgErrorCode::UniqueViolation));
    assert_eq!(err.txn_error_code(), Some(TxnErrorCode::Conflict));

    // The failure is sticky and no rows were affected.
    assert_eq!(op.end_of_result().expect_err("sticky"), err);
    assert_eq!(op.rows_affected_count(), 0);
}

#[test]
fn buffered_write_returns_immediately_with_nothing_in_flight() -> Result<()> {
    let session = ScriptedSession::buffering_writes();
    let op = WriteDocOp::with_flags(session.clone(), insert_op(), ExecFlags::default());

    assert_eq!(op.execute()?, RequestSent(false));
    assert_eq!(session.buffered_write_count(), 1);
    // The op neither completed nor failed: the batch flush happens through
    // the session's own channel, outside this op.
    assert!(!op.end_of_result()?);

    let metrics = op.metrics().snapshot();
    assert_eq!(metrics.writes_buffered, 1);
    assert_eq!(metrics.flushes_issued, 0);
    Ok(())
}

#[test]
fn refused_flush_surfaces_from_execute() {
    let session = ScriptedSession::new(vec![Round::dispatch_failure(StorageError::FlushFailed(
        "broken pipe".to_string(),
    ))]);
    let op = WriteDocOp::with_flags(session, insert_op(), ExecFlags::default());

    let err = op.execute().expect_err("refused flush fails execute");
    assert_eq!(
        err,
        ExecError::Storage(StorageError::FlushFailed("broken pipe".to_string()))
    );
}

#[test]
fn batch_failure_reaches_the_caller_via_fetch() {
    let session = ScriptedSession::new(vec![Round::failed(StorageError::Unavailable(
        "tablet moving".to_string(),
    ))]);
    let op = WriteDocOp::with_flags(session, insert_op(), ExecFlags::default());

    op.execute().expect("dispatch succeeds");
    let err = op.fetch().expect_err("batch failure fails the fetch");
    assert_eq!(
        err,
        ExecError::Storage(StorageError::Unavailable("tablet moving".to_string()))
    );
    assert_eq!(op.rows_affected_count(), 0);
}
