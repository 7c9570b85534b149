//! Cancellation: aborting an op must not race its in-flight response.

mod common;

use std::thread;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use common::{events_table, Round, ScriptedSession};
use keel_gate::{ExecError, ExecFlags, ReadDocOp};
use keel_store::response::OpResponse;

#[test]
fn abort_waits_for_the_in_flight_response_and_discards_its_rows() -> Result<()> {
    let session = ScriptedSession::new(vec![Round::held(vec![OpResponse::with_rows(
        Bytes::from_static(b"late rows"),
    )])]);
    let op = ReadDocOp::with_flags(session.clone(), events_table(), ExecFlags::default());

    op.execute()?;

    // Release the parked completion only after the abort is underway, so the
    // abort provably waits out the callback instead of racing it.
    let releaser = {
        let session = session.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            session.release();
        })
    };
    op.abort_and_wait();
    releaser.join().expect("releaser thread");

    // The callback observed the cancellation: rows were discarded and the
    // op terminated cleanly.
    assert!(op.end_of_result()?, "no data may remain after cancellation");
    assert!(matches!(
        op.fetch().expect_err("fetch after abort"),
        ExecError::IllegalState(_)
    ));
    assert!(matches!(
        op.execute().expect_err("execute after abort"),
        ExecError::IllegalState(_)
    ));

    // Idempotent: nothing is in flight anymore, so this returns at once.
    op.abort_and_wait();
    assert_eq!(op.metrics().snapshot().ops_canceled, 1);
    Ok(())
}

#[test]
fn abort_before_execute_blocks_all_entry_points() {
    let session = ScriptedSession::new(Vec::new());
    let op = ReadDocOp::with_flags(session, events_table(), ExecFlags::default());

    op.abort_and_wait();
    assert!(matches!(
        op.execute().expect_err("execute after abort"),
        ExecError::IllegalState(_)
    ));
    assert!(matches!(
        op.fetch().expect_err("fetch after abort"),
        ExecError::IllegalState(_)
    ));
}
