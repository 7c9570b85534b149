//! Shared helpers for doc-op integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;

use bytes::Bytes;
use keel_gate::ReadDocOp;
use keel_store::descriptor::TableDescriptor;
use keel_store::request::ReadRequest;
use keel_store::response::OpResponse;
use keel_store::session::{
    ApplyOutcome, FlushCallback, ReadTime, SessionHandle, SessionOp, StorageError, StorageSession,
};

/// One scripted flush round. Responses are matched positionally to the
/// operations applied for the round.
pub struct Round {
    responses: Vec<OpResponse>,
    flush_status: Result<(), StorageError>,
    /// Refuse the flush synchronously instead of completing it.
    fail_dispatch: Option<StorageError>,
    /// Park the completion thread until `ScriptedSession::release`.
    hold: bool,
}

impl Round {
    pub fn ok(responses: Vec<OpResponse>) -> Round {
        Round {
            responses,
            flush_status: Ok(()),
            fail_dispatch: None,
            hold: false,
        }
    }

    /// Completes with a batch-level failure (the callback receives the
    /// error; no per-op responses are installed).
    pub fn failed(error: StorageError) -> Round {
        Round {
            responses: Vec::new(),
            flush_status: Err(error),
            fail_dispatch: None,
            hold: false,
        }
    }

    /// `flush_async` itself returns the error; nothing goes in flight.
    pub fn dispatch_failure(error: StorageError) -> Round {
        Round {
            responses: Vec::new(),
            flush_status: Ok(()),
            fail_dispatch: Some(error),
            hold: false,
        }
    }

    /// Completes only after the test calls `release()`.
    pub fn held(responses: Vec<OpResponse>) -> Round {
        Round {
            responses,
            flush_status: Ok(()),
            fail_dispatch: None,
            hold: true,
        }
    }
}

#[derive(Default)]
struct Gate {
    released: Mutex<bool>,
    cv: Condvar,
}

impl Gate {
    fn wait_released(&self) {
        let mut released = self.released.lock().unwrap_or_else(PoisonError::into_inner);
        while !*released {
            released = self.cv.wait(released).unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn release(&self) {
        *self.released.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.cv.notify_all();
    }
}

#[derive(Default)]
struct ScriptState {
    rounds: VecDeque<Round>,
    batch: Vec<SessionOp>,
    batch_handle: u64,
    /// Read-request snapshots taken at apply time, one list per flushed
    /// round, so tests can assert on partition values, limits, and paging
    /// exactly as they were dispatched.
    applied_reads: Vec<Vec<ReadRequest>>,
    pending_reads: Vec<ReadRequest>,
    buffered_writes: usize,
}

/// A storage session driven entirely by a prearranged script. Flushes
/// complete on a spawned thread, mirroring a real session's I/O reactor.
pub struct ScriptedSession {
    state: Mutex<ScriptState>,
    gate: Arc<Gate>,
    buffer_writes: bool,
}

impl ScriptedSession {
    pub fn new(rounds: Vec<Round>) -> Arc<ScriptedSession> {
        Arc::new(ScriptedSession {
            state: Mutex::new(ScriptState {
                rounds: rounds.into(),
                ..ScriptState::default()
            }),
            gate: Arc::new(Gate::default()),
            buffer_writes: false,
        })
    }

    /// Session that buffers every write instead of flushing it.
    pub fn buffering_writes() -> Arc<ScriptedSession> {
        Arc::new(ScriptedSession {
            state: Mutex::new(ScriptState::default()),
            gate: Arc::new(Gate::default()),
            buffer_writes: true,
        })
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Let a held round complete.
    pub fn release(&self) {
        self.gate.release();
    }

    /// Read-request snapshots for every flushed round, in dispatch order.
    pub fn applied_reads(&self) -> Vec<Vec<ReadRequest>> {
        self.lock_state().applied_reads.clone()
    }

    pub fn buffered_write_count(&self) -> usize {
        self.lock_state().buffered_writes
    }
}

impl StorageSession for ScriptedSession {
    fn apply_async(
        &self,
        op: SessionOp,
        read_time: &mut ReadTime,
    ) -> Result<ApplyOutcome, StorageError> {
        let mut state = self.lock_state();
        read_time.set_if_unset(1);

        if self.buffer_writes {
            if matches!(op, SessionOp::Write(_)) {
                state.buffered_writes += 1;
                return Ok(ApplyOutcome {
                    buffered: true,
                    handle: SessionHandle(state.batch_handle),
                });
            }
        }

        if let SessionOp::Read(read_op) = &op {
            let snapshot = read_op.request_snapshot();
            state.pending_reads.push(snapshot);
        }
        state.batch.push(op);
        Ok(ApplyOutcome {
            buffered: false,
            handle: SessionHandle(state.batch_handle),
        })
    }

    fn flush_async(
        &self,
        handle: SessionHandle,
        callback: FlushCallback,
    ) -> Result<(), StorageError> {
        let (round, batch) = {
            let mut state = self.lock_state();
            assert_eq!(handle.0, state.batch_handle, "flush used a stale handle");
            let mut round = state
                .rounds
                .pop_front()
                .expect("script exhausted: flush arrived with no round left");
            if let Some(error) = round.fail_dispatch.take() {
                // Leave the batch in place, like a session that refused to
                // start the flush.
                return Err(error);
            }
            state.batch_handle += 1;
            let batch = std::mem::take(&mut state.batch);
            let applied = std::mem::take(&mut state.pending_reads);
            state.applied_reads.push(applied);
            (round, batch)
        };

        let gate = Arc::clone(&self.gate);
        thread::spawn(move || {
            if round.hold {
                gate.wait_released();
            }
            if round.flush_status.is_ok() {
                assert_eq!(
                    batch.len(),
                    round.responses.len(),
                    "script round has {} responses for {} applied ops",
                    round.responses.len(),
                    batch.len()
                );
                for (op, response) in batch.iter().zip(round.responses) {
                    match op {
                        SessionOp::Read(read_op) => read_op.set_response(response),
                        SessionOp::Write(write_op) => write_op.set_response(response),
                    }
                }
            }
            callback(round.flush_status);
        });
        Ok(())
    }
}

/// Two hash columns `(a, b)`, two key columns.
pub fn orders_table() -> Arc<TableDescriptor> {
    Arc::new(TableDescriptor::new(100, "orders", 2, 2, 1))
}

/// A table with no hash columns: no partition fan-out is possible.
pub fn events_table() -> Arc<TableDescriptor> {
    Arc::new(TableDescriptor::new(200, "events", 0, 1, 1))
}

/// Drive a scan to completion, collecting every rows blob in order.
pub fn collect_blobs(op: &ReadDocOp) -> anyhow::Result<Vec<Bytes>> {
    let mut blobs = Vec::new();
    while !op.end_of_result()? {
        if let Some(blob) = op.fetch()? {
            blobs.push(blob);
        }
    }
    Ok(blobs)
}
