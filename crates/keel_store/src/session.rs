//! The storage-session seam the gateway dispatches through.
//!
//! A session accumulates applied operations into a batch, then flushes the
//! batch asynchronously, invoking a completion callback exactly once from
//! its own I/O thread. The gateway owns the pacing: at most one flush is in
//! flight per doc-op at any time.

use std::sync::Arc;

use thiserror::Error;

use crate::op::{ReadOp, WriteOp};

/// Transport-level failure from the storage session. Cloneable because the
/// gateway keeps the first failure sticky and returns it repeatedly.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("storage session rejected apply: {0}")]
    ApplyRejected(String),
    #[error("storage flush failed: {0}")]
    FlushFailed(String),
    #[error("tablet server unavailable: {0}")]
    Unavailable(String),
}

/// Read-time selection handle, threaded through `apply_async` by mutable
/// reference so the session can pin the statement's read point on the first
/// request and reuse it for every subsequent one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadTime(Option<u64>);

impl ReadTime {
    pub fn unset() -> ReadTime {
        ReadTime(None)
    }

    pub fn is_set(&self) -> bool {
        self.0.is_some()
    }

    pub fn get(&self) -> Option<u64> {
        self.0
    }

    /// Pin the read point if it has not been chosen yet.
    pub fn set_if_unset(&mut self, read_point: u64) {
        if self.0.is_none() {
            self.0 = Some(read_point);
        }
    }
}

/// Identifies the session batch that applied operations landed on. All
/// operations applied for one dispatch share a handle, and the handle is
/// what gets flushed. Short-lived: holding one does not keep the session
/// alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionHandle(pub u64);

/// Outcome of applying one operation to the session.
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    /// True when the session deferred the op into its statement-local write
    /// buffer instead of the batch. Only writes may be buffered.
    pub buffered: bool,
    pub handle: SessionHandle,
}

/// One operation handed to the session for dispatch.
#[derive(Debug, Clone)]
pub enum SessionOp {
    Read(Arc<ReadOp>),
    Write(Arc<WriteOp>),
}

/// Completion callback for an asynchronous flush. Invoked exactly once; may
/// run on the session's I/O thread, so it must own everything it touches.
pub type FlushCallback = Box<dyn FnOnce(Result<(), StorageError>) + Send + 'static>;

/// Abstract tablet-storage session.
///
/// Implementations own batching, routing, and the I/O threads that complete
/// flushes. The gateway borrows a session per dispatch and never holds one
/// beyond the statement.
pub trait StorageSession: Send + Sync {
    /// Queue one operation for the next flush. May mark writes as buffered;
    /// reads must never be buffered.
    fn apply_async(
        &self,
        op: SessionOp,
        read_time: &mut ReadTime,
    ) -> Result<ApplyOutcome, StorageError>;

    /// Schedule every operation applied on `handle` for network dispatch.
    /// `callback` fires exactly once when the whole batch completes, after
    /// each op's response has been installed.
    fn flush_async(&self, handle: SessionHandle, callback: FlushCallback)
        -> Result<(), StorageError>;
}
