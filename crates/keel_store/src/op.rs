//! Shared storage-operation slots.
//!
//! A `StorageOp` pairs a request with the response the session installs when
//! the flush completes. The gateway and the session hold the same `Arc`, so
//! the response written on the session's I/O thread is visible to the
//! gateway once the flush callback runs.

use std::sync::{Arc, Mutex, PoisonError};

use crate::request::{ReadRequest, WriteRequest};
use crate::response::OpResponse;

/// One storage operation shared between the gateway and its session.
#[derive(Debug)]
pub struct StorageOp<R> {
    inner: Mutex<OpInner<R>>,
}

#[derive(Debug)]
struct OpInner<R> {
    request: R,
    response: Option<OpResponse>,
}

/// A shared read operation; a read doc-op owns many of these at once.
pub type ReadOp = StorageOp<ReadRequest>;

/// A shared write operation; a write doc-op owns exactly one.
pub type WriteOp = StorageOp<WriteRequest>;

impl<R> StorageOp<R> {
    pub fn new(request: R) -> Arc<StorageOp<R>> {
        Arc::new(StorageOp {
            inner: Mutex::new(OpInner {
                request,
                response: None,
            }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, OpInner<R>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Read the request under the op's lock.
    pub fn with_request<T>(&self, f: impl FnOnce(&R) -> T) -> T {
        f(&self.lock().request)
    }

    /// Mutate the request under the op's lock. Callers must only do this
    /// while no flush is in flight for the op.
    pub fn with_request_mut<T>(&self, f: impl FnOnce(&mut R) -> T) -> T {
        f(&mut self.lock().request)
    }

    /// Install the response for the current round, replacing any prior one.
    /// Called by the session before it invokes the flush callback.
    pub fn set_response(&self, response: OpResponse) {
        self.lock().response = Some(response);
    }

    /// Take the response for the current round, leaving the slot empty for
    /// the next dispatch.
    pub fn take_response(&self) -> Option<OpResponse> {
        self.lock().response.take()
    }

    /// Whether the op has a response and that response succeeded.
    pub fn succeeded(&self) -> bool {
        self.lock()
            .response
            .as_ref()
            .map(OpResponse::succeeded)
            .unwrap_or(false)
    }
}

impl<R: Clone> StorageOp<R> {
    /// Snapshot the current request, e.g. for dispatch-time inspection.
    pub fn request_snapshot(&self) -> R {
        self.lock().request.clone()
    }
}
