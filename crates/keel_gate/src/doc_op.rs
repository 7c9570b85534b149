//! Document operations: the execution objects behind SQL statements.
//!
//! One doc-op per statement. `execute()` dispatches the first storage
//! request asynchronously; each `fetch()` drains one cached rows blob and
//! refills the pipeline so the next response overlaps with the caller's row
//! processing. Read ops unroll hash-equality predicates into one sub-request
//! per partition permutation and track each sub-request's paging
//! continuation independently; write ops are single-shot.
//!
//! Each op is a small state machine guarded by one mutex and one condvar.
//! The statement layer is the consumer thread; the storage session completes
//! flushes from its own I/O thread. The two only meet through the op lock.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tracing::{debug, warn};

use keel_store::descriptor::TableDescriptor;
use keel_store::op::{ReadOp, WriteOp};
use keel_store::request::{Datum, Expression, ReadRequest, RowMarkType};
use keel_store::response::{OpResponse, ResponseStatus};
use keel_store::session::{ReadTime, SessionOp, StorageError, StorageSession};

use crate::error::{ExecError, ExecResult};
use crate::flags::ExecFlags;
use crate::metrics::ExecMetrics;

/// Whether `execute()` left a storage request in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestSent(pub bool);

/// Caller-provided execution parameters, overwritten per statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecParams {
    /// SQL `LIMIT`, or 0 when absent.
    pub limit_count: u64,
    /// SQL `OFFSET`, or 0 when absent.
    pub limit_offset: u64,
    /// Ignore the SQL limits and size requests from the system prefetch cap.
    pub limit_use_default: bool,
    /// Row-locking mode tag; negative means none.
    pub rowmark: i32,
}

impl ExecParams {
    /// Statement defaults: system prefetch sizing, no SQL limit, no row mark.
    pub fn statement_defaults(flags: &ExecFlags) -> ExecParams {
        ExecParams {
            limit_count: flags.prefetch_limit,
            limit_offset: 0,
            limit_use_default: true,
            rowmark: -1,
        }
    }
}

/// State shared by every doc-op flavor, guarded by the op mutex.
pub struct CoreState {
    exec_params: ExecParams,
    /// Ordered rows blobs not yet handed to the caller.
    result_cache: VecDeque<Bytes>,
    has_cached_data: bool,
    end_of_data: bool,
    waiting_for_response: bool,
    is_canceled: bool,
    /// Most recent execution failure, sticky once set.
    exec_status: ExecResult<()>,
    read_time: ReadTime,
}

impl CoreState {
    fn new(exec_params: ExecParams) -> CoreState {
        CoreState {
            exec_params,
            result_cache: VecDeque::new(),
            has_cached_data: false,
            end_of_data: false,
            waiting_for_response: false,
            is_canceled: false,
            exec_status: Ok(()),
            read_time: ReadTime::unset(),
        }
    }

    /// Append one rows blob; empty blobs are skipped. Returns whether the
    /// blob was cached.
    fn write_to_cache(&mut self, rows_data: Bytes) -> bool {
        if rows_data.is_empty() {
            return false;
        }
        self.result_cache.push_back(rows_data);
        self.has_cached_data = true;
        true
    }

    fn read_from_cache(&mut self) -> Option<Bytes> {
        let blob = self.result_cache.pop_front();
        self.has_cached_data = !self.result_cache.is_empty();
        blob
    }
}

/// Mutex-guarded interior of a doc-op: shared lifecycle state plus the
/// flavor-specific driver.
pub struct Inner<D> {
    core: CoreState,
    driver: D,
}

struct OpShared<D: OpDriver> {
    inner: Mutex<Inner<D>>,
    cv: Condvar,
    session: Arc<dyn StorageSession>,
    flags: ExecFlags,
    metrics: Arc<ExecMetrics>,
}

/// A document operation. Cheap to clone; clones share the same op. The
/// flush callback captures a clone, so an op always outlives its in-flight
/// response even if the statement layer drops its handle.
pub struct DocOp<D: OpDriver> {
    shared: Arc<OpShared<D>>,
}

impl<D: OpDriver> Clone for DocOp<D> {
    fn clone(&self) -> Self {
        DocOp {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Scan execution: prefetch sizing, row-mark, partition fan-out, paging.
pub type ReadDocOp = DocOp<ReadDriver>;

/// Single write dispatch with buffered-write bypass.
pub type WriteDocOp = DocOp<WriteDriver>;

/// Reserved composition of multiple ops under one lifecycle.
pub type CompoundDocOp = DocOp<CompoundDriver>;

/// Flavor seam: how a doc-op builds, dispatches, and folds in its storage
/// requests. Implementations run under the op lock.
pub trait OpDriver: Send + Sized + 'static {
    /// Re-arm per-execute driver state.
    fn reset(&mut self, core: &mut CoreState);
    /// Build and dispatch the next round of storage requests.
    fn send_request(op: &DocOp<Self>, inner: &mut Inner<Self>) -> ExecResult<()>;
    /// Fold one batched flush completion into op state.
    fn on_response(op: &DocOp<Self>, inner: &mut Inner<Self>, status: Result<(), StorageError>);
}

impl<D: OpDriver> DocOp<D> {
    fn build(session: Arc<dyn StorageSession>, flags: ExecFlags, driver: D) -> DocOp<D> {
        let exec_params = ExecParams::statement_defaults(&flags);
        DocOp {
            shared: Arc::new(OpShared {
                inner: Mutex::new(Inner {
                    core: CoreState::new(exec_params),
                    driver,
                }),
                cv: Condvar::new(),
                session,
                flags,
                metrics: Arc::new(ExecMetrics::default()),
            }),
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner<D>> {
        // Recover from poisoning: the op must stay drivable (in particular
        // abort_and_wait) even if a caller panicked mid-fetch.
        self.shared.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, Inner<D>>) -> MutexGuard<'a, Inner<D>> {
        self.shared.cv.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }

    /// Dispatch-behavior counters for this op.
    pub fn metrics(&self) -> Arc<ExecMetrics> {
        Arc::clone(&self.shared.metrics)
    }

    /// Overwrite the execution parameters. `None` retains the prior ones.
    pub fn set_exec_params(&self, params: Option<&ExecParams>) {
        if let Some(params) = params {
            self.lock_inner().core.exec_params = params.clone();
        }
    }

    /// Start the statement: reset result state and dispatch the first
    /// storage request asynchronously. Never blocks.
    pub fn execute(&self) -> ExecResult<RequestSent> {
        let mut inner = self.lock_inner();
        if inner.core.is_canceled {
            return Err(ExecError::IllegalState("operation canceled".to_string()));
        }

        // The storage layer keeps no execution state for a statement between
        // round trips, so the convention here is exec-and-fetch per round
        // rather than one exec followed by plain fetches.
        inner = self.init_locked(inner);

        D::send_request(self, &mut inner)?;
        Ok(RequestSent(inner.core.waiting_for_response))
    }

    fn init_locked<'a>(&self, mut inner: MutexGuard<'a, Inner<D>>) -> MutexGuard<'a, Inner<D>> {
        if inner.core.waiting_for_response {
            // Not supposed to happen; drain the stray response rather than
            // racing it.
            warn!("execute entered while a response is in flight; draining it first");
            while inner.core.waiting_for_response {
                inner = self.wait(inner);
            }
        }
        inner.core.result_cache.clear();
        inner.core.end_of_data = false;
        inner.core.has_cached_data = false;
        let Inner { core, driver } = &mut *inner;
        driver.reset(core);
        inner
    }

    /// Take the next cached rows blob, blocking until one is available or
    /// the scan completes. Returns `None` at end of data. Before returning,
    /// refills the pipeline so the next response overlaps with the caller's
    /// row-consumption phase.
    pub fn fetch(&self) -> ExecResult<Option<Bytes>> {
        let mut inner = self.lock_inner();
        if inner.core.is_canceled {
            return Err(ExecError::IllegalState("operation canceled".to_string()));
        }
        inner.core.exec_status.clone()?;

        self.send_request_if_needed(&mut inner)?;

        while !inner.core.has_cached_data && !inner.core.end_of_data {
            inner = self.wait(inner);
        }
        inner.core.exec_status.clone()?;

        let blob = inner.core.read_from_cache();
        self.send_request_if_needed(&mut inner)?;
        Ok(blob)
    }

    /// Whether the statement has delivered everything. Any sticky failure is
    /// returned first.
    pub fn end_of_result(&self) -> ExecResult<bool> {
        let inner = self.lock_inner();
        inner.core.exec_status.clone()?;
        Ok(!inner.core.has_cached_data && inner.core.end_of_data)
    }

    /// Cancel the op and block until any in-flight response has completed
    /// its callback. Idempotent. The callback observes the cancellation and
    /// discards rows received after it.
    pub fn abort_and_wait(&self) {
        let mut inner = self.lock_inner();
        if !inner.core.is_canceled {
            inner.core.is_canceled = true;
            self.shared.metrics.record_cancel();
        }
        self.shared.cv.notify_all();
        while inner.core.waiting_for_response {
            inner = self.wait(inner);
        }
    }

    /// Dispatch the next round when more rows are needed and nothing is
    /// cached or in flight.
    fn send_request_if_needed(&self, inner: &mut Inner<D>) -> ExecResult<()> {
        if !inner.core.has_cached_data && !inner.core.end_of_data && !inner.core.waiting_for_response
        {
            return D::send_request(self, inner);
        }
        Ok(())
    }

    /// Flush-completion entry point; runs on the session's I/O thread.
    fn receive_response(&self, status: Result<(), StorageError>) {
        let mut inner = self.lock_inner();
        debug_assert!(
            inner.core.waiting_for_response,
            "flush completion arrived with no request in flight"
        );
        inner.core.waiting_for_response = false;
        self.shared.cv.notify_all();
        self.shared.metrics.record_response_batch();
        D::on_response(self, &mut inner, status);
    }
}

fn missing_response() -> OpResponse {
    OpResponse::error(
        ResponseStatus::RuntimeError,
        "storage session completed a flush without installing a response",
    )
}

// ---------------------------------------------------------------------------
// Read flavor.

/// Driver state for scans.
pub struct ReadDriver {
    table: Arc<TableDescriptor>,
    /// Prepared read descriptor; cloned to produce each sub-request.
    template: ReadRequest,
    /// Per hash column, the equality operands to permute over. Built lazily
    /// on the first unroll; the operand lists never change after binding.
    partition_exprs: Vec<Vec<Expression>>,
    /// Position in the lexicographic enumeration of partition permutations.
    next_op_idx: usize,
    can_produce_more_ops: bool,
    /// Sub-requests currently holding paging state.
    read_ops: Vec<Arc<ReadOp>>,
}

impl ReadDriver {
    fn new(table: Arc<TableDescriptor>) -> ReadDriver {
        let template = table.new_select();
        ReadDriver {
            table,
            template,
            partition_exprs: Vec::new(),
            next_op_idx: 0,
            can_produce_more_ops: true,
            read_ops: Vec::new(),
        }
    }

    /// Cap the rows a single sub-request may return. The SQL limit counts
    /// offset rows too, because the layer above discards them after the
    /// fact; the cap only bounds what storage may send per request.
    fn set_request_prefetch_limit(&mut self, exec_params: &ExecParams, flags: &ExecFlags) {
        let mut predicted = flags.prefetch_limit;
        if !self.template.is_forward_scan {
            // Backward scans are slower, so predict a smaller batch.
            predicted = (predicted as f64 * flags.backward_prefetch_scale_factor) as u64;
        }
        // The system cap must be at least 1; the statement LIMIT can be
        // anything SQL semantics allow.
        predicted = predicted.max(1);

        let requested = exec_params.limit_count.saturating_add(exec_params.limit_offset);
        let limit = if exec_params.limit_use_default || requested > predicted {
            predicted
        } else {
            requested
        };
        self.template.limit = Some(limit);
    }

    fn set_row_mark(&mut self, exec_params: &ExecParams) {
        self.template.row_mark_type = RowMarkType::from_raw(exec_params.rowmark);
    }

    /// Unroll up to `count` further partition permutations into fresh
    /// sub-requests appended to the live set.
    fn initialize_next_ops(&mut self, mut count: usize) {
        if count == 0 {
            return;
        }

        if self.template.partition_column_values.is_empty() {
            // No partition fan-out possible: one copy of the template.
            self.read_ops.push(ReadOp::new(self.template.clone()));
            self.can_produce_more_ops = false;
            return;
        }

        let num_hash_cols = self.template.partition_column_values.len();
        debug_assert_eq!(
            num_hash_cols,
            self.table.num_hash_key_columns(),
            "partition slots must cover every hash column"
        );

        if self.partition_exprs.is_empty() {
            self.partition_exprs = self
                .template
                .partition_column_values
                .iter()
                .map(|slot| match slot {
                    // An IN predicate keeps its candidate values in the
                    // condition's second operand.
                    Expression::Condition(cond) => match cond.operands.get(1) {
                        Some(Expression::Condition(list)) => list.operands.clone(),
                        _ => {
                            warn!("partition condition is missing its operand list; treating it as a single value");
                            vec![slot.clone()]
                        }
                    },
                    single => vec![single.clone()],
                })
                .collect();
        }

        let total: usize = self.partition_exprs.iter().map(Vec::len).product();
        while count > 0 && self.next_op_idx < total {
            let mut request = self.template.clone();
            request.partition_column_values =
                vec![Expression::Value(Datum::Null); num_hash_cols];

            // Mixed-radix decomposition of the permutation index. The last
            // hash column is the least-significant digit, so permutations
            // enumerate lexicographically over leading columns.
            let mut pos = self.next_op_idx;
            for col in (0..num_hash_cols).rev() {
                let choices = &self.partition_exprs[col];
                request.partition_column_values[col] = choices[pos % choices.len()].clone();
                pos /= choices.len();
            }

            self.read_ops.push(ReadOp::new(request));
            self.next_op_idx += 1;
            count -= 1;
        }

        if self.next_op_idx == total {
            self.can_produce_more_ops = false;
        }
        debug_assert!(
            !self.read_ops.is_empty(),
            "unrolling must produce at least one sub-request"
        );
    }
}

impl OpDriver for ReadDriver {
    fn reset(&mut self, _core: &mut CoreState) {
        self.template.return_paging_state = true;
        self.partition_exprs.clear();
        self.next_op_idx = 0;
        self.can_produce_more_ops = true;
        self.read_ops.clear();
    }

    fn send_request(op: &DocOp<Self>, inner: &mut Inner<Self>) -> ExecResult<()> {
        let Inner { core, driver } = inner;
        debug_assert!(!core.waiting_for_response, "dispatch with a response in flight");

        // Sizing and row-mark land on the template, so they apply to every
        // clone produced below.
        driver.set_request_prefetch_limit(&core.exec_params, &op.shared.flags);
        driver.set_row_mark(&core.exec_params);

        debug_assert!(
            !driver.read_ops.is_empty() || driver.can_produce_more_ops,
            "nothing left to dispatch"
        );
        if driver.can_produce_more_ops {
            let budget = op.shared.flags.request_limit.saturating_sub(driver.read_ops.len());
            driver.initialize_next_ops(budget);
        }

        let mut shared_handle = None;
        for read_op in &driver.read_ops {
            let outcome = op
                .shared
                .session
                .apply_async(SessionOp::Read(Arc::clone(read_op)), &mut core.read_time)?;
            if outcome.buffered {
                return Err(ExecError::IllegalState(
                    "read operation must not be buffered".to_string(),
                ));
            }
            // All unrolled operations land on the same session batch.
            shared_handle = Some(outcome.handle);
        }
        let Some(handle) = shared_handle else {
            return Err(ExecError::IllegalState(
                "read dispatch produced no sub-requests".to_string(),
            ));
        };
        op.shared.metrics.record_sub_requests(driver.read_ops.len() as u64);
        debug!(sub_requests = driver.read_ops.len(), "dispatching read batch");

        core.waiting_for_response = true;
        let this = op.clone();
        let result = op
            .shared
            .session
            .flush_async(handle, Box::new(move |status| this.receive_response(status)));
        if let Err(err) = result {
            core.waiting_for_response = false;
            return Err(err.into());
        }
        op.shared.metrics.record_flush();
        Ok(())
    }

    fn on_response(op: &DocOp<Self>, inner: &mut Inner<Self>, status: Result<(), StorageError>) {
        let Inner { core, driver } = inner;
        core.exec_status = status.map_err(ExecError::from);

        let mut completed: Vec<(Arc<ReadOp>, OpResponse)> = Vec::new();
        if core.exec_status.is_ok() {
            completed.reserve(driver.read_ops.len());
            for read_op in driver.read_ops.drain(..) {
                let response = read_op.take_response().unwrap_or_else(missing_response);
                if let Some(err) = ExecError::from_failed_response(&response) {
                    core.exec_status = Err(err);
                }
                completed.push((read_op, response));
            }
        }

        // A sub-request failure aborts the whole read; no partial success.
        if core.exec_status.is_err() {
            core.end_of_data = true;
            return;
        }
        if core.is_canceled {
            // Rows received after cancellation are discarded.
            core.end_of_data = true;
            return;
        }

        for (_, response) in &completed {
            if core.write_to_cache(response.rows_data.clone()) {
                op.shared.metrics.record_rows_blob();
            }
        }

        // Survivors carry their continuation into the next round; drained
        // sub-requests leave the live set.
        for (read_op, response) in completed {
            let Some(paging_state) = response.paging_state else {
                continue;
            };
            debug!(token = %hex::encode(&paging_state.token), "installing scan continuation");
            read_op.with_request_mut(|request| {
                // A request can nest via index_request; the continuation
                // belongs to the innermost read, which runs first and feeds
                // the ones above it.
                request.innermost_request_mut().paging_state = Some(paging_state);
                // The catalog check already ran on the statement's first
                // request; continuations skip it so long scans survive
                // unrelated DDL.
                request.catalog_version = None;
            });
            driver.read_ops.push(read_op);
        }

        core.end_of_data = driver.read_ops.is_empty() && !driver.can_produce_more_ops;
    }
}

impl DocOp<ReadDriver> {
    /// Scan op over `table`, with tunables read from the environment.
    pub fn new(session: Arc<dyn StorageSession>, table: Arc<TableDescriptor>) -> ReadDocOp {
        Self::with_flags(session, table, ExecFlags::from_env())
    }

    pub fn with_flags(
        session: Arc<dyn StorageSession>,
        table: Arc<TableDescriptor>,
        flags: ExecFlags,
    ) -> ReadDocOp {
        DocOp::build(session, flags, ReadDriver::new(table))
    }

    /// Mutate the scan template, e.g. to bind predicates before `execute`.
    pub fn with_template<T>(&self, f: impl FnOnce(&mut ReadRequest) -> T) -> T {
        f(&mut self.lock_inner().driver.template)
    }
}

// ---------------------------------------------------------------------------
// Write flavor.

/// Driver state for single-shot writes.
pub struct WriteDriver {
    write_op: Arc<WriteOp>,
    rows_affected_count: u64,
}

impl OpDriver for WriteDriver {
    fn reset(&mut self, _core: &mut CoreState) {
        self.rows_affected_count = 0;
    }

    fn send_request(op: &DocOp<Self>, inner: &mut Inner<Self>) -> ExecResult<()> {
        let Inner { core, driver } = inner;
        debug_assert!(!core.waiting_for_response, "dispatch with a response in flight");

        let outcome = op
            .shared
            .session
            .apply_async(SessionOp::Write(Arc::clone(&driver.write_op)), &mut core.read_time)?;
        op.shared.metrics.record_sub_requests(1);
        if outcome.buffered {
            // Deferred into the session's statement-local buffer; the batch
            // flush is driven elsewhere, so nothing is in flight here.
            op.shared.metrics.record_write_buffered();
            debug!("write deferred into the session buffer");
            return Ok(());
        }

        core.waiting_for_response = true;
        let this = op.clone();
        let result = op
            .shared
            .session
            .flush_async(outcome.handle, Box::new(move |status| this.receive_response(status)));
        if let Err(err) = result {
            core.waiting_for_response = false;
            return Err(err.into());
        }
        op.shared.metrics.record_flush();
        debug!("sent write request");
        Ok(())
    }

    fn on_response(op: &DocOp<Self>, inner: &mut Inner<Self>, status: Result<(), StorageError>) {
        let Inner { core, driver } = inner;
        core.exec_status = status.map_err(ExecError::from);

        let mut response = None;
        if core.exec_status.is_ok() {
            let taken = driver.write_op.take_response().unwrap_or_else(missing_response);
            if let Some(err) = ExecError::from_failed_response(&taken) {
                core.exec_status = Err(err);
            }
            response = Some(taken);
        }

        if !core.is_canceled && core.exec_status.is_ok() {
            if let Some(response) = response {
                if core.write_to_cache(response.rows_data.clone()) {
                    op.shared.metrics.record_rows_blob();
                }
                driver.rows_affected_count = response.rows_affected_count;
            }
        }

        // Writes are single-shot.
        core.end_of_data = true;
        debug!("received write response");
    }
}

impl DocOp<WriteDriver> {
    /// Write op around a prepared write operation.
    pub fn new(session: Arc<dyn StorageSession>, write_op: Arc<WriteOp>) -> WriteDocOp {
        Self::with_flags(session, write_op, ExecFlags::from_env())
    }

    pub fn with_flags(
        session: Arc<dyn StorageSession>,
        write_op: Arc<WriteOp>,
        flags: ExecFlags,
    ) -> WriteDocOp {
        DocOp::build(
            session,
            flags,
            WriteDriver {
                write_op,
                rows_affected_count: 0,
            },
        )
    }

    /// Rows affected by the write, valid once the response has arrived.
    pub fn rows_affected_count(&self) -> u64 {
        self.lock_inner().driver.rows_affected_count
    }
}

// ---------------------------------------------------------------------------
// Compound flavor.

/// Reserved: groups multiple ops under one lifecycle. Only construction is
/// defined today; executing a compound op completes with no data.
pub struct CompoundDriver {
    #[allow(dead_code)]
    ops: Vec<Box<dyn DocOpHandle>>,
}

impl OpDriver for CompoundDriver {
    fn reset(&mut self, _core: &mut CoreState) {}

    fn send_request(_op: &DocOp<Self>, inner: &mut Inner<Self>) -> ExecResult<()> {
        inner.core.end_of_data = true;
        Ok(())
    }

    fn on_response(_op: &DocOp<Self>, _inner: &mut Inner<Self>, _status: Result<(), StorageError>) {}
}

impl DocOp<CompoundDriver> {
    pub fn new(session: Arc<dyn StorageSession>, ops: Vec<Box<dyn DocOpHandle>>) -> CompoundDocOp {
        DocOp::build(session, ExecFlags::from_env(), CompoundDriver { ops })
    }
}

// ---------------------------------------------------------------------------
// Type-erased handle.

/// Object-safe view of a doc-op, so the statement layer can drive reads,
/// writes, and compounds uniformly.
pub trait DocOpHandle: Send + Sync {
    fn set_exec_params(&self, params: Option<&ExecParams>);
    fn execute(&self) -> ExecResult<RequestSent>;
    fn fetch(&self) -> ExecResult<Option<Bytes>>;
    fn end_of_result(&self) -> ExecResult<bool>;
    fn abort_and_wait(&self);
}

impl<D: OpDriver> DocOpHandle for DocOp<D> {
    fn set_exec_params(&self, params: Option<&ExecParams>) {
        DocOp::set_exec_params(self, params);
    }

    fn execute(&self) -> ExecResult<RequestSent> {
        DocOp::execute(self)
    }

    fn fetch(&self) -> ExecResult<Option<Bytes>> {
        DocOp::fetch(self)
    }

    fn end_of_result(&self) -> ExecResult<bool> {
        DocOp::end_of_result(self)
    }

    fn abort_and_wait(&self) {
        DocOp::abort_and_wait(self);
    }
}
