//! In-memory tablet store and session.
//!
//! An executable stand-in for the tablet layer: hash-partitioned tables held
//! in memory, offset-token paging, catalog-version checks, and a
//! `StorageSession` whose flushes complete on a spawned thread. Integration
//! tests and the workload driver run against this instead of a cluster.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tracing::{debug, warn};

use crate::descriptor::TableDescriptor;
use crate::op::WriteOp;
use crate::request::{Datum, Expression, PagingState, ReadRequest, TableId, WriteKind, WriteRequest};
use crate::response::{OpResponse, PgErrorCode, ResponseStatus};
use crate::session::{
    ApplyOutcome, FlushCallback, ReadTime, SessionHandle, SessionOp, StorageError, StorageSession,
};

const ROW_TAG_NULL: u8 = 0x00;
const ROW_TAG_BOOL: u8 = 0x01;
const ROW_TAG_INT32: u8 = 0x02;
const ROW_TAG_INT64: u8 = 0x03;
const ROW_TAG_DOUBLE: u8 = 0x04;
const ROW_TAG_TEXT: u8 = 0x05;
const ROW_TAG_BINARY: u8 = 0x06;

/// Raised when a rows blob does not parse back into rows.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("malformed row blob: {0}")]
pub struct RowCodecError(pub String);

/// Encode rows into the tagged, length-prefixed blob format carried in
/// `OpResponse::rows_data`.
pub fn encode_rows(rows: &[Vec<Datum>]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u32(rows.len() as u32);
    for row in rows {
        buf.put_u16(row.len() as u16);
        for datum in row {
            match datum {
                Datum::Null => buf.put_u8(ROW_TAG_NULL),
                Datum::Bool(v) => {
                    buf.put_u8(ROW_TAG_BOOL);
                    buf.put_u8(u8::from(*v));
                }
                Datum::Int32(v) => {
                    buf.put_u8(ROW_TAG_INT32);
                    buf.put_i32(*v);
                }
                Datum::Int64(v) => {
                    buf.put_u8(ROW_TAG_INT64);
                    buf.put_i64(*v);
                }
                Datum::Double(v) => {
                    buf.put_u8(ROW_TAG_DOUBLE);
                    buf.put_f64(*v);
                }
                Datum::Text(v) => {
                    buf.put_u8(ROW_TAG_TEXT);
                    buf.put_u32(v.len() as u32);
                    buf.put_slice(v.as_bytes());
                }
                Datum::Binary(v) => {
                    buf.put_u8(ROW_TAG_BINARY);
                    buf.put_u32(v.len() as u32);
                    buf.put_slice(v);
                }
            }
        }
    }
    buf.freeze()
}

/// Decode a rows blob produced by [`encode_rows`].
pub fn decode_rows(mut blob: &[u8]) -> Result<Vec<Vec<Datum>>, RowCodecError> {
    fn need(blob: &[u8], len: usize, what: &str) -> Result<(), RowCodecError> {
        if blob.len() < len {
            return Err(RowCodecError(format!("truncated while reading {what}")));
        }
        Ok(())
    }

    need(blob, 4, "row count")?;
    let row_count = blob.get_u32() as usize;
    let mut rows = Vec::with_capacity(row_count);
    for _ in 0..row_count {
        need(blob, 2, "column count")?;
        let col_count = blob.get_u16() as usize;
        let mut row = Vec::with_capacity(col_count);
        for _ in 0..col_count {
            need(blob, 1, "datum tag")?;
            let tag = blob.get_u8();
            let datum = match tag {
                ROW_TAG_NULL => Datum::Null,
                ROW_TAG_BOOL => {
                    need(blob, 1, "bool")?;
                    Datum::Bool(blob.get_u8() != 0)
                }
                ROW_TAG_INT32 => {
                    need(blob, 4, "int32")?;
                    Datum::Int32(blob.get_i32())
                }
                ROW_TAG_INT64 => {
                    need(blob, 8, "int64")?;
                    Datum::Int64(blob.get_i64())
                }
                ROW_TAG_DOUBLE => {
                    need(blob, 8, "double")?;
                    Datum::Double(blob.get_f64())
                }
                ROW_TAG_TEXT | ROW_TAG_BINARY => {
                    need(blob, 4, "payload length")?;
                    let len = blob.get_u32() as usize;
                    need(blob, len, "payload")?;
                    let payload = blob[..len].to_vec();
                    blob.advance(len);
                    if tag == ROW_TAG_TEXT {
                        let text = String::from_utf8(payload)
                            .map_err(|err| RowCodecError(err.to_string()))?;
                        Datum::Text(text)
                    } else {
                        Datum::Binary(payload)
                    }
                }
                other => return Err(RowCodecError(format!("unknown datum tag {other:#04x}"))),
            };
            row.push(datum);
        }
        rows.push(row);
    }
    Ok(rows)
}

fn encode_offset_token(offset: u64) -> PagingState {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u64(offset);
    PagingState::new(buf.freeze())
}

fn decode_offset_token(state: &PagingState) -> Result<u64, RowCodecError> {
    if state.token.len() != 8 {
        return Err(RowCodecError(format!(
            "paging token must be 8 bytes, got {}",
            state.token.len()
        )));
    }
    let mut slice = &state.token[..];
    Ok(slice.get_u64())
}

#[derive(Debug)]
struct MemTable {
    name: String,
    num_hash_key_columns: usize,
    primary_key_len: usize,
    rows: Vec<Vec<Datum>>,
}

/// Process-local tablet data plane shared by every session.
#[derive(Debug)]
pub struct MemTabletStore {
    tables: RwLock<HashMap<TableId, MemTable>>,
    catalog_version: AtomicU64,
}

impl MemTabletStore {
    pub fn new() -> Arc<MemTabletStore> {
        Arc::new(MemTabletStore {
            tables: RwLock::new(HashMap::new()),
            catalog_version: AtomicU64::new(1),
        })
    }

    /// Register a table matching `descriptor`. The descriptor's key arity
    /// doubles as the uniqueness prefix for inserts.
    pub fn create_table(&self, descriptor: &TableDescriptor) {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        tables.insert(
            descriptor.table_id(),
            MemTable {
                name: descriptor.table_name().to_string(),
                num_hash_key_columns: descriptor.num_hash_key_columns(),
                primary_key_len: descriptor.num_key_columns(),
                rows: Vec::new(),
            },
        );
    }

    /// Bulk-load rows without uniqueness checks, for test seeding.
    pub fn seed_rows(&self, table_id: TableId, rows: impl IntoIterator<Item = Vec<Datum>>) {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(table) = tables.get_mut(&table_id) {
            table.rows.extend(rows);
        }
    }

    pub fn row_count(&self, table_id: TableId) -> usize {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        tables.get(&table_id).map(|t| t.rows.len()).unwrap_or(0)
    }

    pub fn catalog_version(&self) -> u64 {
        self.catalog_version.load(Ordering::Acquire)
    }

    /// Simulate a DDL: any request still carrying the old version fails its
    /// schema check, while continuations (which carry none) keep going.
    pub fn bump_catalog_version(&self) -> u64 {
        self.catalog_version.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn check_catalog_version(&self, tagged: Option<u64>) -> Option<OpResponse> {
        let tagged = tagged?;
        let current = self.catalog_version();
        if tagged != current {
            return Some(OpResponse::error(
                ResponseStatus::SchemaVersionMismatch,
                format!("catalog version mismatch: request has {tagged}, cluster has {current}"),
            ));
        }
        None
    }

    fn execute_read(&self, request: &ReadRequest) -> OpResponse {
        if let Some(resp) = self.check_catalog_version(request.catalog_version) {
            return resp;
        }

        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        let Some(table) = tables.get(&request.table_id) else {
            return OpResponse::error(
                ResponseStatus::RuntimeError,
                format!("table {} does not exist", request.table_id),
            );
        };

        // Partition predicates must arrive fully unrolled: one bound value
        // per hash column, or none at all for an unpinned scan.
        let mut bound: Vec<&Datum> = Vec::with_capacity(request.partition_column_values.len());
        for slot in &request.partition_column_values {
            match slot {
                Expression::Value(datum) => bound.push(datum),
                other => {
                    warn!(?other, "read request carries an unresolved partition predicate");
                    return OpResponse::error(
                        ResponseStatus::UsageError,
                        "partition column predicate was not unrolled to a single value",
                    );
                }
            }
        }
        if !bound.is_empty() && bound.len() != table.num_hash_key_columns {
            return OpResponse::error(
                ResponseStatus::UsageError,
                format!(
                    "expected {} partition values, got {}",
                    table.num_hash_key_columns,
                    bound.len()
                ),
            );
        }

        let mut matched: Vec<&Vec<Datum>> = table
            .rows
            .iter()
            .filter(|row| bound.iter().enumerate().all(|(idx, datum)| row.get(idx) == Some(*datum)))
            .collect();
        if !request.is_forward_scan {
            matched.reverse();
        }

        // Continuations resume from the row offset carried in the token.
        let offset = match &request.innermost_request().paging_state {
            Some(state) => match decode_offset_token(state) {
                Ok(offset) => {
                    debug!(token = %hex::encode(&state.token), offset, "resuming scan from paging token");
                    offset as usize
                }
                Err(err) => return OpResponse::error(ResponseStatus::RuntimeError, err.to_string()),
            },
            None => 0,
        };

        let limit = request.limit.unwrap_or(u64::MAX).max(1) as usize;
        let page: Vec<Vec<Datum>> = matched
            .iter()
            .skip(offset)
            .take(limit)
            .map(|row| (*row).clone())
            .collect();
        let consumed = offset + page.len();

        let rows_data = if page.is_empty() { Bytes::new() } else { encode_rows(&page) };
        let mut response = OpResponse::with_rows(rows_data);
        if request.return_paging_state && consumed < matched.len() {
            response.paging_state = Some(encode_offset_token(consumed as u64));
        }
        response
    }

    fn execute_write(&self, request: &WriteRequest) -> OpResponse {
        if let Some(resp) = self.check_catalog_version(request.catalog_version) {
            return resp;
        }

        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        let Some(table) = tables.get_mut(&request.table_id) else {
            return OpResponse::error(
                ResponseStatus::RuntimeError,
                format!("table {} does not exist", request.table_id),
            );
        };

        let pk_len = table.primary_key_len.min(request.row.len());
        let key = &request.row[..pk_len];
        let existing = table
            .rows
            .iter()
            .position(|row| row.len() >= pk_len && &row[..pk_len] == key);

        let mut response = OpResponse::default();
        match (request.kind, existing) {
            (WriteKind::Insert, Some(_)) => {
                let mut resp = OpResponse::error(
                    ResponseStatus::DuplicateKey,
                    format!("duplicate key value violates unique constraint \"{}_pkey\"", table.name),
                );
                resp.pg_error_code = Some(PgErrorCode::UniqueViolation);
                return resp;
            }
            (WriteKind::Insert, None) => {
                table.rows.push(request.row.clone());
                response.rows_affected_count = 1;
            }
            (WriteKind::Update, Some(idx)) => {
                table.rows[idx] = request.row.clone();
                response.rows_affected_count = 1;
            }
            (WriteKind::Update, None) => {
                response.rows_affected_count = 0;
            }
            (WriteKind::Upsert, Some(idx)) => {
                table.rows[idx] = request.row.clone();
                response.rows_affected_count = 1;
            }
            (WriteKind::Upsert, None) => {
                table.rows.push(request.row.clone());
                response.rows_affected_count = 1;
            }
            (WriteKind::Delete, Some(idx)) => {
                table.rows.remove(idx);
                response.rows_affected_count = 1;
            }
            (WriteKind::Delete, None) => {
                response.rows_affected_count = 0;
            }
        }
        response
    }

    fn execute(&self, op: &SessionOp) {
        match op {
            SessionOp::Read(read_op) => {
                let request = read_op.request_snapshot();
                read_op.set_response(self.execute_read(&request));
            }
            SessionOp::Write(write_op) => {
                let request = write_op.request_snapshot();
                write_op.set_response(self.execute_write(&request));
            }
        }
    }
}

#[derive(Debug, Default)]
struct MemSessionState {
    batch_handle: u64,
    batch: Vec<SessionOp>,
    buffered: Vec<Arc<WriteOp>>,
    next_read_point: u64,
}

/// `StorageSession` over a [`MemTabletStore`]. Flushes execute on a spawned
/// thread, so completion callbacks arrive off the consumer thread exactly as
/// they would from a real I/O reactor.
pub struct MemSession {
    store: Arc<MemTabletStore>,
    state: Mutex<MemSessionState>,
    buffer_writes: bool,
}

impl MemSession {
    pub fn new(store: Arc<MemTabletStore>) -> Arc<MemSession> {
        Arc::new(MemSession {
            store,
            state: Mutex::new(MemSessionState::default()),
            buffer_writes: false,
        })
    }

    /// Session that defers writes into a statement-local buffer instead of
    /// flushing them per-op.
    pub fn with_buffered_writes(store: Arc<MemTabletStore>) -> Arc<MemSession> {
        Arc::new(MemSession {
            store,
            state: Mutex::new(MemSessionState::default()),
            buffer_writes: true,
        })
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, MemSessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Synchronously execute every buffered write. This is the separate
    /// channel the statement layer drives buffered batches through.
    pub fn flush_buffered(&self) -> usize {
        let buffered = std::mem::take(&mut self.lock_state().buffered);
        let count = buffered.len();
        for write_op in buffered {
            self.store.execute(&SessionOp::Write(write_op));
        }
        debug!(count, "flushed buffered writes");
        count
    }

    pub fn buffered_count(&self) -> usize {
        self.lock_state().buffered.len()
    }
}

impl StorageSession for MemSession {
    fn apply_async(
        &self,
        op: SessionOp,
        read_time: &mut ReadTime,
    ) -> Result<ApplyOutcome, StorageError> {
        let mut state = self.lock_state();
        state.next_read_point += 1;
        let read_point = state.next_read_point;
        read_time.set_if_unset(read_point);

        if self.buffer_writes {
            if let SessionOp::Write(write_op) = &op {
                state.buffered.push(Arc::clone(write_op));
                return Ok(ApplyOutcome {
                    buffered: true,
                    handle: SessionHandle(state.batch_handle),
                });
            }
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
        let batch = {
            let mut state = self.lock_state();
            if handle.0 != state.batch_handle {
                return Err(StorageError::FlushFailed(format!(
                    "stale session handle {} (current batch is {})",
                    handle.0, state.batch_handle
                )));
            }
            if state.batch.is_empty() {
                return Err(StorageError::FlushFailed(
                    "flush requested with no applied operations".to_string(),
                ));
            }
            state.batch_handle += 1;
            std::mem::take(&mut state.batch)
        };

        let store = Arc::clone(&self.store);
        std::thread::spawn(move || {
            debug!(ops = batch.len(), "completing flush batch");
            for op in &batch {
                store.execute(op);
            }
            callback(Ok(()));
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orders_descriptor() -> TableDescriptor {
        TableDescriptor::new(100, "orders", 1, 2, 1)
    }

    fn seeded_store(rows: usize) -> Arc<MemTabletStore> {
        let store = MemTabletStore::new();
        store.create_table(&orders_descriptor());
        store.seed_rows(
            100,
            (0..rows).map(|i| vec![Datum::Int64(1), Datum::Int64(i as i64)]),
        );
        store
    }

    #[test]
    fn row_codec_round_trips_mixed_datums() {
        let rows = vec![
            vec![
                Datum::Int64(42),
                Datum::Text("shipped".to_string()),
                Datum::Null,
                Datum::Bool(true),
            ],
            vec![Datum::Double(2.5), Datum::Binary(vec![0xde, 0xad])],
        ];
        let decoded = decode_rows(&encode_rows(&rows)).expect("decode encoded rows");
        assert_eq!(decoded, rows);
    }

    #[test]
    fn read_pages_through_rows_with_offset_tokens() {
        let store = seeded_store(5);
        let mut request = orders_descriptor().new_select();
        request.return_paging_state = true;
        request.limit = Some(2);

        let first = store.execute_read(&request);
        assert!(first.succeeded());
        assert_eq!(decode_rows(&first.rows_data).expect("page 1").len(), 2);
        let state = first.paging_state.expect("rows remain after page 1");

        request.paging_state = Some(state);
        request.catalog_version = None;
        let second = store.execute_read(&request);
        assert_eq!(decode_rows(&second.rows_data).expect("page 2").len(), 2);

        request.paging_state = second.paging_state;
        let third = store.execute_read(&request);
        assert_eq!(decode_rows(&third.rows_data).expect("page 3").len(), 1);
        assert!(third.paging_state.is_none(), "scan must end on the last page");
    }

    #[test]
    fn stale_catalog_version_fails_but_untagged_request_passes() {
        let store = seeded_store(1);
        let request = orders_descriptor().new_select();

        store.bump_catalog_version();
        let stale = store.execute_read(&request);
        assert_eq!(stale.status, ResponseStatus::SchemaVersionMismatch);

        let mut untagged = request.clone();
        untagged.catalog_version = None;
        assert!(store.execute_read(&untagged).succeeded());
    }

    #[test]
    fn backward_scan_reverses_row_order() {
        let store = seeded_store(3);
        let mut request = orders_descriptor().new_select();
        request.catalog_version = None;
        request.is_forward_scan = false;

        let response = store.execute_read(&request);
        let rows = decode_rows(&response.rows_data).expect("backward page");
        assert_eq!(rows[0][1], Datum::Int64(2));
        assert_eq!(rows[2][1], Datum::Int64(0));
    }

    #[test]
    fn duplicate_insert_reports_unique_violation() {
        let store = seeded_store(0);
        let row = vec![Datum::Int64(1), Datum::Int64(7)];
        let insert = WriteRequest::new(100, WriteKind::Insert, row.clone());

        let first = store.execute_write(&insert);
        assert!(first.succeeded());
        assert_eq!(first.rows_affected_count, 1);

        let second = store.execute_write(&insert);
        assert_eq!(second.status, ResponseStatus::DuplicateKey);
        assert_eq!(second.pg_error_code, Some(PgErrorCode::UniqueViolation));
        assert!(second.error_message.contains("orders_pkey"));
    }
}
