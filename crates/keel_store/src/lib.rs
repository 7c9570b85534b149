//! Storage-layer interface model for the KeelDB SQL gateway.
//!
//! This crate defines the request/response objects exchanged with the tablet
//! storage layer, the `StorageSession` trait the gateway dispatches through,
//! and the table descriptor the gateway builds scan templates from. It also
//! ships an in-memory tablet store and session (`mem`) used by integration
//! tests and the workload driver.

pub mod descriptor;
pub mod mem;
pub mod op;
pub mod request;
pub mod response;
pub mod session;

pub use descriptor::TableDescriptor;
pub use op::{ReadOp, StorageOp, WriteOp};
pub use request::{
    ColumnId, Condition, ConditionOp, Datum, Expression, PagingState, ReadRequest, RowMarkType,
    TableId, WriteKind, WriteRequest,
};
pub use response::{OpResponse, PgErrorCode, ResponseStatus, TxnErrorCode};
pub use session::{
    ApplyOutcome, FlushCallback, ReadTime, SessionHandle, SessionOp, StorageError, StorageSession,
};
