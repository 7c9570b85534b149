//! Document-operation execution core for the KeelDB SQL gateway.
//!
//! For each SQL statement the statement layer constructs one doc-op, drives
//! it with `execute()` + repeated `fetch()` calls, and drops it. The doc-op
//! translates the prepared request into storage sub-requests, paces dispatch
//! against row consumption, carries paging continuations across round trips,
//! fans hash-equality predicates out over partition permutations, and maps
//! storage failures into the SQL-visible error taxonomy.

pub mod doc_op;
pub mod error;
pub mod flags;
pub mod metrics;

pub use doc_op::{
    CompoundDocOp, DocOp, DocOpHandle, ExecParams, ReadDocOp, RequestSent, WriteDocOp,
};
pub use error::{ExecError, ExecResult};
pub use flags::ExecFlags;
pub use metrics::{ExecMetrics, MetricsSnapshot};
