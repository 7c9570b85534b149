//! Read and write request objects sent to the tablet storage layer.
//!
//! Requests are plain owned trees: the gateway clones the scan template to
//! unroll partition permutations, mutates paging state between round trips,
//! and hands `Arc`-shared copies to the session for dispatch.

use bytes::Bytes;

/// Stable table identifier assigned by the catalog.
pub type TableId = u64;

/// Positional column identifier within a table schema.
pub type ColumnId = u32;

/// A single typed value carried by a request expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Double(f64),
    Text(String),
    Binary(Vec<u8>),
}

/// Operator of a predicate condition node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionOp {
    /// Column equals a single operand.
    Equal,
    /// Column is a member of the operand list held by the second operand.
    In,
    /// Bare operand list; only ever appears as the second operand of `In`.
    ValueList,
}

/// A predicate condition with its ordered operands.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub op: ConditionOp,
    pub operands: Vec<Expression>,
}

/// One node of a request expression tree.
///
/// A hash column bound by a single equality occupies its partition slot as a
/// `Value`. A `col IN (v1..vk)` predicate occupies the slot as a `Condition`
/// whose first operand references the column and whose second operand is a
/// `ValueList` condition holding the candidate values.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Value(Datum),
    Column(ColumnId),
    Condition(Box<Condition>),
}

impl Expression {
    /// Build the `col IN (values)` shape used for hash-column predicates.
    pub fn in_list(column: ColumnId, values: Vec<Datum>) -> Expression {
        let list = Condition {
            op: ConditionOp::ValueList,
            operands: values.into_iter().map(Expression::Value).collect(),
        };
        Expression::Condition(Box::new(Condition {
            op: ConditionOp::In,
            operands: vec![Expression::Column(column), Expression::Condition(Box::new(list))],
        }))
    }
}

/// Lock mode the storage layer should take on rows returned by a scan,
/// for `SELECT .. FOR UPDATE` and friends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowMarkType {
    Exclusive,
    NoKeyExclusive,
    Share,
    KeyShare,
}

impl RowMarkType {
    /// Map the signed row-mark tag from the executor; negative means none.
    pub fn from_raw(raw: i32) -> Option<RowMarkType> {
        match raw {
            0 => Some(RowMarkType::Exclusive),
            1 => Some(RowMarkType::NoKeyExclusive),
            2 => Some(RowMarkType::Share),
            3 => Some(RowMarkType::KeyShare),
            _ => None,
        }
    }
}

/// Opaque scan continuation returned by a tablet server.
///
/// Placing the token on the next request resumes the scan exactly where the
/// previous response left off. The gateway never inspects the contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagingState {
    pub token: Bytes,
}

impl PagingState {
    pub fn new(token: Bytes) -> PagingState {
        PagingState { token }
    }
}

/// A prepared read request for one table.
///
/// Requests can nest: a secondary-index scan carries the index read in
/// `index_request`, and the outer request joins its output against the base
/// table. Paging state always lives on the innermost request of the chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadRequest {
    pub table_id: TableId,
    /// One expression slot per hash-key column, in column order. Empty when
    /// the predicate does not pin the partition key.
    pub partition_column_values: Vec<Expression>,
    /// Upper bound on rows the storage layer may return for this request.
    pub limit: Option<u64>,
    pub row_mark_type: Option<RowMarkType>,
    pub is_forward_scan: bool,
    /// Ask the storage layer to hand back a continuation when rows remain.
    pub return_paging_state: bool,
    pub paging_state: Option<PagingState>,
    /// Catalog version check; only the first request of a statement carries
    /// one, continuations clear it.
    pub catalog_version: Option<u64>,
    pub index_request: Option<Box<ReadRequest>>,
}

impl ReadRequest {
    pub fn new(table_id: TableId) -> ReadRequest {
        ReadRequest {
            table_id,
            partition_column_values: Vec::new(),
            limit: None,
            row_mark_type: None,
            is_forward_scan: true,
            return_paging_state: false,
            paging_state: None,
            catalog_version: None,
            index_request: None,
        }
    }

    /// Walk the `index_request` chain to the innermost request.
    ///
    /// The innermost request is the read operator that runs first and feeds
    /// the requests above it, so scan continuations must be installed there
    /// and nowhere else.
    pub fn innermost_request_mut(&mut self) -> &mut ReadRequest {
        match self.index_request {
            Some(ref mut nested) => nested.innermost_request_mut(),
            None => self,
        }
    }

    /// Read-only variant of [`ReadRequest::innermost_request_mut`].
    pub fn innermost_request(&self) -> &ReadRequest {
        match self.index_request {
            Some(ref nested) => nested.innermost_request(),
            None => self,
        }
    }
}

/// Kind of mutation a write request performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Insert,
    Update,
    Delete,
    Upsert,
}

/// A prepared write request for one table. Writes are single-shot: the
/// gateway never clones or re-dispatches them.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRequest {
    pub table_id: TableId,
    pub kind: WriteKind,
    /// Full row values in column order.
    pub row: Vec<Datum>,
    pub catalog_version: Option<u64>,
}

impl WriteRequest {
    pub fn new(table_id: TableId, kind: WriteKind, row: Vec<Datum>) -> WriteRequest {
        WriteRequest {
            table_id,
            kind,
            row,
            catalog_version: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn innermost_request_follows_nested_chain() {
        let mut outer = ReadRequest::new(1);
        let mut middle = ReadRequest::new(2);
        middle.index_request = Some(Box::new(ReadRequest::new(3)));
        outer.index_request = Some(Box::new(middle));

        assert_eq!(outer.innermost_request().table_id, 3);

        outer.innermost_request_mut().paging_state =
            Some(PagingState::new(Bytes::from_static(b"cursor")));
        assert!(outer.paging_state.is_none(), "outer request must stay clean");
        assert!(
            outer.index_request.as_ref().unwrap().paging_state.is_none(),
            "middle request must stay clean"
        );
        assert!(outer
            .index_request
            .as_ref()
            .unwrap()
            .index_request
            .as_ref()
            .unwrap()
            .paging_state
            .is_some());
    }

    #[test]
    fn row_mark_from_raw_maps_negative_to_none() {
        assert_eq!(RowMarkType::from_raw(-1), None);
        assert_eq!(RowMarkType::from_raw(0), Some(RowMarkType::Exclusive));
        assert_eq!(RowMarkType::from_raw(3), Some(RowMarkType::KeyShare));
        assert_eq!(RowMarkType::from_raw(17), None);
    }

    #[test]
    fn in_list_builds_condition_with_value_list_second_operand() {
        let expr = Expression::in_list(0, vec![Datum::Int64(1), Datum::Int64(2)]);
        let Expression::Condition(cond) = expr else {
            panic!("expected a condition node");
        };
        assert_eq!(cond.op, ConditionOp::In);
        assert_eq!(cond.operands.len(), 2);
        let Expression::Condition(list) = &cond.operands[1] else {
            panic!("second operand should hold the value list");
        };
        assert_eq!(list.op, ConditionOp::ValueList);
        assert_eq!(list.operands.len(), 2);
    }
}
