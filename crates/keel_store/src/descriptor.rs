//! Table descriptors: the schema facts the gateway needs to build requests.

use crate::request::{ReadRequest, TableId};

/// Shared-immutable description of one table.
#[derive(Debug, Clone)]
pub struct TableDescriptor {
    table_id: TableId,
    table_name: String,
    /// Leading columns that participate in the hash-partitioning function.
    num_hash_key_columns: usize,
    /// Full primary-key arity (hash columns plus range columns).
    num_key_columns: usize,
    /// Catalog version stamped on fresh requests for the schema check.
    catalog_version: u64,
}

impl TableDescriptor {
    pub fn new(
        table_id: TableId,
        table_name: impl Into<String>,
        num_hash_key_columns: usize,
        num_key_columns: usize,
        catalog_version: u64,
    ) -> TableDescriptor {
        TableDescriptor {
            table_id,
            table_name: table_name.into(),
            num_hash_key_columns,
            num_key_columns,
            catalog_version,
        }
    }

    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn num_hash_key_columns(&self) -> usize {
        self.num_hash_key_columns
    }

    pub fn num_key_columns(&self) -> usize {
        self.num_key_columns
    }

    pub fn catalog_version(&self) -> u64 {
        self.catalog_version
    }

    /// Fresh prepared read template for this table. The statement layer
    /// binds predicates onto the template before the first dispatch.
    pub fn new_select(&self) -> ReadRequest {
        let mut request = ReadRequest::new(self.table_id);
        request.catalog_version = Some(self.catalog_version);
        request
    }
}
