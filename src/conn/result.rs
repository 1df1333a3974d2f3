//! Accumulated query results.
//!
//! The engine validates result shape and hands the raw column bytes to the
//! caller; decoding them belongs to the host's type codecs.

use bytes::Bytes;

use crate::types::Oid;

/// Description of one result column.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct Column {
    /// Column name as reported by the backend.
    pub name: String,
    /// Type OID as reported by the backend.
    pub type_oid: Oid,
}

/// One result row; column values are raw wire bytes in the format the query
/// was executed with.
#[derive(Clone, Debug)]
pub struct Row {
    pub(crate) columns: Vec<Option<Bytes>>,
}

impl Row {
    /// Number of columns.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Whether the row has no columns.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Raw bytes of the given column, `None` for SQL null.
    pub fn get(&self, idx: usize) -> Option<&[u8]> {
        self.columns.get(idx).and_then(|c| c.as_deref())
    }
}

/// A complete tuple result from one partition.
#[derive(Clone, Debug)]
pub struct QueryResult {
    pub(crate) columns: Vec<Column>,
    pub(crate) rows: Vec<Row>,
    /// Whether the rows were transferred in binary format.
    pub(crate) binary: bool,
}

impl QueryResult {
    pub(crate) fn new(columns: Vec<Column>, binary: bool) -> Self {
        Self {
            columns,
            rows: Vec::new(),
            binary,
        }
    }

    /// Column descriptions.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// The rows, in arrival order.
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Number of rows.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Whether column values are in binary format.
    pub fn is_binary(&self) -> bool {
        self.binary
    }
}
