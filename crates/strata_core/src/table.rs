//! Result tables returned from plan fragment execution.

use serde::{Deserialize, Serialize};

use crate::params::{write_value, CodecError};
use crate::types::{SqlType, SqlValue};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub column_type: SqlType,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, column_type: SqlType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// An ordered row set with a typed column schema.
///
/// This is the unit of result passed between the engine, the dependency
/// collector, and the client response. Row arity is enforced at append
/// time so every downstream consumer can index columns without checking.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct ResultTable {
    columns: Vec<ColumnInfo>,
    rows: Vec<Vec<SqlValue>>,
}

impl ResultTable {
    pub fn new(columns: Vec<ColumnInfo>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// A one-column, one-row BIGINT table, used to surface scalar returns.
    pub fn scalar_bigint(value: i64) -> Self {
        let mut table = ResultTable::new(vec![ColumnInfo::new("", SqlType::BigInt)]);
        table
            .add_row(vec![SqlValue::BigInt(value)])
            .expect("scalar table row arity");
        table
    }

    pub fn add_row(&mut self, row: Vec<SqlValue>) -> Result<(), CodecError> {
        if row.len() != self.columns.len() {
            return Err(CodecError::RowArity {
                expected: self.columns.len(),
                got: row.len(),
            });
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn columns(&self) -> &[ColumnInfo] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<SqlValue>] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// The single cell of a one-column, one-row table, if that is the shape.
    pub fn scalar(&self) -> Option<&SqlValue> {
        if self.columns.len() == 1 && self.rows.len() == 1 {
            self.rows[0].first()
        } else {
            None
        }
    }

    /// CRC32C over the canonical serialization of schema and rows.
    ///
    /// Replicas compare these fingerprints to detect result divergence, so
    /// the byte layout feeding the CRC is canonical in the same way the
    /// parameter codec is.
    pub fn fingerprint(&self) -> u32 {
        let mut buf = Vec::with_capacity(64 + self.rows.len() * 16);
        buf.extend_from_slice(&(self.columns.len() as u16).to_le_bytes());
        for column in &self.columns {
            buf.push(column.column_type.code());
            buf.extend_from_slice(&(column.name.len() as u32).to_le_bytes());
            buf.extend_from_slice(column.name.as_bytes());
        }
        buf.extend_from_slice(&(self.rows.len() as u32).to_le_bytes());
        for row in &self.rows {
            for value in row {
                // Arity was enforced at append time; an oversize payload here
                // would already have failed parameter serialization upstream.
                let _ = write_value(&mut buf, value);
            }
        }
        crc32c::crc32c(&buf)
    }
}
