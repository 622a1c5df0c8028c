//! Canonical parameter-set codec.
//!
//! A parameter set is the ordered argument vector bound to one queued
//! statement. Its serialization is canonical: replicas hash these bytes
//! into the determinism CRC, so the layout below is part of the replica
//! agreement protocol and must not change shape without a version bump.
//!
//! Layout (all integers little-endian):
//!   u16 count
//!   per value: u8 type code, then the payload
//!     fixed-width types: the value itself (i8/i16/i32/i64/f64-bits/i128)
//!     STRING/VARBINARY:  u32 length + bytes
//!     NULL marker:       code 1, then the underlying type code

use thiserror::Error;

use crate::types::{SqlType, SqlValue, NULL_TYPE_CODE};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("parameter set has {0} values, which exceeds the wire limit")]
    TooManyValues(usize),
    #[error("row has {got} values for a table of {expected} columns")]
    RowArity { expected: usize, got: usize },
    #[error("parameter payload of {0} bytes exceeds the wire limit")]
    OversizePayload(usize),
    #[error("parameter buffer truncated")]
    Truncated,
    #[error("unknown parameter type code {0}")]
    UnknownTypeCode(u8),
    #[error("type {0} has no NULL marker encoding")]
    UnencodableNull(SqlType),
    #[error("string parameter is not valid utf-8")]
    InvalidUtf8,
}

/// An exclusively-owned, ordered vector of SQL values.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct ParameterSet {
    values: Vec<SqlValue>,
}

impl ParameterSet {
    pub fn from_values(values: Vec<SqlValue>) -> Self {
        Self { values }
    }

    pub fn empty() -> Self {
        Self { values: Vec::new() }
    }

    pub fn values(&self) -> &[SqlValue] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn value_at(&self, index: usize) -> Option<&SqlValue> {
        self.values.get(index)
    }

    /// Exact size of [`ParameterSet::to_bytes`] output.
    pub fn serialized_size(&self) -> usize {
        2 + self.values.iter().map(value_serialized_size).sum::<usize>()
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        let count =
            u16::try_from(self.values.len()).map_err(|_| CodecError::TooManyValues(self.values.len()))?;
        buf.extend_from_slice(&count.to_le_bytes());
        for value in &self.values {
            write_value(buf, value)?;
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let mut buf = Vec::with_capacity(self.serialized_size());
        self.write_to(&mut buf)?;
        Ok(buf)
    }

    pub fn read_from(bytes: &[u8]) -> Result<ParameterSet, CodecError> {
        let mut cursor = Cursor { bytes, pos: 0 };
        let count = cursor.read_u16()?;
        let mut values = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            values.push(read_value(&mut cursor)?);
        }
        Ok(ParameterSet { values })
    }
}

fn value_serialized_size(value: &SqlValue) -> usize {
    1 + match value {
        SqlValue::TinyInt(_) => 1,
        SqlValue::SmallInt(_) => 2,
        SqlValue::Integer(_) => 4,
        SqlValue::BigInt(_) | SqlValue::Float(_) | SqlValue::Timestamp(_) => 8,
        SqlValue::Decimal(_) => 16,
        SqlValue::String(s) => 4 + s.len(),
        SqlValue::VarBinary(b) => 4 + b.len(),
        SqlValue::Null(_) => 1,
    }
}

pub(crate) fn write_value(buf: &mut Vec<u8>, value: &SqlValue) -> Result<(), CodecError> {
    match value {
        SqlValue::Null(inner) => {
            buf.push(NULL_TYPE_CODE);
            buf.push(inner.code());
        }
        SqlValue::TinyInt(v) => {
            buf.push(SqlType::TinyInt.code());
            buf.extend_from_slice(&v.to_le_bytes());
        }
        SqlValue::SmallInt(v) => {
            buf.push(SqlType::SmallInt.code());
            buf.extend_from_slice(&v.to_le_bytes());
        }
        SqlValue::Integer(v) => {
            buf.push(SqlType::Integer.code());
            buf.extend_from_slice(&v.to_le_bytes());
        }
        SqlValue::BigInt(v) => {
            buf.push(SqlType::BigInt.code());
            buf.extend_from_slice(&v.to_le_bytes());
        }
        SqlValue::Float(v) => {
            buf.push(SqlType::Float.code());
            buf.extend_from_slice(&v.to_bits().to_le_bytes());
        }
        SqlValue::Timestamp(v) => {
            buf.push(SqlType::Timestamp.code());
            buf.extend_from_slice(&v.to_le_bytes());
        }
        SqlValue::Decimal(v) => {
            buf.push(SqlType::Decimal.code());
            buf.extend_from_slice(&v.to_le_bytes());
        }
        SqlValue::String(s) => {
            buf.push(SqlType::String.code());
            let len = u32::try_from(s.len()).map_err(|_| CodecError::OversizePayload(s.len()))?;
            buf.extend_from_slice(&len.to_le_bytes());
            buf.extend_from_slice(s.as_bytes());
        }
        SqlValue::VarBinary(b) => {
            buf.push(SqlType::VarBinary.code());
            let len = u32::try_from(b.len()).map_err(|_| CodecError::OversizePayload(b.len()))?;
            buf.extend_from_slice(&len.to_le_bytes());
            buf.extend_from_slice(b);
        }
    }
    Ok(())
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn take(&mut self, n: usize) -> Result<&[u8], CodecError> {
        let end = self.pos.checked_add(n).ok_or(CodecError::Truncated)?;
        if end > self.bytes.len() {
            return Err(CodecError::Truncated);
        }
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_i64(&mut self) -> Result<i64, CodecError> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(i64::from_le_bytes(raw))
    }

    fn read_i128(&mut self) -> Result<i128, CodecError> {
        let b = self.take(16)?;
        let mut raw = [0u8; 16];
        raw.copy_from_slice(b);
        Ok(i128::from_le_bytes(raw))
    }
}

fn read_value(cursor: &mut Cursor<'_>) -> Result<SqlValue, CodecError> {
    let code = cursor.read_u8()?;
    if code == NULL_TYPE_CODE {
        let inner_code = cursor.read_u8()?;
        let inner = SqlType::from_code(inner_code).ok_or(CodecError::UnknownTypeCode(inner_code))?;
        return match inner {
            SqlType::String | SqlType::VarBinary | SqlType::Decimal => Ok(SqlValue::Null(inner)),
            other => Err(CodecError::UnencodableNull(other)),
        };
    }
    let sql_type = SqlType::from_code(code).ok_or(CodecError::UnknownTypeCode(code))?;
    match sql_type {
        SqlType::TinyInt => Ok(SqlValue::TinyInt(cursor.take(1)?[0] as i8)),
        SqlType::SmallInt => {
            let b = cursor.take(2)?;
            Ok(SqlValue::SmallInt(i16::from_le_bytes([b[0], b[1]])))
        }
        SqlType::Integer => {
            let raw = cursor.read_u32()?;
            Ok(SqlValue::Integer(raw as i32))
        }
        SqlType::BigInt => Ok(SqlValue::BigInt(cursor.read_i64()?)),
        SqlType::Float => {
            let b = cursor.take(8)?;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(b);
            Ok(SqlValue::Float(f64::from_bits(u64::from_le_bytes(raw))))
        }
        SqlType::Timestamp => Ok(SqlValue::Timestamp(cursor.read_i64()?)),
        SqlType::Decimal => Ok(SqlValue::Decimal(cursor.read_i128()?)),
        SqlType::String => {
            let len = cursor.read_u32()? as usize;
            let bytes = cursor.take(len)?;
            let text = std::str::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)?;
            Ok(SqlValue::String(text.to_owned()))
        }
        SqlType::VarBinary => {
            let len = cursor.read_u32()? as usize;
            Ok(SqlValue::VarBinary(cursor.take(len)?.to_vec()))
        }
        SqlType::Numeric => Err(CodecError::UnknownTypeCode(code)),
    }
}
