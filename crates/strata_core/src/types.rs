//! SQL type codes and runtime values.
//!
//! The engine represents NULL for the fixed-width types as a reserved
//! sentinel value of the type itself (minimum integer, a designated NaN
//! bit pattern for floats, minimum microseconds for timestamps). The
//! variable-width types and DECIMAL use a designated marker instead.
//! Every replica must agree on these encodings because they feed the
//! determinism hash.

use serde::{Deserialize, Serialize};

/// Bit pattern of the float NULL sentinel (a fixed quiet NaN).
pub const NULL_FLOAT_BITS: u64 = 0x7ff8_0000_0000_0000;
/// Microsecond value of the timestamp NULL sentinel.
pub const NULL_TIMESTAMP_MICROS: i64 = i64::MIN;
/// Scaled value of the decimal NULL marker.
pub const NULL_DECIMAL: i128 = i128::MIN;
/// Fixed decimal scale: all decimals carry twelve fractional digits.
pub const DECIMAL_SCALE_FACTOR: i128 = 1_000_000_000_000;

/// Wire code reserved for an explicit NULL marker in the parameter codec.
pub const NULL_TYPE_CODE: u8 = 1;

/// SQL column/parameter type codes.
///
/// `Numeric` is a declared-only type: it can appear in an installed
/// procedure's parameter declaration (where it is rewritten to `Float`)
/// but never as the type of a runtime value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SqlType {
    Numeric,
    TinyInt,
    SmallInt,
    Integer,
    BigInt,
    Float,
    String,
    Timestamp,
    Decimal,
    VarBinary,
}

impl SqlType {
    /// Stable one-byte wire code for this type.
    pub const fn code(self) -> u8 {
        match self {
            SqlType::Numeric => 2,
            SqlType::TinyInt => 3,
            SqlType::SmallInt => 4,
            SqlType::Integer => 5,
            SqlType::BigInt => 6,
            SqlType::Float => 8,
            SqlType::String => 9,
            SqlType::Timestamp => 11,
            SqlType::Decimal => 22,
            SqlType::VarBinary => 25,
        }
    }

    pub fn from_code(code: u8) -> Option<SqlType> {
        match code {
            2 => Some(SqlType::Numeric),
            3 => Some(SqlType::TinyInt),
            4 => Some(SqlType::SmallInt),
            5 => Some(SqlType::Integer),
            6 => Some(SqlType::BigInt),
            8 => Some(SqlType::Float),
            9 => Some(SqlType::String),
            11 => Some(SqlType::Timestamp),
            22 => Some(SqlType::Decimal),
            25 => Some(SqlType::VarBinary),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            SqlType::Numeric => "NUMERIC",
            SqlType::TinyInt => "TINYINT",
            SqlType::SmallInt => "SMALLINT",
            SqlType::Integer => "INTEGER",
            SqlType::BigInt => "BIGINT",
            SqlType::Float => "FLOAT",
            SqlType::String => "VARCHAR",
            SqlType::Timestamp => "TIMESTAMP",
            SqlType::Decimal => "DECIMAL",
            SqlType::VarBinary => "VARBINARY",
        }
    }
}

impl std::fmt::Display for SqlType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A runtime SQL value in its canonical engine representation.
///
/// `Null` is the designated marker used for types whose payload domain
/// cannot spare a sentinel (strings and varbinary) and for DECIMAL; the
/// fixed-width numeric types express NULL through their sentinel values
/// instead. Use [`SqlValue::is_null`] rather than matching on `Null`.
#[derive(Clone, Debug)]
pub enum SqlValue {
    TinyInt(i8),
    SmallInt(i16),
    Integer(i32),
    BigInt(i64),
    Float(f64),
    /// Fixed-point decimal scaled by [`DECIMAL_SCALE_FACTOR`].
    Decimal(i128),
    /// Microseconds since the UNIX epoch.
    Timestamp(i64),
    String(String),
    VarBinary(Vec<u8>),
    Null(SqlType),
}

impl SqlValue {
    /// The canonical NULL for `sql_type`, or `None` for declared-only types.
    pub fn null_for(sql_type: SqlType) -> Option<SqlValue> {
        match sql_type {
            SqlType::TinyInt => Some(SqlValue::TinyInt(i8::MIN)),
            SqlType::SmallInt => Some(SqlValue::SmallInt(i16::MIN)),
            SqlType::Integer => Some(SqlValue::Integer(i32::MIN)),
            SqlType::BigInt => Some(SqlValue::BigInt(i64::MIN)),
            SqlType::Float => Some(SqlValue::Float(f64::from_bits(NULL_FLOAT_BITS))),
            SqlType::Timestamp => Some(SqlValue::Timestamp(NULL_TIMESTAMP_MICROS)),
            SqlType::String => Some(SqlValue::Null(SqlType::String)),
            SqlType::VarBinary => Some(SqlValue::Null(SqlType::VarBinary)),
            SqlType::Decimal => Some(SqlValue::Null(SqlType::Decimal)),
            SqlType::Numeric => None,
        }
    }

    pub fn is_null(&self) -> bool {
        match self {
            SqlValue::TinyInt(v) => *v == i8::MIN,
            SqlValue::SmallInt(v) => *v == i16::MIN,
            SqlValue::Integer(v) => *v == i32::MIN,
            SqlValue::BigInt(v) => *v == i64::MIN,
            SqlValue::Float(v) => v.to_bits() == NULL_FLOAT_BITS,
            SqlValue::Decimal(v) => *v == NULL_DECIMAL,
            SqlValue::Timestamp(v) => *v == NULL_TIMESTAMP_MICROS,
            SqlValue::String(_) | SqlValue::VarBinary(_) => false,
            SqlValue::Null(_) => true,
        }
    }

    pub fn sql_type(&self) -> SqlType {
        match self {
            SqlValue::TinyInt(_) => SqlType::TinyInt,
            SqlValue::SmallInt(_) => SqlType::SmallInt,
            SqlValue::Integer(_) => SqlType::Integer,
            SqlValue::BigInt(_) => SqlType::BigInt,
            SqlValue::Float(_) => SqlType::Float,
            SqlValue::Decimal(_) => SqlType::Decimal,
            SqlValue::Timestamp(_) => SqlType::Timestamp,
            SqlValue::String(_) => SqlType::String,
            SqlValue::VarBinary(_) => SqlType::VarBinary,
            SqlValue::Null(t) => *t,
        }
    }

    /// The integer payload if this value is any of the integer types.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            SqlValue::TinyInt(v) => Some(i64::from(*v)),
            SqlValue::SmallInt(v) => Some(i64::from(*v)),
            SqlValue::Integer(v) => Some(i64::from(*v)),
            SqlValue::BigInt(v) => Some(*v),
            _ => None,
        }
    }
}

impl PartialEq for SqlValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (SqlValue::TinyInt(a), SqlValue::TinyInt(b)) => a == b,
            (SqlValue::SmallInt(a), SqlValue::SmallInt(b)) => a == b,
            (SqlValue::Integer(a), SqlValue::Integer(b)) => a == b,
            (SqlValue::BigInt(a), SqlValue::BigInt(b)) => a == b,
            // Bitwise so that the NaN-encoded float NULL compares equal to itself.
            (SqlValue::Float(a), SqlValue::Float(b)) => a.to_bits() == b.to_bits(),
            (SqlValue::Decimal(a), SqlValue::Decimal(b)) => a == b,
            (SqlValue::Timestamp(a), SqlValue::Timestamp(b)) => a == b,
            (SqlValue::String(a), SqlValue::String(b)) => a == b,
            (SqlValue::VarBinary(a), SqlValue::VarBinary(b)) => a == b,
            (SqlValue::Null(a), SqlValue::Null(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for SqlValue {}
