//! Parameter coercion.
//!
//! Caller-supplied argument vectors are converted into the canonical
//! representation the engine consumes. Missing values become the typed
//! NULL sentinel of the declared parameter type; present values are
//! widened (or losslessly narrowed) to the declared type. The same rules
//! apply at both coercion points: once against the procedure's declared
//! parameters at call entry, and once against each statement's parameter
//! types at queueing time.

use strata_core::types::DECIMAL_SCALE_FACTOR;
use strata_core::{ParameterSet, SqlType, SqlValue};

use crate::errors::RunnerError;
use crate::statement::StatementDescriptor;

/// One caller-supplied argument; `None` is SQL NULL.
pub type ProcArg = Option<SqlValue>;

/// One declared parameter slot of a procedure.
///
/// System procedures carry a leading `SystemContext` slot: the execution
/// context is injected at position 0 before arity checking, so it counts
/// toward the declared arity exactly like a typed parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamSlot {
    SystemContext,
    Typed(SqlType),
}

/// One argument at call entry, after any context injection.
#[derive(Clone, Debug)]
pub enum CallArg {
    SystemContext,
    Value(ProcArg),
}

/// Coerce a full call argument vector against the procedure's declared
/// slots, returning the typed values (context slots are validated
/// positionally but carry no value).
pub fn coerce_call_args(
    procedure_name: &str,
    slots: &[ParamSlot],
    args: &[CallArg],
) -> Result<Vec<SqlValue>, RunnerError> {
    if args.len() != slots.len() {
        return Err(RunnerError::ArityMismatch {
            target: format!("PROCEDURE {procedure_name}"),
            expected: slots.len(),
            received: args.len(),
        });
    }
    let mut values = Vec::with_capacity(slots.len());
    for (index, (slot, arg)) in slots.iter().zip(args).enumerate() {
        match (slot, arg) {
            (ParamSlot::SystemContext, CallArg::SystemContext) => {}
            (ParamSlot::Typed(sql_type), CallArg::Value(value)) => {
                values.push(coerce_one(
                    *sql_type,
                    index,
                    value,
                    &format!("PROCEDURE {procedure_name}"),
                )?);
            }
            (ParamSlot::SystemContext, CallArg::Value(_)) => {
                return Err(RunnerError::TypeError {
                    target: format!("PROCEDURE {procedure_name}"),
                    index,
                    detail: "expected the system procedure context in this position".into(),
                });
            }
            (ParamSlot::Typed(_), CallArg::SystemContext) => {
                return Err(RunnerError::TypeError {
                    target: format!("PROCEDURE {procedure_name}"),
                    index,
                    detail: "a system procedure context cannot bind a typed parameter".into(),
                });
            }
        }
    }
    Ok(values)
}

/// Coerce statement arguments into the parameter set the engine consumes.
pub fn coerce_statement_params(
    stmt: &StatementDescriptor,
    args: &[ProcArg],
) -> Result<ParameterSet, RunnerError> {
    let types = stmt.param_types();
    if args.len() != types.len() {
        return Err(RunnerError::ArityMismatch {
            target: format!("STATEMENT {}", stmt.sql()),
            expected: types.len(),
            received: args.len(),
        });
    }
    let target = format!("STATEMENT {}", stmt.sql());
    let mut values = Vec::with_capacity(types.len());
    for (index, (sql_type, arg)) in types.iter().zip(args).enumerate() {
        values.push(coerce_one(*sql_type, index, arg, &target)?);
    }
    Ok(ParameterSet::from_values(values))
}

fn coerce_one(
    sql_type: SqlType,
    index: usize,
    arg: &ProcArg,
    target: &str,
) -> Result<SqlValue, RunnerError> {
    let value = match arg {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => Some(v),
    };
    match value {
        None => SqlValue::null_for(sql_type)
            .ok_or(RunnerError::UnknownTypeForNull { index, sql_type }),
        Some(v) => widen_value(sql_type, v).map_err(|detail| RunnerError::TypeError {
            target: target.to_owned(),
            index,
            detail,
        }),
    }
}

fn widen_value(sql_type: SqlType, value: &SqlValue) -> Result<SqlValue, String> {
    let mismatch = || format!("cannot convert {} to {sql_type}", value.sql_type());
    let coerced = match sql_type {
        SqlType::TinyInt => {
            let n = value.as_integer().ok_or_else(mismatch)?;
            SqlValue::TinyInt(i8::try_from(n).map_err(|_| out_of_range(n, sql_type))?)
        }
        SqlType::SmallInt => {
            let n = value.as_integer().ok_or_else(mismatch)?;
            SqlValue::SmallInt(i16::try_from(n).map_err(|_| out_of_range(n, sql_type))?)
        }
        SqlType::Integer => {
            let n = value.as_integer().ok_or_else(mismatch)?;
            SqlValue::Integer(i32::try_from(n).map_err(|_| out_of_range(n, sql_type))?)
        }
        SqlType::BigInt => SqlValue::BigInt(value.as_integer().ok_or_else(mismatch)?),
        SqlType::Float => match value {
            SqlValue::Float(f) => SqlValue::Float(*f),
            other => SqlValue::Float(other.as_integer().ok_or_else(mismatch)? as f64),
        },
        SqlType::Decimal => match value {
            SqlValue::Decimal(d) => SqlValue::Decimal(*d),
            other => {
                let n = other.as_integer().ok_or_else(mismatch)?;
                SqlValue::Decimal(i128::from(n) * DECIMAL_SCALE_FACTOR)
            }
        },
        SqlType::Timestamp => match value {
            SqlValue::Timestamp(t) => SqlValue::Timestamp(*t),
            SqlValue::BigInt(micros) => SqlValue::Timestamp(*micros),
            _ => return Err(mismatch()),
        },
        SqlType::String => match value {
            SqlValue::String(s) => SqlValue::String(s.clone()),
            _ => return Err(mismatch()),
        },
        SqlType::VarBinary => match value {
            SqlValue::VarBinary(b) => SqlValue::VarBinary(b.clone()),
            SqlValue::String(s) => SqlValue::VarBinary(decode_hex(s)?),
            _ => return Err(mismatch()),
        },
        SqlType::Numeric => return Err("NUMERIC is a declared-only parameter type".into()),
    };
    // A narrowed value that lands on the target's NULL sentinel would turn a
    // real value into NULL; reject it instead.
    if coerced.is_null() {
        return Err(format!(
            "value collides with the {sql_type} NULL sentinel"
        ));
    }
    Ok(coerced)
}

fn out_of_range(n: i64, sql_type: SqlType) -> String {
    format!("value {n} is out of range for {sql_type}")
}

fn decode_hex(text: &str) -> Result<Vec<u8>, String> {
    if text.len() % 2 != 0 {
        return Err("hex string for VARBINARY has odd length".into());
    }
    let digit = |b: u8| -> Result<u8, String> {
        match b {
            b'0'..=b'9' => Ok(b - b'0'),
            b'a'..=b'f' => Ok(b - b'a' + 10),
            b'A'..=b'F' => Ok(b - b'A' + 10),
            _ => Err(format!("invalid hex digit '{}' for VARBINARY", b as char)),
        }
    };
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len() / 2);
    for pair in bytes.chunks_exact(2) {
        out.push((digit(pair[0])? << 4) | digit(pair[1])?);
    }
    Ok(out)
}
