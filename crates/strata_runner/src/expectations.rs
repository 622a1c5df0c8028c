//! Row-count post-conditions attachable to a queued statement.

use strata_core::ResultTable;

use crate::errors::RunnerError;
use crate::statement::StatementDescriptor;

/// A lightweight assertion on a statement's result shape, checked after
/// the batch it belongs to has executed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Expectation {
    /// The result must contain no rows.
    Empty,
    /// The result must contain exactly one row.
    OneRow,
    /// The result must contain at most one row.
    ZeroOrOneRow,
    /// The result must contain at least one row.
    NonEmpty,
    /// The result must be a single row with a single column.
    Scalar,
}

impl Expectation {
    pub fn check(
        &self,
        procedure_name: &str,
        stmt: &StatementDescriptor,
        statement_index: usize,
        result: &ResultTable,
    ) -> Result<(), RunnerError> {
        let rows = result.row_count();
        let violation = match self {
            Expectation::Empty if rows != 0 => Some(format!("expected no rows, got {rows}")),
            Expectation::OneRow if rows != 1 => Some(format!("expected exactly one row, got {rows}")),
            Expectation::ZeroOrOneRow if rows > 1 => {
                Some(format!("expected at most one row, got {rows}"))
            }
            Expectation::NonEmpty if rows == 0 => Some("expected at least one row, got none".into()),
            Expectation::Scalar if result.scalar().is_none() => Some(format!(
                "expected a single scalar cell, got {rows} rows of {} columns",
                result.columns().len()
            )),
            _ => None,
        };
        match violation {
            None => Ok(()),
            Some(detail) => Err(RunnerError::ExpectationMismatch {
                statement_index,
                detail: format!(
                    "{detail} (procedure {procedure_name}, statement '{}')",
                    stmt.sql()
                ),
            }),
        }
    }
}
