//! Procedure implementations and return-value coercion.
//!
//! Entry points are registered explicitly at install time as one arm of
//! [`ProcedureImpl`]; the runner dispatches over the tag instead of
//! discovering methods at runtime. Native code returns the typed
//! [`ProcedureReturn`]; scripted code returns a dynamic [`ScriptValue`]
//! that goes through the full coercion rule set.

use strata_core::{ParameterSet, ResultTable, SqlType, SqlValue};

use crate::errors::RunnerError;
use crate::runner::ProcedureRunner;
use crate::site::DependencyResults;
use crate::statement::CatalogStatement;

/// Typed return of a native procedure.
#[derive(Debug)]
pub enum ProcedureReturn {
    None,
    Table(ResultTable),
    Tables(Vec<ResultTable>),
    /// Surfaced to the client as a one-column, one-row BIGINT table.
    Scalar(i64),
}

impl ProcedureReturn {
    pub fn into_tables(self) -> Vec<ResultTable> {
        match self {
            ProcedureReturn::None => Vec::new(),
            ProcedureReturn::Table(table) => vec![table],
            ProcedureReturn::Tables(tables) => tables,
            ProcedureReturn::Scalar(value) => vec![ResultTable::scalar_bigint(value)],
        }
    }
}

/// Dynamic value returned from a hosted-script procedure.
#[derive(Debug)]
pub enum ScriptValue {
    Null,
    Integer(i64),
    Table(ResultTable),
    /// A script-level array; elements may be missing or of foreign type.
    List(Vec<Option<ScriptValue>>),
    /// A value of a type the runner cannot convert, named for diagnostics.
    Other(&'static str),
}

impl ScriptValue {
    fn type_name(&self) -> &'static str {
        match self {
            ScriptValue::Null => "null",
            ScriptValue::Integer(_) => "integer",
            ScriptValue::Table(_) => "table",
            ScriptValue::List(_) => "list",
            ScriptValue::Other(name) => name,
        }
    }
}

/// Result of a system procedure executing one distributed fragment.
#[derive(Debug)]
pub struct FragmentResult {
    pub dep_id: i32,
    pub table: ResultTable,
}

/// A natively compiled procedure body.
///
/// `run` is the registered entry point. The runner passes itself so the
/// body can queue and execute SQL, set app status, and read transaction
/// identity; errors propagate with `?` and are classified by the runner.
pub trait NativeProcedure: Send {
    fn run(
        &mut self,
        runner: &mut ProcedureRunner,
        params: &[SqlValue],
    ) -> Result<ProcedureReturn, RunnerError>;

    /// Distributed-fragment entry point, implemented only by system
    /// procedures that participate in multi-partition work.
    fn execute_plan_fragment(
        &mut self,
        runner: &mut ProcedureRunner,
        dependencies: &DependencyResults,
        fragment_id: i64,
        params: &ParameterSet,
    ) -> anyhow::Result<FragmentResult> {
        let _ = (runner, dependencies, fragment_id, params);
        anyhow::bail!("procedure does not execute distributed plan fragments")
    }
}

/// A procedure hosted in a script dialect.
pub trait ScriptedProcedure: Send {
    fn invoke(
        &mut self,
        runner: &mut ProcedureRunner,
        params: &[SqlValue],
    ) -> Result<ScriptValue, RunnerError>;
}

/// The registered implementation of one installed procedure.
pub enum ProcedureImpl {
    Native(Box<dyn NativeProcedure>),
    Scripted(Box<dyn ScriptedProcedure>),
    /// No user code: the procedure is its single catalog statement,
    /// flushed as a final batch with the call's own parameters.
    SingleStatement,
}

/// Partitioning column of a single-partition procedure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PartitionColumn {
    pub index: usize,
    pub column_type: SqlType,
}

/// Catalog-derived description of an installed procedure.
#[derive(Clone, Debug)]
pub struct ProcedureDescriptor {
    pub name: String,
    pub read_only: bool,
    pub single_partition: bool,
    /// System procedures flagged to run once on every site.
    pub every_site: bool,
    pub system: bool,
    /// True for the ad-hoc wrapper procedures, whose partitioning value
    /// travels in parameter slot 0 with its type tag in slot 1.
    pub adhoc: bool,
    pub partition: Option<PartitionColumn>,
    pub param_types: Vec<SqlType>,
    /// Present when the implementation is [`ProcedureImpl::SingleStatement`].
    pub single_statement: Option<CatalogStatement>,
}

/// Convert a script return into result tables, applying the full rule set:
/// null becomes an empty array, a table stands alone, lists must be dense
/// tables, integers become a scalar BIGINT table, anything else is a
/// return-type error.
pub fn results_from_script(value: ScriptValue) -> Result<Vec<ResultTable>, RunnerError> {
    match value {
        ScriptValue::Null => Ok(Vec::new()),
        ScriptValue::Table(table) => Ok(vec![table]),
        ScriptValue::Integer(value) => Ok(vec![ResultTable::scalar_bigint(value)]),
        ScriptValue::List(items) => {
            let mut tables = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Some(ScriptValue::Table(table)) => tables.push(table),
                    None => {
                        return Err(RunnerError::InvocationReturnError(
                            "result table arrays with non-zero length cannot contain null values"
                                .into(),
                        ))
                    }
                    Some(other) => {
                        return Err(RunnerError::ReturnTypeError(format!(
                            "result table array contained a {}",
                            other.type_name()
                        )))
                    }
                }
            }
            Ok(tables)
        }
        other @ ScriptValue::Other(_) => {
            Err(RunnerError::ReturnTypeError(other.type_name().to_owned()))
        }
    }
}
