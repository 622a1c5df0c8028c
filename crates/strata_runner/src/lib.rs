//! Per-site stored procedure runner for Strata.
//!
//! This crate is the execution engine that drives a single stored
//! procedure invocation through its lifecycle: parameter coercion,
//! statement queueing and batching, dispatch over the single-partition
//! fast path or the multi-partition slow path, determinism hashing,
//! result assembly, and structured error responses. The SQL planner, site
//! execution context, fragment router, and catalog loader are external
//! collaborators reached through the trait seams in [`site`].

pub mod adhoc;
pub mod batch;
pub mod coerce;
pub mod determinism;
pub mod errors;
pub mod expectations;
pub mod plan_repo;
pub mod procedure;
pub mod runner;
pub mod site;
pub mod statement;
pub mod stats;
pub mod unique_id;

pub use batch::MAX_BATCH_SIZE;
pub use coerce::{ParamSlot, ProcArg};
pub use errors::{EngineError, RunnerError};
pub use expectations::Expectation;
pub use plan_repo::{PlanHash, PlanRepository};
pub use procedure::{
    FragmentResult, NativeProcedure, PartitionColumn, ProcedureDescriptor, ProcedureImpl,
    ProcedureReturn, ScriptValue, ScriptedProcedure,
};
pub use runner::ProcedureRunner;
pub use site::{
    AdHocPlanner, DependencyResults, FragmentTask, Hashinator, HashinatorKind, InvocationKind,
    ParamPayload, PlanFragmentBatch, ReferenceBackend, SiteConnection, StoredInvocation,
    SystemProcedureContext, TransactionHandle, AGG_DEP_ID, MULTIPARTITION_DEPENDENCY,
};
pub use statement::{
    CatalogFragment, CatalogStatement, PlanFrag, QueuedStatement, SqlStmt, StatementDescriptor,
};
pub use stats::{ProcedureStatsCollector, ProcedureStatsSnapshot};
