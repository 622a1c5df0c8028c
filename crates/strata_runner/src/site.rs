//! Trait seams between the runner and its external collaborators.
//!
//! The runner is transport- and engine-agnostic: the owning site supplies
//! a [`SiteConnection`], the transaction coordinator supplies a
//! [`TransactionHandle`] per call, and the partition ring supplies a
//! [`Hashinator`]. All methods take `&self`; implementations use interior
//! mutability, since a runner and its collaborators live on one site
//! thread.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::oneshot;

use strata_core::{ClientResponse, ParameterSet, ResultTable, SqlType, SqlValue};

use crate::adhoc::PlannedBatch;
use crate::coerce::ProcArg;
use crate::errors::EngineError;
use crate::plan_repo::PlanHash;
use crate::statement::StatementDescriptor;

/// Reserved aggregation dependency id.
pub const AGG_DEP_ID: i32 = 1;

/// Flag OR-ed into the high bit of a dependency id when the dependency is
/// produced by every participating partition.
pub const MULTIPARTITION_DEPENDENCY: i32 = i32::MIN;

/// Results of a slow-path dispatch, keyed by dependency id.
pub type DependencyResults = HashMap<i32, Vec<ResultTable>>;

/// How one invocation arrived at this site.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvocationKind {
    /// First execution, initiated by a client.
    Original,
    /// Replay of a primary's execution; determinism accessors must report
    /// the primary's recorded identifiers, not the local ones.
    Replicated {
        original_txn_id: i64,
        original_unique_id: i64,
    },
}

/// The invocation record carried by the transaction.
#[derive(Clone, Debug)]
pub struct StoredInvocation {
    pub procedure_name: String,
    pub kind: InvocationKind,
    pub params: ParameterSet,
}

impl StoredInvocation {
    pub fn param_at(&self, index: usize) -> Option<&SqlValue> {
        self.params.value_at(index)
    }

    pub fn is_replicated(&self) -> bool {
        matches!(self.kind, InvocationKind::Replicated { .. })
    }
}

/// One fragment entry of a fragment task message.
#[derive(Clone, Debug)]
pub struct FragmentEntry {
    pub plan_hash: PlanHash,
    pub output_dep_id: i32,
    /// Canonical parameter bytes for this fragment.
    pub params: Vec<u8>,
    /// Full plan bytes for fragments the remote catalog cannot resolve
    /// (ad-hoc statements).
    pub custom_plan: Option<Vec<u8>>,
    /// Dependency this fragment must collect before it can run.
    pub input_dep_id: Option<i32>,
}

/// Work message routed to one or all participants of a transaction.
#[derive(Clone, Debug)]
pub struct FragmentTask {
    pub initiator_id: i64,
    pub coordinator_site_id: i64,
    pub txn_id: i64,
    pub unique_id: i64,
    pub read_only: bool,
    pub final_task: bool,
    pub for_replay: bool,
    pub procedure_name: Option<String>,
    pub batch_index: Option<i32>,
    entries: Vec<FragmentEntry>,
}

impl FragmentTask {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        initiator_id: i64,
        coordinator_site_id: i64,
        txn_id: i64,
        unique_id: i64,
        read_only: bool,
        final_task: bool,
        for_replay: bool,
    ) -> Self {
        Self {
            initiator_id,
            coordinator_site_id,
            txn_id,
            unique_id,
            read_only,
            final_task,
            for_replay,
            procedure_name: None,
            batch_index: None,
            entries: Vec::new(),
        }
    }

    pub fn set_procedure_name(&mut self, name: &str) {
        self.procedure_name = Some(name.to_owned());
    }

    pub fn set_batch_index(&mut self, batch_index: i32) {
        self.batch_index = Some(batch_index);
    }

    pub fn add_fragment(&mut self, plan_hash: PlanHash, output_dep_id: i32, params: Vec<u8>) {
        self.entries.push(FragmentEntry {
            plan_hash,
            output_dep_id,
            params,
            custom_plan: None,
            input_dep_id: None,
        });
    }

    pub fn add_custom_fragment(
        &mut self,
        plan_hash: PlanHash,
        output_dep_id: i32,
        params: Vec<u8>,
        plan: Vec<u8>,
    ) {
        self.entries.push(FragmentEntry {
            plan_hash,
            output_dep_id,
            params,
            custom_plan: Some(plan),
            input_dep_id: None,
        });
    }

    /// Declare an input dependency for the most recently added fragment.
    pub fn set_last_input_dep(&mut self, dep_id: i32) {
        if let Some(entry) = self.entries.last_mut() {
            entry.input_dep_id = Some(dep_id);
        }
    }

    pub fn entries(&self) -> &[FragmentEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Parameter payload handed to the fast path: writes reuse the memoized
/// canonical bytes, reads ship the live parameter set.
#[derive(Clone, Debug)]
pub enum ParamPayload {
    Serialized(Vec<u8>),
    Inline(ParameterSet),
}

/// One fast-path engine call covering a whole sub-batch.
#[derive(Clone, Debug)]
pub struct PlanFragmentBatch {
    pub fragment_ids: Vec<i64>,
    pub params: Vec<ParamPayload>,
    pub txn_id: i64,
    pub sp_handle: i64,
    pub unique_id: i64,
    pub read_only: bool,
}

#[derive(Clone, Debug)]
pub struct LoadTableRequest {
    pub txn_id: i64,
    pub sp_handle: i64,
    pub cluster_name: String,
    pub database_name: String,
    pub table_name: String,
    pub data: ResultTable,
    pub return_unique_violations: bool,
    pub should_dr_stream: bool,
}

/// Embedded reference SQL engine used by the test backend mode: statements
/// run directly against it instead of being dispatched as plan fragments.
pub trait ReferenceBackend: Send + Sync {
    fn run_statement(
        &self,
        stmt: &StatementDescriptor,
        params: &ParameterSet,
    ) -> Result<ResultTable, EngineError>;
}

/// The site-side execution surface the runner drives.
pub trait SiteConnection: Send + Sync {
    fn site_id(&self) -> i64;

    /// Partition this site serves. For a multi-partition transaction this
    /// is the coordinator's partition, not a data partition.
    fn partition_id(&self) -> i32;

    /// Publish (or clear) the procedure currently running on this site.
    fn set_procedure_name(&self, name: Option<&str>);

    /// Publish the current batch index for progress reporting.
    fn set_batch(&self, batch_index: i32);

    /// The embedded reference backend, when the site is configured for it.
    fn reference_backend(&self) -> Option<&dyn ReferenceBackend> {
        None
    }

    /// Single-partition fast path: run a packed sub-batch in one engine
    /// call, returning one result table per fragment in order.
    fn execute_plan_fragments(
        &self,
        batch: PlanFragmentBatch,
    ) -> Result<Vec<ResultTable>, EngineError>;

    fn load_table(&self, request: LoadTableRequest) -> Result<Option<Vec<u8>>, EngineError>;

    /// Suspend until every dependency registered through
    /// [`TransactionHandle::setup_procedure_resume`] has been collected.
    fn recursable_run(
        &self,
        txn: &dyn TransactionHandle,
    ) -> Result<DependencyResults, EngineError>;
}

/// Per-call handle supplied by the transaction coordinator.
pub trait TransactionHandle: Send + Sync {
    fn txn_id(&self) -> i64;
    fn sp_handle(&self) -> i64;
    fn unique_id(&self) -> i64;
    fn initiator_id(&self) -> i64;
    fn is_read_only(&self) -> bool;
    fn is_for_replay(&self) -> bool;
    fn is_single_partition(&self) -> bool;
    fn invocation(&self) -> Option<StoredInvocation>;

    /// Allocate the next dependency id, monotonic within the transaction.
    fn next_dependency_id(&self) -> i32;

    /// Register the dependency ids whose arrival resumes the procedure.
    fn setup_procedure_resume(&self, is_final: bool, deps: &[i32]);

    /// Install work executed only on the coordinating site.
    fn create_local_fragment_work(&self, task: FragmentTask, non_transactional: bool);

    /// Install work executed by every participant, with one replicated-read
    /// flag per fragment entry.
    fn create_all_participating_fragment_work(
        &self,
        task: FragmentTask,
        replicated_read: Vec<bool>,
    );

    /// One-way completion latch.
    fn set_done(&self);
    fn is_done(&self) -> bool;

    /// One-way rollback latch.
    fn set_needs_rollback(&self);
    fn needs_rollback(&self) -> bool;

    fn store_response(&self, response: ClientResponse);

    /// Record the determinism hash for this transaction. A `None` hash is
    /// coerced to 0; downstream comparison code expects a value, and the
    /// zero default keeps hashless and hash-bearing replicas comparable.
    fn set_hash(&self, hash: Option<i32>);
    fn hash(&self) -> i32;
}

/// Partition ring configurations the runner must distinguish.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashinatorKind {
    /// Pre-elastic ring. Partition checks are skipped for it: legacy
    /// deployments hash single-partition system parameters as raw bytes
    /// and would land on the wrong partition under re-checking.
    Legacy,
    Elastic,
}

pub trait Hashinator: Send + Sync {
    fn kind(&self) -> HashinatorKind;

    fn partition_for_parameter(
        &self,
        sql_type: SqlType,
        value: &SqlValue,
    ) -> anyhow::Result<i32>;
}

/// Asynchronous ad-hoc planner. Planning happens off the site thread; the
/// runner blocks on the returned channel, so timeout and cancellation are
/// the planner's responsibility.
pub trait AdHocPlanner: Send + Sync {
    fn plan(&self, sql: &str, args: &[ProcArg], single_partition: bool)
        -> oneshot::Receiver<PlannedBatch>;
}

/// Opaque execution context injected as the first parameter of system
/// procedure invocations.
pub trait SystemProcedureContext: Send + Sync {
    fn site_id(&self) -> i64;
    fn partition_id(&self) -> i32;
    fn cluster_name(&self) -> &str;
    fn database_name(&self) -> &str;
}

/// Shorthand used throughout the runner.
pub type SharedSite = Arc<dyn SiteConnection>;
pub type SharedTxn = Arc<dyn TransactionHandle>;
