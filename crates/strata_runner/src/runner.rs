//! The per-call invocation driver.
//!
//! A `ProcedureRunner` is created once per installed procedure per site
//! and driven by exactly one site thread. Each call walks the same state
//! machine: reset, context injection, parameter coercion, dispatch into
//! the registered procedure implementation (which queues and executes SQL
//! through this runner), failure classification, response assembly, and
//! unconditional teardown. Exactly one [`ClientResponse`] leaves `call`
//! unless a fatal-to-server error propagates to crash the site.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{trace, warn};

use strata_core::{
    ClientResponse, ParameterSet, ResultTable, SqlType, SqlValue, StatusCode,
    UNINITIALIZED_APP_STATUS_CODE,
};

use crate::adhoc;
use crate::coerce::{self, CallArg, ParamSlot, ProcArg};
use crate::determinism::DeterminismHash;
use crate::errors::{build_error_message, RunnerError};
use crate::expectations::Expectation;
use crate::plan_repo::PlanRepository;
use crate::procedure::{
    results_from_script, FragmentResult, ProcedureDescriptor, ProcedureImpl, ProcedureReturn,
};
use crate::site::{
    AdHocPlanner, DependencyResults, Hashinator, HashinatorKind, InvocationKind, LoadTableRequest,
    SharedSite, SharedTxn, SystemProcedureContext,
};
use crate::statement::{widen_declared_type, QueuedStatement, SqlStmt, StatementDescriptor};
use crate::stats::ProcedureStatsCollector;
use crate::unique_id;

/// Prefix carried by every error status string.
const ERROR_STATUS_PREFIX: &str = "STRATA ERROR: ";

pub struct ProcedureRunner {
    pub(crate) descriptor: ProcedureDescriptor,
    procedure: Option<ProcedureImpl>,
    call_param_slots: Vec<ParamSlot>,
    single_stmt: Option<Arc<StatementDescriptor>>,

    pub(crate) site: SharedSite,
    sysproc_context: Option<Arc<dyn SystemProcedureContext>>,
    planner: Arc<dyn AdHocPlanner>,
    pub(crate) plan_repo: Arc<PlanRepository>,
    stats: Arc<ProcedureStatsCollector>,

    // Per-call state, reset at teardown.
    pub(crate) txn: Option<SharedTxn>,
    pub(crate) batch: Vec<QueuedStatement>,
    pub(crate) seen_final_batch: bool,
    pub(crate) batch_index: i32,
    pub(crate) input_crc: DeterminismHash,
    status: StatusCode,
    status_string: Option<String>,
    app_status_code: i8,
    app_status_string: Option<String>,
    cached_rng: Option<StdRng>,
}

impl ProcedureRunner {
    pub fn new(
        descriptor: ProcedureDescriptor,
        implementation: ProcedureImpl,
        site: SharedSite,
        planner: Arc<dyn AdHocPlanner>,
        plan_repo: Arc<PlanRepository>,
        sysproc_context: Option<Arc<dyn SystemProcedureContext>>,
    ) -> anyhow::Result<ProcedureRunner> {
        anyhow::ensure!(
            !descriptor.system || sysproc_context.is_some(),
            "system procedure {} requires an execution context",
            descriptor.name
        );

        let single_statement = matches!(implementation, ProcedureImpl::SingleStatement);
        let single_stmt = if single_statement {
            let catalog_stmt = descriptor.single_statement.as_ref().ok_or_else(|| {
                anyhow::anyhow!(
                    "single-statement procedure {} has no compiled statement",
                    descriptor.name
                )
            })?;
            Some(StatementDescriptor::from_catalog(catalog_stmt, &plan_repo)?)
        } else {
            None
        };

        let mut call_param_slots = Vec::with_capacity(descriptor.param_types.len() + 1);
        if descriptor.system {
            call_param_slots.push(ParamSlot::SystemContext);
        }
        for sql_type in &descriptor.param_types {
            // Single-statement procedures take their declared types through
            // the install-time widening rewrite.
            let declared = if single_statement {
                widen_declared_type(*sql_type)
            } else {
                *sql_type
            };
            call_param_slots.push(ParamSlot::Typed(declared));
        }

        let stats = Arc::new(ProcedureStatsCollector::new(
            site.site_id(),
            site.partition_id(),
            &descriptor.name,
        ));

        Ok(ProcedureRunner {
            descriptor,
            procedure: Some(implementation),
            call_param_slots,
            single_stmt,
            site,
            sysproc_context,
            planner,
            plan_repo,
            stats,
            txn: None,
            batch: Vec::with_capacity(100),
            seen_final_batch: false,
            batch_index: -1,
            input_crc: DeterminismHash::new(),
            status: StatusCode::Success,
            status_string: None,
            app_status_code: UNINITIALIZED_APP_STATUS_CODE,
            app_status_string: None,
            cached_rng: None,
        })
    }

    pub fn procedure_name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn is_system_procedure(&self) -> bool {
        self.descriptor.system
    }

    pub fn is_every_site(&self) -> bool {
        self.descriptor.system && self.descriptor.every_site
    }

    pub fn is_read_only(&self) -> bool {
        self.descriptor.read_only
    }

    pub fn stats(&self) -> &Arc<ProcedureStatsCollector> {
        &self.stats
    }

    pub fn system_context(&self) -> Option<&Arc<dyn SystemProcedureContext>> {
        self.sysproc_context.as_ref()
    }

    /// Install the per-call transaction handle.
    pub fn setup_transaction(&mut self, txn: SharedTxn) {
        self.txn = Some(txn);
    }

    /// The installed transaction handle; restricted to system procedures.
    pub fn txn_state(&self) -> Option<&SharedTxn> {
        debug_assert!(self.descriptor.system);
        self.txn.as_ref()
    }

    pub(crate) fn txn_handle(&self) -> Result<&SharedTxn, RunnerError> {
        self.txn
            .as_ref()
            .ok_or_else(|| RunnerError::unexpected("no transaction handle installed for this call"))
    }

    // ---- surface exposed to procedure code -------------------------------

    pub fn set_app_status_code(&mut self, code: i8) {
        self.app_status_code = code;
    }

    pub fn set_app_status_string(&mut self, status: impl Into<String>) {
        self.app_status_string = Some(status.into());
    }

    /// The transaction id used for determinism, not for ordering. Replayed
    /// invocations report the primary's recorded id.
    pub fn transaction_id(&self) -> Result<i64, RunnerError> {
        let txn = self.txn_handle()?;
        match txn.invocation().map(|inv| inv.kind) {
            Some(InvocationKind::Replicated {
                original_txn_id, ..
            }) => Ok(original_txn_id),
            _ => Ok(txn.txn_id()),
        }
    }

    /// The unique id for this call: timestamp in the high bits, counter and
    /// partition in the low bits. Replays report the primary's value.
    pub fn unique_id(&self) -> Result<i64, RunnerError> {
        let txn = self.txn_handle()?;
        match txn.invocation().map(|inv| inv.kind) {
            Some(InvocationKind::Replicated {
                original_unique_id, ..
            }) => Ok(original_unique_id),
            _ => Ok(txn.unique_id()),
        }
    }

    /// Wall-clock time recorded in the unique id's timestamp field.
    pub fn transaction_time(&self) -> Result<SystemTime, RunnerError> {
        let ms = unique_id::timestamp_ms_from_unique_id(self.unique_id()?);
        Ok(UNIX_EPOCH + Duration::from_millis(ms as u64))
    }

    /// The per-call RNG, seeded from the unique id. All calls within one
    /// invocation share the same generator; it is discarded at teardown.
    pub fn seeded_rng(&mut self) -> Result<&mut StdRng, RunnerError> {
        if self.cached_rng.is_none() {
            let seed = self.unique_id()? as u64;
            self.cached_rng = Some(StdRng::seed_from_u64(seed));
        }
        Ok(self
            .cached_rng
            .as_mut()
            .expect("rng was seeded in the branch above"))
    }

    pub fn queue_sql(&mut self, stmt: &SqlStmt, args: &[ProcArg]) -> Result<(), RunnerError> {
        self.queue_prepared(stmt, None, args)
    }

    pub fn queue_sql_with_expectation(
        &mut self,
        stmt: &SqlStmt,
        expectation: Expectation,
        args: &[ProcArg],
    ) -> Result<(), RunnerError> {
        self.queue_prepared(stmt, Some(expectation), args)
    }

    fn queue_prepared(
        &mut self,
        stmt: &SqlStmt,
        expectation: Option<Expectation>,
        args: &[ProcArg],
    ) -> Result<(), RunnerError> {
        let descriptor = stmt.descriptor().ok_or(RunnerError::NullStatement)?.clone();
        self.queue_statement(descriptor, expectation, args)
    }

    pub(crate) fn queue_statement(
        &mut self,
        stmt: Arc<StatementDescriptor>,
        expectation: Option<Expectation>,
        args: &[ProcArg],
    ) -> Result<(), RunnerError> {
        if self.seen_final_batch {
            return Err(RunnerError::DoubleFinalBatch {
                procedure: self.descriptor.name.clone(),
            });
        }
        let params = coerce::coerce_statement_params(&stmt, args)?;
        let mut queued = QueuedStatement::new(stmt, params, expectation);
        // Fail closed: a replica that cannot serialize these parameters
        // cannot prove it agrees with its peers, so the invocation aborts.
        self.input_crc.accumulate(&mut queued).map_err(|err| {
            RunnerError::user_abort(format!(
                "unable to serialize parameters of statement '{}' for determinism hashing: {err}",
                queued.stmt().sql()
            ))
        })?;
        self.batch.push(queued);
        Ok(())
    }

    /// Queue ad-hoc SQL through the external planner. Blocks the site
    /// thread until the planner answers.
    pub fn queue_sql_adhoc(&mut self, sql: &str, args: &[ProcArg]) -> Result<(), RunnerError> {
        if sql.trim().is_empty() {
            return Err(RunnerError::unexpected("ad-hoc SQL statement was empty"));
        }
        if self.seen_final_batch {
            return Err(RunnerError::DoubleFinalBatch {
                procedure: self.descriptor.name.clone(),
            });
        }

        let receiver = self
            .planner
            .plan(sql, args, self.descriptor.single_partition);
        let batch = receiver.blocking_recv().map_err(|_| RunnerError::PlannerError {
            sql: sql.to_owned(),
            detail: "planner dropped the request".to_owned(),
        })?;

        if let Some(detail) = batch.error {
            return Err(RunnerError::PlannerError {
                sql: sql.to_owned(),
                detail,
            });
        }
        if self.descriptor.read_only && !batch.read_only {
            return Err(RunnerError::DmlFromReadOnly {
                sql: sql.to_owned(),
            });
        }
        let mut statements = batch.statements;
        if statements.len() != 1 {
            return Err(RunnerError::PlannerError {
                sql: sql.to_owned(),
                detail: format!(
                    "planner returned {} statements where exactly 1 was expected",
                    statements.len()
                ),
            });
        }
        let planned = statements.remove(0);

        let descriptor = adhoc::descriptor_from_planned(&planned, &self.plan_repo);

        // Planner-extracted constants cannot be combined with caller
        // arguments: the caller must pass none, and the extracted vector
        // must match the statement's declared arity.
        let effective_args: Vec<ProcArg> = match planned.extracted_params {
            Some(extracted) => {
                if !args.is_empty() {
                    return Err(RunnerError::ExtractedParamsConflict {
                        sql: sql.to_owned(),
                        detail: format!(
                            "number of arguments provided was {} where 0 were expected",
                            args.len()
                        ),
                    });
                }
                if extracted.len() != descriptor.param_types().len() {
                    return Err(RunnerError::ExtractedParamsConflict {
                        sql: sql.to_owned(),
                        detail: format!(
                            "the wrong number of arguments ({} vs the {} expected) were extracted",
                            extracted.len(),
                            descriptor.param_types().len()
                        ),
                    });
                }
                extracted.into_iter().map(Some).collect()
            }
            None => args.to_vec(),
        };

        self.queue_statement(descriptor, None, &effective_args)
    }

    /// Bulk-load rows into a table within the current transaction.
    pub fn load_table(
        &mut self,
        cluster_name: &str,
        database_name: &str,
        table_name: &str,
        data: Option<ResultTable>,
        return_unique_violations: bool,
        should_dr_stream: bool,
    ) -> Result<Option<Vec<u8>>, RunnerError> {
        let Some(data) = data else {
            return Ok(None);
        };
        if data.row_count() == 0 {
            return Ok(None);
        }
        let txn = self.txn_handle()?;
        let request = LoadTableRequest {
            txn_id: txn.txn_id(),
            sp_handle: txn.sp_handle(),
            cluster_name: cluster_name.to_owned(),
            database_name: database_name.to_owned(),
            table_name: table_name.to_owned(),
            data,
            return_unique_violations,
            should_dr_stream,
        };
        self.site.load_table(request).map_err(|err| match err {
            crate::errors::EngineError::Fatal(m) => RunnerError::FatalToServer(m),
            other => RunnerError::user_abort(format!("failed to load table {table_name}: {other}")),
        })
    }

    // ---- the call state machine ------------------------------------------

    /// Run one invocation to completion.
    ///
    /// Returns `Err` only for fatal-to-server conditions, in which case no
    /// response exists and the site must crash; every other outcome is a
    /// response. Teardown runs on every path.
    pub fn call(&mut self, args: Vec<ProcArg>) -> Result<ClientResponse, RunnerError> {
        let outcome = self.call_inner(args);
        self.teardown();
        outcome
    }

    fn call_inner(&mut self, args: Vec<ProcArg>) -> Result<ClientResponse, RunnerError> {
        // Per-call state must have been reset by the previous teardown.
        debug_assert_eq!(self.status, StatusCode::Success);
        debug_assert!(self.status_string.is_none());
        debug_assert_eq!(self.app_status_code, UNINITIALIZED_APP_STATUS_CODE);
        debug_assert!(self.app_status_string.is_none());
        debug_assert!(self.cached_rng.is_none());
        debug_assert!(self.batch.is_empty());

        self.input_crc.reset();
        self.batch_index = -1;
        self.site.set_procedure_name(Some(&self.descriptor.name));
        self.stats.begin_procedure();

        // Inject the system procedure context as parameter zero before any
        // arity checking happens.
        let mut call_args: Vec<CallArg> = Vec::with_capacity(args.len() + 1);
        if self.descriptor.system {
            call_args.push(CallArg::SystemContext);
        }
        call_args.extend(args.into_iter().map(CallArg::Value));

        let params = match coerce::coerce_call_args(
            &self.descriptor.name,
            &self.call_param_slots,
            &call_args,
        ) {
            Ok(values) => values,
            Err(err) => {
                self.stats.end_procedure(false, true);
                self.status = StatusCode::GracefulFailure;
                return Ok(self.failure_response(StatusCode::GracefulFailure, &err.to_string()));
            }
        };

        let mut implementation = self.procedure.take().ok_or_else(|| {
            RunnerError::FatalToServer("procedure implementation missing during call".into())
        })?;
        let outcome: Result<Vec<ResultTable>, RunnerError> = match &mut implementation {
            ProcedureImpl::Native(native) => {
                trace!(procedure = %self.descriptor.name, "invoking native entry point");
                native.run(self, &params).map(ProcedureReturn::into_tables)
            }
            ProcedureImpl::Scripted(script) => {
                trace!(procedure = %self.descriptor.name, "invoking scripted entry point");
                script.invoke(self, &params).and_then(results_from_script)
            }
            ProcedureImpl::SingleStatement => self.run_single_statement(&params),
        };
        self.procedure = Some(implementation);

        let mut abort = false;
        let mut error = false;
        let mut results: Vec<ResultTable> = Vec::new();
        let mut response: Option<ClientResponse> = None;
        match outcome {
            Ok(tables) => results = tables,
            Err(err) if err.is_fatal() => {
                // End stats with failure, then let the error crash the site.
                self.stats.end_procedure(false, true);
                return Err(err);
            }
            Err(err) => {
                if err.classify().status == StatusCode::UserAbort {
                    abort = true;
                } else {
                    error = true;
                }
                response = Some(self.error_response(&err));
            }
        }

        self.stats.end_procedure(abort, error);

        let mut retval = match response {
            Some(resp) => resp,
            None => ClientResponse::new(
                self.status,
                self.app_status_code,
                self.app_status_string.clone(),
                results,
                self.status_string.clone(),
            ),
        };

        let hash = self.input_crc.value() as i32;
        if retval.is_transactionally_successful() && hash != 0 {
            retval.set_hash(hash);
        }
        if let Some(txn) = &self.txn {
            txn.set_hash(retval.hash());
            if txn.invocation().is_some_and(|inv| inv.is_replicated()) {
                retval.convert_results_to_hash_for_determinism();
            }
        }

        Ok(retval)
    }

    fn run_single_statement(
        &mut self,
        params: &[SqlValue],
    ) -> Result<Vec<ResultTable>, RunnerError> {
        let stmt = self.single_stmt.clone().ok_or_else(|| {
            RunnerError::unexpected("single-statement procedure has no compiled statement")
        })?;
        let args: Vec<ProcArg> = params.iter().cloned().map(Some).collect();

        let site = Arc::clone(&self.site);
        if let Some(backend) = site.reference_backend() {
            let stmt_params = coerce::coerce_statement_params(&stmt, &args)?;
            let table = backend
                .run_statement(&stmt, &stmt_params)
                .map_err(RunnerError::expected_backend_error)?;
            return Ok(vec![table]);
        }

        self.queue_statement(stmt, None, &args)?;
        self.execute_sql(true)
    }

    fn teardown(&mut self) {
        self.batch.clear();
        self.txn = None;
        self.status = StatusCode::Success;
        self.status_string = None;
        self.app_status_code = UNINITIALIZED_APP_STATUS_CODE;
        self.app_status_string = None;
        self.cached_rng = None;
        self.seen_final_batch = false;
        self.site.set_procedure_name(None);
    }

    fn error_response(&self, err: &RunnerError) -> ClientResponse {
        let (status, message) = build_error_message(err, &self.descriptor.name);
        self.failure_response(status, &message)
    }

    fn failure_response(&self, status: StatusCode, message: &str) -> ClientResponse {
        ClientResponse::new(
            status,
            self.app_status_code,
            self.app_status_string.clone(),
            Vec::new(),
            Some(format!("{ERROR_STATUS_PREFIX}{message}")),
        )
    }

    // ---- partition check --------------------------------------------------

    /// Whether this transaction's partitioning parameter still hashes to
    /// the partition this site serves. `false` tells the caller to restart
    /// the transaction.
    pub fn check_partition(
        &self,
        txn: &dyn crate::site::TransactionHandle,
        hashinator: &dyn Hashinator,
    ) -> bool {
        if !self.descriptor.single_partition {
            // Multi-partition work runs on the coordinator site, whose
            // partition id is not a data partition; nothing to compare.
            return true;
        }
        if hashinator.kind() == HashinatorKind::Legacy {
            // The legacy ring hashes single-partition system parameters as
            // raw bytes and would disagree with itself here. Skip the check.
            return true;
        }
        let Some(invocation) = txn.invocation() else {
            warn!(
                sp_handle = txn.sp_handle(),
                "transaction carries no invocation record; cannot check partitioning"
            );
            return false;
        };

        let (parameter_type, parameter) = if self.descriptor.adhoc {
            // Ad-hoc single-partition wrappers put the partitioning value in
            // slot 0 and its type tag in slot 1.
            let tag = invocation
                .param_at(1)
                .and_then(SqlValue::as_integer)
                .and_then(|tag| u8::try_from(tag).ok())
                .and_then(SqlType::from_code);
            match (invocation.param_at(0), tag) {
                (Some(value), Some(sql_type)) => (sql_type, value.clone()),
                _ => {
                    warn!(
                        sp_handle = txn.sp_handle(),
                        "malformed ad-hoc partitioning parameters"
                    );
                    return false;
                }
            }
        } else {
            let Some(partition) = self.descriptor.partition else {
                warn!(
                    procedure = %self.descriptor.name,
                    "single-partition procedure has no partition column"
                );
                return false;
            };
            match invocation.param_at(partition.index) {
                Some(value) => (partition.column_type, value.clone()),
                None => {
                    warn!(
                        procedure = %self.descriptor.name,
                        index = partition.index,
                        "invocation is missing its partitioning parameter"
                    );
                    return false;
                }
            }
        };

        match hashinator.partition_for_parameter(parameter_type, &parameter) {
            Ok(partition) if partition == self.site.partition_id() => true,
            Ok(_) => {
                trace!(
                    procedure = %invocation.procedure_name,
                    "transaction hashes to another partition and will be restarted"
                );
                false
            }
            Err(err) => {
                warn!(
                    sp_handle = txn.sp_handle(),
                    error = %err,
                    "unable to check partitioning of transaction"
                );
                false
            }
        }
    }

    // ---- system procedure fragment dispatch -------------------------------

    /// Install a transaction handle and hand one distributed fragment to a
    /// system procedure's fragment entry point.
    pub fn execute_sysproc_plan_fragment(
        &mut self,
        txn: SharedTxn,
        dependencies: &DependencyResults,
        fragment_id: i64,
        params: &ParameterSet,
    ) -> anyhow::Result<FragmentResult> {
        debug_assert!(self.descriptor.system);
        self.setup_transaction(txn);
        let mut implementation = self
            .procedure
            .take()
            .ok_or_else(|| anyhow::anyhow!("procedure implementation missing during fragment"))?;
        let result = match &mut implementation {
            ProcedureImpl::Native(native) => {
                native.execute_plan_fragment(self, dependencies, fragment_id, params)
            }
            _ => Err(anyhow::anyhow!(
                "only native system procedures execute distributed plan fragments"
            )),
        };
        self.procedure = Some(implementation);
        result
    }
}
