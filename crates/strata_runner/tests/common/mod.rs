//! Shared mock collaborators for runner integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use strata_core::{ClientResponse, ColumnInfo, ParameterSet, ResultTable, SqlType, SqlValue};
use strata_runner::adhoc::PlannedBatch;
use strata_runner::site::LoadTableRequest;
use strata_runner::{
    AdHocPlanner, CatalogFragment, CatalogStatement, DependencyResults, EngineError, FragmentTask,
    Hashinator, HashinatorKind, InvocationKind, NativeProcedure, PlanFragmentBatch, PlanHash,
    PlanRepository, ProcArg, ProcedureDescriptor, ProcedureImpl, ProcedureReturn, ProcedureRunner,
    ReferenceBackend, RunnerError, SiteConnection, SqlStmt, StatementDescriptor, StoredInvocation,
    SystemProcedureContext, TransactionHandle,
};

/// A one-column BIGINT table with a single row, the usual engine answer
/// for a DML fragment.
pub fn modified_rows_table(value: i64) -> ResultTable {
    let mut table = ResultTable::new(vec![ColumnInfo::new("modified_tuples", SqlType::BigInt)]);
    table
        .add_row(vec![SqlValue::BigInt(value)])
        .expect("row arity");
    table
}

pub fn plan_hash_for(sql: &str, salt: u8) -> PlanHash {
    let mut hash = [salt; 20];
    hash[..4].copy_from_slice(&crc32fast::hash(sql.as_bytes()).to_le_bytes());
    hash
}

/// Single-fragment write statement (transactional aggregator).
pub fn write_statement(sql: &str, param_types: Vec<SqlType>) -> CatalogStatement {
    CatalogStatement {
        sql: sql.to_owned(),
        read_only: false,
        replicated_table_dml: false,
        param_types,
        fragments: vec![CatalogFragment {
            plan_hash: plan_hash_for(sql, 1),
            plan: sql.as_bytes().to_vec(),
            has_dependencies: false,
            nontransactional: false,
        }],
    }
}

/// Single-fragment read statement (non-transactional aggregator).
pub fn read_statement(sql: &str, param_types: Vec<SqlType>) -> CatalogStatement {
    CatalogStatement {
        sql: sql.to_owned(),
        read_only: true,
        replicated_table_dml: false,
        param_types,
        fragments: vec![CatalogFragment {
            plan_hash: plan_hash_for(sql, 2),
            plan: sql.as_bytes().to_vec(),
            has_dependencies: false,
            nontransactional: true,
        }],
    }
}

/// Collector + aggregator statement for multi-partition plans.
pub fn two_fragment_statement(
    sql: &str,
    read_only: bool,
    param_types: Vec<SqlType>,
) -> CatalogStatement {
    CatalogStatement {
        sql: sql.to_owned(),
        read_only,
        replicated_table_dml: false,
        param_types,
        fragments: vec![
            CatalogFragment {
                plan_hash: plan_hash_for(sql, 3),
                plan: sql.as_bytes().to_vec(),
                has_dependencies: false,
                nontransactional: false,
            },
            CatalogFragment {
                plan_hash: plan_hash_for(sql, 4),
                plan: sql.as_bytes().to_vec(),
                has_dependencies: true,
                nontransactional: false,
            },
        ],
    }
}

pub fn descriptor(name: &str) -> ProcedureDescriptor {
    ProcedureDescriptor {
        name: name.to_owned(),
        read_only: false,
        single_partition: false,
        every_site: false,
        system: false,
        adhoc: false,
        partition: None,
        param_types: Vec::new(),
        single_statement: None,
    }
}

/// A native procedure implemented by a closure, for concise test bodies.
pub struct FnProcedure<F>(pub F);

impl<F> NativeProcedure for FnProcedure<F>
where
    F: FnMut(&mut ProcedureRunner, &[SqlValue]) -> Result<ProcedureReturn, RunnerError> + Send,
{
    fn run(
        &mut self,
        runner: &mut ProcedureRunner,
        params: &[SqlValue],
    ) -> Result<ProcedureReturn, RunnerError> {
        (self.0)(runner, params)
    }
}

pub fn native<F>(body: F) -> ProcedureImpl
where
    F: FnMut(&mut ProcedureRunner, &[SqlValue]) -> Result<ProcedureReturn, RunnerError>
        + Send
        + 'static,
{
    ProcedureImpl::Native(Box::new(FnProcedure(body)))
}

#[derive(Default)]
pub struct SiteState {
    /// Every value passed to set_procedure_name, in order.
    pub procedure_names: Vec<Option<String>>,
    pub batch_indexes: Vec<i32>,
    pub fast_batches: Vec<PlanFragmentBatch>,
    pub load_requests: Vec<LoadTableRequest>,
    pub recursable_calls: usize,
}

/// What the most recent transaction handle registered with the
/// coordinator; shared between MockTxn and MockSite so recursable_run can
/// answer the registered dependencies.
#[derive(Default)]
pub struct TxnRecord {
    pub resume_deps: Vec<i32>,
    pub resume_final: Option<bool>,
    pub local_work: Vec<(FragmentTask, bool)>,
    pub distributed_work: Vec<(FragmentTask, Vec<bool>)>,
}

pub struct MockBackend {
    pub executed: Mutex<Vec<String>>,
    pub rows_per_statement: usize,
    pub error: Mutex<Option<EngineError>>,
}

impl MockBackend {
    pub fn new(rows_per_statement: usize) -> Self {
        Self {
            executed: Mutex::new(Vec::new()),
            rows_per_statement,
            error: Mutex::new(None),
        }
    }
}

impl ReferenceBackend for MockBackend {
    fn run_statement(
        &self,
        stmt: &StatementDescriptor,
        _params: &ParameterSet,
    ) -> Result<ResultTable, EngineError> {
        if let Some(err) = self.error.lock().unwrap().take() {
            return Err(err);
        }
        self.executed.lock().unwrap().push(stmt.sql().to_owned());
        let mut table = ResultTable::new(vec![ColumnInfo::new("v", SqlType::BigInt)]);
        for i in 0..self.rows_per_statement {
            table.add_row(vec![SqlValue::BigInt(i as i64)]).unwrap();
        }
        Ok(table)
    }
}

pub struct MockSite {
    pub site_id: i64,
    pub partition: i32,
    /// Monotonic value source so result order is observable across
    /// sub-batches.
    pub counter: AtomicI64,
    pub state: Mutex<SiteState>,
    pub active_record: Mutex<Option<Arc<Mutex<TxnRecord>>>>,
    pub fast_path_error: Mutex<Option<EngineError>>,
    pub load_table_error: Mutex<Option<EngineError>>,
    pub backend: Option<Arc<MockBackend>>,
}

impl MockSite {
    pub fn new(site_id: i64, partition: i32) -> Self {
        Self {
            site_id,
            partition,
            counter: AtomicI64::new(0),
            state: Mutex::new(SiteState::default()),
            active_record: Mutex::new(None),
            fast_path_error: Mutex::new(None),
            load_table_error: Mutex::new(None),
            backend: None,
        }
    }

    pub fn with_backend(site_id: i64, partition: i32, backend: Arc<MockBackend>) -> Self {
        let mut site = Self::new(site_id, partition);
        site.backend = Some(backend);
        site
    }

    pub fn current_procedure_name(&self) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .procedure_names
            .last()
            .cloned()
            .flatten()
    }
}

impl SiteConnection for MockSite {
    fn site_id(&self) -> i64 {
        self.site_id
    }

    fn partition_id(&self) -> i32 {
        self.partition
    }

    fn set_procedure_name(&self, name: Option<&str>) {
        self.state
            .lock()
            .unwrap()
            .procedure_names
            .push(name.map(str::to_owned));
    }

    fn set_batch(&self, batch_index: i32) {
        self.state.lock().unwrap().batch_indexes.push(batch_index);
    }

    fn reference_backend(&self) -> Option<&dyn ReferenceBackend> {
        self.backend.as_deref().map(|b| b as &dyn ReferenceBackend)
    }

    fn execute_plan_fragments(
        &self,
        batch: PlanFragmentBatch,
    ) -> Result<Vec<ResultTable>, EngineError> {
        if let Some(err) = self.fast_path_error.lock().unwrap().take() {
            return Err(err);
        }
        let results = batch
            .fragment_ids
            .iter()
            .map(|_| modified_rows_table(self.counter.fetch_add(1, Ordering::Relaxed)))
            .collect();
        self.state.lock().unwrap().fast_batches.push(batch);
        Ok(results)
    }

    fn load_table(&self, request: LoadTableRequest) -> Result<Option<Vec<u8>>, EngineError> {
        if let Some(err) = self.load_table_error.lock().unwrap().take() {
            return Err(err);
        }
        self.state.lock().unwrap().load_requests.push(request);
        Ok(None)
    }

    fn recursable_run(
        &self,
        _txn: &dyn TransactionHandle,
    ) -> Result<DependencyResults, EngineError> {
        self.state.lock().unwrap().recursable_calls += 1;
        let record = self
            .active_record
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| EngineError::Other("no transaction registered with mock site".into()))?;
        let deps = record.lock().unwrap().resume_deps.clone();
        let mut results: DependencyResults = HashMap::new();
        for dep in deps {
            results.insert(
                dep,
                vec![modified_rows_table(
                    self.counter.fetch_add(1, Ordering::Relaxed),
                )],
            );
        }
        Ok(results)
    }
}

#[derive(Clone)]
pub struct TxnConfig {
    pub txn_id: i64,
    pub sp_handle: i64,
    pub unique_id: i64,
    pub initiator_id: i64,
    pub read_only: bool,
    pub for_replay: bool,
    pub single_partition: bool,
    pub invocation: Option<StoredInvocation>,
}

impl Default for TxnConfig {
    fn default() -> Self {
        Self {
            txn_id: 7_001,
            sp_handle: 42,
            unique_id: strata_runner::unique_id::make_unique_id(
                strata_runner::unique_id::EPOCH_MS + 86_400_000,
                3,
                9,
            ),
            initiator_id: 11,
            read_only: false,
            for_replay: false,
            single_partition: true,
            invocation: None,
        }
    }
}

pub struct MockTxn {
    config: TxnConfig,
    next_dep: AtomicI32,
    done: AtomicBool,
    rollback: AtomicBool,
    hash: AtomicI32,
    pub stored_response: Mutex<Option<ClientResponse>>,
    pub record: Arc<Mutex<TxnRecord>>,
}

impl MockTxn {
    pub fn new(config: TxnConfig) -> Self {
        Self {
            config,
            next_dep: AtomicI32::new(1),
            done: AtomicBool::new(false),
            rollback: AtomicBool::new(false),
            hash: AtomicI32::new(-1),
            stored_response: Mutex::new(None),
            record: Arc::new(Mutex::new(TxnRecord::default())),
        }
    }
}

impl TransactionHandle for MockTxn {
    fn txn_id(&self) -> i64 {
        self.config.txn_id
    }

    fn sp_handle(&self) -> i64 {
        self.config.sp_handle
    }

    fn unique_id(&self) -> i64 {
        self.config.unique_id
    }

    fn initiator_id(&self) -> i64 {
        self.config.initiator_id
    }

    fn is_read_only(&self) -> bool {
        self.config.read_only
    }

    fn is_for_replay(&self) -> bool {
        self.config.for_replay
    }

    fn is_single_partition(&self) -> bool {
        self.config.single_partition
    }

    fn invocation(&self) -> Option<StoredInvocation> {
        self.config.invocation.clone()
    }

    fn next_dependency_id(&self) -> i32 {
        self.next_dep.fetch_add(1, Ordering::Relaxed)
    }

    fn setup_procedure_resume(&self, is_final: bool, deps: &[i32]) {
        let mut record = self.record.lock().unwrap();
        record.resume_final = Some(is_final);
        record.resume_deps = deps.to_vec();
    }

    fn create_local_fragment_work(&self, task: FragmentTask, non_transactional: bool) {
        self.record
            .lock()
            .unwrap()
            .local_work
            .push((task, non_transactional));
    }

    fn create_all_participating_fragment_work(
        &self,
        task: FragmentTask,
        replicated_read: Vec<bool>,
    ) {
        self.record
            .lock()
            .unwrap()
            .distributed_work
            .push((task, replicated_read));
    }

    fn set_done(&self) {
        self.done.store(true, Ordering::Relaxed);
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::Relaxed)
    }

    fn set_needs_rollback(&self) {
        self.rollback.store(true, Ordering::Relaxed);
    }

    fn needs_rollback(&self) -> bool {
        self.rollback.load(Ordering::Relaxed)
    }

    fn store_response(&self, response: ClientResponse) {
        *self.stored_response.lock().unwrap() = Some(response);
    }

    fn set_hash(&self, hash: Option<i32>) {
        self.hash.store(hash.unwrap_or(0), Ordering::Relaxed);
    }

    fn hash(&self) -> i32 {
        self.hash.load(Ordering::Relaxed)
    }
}

pub struct MockPlanner {
    pub batch: Mutex<Option<PlannedBatch>>,
    pub requests: Mutex<Vec<(String, usize, bool)>>,
}

impl MockPlanner {
    pub fn new() -> Self {
        Self {
            batch: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn answer_with(&self, batch: PlannedBatch) {
        *self.batch.lock().unwrap() = Some(batch);
    }
}

impl AdHocPlanner for MockPlanner {
    fn plan(
        &self,
        sql: &str,
        args: &[ProcArg],
        single_partition: bool,
    ) -> oneshot::Receiver<PlannedBatch> {
        self.requests
            .lock()
            .unwrap()
            .push((sql.to_owned(), args.len(), single_partition));
        let (tx, rx) = oneshot::channel();
        if let Some(batch) = self.batch.lock().unwrap().clone() {
            let _ = tx.send(batch);
        }
        rx
    }
}

pub struct MockHashinator {
    pub kind: HashinatorKind,
    pub partition: i32,
    pub fail: bool,
}

impl Hashinator for MockHashinator {
    fn kind(&self) -> HashinatorKind {
        self.kind
    }

    fn partition_for_parameter(
        &self,
        _sql_type: SqlType,
        _value: &SqlValue,
    ) -> anyhow::Result<i32> {
        if self.fail {
            anyhow::bail!("hashinator configuration is mid-update");
        }
        Ok(self.partition)
    }
}

pub struct MockSysprocContext;

impl SystemProcedureContext for MockSysprocContext {
    fn site_id(&self) -> i64 {
        1
    }

    fn partition_id(&self) -> i32 {
        0
    }

    fn cluster_name(&self) -> &str {
        "cluster"
    }

    fn database_name(&self) -> &str {
        "database"
    }
}

/// Bundles the collaborators a runner needs, with helpers to build
/// runners, transactions and prepared statements against them.
pub struct Harness {
    pub site: Arc<MockSite>,
    pub planner: Arc<MockPlanner>,
    pub repo: Arc<PlanRepository>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            site: Arc::new(MockSite::new(101, 3)),
            planner: Arc::new(MockPlanner::new()),
            repo: Arc::new(PlanRepository::new()),
        }
    }

    pub fn with_site(site: MockSite) -> Self {
        Self {
            site: Arc::new(site),
            planner: Arc::new(MockPlanner::new()),
            repo: Arc::new(PlanRepository::new()),
        }
    }

    pub fn runner(
        &self,
        descriptor: ProcedureDescriptor,
        implementation: ProcedureImpl,
    ) -> ProcedureRunner {
        ProcedureRunner::new(
            descriptor,
            implementation,
            self.site.clone(),
            self.planner.clone(),
            self.repo.clone(),
            None,
        )
        .expect("runner construction")
    }

    pub fn sysproc_runner(
        &self,
        descriptor: ProcedureDescriptor,
        implementation: ProcedureImpl,
    ) -> ProcedureRunner {
        ProcedureRunner::new(
            descriptor,
            implementation,
            self.site.clone(),
            self.planner.clone(),
            self.repo.clone(),
            Some(Arc::new(MockSysprocContext)),
        )
        .expect("runner construction")
    }

    /// Create a transaction handle and register it with the mock site so
    /// recursable_run can see its resume registration.
    pub fn txn(&self, config: TxnConfig) -> Arc<MockTxn> {
        let txn = Arc::new(MockTxn::new(config));
        *self.site.active_record.lock().unwrap() = Some(txn.record.clone());
        txn
    }

    pub fn prepare(&self, catalog: &CatalogStatement) -> SqlStmt {
        SqlStmt::prepared(StatementDescriptor::from_catalog(catalog, &self.repo).expect("install"))
    }
}

/// Replicated-replay invocation record for a procedure.
pub fn replicated_invocation(procedure: &str, original_txn_id: i64, original_unique_id: i64) -> StoredInvocation {
    StoredInvocation {
        procedure_name: procedure.to_owned(),
        kind: InvocationKind::Replicated {
            original_txn_id,
            original_unique_id,
        },
        params: ParameterSet::empty(),
    }
}

/// Expected determinism hash over write statements queued in order.
pub fn expected_hash(entries: &[(&SqlStmt, &[SqlValue])]) -> i32 {
    let mut crc = 0u32;
    for (stmt, values) in entries {
        let descriptor = stmt.descriptor().expect("bound statement");
        let bytes = ParameterSet::from_values(values.to_vec())
            .to_bytes()
            .expect("serialize");
        crc = crc32c::crc32c_append(crc, &descriptor.sql_crc().to_le_bytes());
        crc = crc32c::crc32c_append(crc, &bytes);
    }
    crc as i32
}
