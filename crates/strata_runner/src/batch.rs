//! Batch execution: queue flushing, sub-batch splitting, and the fast and
//! slow dispatch paths.
//!
//! `execute_sql` drains the pending queue into sub-batches of at most
//! [`MAX_BATCH_SIZE`] statements. A sub-batch goes to the single-partition
//! fast path (one packed engine call) when the procedure is
//! single-partition and nothing in it needs a collector stage; otherwise
//! it goes to the multi-partition slow path, which builds the local and
//! distributed fragment messages and drives the dependency-collection
//! loop.

use std::sync::Arc;

use tracing::trace;

use strata_core::ResultTable;

use crate::errors::RunnerError;
use crate::plan_repo::PlanRepository;
use crate::runner::ProcedureRunner;
use crate::site::{
    FragmentTask, ParamPayload, PlanFragmentBatch, TransactionHandle, MULTIPARTITION_DEPENDENCY,
};
use crate::statement::QueuedStatement;

/// Maximum statements per engine dispatch. Must stay in lockstep with the
/// engine-side batch cap.
pub const MAX_BATCH_SIZE: usize = 200;

impl ProcedureRunner {
    /// Flush the pending queue, returning one result table per queued
    /// statement in queueing order. The queue is empty when this returns,
    /// whether it succeeds or fails.
    pub fn execute_sql(&mut self, is_final: bool) -> Result<Vec<ResultTable>, RunnerError> {
        let mut pending = std::mem::take(&mut self.batch);
        if self.seen_final_batch {
            return Err(RunnerError::DoubleFinalBatch {
                procedure: self.descriptor.name.clone(),
            });
        }
        self.seen_final_batch = is_final;

        let batch_size = pending.len();
        self.batch_index += 1;
        self.site.set_batch(self.batch_index);

        if batch_size <= MAX_BATCH_SIZE {
            return self.execute_batch(pending, is_final);
        }

        let mut all_results = Vec::with_capacity(batch_size);
        while !pending.is_empty() {
            let take = MAX_BATCH_SIZE.min(pending.len());
            let sub_batch: Vec<QueuedStatement> = pending.drain(..take).collect();
            // Only the last sub-batch may carry the final flag onward.
            let final_sub_batch = is_final && pending.is_empty();
            all_results.extend(self.execute_batch(sub_batch, final_sub_batch)?);
        }
        debug_assert_eq!(all_results.len(), batch_size);
        Ok(all_results)
    }

    fn execute_batch(
        &mut self,
        batch: Vec<QueuedStatement>,
        is_final: bool,
    ) -> Result<Vec<ResultTable>, RunnerError> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let site = Arc::clone(&self.site);
        let results = if let Some(backend) = site.reference_backend() {
            // Test backend mode: run each statement directly against the
            // embedded reference engine.
            let mut out = Vec::with_capacity(batch.len());
            for queued in &batch {
                out.push(
                    backend
                        .run_statement(queued.stmt(), queued.params())
                        .map_err(RunnerError::expected_backend_error)?,
                );
            }
            out
        } else if self.descriptor.single_partition
            && batch.iter().all(|q| q.stmt().collector().is_none())
        {
            self.fast_path(&batch)?
        } else {
            self.slow_path(&batch, is_final)?
        };

        if results.len() != batch.len() {
            return Err(RunnerError::unexpected(format!(
                "engine returned {} results for a batch of {}",
                results.len(),
                batch.len()
            )));
        }

        for (index, queued) in batch.iter().enumerate() {
            if let Some(expectation) = queued.expectation() {
                expectation.check(&self.descriptor.name, queued.stmt(), index, &results[index])?;
            }
        }

        Ok(results)
    }

    /// Single-partition dispatch: one engine call over parallel arrays of
    /// fragment ids and parameters. Writes reuse their memoized canonical
    /// bytes; reads ship the live parameter set.
    fn fast_path(&mut self, batch: &[QueuedStatement]) -> Result<Vec<ResultTable>, RunnerError> {
        let txn = self.txn_handle()?;
        let (txn_id, sp_handle, unique_id) = (txn.txn_id(), txn.sp_handle(), txn.unique_id());

        let mut fragment_ids = Vec::with_capacity(batch.len());
        let mut params = Vec::with_capacity(batch.len());
        for queued in batch {
            debug_assert!(queued.stmt().collector().is_none());
            fragment_ids.push(queued.stmt().aggregator().fragment_id);
            params.push(match queued.serialization() {
                Some(bytes) => ParamPayload::Serialized(bytes.to_vec()),
                None => ParamPayload::Inline(queued.params().clone()),
            });
        }

        let request = PlanFragmentBatch {
            fragment_ids,
            params,
            txn_id,
            sp_handle,
            unique_id,
            read_only: self.descriptor.read_only,
        };
        self.site
            .execute_plan_fragments(request)
            .map_err(RunnerError::from_engine)
    }

    /// Multi-partition dispatch.
    ///
    /// Replicated reads (no collector) are scheduled only in the
    /// distributed message so exactly one site runs each of them, in their
    /// queued position relative to the writes. Two-fragment statements put
    /// their collector in the distributed message and their aggregator in
    /// the local message, joined by a freshly allocated multipartition
    /// dependency.
    fn slow_path(
        &mut self,
        batch: &[QueuedStatement],
        final_task: bool,
    ) -> Result<Vec<ResultTable>, RunnerError> {
        let txn = Arc::clone(self.txn_handle()?);
        trace!(
            procedure = %self.descriptor.name,
            batch_size = batch.len(),
            final_task,
            "dispatching multi-partition batch"
        );

        let mut state = BatchState::new(
            txn.as_ref(),
            self.site.site_id(),
            final_task,
            &self.descriptor.name,
        );
        for queued in batch {
            let params = match queued.serialization() {
                Some(bytes) => bytes.to_vec(),
                None => queued.params().to_bytes().map_err(|err| {
                    RunnerError::unexpected(format!(
                        "error serializing parameters for statement '{}': {err}",
                        queued.stmt().sql()
                    ))
                })?,
            };
            state.add_statement(queued, params, txn.as_ref(), &self.plan_repo)?;
        }
        debug_assert_eq!(state.deps_to_resume.len(), batch.len());

        // Tell the coordinator which dependencies resume this procedure.
        txn.setup_procedure_resume(final_task, &state.deps_to_resume);

        // Non-transactional local work only helps when it is also final.
        txn.create_local_fragment_work(
            state.local_task,
            state.local_frags_nontransactional && final_task,
        );

        if !state.distributed_task.is_empty() {
            state.distributed_task.set_batch_index(self.batch_index);
            txn.create_all_participating_fragment_work(
                state.distributed_task,
                state.replicated_read,
            );
        }

        let mut collected = self
            .site
            .recursable_run(txn.as_ref())
            .map_err(RunnerError::from_engine)?;

        // One table per resumed dependency, in statement order.
        let mut results = Vec::with_capacity(batch.len());
        for (index, dep_id) in state.deps_to_resume.iter().enumerate() {
            let mut tables = collected.remove(dep_id).ok_or_else(|| {
                RunnerError::unexpected(format!(
                    "no result delivered for dependency {dep_id} (statement {index})"
                ))
            })?;
            if tables.len() != 1 {
                return Err(RunnerError::unexpected(format!(
                    "expected exactly one result for dependency {dep_id}, got {}",
                    tables.len()
                )));
            }
            results.push(tables.remove(0));
        }
        Ok(results)
    }
}

/// Message construction state for one slow-path sub-batch.
struct BatchState {
    deps_to_resume: Vec<i32>,
    replicated_read: Vec<bool>,
    local_task: FragmentTask,
    distributed_task: FragmentTask,
    local_frags_nontransactional: bool,
}

impl BatchState {
    fn new(
        txn: &dyn TransactionHandle,
        site_id: i64,
        final_task: bool,
        procedure_name: &str,
    ) -> BatchState {
        let mut local_task = FragmentTask::new(
            txn.initiator_id(),
            site_id,
            txn.txn_id(),
            txn.unique_id(),
            txn.is_read_only(),
            false,
            txn.is_for_replay(),
        );
        local_task.set_procedure_name(procedure_name);

        let mut distributed_task = FragmentTask::new(
            txn.initiator_id(),
            site_id,
            txn.txn_id(),
            txn.unique_id(),
            txn.is_read_only(),
            final_task,
            txn.is_for_replay(),
        );
        distributed_task.set_procedure_name(procedure_name);

        BatchState {
            deps_to_resume: Vec::new(),
            replicated_read: Vec::new(),
            local_task,
            distributed_task,
            local_frags_nontransactional: true,
        }
    }

    fn add_statement(
        &mut self,
        queued: &QueuedStatement,
        params: Vec<u8>,
        txn: &dyn TransactionHandle,
        repo: &PlanRepository,
    ) -> Result<(), RunnerError> {
        let stmt = queued.stmt();
        let dep_to_resume = txn.next_dependency_id();
        self.deps_to_resume.push(dep_to_resume);

        if stmt.aggregator().transactional {
            self.local_frags_nontransactional = false;
        }

        match stmt.collector() {
            // Single fragment: a replicated read, run on exactly one site in
            // its queued position within the distributed work. Its result
            // feeds the procedure directly.
            None => {
                self.replicated_read.push(true);
                if stmt.in_catalog() {
                    self.distributed_task.add_fragment(
                        stmt.aggregator().plan_hash,
                        dep_to_resume,
                        params,
                    );
                } else {
                    let plan = plan_bytes(repo, stmt.aggregator().fragment_id, stmt.sql())?;
                    self.distributed_task.add_custom_fragment(
                        stmt.aggregator().plan_hash,
                        dep_to_resume,
                        params,
                        plan,
                    );
                }
            }
            // Two fragments: every participant runs the collector; the
            // coordinating site runs the aggregator over the collected
            // intermediate dependency.
            Some(collector) => {
                let collector_output = txn.next_dependency_id() | MULTIPARTITION_DEPENDENCY;
                self.replicated_read.push(false);
                if stmt.in_catalog() {
                    self.local_task.add_fragment(
                        stmt.aggregator().plan_hash,
                        dep_to_resume,
                        params.clone(),
                    );
                    self.local_task.set_last_input_dep(collector_output);
                    self.distributed_task
                        .add_fragment(collector.plan_hash, collector_output, params);
                } else {
                    let aggregator_plan =
                        plan_bytes(repo, stmt.aggregator().fragment_id, stmt.sql())?;
                    self.local_task.add_custom_fragment(
                        stmt.aggregator().plan_hash,
                        dep_to_resume,
                        params.clone(),
                        aggregator_plan,
                    );
                    self.local_task.set_last_input_dep(collector_output);
                    let collector_plan = plan_bytes(repo, collector.fragment_id, stmt.sql())?;
                    self.distributed_task.add_custom_fragment(
                        collector.plan_hash,
                        collector_output,
                        params,
                        collector_plan,
                    );
                }
            }
        }
        Ok(())
    }
}

fn plan_bytes(
    repo: &PlanRepository,
    fragment_id: i64,
    sql: &str,
) -> Result<Vec<u8>, RunnerError> {
    repo.plan_for_fragment_id(fragment_id)
        .map(|plan| plan.as_ref().clone())
        .ok_or_else(|| {
            RunnerError::unexpected(format!(
                "no plan registered for fragment {fragment_id} of statement '{sql}'"
            ))
        })
}
