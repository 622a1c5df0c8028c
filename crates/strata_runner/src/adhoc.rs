//! Ad-hoc planner output shapes and descriptor synthesis.
//!
//! Planning itself is an external collaborator (see
//! [`crate::site::AdHocPlanner`]); this module holds the data the planner
//! hands back and turns one planned statement into a synthetic
//! [`StatementDescriptor`] after ref-loading its fragments.

use std::sync::Arc;

use strata_core::{SqlType, SqlValue};

use crate::plan_repo::{PlanHash, PlanRepository};
use crate::statement::{PlanFrag, StatementDescriptor};

/// One statement as planned by the external ad-hoc planner.
#[derive(Clone, Debug)]
pub struct PlannedStatement {
    pub sql: String,
    pub aggregator_hash: PlanHash,
    pub aggregator_plan: Vec<u8>,
    /// Collector stage for plans that fan out across partitions.
    pub collector: Option<(PlanHash, Vec<u8>)>,
    pub read_only: bool,
    pub replicated_table_dml: bool,
    pub param_types: Vec<SqlType>,
    /// Constants the planner pulled out of the SQL text. When present the
    /// caller must not supply its own arguments.
    pub extracted_params: Option<Vec<SqlValue>>,
}

impl PlannedStatement {
    pub fn has_extracted_params(&self) -> bool {
        self.extracted_params.is_some()
    }
}

/// Planner reply for one ad-hoc request. Exactly one statement on success.
#[derive(Clone, Debug)]
pub struct PlannedBatch {
    pub error: Option<String>,
    pub read_only: bool,
    pub statements: Vec<PlannedStatement>,
}

/// Register the planned fragments and build the synthetic descriptor for
/// them. Ad-hoc descriptors are marked out-of-catalog so dispatch ships
/// their plan bytes with the fragment task.
pub fn descriptor_from_planned(
    planned: &PlannedStatement,
    repo: &PlanRepository,
) -> Arc<StatementDescriptor> {
    let aggregator_id = repo.load_or_add_ref(planned.aggregator_hash, &planned.aggregator_plan);
    let aggregator = PlanFrag {
        fragment_id: aggregator_id,
        plan_hash: planned.aggregator_hash,
        transactional: true,
    };
    let collector = planned.collector.as_ref().map(|(hash, plan)| PlanFrag {
        fragment_id: repo.load_or_add_ref(*hash, plan),
        plan_hash: *hash,
        transactional: true,
    });
    StatementDescriptor::adhoc(
        planned.sql.clone(),
        aggregator,
        collector,
        planned.param_types.clone(),
        planned.read_only,
        planned.replicated_table_dml,
    )
}
