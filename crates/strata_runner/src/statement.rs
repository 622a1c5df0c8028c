//! Statement descriptors and the catalog shapes they are installed from.
//!
//! A [`StatementDescriptor`] is the immutable post-compile description of
//! one SQL statement: its plan fragments, parameter types, and flags. One
//! is created per statement when a procedure is installed (or per ad-hoc
//! statement when planned at runtime) and shared read-only for the life of
//! the catalog generation.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use strata_core::{ParameterSet, SqlType};

use crate::expectations::Expectation;
use crate::plan_repo::{PlanHash, PlanRepository};

/// One plan fragment of a compiled statement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlanFrag {
    /// Engine-assigned fragment id from the plan repository.
    pub fragment_id: i64,
    pub plan_hash: PlanHash,
    pub transactional: bool,
}

/// Catalog shape of a compiled plan fragment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CatalogFragment {
    pub plan_hash: PlanHash,
    pub plan: Vec<u8>,
    /// True for the fragment that consumes collector output (the aggregator
    /// of a two-fragment statement).
    pub has_dependencies: bool,
    pub nontransactional: bool,
}

/// Catalog shape of a compiled statement.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CatalogStatement {
    pub sql: String,
    pub read_only: bool,
    pub replicated_table_dml: bool,
    pub param_types: Vec<SqlType>,
    /// One fragment for single-partition-shaped plans, two for plans with a
    /// per-partition collector stage.
    pub fragments: Vec<CatalogFragment>,
}

#[derive(Debug)]
pub struct StatementDescriptor {
    sql: String,
    sql_crc: u32,
    aggregator: PlanFrag,
    collector: Option<PlanFrag>,
    param_types: Vec<SqlType>,
    read_only: bool,
    replicated_table_dml: bool,
    in_catalog: bool,
}

impl StatementDescriptor {
    /// Install a catalog statement, registering its fragments in the plan
    /// repository.
    pub fn from_catalog(
        stmt: &CatalogStatement,
        repo: &PlanRepository,
    ) -> anyhow::Result<Arc<StatementDescriptor>> {
        anyhow::ensure!(
            matches!(stmt.fragments.len(), 1 | 2),
            "statement '{}' has {} fragments, expected 1 or 2",
            stmt.sql,
            stmt.fragments.len()
        );

        let single_fragment = stmt.fragments.len() == 1;
        let mut aggregator = None;
        let mut collector = None;
        for frag in &stmt.fragments {
            let fragment_id = repo.load_or_add_ref(frag.plan_hash, &frag.plan);
            let plan_frag = PlanFrag {
                fragment_id,
                plan_hash: frag.plan_hash,
                transactional: !frag.nontransactional,
            };
            if single_fragment || frag.has_dependencies {
                aggregator = Some(plan_frag);
            } else {
                collector = Some(plan_frag);
            }
        }
        let aggregator =
            aggregator.ok_or_else(|| anyhow::anyhow!("statement '{}' has no aggregator fragment", stmt.sql))?;

        Ok(Arc::new(StatementDescriptor {
            sql: stmt.sql.clone(),
            sql_crc: crc32fast::hash(stmt.sql.as_bytes()),
            aggregator,
            collector,
            param_types: stmt.param_types.clone(),
            read_only: stmt.read_only,
            replicated_table_dml: stmt.replicated_table_dml,
            in_catalog: true,
        }))
    }

    /// Build a synthetic descriptor for an ad-hoc planned statement whose
    /// fragments were already registered in the plan repository.
    pub fn adhoc(
        sql: String,
        aggregator: PlanFrag,
        collector: Option<PlanFrag>,
        param_types: Vec<SqlType>,
        read_only: bool,
        replicated_table_dml: bool,
    ) -> Arc<StatementDescriptor> {
        let sql_crc = crc32fast::hash(sql.as_bytes());
        Arc::new(StatementDescriptor {
            sql,
            sql_crc,
            aggregator,
            collector,
            param_types,
            read_only,
            replicated_table_dml,
            in_catalog: false,
        })
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn sql_crc(&self) -> u32 {
        self.sql_crc
    }

    pub fn aggregator(&self) -> &PlanFrag {
        &self.aggregator
    }

    pub fn collector(&self) -> Option<&PlanFrag> {
        self.collector.as_ref()
    }

    pub fn param_types(&self) -> &[SqlType] {
        &self.param_types
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_replicated_table_dml(&self) -> bool {
        self.replicated_table_dml
    }

    /// False for ad-hoc synthetics, whose plan bytes must travel with the
    /// fragment task instead of being resolved from the remote catalog.
    pub fn in_catalog(&self) -> bool {
        self.in_catalog
    }
}

/// Handle through which procedure code refers to a prepared statement.
///
/// Handles start unbound and are bound at procedure install time; queueing
/// through an unbound handle is a usage error.
#[derive(Clone, Debug, Default)]
pub struct SqlStmt {
    descriptor: Option<Arc<StatementDescriptor>>,
}

impl SqlStmt {
    pub fn prepared(descriptor: Arc<StatementDescriptor>) -> Self {
        Self {
            descriptor: Some(descriptor),
        }
    }

    pub fn unbound() -> Self {
        Self { descriptor: None }
    }

    pub fn descriptor(&self) -> Option<&Arc<StatementDescriptor>> {
        self.descriptor.as_ref()
    }
}

/// Rewrite a declared parameter type to its install-time widened form.
///
/// Single-statement procedures declare their parameters with the statement's
/// column types; the narrow integer types are widened to BIGINT and NUMERIC
/// to FLOAT before any call-time coercion happens.
pub fn widen_declared_type(sql_type: SqlType) -> SqlType {
    match sql_type {
        SqlType::TinyInt | SqlType::SmallInt | SqlType::Integer => SqlType::BigInt,
        SqlType::Numeric => SqlType::Float,
        other => other,
    }
}

/// A statement bound to a concrete parameter set, waiting in the queue.
#[derive(Debug)]
pub struct QueuedStatement {
    stmt: Arc<StatementDescriptor>,
    params: ParameterSet,
    expectation: Option<Expectation>,
    /// Canonical parameter bytes, memoized for writes because the same
    /// buffer feeds the determinism CRC and then fragment dispatch.
    serialization: Option<Vec<u8>>,
}

impl QueuedStatement {
    pub fn new(
        stmt: Arc<StatementDescriptor>,
        params: ParameterSet,
        expectation: Option<Expectation>,
    ) -> Self {
        Self {
            stmt,
            params,
            expectation,
            serialization: None,
        }
    }

    pub fn stmt(&self) -> &StatementDescriptor {
        &self.stmt
    }

    pub fn params(&self) -> &ParameterSet {
        &self.params
    }

    pub fn expectation(&self) -> Option<&Expectation> {
        self.expectation.as_ref()
    }

    pub fn serialization(&self) -> Option<&[u8]> {
        self.serialization.as_deref()
    }

    pub fn set_serialization(&mut self, bytes: Vec<u8>) {
        self.serialization = Some(bytes);
    }
}
