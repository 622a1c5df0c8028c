//! Per-procedure invocation statistics.
//!
//! Counters are written only from the owning site thread and read by an
//! external stats agent, so plain relaxed atomics with a snapshot struct
//! are enough.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct ProcedureStatsSnapshot {
    pub invocations: u64,
    pub completed: u64,
    pub aborts: u64,
    pub failures: u64,
    pub total_ns: u64,
    pub min_ns: u64,
    pub max_ns: u64,
}

pub struct ProcedureStatsCollector {
    site_id: i64,
    partition_id: i32,
    procedure_name: String,
    origin: Instant,
    in_flight_since_ns: AtomicU64,
    invocations: AtomicU64,
    completed: AtomicU64,
    aborts: AtomicU64,
    failures: AtomicU64,
    total_ns: AtomicU64,
    min_ns: AtomicU64,
    max_ns: AtomicU64,
}

impl ProcedureStatsCollector {
    pub fn new(site_id: i64, partition_id: i32, procedure_name: &str) -> Self {
        Self {
            site_id,
            partition_id,
            procedure_name: procedure_name.to_owned(),
            origin: Instant::now(),
            in_flight_since_ns: AtomicU64::new(0),
            invocations: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            aborts: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            total_ns: AtomicU64::new(0),
            min_ns: AtomicU64::new(u64::MAX),
            max_ns: AtomicU64::new(0),
        }
    }

    pub fn site_id(&self) -> i64 {
        self.site_id
    }

    pub fn partition_id(&self) -> i32 {
        self.partition_id
    }

    pub fn procedure_name(&self) -> &str {
        &self.procedure_name
    }

    pub fn begin_procedure(&self) {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        let now_ns = self.origin.elapsed().as_nanos().min(u128::from(u64::MAX)) as u64;
        // 0 means idle; shift by one so a call starting at the origin still
        // registers as in flight.
        self.in_flight_since_ns.store(now_ns + 1, Ordering::Relaxed);
    }

    pub fn end_procedure(&self, aborted: bool, failed: bool) {
        let started = self.in_flight_since_ns.swap(0, Ordering::Relaxed);
        if started > 0 {
            let now_ns = self.origin.elapsed().as_nanos().min(u128::from(u64::MAX)) as u64;
            let elapsed = now_ns.saturating_sub(started - 1);
            self.total_ns.fetch_add(elapsed, Ordering::Relaxed);
            self.min_ns.fetch_min(elapsed, Ordering::Relaxed);
            self.max_ns.fetch_max(elapsed, Ordering::Relaxed);
        }
        if aborted {
            self.aborts.fetch_add(1, Ordering::Relaxed);
        } else if failed {
            self.failures.fetch_add(1, Ordering::Relaxed);
        } else {
            self.completed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> ProcedureStatsSnapshot {
        let min = self.min_ns.load(Ordering::Relaxed);
        ProcedureStatsSnapshot {
            invocations: self.invocations.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            aborts: self.aborts.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            total_ns: self.total_ns.load(Ordering::Relaxed),
            min_ns: if min == u64::MAX { 0 } else { min },
            max_ns: self.max_ns.load(Ordering::Relaxed),
        }
    }
}
