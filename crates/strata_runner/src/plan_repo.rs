//! Process-wide repository of active plan fragments.
//!
//! Fragments are keyed by their 20-byte plan hash and ref-counted: every
//! installed statement and every in-flight ad-hoc statement holds one
//! reference. The repository is read-heavy (fragment lookups on every
//! dispatch of a non-cataloged statement) and written only on install and
//! teardown, so a single RwLock around the maps is sufficient.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

/// 20-byte plan fragment hash produced by the planner.
pub type PlanHash = [u8; 20];

/// First engine-assigned fragment id; lower values are reserved.
const FIRST_FRAGMENT_ID: i64 = 5000;

struct PlanEntry {
    fragment_id: i64,
    plan: Arc<Vec<u8>>,
    refs: usize,
}

#[derive(Default)]
struct Maps {
    by_hash: HashMap<PlanHash, PlanEntry>,
    hash_by_id: HashMap<i64, PlanHash>,
}

pub struct PlanRepository {
    maps: RwLock<Maps>,
    next_fragment_id: AtomicI64,
}

impl Default for PlanRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl PlanRepository {
    pub fn new() -> Self {
        Self {
            maps: RwLock::new(Maps::default()),
            next_fragment_id: AtomicI64::new(FIRST_FRAGMENT_ID),
        }
    }

    /// Register a fragment (or take another reference to it) and return its
    /// engine-assigned id. This is the sole way fragments enter the
    /// repository.
    pub fn load_or_add_ref(&self, plan_hash: PlanHash, plan: &[u8]) -> i64 {
        let mut maps = self.maps.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = maps.by_hash.get_mut(&plan_hash) {
            entry.refs += 1;
            return entry.fragment_id;
        }
        let fragment_id = self.next_fragment_id.fetch_add(1, Ordering::Relaxed);
        maps.by_hash.insert(
            plan_hash,
            PlanEntry {
                fragment_id,
                plan: Arc::new(plan.to_vec()),
                refs: 1,
            },
        );
        maps.hash_by_id.insert(fragment_id, plan_hash);
        fragment_id
    }

    pub fn plan_for_fragment_id(&self, fragment_id: i64) -> Option<Arc<Vec<u8>>> {
        let maps = self.maps.read().unwrap_or_else(|e| e.into_inner());
        let hash = maps.hash_by_id.get(&fragment_id)?;
        maps.by_hash.get(hash).map(|entry| Arc::clone(&entry.plan))
    }

    pub fn fragment_id_for_hash(&self, plan_hash: &PlanHash) -> Option<i64> {
        let maps = self.maps.read().unwrap_or_else(|e| e.into_inner());
        maps.by_hash.get(plan_hash).map(|entry| entry.fragment_id)
    }

    /// Drop one reference; the fragment is evicted when the count hits zero.
    pub fn decref(&self, plan_hash: &PlanHash) {
        let mut maps = self.maps.write().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = maps.by_hash.get_mut(plan_hash) else {
            return;
        };
        entry.refs -= 1;
        if entry.refs == 0 {
            let fragment_id = entry.fragment_id;
            maps.by_hash.remove(plan_hash);
            maps.hash_by_id.remove(&fragment_id);
        }
    }

    pub fn ref_count(&self, plan_hash: &PlanHash) -> usize {
        let maps = self.maps.read().unwrap_or_else(|e| e.into_inner());
        maps.by_hash.get(plan_hash).map_or(0, |entry| entry.refs)
    }
}
