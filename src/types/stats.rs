//------------ Types for Statistics -----------------------------------------

use std::sync::atomic::{AtomicUsize, Ordering};

use serde_derive::{Deserialize, Serialize};

use crate::Family;

//------------ RibStats ------------------------------------------------------
//
// Summary statistics of a routing table, handed to lookup modules to compute
// their preference score.

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RibStats {
    /// number of prefixes in the table
    pub prefixes: usize,
    /// number of distinct single-path nexthops referenced by the table
    pub nexthops: usize,
    /// number of distinct nexthop groups referenced by the table
    pub nexthop_groups: usize,
}

impl RibStats {
    pub fn new(prefixes: usize, nexthops: usize, nexthop_groups: usize) -> Self {
        Self {
            prefixes,
            nexthops,
            nexthop_groups,
        }
    }
}

//------------ Counters -----------------------------------------------------
//
// This is the struct that's part of every Scope. All counters only ever go
// up.

#[derive(Debug, Default)]
pub(crate) struct Counters {
    // instances that were fully set up, linked (and possibly published)
    instances: AtomicUsize,
    // instances replaced by a rebuild with the same module
    rebuilds: AtomicUsize,
    // instances replaced by an instance of another module
    switches: AtomicUsize,
    // rebuild attempts (each up to max_tries setups) that gave up
    failed_rebuilds: AtomicUsize,
    // changes that were ignored by an instance that wasn't ready, or was
    // already condemned
    dropped_changes: AtomicUsize,
}

impl Counters {
    pub fn inc_instances(&self) {
        self.instances.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rebuilds(&self) {
        self.rebuilds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_switches(&self) {
        self.switches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_failed_rebuilds(&self) {
        self.failed_rebuilds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dropped_changes(&self) {
        self.dropped_changes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ScopeStats {
        ScopeStats {
            instances: self.instances.load(Ordering::Relaxed),
            rebuilds: self.rebuilds.load(Ordering::Relaxed),
            switches: self.switches.load(Ordering::Relaxed),
            failed_rebuilds: self.failed_rebuilds.load(Ordering::Relaxed),
            dropped_changes: self.dropped_changes.load(Ordering::Relaxed),
        }
    }
}

//------------ ScopeStats ----------------------------------------------------
//
// The Counters struct holds atomic values, so this struct exists to return a
// set of counters from a Scope to users.

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ScopeStats {
    pub instances: usize,
    pub rebuilds: usize,
    pub switches: usize,
    pub failed_rebuilds: usize,
    pub dropped_changes: usize,
}

//------------ SchedState ----------------------------------------------------

/// Where an instance is in the rebuild/reselection state machine.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub enum SchedState {
    /// No timer pending.
    Stable,
    /// Timer armed, it will re-check the preference scores.
    EvalPending,
    /// Timer armed, it will reconstruct the instance regardless of the
    /// preference scores.
    RebuildPending,
    /// Destruction scheduled.
    Dead,
}

//------------ FibInstanceInfo -----------------------------------------------

/// A point-in-time description of the active instance of a routing table.
#[derive(Clone, Debug, Serialize)]
pub struct FibInstanceInfo {
    pub family: Family,
    pub fibnum: u32,
    pub algo: String,
    pub generation: u64,
    pub nhop_capacity: u32,
    pub nhop_count: u32,
    pub hit_nhops: bool,
    pub num_changes: u32,
    pub failed_rebuilds: u32,
    pub init_done: bool,
    pub state: SchedState,
}

impl std::fmt::Display for FibInstanceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "{}.{} ({}#{}) {:?}",
            self.family, self.fibnum, self.algo, self.generation, self.state
        )?;
        writeln!(
            f,
            "  nhops:\t{}/{}{}",
            self.nhop_count,
            self.nhop_capacity,
            if self.hit_nhops { " (full)" } else { "" }
        )?;
        write!(
            f,
            "  changes:\t{}, failed rebuilds: {}",
            self.num_changes, self.failed_rebuilds
        )
    }
}
