
use crate::fib::datapath::DispatchEntry;
use crate::fib::nhop_table::NhopIndexTable;
use crate::rib::{RibCmdInfo, RouteEntry};
use crate::types::errors::AlgoResult;
use crate::types::stats::RibStats;
use crate::types::NhopHandle;
use crate::Family;

//------------ AlgoContext ---------------------------------------------------

/// What a lookup module gets to see of the instance it works for, in every
/// callback.
pub struct AlgoContext<'a> {
    fibnum: u32,
    family: Family,
    generation: u64,
    nhops: &'a NhopIndexTable,
}

impl<'a> AlgoContext<'a> {
    pub(crate) fn new(
        fibnum: u32,
        family: Family,
        generation: u64,
        nhops: &'a NhopIndexTable,
    ) -> Self {
        Self {
            fibnum,
            family,
            generation,
            nhops,
        }
    }

    pub fn fibnum(&self) -> u32 {
        self.fibnum
    }

    pub fn family(&self) -> Family {
        self.family
    }

    /// The generation number of the instance, unique within its scope.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The Nexthop Index Table of the instance. Every nexthop passed to
    /// `dump_rib_item` or `change_rib_item` is referenced in here by the
    /// time the callback runs.
    pub fn nhops(&self) -> &'a NhopIndexTable {
        self.nhops
    }

    pub fn nhop_index(&self, nh: &NhopHandle) -> u32 {
        self.nhops.nhop_index(nh)
    }

    pub fn nhop(&self, idx: u32) -> Option<&'a NhopHandle> {
        self.nhops.nhop(idx)
    }
}

//------------ LookupModule --------------------------------------------------

/// A longest-prefix-match algorithm implementation, registered once per
/// address family with a [FlmRegistry](super::FlmRegistry).
///
/// The module is a factory: `init` creates the per-instance state that the
/// framework then feeds with routes.
pub trait LookupModule: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn family(&self) -> Family;

    /// How well suited this algorithm is for a table of this shape. Higher
    /// is better.
    fn get_pref(&self, stats: &RibStats) -> u8;

    /// Create the state for a new instance. `prev` is the state of the
    /// instance being replaced, if any, so an algorithm can size or reuse
    /// its structures from it.
    fn init(
        &self,
        ctx: &AlgoContext<'_>,
        prev: Option<&dyn AlgoInstance>,
    ) -> Result<Box<dyn AlgoInstance>, AlgoResult>;

    /// Whether instances can absorb single changes through
    /// [AlgoInstance::change_rib_item]. Instances of modules that can't are
    /// rebuilt on every change.
    fn supports_incremental(&self) -> bool {
        true
    }
}

//------------ AlgoInstance --------------------------------------------------

/// The algorithm-private state of one instance.
pub trait AlgoInstance: Send + 'static {
    /// Absorb one entry during the initial full dump of the table.
    fn dump_rib_item(
        &mut self,
        ctx: &AlgoContext<'_>,
        rt: &RouteEntry,
    ) -> AlgoResult;

    /// The dump is complete. Return the entry the forwarding path will
    /// call for lookups in this table.
    fn dump_end(
        &mut self,
        ctx: &AlgoContext<'_>,
    ) -> Result<DispatchEntry, AlgoResult>;

    /// Apply one change of the table to a live instance. Runs under the
    /// routing table's write lock.
    fn change_rib_item(
        &mut self,
        _ctx: &AlgoContext<'_>,
        _rc: &RibCmdInfo,
    ) -> AlgoResult {
        AlgoResult::NeedsRebuild
    }

    /// Final teardown, called once, after the last lookup that could use
    /// this state has finished.
    fn destroy(self: Box<Self>) {}
}
