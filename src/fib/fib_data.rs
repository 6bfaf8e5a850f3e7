use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, trace};
use parking_lot::Mutex;

use crate::algo::{AlgoContext, AlgoInstance, FlmRef};
use crate::callout::Callout;
use crate::fib::datapath::DispatchEntry;
use crate::fib::nhop_table::NhopIndexTable;
use crate::fib::scheduler;
use crate::fib::scope::ScopeShared;
use crate::fib::sync;
use crate::reclaim;
use crate::rib::{RibCmdInfo, RibSubscriber, RoutingTable, SubscriptionId};
use crate::types::stats::{FibInstanceInfo, SchedState};
use crate::Family;

//------------ FibInner ------------------------------------------------------

// The parts of an instance that change with every route update. Changes are
// applied under the routing table's write lock, so this lock is only ever
// contended by the setup of a successor reading its predecessor.
pub(crate) struct FibInner {
    pub nh: NhopIndexTable,
    pub algo: Option<Box<dyn AlgoInstance>>,
    pub dispatch: Option<DispatchEntry>,
}

//------------ FibData -------------------------------------------------------

/// One instance: a lookup module bound to a routing table.
pub(crate) struct FibData {
    family: Family,
    fibnum: u32,
    generation: u64,
    pub(crate) flm: FlmRef,
    pub(crate) rib: Arc<dyn RoutingTable>,
    scope: Weak<ScopeShared>,
    pub(crate) inner: Mutex<FibInner>,
    subscription: Mutex<Option<SubscriptionId>>,
    pub(crate) callout: Callout,

    dead: AtomicBool,
    linked: AtomicBool,
    init_done: AtomicBool,
    need_rebuild: AtomicBool,
    pub(crate) force_eval: AtomicBool,
    pub(crate) num_changes: AtomicU32,
    pub(crate) failed_rebuilds: AtomicU32,
}

impl FibData {
    pub fn new(
        scope: &Arc<ScopeShared>,
        flm: FlmRef,
        rib: Arc<dyn RoutingTable>,
        nh: NhopIndexTable,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<FibData>| {
            let me = me.clone();
            let callout = scope.callouts.callout(Arc::new(move || {
                if let Some(fd) = me.upgrade() {
                    scheduler::handle_fd_callout(&fd);
                }
            }));
            FibData {
                family: rib.family(),
                fibnum: rib.fibnum(),
                generation: scope.next_generation(),
                flm,
                rib,
                scope: Arc::downgrade(scope),
                inner: Mutex::new(FibInner {
                    nh,
                    algo: None,
                    dispatch: None,
                }),
                subscription: Mutex::new(None),
                callout,
                dead: AtomicBool::new(false),
                linked: AtomicBool::new(false),
                init_done: AtomicBool::new(false),
                need_rebuild: AtomicBool::new(false),
                force_eval: AtomicBool::new(false),
                num_changes: AtomicU32::new(0),
                failed_rebuilds: AtomicU32::new(0),
            }
        })
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn fibnum(&self) -> u32 {
        self.fibnum
    }

    pub fn key(&self) -> (Family, u32) {
        (self.family, self.fibnum)
    }

    pub fn scope(&self) -> Option<Arc<ScopeShared>> {
        self.scope.upgrade()
    }

    pub fn ctx<'a>(&self, nh: &'a NhopIndexTable) -> AlgoContext<'a> {
        AlgoContext::new(self.fibnum, self.family, self.generation, nh)
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    pub fn is_linked(&self) -> bool {
        self.linked.load(Ordering::Acquire)
    }

    pub fn set_linked(&self, linked: bool) {
        self.linked.store(linked, Ordering::Release);
    }

    pub fn is_init_done(&self) -> bool {
        self.init_done.load(Ordering::Acquire)
    }

    pub fn set_init_done(&self) {
        self.init_done.store(true, Ordering::Release);
    }

    pub fn needs_rebuild(&self) -> bool {
        self.need_rebuild.load(Ordering::Acquire)
    }

    /// Returns the previous value.
    pub fn set_need_rebuild(&self) -> bool {
        self.need_rebuild.swap(true, Ordering::AcqRel)
    }

    pub fn failed_rebuilds(&self) -> u32 {
        self.failed_rebuilds.load(Ordering::Acquire)
    }

    pub fn dispatch_entry(&self) -> Option<DispatchEntry> {
        self.inner.lock().dispatch.clone()
    }

    pub fn set_subscription(&self, id: SubscriptionId) {
        *self.subscription.lock() = Some(id);
    }

    fn unsubscribe(&self) {
        if let Some(id) = self.subscription.lock().take() {
            self.rib.unsubscribe(id);
        }
    }

    pub fn sched_state(&self) -> SchedState {
        if self.is_dead() {
            SchedState::Dead
        } else if self.needs_rebuild() {
            SchedState::RebuildPending
        } else if self.callout.pending() {
            SchedState::EvalPending
        } else {
            SchedState::Stable
        }
    }

    pub fn info(&self) -> FibInstanceInfo {
        let inner = self.inner.lock();
        FibInstanceInfo {
            family: self.family,
            fibnum: self.fibnum,
            algo: self.flm.name().to_string(),
            generation: self.generation,
            nhop_capacity: inner.nh.capacity(),
            nhop_count: inner.nh.count(),
            hit_nhops: inner.nh.hit_nhops(),
            num_changes: self.num_changes.load(Ordering::Acquire),
            failed_rebuilds: self.failed_rebuilds(),
            init_done: self.is_init_done(),
            state: self.sched_state(),
        }
    }
}

impl RibSubscriber for FibData {
    fn on_change(&self, rc: &RibCmdInfo) {
        sync::handle_rtable_change(self, rc);
    }
}

impl std::fmt::Display for FibData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{} ({}#{})",
            self.family,
            self.fibnum,
            self.flm.name(),
            self.generation
        )
    }
}

impl std::fmt::Debug for FibData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FibData({})", self)
    }
}

// Runs once the last reference is gone, which for any instance that was
// ever visible to the forwarding path is after its grace period.
impl Drop for FibData {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        inner.dispatch = None;
        if let Some(algo) = inner.algo.take() {
            algo.destroy();
        }
        inner.nh.release_all();
        trace!("{}: freed", self);
    }
}

//------------ Destruction ---------------------------------------------------

/// Condemn an instance. The first call wins, later ones are no-ops.
///
/// The instance stops receiving changes and leaves the list of live
/// instances right away. Its timer is cancelled: `stop` from inside its own
/// callout, `drain` from anywhere else. The memory, the algorithm state and
/// the nexthop references go after a grace period.
pub(crate) fn schedule_destroy(fd: &Arc<FibData>, in_callout: bool) {
    if fd.dead.swap(true, Ordering::AcqRel) {
        return;
    }
    debug!("{}: scheduling destroy", fd);

    fd.unsubscribe();
    if fd.is_linked() {
        if let Some(scope) = fd.scope() {
            scope.unlink_instance(fd);
        }
    }

    if in_callout || fd.callout.is_running_here() {
        fd.callout.stop();
    } else {
        fd.callout.drain();
    }

    let fd = Arc::clone(fd);
    reclaim::defer(move || drop(fd));
}
