//! Collaborators for tests: nexthops, an in-memory routing table and a
//! scriptable lookup module.
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};

use crossbeam_epoch::{self as epoch, Atomic, Owned};
use inetnum::addr::Prefix;
use parking_lot::Mutex;

use crate::algo::{AlgoContext, AlgoInstance, LookupModule};
use crate::fib::{DispatchEntry, LookupArg, LookupKey};
use crate::rib::{
    RibCmd, RibCmdInfo, RibSubscriber, RouteEntry, RoutingTable,
    SubscriptionId, WalkHook,
};
use crate::types::errors::{AlgoResult, FibAlgoError};
use crate::types::stats::RibStats;
use crate::types::{Nexthop, NhopHandle};
use crate::Family;

//------------ TestNexthop ---------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestNexthop {
    idx: u32,
    group: bool,
}

impl TestNexthop {
    pub fn new(idx: u32) -> Self {
        Self { idx, group: false }
    }

    pub fn group(idx: u32) -> Self {
        Self { idx, group: true }
    }

    pub fn handle(idx: u32) -> NhopHandle {
        Arc::new(Self::new(idx))
    }
}

impl Nexthop for TestNexthop {
    fn index(&self) -> u32 {
        self.idx
    }

    fn is_group(&self) -> bool {
        self.group
    }
}

//------------ TestRib -------------------------------------------------------

#[derive(Default)]
struct TestRibInner {
    routes: Vec<RouteEntry>,
    subscribers: Vec<(SubscriptionId, Arc<dyn RibSubscriber>)>,
    next_sub: u64,
}

impl TestRibInner {
    fn notify(&self, rc: &RibCmdInfo) {
        for (_, sub) in self.subscribers.iter() {
            sub.on_change(rc);
        }
    }
}

/// A routing table kept in a vector, behind a single lock that serves as
/// the write lock for walks and the change feed alike.
pub struct TestRib {
    family: Family,
    fibnum: u32,
    inner: Mutex<TestRibInner>,
    dying: AtomicBool,
    refuse_subscribe: AtomicBool,
}

impl TestRib {
    pub fn new(family: Family, fibnum: u32) -> Arc<Self> {
        Arc::new(Self {
            family,
            fibnum,
            inner: Mutex::new(TestRibInner::default()),
            dying: AtomicBool::new(false),
            refuse_subscribe: AtomicBool::new(false),
        })
    }

    /// Add a route, or change the nexthop of an existing one.
    pub fn add_route(&self, prefix: Prefix, nh: NhopHandle) {
        let mut inner = self.inner.lock();
        let pos = inner.routes.iter().position(|r| r.prefix == prefix);
        match pos.and_then(|pos| inner.routes.get(pos).map(|r| (pos, r))) {
            Some((pos, rt)) => {
                let rc = RibCmdInfo::change(prefix, rt.nexthop.clone(), nh.clone());
                inner.notify(&rc);
                if let Some(rt) = inner.routes.get_mut(pos) {
                    rt.nexthop = nh;
                }
            }
            None => {
                inner.notify(&RibCmdInfo::add(prefix, nh.clone()));
                inner.routes.push(RouteEntry::new(prefix, nh));
            }
        }
    }

    pub fn delete_route(&self, prefix: &Prefix) -> bool {
        let mut inner = self.inner.lock();
        let Some(pos) = inner.routes.iter().position(|r| r.prefix == *prefix)
        else {
            return false;
        };
        let rt = inner.routes.remove(pos);
        inner.notify(&RibCmdInfo::delete(rt.prefix, rt.nexthop));
        true
    }

    pub fn clear(&self) {
        let prefixes: Vec<Prefix> =
            self.inner.lock().routes.iter().map(|r| r.prefix).collect();
        for prefix in prefixes {
            self.delete_route(&prefix);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    pub fn set_dying(&self, dying: bool) {
        self.dying.store(dying, Ordering::Release);
    }

    pub fn refuse_subscribe(&self, refuse: bool) {
        self.refuse_subscribe.store(refuse, Ordering::Release);
    }
}

impl RoutingTable for TestRib {
    fn family(&self) -> Family {
        self.family
    }

    fn fibnum(&self) -> u32 {
        self.fibnum
    }

    fn stats(&self) -> RibStats {
        let inner = self.inner.lock();
        let mut nhops: Vec<(u32, bool)> = inner
            .routes
            .iter()
            .map(|r| (r.nexthop.index(), r.nexthop.is_group()))
            .collect();
        nhops.sort_unstable();
        nhops.dedup();
        let groups = nhops.iter().filter(|(_, g)| *g).count();
        RibStats::new(inner.routes.len(), nhops.len() - groups, groups)
    }

    fn is_dying(&self) -> bool {
        self.dying.load(Ordering::Acquire)
    }

    fn walk(
        &self,
        item: &mut dyn FnMut(&RouteEntry),
        hook: &mut dyn FnMut(WalkHook),
    ) {
        let inner = self.inner.lock();
        hook(WalkHook::Pre);
        for rt in inner.routes.iter() {
            item(rt);
        }
        hook(WalkHook::Post);
    }

    fn subscribe(
        &self,
        subscriber: Arc<dyn RibSubscriber>,
    ) -> Result<SubscriptionId, FibAlgoError> {
        if self.refuse_subscribe.load(Ordering::Acquire) {
            return Err(FibAlgoError::SubscriptionFailed);
        }
        let mut inner = self.inner.lock();
        inner.next_sub += 1;
        let id = SubscriptionId(inner.next_sub);
        inner.subscribers.push((id, subscriber));
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.lock().subscribers.retain(|(i, _)| *i != id);
    }
}

//------------ TestModule ----------------------------------------------------

/// Knobs and call counters shared by a [TestModule] and all of its
/// instances.
#[derive(Debug, Default)]
pub struct TestModuleCtl {
    pref: AtomicU8,
    non_incremental: AtomicBool,
    init_result: Mutex<Option<AlgoResult>>,
    // (call number, result) for change_rib_item
    change_fail: Mutex<Option<(usize, AlgoResult)>>,
    // fail every n-th change
    change_fail_every: AtomicUsize,
    dump_end_result: Mutex<Option<AlgoResult>>,
    // (entered, release) for the next init
    init_gate: Mutex<Option<(Arc<Barrier>, Arc<Barrier>)>>,

    pub init_calls: AtomicUsize,
    pub init_with_prev: AtomicUsize,
    pub dump_calls: AtomicUsize,
    pub dump_end_calls: AtomicUsize,
    pub change_calls: AtomicUsize,
    pub destroy_calls: AtomicUsize,
}

impl TestModuleCtl {
    pub fn set_pref(&self, pref: u8) {
        self.pref.store(pref, Ordering::Release);
    }

    pub fn set_incremental(&self, incremental: bool) {
        self.non_incremental.store(!incremental, Ordering::Release);
    }

    /// Make every `init` fail with `res`, or succeed again with `None`.
    pub fn fail_init(&self, res: Option<AlgoResult>) {
        *self.init_result.lock() = res;
    }

    /// Make the `nth` call (counting from 1 over all instances) to
    /// `change_rib_item` return `res`.
    pub fn fail_change_at(&self, nth: usize, res: AlgoResult) {
        *self.change_fail.lock() = Some((nth, res));
    }

    /// Make every `n`-th change ask for a rebuild. Zero disables.
    pub fn fail_change_every(&self, n: usize) {
        self.change_fail_every.store(n, Ordering::Release);
    }

    pub fn fail_dump_end(&self, res: Option<AlgoResult>) {
        *self.dump_end_result.lock() = res;
    }

    /// Hold up the next `init`: it waits on `entered` once it is running,
    /// then on `release` before it carries on. Both barriers are for two
    /// threads.
    pub fn gate_next_init(&self, entered: Arc<Barrier>, release: Arc<Barrier>) {
        *self.init_gate.lock() = Some((entered, release));
    }

    pub fn init_calls(&self) -> usize {
        self.init_calls.load(Ordering::Acquire)
    }

    pub fn change_calls(&self) -> usize {
        self.change_calls.load(Ordering::Acquire)
    }

    pub fn dump_calls(&self) -> usize {
        self.dump_calls.load(Ordering::Acquire)
    }

    pub fn destroy_calls(&self) -> usize {
        self.destroy_calls.load(Ordering::Acquire)
    }
}

/// A lookup module doing a linear scan over all routes, with a fixed but
/// adjustable preference and scriptable failures.
pub struct TestModule {
    name: String,
    family: Family,
    ctl: Arc<TestModuleCtl>,
}

impl TestModule {
    pub fn new(name: &str, family: Family, pref: u8) -> Self {
        let ctl = TestModuleCtl::default();
        ctl.set_pref(pref);
        Self {
            name: name.to_string(),
            family,
            ctl: Arc::new(ctl),
        }
    }

    pub fn ctl(&self) -> Arc<TestModuleCtl> {
        Arc::clone(&self.ctl)
    }
}

impl LookupModule for TestModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn family(&self) -> Family {
        self.family
    }

    fn get_pref(&self, _stats: &RibStats) -> u8 {
        self.ctl.pref.load(Ordering::Acquire)
    }

    fn init(
        &self,
        _ctx: &AlgoContext<'_>,
        prev: Option<&dyn AlgoInstance>,
    ) -> Result<Box<dyn AlgoInstance>, AlgoResult> {
        self.ctl.init_calls.fetch_add(1, Ordering::AcqRel);
        let gate = self.ctl.init_gate.lock().take();
        if let Some((entered, release)) = gate {
            entered.wait();
            release.wait();
        }
        if let Some(res) = *self.ctl.init_result.lock() {
            return Err(res);
        }
        if prev.is_some() {
            self.ctl.init_with_prev.fetch_add(1, Ordering::AcqRel);
        }
        Ok(Box::new(TestInstance {
            ctl: Arc::clone(&self.ctl),
            routes: Vec::new(),
            data: Arc::new(LinearLookup::default()),
        }))
    }

    fn supports_incremental(&self) -> bool {
        !self.ctl.non_incremental.load(Ordering::Acquire)
    }
}

//------------ TestInstance --------------------------------------------------

struct TestInstance {
    ctl: Arc<TestModuleCtl>,
    routes: Vec<(Prefix, NhopHandle)>,
    data: Arc<LinearLookup>,
}

impl AlgoInstance for TestInstance {
    fn dump_rib_item(
        &mut self,
        _ctx: &AlgoContext<'_>,
        rt: &RouteEntry,
    ) -> AlgoResult {
        self.ctl.dump_calls.fetch_add(1, Ordering::AcqRel);
        self.routes.push((rt.prefix, rt.nexthop.clone()));
        AlgoResult::Success
    }

    fn dump_end(
        &mut self,
        _ctx: &AlgoContext<'_>,
    ) -> Result<DispatchEntry, AlgoResult> {
        self.ctl.dump_end_calls.fetch_add(1, Ordering::AcqRel);
        if let Some(res) = *self.ctl.dump_end_result.lock() {
            return Err(res);
        }
        self.data.store(self.routes.clone());
        Ok(DispatchEntry::new(linear_lookup, Arc::clone(&self.data)))
    }

    fn change_rib_item(
        &mut self,
        _ctx: &AlgoContext<'_>,
        rc: &RibCmdInfo,
    ) -> AlgoResult {
        let nth = self.ctl.change_calls.fetch_add(1, Ordering::AcqRel) + 1;
        if let Some((at, res)) = *self.ctl.change_fail.lock() {
            if at == nth {
                return res;
            }
        }
        let every = self.ctl.change_fail_every.load(Ordering::Acquire);
        if every > 0 && nth % every == 0 {
            return AlgoResult::NeedsRebuild;
        }

        self.routes.retain(|(p, _)| *p != rc.prefix);
        if rc.cmd != RibCmd::Delete {
            if let Some(nh) = rc.nh_new.as_ref() {
                self.routes.push((rc.prefix, nh.clone()));
            }
        }
        self.data.store(self.routes.clone());
        AlgoResult::Success
    }

    fn destroy(self: Box<Self>) {
        self.ctl.destroy_calls.fetch_add(1, Ordering::AcqRel);
    }
}

//------------ LinearLookup --------------------------------------------------

// Lookup data: the route list, replaced as a whole on every update so
// lookups never see a half-applied change.
#[derive(Default)]
struct LinearLookup {
    routes: Atomic<Vec<(Prefix, NhopHandle)>>,
}

impl LinearLookup {
    fn store(&self, routes: Vec<(Prefix, NhopHandle)>) {
        let guard = &epoch::pin();
        let old = self.routes.swap(Owned::new(routes), Ordering::AcqRel, guard);
        if !old.is_null() {
            unsafe { guard.defer_destroy(old) };
        }
    }
}

impl Drop for LinearLookup {
    fn drop(&mut self) {
        unsafe {
            let guard = epoch::unprotected();
            let cur = self.routes.load(Ordering::Relaxed, guard);
            if !cur.is_null() {
                drop(cur.into_owned());
            }
        }
    }
}

fn prefix_contains(prefix: &Prefix, addr: &IpAddr) -> bool {
    let len = u32::from(prefix.len());
    match (prefix.addr(), addr) {
        (IpAddr::V4(net), IpAddr::V4(addr)) => {
            let mask = u32::MAX.checked_shl(32 - len).unwrap_or(0);
            u32::from(net) & mask == u32::from(*addr) & mask
        }
        (IpAddr::V6(net), IpAddr::V6(addr)) => {
            let mask = u128::MAX.checked_shl(128 - len).unwrap_or(0);
            u128::from(net) & mask == u128::from(*addr) & mask
        }
        _ => false,
    }
}

fn linear_lookup(arg: &LookupArg, key: &LookupKey) -> Option<NhopHandle> {
    let data = arg.downcast_ref::<LinearLookup>()?;
    let guard = &epoch::pin();
    let routes = unsafe { data.routes.load(Ordering::Acquire, guard).as_ref() }?;
    routes
        .iter()
        .filter(|(p, _)| prefix_contains(p, &key.addr))
        .max_by_key(|(p, _)| p.len())
        .map(|(_, nh)| nh.clone())
}
