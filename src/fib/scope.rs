use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_epoch as epoch;
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::algo::FlmRegistry;
use crate::callout::CalloutService;
use crate::fib::config::FibAlgoConfig;
use crate::fib::datapath::{Datapath, DispatchEntry, LookupKey};
use crate::fib::fib_data::{schedule_destroy, FibData};
use crate::fib::sync::{setup_fd_instance, SetupError};
use crate::rib::RoutingTable;
use crate::types::errors::{AlgoResult, FibAlgoError};
use crate::types::stats::{Counters, FibInstanceInfo, ScopeStats};
use crate::types::NhopHandle;
use crate::Family;

//------------ ScopeId -------------------------------------------------------

/// Identity of a scope, unique within the process.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(pub(crate) u64);

impl std::fmt::Display for ScopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "scope{}", self.0)
    }
}

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

//------------ ScopeShared ---------------------------------------------------

pub(crate) enum LinkError {
    Stale,
    Publish(AlgoResult),
}

#[derive(Default)]
pub(crate) struct ScopeState {
    // Live instances, newest first. The first one for a table is the
    // active one.
    instances: Vec<Arc<FibData>>,
    tables: HashMap<(Family, u32), Arc<dyn RoutingTable>>,
    // tables where an operator chose the module
    pinned: HashSet<(Family, u32)>,
}

impl ScopeState {
    fn head(&self, key: (Family, u32)) -> Option<&Arc<FibData>> {
        self.instances.iter().find(|fd| fd.key() == key)
    }

    fn table_is(&self, key: (Family, u32), rib: &Arc<dyn RoutingTable>) -> bool {
        self.tables
            .get(&key)
            .is_some_and(|t| std::ptr::addr_eq(Arc::as_ptr(t), Arc::as_ptr(rib)))
    }
}

pub(crate) struct ScopeShared {
    pub id: ScopeId,
    pub registry: Arc<FlmRegistry>,
    pub config: FibAlgoConfig,
    pub callouts: CalloutService,
    pub counters: Counters,
    dp_inet: Datapath,
    dp_inet6: Datapath,
    state: Mutex<ScopeState>,
    next_gen: AtomicU64,
}

impl ScopeShared {
    pub fn next_generation(&self) -> u64 {
        self.next_gen.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn datapath(&self, family: Family) -> &Datapath {
        match family {
            Family::Inet => &self.dp_inet,
            Family::Inet6 => &self.dp_inet6,
        }
    }

    pub fn is_pinned(&self, key: (Family, u32)) -> bool {
        self.state.lock().pinned.contains(&key)
    }

    pub fn current_instance(&self, key: (Family, u32)) -> Option<Arc<FibData>> {
        self.state.lock().head(key).cloned()
    }

    /// Make `fd` the active instance of its table, provided the table is
    /// still the one `fd` was built from and `prev` is still the active
    /// instance. With `attach`, the dispatch entry of `fd` replaces the one
    /// of `prev` in the datapath, in the same critical section.
    pub fn link_instance(
        &self,
        fd: &Arc<FibData>,
        prev: Option<&Arc<FibData>>,
        attach: bool,
    ) -> Result<(), LinkError> {
        let key = fd.key();
        let mut state = self.state.lock();

        if !state.table_is(key, &fd.rib) {
            return Err(LinkError::Stale);
        }
        if let Some(prev) = prev {
            let is_head = state.head(key).is_some_and(|h| Arc::ptr_eq(h, prev));
            if prev.is_dead() || !is_head {
                return Err(LinkError::Stale);
            }
        }
        if attach {
            self.datapath(fd.family())
                .publish(fd.fibnum(), fd.dispatch_entry())
                .map_err(LinkError::Publish)?;
        }

        fd.set_linked(true);
        state.instances.insert(0, Arc::clone(fd));
        Ok(())
    }

    pub fn unlink_instance(&self, fd: &Arc<FibData>) {
        let mut state = self.state.lock();
        state.instances.retain(|i| !Arc::ptr_eq(i, fd));
        fd.set_linked(false);
    }

    // Publish a linked but not yet attached instance, unless it was
    // superseded in the meantime.
    fn publish_instance(&self, fd: &Arc<FibData>) -> Result<(), AlgoResult> {
        let state = self.state.lock();
        let is_head = state.head(fd.key()).is_some_and(|h| Arc::ptr_eq(h, fd));
        if !is_head || fd.is_dead() {
            return Ok(());
        }
        self.datapath(fd.family())
            .publish(fd.fibnum(), fd.dispatch_entry())
    }
}

//------------ Scope ---------------------------------------------------------

/// An independent set of routing tables, with their instances, their
/// datapath arrays and their timers.
///
/// Dropping the scope detaches all tables and stops its timers.
pub struct Scope {
    shared: Arc<ScopeShared>,
}

impl Scope {
    pub fn new(
        registry: Arc<FlmRegistry>,
        config: FibAlgoConfig,
        callouts: CalloutService,
    ) -> Self {
        let id = ScopeId(NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed));
        info!("[fib_algo] {} created", id);
        Self {
            shared: Arc::new(ScopeShared {
                id,
                registry,
                dp_inet: Datapath::new(config.num_tables),
                dp_inet6: Datapath::new(config.num_tables),
                config,
                callouts,
                counters: Counters::default(),
                state: Mutex::new(ScopeState::default()),
                next_gen: AtomicU64::new(0),
            }),
        }
    }

    pub fn id(&self) -> ScopeId {
        self.shared.id
    }

    pub fn config(&self) -> &FibAlgoConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &Arc<FlmRegistry> {
        &self.shared.registry
    }

    pub fn callouts(&self) -> &CalloutService {
        &self.shared.callouts
    }

    /// Bind a routing table to the best module for it and publish the
    /// resulting instance. Modules that fail non-recoverably are
    /// quarantined for the table and the next best one is tried.
    pub fn attach_table(
        &self,
        rib: Arc<dyn RoutingTable>,
    ) -> Result<(), FibAlgoError> {
        let shared = &self.shared;
        let (family, fibnum) = (rib.family(), rib.fibnum());
        if fibnum as usize >= self.num_tables(family) {
            return Err(FibAlgoError::InvalidTable(family, fibnum));
        }
        {
            let mut state = shared.state.lock();
            if state.tables.contains_key(&(family, fibnum)) {
                return Err(FibAlgoError::TableExists(family, fibnum));
            }
            state.tables.insert((family, fibnum), Arc::clone(&rib));
        }

        let res = loop {
            let stats = rib.stats();
            let Some(flm) = shared.registry.select_best(
                shared.id,
                family,
                fibnum,
                &stats,
                None,
                shared.config.best_diff_percent,
            ) else {
                warn!("[fib_algo] {}.{} no usable algorithm", family, fibnum);
                break Err(FibAlgoError::NoAlgorithm);
            };

            match setup_fd_instance(shared, &flm, &rib, None, false) {
                Ok(fd) => {
                    break match shared.publish_instance(&fd) {
                        Ok(()) => Ok(()),
                        Err(_) => {
                            schedule_destroy(&fd, false);
                            Err(FibAlgoError::OutOfMemory)
                        }
                    }
                }
                // Quarantined now, try the next best.
                Err(SetupError::Algo(AlgoResult::Error)) => continue,
                Err(SetupError::Algo(res)) => {
                    break Err(FibAlgoError::SetupFailed(res))
                }
                Err(SetupError::Stale) => {
                    return Err(FibAlgoError::TableNotFound(family, fibnum))
                }
            }
        };

        if res.is_err() {
            let mut state = shared.state.lock();
            if state.table_is((family, fibnum), &rib) {
                state.tables.remove(&(family, fibnum));
            }
            drop(state);
            shared.registry.clear_table_errors(shared.id, family, fibnum);
        }
        res
    }

    /// Unbind a routing table: its datapath slot is cleared, its instances
    /// are condemned and its error records are forgotten.
    pub fn detach_table(
        &self,
        family: Family,
        fibnum: u32,
    ) -> Result<(), FibAlgoError> {
        let shared = &self.shared;
        let doomed: Vec<Arc<FibData>> = {
            let mut state = shared.state.lock();
            state
                .tables
                .remove(&(family, fibnum))
                .ok_or(FibAlgoError::TableNotFound(family, fibnum))?;
            state.pinned.remove(&(family, fibnum));
            state
                .instances
                .iter()
                .filter(|fd| fd.key() == (family, fibnum))
                .cloned()
                .collect()
        };

        if shared.datapath(family).publish(fibnum, None).is_err() {
            warn!(
                "[fib_algo] {}.{} unable to clear datapath slot",
                family, fibnum
            );
        }
        for fd in doomed {
            schedule_destroy(&fd, false);
        }
        shared.registry.clear_table_errors(shared.id, family, fibnum);
        info!("[fib_algo] {}.{} detached", family, fibnum);
        Ok(())
    }

    /// Make room for `num_tables` tables per family. This is the only way
    /// the table range of a scope grows, it never shrinks.
    pub fn grow_tables(&self, num_tables: u32) -> Result<(), FibAlgoError> {
        for family in Family::ALL {
            self.shared
                .datapath(family)
                .grow(num_tables)
                .map_err(|_| FibAlgoError::OutOfMemory)?;
        }
        Ok(())
    }

    pub fn num_tables(&self, family: Family) -> usize {
        let guard = &epoch::pin();
        self.shared.datapath(family).len(guard)
    }

    /// Attached tables, in no particular order.
    pub fn tables(&self) -> Vec<(Family, u32)> {
        self.shared.state.lock().tables.keys().copied().collect()
    }

    /// Switch a table to the module called `name` and pin it there, so
    /// automatic reselection leaves it alone. On failure the current
    /// instance stays in place.
    pub fn set_algo(
        &self,
        family: Family,
        fibnum: u32,
        name: &str,
    ) -> Result<(), FibAlgoError> {
        let shared = &self.shared;
        let key = (family, fibnum);
        let (rib, cur) = {
            let state = shared.state.lock();
            let rib = state
                .tables
                .get(&key)
                .cloned()
                .ok_or(FibAlgoError::TableNotFound(family, fibnum))?;
            (rib, state.head(key).cloned())
        };
        let flm = shared
            .registry
            .find_by_name(name, family)
            .ok_or(FibAlgoError::ModuleNotFound)?;

        let new_fd = match setup_fd_instance(shared, &flm, &rib, cur.as_ref(), true)
        {
            Ok(fd) => fd,
            Err(SetupError::Algo(res)) => {
                return Err(FibAlgoError::SetupFailed(res))
            }
            Err(SetupError::Stale) => {
                return Err(if shared.state.lock().tables.contains_key(&key) {
                    FibAlgoError::SetupFailed(AlgoResult::NeedsRebuild)
                } else {
                    FibAlgoError::TableNotFound(family, fibnum)
                });
            }
        };

        let old: Vec<Arc<FibData>> = {
            let mut state = shared.state.lock();
            state.pinned.insert(key);
            state
                .instances
                .iter()
                .filter(|fd| fd.key() == key && !Arc::ptr_eq(fd, &new_fd))
                .cloned()
                .collect()
        };
        for fd in old {
            schedule_destroy(&fd, false);
        }
        info!("[fib_algo] {} set by operator", new_fd);
        Ok(())
    }

    /// Name of the module of the active instance.
    pub fn algo_name(&self, family: Family, fibnum: u32) -> Option<String> {
        self.shared
            .current_instance((family, fibnum))
            .map(|fd| fd.flm.name().to_string())
    }

    pub fn is_pinned(&self, family: Family, fibnum: u32) -> bool {
        self.shared.is_pinned((family, fibnum))
    }

    /// Whether the module called `name` failed non-recoverably for the
    /// table and is excluded from selection for it.
    pub fn is_quarantined(&self, family: Family, fibnum: u32, name: &str) -> bool {
        self.shared
            .registry
            .find_by_name(name, family)
            .is_some_and(|flm| {
                self.shared.registry.is_quarantined(self.shared.id, &flm, fibnum)
            })
    }

    /// Look up `key` in table `fibnum` of the key's address family. Never
    /// blocks.
    pub fn lookup(&self, fibnum: u32, key: &LookupKey) -> Option<NhopHandle> {
        let family = Family::of_addr(&key.addr);
        let guard = &epoch::pin();
        self.shared.datapath(family).get(fibnum, guard)?.lookup(key)
    }

    /// Run `f` with the dispatch entry currently published for the table.
    /// The entry stays valid for the duration of the call.
    pub fn with_dispatch<R>(
        &self,
        family: Family,
        fibnum: u32,
        f: impl FnOnce(Option<&DispatchEntry>) -> R,
    ) -> R {
        let guard = &epoch::pin();
        f(self.shared.datapath(family).get(fibnum, guard))
    }

    pub fn instance_info(
        &self,
        family: Family,
        fibnum: u32,
    ) -> Option<FibInstanceInfo> {
        self.shared
            .current_instance((family, fibnum))
            .map(|fd| fd.info())
    }

    /// Number of live instances for the table. More than one only while a
    /// replacement is in progress.
    pub fn instance_count(&self, family: Family, fibnum: u32) -> usize {
        self.shared
            .state
            .lock()
            .instances
            .iter()
            .filter(|fd| fd.key() == (family, fibnum))
            .count()
    }

    pub fn stats(&self) -> ScopeStats {
        self.shared.counters.snapshot()
    }

    pub fn stats_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.stats())
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        for (family, fibnum) in self.tables() {
            if let Err(err) = self.detach_table(family, fibnum) {
                debug!("[fib_algo] {}: {}", self.shared.id, err);
            }
        }
        self.shared.registry.clear_scope_errors(self.shared.id);
        self.shared.callouts.shutdown();
        info!("[fib_algo] {} destroyed", self.shared.id);
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.shared.id)
            .field("tables", &self.tables())
            .finish()
    }
}
