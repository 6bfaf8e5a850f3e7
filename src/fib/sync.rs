//! Building instances from a routing table, and keeping them in step with
//! it afterwards.
use std::cell::Cell;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::{debug, info, trace, warn};

use crate::algo::FlmRef;
use crate::fib::fib_data::{schedule_destroy, FibData};
use crate::fib::nhop_table::NhopIndexTable;
use crate::fib::scheduler;
use crate::fib::scope::{LinkError, ScopeShared};
use crate::rib::{RibCmdInfo, RibSubscriber, RouteEntry, RoutingTable, WalkHook};
use crate::types::errors::AlgoResult;

pub(crate) enum SetupError {
    /// Setup gave up with this result.
    Algo(AlgoResult),
    /// The table was detached, or the instance to replace died, while we
    /// were building.
    Stale,
}

//------------ Setup ---------------------------------------------------------

// One attempt at building an instance of `flm` for `rib`. Returns the
// candidate whenever one was allocated, so the caller can either link it or
// condemn it, and feed it to the next attempt.
fn try_setup_fd_instance(
    scope: &Arc<ScopeShared>,
    flm: &FlmRef,
    rib: &Arc<dyn RoutingTable>,
    prev: Option<&Arc<FibData>>,
) -> (AlgoResult, Option<Arc<FibData>>) {
    let config = &scope.config;

    let capacity = match prev {
        Some(prev) => NhopIndexTable::next_capacity(
            Some(&prev.inner.lock().nh),
            config.min_nhops,
            config.max_nhops,
        ),
        None => {
            NhopIndexTable::next_capacity(None, config.min_nhops, config.max_nhops)
        }
    };
    let nh = match NhopIndexTable::try_new(capacity) {
        Ok(nh) => nh,
        Err(res) => {
            warn!(
                "[fib_algo] {}.{} unable to allocate {} nhop slots",
                rib.family(),
                rib.fibnum(),
                capacity
            );
            return (res, None);
        }
    };
    let fd = FibData::new(scope, flm.clone(), Arc::clone(rib), nh);
    trace!("{}: setup, nhop capacity {}", fd, capacity);

    // Lock order: new instance, then its predecessor.
    let init_res = {
        let mut guard = fd.inner.lock();
        let inner = &mut *guard;
        let prev_guard = prev.map(|p| p.inner.lock());
        let prev_algo = prev_guard.as_ref().and_then(|g| g.algo.as_deref());
        match flm.init(&fd.ctx(&inner.nh), prev_algo) {
            Ok(algo) => {
                inner.algo = Some(algo);
                AlgoResult::Success
            }
            Err(res) => res,
        }
    };
    if !init_res.is_success() {
        debug!("{}: init failed: {}", fd, init_res);
        return (init_res, Some(fd));
    }

    // Subscribe before the dump, so nothing between the two gets lost.
    // Changes are ignored until init_done is set at the end of the walk,
    // which happens under the table lock.
    match rib.subscribe(Arc::clone(&fd) as Arc<dyn RibSubscriber>) {
        Ok(id) => fd.set_subscription(id),
        Err(err) => {
            warn!("{}: {}", fd, err);
            return (AlgoResult::NeedsRebuild, Some(fd));
        }
    }

    let result = Cell::new(AlgoResult::Success);
    rib.walk(
        &mut |rt: &RouteEntry| {
            let mut guard = fd.inner.lock();
            let inner = &mut *guard;
            if inner.nh.reference(&rt.nexthop).is_err() {
                result.set(result.get().worst(AlgoResult::NeedsRebuild));
                return;
            }
            if !result.get().is_success() {
                return;
            }
            if let Some(algo) = inner.algo.as_mut() {
                let res = algo.dump_rib_item(&fd.ctx(&inner.nh), rt);
                result.set(result.get().worst(res));
            }
        },
        &mut |stage: WalkHook| {
            if stage != WalkHook::Post {
                return;
            }
            if rib.is_dying() {
                debug!("{}: table is being destroyed", fd);
                result.set(AlgoResult::Error);
                return;
            }
            let mut guard = fd.inner.lock();
            let inner = &mut *guard;
            if inner.nh.hit_nhops() {
                result.set(result.get().worst(AlgoResult::NeedsRebuild));
            }
            if !result.get().is_success() {
                return;
            }
            let Some(algo) = inner.algo.as_mut() else {
                result.set(AlgoResult::Error);
                return;
            };
            match algo.dump_end(&fd.ctx(&inner.nh)) {
                Ok(entry) => {
                    inner.dispatch = Some(entry);
                    fd.set_init_done();
                }
                Err(res) => result.set(result.get().worst(res)),
            }
        },
    );

    let result = result.get();
    if !result.is_success() {
        debug!("{}: dump failed: {}", fd, result);
    }
    (result, Some(fd))
}

/// Build a fully synced instance of `flm` for `rib` and link it into the
/// scope, publishing it to the forwarding path if `attach` is set.
///
/// `orig` is the instance being replaced, if any. Attempts that ask for a
/// rebuild are retried up to `max_tries` times, each one handed the
/// previous failed candidate. A non-recoverable error quarantines `flm` for
/// the table. Either way a final failure counts against `orig`.
pub(crate) fn setup_fd_instance(
    scope: &Arc<ScopeShared>,
    flm: &FlmRef,
    rib: &Arc<dyn RoutingTable>,
    orig: Option<&Arc<FibData>>,
    attach: bool,
) -> Result<Arc<FibData>, SetupError> {
    let mut candidate: Option<Arc<FibData>> = None;
    let mut result = AlgoResult::NeedsRebuild;

    for attempt in 1..=scope.config.max_tries {
        let prev = candidate.as_ref().or(orig);
        let (res, new_fd) = try_setup_fd_instance(scope, flm, rib, prev);
        result = res;

        if let (AlgoResult::Success, Some(fd)) = (res, new_fd.as_ref()) {
            match scope.link_instance(fd, orig, attach) {
                Ok(()) => {
                    if let Some(c) = candidate.take() {
                        schedule_destroy(&c, false);
                    }
                    scope.counters.inc_instances();
                    info!("{}: installed after {} attempt(s)", fd, attempt);
                    return Ok(Arc::clone(fd));
                }
                Err(LinkError::Stale) => {
                    debug!("{}: table changed under us, discarding", fd);
                    schedule_destroy(fd, false);
                    if let Some(c) = candidate.take() {
                        schedule_destroy(&c, false);
                    }
                    return Err(SetupError::Stale);
                }
                Err(LinkError::Publish(res)) => result = res,
            }
        }

        if let Some(c) = candidate.take() {
            schedule_destroy(&c, false);
        }
        candidate = new_fd;
        if result != AlgoResult::NeedsRebuild {
            break;
        }
    }

    if let Some(c) = candidate.take() {
        schedule_destroy(&c, false);
    }

    if result == AlgoResult::Error {
        scope.registry.record_error(scope.id, flm, rib.fibnum());
    }
    if let Some(orig) = orig {
        orig.failed_rebuilds.fetch_add(1, Ordering::AcqRel);
    }
    warn!(
        "[fib_algo] {}.{} setup of {} failed: {}",
        rib.family(),
        rib.fibnum(),
        flm.name(),
        result
    );
    Err(SetupError::Algo(result))
}

//------------ Change Application --------------------------------------------

/// Apply one routing table change to a live instance. Called by the table,
/// under its write lock, before the change itself is applied.
pub(crate) fn handle_rtable_change(fd: &FibData, rc: &RibCmdInfo) {
    let Some(scope) = fd.scope() else {
        return;
    };
    if fd.is_dead() || !fd.is_init_done() || fd.needs_rebuild() {
        scope.counters.inc_dropped_changes();
        trace!("{}: ignoring {:?} {}", fd, rc.cmd, rc.prefix);
        return;
    }

    let num_changes = fd.num_changes.fetch_add(1, Ordering::AcqRel) + 1;
    if num_changes == 1 {
        scheduler::schedule_callout(fd, scope.config.eval_delay());
    } else if num_changes > scope.config.eval_num_routes
        && !fd.force_eval.swap(true, Ordering::AcqRel)
    {
        // Lots of churn, check the preference scores soon.
        scheduler::schedule_callout(fd, scope.config.callout_delay());
    }

    if !fd.flm.supports_incremental() {
        scheduler::schedule_fd_rebuild(fd, "algo requires rebuild");
        return;
    }

    let mut guard = fd.inner.lock();
    let inner = &mut *guard;

    if let Some(nh) = rc.nh_new.as_ref() {
        if inner.nh.reference(nh).is_err() {
            drop(guard);
            scheduler::schedule_fd_rebuild(fd, "nhop index limit reached");
            return;
        }
    }

    let res = match inner.algo.as_mut() {
        Some(algo) => algo.change_rib_item(&fd.ctx(&inner.nh), rc),
        None => AlgoResult::NeedsRebuild,
    };

    match res {
        AlgoResult::Success => {
            if let Some(nh) = rc.nh_old.as_ref() {
                inner.nh.unreference(nh);
            }
        }
        AlgoResult::NeedsRebuild => {
            drop(guard);
            scheduler::schedule_fd_rebuild(fd, "algo requested rebuild");
        }
        AlgoResult::Error => {
            drop(guard);
            scope.registry.record_error(scope.id, &fd.flm, fd.fibnum());
            scheduler::schedule_fd_rebuild(fd, "algo reported non-recoverable error");
        }
    }
}
