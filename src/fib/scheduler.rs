//! The per-instance timer: delayed re-evaluation of the module choice, and
//! rebuilds with exponential backoff.
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use crate::algo::FlmRef;
use crate::fib::fib_data::{schedule_destroy, FibData};
use crate::fib::scope::ScopeShared;
use crate::fib::sync::{setup_fd_instance, SetupError};

/// Arm the timer of a live instance, replacing any earlier deadline.
pub(crate) fn schedule_callout(fd: &FibData, delay: Duration) {
    if fd.is_dead() {
        return;
    }
    fd.callout.reset(delay);
}

/// Mark the instance for reconstruction. Only the first request arms the
/// timer, using the backoff for the failures so far. The mark also makes
/// the instance ignore further changes until it is replaced.
pub(crate) fn schedule_fd_rebuild(fd: &FibData, reason: &str) {
    if fd.set_need_rebuild() {
        return;
    }
    let Some(scope) = fd.scope() else {
        return;
    };
    let delay = scope.config.rebuild_delay(fd.failed_rebuilds());
    info!(
        "{}: scheduling rebuild in {:?}: {} (failures {})",
        fd,
        delay,
        reason,
        fd.failed_rebuilds()
    );
    schedule_callout(fd, delay);
}

/// The timer function of every instance.
pub(crate) fn handle_fd_callout(fd: &Arc<FibData>) {
    if fd.is_dead() {
        return;
    }
    let Some(scope) = fd.scope() else {
        return;
    };

    if fd.needs_rebuild() {
        handle_rebuild(&scope, fd);
    } else {
        handle_eval(&scope, fd);
    }
}

// Re-check whether another module suits the table better now.
fn handle_eval(scope: &Arc<ScopeShared>, fd: &Arc<FibData>) {
    fd.num_changes.store(0, Ordering::Release);
    fd.force_eval.store(false, Ordering::Release);

    if scope.is_pinned(fd.key()) {
        debug!("{}: pinned, skipping evaluation", fd);
        return;
    }

    let stats = fd.rib.stats();
    let Some(flm) = scope.registry.select_best(
        scope.id,
        fd.family(),
        fd.fibnum(),
        &stats,
        Some(&fd.flm),
        scope.config.best_diff_percent,
    ) else {
        debug!("{}: module choice stays", fd);
        return;
    };

    info!("{}: switching to {}", fd, flm.name());
    rebuild_fd_flm(scope, fd, flm);
}

fn handle_rebuild(scope: &Arc<ScopeShared>, fd: &Arc<FibData>) {
    if !scope.registry.is_quarantined(scope.id, &fd.flm, fd.fibnum()) {
        rebuild_fd_flm(scope, fd, fd.flm.clone());
        return;
    }

    let stats = fd.rib.stats();
    match scope.registry.select_best(
        scope.id,
        fd.family(),
        fd.fibnum(),
        &stats,
        None,
        scope.config.best_diff_percent,
    ) {
        Some(flm) => {
            info!("{}: module quarantined, switching to {}", fd, flm.name());
            rebuild_fd_flm(scope, fd, flm);
        }
        None => {
            // Keep forwarding with what we have, and keep trying.
            warn!("{}: module quarantined, no alternative", fd);
            fd.failed_rebuilds.fetch_add(1, Ordering::AcqRel);
            scope.counters.inc_failed_rebuilds();
            schedule_callout(fd, scope.config.rebuild_delay(fd.failed_rebuilds()));
        }
    }
}

// Replace `fd` with a fresh instance of `flm`. Returns whether the
// replacement is in place.
fn rebuild_fd_flm(
    scope: &Arc<ScopeShared>,
    fd: &Arc<FibData>,
    flm: FlmRef,
) -> bool {
    let switching = flm != fd.flm;
    match setup_fd_instance(scope, &flm, &fd.rib, Some(fd), true) {
        Ok(new_fd) => {
            if switching {
                scope.counters.inc_switches();
                info!("{}: replaced by {}", fd, new_fd);
            } else {
                scope.counters.inc_rebuilds();
                debug!("{}: rebuilt as {}", fd, new_fd);
            }
            schedule_destroy(fd, true);
            true
        }
        Err(SetupError::Stale) => {
            debug!("{}: gone while rebuilding", fd);
            false
        }
        Err(SetupError::Algo(res)) => {
            scope.counters.inc_failed_rebuilds();
            if fd.needs_rebuild() {
                let delay = scope.config.rebuild_delay(fd.failed_rebuilds());
                warn!("{}: rebuild failed ({}), retrying in {:?}", fd, res, delay);
                schedule_callout(fd, delay);
            }
            false
        }
    }
}
