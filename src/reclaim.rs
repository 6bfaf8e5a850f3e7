//! Grace-period deferred work.
//!
//! Anything a concurrent reader might still observe (a superseded instance,
//! a replaced datapath array, a nexthop an instance stopped referencing) is
//! released through here. The release runs only after every thread that was
//! pinned at scheduling time has unpinned at least once.
use crossbeam_epoch as epoch;

/// Run `f` after the current grace period.
pub(crate) fn defer<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    let guard = epoch::pin();
    guard.defer(f);
    // Hand the bag to the global queue right away, so the release does not
    // wait for this thread to pin another 128 times.
    guard.flush();
}
