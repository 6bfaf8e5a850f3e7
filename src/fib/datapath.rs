use std::any::Any;
use std::net::IpAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned};
use crossbeam_utils::{Backoff, CachePadded};
use log::trace;

use crate::types::errors::AlgoResult;
use crate::types::NhopHandle;

//------------ LookupKey -----------------------------------------------------

/// What the forwarding path looks up: a destination address.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LookupKey {
    pub addr: IpAddr,
}

impl LookupKey {
    pub fn new(addr: IpAddr) -> Self {
        Self { addr }
    }
}

impl From<IpAddr> for LookupKey {
    fn from(addr: IpAddr) -> Self {
        Self::new(addr)
    }
}

//------------ DispatchEntry -------------------------------------------------

/// The opaque lookup data of an instance, as handed to its lookup function.
pub type LookupArg = dyn Any + Send + Sync;

pub type LookupFn = fn(&LookupArg, &LookupKey) -> Option<NhopHandle>;

/// A lookup function and the data it operates on. This pair is all the
/// forwarding path ever sees of an instance.
#[derive(Clone)]
pub struct DispatchEntry {
    func: LookupFn,
    arg: Arc<LookupArg>,
}

impl DispatchEntry {
    pub fn new<T: Any + Send + Sync>(func: LookupFn, arg: Arc<T>) -> Self {
        Self { func, arg }
    }

    pub fn lookup(&self, key: &LookupKey) -> Option<NhopHandle> {
        (self.func)(self.arg.as_ref(), key)
    }
}

impl std::fmt::Debug for DispatchEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchEntry")
            .field("func", &(self.func as *const ()))
            .field("arg", &Arc::as_ptr(&self.arg))
            .finish()
    }
}

//------------ Datapath ------------------------------------------------------

struct DpArray {
    entries: Vec<Option<DispatchEntry>>,
}

/// The per-family array of dispatch entries, indexed by table number.
///
/// Readers load the array under an epoch guard and never block. Writers
/// never modify a published array in place: they build a patched copy,
/// swap it in and retire the old one after a grace period.
pub(crate) struct Datapath {
    head: CachePadded<Atomic<DpArray>>,
}

impl Datapath {
    pub fn new(num_tables: u32) -> Self {
        Self {
            head: CachePadded::new(Atomic::new(DpArray {
                entries: vec![None; num_tables as usize],
            })),
        }
    }

    pub fn len(&self, guard: &Guard) -> usize {
        let array = self.head.load(Ordering::Acquire, guard);
        // Safety: the head is never null and the guard keeps it alive.
        unsafe { array.as_ref() }.map_or(0, |a| a.entries.len())
    }

    pub fn get<'g>(
        &self,
        fibnum: u32,
        guard: &'g Guard,
    ) -> Option<&'g DispatchEntry> {
        let array = self.head.load(Ordering::Acquire, guard);
        // Safety: see len()
        unsafe { array.as_ref() }?
            .entries
            .get(fibnum as usize)?
            .as_ref()
    }

    /// Install `entry` in the slot for `fibnum`. The array never grows
    /// here, a slot beyond its end is an error.
    pub fn publish(
        &self,
        fibnum: u32,
        entry: Option<DispatchEntry>,
    ) -> Result<(), AlgoResult> {
        self.replace(0, Some((fibnum, entry)))
    }

    /// Make room for at least `num_tables` tables.
    pub fn grow(&self, num_tables: u32) -> Result<(), AlgoResult> {
        self.replace(num_tables as usize, None)
    }

    fn replace(
        &self,
        min_len: usize,
        patch: Option<(u32, Option<DispatchEntry>)>,
    ) -> Result<(), AlgoResult> {
        let guard = &epoch::pin();
        let backoff = Backoff::new();
        loop {
            let cur = self.head.load(Ordering::Acquire, guard);
            // Safety: see len()
            let old = unsafe { cur.as_ref() }
                .map(|a| a.entries.as_slice())
                .unwrap_or_default();
            let len = old.len().max(min_len);

            if patch.is_none() && len == old.len() {
                return Ok(());
            }

            let mut entries = Vec::new();
            entries
                .try_reserve_exact(len)
                .map_err(|_| AlgoResult::NeedsRebuild)?;
            entries.extend_from_slice(old);
            entries.resize(len, None);
            if let Some((fibnum, entry)) = patch.as_ref() {
                let slot = entries
                    .get_mut(*fibnum as usize)
                    .ok_or(AlgoResult::Error)?;
                *slot = entry.clone();
            }

            match self.head.compare_exchange(
                cur,
                Owned::new(DpArray { entries }),
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(_) => {
                    trace!("datapath array replaced, {} slots", len);
                    if !cur.is_null() {
                        // Safety: unlinked above, readers that still see it
                        // are pinned.
                        unsafe { guard.defer_destroy(cur) };
                    }
                    guard.flush();
                    return Ok(());
                }
                Err(_) => backoff.spin(),
            }
        }
    }
}

impl Drop for Datapath {
    fn drop(&mut self) {
        // Safety: we have exclusive access, no reader can be pinned on us.
        unsafe {
            let guard = epoch::unprotected();
            let head = self.head.swap(
                crossbeam_epoch::Shared::null(),
                Ordering::Relaxed,
                guard,
            );
            if !head.is_null() {
                drop(head.into_owned());
            }
        }
    }
}
