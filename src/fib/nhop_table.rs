use log::{trace, warn};

use crate::reclaim;
use crate::types::errors::AlgoResult;
use crate::types::NhopHandle;

//------------ NhopIndexTable ------------------------------------------------
//
// Maps the dense nexthop index the routing table hands out to the nexthop
// itself, together with the number of routes in this instance that use it.
// While the count for a slot is non-zero the slot holds a clone of the
// handle, i.e. the instance holds an external reference on the nexthop.

#[derive(Debug)]
pub struct NhopIndexTable {
    slots: Vec<Option<NhopHandle>>,
    refcnt: Vec<u32>,
    count: u32,
    hit_nhops: bool,
}

impl NhopIndexTable {
    /// Allocate a table for `capacity` indexes. Failing to reserve the
    /// memory is a reason to rebuild, never a reason to panic.
    pub(crate) fn try_new(capacity: u32) -> Result<Self, AlgoResult> {
        let capacity = capacity as usize;
        let mut slots: Vec<Option<NhopHandle>> = Vec::new();
        let mut refcnt: Vec<u32> = Vec::new();
        slots
            .try_reserve_exact(capacity)
            .map_err(|_| AlgoResult::NeedsRebuild)?;
        refcnt
            .try_reserve_exact(capacity)
            .map_err(|_| AlgoResult::NeedsRebuild)?;
        slots.resize_with(capacity, || None);
        refcnt.resize(capacity, 0);

        Ok(Self {
            slots,
            refcnt,
            count: 0,
            hit_nhops: false,
        })
    }

    /// Work out the capacity for the successor of an instance whose table
    /// is `prev`. A predecessor that ran out of indexes gets its capacity
    /// doubled, everything else reuses the capacity unchanged.
    pub(crate) fn next_capacity(
        prev: Option<&NhopIndexTable>,
        min_nhops: u32,
        max_nhops: u32,
    ) -> u32 {
        match prev {
            None => min_nhops,
            Some(prev) if prev.hit_nhops => {
                prev.capacity().saturating_mul(2).max(min_nhops).min(max_nhops)
            }
            Some(prev) => prev.capacity(),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.refcnt.len() as u32
    }

    /// The number of distinct nexthops currently referenced.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Whether an index beyond the capacity was ever seen.
    pub fn hit_nhops(&self) -> bool {
        self.hit_nhops
    }

    pub fn nhop(&self, idx: u32) -> Option<&NhopHandle> {
        self.slots.get(idx as usize).and_then(|s| s.as_ref())
    }

    pub fn nhop_index(&self, nh: &NhopHandle) -> u32 {
        nh.index()
    }

    pub fn refcount(&self, idx: u32) -> u32 {
        self.refcnt.get(idx as usize).copied().unwrap_or(0)
    }

    /// Take a reference on `nh` for one more route. The first reference to
    /// an index clones the handle into the table. An index beyond the
    /// capacity marks the table as undersized and asks for a rebuild.
    pub(crate) fn reference(
        &mut self,
        nh: &NhopHandle,
    ) -> Result<u32, AlgoResult> {
        let idx = nh.index();
        if idx >= self.capacity() {
            trace!("nhop index {} exceeds capacity {}", idx, self.capacity());
            self.hit_nhops = true;
            return Err(AlgoResult::NeedsRebuild);
        }
        let (Some(cnt), Some(slot)) = (
            self.refcnt.get_mut(idx as usize),
            self.slots.get_mut(idx as usize),
        ) else {
            return Err(AlgoResult::NeedsRebuild);
        };

        if *cnt == 0 {
            *slot = Some(nh.clone());
            self.count += 1;
        }
        *cnt += 1;

        Ok(idx)
    }

    /// Drop one route's reference on `nh`. When the last one goes, the
    /// external reference is released after a grace period, since lookups
    /// running right now may still return this nexthop.
    pub(crate) fn unreference(&mut self, nh: &NhopHandle) {
        let idx = nh.index();
        let (Some(cnt), Some(slot)) = (
            self.refcnt.get_mut(idx as usize),
            self.slots.get_mut(idx as usize),
        ) else {
            return;
        };

        if *cnt == 0 {
            warn!("unbalanced release of nhop index {}", idx);
            return;
        }
        *cnt -= 1;

        if *cnt == 0 {
            if let Some(old) = slot.take() {
                self.count -= 1;
                reclaim::defer(move || drop(old));
            }
        }
    }

    /// Release every remaining reference. Only called once the owning
    /// instance is past its grace period, so no deferral is needed.
    pub(crate) fn release_all(&mut self) {
        for (slot, cnt) in self.slots.iter_mut().zip(self.refcnt.iter_mut()) {
            *slot = None;
            *cnt = 0;
        }
        self.count = 0;
    }
}
