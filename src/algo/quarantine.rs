use std::collections::HashMap;

use roaring::RoaringBitmap;

use crate::algo::registry::FlmId;
use crate::fib::ScopeId;
use crate::Family;

//------------ ErrorRecords --------------------------------------------------
//
// The (module, table) pairings that failed non-recoverably. Per scope,
// family and module we keep the set of table numbers in a bitmap. Lives
// inside the registry, behind the registry lock.

#[derive(Debug, Default)]
pub(crate) struct ErrorRecords {
    records: HashMap<(ScopeId, Family, FlmId), RoaringBitmap>,
}

impl ErrorRecords {
    /// Returns `false` if the pairing was already recorded.
    pub fn record(
        &mut self,
        scope: ScopeId,
        family: Family,
        flm: FlmId,
        fibnum: u32,
    ) -> bool {
        self.records
            .entry((scope, family, flm))
            .or_default()
            .insert(fibnum)
    }

    pub fn contains(
        &self,
        scope: ScopeId,
        family: Family,
        flm: FlmId,
        fibnum: u32,
    ) -> bool {
        self.records
            .get(&(scope, family, flm))
            .is_some_and(|rbm| rbm.contains(fibnum))
    }

    pub fn clear_for_module(&mut self, flm: FlmId) {
        self.records.retain(|(_, _, id), _| *id != flm);
    }

    pub fn clear_for_table(&mut self, scope: ScopeId, family: Family, fibnum: u32) {
        self.records.retain(|(s, f, _), rbm| {
            if *s == scope && *f == family {
                rbm.remove(fibnum);
            }
            !rbm.is_empty()
        });
    }

    pub fn clear_all(&mut self, scope: ScopeId) {
        self.records.retain(|(s, _, _), _| *s != scope);
    }

    pub fn len(&self) -> u64 {
        self.records.values().map(|rbm| rbm.len()).sum()
    }
}
