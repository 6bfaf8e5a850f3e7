use std::ops::Deref;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use log::{debug, info, trace};
use parking_lot::Mutex;

use crate::algo::quarantine::ErrorRecords;
use crate::algo::LookupModule;
use crate::fib::ScopeId;
use crate::types::errors::FibAlgoError;
use crate::types::stats::RibStats;
use crate::Family;

/// Identity of one registration. Never reused within a process, so a stale
/// id can't accidentally name a later module of the same name.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlmId(pub(crate) u64);

static NEXT_FLM_ID: AtomicU64 = AtomicU64::new(1);

//------------ FlmEntry ------------------------------------------------------

struct FlmEntry {
    id: FlmId,
    module: Box<dyn LookupModule>,
    // live instances using the module, plus in-flight selections
    refcount: AtomicU32,
}

//------------ FlmRef --------------------------------------------------------

/// A counted reference to a registered lookup module. Cloning takes another
/// reference, dropping releases it. A module can't be unregistered while
/// any `FlmRef` to it exists.
pub struct FlmRef(Arc<FlmEntry>);

impl FlmRef {
    fn new(entry: &Arc<FlmEntry>) -> Self {
        entry.refcount.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(entry))
    }

    pub fn id(&self) -> FlmId {
        self.0.id
    }

    pub fn refcount(&self) -> u32 {
        self.0.refcount.load(Ordering::Acquire)
    }
}

impl Deref for FlmRef {
    type Target = dyn LookupModule;

    fn deref(&self) -> &Self::Target {
        self.0.module.as_ref()
    }
}

impl Clone for FlmRef {
    fn clone(&self) -> Self {
        Self::new(&self.0)
    }
}

impl Drop for FlmRef {
    fn drop(&mut self) {
        self.0.refcount.fetch_sub(1, Ordering::AcqRel);
    }
}

impl PartialEq for FlmRef {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for FlmRef {}

impl std::fmt::Debug for FlmRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} (id {}, refs {})",
            self.name(),
            self.family(),
            self.0.id.0,
            self.refcount()
        )
    }
}

//------------ FlmRegistry ---------------------------------------------------

#[derive(Default)]
struct RegistryInner {
    modules: Vec<Arc<FlmEntry>>,
    errors: ErrorRecords,
}

/// The catalogue of available lookup modules, for all families.
///
/// One lock protects the module list, the module reference counts as far
/// as unregistration is concerned, and the error records of all scopes. It
/// is only ever held for list manipulation, never across a module callback.
#[derive(Default)]
pub struct FlmRegistry {
    inner: Mutex<RegistryInner>,
}

impl FlmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> Arc<FlmRegistry> {
        static GLOBAL: OnceLock<Arc<FlmRegistry>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(FlmRegistry::new())))
    }

    /// Add a module to the catalogue. Names are not checked for
    /// uniqueness.
    pub fn register<M: LookupModule>(&self, module: M) -> FlmId {
        let id = FlmId(NEXT_FLM_ID.fetch_add(1, Ordering::Relaxed));
        info!(
            "[fib_algo] attaching {} algo {}",
            module.family(),
            module.name()
        );
        self.inner.lock().modules.push(Arc::new(FlmEntry {
            id,
            module: Box::new(module),
            refcount: AtomicU32::new(0),
        }));
        id
    }

    /// Remove a module from the catalogue, together with all error records
    /// naming it. Fails while the module is still referenced.
    pub fn unregister(&self, id: FlmId) -> Result<(), FibAlgoError> {
        let mut inner = self.inner.lock();

        let pos = inner
            .modules
            .iter()
            .position(|e| e.id == id)
            .ok_or(FibAlgoError::ModuleNotFound)?;

        let refcount = inner
            .modules
            .get(pos)
            .map_or(0, |e| e.refcount.load(Ordering::Acquire));
        if refcount > 0 {
            debug!(
                "[fib_algo] unable to detach module {:?}: {} references",
                id, refcount
            );
            return Err(FibAlgoError::ModuleBusy);
        }

        inner.errors.clear_for_module(id);
        let entry = inner.modules.remove(pos);
        info!(
            "[fib_algo] detaching {} algo {}",
            entry.module.family(),
            entry.module.name()
        );
        Ok(())
    }

    pub fn find_by_name(&self, name: &str, family: Family) -> Option<FlmRef> {
        self.inner
            .lock()
            .modules
            .iter()
            .find(|e| e.module.family() == family && e.module.name() == name)
            .map(FlmRef::new)
    }

    /// Comma-separated names of the modules registered for `family`, in
    /// registration order.
    pub fn algo_list(&self, family: Family) -> String {
        self.inner
            .lock()
            .modules
            .iter()
            .filter(|e| e.module.family() == family)
            .map(|e| e.module.name().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn len(&self) -> usize {
        self.inner.lock().modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pick the module with the highest preference for a table with
    /// `stats`, skipping modules quarantined for this table.
    ///
    /// With a `current` module, a candidate is only returned if it is a
    /// different module and its score beats the current score by more than
    /// `margin_percent` percent. Otherwise there is no recommendation, so
    /// near ties keep the current module.
    pub(crate) fn select_best(
        &self,
        scope: ScopeId,
        family: Family,
        fibnum: u32,
        stats: &RibStats,
        current: Option<&FlmRef>,
        margin_percent: u32,
    ) -> Option<FlmRef> {
        // Take references under the lock, score without it.
        let candidates: Vec<FlmRef> = {
            let inner = self.inner.lock();
            inner
                .modules
                .iter()
                .filter(|e| e.module.family() == family)
                .filter(|e| !inner.errors.contains(scope, family, e.id, fibnum))
                .map(FlmRef::new)
                .collect()
        };

        let mut best: Option<(u8, FlmRef)> = None;
        for flm in candidates {
            let pref = flm.get_pref(stats);
            trace!("[fib_algo] {}.{} {} pref {}", family, fibnum, flm.name(), pref);
            if best.as_ref().is_none_or(|(best_pref, _)| pref > *best_pref) {
                best = Some((pref, flm));
            }
        }
        let (best_pref, best_flm) = best?;

        let Some(current) = current else {
            return Some(best_flm);
        };
        if best_flm == *current {
            return None;
        }

        let cur_pref = current.get_pref(stats);
        // Scores are u8, only the margin comes from outside.
        let threshold = u64::from(cur_pref)
            .saturating_mul(100u64.saturating_add(u64::from(margin_percent)));
        if u64::from(best_pref) * 100 > threshold {
            debug!(
                "[fib_algo] {}.{} candidate {} ({}) beats {} ({})",
                family,
                fibnum,
                best_flm.name(),
                best_pref,
                current.name(),
                cur_pref
            );
            Some(best_flm)
        } else {
            None
        }
    }

    pub(crate) fn record_error(
        &self,
        scope: ScopeId,
        flm: &FlmRef,
        fibnum: u32,
    ) -> bool {
        let mut inner = self.inner.lock();
        let new = inner.errors.record(scope, flm.family(), flm.id(), fibnum);
        if new {
            info!(
                "[fib_algo] {}.{} algo {} quarantined ({} records)",
                flm.family(),
                fibnum,
                flm.name(),
                inner.errors.len()
            );
        }
        new
    }

    pub(crate) fn is_quarantined(
        &self,
        scope: ScopeId,
        flm: &FlmRef,
        fibnum: u32,
    ) -> bool {
        self.inner
            .lock()
            .errors
            .contains(scope, flm.family(), flm.id(), fibnum)
    }

    pub(crate) fn clear_table_errors(
        &self,
        scope: ScopeId,
        family: Family,
        fibnum: u32,
    ) {
        self.inner.lock().errors.clear_for_table(scope, family, fibnum);
    }

    pub(crate) fn clear_scope_errors(&self, scope: ScopeId) {
        self.inner.lock().errors.clear_all(scope);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_types::TestModule;

    const SCOPE: ScopeId = ScopeId(1);

    #[test]
    fn select_highest_preference() {
        let registry = FlmRegistry::new();
        registry.register(TestModule::new("low", Family::Inet, 80));
        registry.register(TestModule::new("high", Family::Inet, 100));
        registry.register(TestModule::new("other", Family::Inet6, 200));

        let best = registry.select_best(
            SCOPE,
            Family::Inet,
            0,
            &RibStats::default(),
            None,
            5,
        );
        assert_eq!(best.map(|f| f.name().to_string()), Some("high".into()));
        assert_eq!(registry.algo_list(Family::Inet), "low, high");
    }

    #[test]
    fn stability_margin() {
        let registry = FlmRegistry::new();
        registry.register(TestModule::new("a", Family::Inet, 100));
        registry.register(TestModule::new("b", Family::Inet, 105));
        registry.register(TestModule::new("c", Family::Inet, 106));

        let stats = RibStats::default();
        let Some(a) = registry.find_by_name("a", Family::Inet) else {
            panic!("a is registered");
        };
        // 106 > 100 * 1.05
        let best = registry.select_best(SCOPE, Family::Inet, 0, &stats, Some(&a), 5);
        assert_eq!(best.map(|f| f.name().to_string()), Some("c".into()));

        let Some(b) = registry.find_by_name("b", Family::Inet) else {
            panic!("b is registered");
        };
        // 106 is within 5% of 105
        assert!(registry
            .select_best(SCOPE, Family::Inet, 0, &stats, Some(&b), 5)
            .is_none());

        let Some(c) = registry.find_by_name("c", Family::Inet) else {
            panic!("c is registered");
        };
        assert!(registry
            .select_best(SCOPE, Family::Inet, 0, &stats, Some(&c), 5)
            .is_none());
    }

    #[test]
    fn huge_margin_never_switches() {
        let registry = FlmRegistry::new();
        registry.register(TestModule::new("a", Family::Inet, 1));
        registry.register(TestModule::new("b", Family::Inet, 255));

        let stats = RibStats::default();
        let Some(a) = registry.find_by_name("a", Family::Inet) else {
            panic!("a is registered");
        };
        for margin in [u32::MAX, u32::MAX - 99, 1 << 31] {
            assert!(registry
                .select_best(SCOPE, Family::Inet, 0, &stats, Some(&a), margin)
                .is_none());
        }
        // without a margin any higher score wins
        let best = registry.select_best(SCOPE, Family::Inet, 0, &stats, Some(&a), 0);
        assert_eq!(best.map(|f| f.name().to_string()), Some("b".into()));
    }

    #[test]
    fn quarantined_module_is_skipped() {
        let registry = FlmRegistry::new();
        registry.register(TestModule::new("best", Family::Inet, 200));
        registry.register(TestModule::new("fallback", Family::Inet, 10));
        let stats = RibStats::default();

        let Some(best) = registry.find_by_name("best", Family::Inet) else {
            panic!("best is registered");
        };
        assert!(registry.record_error(SCOPE, &best, 4));
        assert!(!registry.record_error(SCOPE, &best, 4));

        let sel = registry.select_best(SCOPE, Family::Inet, 4, &stats, None, 5);
        assert_eq!(sel.map(|f| f.name().to_string()), Some("fallback".into()));

        // other tables and other scopes are unaffected
        let sel = registry.select_best(SCOPE, Family::Inet, 5, &stats, None, 5);
        assert_eq!(sel.map(|f| f.name().to_string()), Some("best".into()));
        let sel =
            registry.select_best(ScopeId(2), Family::Inet, 4, &stats, None, 5);
        assert_eq!(sel.map(|f| f.name().to_string()), Some("best".into()));
    }

    #[test]
    fn unregister_busy_module() {
        let registry = FlmRegistry::new();
        let id = registry.register(TestModule::new("m", Family::Inet, 1));

        let flm = registry.find_by_name("m", Family::Inet);
        assert!(flm.is_some());
        assert_eq!(registry.unregister(id), Err(FibAlgoError::ModuleBusy));

        if let Some(flm) = flm {
            registry.record_error(SCOPE, &flm, 0);
        }
        assert_eq!(registry.unregister(id), Ok(()));
        assert!(registry.is_empty());
        assert_eq!(registry.unregister(id), Err(FibAlgoError::ModuleNotFound));
        assert_eq!(registry.inner.lock().errors.len(), 0);
    }
}
