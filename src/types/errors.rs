use std::fmt;

use crate::Family;

//------------ AlgoResult ----------------------------------------------------

/// The outcome of every lookup-module callback.
///
/// The variants are ordered from best to worst, so the combined result of a
/// series of callbacks is simply the maximum of the individual results.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AlgoResult {
    /// The operation was fully applied.
    Success,
    /// The algorithm cannot absorb this input incrementally, but it is not
    /// corrupted. The framework constructs a fresh instance from a full
    /// dump of the routing table; it never retries the same operation.
    NeedsRebuild,
    /// The algorithm cannot continue for this table at all. The
    /// (module, table) pairing gets quarantined and a rebuild with a
    /// different module is scheduled.
    Error,
}

impl AlgoResult {
    pub fn is_success(self) -> bool {
        self == AlgoResult::Success
    }

    /// Combine two results, keeping the worst one.
    pub fn worst(self, other: AlgoResult) -> AlgoResult {
        self.max(other)
    }
}

impl fmt::Display for AlgoResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlgoResult::Success => write!(f, "success"),
            AlgoResult::NeedsRebuild => write!(f, "needs rebuild"),
            AlgoResult::Error => write!(f, "non-recoverable error"),
        }
    }
}

//------------ FibAlgoError --------------------------------------------------

/// Possible errors returned by the administrative surface of a
/// [Scope](crate::fib::Scope) and by the module registry.
#[derive(Debug, PartialEq, Eq)]
pub enum FibAlgoError {
    /// No lookup module with this name is registered for the family.
    ModuleNotFound,
    /// The module is still used by at least one live instance, so it cannot
    /// be unregistered. Retrying after the instances are gone is safe.
    ModuleBusy,
    /// No registered (and not quarantined) module accepts this table. No
    /// forwarding is possible for the table.
    NoAlgorithm,
    /// Building an instance failed, either after exhausting all retries or
    /// because the module reported a non-recoverable error. The previous
    /// instance for the table, if any, is untouched.
    SetupFailed(AlgoResult),
    /// The routing table is not attached to this scope.
    TableNotFound(Family, u32),
    /// A routing table with this family and number is already attached.
    TableExists(Family, u32),
    /// The table number lies beyond the tables the scope has room for.
    /// [Scope::grow_tables](crate::fib::Scope::grow_tables) makes room.
    InvalidTable(Family, u32),
    /// The routing table refused the change-feed subscription.
    SubscriptionFailed,
    /// Memory for a datapath array could not be reserved.
    OutOfMemory,
}

impl std::error::Error for FibAlgoError {}

impl fmt::Display for FibAlgoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            FibAlgoError::ModuleNotFound => {
                write!(f, "Error: Lookup module not found.")
            }
            FibAlgoError::ModuleBusy => {
                write!(
                    f,
                    "Error: Lookup module is in use by one or more \
                    instances."
                )
            }
            FibAlgoError::NoAlgorithm => {
                write!(
                    f,
                    "Error: No usable lookup module for this routing \
                    table."
                )
            }
            FibAlgoError::SetupFailed(res) => {
                write!(f, "Error: Instance setup failed ({}).", res)
            }
            FibAlgoError::TableNotFound(family, fibnum) => {
                write!(f, "Error: Routing table {}.{} not found.", family, fibnum)
            }
            FibAlgoError::TableExists(family, fibnum) => {
                write!(
                    f,
                    "Error: Routing table {}.{} is already attached.",
                    family, fibnum
                )
            }
            FibAlgoError::InvalidTable(family, fibnum) => {
                write!(
                    f,
                    "Error: Routing table {}.{} is out of range.",
                    family, fibnum
                )
            }
            FibAlgoError::SubscriptionFailed => {
                write!(f, "Error: Change feed subscription failed.")
            }
            FibAlgoError::OutOfMemory => {
                write!(f, "Error: Unable to allocate a datapath array.")
            }
        }
    }
}
