use std::sync::Arc;

//------------ Nexthop -------------------------------------------------------

/// The contract a nexthop object owned by the routing-table collaborator has
/// to fulfil.
///
/// Nexthops are shared as [`NhopHandle`]s. Holding a clone of the handle is
/// holding an external reference: the object stays alive for as long as
/// any clone exists. Releasing a reference is dropping the clone.
pub trait Nexthop: Send + Sync + std::fmt::Debug {
    /// The small, dense index the collaborator assigned to this nexthop.
    /// Indexes are unique per routing table for the lifetime of the object.
    fn index(&self) -> u32;

    /// Whether this is a multipath nexthop group rather than a single path.
    fn is_group(&self) -> bool {
        false
    }
}

/// A shared, reference-counted nexthop.
pub type NhopHandle = Arc<dyn Nexthop>;
