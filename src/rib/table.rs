use std::sync::Arc;

use crate::rib::{RibCmdInfo, RouteEntry};
use crate::types::errors::FibAlgoError;
use crate::types::stats::RibStats;
use crate::Family;

/// Handle of a change-feed subscription, handed out by
/// [RoutingTable::subscribe].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Stage of a table walk reported to the walk hook.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WalkHook {
    /// About to visit the first entry.
    Pre,
    /// Just visited the last entry. The table lock is still held.
    Post,
}

//------------ RibSubscriber -------------------------------------------------

/// Receiver of a routing table's change feed.
pub trait RibSubscriber: Send + Sync {
    /// Called synchronously, under the table's write lock, once per
    /// mutation. The call happens before the mutation becomes visible to
    /// new walks, and never concurrently with another call for the same
    /// table.
    fn on_change(&self, rc: &RibCmdInfo);
}

//------------ RoutingTable --------------------------------------------------

/// The narrow interface of the routing table (the RIB) a FIB instance is
/// synchronized against. The table's internal storage is not our concern.
pub trait RoutingTable: Send + Sync {
    fn family(&self) -> Family;

    fn fibnum(&self) -> u32;

    fn stats(&self) -> RibStats;

    /// Whether the table has been marked for destruction.
    fn is_dying(&self) -> bool;

    /// Walk all entries in one synchronous pass, holding the table's write
    /// lock for the whole walk. `hook` is called with [WalkHook::Pre]
    /// before the first entry and with [WalkHook::Post] after the last one,
    /// still under the lock.
    fn walk(
        &self,
        item: &mut dyn FnMut(&RouteEntry),
        hook: &mut dyn FnMut(WalkHook),
    );

    /// Subscribe to the change feed in immediate mode.
    fn subscribe(
        &self,
        subscriber: Arc<dyn RibSubscriber>,
    ) -> Result<SubscriptionId, FibAlgoError>;

    fn unsubscribe(&self, id: SubscriptionId);
}
