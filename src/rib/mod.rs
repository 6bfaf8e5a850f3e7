//! The routing-table (RIB) side of the framework: the entries a table walk
//! yields, the change records of its change feed, and the trait a routing
//! table implements to have FIB instances synchronized against it.
pub mod route;
pub mod table;

pub use route::{RibCmd, RibCmdInfo, RouteEntry};
pub use table::{RibSubscriber, RoutingTable, SubscriptionId, WalkHook};
