//! The framework proper: instances binding a lookup module to a routing
//! table, their synchronization with the table, the timers that rebuild or
//! replace them, and the per-family arrays the forwarding path reads.
mod fib_data;
mod scheduler;
mod sync;

pub mod config;
pub mod datapath;
pub mod nhop_table;
pub mod scope;

pub use config::FibAlgoConfig;
pub use datapath::{DispatchEntry, LookupArg, LookupFn, LookupKey};
pub use nhop_table::NhopIndexTable;
pub use scope::{Scope, ScopeId};
