#![deny(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]

//! A framework for pluggable longest-prefix-match lookup algorithms in a
//! forwarding information base (FIB).
//!
//! Lookup modules register with a [FlmRegistry]. For every routing table
//! attached to a [Scope], the framework picks the module with the highest
//! preference for the shape of the table, builds an instance of it from a
//! full dump of the table and keeps the instance in sync through the
//! table's change feed. Instances that can't absorb a change are rebuilt
//! in the background, with exponential backoff; modules that fail for good
//! are quarantined for the table, and the next best module takes over.
//!
//! The forwarding path reads a per-family array of [DispatchEntry]s, one
//! per table, without ever taking a lock. The array is replaced
//! copy-on-write, and everything a lookup might still be looking at is
//! reclaimed with epoch-based deferral (provided by `crossbeam-epoch`), so
//! a lookup never sees freed memory.
//!
//! ```
//! use std::str::FromStr;
//! use std::net::IpAddr;
//! use std::sync::Arc;
//!
//! use fib_algo::addr::Prefix;
//! use fib_algo::test_types::{TestModule, TestNexthop, TestRib};
//! use fib_algo::{CalloutService, FibAlgoConfig, FlmRegistry, Family};
//! use fib_algo::{LookupKey, Scope};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Arc::new(FlmRegistry::new());
//! registry.register(TestModule::new("linear", Family::Inet, 100));
//!
//! let rib = TestRib::new(Family::Inet, 0);
//! rib.add_route(Prefix::from_str("10.0.0.0/8")?, TestNexthop::handle(1));
//!
//! let scope = Scope::new(
//!     registry,
//!     FibAlgoConfig::default(),
//!     CalloutService::manual(),
//! );
//! scope.attach_table(rib)?;
//!
//! let key = LookupKey::new(IpAddr::from_str("10.1.2.3")?);
//! assert_eq!(scope.lookup(0, &key).map(|nh| nh.index()), Some(1));
//! # Ok(())
//! # }
//! ```
mod reclaim;
mod types;

// re-exports
pub use crossbeam_epoch::{self as epoch, Guard};
pub use inetnum::addr;

// Public Interfaces on the root of the crate

/// Lookup module traits and the module registry
pub mod algo;

/// The shared timer service driving rebuilds and re-evaluations
pub mod callout;

/// Instances, scopes and the datapath
pub mod fib;

/// The routing table interface instances are synchronized against
pub mod rib;

/// Error types returned by the framework
pub use types::errors;

/// Statistics and instance descriptions
pub use types::stats;

pub use algo::{FlmRegistry, LookupModule};
pub use callout::CalloutService;
pub use fib::{DispatchEntry, FibAlgoConfig, LookupKey, Scope};
pub use types::{Family, Nexthop, NhopHandle};

// Used in tests
#[doc(hidden)]
pub use types::test_types;
