pub(crate) mod af;
pub(crate) mod nexthop;

pub mod errors;
pub mod stats;
pub mod test_types;

pub use af::Family;
pub use nexthop::{Nexthop, NhopHandle};
