//! The plug-in side of the framework: the traits an algorithm implements,
//! the registry that catalogues the implementations, and the quarantine of
//! (module, table) pairs that failed for good.
mod quarantine;

pub mod module;
pub mod registry;

pub use module::{AlgoContext, AlgoInstance, LookupModule};
pub use registry::{FlmId, FlmRef, FlmRegistry};
