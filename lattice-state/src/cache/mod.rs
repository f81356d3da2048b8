//! Caching
//!
//! Two layers sit between a resolution and the network:
//!
//! - the deps cache ([`DepsCache`]) decides whether the relevant inputs of a
//!   derived variable changed since it was last computed;
//! - the result registry ([`ResultRegistry`]) holds the committed value and
//!   status of each (variable, context) node for observers.

mod deps;
mod registry;

pub use deps::{DepsCache, DepsCacheEntry, DerivedResolution, TriggerSnapshot};
pub use registry::{NodeSnapshot, NodeStatus, Observation, ResultNode, ResultRegistry};
