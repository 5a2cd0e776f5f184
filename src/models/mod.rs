//! Domain models for feature-graph.
//!
//! # Core Concepts
//!
//! - [`Feature`]: a trackable unit of work. Its record lives in the metadata
//!   directory of the branch that owns it; the same id found on several refs
//!   is the same logical feature.
//! - [`Version`]: one lifecycle of a feature (open, in progress, closed),
//!   usually tied to its own branch.
//! - [`Relationship`]: a typed edge from the feature holding the record to a
//!   target feature. Inverse edges are separate records on the target.
//! - [`RelationshipType`] and [`Category`]: the configured vocabulary of
//!   edges and the cycle policy of each group of types.

mod feature;
mod relationship;
mod version;

pub use feature::*;
pub use relationship::*;
pub use version::*;
