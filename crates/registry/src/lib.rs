//! Keel registry: builders keyed by (product, component, version), product manifests,
//! the feature resolver and the object-graph builder.
//!
//! Lookups are exact. A version that was never registered is `NotFound`; there
//! is no nearest-version fallback.

#![forbid(unsafe_code)]

pub mod builder;
pub mod compose;
pub mod registry;
pub mod resolve;

pub use builder::{require_image, BuildContext, ComponentBuilder};
pub use compose::{compose, GraphBuilder, ResolvedConfigs};
pub use registry::Registry;
pub use resolve::{resolve_components, Gate, Slot};
