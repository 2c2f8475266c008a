//! Keel products: concrete component builders and compiled-in per-version defaults.
//!
//! Each product module exposes `register(&mut Registry)`. [`registry`] calls them
//! in turn and checks that every manifest slot has a builder.

#![forbid(unsafe_code)]

use keel_core::ConfigurationError;
use keel_registry::Registry;
use tracing::info;

pub mod alert;
pub mod blackduck;
mod common;
pub mod opssight;

/// Build the registry with every supported product version.
pub fn registry() -> Result<Registry, ConfigurationError> {
    let mut r = Registry::new();
    blackduck::register(&mut r)?;
    opssight::register(&mut r)?;
    alert::register(&mut r)?;
    r.check()?;
    info!(builders = r.len(), "component registry ready");
    Ok(r)
}
