//! Flavor & feature resolver: manifest slots filtered by gates.

use keel_core::{ComponentKey, ComponentKind, ConfigurationError, Feature, Platform, ProductSpec};

use crate::registry::Registry;

/// Condition under which a manifest slot is part of the deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Always,
    Feature(Feature),
    WithoutFeature(Feature),
    Platform(Platform),
}

impl Gate {
    pub fn admits(&self, spec: &ProductSpec) -> bool {
        match self {
            Gate::Always => true,
            Gate::Feature(f) => spec.features.enabled(*f),
            Gate::WithoutFeature(f) => !spec.features.enabled(*f),
            Gate::Platform(p) => spec.platform == *p,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub component: ComponentKind,
    pub gate: Gate,
}

impl Slot {
    pub fn always(component: &str) -> Self { Self { component: component.into(), gate: Gate::Always } }
    pub fn with(component: &str, f: Feature) -> Self { Self { component: component.into(), gate: Gate::Feature(f) } }
    pub fn without(component: &str, f: Feature) -> Self { Self { component: component.into(), gate: Gate::WithoutFeature(f) } }
    pub fn on(component: &str, p: Platform) -> Self { Self { component: component.into(), gate: Gate::Platform(p) } }
}

/// Ordered component keys to build for `spec`. Pure; manifest order is kept.
pub fn resolve_components(registry: &Registry, spec: &ProductSpec) -> Result<Vec<ComponentKey>, ConfigurationError> {
    let slots = registry.manifest(spec.product, &spec.version)?;
    Ok(slots
        .iter()
        .filter(|s| s.gate.admits(spec))
        .map(|s| ComponentKey::new(spec.product, s.component.clone(), spec.version.clone()))
        .collect())
}
