//! Component registry: exact-version builder lookup plus per-version product manifests.

use std::collections::BTreeMap;
use std::sync::Arc;

use keel_core::{ComponentKey, ComponentKind, ConfigurationError, ProductKind, Version};
use tracing::debug;

use crate::builder::ComponentBuilder;
use crate::resolve::Slot;

/// Built once at startup, then shared read-only behind an `Arc`.
#[derive(Default)]
pub struct Registry {
    builders: BTreeMap<ComponentKey, Arc<dyn ComponentBuilder>>,
    manifests: BTreeMap<(ProductKind, Version), Vec<Slot>>,
}

impl Registry {
    pub fn new() -> Self { Self::default() }

    /// Register `builder` for an explicit `version`. Wildcards and duplicates are refused.
    pub fn register<B: ComponentBuilder + 'static>(
        &mut self,
        product: ProductKind,
        component: &str,
        version: &str,
        builder: B,
    ) -> Result<(), ConfigurationError> {
        let key = ComponentKey::new(product, component, Version::parse(version)?);
        self.register_key(key, Arc::new(builder))
    }

    pub fn register_key(&mut self, key: ComponentKey, builder: Arc<dyn ComponentBuilder>) -> Result<(), ConfigurationError> {
        if self.builders.contains_key(&key) {
            return Err(ConfigurationError::DuplicateComponent { key: key.to_string() });
        }
        debug!(key = %key, "registered component builder");
        self.builders.insert(key, builder);
        Ok(())
    }

    /// Exact lookup. There is no nearest-version fallback.
    pub fn resolve(&self, key: &ComponentKey) -> Result<Arc<dyn ComponentBuilder>, ConfigurationError> {
        self.builders.get(key).cloned().ok_or_else(|| ConfigurationError::NotFound { key: key.to_string() })
    }

    /// Declare the ordered component slots of one product version.
    pub fn register_manifest(&mut self, product: ProductKind, version: &str, slots: Vec<Slot>) -> Result<(), ConfigurationError> {
        let version = Version::parse(version)?;
        let k = (product, version);
        if self.manifests.contains_key(&k) {
            return Err(ConfigurationError::DuplicateManifest { product: product.to_string(), version: k.1.to_string() });
        }
        self.manifests.insert(k, slots);
        Ok(())
    }

    pub fn manifest(&self, product: ProductKind, version: &Version) -> Result<&[Slot], ConfigurationError> {
        self.manifests
            .get(&(product, version.clone()))
            .map(Vec::as_slice)
            .ok_or_else(|| ConfigurationError::NotFound { key: format!("{}@{}", product, version) })
    }

    /// Every manifest slot must have a builder at the manifest's version.
    pub fn check(&self) -> Result<(), ConfigurationError> {
        for ((product, version), slots) in self.manifests.iter() {
            for slot in slots.iter() {
                self.resolve(&ComponentKey::new(*product, slot.component.clone(), version.clone()))?;
            }
        }
        Ok(())
    }

    /// Registered builder keys in key order.
    pub fn catalog(&self) -> Vec<ComponentKey> { self.builders.keys().cloned().collect() }

    /// Versions with a manifest for `product`, ascending.
    pub fn versions(&self, product: ProductKind) -> Vec<Version> {
        self.manifests.keys().filter(|(p, _)| *p == product).map(|(_, v)| v.clone()).collect()
    }

    pub fn components(&self, product: ProductKind, version: &Version) -> Vec<ComponentKind> {
        self.manifest(product, version).map(|s| s.iter().map(|s| s.component.clone()).collect()).unwrap_or_default()
    }

    pub fn len(&self) -> usize { self.builders.len() }
    pub fn is_empty(&self) -> bool { self.builders.is_empty() }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").field("builders", &self.builders.len()).field("manifests", &self.manifests.len()).finish()
    }
}
