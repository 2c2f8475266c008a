//! Builder seam: one pure routine per (product, component, version).

use std::collections::BTreeMap;

use keel_core::{
    BuildError, ComponentConfig, ComponentKind, ConfigField, FeatureToggles, Flavor, InstanceId, ObjectNode, Platform,
    ProductKind, ProductSpec, ResourcePreset, SecurityContext, Version, COMPONENT_LABEL, INSTANCE_LABEL, PRODUCT_LABEL,
};

/// Everything a builder may read besides its own configuration.
#[derive(Debug, Clone, Copy)]
pub struct BuildContext<'a> {
    pub instance: &'a InstanceId,
    pub product: ProductKind,
    pub version: &'a Version,
    pub platform: Platform,
    pub features: &'a FeatureToggles,
    pub pull_secrets: &'a [String],
    pub storage_class: Option<&'a str>,
    pub environs: &'a BTreeMap<String, String>,
    security: &'a BTreeMap<ComponentKind, SecurityContext>,
    spec: &'a ProductSpec,
}

impl<'a> BuildContext<'a> {
    pub fn from_spec(spec: &'a ProductSpec) -> Self {
        Self {
            instance: &spec.id,
            product: spec.product,
            version: &spec.version,
            platform: spec.platform,
            features: &spec.features,
            pull_secrets: &spec.pull_secrets,
            storage_class: spec.storage_class.as_deref(),
            environs: &spec.environs,
            security: &spec.security,
            spec,
        }
    }

    /// Secret value for `key`, supplied by the document or generated; see [`ProductSpec::credential`].
    pub fn credential(&self, key: &str) -> String { self.spec.credential(key) }

    /// Secret value for `key` only if the document supplied one.
    pub fn supplied_credential(&self, key: &str) -> Option<&'a str> { self.spec.credentials.get(key).map(String::as_str) }

    pub fn namespace(&self) -> &str { &self.instance.namespace }

    /// `<instance>-<product>-<suffix>`, the naming scheme for every generated object.
    pub fn resource_name(&self, suffix: &str) -> String {
        format!("{}-{}-{}", self.instance.name, self.product.as_str(), suffix)
    }

    /// Labels stamped on every node of `component`.
    pub fn labels(&self, component: &ComponentKind) -> BTreeMap<String, String> {
        let mut l = self.selector(component);
        l.insert("keel.io/version".to_string(), self.version.to_string());
        l
    }

    /// Minimal label set selecting the pods of `component`.
    pub fn selector(&self, component: &ComponentKind) -> BTreeMap<String, String> {
        BTreeMap::from([
            (PRODUCT_LABEL.to_string(), self.product.as_str().to_string()),
            (INSTANCE_LABEL.to_string(), self.instance.name.clone()),
            (COMPONENT_LABEL.to_string(), component.to_string()),
        ])
    }

    pub fn security_for(&self, component: &ComponentKind) -> Option<SecurityContext> {
        self.security.get(component).cloned()
    }
}

/// A pure routine that turns one resolved configuration into nodes.
///
/// Implementations must not touch the cluster; they are shared across
/// instances and threads through the registry.
pub trait ComponentBuilder: Send + Sync {
    /// Canonical defaults for the version this builder is registered under.
    fn defaults(&self) -> ComponentConfig;

    /// Override fields this component version accepts.
    fn supported_overrides(&self) -> &'static [ConfigField] { ConfigField::ALL }

    fn flavor_preset(&self, _flavor: Flavor) -> Option<ResourcePreset> { None }

    fn build(&self, cfg: &ComponentConfig, ctx: &BuildContext<'_>) -> Result<Vec<ObjectNode>, BuildError>;
}

/// Image configured for `container`, or `MissingImage`.
pub fn require_image<'c>(cfg: &'c ComponentConfig, container: &str) -> Result<&'c str, BuildError> {
    cfg.images.get(container).map(String::as_str).ok_or_else(|| BuildError::MissingImage {
        component: cfg.component.to_string(),
        image: container.to_string(),
    })
}
