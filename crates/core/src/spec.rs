//! Product identity, feature toggles and the normalized product specification.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::PartialComponentConfig;
use crate::error::ConfigurationError;
use crate::version::Version;

/// Closed set of deployable products.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ProductKind {
    BlackDuck,
    OpsSight,
    Alert,
}

impl ProductKind {
    pub const ALL: [ProductKind; 3] = [ProductKind::BlackDuck, ProductKind::OpsSight, ProductKind::Alert];

    /// Short lowercase name used in resource names and labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductKind::BlackDuck => "blackduck",
            ProductKind::OpsSight => "opssight",
            ProductKind::Alert => "alert",
        }
    }

    /// Custom resource kind as served by the cluster.
    pub fn resource_kind(&self) -> &'static str {
        match self {
            ProductKind::BlackDuck => "BlackDuck",
            ProductKind::OpsSight => "OpsSight",
            ProductKind::Alert => "Alert",
        }
    }
}

impl fmt::Display for ProductKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for ProductKind {
    type Err = ConfigurationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProductKind::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s) || k.resource_kind() == s)
            .ok_or_else(|| ConfigurationError::InvalidSpec { reason: format!("unknown product kind `{}`", s) })
    }
}

/// Name of one component within a product (e.g. `postgres`, `webserver`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComponentKind(String);

impl ComponentKind {
    pub fn new(name: impl Into<String>) -> Self { Self(name.into()) }
    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for ComponentKind {
    fn from(s: &str) -> Self { Self(s.to_string()) }
}

/// Registry key: one builder per (product, component, version).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ComponentKey {
    pub product: ProductKind,
    pub component: ComponentKind,
    pub version: Version,
}

impl ComponentKey {
    pub fn new(product: ProductKind, component: impl Into<ComponentKind>, version: Version) -> Self {
        Self { product, component: component.into(), version }
    }
}

impl fmt::Display for ComponentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.product, self.component, self.version)
    }
}

/// Size preset selecting default CPU/memory bundles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flavor {
    #[default]
    Small,
    Medium,
    Large,
    #[serde(rename = "xlarge")]
    XLarge,
}

impl FromStr for Flavor {
    type Err = ConfigurationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "small" => Ok(Flavor::Small),
            "medium" => Ok(Flavor::Medium),
            "large" => Ok(Flavor::Large),
            "xlarge" | "x-large" => Ok(Flavor::XLarge),
            other => Err(ConfigurationError::InvalidSpec { reason: format!("unknown flavor `{}`", other) }),
        }
    }
}

/// Target orchestration distribution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    #[default]
    Kubernetes,
    OpenShift,
}

/// Optional capabilities that add or remove components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Feature {
    Metrics,
    PersistentStorage,
    LivenessProbes,
    ImagePerceiver,
    Skyfire,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureToggles {
    pub metrics: bool,
    pub persistent_storage: bool,
    pub liveness_probes: bool,
    pub image_perceiver: bool,
    pub skyfire: bool,
}

impl FeatureToggles {
    pub fn enabled(&self, f: Feature) -> bool {
        match f {
            Feature::Metrics => self.metrics,
            Feature::PersistentStorage => self.persistent_storage,
            Feature::LivenessProbes => self.liveness_probes,
            Feature::ImagePerceiver => self.image_perceiver,
            Feature::Skyfire => self.skyfire,
        }
    }
}

/// Pod-level security settings for one component.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SecurityContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as_user: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as_group: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs_group: Option<i64>,
}

/// Namespaced identity of one product instance.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceId {
    pub namespace: String,
    pub name: String,
}

impl InstanceId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}/{}", self.namespace, self.name) }
}

/// Normalized desired state for one product instance; input to one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductSpec {
    pub id: InstanceId,
    pub product: ProductKind,
    pub version: Version,
    pub flavor: Flavor,
    pub features: FeatureToggles,
    pub platform: Platform,
    /// Registry host (and optional path) replacing the one in default images.
    pub image_registry: Option<String>,
    pub pull_secrets: Vec<String>,
    pub storage_class: Option<String>,
    pub security: BTreeMap<ComponentKind, SecurityContext>,
    /// Product-wide environment written into the shared configuration.
    pub environs: BTreeMap<String, String>,
    pub overrides: BTreeMap<ComponentKind, PartialComponentConfig>,
    /// `metadata.generation` of the source document, when known.
    pub generation: Option<i64>,
    /// Secret values supplied by the document, by secret key.
    pub credentials: BTreeMap<String, String>,
    /// Operator-held seed for generated secret values; never read from documents.
    #[serde(skip)]
    pub credential_seed: Option<String>,
}

impl ProductSpec {
    /// Minimal spec with every optional feature off.
    pub fn new(id: InstanceId, product: ProductKind, version: Version) -> Self {
        Self {
            id,
            product,
            version,
            flavor: Flavor::default(),
            features: FeatureToggles::default(),
            platform: Platform::default(),
            image_registry: None,
            pull_secrets: Vec::new(),
            storage_class: None,
            security: BTreeMap::new(),
            environs: BTreeMap::new(),
            overrides: BTreeMap::new(),
            generation: None,
            credentials: BTreeMap::new(),
            credential_seed: None,
        }
    }

    /// Value for secret `key`: the supplied one, else 32 hex digits derived
    /// from the seed, product, instance and key. Stable across composes.
    pub fn credential(&self, key: &str) -> String {
        if let Some(v) = self.credentials.get(key) {
            return v.clone();
        }
        let mut h = Sha256::new();
        for part in [self.credential_seed.as_deref().unwrap_or_default(), self.product.as_str(), self.id.namespace.as_str(), self.id.name.as_str(), key] {
            h.update(part.as_bytes());
            h.update([0u8]);
        }
        let mut out = hex::encode(h.finalize());
        out.truncate(32);
        out
    }
}
