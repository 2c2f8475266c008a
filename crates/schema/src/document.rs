//! Product documents as they appear on the cluster or on disk.
//!
//! A document is a custom-resource shaped object (`kind`, `metadata`, `spec`).
//! The `spec.schemaVersion` field selects the typed layout; each layout
//! rejects unknown fields.

use std::collections::BTreeMap;

use keel_core::{
    ComponentKind, ConfigurationError, FeatureToggles, Flavor, InstanceId, PartialComponentConfig, Platform, ProductKind,
    ProductSpec, SecurityContext, Version,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

const DEFAULT_SCHEMA_VERSION: &str = "v1";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BlackDuckSpecV1 {
    pub version: String,
    #[serde(default)]
    pub flavor: Flavor,
    #[serde(default)]
    pub platform: Platform,
    #[serde(default)]
    pub persistent_storage: bool,
    #[serde(default)]
    pub liveness_probes: bool,
    #[serde(default)]
    pub storage_class: Option<String>,
    #[serde(default)]
    pub image_registry: Option<String>,
    #[serde(default)]
    pub pull_secrets: Vec<String>,
    /// `KEY:VALUE` pairs written into the shared configuration.
    #[serde(default)]
    pub environs: Vec<String>,
    #[serde(default)]
    pub security: BTreeMap<ComponentKind, SecurityContext>,
    #[serde(default)]
    pub overrides: BTreeMap<ComponentKind, PartialComponentConfig>,
    /// Secret values by key; missing ones are generated.
    #[serde(default)]
    pub credentials: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OpsSightSpecV1 {
    pub version: String,
    #[serde(default)]
    pub flavor: Flavor,
    #[serde(default)]
    pub platform: Platform,
    #[serde(default)]
    pub metrics: bool,
    #[serde(default)]
    pub image_perceiver: bool,
    #[serde(default)]
    pub skyfire: bool,
    #[serde(default)]
    pub liveness_probes: bool,
    #[serde(default)]
    pub image_registry: Option<String>,
    #[serde(default)]
    pub pull_secrets: Vec<String>,
    #[serde(default)]
    pub security: BTreeMap<ComponentKind, SecurityContext>,
    #[serde(default)]
    pub overrides: BTreeMap<ComponentKind, PartialComponentConfig>,
    /// Secret values by key; missing ones are generated.
    #[serde(default)]
    pub credentials: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AlertSpecV1 {
    pub version: String,
    #[serde(default)]
    pub platform: Platform,
    #[serde(default)]
    pub persistent_storage: bool,
    #[serde(default)]
    pub storage_class: Option<String>,
    #[serde(default)]
    pub image_registry: Option<String>,
    #[serde(default)]
    pub pull_secrets: Vec<String>,
    #[serde(default)]
    pub environs: Vec<String>,
    #[serde(default)]
    pub security: BTreeMap<ComponentKind, SecurityContext>,
    #[serde(default)]
    pub overrides: BTreeMap<ComponentKind, PartialComponentConfig>,
    /// Secret values by key; missing ones are generated.
    #[serde(default)]
    pub credentials: BTreeMap<String, String>,
}

/// Closed union over product kinds, each at a concrete schema version.
#[derive(Debug, Clone, PartialEq)]
pub enum ProductDocument {
    BlackDuck(BlackDuckSpecV1),
    OpsSight(OpsSightSpecV1),
    Alert(AlertSpecV1),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    kind: String,
    #[serde(default)]
    metadata: Metadata,
    #[serde(default)]
    spec: Value,
}

#[derive(Debug, Default, Deserialize)]
struct Metadata {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default)]
    generation: Option<i64>,
}

fn invalid(reason: impl Into<String>) -> ConfigurationError { ConfigurationError::InvalidSpec { reason: reason.into() } }

impl ProductDocument {
    /// Parse the `spec` object of a `kind` document, dispatching on `schemaVersion`.
    pub fn parse(kind: ProductKind, spec: &Value) -> Result<Self, ConfigurationError> {
        let mut body = match spec {
            Value::Object(m) => m.clone(),
            Value::Null => return Err(invalid(format!("{} document has no spec", kind.resource_kind()))),
            _ => return Err(invalid("spec must be an object")),
        };
        let schema_version = match body.remove("schemaVersion") {
            None => DEFAULT_SCHEMA_VERSION.to_string(),
            Some(Value::String(s)) => s,
            Some(other) => return Err(invalid(format!("schemaVersion must be a string, got {}", other))),
        };
        if schema_version != DEFAULT_SCHEMA_VERSION {
            return Err(ConfigurationError::UnknownSchemaVersion { product: kind.to_string(), schema_version });
        }
        let body = Value::Object(body);
        let doc = match kind {
            ProductKind::BlackDuck => ProductDocument::BlackDuck(typed(kind, body)?),
            ProductKind::OpsSight => ProductDocument::OpsSight(typed(kind, body)?),
            ProductKind::Alert => ProductDocument::Alert(typed(kind, body)?),
        };
        Ok(doc)
    }

    pub fn kind(&self) -> ProductKind {
        match self {
            ProductDocument::BlackDuck(_) => ProductKind::BlackDuck,
            ProductDocument::OpsSight(_) => ProductKind::OpsSight,
            ProductDocument::Alert(_) => ProductKind::Alert,
        }
    }

    /// Normalize into the product-independent spec consumed by the pipeline.
    pub fn into_product_spec(self, id: InstanceId, generation: Option<i64>) -> Result<ProductSpec, ConfigurationError> {
        let product = self.kind();
        let spec = match self {
            ProductDocument::BlackDuck(d) => ProductSpec {
                flavor: d.flavor,
                platform: d.platform,
                features: FeatureToggles {
                    persistent_storage: d.persistent_storage,
                    liveness_probes: d.liveness_probes,
                    ..Default::default()
                },
                image_registry: d.image_registry,
                pull_secrets: d.pull_secrets,
                storage_class: d.storage_class,
                security: d.security,
                environs: parse_environs(&d.environs)?,
                overrides: d.overrides,
                generation,
                credentials: d.credentials,
                ..ProductSpec::new(id, product, Version::parse(&d.version)?)
            },
            ProductDocument::OpsSight(d) => ProductSpec {
                flavor: d.flavor,
                platform: d.platform,
                features: FeatureToggles {
                    metrics: d.metrics,
                    image_perceiver: d.image_perceiver,
                    skyfire: d.skyfire,
                    liveness_probes: d.liveness_probes,
                    ..Default::default()
                },
                image_registry: d.image_registry,
                pull_secrets: d.pull_secrets,
                security: d.security,
                overrides: d.overrides,
                generation,
                credentials: d.credentials,
                ..ProductSpec::new(id, product, Version::parse(&d.version)?)
            },
            ProductDocument::Alert(d) => ProductSpec {
                platform: d.platform,
                features: FeatureToggles { persistent_storage: d.persistent_storage, ..Default::default() },
                image_registry: d.image_registry,
                pull_secrets: d.pull_secrets,
                storage_class: d.storage_class,
                security: d.security,
                environs: parse_environs(&d.environs)?,
                overrides: d.overrides,
                generation,
                credentials: d.credentials,
                ..ProductSpec::new(id, product, Version::parse(&d.version)?)
            },
        };
        Ok(spec)
    }
}

fn typed<T: serde::de::DeserializeOwned>(kind: ProductKind, body: Value) -> Result<T, ConfigurationError> {
    serde_json::from_value(body).map_err(|e| invalid(format!("{} spec: {}", kind.resource_kind(), e)))
}

/// `KEY:VALUE` entries; the first colon separates key from value.
fn parse_environs(raw: &[String]) -> Result<BTreeMap<String, String>, ConfigurationError> {
    let mut out = BTreeMap::new();
    for entry in raw.iter() {
        let (k, v) = entry.split_once(':').ok_or_else(|| invalid(format!("environ `{}` is not KEY:VALUE", entry)))?;
        let k = k.trim();
        if k.is_empty() {
            return Err(invalid(format!("environ `{}` has an empty key", entry)));
        }
        out.insert(k.to_string(), v.trim().to_string());
    }
    Ok(out)
}

/// Parse a full custom-resource shaped document into a [`ProductSpec`].
///
/// `default_namespace` is used when the document carries none.
pub fn from_manifest(doc: &Value, default_namespace: &str) -> Result<ProductSpec, ConfigurationError> {
    let env: Envelope = serde_json::from_value(doc.clone()).map_err(|e| invalid(e.to_string()))?;
    let kind: ProductKind = env.kind.parse()?;
    let name = env.metadata.name.filter(|n| !n.is_empty()).ok_or_else(|| invalid("metadata.name is required"))?;
    let namespace = env.metadata.namespace.unwrap_or_else(|| default_namespace.to_string());
    let id = InstanceId::new(namespace, name);
    debug!(instance = %id, kind = %kind, "parsing product document");
    ProductDocument::parse(kind, &env.spec)?.into_product_spec(id, env.metadata.generation)
}

/// Parse a YAML document (as written by users or `keelctl render`).
pub fn from_yaml(text: &str, default_namespace: &str) -> Result<ProductSpec, ConfigurationError> {
    let value: Value = serde_yaml::from_str(text).map_err(|e| invalid(format!("yaml: {}", e)))?;
    from_manifest(&value, default_namespace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::Feature;
    use serde_json::json;

    #[test]
    fn black_duck_document_normalizes() {
        let doc = json!({
            "apiVersion": "synopsys.com/v1",
            "kind": "BlackDuck",
            "metadata": { "name": "hub", "namespace": "bd", "generation": 4 },
            "spec": {
                "version": "2020.6.0",
                "flavor": "medium",
                "persistentStorage": true,
                "environs": ["HUB_WEBSERVER_HOST:hub.example.com", "BLACKDUCK_REPORT_IGNORED_COMPONENTS:false"],
                "overrides": { "webapp": { "maxMemory": "4Gi" } }
            }
        });
        let spec = from_manifest(&doc, "default").unwrap();
        assert_eq!(spec.id, InstanceId::new("bd", "hub"));
        assert_eq!(spec.product, ProductKind::BlackDuck);
        assert_eq!(spec.version.to_string(), "2020.6.0");
        assert_eq!(spec.flavor, Flavor::Medium);
        assert!(spec.features.enabled(Feature::PersistentStorage));
        assert!(!spec.features.enabled(Feature::Metrics));
        assert_eq!(spec.environs["HUB_WEBSERVER_HOST"], "hub.example.com");
        assert_eq!(spec.generation, Some(4));
        assert_eq!(spec.overrides[&ComponentKind::from("webapp")].max_memory.as_deref(), Some("4Gi"));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let doc = json!({
            "kind": "OpsSight",
            "metadata": { "name": "ops" },
            "spec": { "version": "2.2.5", "enableFancyMode": true }
        });
        let err = from_manifest(&doc, "default").unwrap_err();
        assert!(err.to_string().contains("enableFancyMode"), "{}", err);
    }

    #[test]
    fn unknown_override_fields_are_rejected() {
        let doc = json!({
            "kind": "Alert",
            "metadata": { "name": "alert" },
            "spec": { "version": "6.0.0", "overrides": { "alert": { "sidecars": [] } } }
        });
        assert!(matches!(from_manifest(&doc, "default"), Err(ConfigurationError::InvalidSpec { .. })));
    }

    #[test]
    fn unknown_schema_version_is_rejected() {
        let doc = json!({
            "kind": "Alert",
            "metadata": { "name": "alert" },
            "spec": { "schemaVersion": "v9", "version": "6.0.0" }
        });
        match from_manifest(&doc, "default") {
            Err(ConfigurationError::UnknownSchemaVersion { product, schema_version }) => {
                assert_eq!(product, "alert");
                assert_eq!(schema_version, "v9");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn documents_may_supply_credentials() {
        let doc = json!({
            "kind": "Alert",
            "metadata": { "name": "alert", "namespace": "ns" },
            "spec": { "version": "6.0.0", "credentials": { "ALERT_ENCRYPTION_PASSWORD": "s3cret" } }
        });
        let spec = from_manifest(&doc, "default").unwrap();
        assert_eq!(spec.credential("ALERT_ENCRYPTION_PASSWORD"), "s3cret");
        assert_eq!(spec.credential("ALERT_ENCRYPTION_GLOBAL_SALT").len(), 32);
        assert!(spec.credential_seed.is_none());
    }

    #[test]
    fn wildcard_version_in_document_is_rejected() {
        let doc = json!({ "kind": "Alert", "metadata": { "name": "a" }, "spec": { "version": "6.*" } });
        assert!(matches!(from_manifest(&doc, "default"), Err(ConfigurationError::WildcardVersion { .. })));
    }

    #[test]
    fn yaml_documents_default_the_namespace() {
        let text = "kind: OpsSight\nmetadata:\n  name: ops\nspec:\n  version: 2.2.5\n  metrics: true\n  skyfire: true\n";
        let spec = from_yaml(text, "opssight").unwrap();
        assert_eq!(spec.id, InstanceId::new("opssight", "ops"));
        assert!(spec.features.metrics && spec.features.skyfire);
    }

    #[test]
    fn malformed_environ_is_rejected() {
        assert!(parse_environs(&["NOCOLON".to_string()]).is_err());
        let ok = parse_environs(&["URL:http://x:8080".to_string()]).unwrap();
        assert_eq!(ok["URL"], "http://x:8080");
    }
}
