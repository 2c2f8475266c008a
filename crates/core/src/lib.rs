//! Keel core types: versions, component keys, product specs, the object graph and errors.

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod graph;
pub mod outcome;
pub mod spec;
pub mod version;

pub use config::{ComponentConfig, ConfigField, EnvVar, PartialComponentConfig, Port, Probe, Protocol, ResourcePreset, Resources, VolumeMount};
pub use error::{ApplyError, BuildError, ConfigurationError, ExternalToolError, KeelError};
pub use graph::{
    ContainerBody, EnvFrom, Exposure, NodeId, ObjectBody, ObjectGraph, ObjectKind, ObjectNode, TlsTermination, VolumeBody,
    WorkloadBody,
};
pub use outcome::{NodeOutcome, NodeResult, OutcomeCounts, ProductStatus, ReconciliationResult};
pub use spec::{
    ComponentKey, ComponentKind, Feature, FeatureToggles, Flavor, InstanceId, Platform, ProductKind, ProductSpec,
    SecurityContext,
};
pub use version::Version;

/// Annotation carrying the content signature of an applied object.
pub const SIGNATURE_ANNOTATION: &str = "keel.io/signature";
/// Label carrying the owning product instance name.
pub const INSTANCE_LABEL: &str = "keel.io/instance";
/// Label carrying the product kind.
pub const PRODUCT_LABEL: &str = "keel.io/product";
/// Label carrying the component kind that produced an object.
pub const COMPONENT_LABEL: &str = "keel.io/component";

pub mod prelude {
    pub use super::{
        BuildError, ComponentConfig, ComponentKey, ComponentKind, ConfigurationError, InstanceId, KeelError, NodeId,
        ObjectBody, ObjectGraph, ObjectKind, ObjectNode, PartialComponentConfig, ProductKind, ProductSpec,
        ProductStatus, Version,
    };
}
