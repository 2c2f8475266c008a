//! Error taxonomy. Every variant names what failed and where.

use thiserror::Error;

use crate::spec::InstanceId;

/// Problems with what was requested: unknown versions, unsupported overrides, bad documents.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("no registry entry for {key}")]
    NotFound { key: String },
    #[error("field `{field}` is not supported by {component}")]
    UnsupportedField { component: String, field: String },
    #[error("component {key} is already registered")]
    DuplicateComponent { key: String },
    #[error("manifest for {product}@{version} is already registered")]
    DuplicateManifest { product: String, version: String },
    #[error("version `{raw}` is a wildcard; registry versions must be explicit")]
    WildcardVersion { raw: String },
    #[error("invalid version `{raw}`: {reason}")]
    InvalidVersion { raw: String, reason: String },
    #[error("{product} does not support schema version `{schema_version}`")]
    UnknownSchemaVersion { product: String, schema_version: String },
    #[error("invalid spec: {reason}")]
    InvalidSpec { reason: String },
}

/// Problems while turning resolved configurations into an object graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("builder for {component} failed: {reason}")]
    Builder { component: String, reason: String },
    #[error("builder for {component} requires image `{image}` which is not configured")]
    MissingImage { component: String, image: String },
    #[error("{from} references {to} which is neither in the graph nor declared external")]
    DanglingReference { from: String, to: String },
    #[error("node {node} is produced more than once")]
    DuplicateNode { node: String },
    #[error("reference cycle among {}", .nodes.join(", "))]
    GraphCycle { nodes: Vec<String> },
}

/// Cluster rejected a node after retries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplyError {
    #[error("{node}: cluster rejected {action}: {reason}")]
    Cluster { node: String, action: &'static str, reason: String },
    #[error("{node}: gave up after {attempts} attempts: {last}")]
    Exhausted { node: String, attempts: u32, last: String },
}

/// External package-deployment tool missing or unusable. Never falls back.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExternalToolError {
    #[error("{tool} was not found in PATH")]
    NotInstalled { tool: String },
    #[error("{tool} major version {found} found, {required} required")]
    WrongMajorVersion { tool: String, required: u32, found: u32 },
    #[error("could not parse {tool} version from output: {output}")]
    UnparsableVersion { tool: String, output: String },
    #[error("{tool} {args} failed: {output}")]
    Failed { tool: String, args: String, output: String },
}

/// Instance-scoped error surfaced to operators.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeelError {
    #[error("{instance}: configuration error: {source}")]
    Configuration { instance: InstanceId, #[source] source: ConfigurationError },
    #[error("{instance}: build error: {source}")]
    Build { instance: InstanceId, #[source] source: BuildError },
    #[error("{instance}: {source}")]
    Apply { instance: InstanceId, #[source] source: ApplyError },
    #[error("{instance}: {source}")]
    ExternalTool { instance: InstanceId, #[source] source: ExternalToolError },
}

impl KeelError {
    pub fn instance(&self) -> &InstanceId {
        match self {
            KeelError::Configuration { instance, .. }
            | KeelError::Build { instance, .. }
            | KeelError::Apply { instance, .. }
            | KeelError::ExternalTool { instance, .. } => instance,
        }
    }
}

impl ConfigurationError {
    pub fn for_instance(self, instance: &InstanceId) -> KeelError {
        KeelError::Configuration { instance: instance.clone(), source: self }
    }
}

impl BuildError {
    pub fn for_instance(self, instance: &InstanceId) -> KeelError {
        KeelError::Build { instance: instance.clone(), source: self }
    }
}

impl ExternalToolError {
    pub fn for_instance(self, instance: &InstanceId) -> KeelError {
        KeelError::ExternalTool { instance: instance.clone(), source: self }
    }
}
