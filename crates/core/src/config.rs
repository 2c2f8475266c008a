//! Resolved component configuration and the partial form used for user overrides.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::spec::ComponentKind;

/// CPU/memory requests (min) and limits (max) as Kubernetes quantities.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_min: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_max: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_min: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_max: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EnvVar {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

impl EnvVar {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self { name: name.into(), value: value.into() }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Port {
    pub name: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
}

impl Port {
    pub fn tcp(name: impl Into<String>, port: u16) -> Self {
        Self { name: name.into(), port, protocol: Protocol::Tcp }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct VolumeMount {
    pub name: String,
    pub mount_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_path: Option<String>,
}

impl VolumeMount {
    pub fn new(name: impl Into<String>, mount_path: impl Into<String>) -> Self {
        Self { name: name.into(), mount_path: mount_path.into(), sub_path: None }
    }

    pub fn with_sub_path(mut self, sub: impl Into<String>) -> Self {
        self.sub_path = Some(sub.into());
        self
    }
}

/// Command-style liveness probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Probe {
    pub command: Vec<String>,
    pub initial_delay_secs: u32,
    pub period_secs: u32,
    pub timeout_secs: u32,
    pub failure_threshold: u32,
}

/// Fully-defaulted configuration of one component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentConfig {
    pub component: ComponentKind,
    /// Container name to image reference.
    pub images: BTreeMap<String, String>,
    pub resources: Resources,
    pub replicas: u32,
    pub env: Vec<EnvVar>,
    pub ports: Vec<Port>,
    pub volume_mounts: Vec<VolumeMount>,
    pub probes: Vec<Probe>,
    pub internal_registries: Vec<String>,
    pub storage_size: Option<String>,
}

impl ComponentConfig {
    pub fn new(component: impl Into<ComponentKind>) -> Self {
        Self {
            component: component.into(),
            images: BTreeMap::new(),
            resources: Resources::default(),
            replicas: 1,
            env: Vec::new(),
            ports: Vec::new(),
            volume_mounts: Vec::new(),
            probes: Vec::new(),
            internal_registries: Vec::new(),
            storage_size: None,
        }
    }

    pub fn image(mut self, container: &str, image: &str) -> Self {
        self.images.insert(container.to_string(), image.to_string());
        self
    }

    pub fn port(mut self, p: Port) -> Self {
        self.ports.push(p);
        self
    }

    pub fn mount(mut self, m: VolumeMount) -> Self {
        self.volume_mounts.push(m);
        self
    }

    pub fn env(mut self, name: &str, value: &str) -> Self {
        self.env.push(EnvVar::new(name, value));
        self
    }

    pub fn resources(mut self, cpu_min: Option<&str>, cpu_max: Option<&str>, mem_min: Option<&str>, mem_max: Option<&str>) -> Self {
        self.resources = Resources {
            cpu_min: cpu_min.map(str::to_string),
            cpu_max: cpu_max.map(str::to_string),
            memory_min: mem_min.map(str::to_string),
            memory_max: mem_max.map(str::to_string),
        };
        self
    }

    pub fn storage(mut self, size: &str) -> Self {
        self.storage_size = Some(size.to_string());
        self
    }

    pub fn probe(mut self, p: Probe) -> Self {
        self.probes.push(p);
        self
    }

    pub fn internal_registry(mut self, r: &str) -> Self {
        self.internal_registries.push(r.to_string());
        self
    }
}

/// User-facing overrides for one component. Absent fields keep the default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PartialComponentConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_memory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<EnvVar>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<Port>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_mounts: Option<Vec<VolumeMount>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probes: Option<Vec<Probe>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_registries: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_size: Option<String>,
}

/// Overridable fields, named as they appear in spec documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConfigField {
    Images,
    MinCpu,
    MaxCpu,
    MinMemory,
    MaxMemory,
    Replicas,
    Env,
    Ports,
    VolumeMounts,
    Probes,
    InternalRegistries,
    StorageSize,
}

impl ConfigField {
    pub const ALL: &'static [ConfigField] = &[
        ConfigField::Images,
        ConfigField::MinCpu,
        ConfigField::MaxCpu,
        ConfigField::MinMemory,
        ConfigField::MaxMemory,
        ConfigField::Replicas,
        ConfigField::Env,
        ConfigField::Ports,
        ConfigField::VolumeMounts,
        ConfigField::Probes,
        ConfigField::InternalRegistries,
        ConfigField::StorageSize,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigField::Images => "images",
            ConfigField::MinCpu => "minCpu",
            ConfigField::MaxCpu => "maxCpu",
            ConfigField::MinMemory => "minMemory",
            ConfigField::MaxMemory => "maxMemory",
            ConfigField::Replicas => "replicas",
            ConfigField::Env => "env",
            ConfigField::Ports => "ports",
            ConfigField::VolumeMounts => "volumeMounts",
            ConfigField::Probes => "probes",
            ConfigField::InternalRegistries => "internalRegistries",
            ConfigField::StorageSize => "storageSize",
        }
    }
}

impl PartialComponentConfig {
    /// Fields this override actually sets.
    pub fn set_fields(&self) -> Vec<ConfigField> {
        let mut out = Vec::new();
        if self.images.is_some() { out.push(ConfigField::Images); }
        if self.min_cpu.is_some() { out.push(ConfigField::MinCpu); }
        if self.max_cpu.is_some() { out.push(ConfigField::MaxCpu); }
        if self.min_memory.is_some() { out.push(ConfigField::MinMemory); }
        if self.max_memory.is_some() { out.push(ConfigField::MaxMemory); }
        if self.replicas.is_some() { out.push(ConfigField::Replicas); }
        if self.env.is_some() { out.push(ConfigField::Env); }
        if self.ports.is_some() { out.push(ConfigField::Ports); }
        if self.volume_mounts.is_some() { out.push(ConfigField::VolumeMounts); }
        if self.probes.is_some() { out.push(ConfigField::Probes); }
        if self.internal_registries.is_some() { out.push(ConfigField::InternalRegistries); }
        if self.storage_size.is_some() { out.push(ConfigField::StorageSize); }
        out
    }

    pub fn is_empty(&self) -> bool { self.set_fields().is_empty() }
}

/// Named CPU/memory bundle selected by a flavor; applied before user overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourcePreset {
    pub cpu_min: Option<&'static str>,
    pub cpu_max: Option<&'static str>,
    pub memory_min: Option<&'static str>,
    pub memory_max: Option<&'static str>,
    pub replicas: Option<u32>,
}

impl ResourcePreset {
    /// Memory-only preset with equal request and limit, the common case.
    pub const fn memory(mem: &'static str) -> Self {
        Self { cpu_min: None, cpu_max: None, memory_min: Some(mem), memory_max: Some(mem), replicas: None }
    }

    pub const fn cpu_memory(cpu: &'static str, mem: &'static str) -> Self {
        Self { cpu_min: Some(cpu), cpu_max: None, memory_min: Some(mem), memory_max: Some(mem), replicas: None }
    }

    pub const fn with_replicas(self, n: u32) -> Self {
        Self { replicas: Some(n), ..self }
    }
}
