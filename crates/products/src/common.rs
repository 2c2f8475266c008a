//! Shared building blocks: release image tables, a table-driven builder and node helpers.

use std::collections::BTreeMap;

use keel_core::{
    BuildError, ComponentConfig, ConfigField, ContainerBody, EnvFrom, Exposure, Flavor, ObjectBody, ObjectNode, Port,
    Probe, ResourcePreset, VolumeBody, WorkloadBody,
};
use keel_registry::{require_image, BuildContext, ComponentBuilder};

/// Images of one product release. Components not listed in `tags` use the release version as tag.
#[derive(Debug)]
pub(crate) struct Release {
    pub version: &'static str,
    pub repository: &'static str,
    pub tags: &'static [(&'static str, &'static str)],
}

impl Release {
    pub fn image(&self, name: &str) -> String {
        let tag = self.tags.iter().find(|(n, _)| *n == name).map(|(_, t)| *t).unwrap_or(self.version);
        format!("{}/{}:{}", self.repository, name, tag)
    }
}

pub(crate) type DefaultsFn = fn() -> ComponentConfig;
pub(crate) type BuildFn = fn(&ComponentConfig, &BuildContext<'_>) -> Result<Vec<ObjectNode>, BuildError>;
pub(crate) type PresetFn = fn(Flavor) -> Option<ResourcePreset>;

fn no_preset(_: Flavor) -> Option<ResourcePreset> { None }

/// Data-driven builder. Versions share `defaults`/`build` and differ in the release image table.
#[derive(Clone, Copy)]
pub(crate) struct Component {
    release: &'static Release,
    /// (container, image name)
    containers: &'static [(&'static str, &'static str)],
    defaults: DefaultsFn,
    build: BuildFn,
    preset: PresetFn,
    supported: &'static [ConfigField],
}

impl Component {
    pub const fn new(
        release: &'static Release,
        containers: &'static [(&'static str, &'static str)],
        defaults: DefaultsFn,
        build: BuildFn,
    ) -> Self {
        Self { release, containers, defaults, build, preset: no_preset, supported: ConfigField::ALL }
    }

    pub const fn preset(self, preset: PresetFn) -> Self { Self { preset, ..self } }
    pub const fn supported(self, supported: &'static [ConfigField]) -> Self { Self { supported, ..self } }
}

impl ComponentBuilder for Component {
    fn defaults(&self) -> ComponentConfig {
        let mut cfg = (self.defaults)();
        for (container, image) in self.containers.iter() {
            cfg.images.insert(container.to_string(), self.release.image(image));
        }
        cfg
    }

    fn supported_overrides(&self) -> &'static [ConfigField] { self.supported }

    fn flavor_preset(&self, flavor: Flavor) -> Option<ResourcePreset> { (self.preset)(flavor) }

    fn build(&self, cfg: &ComponentConfig, ctx: &BuildContext<'_>) -> Result<Vec<ObjectNode>, BuildError> {
        (self.build)(cfg, ctx)
    }
}

/// Configuration-only components accept environment overrides only.
pub(crate) const CONFIG_FIELDS: &[ConfigField] = &[ConfigField::Env];
/// Components with nothing to configure (routes).
pub(crate) const NO_FIELDS: &[ConfigField] = &[];

/// Shape of a single-container service: one workload plus an endpoint over its ports.
pub(crate) struct Service {
    pub suffix: &'static str,
    pub container: &'static str,
    pub configs: &'static [&'static str],
    pub secrets: &'static [&'static str],
    /// Secret suffix mounted as a volume named `<volume>`: (volume, secret suffix).
    pub secret_volume: Option<(&'static str, &'static str)>,
    /// Persistent data: (volume, claim suffix).
    pub data: Option<(&'static str, &'static str)>,
    pub scratch: &'static [&'static str],
    pub service_account: Option<&'static str>,
    pub exposure: Exposure,
}

impl Service {
    pub const fn new(suffix: &'static str) -> Self {
        Self {
            suffix,
            container: suffix,
            configs: &[],
            secrets: &[],
            secret_volume: None,
            data: None,
            scratch: &[],
            service_account: None,
            exposure: Exposure::ClusterIp,
        }
    }
}

/// Build the workload, its optional claim and its endpoint.
pub(crate) fn service(cfg: &ComponentConfig, ctx: &BuildContext<'_>, shape: &Service) -> Result<Vec<ObjectNode>, BuildError> {
    let mut c = main_container(cfg, ctx, shape.container)?;
    c.env_from = env_from(ctx, shape.configs, shape.secrets);
    let mut volumes: Vec<VolumeBody> = shape.scratch.iter().map(|n| VolumeBody::EmptyDir { name: n.to_string() }).collect();
    let mut nodes = Vec::new();
    if let Some((volume, claim)) = shape.data {
        let (v, claim) = data_volume(ctx, cfg, volume, claim);
        volumes.push(v);
        nodes.extend(claim);
    }
    if let Some((volume, secret)) = shape.secret_volume {
        volumes.push(VolumeBody::Secret { name: volume.to_string(), secret: ctx.resource_name(secret) });
    }
    let sa = shape.service_account.map(|s| ctx.resource_name(s));
    nodes.push(workload(ctx, cfg, shape.suffix, vec![c], volumes, sa));
    if !cfg.ports.is_empty() {
        nodes.push(endpoint(ctx, cfg, shape.suffix, cfg.ports.clone(), shape.exposure));
    }
    Ok(nodes)
}

/// Primary container of a component, configured from `cfg`.
pub(crate) fn main_container(cfg: &ComponentConfig, ctx: &BuildContext<'_>, name: &str) -> Result<ContainerBody, BuildError> {
    Ok(ContainerBody {
        name: name.to_string(),
        image: require_image(cfg, name)?.to_string(),
        resources: cfg.resources.clone(),
        env: cfg.env.clone(),
        env_from: Vec::new(),
        ports: cfg.ports.clone(),
        volume_mounts: cfg.volume_mounts.clone(),
        liveness: if ctx.features.liveness_probes { cfg.probes.first().cloned() } else { None },
    })
}

pub(crate) fn probe(command: &[&str], delay: u32) -> Probe {
    Probe {
        command: command.iter().map(|s| s.to_string()).collect(),
        initial_delay_secs: delay,
        period_secs: 30,
        timeout_secs: 10,
        failure_threshold: 10,
    }
}

pub(crate) fn workload(
    ctx: &BuildContext<'_>,
    cfg: &ComponentConfig,
    suffix: &str,
    containers: Vec<ContainerBody>,
    volumes: Vec<VolumeBody>,
    service_account: Option<String>,
) -> ObjectNode {
    let body = WorkloadBody {
        replicas: cfg.replicas,
        selector: ctx.selector(&cfg.component),
        containers,
        volumes,
        service_account,
        pull_secrets: ctx.pull_secrets.to_vec(),
        security: ctx.security_for(&cfg.component),
    };
    ObjectNode::new(ctx.resource_name(suffix), cfg.component.clone(), ObjectBody::Workload(body))
}

pub(crate) fn endpoint(ctx: &BuildContext<'_>, cfg: &ComponentConfig, suffix: &str, ports: Vec<Port>, exposure: Exposure) -> ObjectNode {
    let body = ObjectBody::Endpoint { selector: ctx.selector(&cfg.component), ports, exposure };
    ObjectNode::new(ctx.resource_name(suffix), cfg.component.clone(), body)
}

pub(crate) fn config_data(ctx: &BuildContext<'_>, cfg: &ComponentConfig, suffix: &str, data: BTreeMap<String, String>) -> ObjectNode {
    ObjectNode::new(ctx.resource_name(suffix), cfg.component.clone(), ObjectBody::ConfigData { data })
}

pub(crate) fn secret(ctx: &BuildContext<'_>, cfg: &ComponentConfig, suffix: &str, data: BTreeMap<String, String>) -> ObjectNode {
    ObjectNode::new(ctx.resource_name(suffix), cfg.component.clone(), ObjectBody::Secret { data })
}

/// Generated-or-supplied values for `generated`, plus each of `supplied_only` the document provides.
pub(crate) fn credentials(ctx: &BuildContext<'_>, generated: &[&str], supplied_only: &[&str]) -> BTreeMap<String, String> {
    let mut out: BTreeMap<String, String> = generated.iter().map(|k| (k.to_string(), ctx.credential(k))).collect();
    for k in supplied_only {
        if let Some(v) = ctx.supplied_credential(k) {
            out.insert(k.to_string(), v.to_string());
        }
    }
    out
}

/// `cfg.env` as a key/value map, later entries winning.
pub(crate) fn env_map(cfg: &ComponentConfig) -> BTreeMap<String, String> {
    cfg.env.iter().map(|e| (e.name.clone(), e.value.clone())).collect()
}

/// Data volume: a claim when persistent storage is on, scratch space otherwise.
/// Returns the volume and, when persistent, the claim node to go with it.
pub(crate) fn data_volume(
    ctx: &BuildContext<'_>,
    cfg: &ComponentConfig,
    volume: &str,
    claim_suffix: &str,
) -> (VolumeBody, Option<ObjectNode>) {
    if !ctx.features.persistent_storage {
        return (VolumeBody::EmptyDir { name: volume.to_string() }, None);
    }
    let claim = ctx.resource_name(claim_suffix);
    let body = ObjectBody::VolumeClaim {
        size: cfg.storage_size.clone().unwrap_or_else(|| "2Gi".to_string()),
        storage_class: ctx.storage_class.map(str::to_string),
    };
    let node = ObjectNode::new(claim.clone(), cfg.component.clone(), body);
    (VolumeBody::Claim { name: volume.to_string(), claim }, Some(node))
}

pub(crate) fn env_from(ctx: &BuildContext<'_>, configs: &[&str], secrets: &[&str]) -> Vec<EnvFrom> {
    configs
        .iter()
        .map(|c| EnvFrom::ConfigData(ctx.resource_name(c)))
        .chain(secrets.iter().map(|s| EnvFrom::Secret(ctx.resource_name(s))))
        .collect()
}
