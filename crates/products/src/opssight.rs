//! OpsSight: perceptor core, perceivers, scanner with image facade, optional skyfire and metrics.

use std::collections::BTreeMap;

use keel_core::{
    BuildError, ComponentConfig, ConfigurationError, ContainerBody, Exposure, Feature, Flavor, ObjectBody, ObjectNode, Port,
    ProductKind, ResourcePreset, VolumeBody, VolumeMount,
};
use keel_registry::{require_image, BuildContext, Registry, Slot};

use crate::common::{
    config_data, credentials, endpoint, env_from, env_map, main_container, probe, secret, service, workload, Component, Release,
    Service, CONFIG_FIELDS,
};

static R2_2_4: Release = Release {
    version: "2.2.4",
    repository: "docker.io/blackducksoftware",
    tags: &[("skyfire", "2.2.0"), ("prometheus", "v2.1.0")],
};

static R2_2_5: Release = Release {
    version: "2.2.5",
    repository: "docker.io/blackducksoftware",
    tags: &[("skyfire", "2.2.0"), ("prometheus", "v2.1.0")],
};

const PERCEPTOR: Service = Service {
    configs: &["config"],
    secrets: &["blackduck"],
    scratch: &["logs"],
    ..Service::new("perceptor")
};
const POD_PERCEIVER: Service = Service {
    configs: &["config"],
    scratch: &["logs"],
    service_account: Some("pod-processor"),
    ..Service::new("pod-perceiver")
};
const IMAGE_PERCEIVER: Service = Service {
    configs: &["config"],
    scratch: &["logs"],
    service_account: Some("image-processor"),
    ..Service::new("image-perceiver")
};
const SKYFIRE: Service = Service {
    configs: &["config"],
    secrets: &["blackduck"],
    scratch: &["logs"],
    service_account: Some("skyfire"),
    ..Service::new("skyfire")
};

fn config_defaults() -> ComponentConfig {
    ComponentConfig::new("config")
        .env("PERCEPTOR_PORT", "3001")
        .env("PERCEIVER_PORT", "3002")
        .env("SCANNER_PORT", "3003")
        .env("IMAGEFACADE_PORT", "3004")
        .env("SKYFIRE_PORT", "3005")
        .env("LOG_LEVEL", "debug")
        .env("HUB_USER", "sysadmin")
        .env("HUB_PORT", "443")
        .env("CHECK_FOR_STALLED_SCANS_PAUSE_HOURS", "999999")
        .env("MODIFIED_PODS_PAUSE_SECONDS", "20")
        .env("UNKNOWN_IMAGE_PAUSE_MILLISECONDS", "15000")
}

/// Shared configuration, hub credentials and one service account per privileged processor.
fn build_config(cfg: &ComponentConfig, ctx: &BuildContext<'_>) -> Result<Vec<ObjectNode>, BuildError> {
    let mut data = env_map(cfg);
    data.insert("PERCEPTOR_HOST".into(), ctx.resource_name("perceptor"));
    data.insert("SCANNER_HOST".into(), ctx.resource_name("scanner"));
    data.insert("IMAGEFACADE_HOST".into(), ctx.resource_name("image-facade"));
    data.insert("POD_PERCEIVER_ENABLED".into(), "true".into());
    data.insert("IMAGE_PERCEIVER_ENABLED".into(), ctx.features.image_perceiver.to_string());
    data.insert("METRICS_ENABLED".into(), ctx.features.metrics.to_string());
    // The Black Duck password belongs to an existing hub and cannot be generated.
    let creds = credentials(ctx, &["securityToken"], &["HUB_PASSWORD"]);
    let sa = |suffix: &str| ObjectNode::new(ctx.resource_name(suffix), cfg.component.clone(), ObjectBody::ServiceAccount);
    Ok(vec![
        config_data(ctx, cfg, "config", data),
        secret(ctx, cfg, "blackduck", creds),
        sa("pod-processor"),
        sa("image-processor"),
        sa("scanner"),
        sa("skyfire"),
    ])
}

fn perceptor_defaults() -> ComponentConfig {
    ComponentConfig::new("perceptor")
        .resources(Some("300m"), None, Some("1Gi"), Some("1Gi"))
        .port(Port::tcp("perceptor", 3001))
        .mount(VolumeMount::new("logs", "/tmp"))
        .probe(probe(&["wget", "-q", "-O-", "http://localhost:3001/metrics"], 60))
}

fn pod_perceiver_defaults() -> ComponentConfig {
    ComponentConfig::new("pod-perceiver")
        .resources(Some("300m"), None, Some("512Mi"), Some("512Mi"))
        .port(Port::tcp("pod-perceiver", 3002))
        .mount(VolumeMount::new("logs", "/tmp"))
}

fn image_perceiver_defaults() -> ComponentConfig {
    ComponentConfig::new("image-perceiver")
        .resources(Some("300m"), None, Some("512Mi"), Some("512Mi"))
        .port(Port::tcp("image-perceiver", 3002))
        .mount(VolumeMount::new("logs", "/tmp"))
}

fn skyfire_defaults() -> ComponentConfig {
    ComponentConfig::new("skyfire")
        .resources(Some("300m"), None, Some("512Mi"), Some("512Mi"))
        .port(Port::tcp("skyfire", 3005))
        .mount(VolumeMount::new("logs", "/tmp"))
}

fn scanner_defaults() -> ComponentConfig {
    ComponentConfig::new("scanner")
        .resources(Some("300m"), None, Some("2Gi"), Some("2Gi"))
        .port(Port::tcp("scanner", 3003))
        .mount(VolumeMount::new("var-images", "/var/images"))
        .internal_registry("docker-registry.default.svc:5000")
}

/// Scanner and image facade share the image scratch volume; the facade talks to the node's docker socket.
fn build_scanner(cfg: &ComponentConfig, ctx: &BuildContext<'_>) -> Result<Vec<ObjectNode>, BuildError> {
    let mut scanner = main_container(cfg, ctx, "scanner")?;
    scanner.env_from = env_from(ctx, &["config"], &["blackduck"]);
    let facade_port = Port::tcp("image-facade", 3004);
    let registries = cfg.internal_registries.join(",");
    let facade = ContainerBody {
        name: "image-facade".into(),
        image: require_image(cfg, "image-facade")?.to_string(),
        resources: cfg.resources.clone(),
        env: vec![keel_core::EnvVar::new("INTERNAL_DOCKER_REGISTRIES", registries)],
        env_from: env_from(ctx, &["config"], &[]),
        ports: vec![facade_port.clone()],
        volume_mounts: vec![
            VolumeMount::new("var-images", "/var/images"),
            VolumeMount::new("dir-docker-socket", "/var/run/docker.sock"),
        ],
        liveness: None,
    };
    let volumes = vec![
        VolumeBody::EmptyDir { name: "var-images".into() },
        VolumeBody::EmptyDir { name: "dir-docker-socket".into() },
    ];
    Ok(vec![
        workload(ctx, cfg, "scanner", vec![scanner, facade], volumes, Some(ctx.resource_name("scanner"))),
        endpoint(ctx, cfg, "scanner", cfg.ports.clone(), Exposure::ClusterIp),
        endpoint(ctx, cfg, "image-facade", vec![facade_port], Exposure::ClusterIp),
    ])
}

fn prometheus_defaults() -> ComponentConfig {
    ComponentConfig::new("prometheus")
        .resources(None, None, Some("512Mi"), Some("512Mi"))
        .port(Port::tcp("prometheus", 9090))
        .mount(VolumeMount::new("data", "/data"))
        .mount(VolumeMount::new("prometheus", "/etc/prometheus"))
}

/// Scrape configuration over every enabled OpsSight service, plus the server itself.
fn build_prometheus(cfg: &ComponentConfig, ctx: &BuildContext<'_>) -> Result<Vec<ObjectNode>, BuildError> {
    let mut targets = vec![
        format!("{}:3001", ctx.resource_name("perceptor")),
        format!("{}:3003", ctx.resource_name("scanner")),
        format!("{}:3004", ctx.resource_name("image-facade")),
        format!("{}:3002", ctx.resource_name("pod-perceiver")),
    ];
    if ctx.features.image_perceiver {
        targets.push(format!("{}:3002", ctx.resource_name("image-perceiver")));
    }
    if ctx.features.skyfire {
        targets.push(format!("{}:3005", ctx.resource_name("skyfire")));
    }
    let scrape = format!(
        "global:\n  scrape_interval: 5s\nscrape_configs:\n- job_name: perceptor-scrape\n  scrape_interval: 5s\n  static_configs:\n  - targets: [{}]\n",
        targets.join(", ")
    );
    let config_name = ctx.resource_name("prometheus");
    let mut c = main_container(cfg, ctx, "prometheus")?;
    c.env.push(keel_core::EnvVar::new("PROMETHEUS_CONFIG", "/etc/prometheus/prometheus.yml"));
    let volumes = vec![
        VolumeBody::EmptyDir { name: "data".into() },
        VolumeBody::ConfigData { name: "prometheus".into(), config: config_name },
    ];
    Ok(vec![
        config_data(ctx, cfg, "prometheus", BTreeMap::from([("prometheus.yml".to_string(), scrape)])),
        workload(ctx, cfg, "prometheus", vec![c], volumes, None),
        endpoint(ctx, cfg, "prometheus", cfg.ports.clone(), Exposure::NodePort),
    ])
}

fn scanner_preset(f: Flavor) -> Option<ResourcePreset> {
    let replicas = match f {
        Flavor::Small => 1,
        Flavor::Medium => 2,
        Flavor::Large => 3,
        Flavor::XLarge => 5,
    };
    Some(ResourcePreset::default().with_replicas(replicas))
}

fn components(r: &'static Release) -> Vec<(&'static str, Component)> {
    vec![
        ("config", Component::new(r, &[], config_defaults, build_config).supported(CONFIG_FIELDS)),
        ("perceptor", Component::new(r, &[("perceptor", "perceptor")], perceptor_defaults, |c, x| service(c, x, &PERCEPTOR))),
        (
            "pod-perceiver",
            Component::new(r, &[("pod-perceiver", "pod-perceiver")], pod_perceiver_defaults, |c, x| {
                service(c, x, &POD_PERCEIVER)
            }),
        ),
        (
            "image-perceiver",
            Component::new(r, &[("image-perceiver", "image-perceiver")], image_perceiver_defaults, |c, x| {
                service(c, x, &IMAGE_PERCEIVER)
            }),
        ),
        (
            "scanner",
            Component::new(r, &[("scanner", "perceptor-scanner"), ("image-facade", "perceptor-imagefacade")], scanner_defaults, build_scanner)
                .preset(scanner_preset),
        ),
        ("skyfire", Component::new(r, &[("skyfire", "skyfire")], skyfire_defaults, |c, x| service(c, x, &SKYFIRE))),
        ("prometheus", Component::new(r, &[("prometheus", "prometheus")], prometheus_defaults, build_prometheus)),
    ]
}

fn manifest() -> Vec<Slot> {
    vec![
        Slot::always("config"),
        Slot::always("perceptor"),
        Slot::always("pod-perceiver"),
        Slot::with("image-perceiver", Feature::ImagePerceiver),
        Slot::always("scanner"),
        Slot::with("skyfire", Feature::Skyfire),
        Slot::with("prometheus", Feature::Metrics),
    ]
}

pub fn register(registry: &mut Registry) -> Result<(), ConfigurationError> {
    for release in [&R2_2_4, &R2_2_5] {
        for (name, c) in components(release) {
            registry.register(ProductKind::OpsSight, name, release.version, c)?;
        }
        registry.register_manifest(ProductKind::OpsSight, release.version, manifest())?;
    }
    Ok(())
}
