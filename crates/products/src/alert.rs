//! Alert: the alert web application and its cfssl certificate service.

use keel_core::{
    BuildError, ComponentConfig, ConfigurationError, Exposure, ObjectBody, ObjectNode, Platform, Port, ProductKind,
    TlsTermination, VolumeMount,
};
use keel_registry::{BuildContext, Registry, Slot};

use crate::common::{config_data, credentials, env_map, probe, secret, service, Component, Release, Service, CONFIG_FIELDS, NO_FIELDS};

static R5_3: Release = Release {
    version: "5.3.0",
    repository: "docker.io/blackducksoftware",
    tags: &[("blackduck-alert", "5.3.0"), ("blackduck-cfssl", "1.0.0")],
};

static R6_0: Release = Release {
    version: "6.0.0",
    repository: "docker.io/blackducksoftware",
    tags: &[("blackduck-alert", "6.0.0"), ("blackduck-cfssl", "1.0.1")],
};

const ALERT: Service = Service {
    configs: &["config"],
    secrets: &["secret"],
    data: Some(("dir-alert", "pvc")),
    exposure: Exposure::NodePort,
    ..Service::new("alert")
};
const CFSSL: Service = Service { configs: &["config"], ..Service::new("cfssl") };

fn config_defaults() -> ComponentConfig {
    ComponentConfig::new("config")
        .env("ALERT_SERVER_PORT", "8443")
        .env("PUBLIC_HUB_WEBSERVER_PORT", "443")
        .env("ALERT_IMPORT_CERT", "false")
}

fn build_config(cfg: &ComponentConfig, ctx: &BuildContext<'_>) -> Result<Vec<ObjectNode>, BuildError> {
    let mut data = env_map(cfg);
    data.insert("HUB_CFSSL_HOST".into(), ctx.resource_name("cfssl"));
    data.insert("ALERT_HOSTNAME".into(), ctx.resource_name("alert"));
    data.extend(ctx.environs.iter().map(|(k, v)| (k.clone(), v.clone())));
    let creds = credentials(ctx, &["ALERT_ENCRYPTION_PASSWORD", "ALERT_ENCRYPTION_GLOBAL_SALT"], &[]);
    Ok(vec![config_data(ctx, cfg, "config", data), secret(ctx, cfg, "secret", creds)])
}

fn alert_defaults() -> ComponentConfig {
    ComponentConfig::new("alert")
        .resources(None, None, Some("2560Mi"), Some("2560Mi"))
        .env("ALERT_MAX_HEAP_SIZE", "2048m")
        .port(Port::tcp("port-8443", 8443))
        .mount(VolumeMount::new("dir-alert", "/opt/blackduck/alert/alert-config"))
        .storage("5Gi")
        .probe(probe(&["/usr/local/bin/docker-healthcheck.sh", "https://localhost:8443/alert/api/about"], 240))
}

fn cfssl_defaults() -> ComponentConfig {
    ComponentConfig::new("cfssl")
        .resources(None, None, Some("640Mi"), Some("640Mi"))
        .port(Port::tcp("port-8888", 8888))
        .probe(probe(&["/usr/local/bin/docker-healthcheck.sh", "http://localhost:8888/api/v1/cfssl/scaninfo"], 240))
}

fn route_defaults() -> ComponentConfig { ComponentConfig::new("route") }

fn build_route(cfg: &ComponentConfig, ctx: &BuildContext<'_>) -> Result<Vec<ObjectNode>, BuildError> {
    let body = ObjectBody::Route { endpoint: ctx.resource_name("alert"), port: "port-8443".into(), tls: TlsTermination::Passthrough };
    Ok(vec![ObjectNode::new(ctx.resource_name("route"), cfg.component.clone(), body)])
}

fn components(r: &'static Release) -> Vec<(&'static str, Component)> {
    vec![
        ("config", Component::new(r, &[], config_defaults, build_config).supported(CONFIG_FIELDS)),
        ("alert", Component::new(r, &[("alert", "blackduck-alert")], alert_defaults, |c, x| service(c, x, &ALERT))),
        ("cfssl", Component::new(r, &[("cfssl", "blackduck-cfssl")], cfssl_defaults, |c, x| service(c, x, &CFSSL))),
        ("route", Component::new(r, &[], route_defaults, build_route).supported(NO_FIELDS)),
    ]
}

fn manifest() -> Vec<Slot> {
    vec![Slot::always("config"), Slot::always("cfssl"), Slot::always("alert"), Slot::on("route", Platform::OpenShift)]
}

pub fn register(registry: &mut Registry) -> Result<(), ConfigurationError> {
    for release in [&R5_3, &R6_0] {
        for (name, c) in components(release) {
            registry.register(ProductKind::Alert, name, release.version, c)?;
        }
        registry.register_manifest(ProductKind::Alert, release.version, manifest())?;
    }
    Ok(())
}
