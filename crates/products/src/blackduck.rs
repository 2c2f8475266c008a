//! Black Duck: postgres, shared configuration and the hub services.

use std::collections::BTreeMap;

use keel_core::{
    BuildError, ComponentConfig, ConfigurationError, ContainerBody, Exposure, Flavor, ObjectBody, ObjectNode, Platform,
    Port, ProductKind, ResourcePreset, TlsTermination, VolumeBody, VolumeMount,
};
use keel_registry::{require_image, BuildContext, Registry, Slot};

use crate::common::{
    config_data, credentials, data_volume, endpoint, env_from, env_map, main_container, probe, secret, service, workload, Component,
    Release, Service, CONFIG_FIELDS, NO_FIELDS,
};

static R2020_4: Release = Release {
    version: "2020.4.0",
    repository: "docker.io/blackducksoftware",
    tags: &[
        ("blackduck-postgres", "1.0.13"),
        ("blackduck-cfssl", "1.0.1"),
        ("blackduck-logstash", "1.0.6"),
        ("blackduck-nginx", "1.0.23"),
        ("blackduck-upload-cache", "1.0.13"),
    ],
};

static R2020_6: Release = Release {
    version: "2020.6.0",
    repository: "docker.io/blackducksoftware",
    tags: &[
        ("blackduck-postgres", "1.0.13"),
        ("blackduck-cfssl", "1.0.1"),
        ("blackduck-logstash", "1.0.6"),
        ("blackduck-nginx", "1.0.25"),
        ("blackduck-upload-cache", "1.0.14"),
    ],
};

const HUB: &[&str] = &["config", "db-config"];
const DB_PASSWORDS: Option<(&str, &str)> = Some(("db-passwords", "db-creds"));

const POSTGRES: Service = Service {
    configs: &["db-config"],
    secrets: &["db-creds"],
    data: Some(("postgres-persistent-vol", "postgres")),
    ..Service::new("postgres")
};
const AUTHENTICATION: Service = Service {
    configs: HUB,
    secret_volume: DB_PASSWORDS,
    data: Some(("dir-authentication", "authentication")),
    scratch: &["dir-authentication-security"],
    service_account: Some("service-account"),
    ..Service::new("authentication")
};
const CFSSL: Service = Service { configs: &["config"], data: Some(("dir-cfssl", "cfssl")), ..Service::new("cfssl") };
const DOCUMENTATION: Service = Service { configs: &["config"], ..Service::new("documentation") };
const JOBRUNNER: Service = Service {
    configs: HUB,
    secret_volume: DB_PASSWORDS,
    scratch: &["dir-jobrunner-security"],
    service_account: Some("service-account"),
    ..Service::new("jobrunner")
};
const BOMENGINE: Service = Service {
    configs: HUB,
    secret_volume: DB_PASSWORDS,
    scratch: &["dir-bomengine-security"],
    ..Service::new("bomengine")
};
const REGISTRATION: Service = Service {
    configs: &["config"],
    data: Some(("dir-registration", "registration")),
    scratch: &["dir-registration-security"],
    ..Service::new("registration")
};
const SCAN: Service = Service {
    configs: HUB,
    secret_volume: DB_PASSWORDS,
    scratch: &["dir-scan-security"],
    service_account: Some("service-account"),
    ..Service::new("scan")
};
const UPLOADCACHE: Service = Service {
    configs: &["config"],
    data: Some(("dir-uploadcache-data", "uploadcache")),
    scratch: &["dir-uploadcache-security"],
    ..Service::new("uploadcache")
};
const WEBSERVER: Service = Service {
    configs: &["config"],
    scratch: &["dir-webserver"],
    service_account: Some("service-account"),
    ..Service::new("webserver")
};

fn config_defaults() -> ComponentConfig {
    ComponentConfig::new("config")
        .env("PUBLIC_HUB_WEBSERVER_PORT", "443")
        .env("HUB_WEBSERVER_PORT", "8443")
        .env("IPV4_ONLY", "0")
        .env("USE_ALERT", "0")
        .env("USE_BINARY_UPLOADS", "0")
        .env("BLACKDUCK_REPORT_IGNORED_COMPONENTS", "false")
        .env("DISABLE_HUB_DASHBOARD", "#hub-webserver.env")
}

/// Shared configuration, database connection settings and the service account.
fn build_config(cfg: &ComponentConfig, ctx: &BuildContext<'_>) -> Result<Vec<ObjectNode>, BuildError> {
    let mut hub = env_map(cfg);
    hub.insert("HUB_VERSION".into(), ctx.version.to_string());
    hub.insert("HUB_PRODUCT_NAME".into(), "BLACK_DUCK".into());
    hub.insert("CFSSL".into(), format!("{}:8888", ctx.resource_name("cfssl")));
    hub.insert("HUB_LOGSTASH_HOST".into(), ctx.resource_name("logstash"));
    hub.insert("HUB_WEBSERVER_HOST".into(), ctx.resource_name("webserver"));
    hub.extend(ctx.environs.iter().map(|(k, v)| (k.clone(), v.clone())));

    let db = BTreeMap::from([
        ("HUB_POSTGRES_ADMIN".to_string(), "blackduck".to_string()),
        ("HUB_POSTGRES_USER".to_string(), "blackduck_user".to_string()),
        ("HUB_POSTGRES_ENABLE_SSL".to_string(), "false".to_string()),
        ("HUB_POSTGRES_HOST".to_string(), ctx.resource_name("postgres")),
        ("HUB_POSTGRES_PORT".to_string(), "5432".to_string()),
    ]);
    Ok(vec![
        config_data(ctx, cfg, "config", hub),
        config_data(ctx, cfg, "db-config", db),
        ObjectNode::new(ctx.resource_name("service-account"), cfg.component.clone(), ObjectBody::ServiceAccount),
    ])
}

const DB_PASSWORD_KEYS: [&str; 3] =
    ["HUB_POSTGRES_ADMIN_PASSWORD_FILE", "HUB_POSTGRES_USER_PASSWORD_FILE", "HUB_POSTGRES_POSTGRES_PASSWORD_FILE"];

fn credentials_defaults() -> ComponentConfig { ComponentConfig::new("db-credentials") }

/// Database passwords: supplied or generated, then any `env` override on top.
fn build_credentials(cfg: &ComponentConfig, ctx: &BuildContext<'_>) -> Result<Vec<ObjectNode>, BuildError> {
    let mut data = credentials(ctx, &DB_PASSWORD_KEYS, &[]);
    data.extend(env_map(cfg));
    Ok(vec![secret(ctx, cfg, "db-creds", data)])
}

fn postgres_defaults() -> ComponentConfig {
    ComponentConfig::new("postgres")
        .resources(Some("1000m"), None, Some("3072Mi"), Some("3072Mi"))
        .port(Port::tcp("port-5432", 5432))
        .mount(VolumeMount::new("postgres-persistent-vol", "/var/lib/pgsql/data"))
        .env("POSTGRESQL_MAX_CONNECTIONS", "300")
        .env("POSTGRESQL_SHARED_BUFFERS", "1024MB")
        .storage("150Gi")
        .probe(probe(&["/bin/sh", "-c", "pg_isready -h localhost -p 5432"], 30))
}

fn authentication_defaults() -> ComponentConfig {
    ComponentConfig::new("authentication")
        .resources(Some("1000m"), None, Some("1024Mi"), Some("1024Mi"))
        .env("HUB_MAX_MEMORY", "512m")
        .port(Port::tcp("port-8443", 8443))
        .mount(VolumeMount::new("dir-authentication", "/opt/blackduck/hub/hub-authentication/ldap"))
        .mount(VolumeMount::new("dir-authentication-security", "/opt/blackduck/hub/hub-authentication/security"))
        .mount(VolumeMount::new("db-passwords", "/tmp/secrets/HUB_POSTGRES_ADMIN_PASSWORD_FILE").with_sub_path("HUB_POSTGRES_ADMIN_PASSWORD_FILE"))
        .storage("2Gi")
        .probe(probe(&["/usr/local/bin/docker-healthcheck.sh", "https://127.0.0.1:8443/api/health-checks/liveness"], 240))
}

fn cfssl_defaults() -> ComponentConfig {
    ComponentConfig::new("cfssl")
        .resources(None, None, Some("640Mi"), Some("640Mi"))
        .port(Port::tcp("port-8888", 8888))
        .mount(VolumeMount::new("dir-cfssl", "/etc/cfssl"))
        .storage("2Gi")
        .probe(probe(&["/usr/local/bin/docker-healthcheck.sh", "http://localhost:8888/api/v1/cfssl/scaninfo"], 240))
}

fn documentation_defaults() -> ComponentConfig {
    ComponentConfig::new("documentation")
        .resources(None, None, Some("512Mi"), Some("512Mi"))
        .port(Port::tcp("port-8443", 8443))
        .probe(probe(&["/usr/local/bin/docker-healthcheck.sh", "https://127.0.0.1:8443/hubdoc/health-checks/liveness"], 240))
}

fn jobrunner_defaults() -> ComponentConfig {
    ComponentConfig::new("jobrunner")
        .resources(Some("1000m"), None, Some("4608Mi"), Some("4608Mi"))
        .env("HUB_MAX_MEMORY", "4096m")
        .mount(VolumeMount::new("dir-jobrunner-security", "/opt/blackduck/hub/jobrunner/security"))
        .mount(VolumeMount::new("db-passwords", "/tmp/secrets/HUB_POSTGRES_ADMIN_PASSWORD_FILE").with_sub_path("HUB_POSTGRES_ADMIN_PASSWORD_FILE"))
        .probe(probe(&["/usr/local/bin/docker-healthcheck.sh"], 240))
}

fn bomengine_defaults() -> ComponentConfig {
    ComponentConfig::new("bomengine")
        .resources(Some("1000m"), None, Some("4608Mi"), Some("4608Mi"))
        .env("HUB_MAX_MEMORY", "4096m")
        .port(Port::tcp("port-8443", 8443))
        .mount(VolumeMount::new("dir-bomengine-security", "/opt/blackduck/hub/hub-bomengine/security"))
        .mount(VolumeMount::new("db-passwords", "/tmp/secrets/HUB_POSTGRES_ADMIN_PASSWORD_FILE").with_sub_path("HUB_POSTGRES_ADMIN_PASSWORD_FILE"))
        .probe(probe(&["/usr/local/bin/docker-healthcheck.sh", "https://127.0.0.1:8443/health-checks/liveness"], 240))
}

fn registration_defaults() -> ComponentConfig {
    ComponentConfig::new("registration")
        .resources(Some("1000m"), None, Some("1024Mi"), Some("1024Mi"))
        .port(Port::tcp("port-8443", 8443))
        .mount(VolumeMount::new("dir-registration", "/opt/blackduck/hub/hub-registration/config"))
        .mount(VolumeMount::new("dir-registration-security", "/opt/blackduck/hub/hub-registration/security"))
        .storage("2Gi")
        .probe(probe(&["/usr/local/bin/docker-healthcheck.sh", "https://localhost:8443/registration/health-checks/liveness"], 240))
}

fn scan_defaults() -> ComponentConfig {
    ComponentConfig::new("scan")
        .resources(Some("1000m"), None, Some("2560Mi"), Some("2560Mi"))
        .env("HUB_MAX_MEMORY", "2048m")
        .port(Port::tcp("port-8443", 8443))
        .mount(VolumeMount::new("dir-scan-security", "/opt/blackduck/hub/hub-scan/security"))
        .mount(VolumeMount::new("db-passwords", "/tmp/secrets/HUB_POSTGRES_ADMIN_PASSWORD_FILE").with_sub_path("HUB_POSTGRES_ADMIN_PASSWORD_FILE"))
        .probe(probe(&["/usr/local/bin/docker-healthcheck.sh", "https://127.0.0.1:8443/api/health-checks/liveness"], 240))
}

fn uploadcache_defaults() -> ComponentConfig {
    ComponentConfig::new("uploadcache")
        .resources(None, None, Some("512Mi"), Some("512Mi"))
        .port(Port::tcp("port-9443", 9443))
        .port(Port::tcp("port-9444", 9444))
        .mount(VolumeMount::new("dir-uploadcache-data", "/opt/blackduck/hub/blackduck-upload-cache/uploads"))
        .mount(VolumeMount::new("dir-uploadcache-security", "/opt/blackduck/hub/blackduck-upload-cache/security"))
        .storage("100Gi")
        .probe(probe(&["/usr/local/bin/docker-healthcheck.sh", "https://localhost:9444/api/health-checks/liveness"], 240))
}

fn webserver_defaults() -> ComponentConfig {
    ComponentConfig::new("webserver")
        .resources(None, None, Some("2048Mi"), Some("2048Mi"))
        .port(Port::tcp("port-443", 8443))
        .mount(VolumeMount::new("dir-webserver", "/opt/blackduck/hub/webserver/security"))
        .probe(probe(&["/usr/local/bin/docker-healthcheck.sh", "https://localhost:8443/health-checks/liveness"], 240))
}

fn webapp_defaults() -> ComponentConfig {
    ComponentConfig::new("webapp-logstash")
        .resources(Some("1000m"), None, Some("3072Mi"), Some("3072Mi"))
        .env("HUB_MAX_MEMORY", "2048m")
        .port(Port::tcp("port-8443", 8443))
        .mount(VolumeMount::new("db-passwords", "/tmp/secrets/HUB_POSTGRES_ADMIN_PASSWORD_FILE").with_sub_path("HUB_POSTGRES_ADMIN_PASSWORD_FILE"))
        .mount(VolumeMount::new("db-passwords", "/tmp/secrets/HUB_POSTGRES_USER_PASSWORD_FILE").with_sub_path("HUB_POSTGRES_USER_PASSWORD_FILE"))
        .mount(VolumeMount::new("dir-webapp", "/opt/blackduck/hub/hub-webapp/ldap"))
        .mount(VolumeMount::new("dir-webapp-security", "/opt/blackduck/hub/hub-webapp/security"))
        .mount(VolumeMount::new("dir-logstash", "/opt/blackduck/hub/logs"))
        .storage("2Gi")
        .probe(probe(
            &[
                "/usr/local/bin/docker-healthcheck.sh",
                "https://127.0.0.1:8443/api/health-checks/liveness",
                "/opt/blackduck/hub/hub-webapp/security/root.crt",
                "/opt/blackduck/hub/hub-webapp/security/blackduck_system.crt",
                "/opt/blackduck/hub/hub-webapp/security/blackduck_system.key",
            ],
            360,
        ))
}

/// Webapp plus its logstash sidecar sharing the log volume. The sidecar is not overridable.
fn build_webapp(cfg: &ComponentConfig, ctx: &BuildContext<'_>) -> Result<Vec<ObjectNode>, BuildError> {
    let mut webapp = main_container(cfg, ctx, "webapp")?;
    webapp.env_from = env_from(ctx, HUB, &[]);
    let logstash_port = Port::tcp("port-5044", 5044);
    let logstash = ContainerBody {
        name: "logstash".into(),
        image: require_image(cfg, "logstash")?.to_string(),
        resources: keel_core::Resources { memory_min: Some("1024Mi".into()), memory_max: Some("1024Mi".into()), ..Default::default() },
        env: Vec::new(),
        env_from: env_from(ctx, &["config"], &[]),
        ports: vec![logstash_port.clone()],
        volume_mounts: vec![VolumeMount::new("dir-logstash", "/var/lib/logstash/data")],
        liveness: ctx
            .features
            .liveness_probes
            .then(|| probe(&["/usr/local/bin/docker-healthcheck.sh", "http://localhost:9600/"], 240)),
    };

    let mut nodes = Vec::new();
    let (webapp_vol, webapp_claim) = data_volume(ctx, cfg, "dir-webapp", "webapp");
    let (logstash_vol, logstash_claim) = data_volume(ctx, cfg, "dir-logstash", "logstash");
    nodes.extend(webapp_claim);
    nodes.extend(logstash_claim);
    let volumes = vec![
        VolumeBody::EmptyDir { name: "dir-webapp-security".into() },
        webapp_vol,
        logstash_vol,
        VolumeBody::Secret { name: "db-passwords".into(), secret: ctx.resource_name("db-creds") },
    ];
    nodes.push(workload(ctx, cfg, "webapp-logstash", vec![webapp, logstash], volumes, Some(ctx.resource_name("service-account"))));
    nodes.push(endpoint(ctx, cfg, "webapp", cfg.ports.clone(), Exposure::ClusterIp));
    nodes.push(endpoint(ctx, cfg, "logstash", vec![logstash_port], Exposure::ClusterIp));
    Ok(nodes)
}

fn build_route(cfg: &ComponentConfig, ctx: &BuildContext<'_>) -> Result<Vec<ObjectNode>, BuildError> {
    let body = ObjectBody::Route { endpoint: ctx.resource_name("webserver"), port: "port-443".into(), tls: TlsTermination::Passthrough };
    Ok(vec![ObjectNode::new(ctx.resource_name("route"), cfg.component.clone(), body)])
}

fn route_defaults() -> ComponentConfig { ComponentConfig::new("route") }

fn webapp_preset(f: Flavor) -> Option<ResourcePreset> {
    Some(match f {
        Flavor::Small => ResourcePreset::cpu_memory("1000m", "3072Mi"),
        Flavor::Medium => ResourcePreset::cpu_memory("2000m", "5120Mi"),
        Flavor::Large => ResourcePreset::cpu_memory("2000m", "9728Mi"),
        Flavor::XLarge => ResourcePreset::cpu_memory("3000m", "19968Mi"),
    })
}

fn jobrunner_preset(f: Flavor) -> Option<ResourcePreset> {
    Some(match f {
        Flavor::Small => ResourcePreset::memory("4608Mi").with_replicas(1),
        Flavor::Medium => ResourcePreset::memory("4608Mi").with_replicas(4),
        Flavor::Large => ResourcePreset::memory("4608Mi").with_replicas(6),
        Flavor::XLarge => ResourcePreset::memory("13824Mi").with_replicas(10),
    })
}

fn scan_preset(f: Flavor) -> Option<ResourcePreset> {
    Some(match f {
        Flavor::Small => ResourcePreset::memory("2560Mi").with_replicas(1),
        Flavor::Medium => ResourcePreset::memory("5120Mi").with_replicas(2),
        Flavor::Large => ResourcePreset::memory("9728Mi").with_replicas(3),
        Flavor::XLarge => ResourcePreset::memory("9728Mi").with_replicas(5),
    })
}

fn postgres_preset(f: Flavor) -> Option<ResourcePreset> {
    match f {
        Flavor::Small => None,
        Flavor::Medium => Some(ResourcePreset::cpu_memory("2000m", "8192Mi")),
        Flavor::Large | Flavor::XLarge => Some(ResourcePreset::cpu_memory("4000m", "16384Mi")),
    }
}

fn components(r: &'static Release) -> Vec<(&'static str, Component)> {
    vec![
        ("config", Component::new(r, &[], config_defaults, build_config).supported(CONFIG_FIELDS)),
        ("db-credentials", Component::new(r, &[], credentials_defaults, build_credentials).supported(CONFIG_FIELDS)),
        (
            "postgres",
            Component::new(r, &[("postgres", "blackduck-postgres")], postgres_defaults, |c, x| service(c, x, &POSTGRES))
                .preset(postgres_preset),
        ),
        (
            "authentication",
            Component::new(r, &[("authentication", "blackduck-authentication")], authentication_defaults, |c, x| {
                service(c, x, &AUTHENTICATION)
            }),
        ),
        ("cfssl", Component::new(r, &[("cfssl", "blackduck-cfssl")], cfssl_defaults, |c, x| service(c, x, &CFSSL))),
        (
            "documentation",
            Component::new(r, &[("documentation", "blackduck-documentation")], documentation_defaults, |c, x| {
                service(c, x, &DOCUMENTATION)
            }),
        ),
        (
            "jobrunner",
            Component::new(r, &[("jobrunner", "blackduck-jobrunner")], jobrunner_defaults, |c, x| service(c, x, &JOBRUNNER))
                .preset(jobrunner_preset),
        ),
        (
            "registration",
            Component::new(r, &[("registration", "blackduck-registration")], registration_defaults, |c, x| {
                service(c, x, &REGISTRATION)
            }),
        ),
        ("scan", Component::new(r, &[("scan", "blackduck-scan")], scan_defaults, |c, x| service(c, x, &SCAN)).preset(scan_preset)),
        (
            "uploadcache",
            Component::new(r, &[("uploadcache", "blackduck-upload-cache")], uploadcache_defaults, |c, x| {
                service(c, x, &UPLOADCACHE)
            }),
        ),
        (
            "webapp-logstash",
            Component::new(r, &[("webapp", "blackduck-webapp"), ("logstash", "blackduck-logstash")], webapp_defaults, build_webapp)
                .preset(webapp_preset),
        ),
        (
            "webserver",
            Component::new(r, &[("webserver", "blackduck-nginx")], webserver_defaults, |c, x| service(c, x, &WEBSERVER)),
        ),
        ("route", Component::new(r, &[], route_defaults, build_route).supported(NO_FIELDS)),
    ]
}

fn manifest(extra: &[&str]) -> Vec<Slot> {
    let mut slots: Vec<Slot> = [
        "config",
        "db-credentials",
        "postgres",
        "authentication",
        "cfssl",
        "documentation",
        "jobrunner",
        "registration",
        "scan",
        "uploadcache",
        "webapp-logstash",
        "webserver",
    ]
    .iter()
    .chain(extra.iter())
    .map(|c| Slot::always(c))
    .collect();
    slots.push(Slot::on("route", Platform::OpenShift));
    slots
}

pub fn register(registry: &mut Registry) -> Result<(), ConfigurationError> {
    for (name, c) in components(&R2020_4) {
        registry.register(ProductKind::BlackDuck, name, R2020_4.version, c)?;
    }
    registry.register_manifest(ProductKind::BlackDuck, R2020_4.version, manifest(&[]))?;

    for (name, c) in components(&R2020_6) {
        registry.register(ProductKind::BlackDuck, name, R2020_6.version, c)?;
    }
    let bomengine = Component::new(&R2020_6, &[("bomengine", "blackduck-bomengine")], bomengine_defaults, |c, x| {
        service(c, x, &BOMENGINE)
    })
    .preset(jobrunner_preset);
    registry.register(ProductKind::BlackDuck, "bomengine", R2020_6.version, bomengine)?;
    registry.register_manifest(ProductKind::BlackDuck, R2020_6.version, manifest(&["bomengine"]))?;
    Ok(())
}
