#![forbid(unsafe_code)]

use keel_core::{
    ConfigurationError, Flavor, InstanceId, KeelError, NodeId, ObjectBody, ObjectGraph, ObjectKind, PartialComponentConfig,
    Platform, ProductKind, ProductSpec, Version, PRODUCT_LABEL,
};
use keel_registry::{compose, GraphBuilder};

fn spec(product: ProductKind, version: &str) -> ProductSpec {
    ProductSpec::new(InstanceId::new("synopsys", "demo"), product, Version::parse(version).unwrap())
}

fn workload(graph: &ObjectGraph, name: &str) -> keel_core::WorkloadBody {
    match &graph.get(&NodeId::workload(name)).unwrap_or_else(|| panic!("missing {}", name)).body {
        ObjectBody::Workload(w) => w.clone(),
        other => panic!("not a workload: {:?}", other),
    }
}

fn count(graph: &ObjectGraph, kind: ObjectKind) -> usize { graph.ids().filter(|i| i.kind == kind).count() }

#[test]
fn every_product_version_composes() {
    let r = keel_products::registry().unwrap();
    for product in ProductKind::ALL {
        let versions = r.versions(product);
        assert_eq!(versions.len(), 2, "{}", product);
        for v in versions {
            let graph = compose(&r, &ProductSpec::new(InstanceId::new("ns", "x"), product, v.clone())).unwrap();
            assert!(!graph.is_empty());
            assert!(graph.nodes().all(|n| n.labels.get(PRODUCT_LABEL).map(String::as_str) == Some(product.as_str())));
        }
    }
}

fn secret_data(graph: &ObjectGraph, name: &str) -> std::collections::BTreeMap<String, String> {
    match &graph.get(&NodeId::secret(name)).unwrap_or_else(|| panic!("missing {}", name)).body {
        ObjectBody::Secret { data } => data.clone(),
        other => panic!("not a secret: {:?}", other),
    }
}

#[test]
fn secrets_are_never_empty_or_well_known() {
    let r = keel_products::registry().unwrap();
    let cases = [
        (ProductKind::BlackDuck, "2020.6.0", "demo-blackduck-db-creds", 3),
        (ProductKind::Alert, "6.0.0", "demo-alert-secret", 2),
        (ProductKind::OpsSight, "2.2.5", "demo-opssight-blackduck", 1),
    ];
    for (product, version, name, keys) in cases {
        let first = secret_data(&compose(&r, &spec(product, version)).unwrap(), name);
        assert_eq!(first.len(), keys, "{}", name);
        assert!(first.values().all(|v| v.len() == 32 && v != "blackduck"), "{:?}", first);
        let again = secret_data(&compose(&r, &spec(product, version)).unwrap(), name);
        assert_eq!(first, again);
    }
}

#[test]
fn supplied_credentials_reach_the_secret() {
    let r = keel_products::registry().unwrap();
    let mut s = spec(ProductKind::OpsSight, "2.2.5");
    s.credentials.insert("HUB_PASSWORD".into(), "hub-admin-pw".into());
    s.credentials.insert("securityToken".into(), "token".into());
    let data = secret_data(&compose(&r, &s).unwrap(), "demo-opssight-blackduck");
    assert_eq!(data["HUB_PASSWORD"], "hub-admin-pw");
    assert_eq!(data["securityToken"], "token");

    let mut s = spec(ProductKind::BlackDuck, "2020.6.0");
    s.credential_seed = Some("seed".into());
    let seeded = secret_data(&compose(&r, &s).unwrap(), "demo-blackduck-db-creds");
    let plain = secret_data(&compose(&r, &spec(ProductKind::BlackDuck, "2020.6.0")).unwrap(), "demo-blackduck-db-creds");
    assert_ne!(seeded, plain);
}

#[test]
fn black_duck_versions_differ_in_components() {
    let r = keel_products::registry().unwrap();
    let old = compose(&r, &spec(ProductKind::BlackDuck, "2020.4.0")).unwrap();
    let new = compose(&r, &spec(ProductKind::BlackDuck, "2020.6.0")).unwrap();
    assert!(old.get(&NodeId::workload("demo-blackduck-bomengine")).is_none());
    assert!(new.get(&NodeId::workload("demo-blackduck-bomengine")).is_some());
    let web = workload(&new, "demo-blackduck-webserver");
    assert_eq!(web.containers[0].image, "docker.io/blackducksoftware/blackduck-nginx:1.0.25");
    assert_eq!(count(&new, ObjectKind::Route), 0);
    assert_eq!(count(&new, ObjectKind::VolumeClaim), 0);
}

#[test]
fn black_duck_unknown_version_is_not_found() {
    let r = keel_products::registry().unwrap();
    match compose(&r, &spec(ProductKind::BlackDuck, "2020.5.0")) {
        Err(KeelError::Configuration { source: ConfigurationError::NotFound { key }, .. }) => {
            assert_eq!(key, "blackduck@2020.5.0")
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn persistent_storage_adds_claims_with_storage_class() {
    let r = keel_products::registry().unwrap();
    let mut s = spec(ProductKind::BlackDuck, "2020.6.0");
    s.features.persistent_storage = true;
    s.storage_class = Some("fast".into());
    let graph = compose(&r, &s).unwrap();
    let pg = graph.get(&NodeId::new(ObjectKind::VolumeClaim, "demo-blackduck-postgres")).unwrap();
    match &pg.body {
        ObjectBody::VolumeClaim { size, storage_class } => {
            assert_eq!(size, "150Gi");
            assert_eq!(storage_class.as_deref(), Some("fast"));
        }
        other => panic!("unexpected {:?}", other),
    }
    let web = graph.get(&NodeId::workload("demo-blackduck-webapp-logstash")).unwrap();
    assert!(web.refs.contains(&NodeId::new(ObjectKind::VolumeClaim, "demo-blackduck-webapp")));
    assert!(web.refs.contains(&NodeId::new(ObjectKind::VolumeClaim, "demo-blackduck-logstash")));
}

#[test]
fn openshift_gets_a_passthrough_route_to_the_webserver() {
    let r = keel_products::registry().unwrap();
    let mut s = spec(ProductKind::BlackDuck, "2020.4.0");
    s.platform = Platform::OpenShift;
    let graph = compose(&r, &s).unwrap();
    let route = graph.get(&NodeId::new(ObjectKind::Route, "demo-blackduck-route")).unwrap();
    assert!(route.refs.contains(&NodeId::endpoint("demo-blackduck-webserver")));
}

#[test]
fn flavor_scales_and_overrides_still_win() {
    let r = keel_products::registry().unwrap();
    let mut s = spec(ProductKind::BlackDuck, "2020.6.0");
    s.flavor = Flavor::Medium;
    s.overrides.insert(
        "webapp-logstash".into(),
        PartialComponentConfig { max_memory: Some("6Gi".into()), ..Default::default() },
    );
    let graph = compose(&r, &s).unwrap();
    assert_eq!(workload(&graph, "demo-blackduck-jobrunner").replicas, 4);
    let web = workload(&graph, "demo-blackduck-webapp-logstash");
    assert_eq!(web.containers[0].resources.memory_max.as_deref(), Some("6Gi"));
    assert_eq!(web.containers[0].resources.memory_min.as_deref(), Some("5120Mi"));
}

#[test]
fn liveness_probes_follow_the_feature() {
    let r = keel_products::registry().unwrap();
    let mut s = spec(ProductKind::BlackDuck, "2020.6.0");
    let graph = compose(&r, &s).unwrap();
    assert!(workload(&graph, "demo-blackduck-webapp-logstash").containers.iter().all(|c| c.liveness.is_none()));
    s.features.liveness_probes = true;
    let graph = compose(&r, &s).unwrap();
    let web = workload(&graph, "demo-blackduck-webapp-logstash");
    assert_eq!(web.containers.len(), 2);
    assert!(web.containers.iter().all(|c| c.liveness.is_some()));
    assert_eq!(web.containers[0].liveness.as_ref().unwrap().initial_delay_secs, 360);
}

#[test]
fn routes_accept_no_overrides() {
    let r = keel_products::registry().unwrap();
    let mut s = spec(ProductKind::Alert, "6.0.0");
    s.platform = Platform::OpenShift;
    s.overrides.insert("route".into(), PartialComponentConfig { replicas: Some(2), ..Default::default() });
    let err = GraphBuilder::new(&r).configure(&s).unwrap_err();
    assert_eq!(err, ConfigurationError::UnsupportedField { component: "route".into(), field: "replicas".into() });
}

#[test]
fn opssight_optional_services_follow_features() {
    let r = keel_products::registry().unwrap();
    let base = compose(&r, &spec(ProductKind::OpsSight, "2.2.5")).unwrap();
    assert!(base.get(&NodeId::workload("demo-opssight-prometheus")).is_none());
    assert!(base.get(&NodeId::workload("demo-opssight-skyfire")).is_none());
    assert!(base.get(&NodeId::workload("demo-opssight-image-perceiver")).is_none());

    let mut s = spec(ProductKind::OpsSight, "2.2.5");
    s.features.metrics = true;
    s.features.skyfire = true;
    s.features.image_perceiver = true;
    s.flavor = Flavor::Large;
    let full = compose(&r, &s).unwrap();
    assert!(full.get(&NodeId::workload("demo-opssight-skyfire")).is_some());
    assert!(full.get(&NodeId::workload("demo-opssight-image-perceiver")).is_some());
    assert_eq!(workload(&full, "demo-opssight-scanner").replicas, 3);
    match &full.get(&NodeId::config("demo-opssight-prometheus")).unwrap().body {
        ObjectBody::ConfigData { data } => assert!(data["prometheus.yml"].contains("demo-opssight-skyfire:3005")),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn alert_environs_reach_the_shared_config() {
    let r = keel_products::registry().unwrap();
    let mut s = spec(ProductKind::Alert, "5.3.0");
    s.environs.insert("ALERT_SERVER_PORT".into(), "9443".into());
    let graph = compose(&r, &s).unwrap();
    match &graph.get(&NodeId::config("demo-alert-config")).unwrap().body {
        ObjectBody::ConfigData { data } => {
            assert_eq!(data["ALERT_SERVER_PORT"], "9443");
            assert_eq!(data["HUB_CFSSL_HOST"], "demo-alert-cfssl");
        }
        other => panic!("unexpected {:?}", other),
    }
    let order = graph.topological_order().unwrap();
    let pos = |id: &NodeId| order.iter().position(|o| o == id).unwrap();
    assert!(pos(&NodeId::secret("demo-alert-secret")) < pos(&NodeId::workload("demo-alert-alert")));
}
