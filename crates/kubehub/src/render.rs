//! Intermediate object model to Kubernetes manifests.
//!
//! Only this module knows concrete API groups and field layouts.

use base64::Engine as _;
use serde_json::{json, Map, Value as Json};

use keel_core::{
    ContainerBody, EnvFrom, Exposure, ObjectBody, ObjectKind, ObjectNode, TlsTermination, VolumeBody, WorkloadBody,
    SIGNATURE_ANNOTATION,
};

/// (group, version, kind) served for each object kind.
pub fn gvk(kind: ObjectKind) -> (&'static str, &'static str, &'static str) {
    match kind {
        ObjectKind::ConfigData => ("", "v1", "ConfigMap"),
        ObjectKind::Secret => ("", "v1", "Secret"),
        ObjectKind::ServiceAccount => ("", "v1", "ServiceAccount"),
        ObjectKind::VolumeClaim => ("", "v1", "PersistentVolumeClaim"),
        ObjectKind::Endpoint => ("", "v1", "Service"),
        ObjectKind::Workload => ("apps", "v1", "Deployment"),
        ObjectKind::Route => ("route.openshift.io", "v1", "Route"),
    }
}

fn api_version(kind: ObjectKind) -> String {
    match gvk(kind) {
        ("", v, _) => v.to_string(),
        (g, v, _) => format!("{}/{}", g, v),
    }
}

/// Render `node` for `namespace`, stamping its signature annotation.
pub fn render_manifest(namespace: &str, node: &ObjectNode) -> Json {
    let (_, _, kind) = gvk(node.id.kind);
    let mut out = json!({
        "apiVersion": api_version(node.id.kind),
        "kind": kind,
        "metadata": {
            "name": node.id.name,
            "namespace": namespace,
            "labels": node.labels,
            "annotations": { SIGNATURE_ANNOTATION: node.signature() },
        },
    });
    let body = match &node.body {
        ObjectBody::ConfigData { data } => json!({ "data": data }),
        ObjectBody::Secret { data } => json!({ "type": "Opaque", "stringData": data }),
        ObjectBody::ServiceAccount => json!({}),
        ObjectBody::VolumeClaim { size, storage_class } => {
            let mut spec = json!({
                "accessModes": ["ReadWriteOnce"],
                "resources": { "requests": { "storage": size } },
            });
            if let Some(sc) = storage_class {
                spec["storageClassName"] = json!(sc);
            }
            json!({ "spec": spec })
        }
        ObjectBody::Endpoint { selector, ports, exposure } => json!({
            "spec": {
                "type": match exposure {
                    Exposure::ClusterIp => "ClusterIP",
                    Exposure::NodePort => "NodePort",
                    Exposure::LoadBalancer => "LoadBalancer",
                },
                "selector": selector,
                "ports": ports.iter().map(|p| json!({
                    "name": p.name,
                    "port": p.port,
                    "targetPort": p.port,
                    "protocol": p.protocol,
                })).collect::<Vec<_>>(),
            }
        }),
        ObjectBody::Workload(w) => json!({ "spec": deployment_spec(&node.labels, w) }),
        ObjectBody::Route { endpoint, port, tls } => json!({
            "spec": {
                "to": { "kind": "Service", "name": endpoint },
                "port": { "targetPort": port },
                "tls": { "termination": match tls {
                    TlsTermination::Passthrough => "passthrough",
                    TlsTermination::Edge => "edge",
                } },
            }
        }),
    };
    if let (Some(o), Json::Object(b)) = (out.as_object_mut(), body) {
        o.extend(b);
    }
    out
}

fn deployment_spec(labels: &std::collections::BTreeMap<String, String>, w: &WorkloadBody) -> Json {
    let mut pod = Map::new();
    pod.insert("containers".into(), Json::Array(w.containers.iter().map(container).collect()));
    pod.insert("volumes".into(), Json::Array(w.volumes.iter().map(volume).collect()));
    if let Some(sa) = &w.service_account {
        pod.insert("serviceAccountName".into(), json!(sa));
    }
    if !w.pull_secrets.is_empty() {
        pod.insert("imagePullSecrets".into(), Json::Array(w.pull_secrets.iter().map(|s| json!({ "name": s })).collect()));
    }
    if let Some(sc) = &w.security {
        pod.insert("securityContext".into(), json!({ "runAsUser": sc.run_as_user, "runAsGroup": sc.run_as_group, "fsGroup": sc.fs_group }));
    }
    let mut pod_labels = labels.clone();
    pod_labels.extend(w.selector.clone());
    json!({
        "replicas": w.replicas,
        "selector": { "matchLabels": w.selector },
        "template": { "metadata": { "labels": pod_labels }, "spec": Json::Object(pod) },
    })
}

fn container(c: &ContainerBody) -> Json {
    let mut requests = Map::new();
    let mut limits = Map::new();
    if let Some(v) = &c.resources.cpu_min { requests.insert("cpu".into(), json!(v)); }
    if let Some(v) = &c.resources.memory_min { requests.insert("memory".into(), json!(v)); }
    if let Some(v) = &c.resources.cpu_max { limits.insert("cpu".into(), json!(v)); }
    if let Some(v) = &c.resources.memory_max { limits.insert("memory".into(), json!(v)); }
    let mut out = json!({
        "name": c.name,
        "image": c.image,
        "imagePullPolicy": "Always",
        "env": c.env.iter().map(|e| json!({ "name": e.name, "value": e.value })).collect::<Vec<_>>(),
        "envFrom": c.env_from.iter().map(|ef| match ef {
            EnvFrom::ConfigData(n) => json!({ "configMapRef": { "name": n } }),
            EnvFrom::Secret(n) => json!({ "secretRef": { "name": n } }),
        }).collect::<Vec<_>>(),
        "ports": c.ports.iter().map(|p| json!({ "name": p.name, "containerPort": p.port, "protocol": p.protocol })).collect::<Vec<_>>(),
        "volumeMounts": c.volume_mounts.iter().map(|m| {
            let mut v = json!({ "name": m.name, "mountPath": m.mount_path });
            if let Some(sp) = &m.sub_path { v["subPath"] = json!(sp); }
            v
        }).collect::<Vec<_>>(),
        "resources": { "requests": requests, "limits": limits },
    });
    if let Some(p) = &c.liveness {
        out["livenessProbe"] = json!({
            "exec": { "command": p.command },
            "initialDelaySeconds": p.initial_delay_secs,
            "periodSeconds": p.period_secs,
            "timeoutSeconds": p.timeout_secs,
            "failureThreshold": p.failure_threshold,
        });
    }
    out
}

fn volume(v: &VolumeBody) -> Json {
    match v {
        VolumeBody::EmptyDir { name } => json!({ "name": name, "emptyDir": {} }),
        VolumeBody::Claim { name, claim } => json!({ "name": name, "persistentVolumeClaim": { "claimName": claim } }),
        VolumeBody::Secret { name, secret } => json!({ "name": name, "secret": { "secretName": secret, "defaultMode": 0o440 } }),
        VolumeBody::ConfigData { name, config } => json!({ "name": name, "configMap": { "name": config } }),
    }
}

/// Drop server-populated fields before showing or comparing a live object.
pub fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(Json::as_object_mut) {
        meta.remove("managedFields");
        meta.remove("resourceVersion");
        meta.remove("generation");
        meta.remove("creationTimestamp");
        meta.remove("uid");
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

/// Rewrite write-only fields into the shape the API server returns.
///
/// Secret `stringData` is folded into `data` as base64.
pub fn served_form(mut v: Json) -> Json {
    let Some(obj) = v.as_object_mut() else { return v };
    if let Some(Json::Object(plain)) = obj.remove("stringData") {
        let data = obj.entry("data").or_insert_with(|| Json::Object(Map::new()));
        if let Some(data) = data.as_object_mut() {
            for (k, text) in plain {
                let encoded = base64::engine::general_purpose::STANDARD.encode(text.as_str().unwrap_or_default());
                data.insert(k, Json::String(encoded));
            }
        }
    }
    v
}

/// Whether the live manifest no longer holds what `node` renders to.
///
/// Only fields the node sets are compared, so server defaults and foreign
/// annotations are not drift. Empty maps and lists match an absent field.
pub fn body_drifted(namespace: &str, node: &ObjectNode, live: &Json) -> bool {
    let mut want = served_form(render_manifest(namespace, node));
    if let Some(meta) = want.get_mut("metadata").and_then(Json::as_object_mut) {
        meta.remove("annotations");
    }
    !holds(live, &want)
}

fn holds(live: &Json, want: &Json) -> bool {
    match (want, live) {
        (Json::Object(w), Json::Object(l)) => w.iter().all(|(k, wv)| match (l.get(k), k.as_str()) {
            (Some(Json::Object(lq)), "requests" | "limits") => quantities_hold(lq, wv),
            (Some(lv), _) => holds(lv, wv),
            (None, _) => vacant(wv),
        }),
        (Json::Array(w), Json::Array(l)) => w.len() == l.len() && w.iter().zip(l).all(|(wv, lv)| holds(lv, wv)),
        (Json::Object(_) | Json::Array(_), Json::Null) => vacant(want),
        (Json::Number(a), Json::Number(b)) => a.as_f64() == b.as_f64(),
        _ => want == live,
    }
}

/// The server stores quantities in canonical form ("1000m" reads back as "1").
fn quantities_hold(live: &Map<String, Json>, want: &Json) -> bool {
    let Json::Object(w) = want else { return false };
    w.iter().all(|(k, wv)| match (wv.as_str(), live.get(k).and_then(Json::as_str)) {
        (Some(a), Some(b)) => a == b || matches!((quantity(a), quantity(b)), (Some(x), Some(y)) if (x - y).abs() <= f64::EPSILON * x.abs().max(1.0)),
        _ => holds(live.get(k).unwrap_or(&Json::Null), wv),
    })
}

/// Numeric value of a Kubernetes quantity string.
fn quantity(s: &str) -> Option<f64> {
    const SUFFIXES: [(&str, f64); 13] = [
        ("Ki", 1024.0),
        ("Mi", 1_048_576.0),
        ("Gi", 1_073_741_824.0),
        ("Ti", 1_099_511_627_776.0),
        ("Pi", 1_125_899_906_842_624.0),
        ("n", 1e-9),
        ("u", 1e-6),
        ("m", 1e-3),
        ("k", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
        ("P", 1e15),
    ];
    for (suffix, scale) in SUFFIXES {
        if let Some(n) = s.strip_suffix(suffix) {
            return n.parse::<f64>().ok().map(|v| v * scale);
        }
    }
    s.parse::<f64>().ok()
}

fn vacant(v: &Json) -> bool {
    match v {
        Json::Null => true,
        Json::Array(a) => a.is_empty(),
        Json::Object(m) => m.values().all(vacant),
        _ => false,
    }
}

/// Signature annotation of a live manifest.
pub fn live_signature(v: &Json) -> Option<String> {
    v.pointer("/metadata/annotations")
        .and_then(|a| a.get(SIGNATURE_ANNOTATION))
        .and_then(Json::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{Port, Resources};
    use std::collections::BTreeMap;

    fn deployment() -> ObjectNode {
        let w = WorkloadBody {
            replicas: 2,
            selector: BTreeMap::from([("keel.io/component".to_string(), "webserver".to_string())]),
            containers: vec![ContainerBody {
                name: "webserver".into(),
                image: "nginx:1".into(),
                resources: Resources { memory_max: Some("2Gi".into()), ..Default::default() },
                env: vec![],
                env_from: vec![EnvFrom::ConfigData("hub-config".into())],
                ports: vec![Port::tcp("port-443", 8443)],
                volume_mounts: vec![],
                liveness: None,
            }],
            volumes: vec![VolumeBody::Claim { name: "data".into(), claim: "hub-data".into() }],
            service_account: Some("hub-sa".into()),
            pull_secrets: vec!["regcred".into()],
            security: None,
        };
        ObjectNode::new("hub-webserver", "webserver", ObjectBody::Workload(w))
    }

    #[test]
    fn workload_renders_as_deployment_with_signature() {
        let node = deployment();
        let m = render_manifest("bd", &node);
        assert_eq!(m["apiVersion"], "apps/v1");
        assert_eq!(m["kind"], "Deployment");
        assert_eq!(m["metadata"]["namespace"], "bd");
        assert_eq!(m["spec"]["replicas"], 2);
        assert_eq!(m["spec"]["template"]["spec"]["serviceAccountName"], "hub-sa");
        assert_eq!(m["spec"]["template"]["spec"]["imagePullSecrets"][0]["name"], "regcred");
        assert_eq!(m["spec"]["template"]["spec"]["containers"][0]["resources"]["limits"]["memory"], "2Gi");
        assert_eq!(m["spec"]["template"]["spec"]["volumes"][0]["persistentVolumeClaim"]["claimName"], "hub-data");
        assert_eq!(live_signature(&m), Some(node.signature()));
    }

    #[test]
    fn strip_noisy_drops_cluster_metadata_only() {
        let mut m = render_manifest("bd", &deployment());
        m["metadata"]["resourceVersion"] = json!("42");
        m["metadata"]["uid"] = json!("abc");
        m["metadata"]["managedFields"] = json!([{}]);
        m["status"] = json!({ "readyReplicas": 2 });
        let s = strip_noisy(m);
        assert!(s["metadata"].get("resourceVersion").is_none());
        assert!(s["metadata"].get("uid").is_none());
        assert!(s.get("status").is_none());
        assert!(live_signature(&s).is_some());
    }

    #[test]
    fn secrets_read_back_as_base64_data() {
        let node = ObjectNode::new("creds", "db", ObjectBody::Secret { data: BTreeMap::from([("pw".to_string(), "hunter2".to_string())]) });
        let served = served_form(render_manifest("bd", &node));
        assert!(served.get("stringData").is_none());
        assert_eq!(served["data"]["pw"], "aHVudGVyMg==");
        assert!(!body_drifted("bd", &node, &served));
    }

    #[test]
    fn server_defaults_are_not_drift_but_edits_are() {
        let node = deployment();
        let mut live = served_form(render_manifest("bd", &node));
        live["metadata"]["annotations"]["deployment.kubernetes.io/revision"] = json!("3");
        live["spec"]["strategy"] = json!({ "type": "RollingUpdate" });
        live["spec"]["template"]["spec"]["containers"][0]["terminationMessagePath"] = json!("/dev/termination-log");
        live["spec"]["template"]["spec"]["containers"][0]["env"] = Json::Null;
        live["spec"]["template"]["spec"]["containers"][0]["resources"] = json!({ "limits": { "memory": "2Gi" } });
        assert!(!body_drifted("bd", &node, &live));

        live["spec"]["replicas"] = json!(5);
        assert!(body_drifted("bd", &node, &live));
    }

    #[test]
    fn canonical_quantities_match_their_source_spelling() {
        let mut node = deployment();
        if let ObjectBody::Workload(w) = &mut node.body {
            w.containers[0].resources.cpu_min = Some("1000m".into());
            w.containers[0].resources.memory_max = Some("1024Mi".into());
        }
        let mut live = served_form(render_manifest("bd", &node));
        live["spec"]["template"]["spec"]["containers"][0]["resources"] =
            json!({ "requests": { "cpu": "1" }, "limits": { "memory": "1Gi" } });
        assert!(!body_drifted("bd", &node, &live));

        live["spec"]["template"]["spec"]["containers"][0]["resources"]["requests"]["cpu"] = json!("500m");
        assert!(body_drifted("bd", &node, &live));
        assert_eq!(quantity("150Gi"), Some(150.0 * 1_073_741_824.0));
        assert_eq!(quantity("lots"), None);
    }

    #[test]
    fn route_and_claim_shapes() {
        let route = ObjectNode::new(
            "hub-route",
            "route",
            ObjectBody::Route { endpoint: "hub-webserver".into(), port: "port-443".into(), tls: TlsTermination::Passthrough },
        );
        let m = render_manifest("bd", &route);
        assert_eq!(m["apiVersion"], "route.openshift.io/v1");
        assert_eq!(m["spec"]["tls"]["termination"], "passthrough");

        let pvc = ObjectNode::new("hub-pg", "postgres", ObjectBody::VolumeClaim { size: "150Gi".into(), storage_class: None });
        let m = render_manifest("bd", &pvc);
        assert_eq!(m["kind"], "PersistentVolumeClaim");
        assert_eq!(m["spec"]["resources"]["requests"]["storage"], "150Gi");
        assert!(m["spec"].get("storageClassName").is_none());
    }
}
