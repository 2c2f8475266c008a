//! Object-graph builder: resolve, merge, invoke builders, validate.

use std::time::Instant;

use keel_core::{BuildError, ComponentConfig, ComponentKey, ConfigurationError, KeelError, NodeId, ObjectGraph, ProductSpec};
use keel_schema::{resolve_config, MergeInput};
use metrics::{counter, histogram};
use tracing::{debug, info};

use crate::builder::BuildContext;
use crate::registry::Registry;
use crate::resolve::resolve_components;

/// A component key with its merged configuration, in manifest order.
pub type ResolvedConfigs = Vec<(ComponentKey, ComponentConfig)>;

pub struct GraphBuilder<'r> {
    registry: &'r Registry,
}

impl<'r> GraphBuilder<'r> {
    pub fn new(registry: &'r Registry) -> Self { Self { registry } }

    /// Resolve the component list for `spec` and merge defaults, flavor and overrides for each.
    pub fn configure(&self, spec: &ProductSpec) -> Result<ResolvedConfigs, ConfigurationError> {
        let keys = resolve_components(self.registry, spec)?;
        if let Some(unknown) = spec.overrides.keys().find(|c| !keys.iter().any(|k| &k.component == *c)) {
            return Err(ConfigurationError::UnsupportedField {
                component: unknown.to_string(),
                field: format!("overrides.{}", unknown),
            });
        }
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let builder = self.registry.resolve(&key)?;
            let cfg = resolve_config(MergeInput {
                defaults: builder.defaults(),
                preset: builder.flavor_preset(spec.flavor),
                image_registry: spec.image_registry.as_deref(),
                overrides: spec.overrides.get(&key.component),
                supported: builder.supported_overrides(),
            })?;
            out.push((key, cfg));
        }
        Ok(out)
    }

    /// Invoke every builder and assemble the graph. Any failure discards the whole graph.
    pub fn build(&self, spec: &ProductSpec, configs: &[(ComponentKey, ComponentConfig)]) -> Result<ObjectGraph, BuildError> {
        let ctx = BuildContext::from_spec(spec);
        let mut graph = ObjectGraph::new(spec.id.clone());
        for ps in spec.pull_secrets.iter() {
            graph.declare_external(NodeId::secret(ps.clone()));
        }
        for (key, cfg) in configs.iter() {
            let builder = self
                .registry
                .resolve(key)
                .map_err(|e| BuildError::Builder { component: key.to_string(), reason: e.to_string() })?;
            let nodes = builder.build(cfg, &ctx)?;
            debug!(key = %key, nodes = nodes.len(), "component built");
            for node in nodes {
                graph.insert(node.with_labels(ctx.labels(&key.component)))?;
            }
        }
        graph.validate_references()?;
        graph.topological_order()?;
        Ok(graph)
    }
}

/// Front half of the pipeline: resolve, merge and build.
pub fn compose(registry: &Registry, spec: &ProductSpec) -> Result<ObjectGraph, KeelError> {
    let started = Instant::now();
    let gb = GraphBuilder::new(registry);
    let configs = gb.configure(spec).map_err(|e| e.for_instance(&spec.id))?;
    let graph = gb.build(spec, &configs).map_err(|e| e.for_instance(&spec.id))?;
    histogram!("compose_ms", started.elapsed().as_secs_f64() * 1000.0);
    counter!("compose_total", 1u64);
    info!(instance = %spec.id, product = %spec.product, version = %spec.version, nodes = graph.len(), "graph composed");
    Ok(graph)
}
