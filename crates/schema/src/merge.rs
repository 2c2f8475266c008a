//! Default/override merging.
//!
//! Layering order: version defaults, then flavor preset, then image registry
//! rewrite, then user overrides. Scalars take the override when present;
//! collections are replaced wholesale when the override is non-empty and are
//! never concatenated.

use keel_core::{ComponentConfig, ConfigField, ConfigurationError, PartialComponentConfig, ResourcePreset};

/// Apply a flavor preset on top of version defaults.
pub fn apply_preset(cfg: &mut ComponentConfig, preset: &ResourcePreset) {
    if let Some(v) = preset.cpu_min { cfg.resources.cpu_min = Some(v.to_string()); }
    if let Some(v) = preset.cpu_max { cfg.resources.cpu_max = Some(v.to_string()); }
    if let Some(v) = preset.memory_min { cfg.resources.memory_min = Some(v.to_string()); }
    if let Some(v) = preset.memory_max { cfg.resources.memory_max = Some(v.to_string()); }
    if let Some(n) = preset.replicas { cfg.replicas = n; }
}

/// Point every image at `registry`, keeping only the final `name:tag` segment.
pub fn rewrite_registry(cfg: &mut ComponentConfig, registry: &str) {
    let registry = registry.trim_end_matches('/');
    if registry.is_empty() { return; }
    for image in cfg.images.values_mut() {
        let tail = image.rsplit('/').next().unwrap_or(image.as_str()).to_string();
        *image = format!("{}/{}", registry, tail);
    }
}

fn replace_if_set<T: Clone>(dst: &mut Vec<T>, src: &Option<Vec<T>>) {
    if let Some(v) = src {
        if !v.is_empty() { *dst = v.clone(); }
    }
}

/// Merge `overrides` over `defaults`. Fields outside `supported` are refused.
pub fn merge(
    defaults: &ComponentConfig,
    overrides: &PartialComponentConfig,
    supported: &[ConfigField],
) -> Result<ComponentConfig, ConfigurationError> {
    if let Some(field) = overrides.set_fields().into_iter().find(|f| !supported.contains(f)) {
        return Err(ConfigurationError::UnsupportedField {
            component: defaults.component.to_string(),
            field: field.as_str().to_string(),
        });
    }
    let mut out = defaults.clone();
    if let Some(images) = &overrides.images {
        if !images.is_empty() { out.images = images.clone(); }
    }
    if let Some(v) = &overrides.min_cpu { out.resources.cpu_min = Some(v.clone()); }
    if let Some(v) = &overrides.max_cpu { out.resources.cpu_max = Some(v.clone()); }
    if let Some(v) = &overrides.min_memory { out.resources.memory_min = Some(v.clone()); }
    if let Some(v) = &overrides.max_memory { out.resources.memory_max = Some(v.clone()); }
    if let Some(n) = overrides.replicas { out.replicas = n; }
    if let Some(v) = &overrides.storage_size { out.storage_size = Some(v.clone()); }
    replace_if_set(&mut out.env, &overrides.env);
    replace_if_set(&mut out.ports, &overrides.ports);
    replace_if_set(&mut out.volume_mounts, &overrides.volume_mounts);
    replace_if_set(&mut out.probes, &overrides.probes);
    replace_if_set(&mut out.internal_registries, &overrides.internal_registries);
    Ok(out)
}

/// Everything needed to resolve one component's configuration.
pub struct MergeInput<'a> {
    pub defaults: ComponentConfig,
    pub preset: Option<ResourcePreset>,
    pub image_registry: Option<&'a str>,
    pub overrides: Option<&'a PartialComponentConfig>,
    pub supported: &'a [ConfigField],
}

pub fn resolve_config(input: MergeInput<'_>) -> Result<ComponentConfig, ConfigurationError> {
    let mut cfg = input.defaults;
    if let Some(preset) = &input.preset { apply_preset(&mut cfg, preset); }
    if let Some(registry) = input.image_registry { rewrite_registry(&mut cfg, registry); }
    match input.overrides {
        Some(o) => merge(&cfg, o, input.supported),
        None => Ok(cfg),
    }
}
