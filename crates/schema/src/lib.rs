//! Keel schema: versioned product documents, flavor presets and the default/override merger.
//!
//! Documents are strict: unknown fields in a schema version are rejected rather
//! than ignored, so a flag that would silently do nothing is caught at parse time.

#![forbid(unsafe_code)]

pub mod document;
pub mod merge;

pub use document::{from_manifest, from_yaml, AlertSpecV1, BlackDuckSpecV1, OpsSightSpecV1, ProductDocument};
pub use merge::{apply_preset, merge, resolve_config, rewrite_registry, MergeInput};
