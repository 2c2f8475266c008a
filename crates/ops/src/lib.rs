//! Keel Ops: external package-deployment tooling (Helm v3).

#![forbid(unsafe_code)]

pub mod helm;

pub use helm::{helm_args, parse_major, values_from_configs, HelmTool, PackageTool, HELM, REQUIRED_MAJOR};
