//! Keel kubehub: the cluster boundary.
//!
//! Everything that knows about concrete Kubernetes kinds lives here: manifest
//! rendering, the kube-backed [`ClusterClient`], product watchers and an
//! in-memory cluster for tests.

#![forbid(unsafe_code)]

pub mod client;
mod cluster;
pub mod render;
pub mod testing;
mod watch;

pub use client::{ClusterClient, ClusterError, LiveObject, ObjectKey, WorkloadHealth};
pub use cluster::{product_gvk, KubeCluster, PRODUCT_GROUP, PRODUCT_VERSION};
pub use render::{body_drifted, gvk, live_signature, render_manifest, served_form, strip_noisy};
pub use testing::MemoryCluster;
pub use watch::{watch_products, ProductEvent};
