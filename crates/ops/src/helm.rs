//! Helm v3 invocation. Fails closed: no other major version is driven.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use metrics::counter;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::process::Command;
use tracing::{debug, info};

use keel_core::{ComponentConfig, ComponentKey, ExternalToolError};

pub const HELM: &str = "helm";
pub const REQUIRED_MAJOR: u32 = 3;

/// External package-deployment tool.
#[async_trait]
pub trait PackageTool: Send + Sync {
    /// Run `command args...` with one `--set k=v` per value, returning stdout.
    async fn run(&self, command: &str, args: &[String], values: &BTreeMap<String, String>) -> Result<String, ExternalToolError>;
}

static VERSION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"v([0-9]+)\.[0-9]+\.[0-9]+(\+[0-9a-z]+)?").expect("static regex"));

/// Major version from `helm version --short` output (e.g. `v3.2.1+gfe51cd1`).
pub fn parse_major(output: &str) -> Result<u32, ExternalToolError> {
    let unparsable = || ExternalToolError::UnparsableVersion { tool: HELM.into(), output: output.trim().to_string() };
    let caps = VERSION_RE.captures(output).ok_or_else(unparsable)?;
    caps.get(1).and_then(|m| m.as_str().parse::<u32>().ok()).ok_or_else(unparsable)
}

/// `command args... --set k=v ...`, values in key order.
pub fn helm_args(command: &str, args: &[String], values: &BTreeMap<String, String>) -> Vec<String> {
    let mut out = Vec::with_capacity(1 + args.len() + values.len() * 2);
    out.push(command.to_string());
    out.extend(args.iter().cloned());
    for (k, v) in values.iter() {
        out.push("--set".into());
        out.push(format!("{}={}", k, v));
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelmTool {
    binary: PathBuf,
    major: u32,
}

impl HelmTool {
    /// Find `helm` and check it is v3.
    pub async fn locate() -> Result<Self, ExternalToolError> { Self::locate_binary(PathBuf::from(HELM)).await }

    pub async fn locate_binary(binary: PathBuf) -> Result<Self, ExternalToolError> {
        let output = Command::new(&binary).args(["version", "--short"]).output().await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ExternalToolError::NotInstalled { tool: HELM.into() },
            _ => ExternalToolError::Failed { tool: HELM.into(), args: "version --short".into(), output: e.to_string() },
        })?;
        let text = format!("{}{}", String::from_utf8_lossy(&output.stdout), String::from_utf8_lossy(&output.stderr));
        let major = parse_major(&text)?;
        if major != REQUIRED_MAJOR {
            return Err(ExternalToolError::WrongMajorVersion { tool: HELM.into(), required: REQUIRED_MAJOR, found: major });
        }
        debug!(binary = %binary.display(), major, "helm located");
        Ok(Self { binary, major })
    }

    pub fn major(&self) -> u32 { self.major }
}

#[async_trait]
impl PackageTool for HelmTool {
    async fn run(&self, command: &str, args: &[String], values: &BTreeMap<String, String>) -> Result<String, ExternalToolError> {
        let argv = helm_args(command, args, values);
        info!(command, values = values.len(), "running helm");
        counter!("helm_runs_total", 1u64);
        let failed = |output: String| ExternalToolError::Failed { tool: HELM.into(), args: argv.join(" "), output };
        let out = Command::new(&self.binary).args(&argv).output().await.map_err(|e| failed(e.to_string()))?;
        let stdout = String::from_utf8_lossy(&out.stdout).to_string();
        if !out.status.success() {
            counter!("helm_failures_total", 1u64);
            return Err(failed(format!("{}{}", stdout, String::from_utf8_lossy(&out.stderr))));
        }
        Ok(stdout)
    }
}

/// Flatten resolved configurations into dotted `--set` keys under each component.
pub fn values_from_configs(configs: &[(ComponentKey, ComponentConfig)]) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (key, cfg) in configs.iter() {
        let c = key.component.as_str();
        out.insert(format!("{}.replicas", c), cfg.replicas.to_string());
        for (container, image) in cfg.images.iter() {
            out.insert(format!("{}.image.{}", c, container), image.clone());
        }
        let r = &cfg.resources;
        for (field, v) in [("cpuMin", &r.cpu_min), ("cpuMax", &r.cpu_max), ("memoryMin", &r.memory_min), ("memoryMax", &r.memory_max)] {
            if let Some(v) = v {
                out.insert(format!("{}.resources.{}", c, field), v.clone());
            }
        }
        for e in cfg.env.iter() {
            out.insert(format!("{}.env.{}", c, e.name), e.value.clone());
        }
        if let Some(size) = &cfg.storage_size {
            out.insert(format!("{}.storageSize", c), size.clone());
        }
    }
    out
}
