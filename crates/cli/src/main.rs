use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use keel_api::{OperatorSettings, Pipeline};
use keel_apply::{plan, Reconciler};
use keel_core::{NodeOutcome, ProductKind, ProductSpec};
use keel_kubehub::{ClusterClient, KubeCluster, MemoryCluster};
use keel_ops::{values_from_configs, HelmTool, PackageTool};
use keel_registry::{GraphBuilder, Registry};

#[derive(Parser, Debug)]
#[command(name = "keelctl", version, about = "Keel: versioned product composer and operator")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace for documents that carry none (and the operator's watch scope)
    #[arg(long = "ns", global = true, env = "KEEL_NAMESPACE")]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compose a product document and print the manifests in apply order
    Render {
        /// Product document (YAML or JSON)
        file: PathBuf,
    },
    /// List registered products, versions and components
    Catalog {
        /// Only this product (blackduck, opssight, alert)
        #[arg(long = "product")]
        product: Option<String>,
    },
    /// Reconcile a product document once against the current cluster
    Apply {
        file: PathBuf,
        /// Preview create/update/unchanged per object without writing
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
        /// With --dry-run: plan against an empty in-memory cluster
        #[arg(long = "offline", action = ArgAction::SetTrue, requires = "dry_run")]
        offline: bool,
    },
    /// Watch product resources and reconcile until interrupted
    Operate,
    /// Install or upgrade a Helm chart with values from a product document
    Chart {
        file: PathBuf,
        /// Chart reference (path or repo/name)
        #[arg(long = "chart")]
        chart: String,
        /// Release name (default: instance name)
        #[arg(long = "release")]
        release: Option<String>,
        /// Print the computed values instead of running helm
        #[arg(long = "print", action = ArgAction::SetTrue)]
        print: bool,
    },
}

fn init_tracing() {
    let env = std::env::var("KEEL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics(addr: Option<&str>) {
    if let Some(addr) = addr {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KEEL_METRICS_ADDR; expected host:port");
        }
    }
}

fn load_spec(path: &Path, namespace: Option<&str>, credential_seed: Option<&str>) -> Result<ProductSpec> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let mut spec = keel_schema::from_yaml(&text, namespace.unwrap_or("default"))
        .with_context(|| format!("parsing {}", path.display()))?;
    spec.credential_seed = credential_seed.map(str::to_string);
    info!(instance = %spec.id, product = %spec.product, version = %spec.version, "product document loaded");
    Ok(spec)
}

fn print_json<T: Serialize>(v: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}

#[derive(Serialize)]
struct CatalogEntry {
    product: ProductKind,
    version: String,
    components: Vec<String>,
}

fn catalog(registry: &Registry, only: Option<ProductKind>) -> Vec<CatalogEntry> {
    let mut out = Vec::new();
    for product in ProductKind::ALL.into_iter().filter(|p| only.map_or(true, |o| o == *p)) {
        for version in registry.versions(product) {
            let components = registry.components(product, &version).iter().map(|c| c.to_string()).collect();
            out.push(CatalogEntry { product, version: version.to_string(), components });
        }
    }
    out
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut settings = OperatorSettings::from_env();
    if cli.namespace.is_some() {
        settings.namespace = cli.namespace.clone();
    }
    init_metrics(settings.metrics_addr.as_deref());
    let registry = Arc::new(keel_products::registry().context("building component registry")?);
    let ns = cli.namespace.as_deref();

    match cli.command {
        Commands::Render { file } => {
            let spec = load_spec(&file, ns, settings.credential_seed.as_deref())?;
            let manifests = keel_api::render(&registry, &spec)?;
            match cli.output {
                Output::Human => {
                    for m in manifests.iter() {
                        print!("---\n{}", serde_yaml::to_string(m)?);
                    }
                }
                Output::Json => print_json(&manifests)?,
            }
        }
        Commands::Catalog { product } => {
            let only = product.as_deref().map(ProductKind::from_str).transpose()?;
            let entries = catalog(&registry, only);
            match cli.output {
                Output::Human => {
                    for e in entries.iter() {
                        println!("{} {} • {}", e.product, e.version, e.components.join(", "));
                    }
                }
                Output::Json => print_json(&entries)?,
            }
        }
        Commands::Apply { file, dry_run, offline } => {
            let spec = load_spec(&file, ns, settings.credential_seed.as_deref())?;
            let graph = keel_registry::compose(&registry, &spec)?;
            if dry_run {
                let cluster: Arc<dyn ClusterClient> = if offline {
                    Arc::new(MemoryCluster::new())
                } else {
                    Arc::new(KubeCluster::connect().await.context("connecting to cluster")?)
                };
                let changes = plan(&graph, cluster.as_ref()).await?;
                match cli.output {
                    Output::Human => {
                        for c in changes.iter() {
                            let s = c.summary;
                            println!("{:<10} {} (+{} ~{} -{})", format!("{:?}", c.action), c.id, s.adds, s.updates, s.removes);
                        }
                    }
                    Output::Json => print_json(&changes)?,
                }
                return Ok(());
            }

            let cluster: Arc<dyn ClusterClient> = Arc::new(KubeCluster::connect().await.context("connecting to cluster")?);
            let pipeline = Pipeline::new(Arc::clone(&registry), cluster, Reconciler::new(settings.retry()));
            let cache = settings.open_cache();
            let cancel = CancellationToken::new();
            let trigger = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupted; skipping remaining objects");
                    trigger.cancel();
                }
            });
            let started = Instant::now();
            let result = pipeline.reconcile(&spec, cache.as_ref(), &cancel).await?;
            info!(instance = %spec.id, took_ms = %started.elapsed().as_millis(), "apply finished");
            match cli.output {
                Output::Human => {
                    for n in result.nodes.iter() {
                        match &n.outcome {
                            NodeOutcome::Failed { error } => println!("{:<10} {} ({})", "Failed", n.id, error),
                            NodeOutcome::Blocked { by } => println!("{:<10} {} (by {})", "Blocked", n.id, by),
                            other => println!("{:<10} {}", format!("{:?}", other), n.id),
                        }
                    }
                    let c = result.counts();
                    println!(
                        "{}: {} created, {} updated, {} unchanged, {} failed, {} blocked, {} skipped",
                        result.status, c.created, c.updated, c.unchanged, c.failed, c.blocked, c.skipped
                    );
                }
                Output::Json => print_json(&result)?,
            }
            if result.has_failures() {
                bail!("{}: apply incomplete: {}", spec.id, result.first_error().unwrap_or_else(|| "blocked objects".into()));
            }
        }
        Commands::Operate => {
            keel_api::run(settings, registry).await?;
        }
        Commands::Chart { file, chart, release, print } => {
            let spec = load_spec(&file, ns, settings.credential_seed.as_deref())?;
            let configs = GraphBuilder::new(&registry).configure(&spec).map_err(|e| e.for_instance(&spec.id))?;
            let values = values_from_configs(&configs);
            if print {
                match cli.output {
                    Output::Human => {
                        for (k, v) in values.iter() {
                            println!("{}={}", k, v);
                        }
                    }
                    Output::Json => print_json(&values)?,
                }
                return Ok(());
            }
            let helm = HelmTool::locate().await.map_err(|e| e.for_instance(&spec.id))?;
            let release = release.unwrap_or_else(|| spec.id.name.clone());
            let args = vec![
                "--install".to_string(),
                release,
                chart,
                "--namespace".to_string(),
                spec.id.namespace.clone(),
                "--version".to_string(),
                spec.version.to_string(),
            ];
            let out = helm.run("upgrade", &args, &values).await.map_err(|e| e.for_instance(&spec.id))?;
            print!("{}", out);
        }
    }
    Ok(())
}
