use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use hydro_apply::{deploy, load_manifests, DeleteOptions, IgnoreNotFound, LogStatus, Operator};
use hydro_core::{Resource, ResourceKind, DRY_RUN_ALL};
use hydro_install::{run_plan, DispatchConfig, HelmCli, InstallPlan, Installer};
use hydro_kubehub::{KubeResourceClient, ResourceClient};
use hydro_ops::{follow_run, DockerCli};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "hydroctl", version, about = "Deploy functions and install platform components")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: the manifest's, else "default")
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply a function and its triggers, rolling back on failure
    Apply {
        /// Manifest holding exactly one Function
        #[arg(long = "function")]
        function: PathBuf,
        /// Manifest holding the function's Triggers
        #[arg(long = "triggers")]
        triggers: Option<PathBuf>,
        /// Validate server-side without persisting
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
    },
    /// Delete the functions in a manifest; their triggers follow by cascade
    Delete {
        #[arg(long = "function")]
        function: PathBuf,
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
    },
    /// Install prerequisites, then the remaining components through the worker pool
    Install {
        /// Directory holding one chart per component
        #[arg(long = "resources-dir", env = "HYDRO_RESOURCES_DIR")]
        resources_dir: PathBuf,
        /// YAML install plan (default: built-in)
        #[arg(long = "plan")]
        plan: Option<PathBuf>,
        #[arg(long = "workers", env = "HYDRO_INSTALL_WORKERS")]
        workers: Option<usize>,
        #[arg(long = "queue-cap", env = "HYDRO_INSTALL_QUEUE_CAP")]
        queue_cap: Option<usize>,
        #[arg(long = "timeout-secs", env = "HYDRO_INSTALL_TIMEOUT_SECS")]
        timeout_secs: Option<u64>,
        #[arg(long = "settle-secs")]
        settle_secs: Option<u64>,
    },
    /// List installed releases with their status
    Releases,
    /// Follow a container's output until it exits or Ctrl-C
    Logs {
        /// Container id or name
        id: String,
    },
}

fn init_tracing() {
    let env = std::env::var("HYDRO_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("HYDRO_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid HYDRO_METRICS_ADDR; expected host:port");
        }
    }
}

fn dry_run_stages(on: bool) -> Vec<String> {
    if on { vec![DRY_RUN_ALL.to_string()] } else { Vec::new() }
}

fn single_function(path: &std::path::Path, ns: Option<&str>) -> Result<Resource> {
    let mut items = load_manifests(path, ns)?;
    if items.len() != 1 {
        bail!("{}: expected exactly one Function, found {} objects", path.display(), items.len());
    }
    let f = items.remove(0);
    if f.kind != ResourceKind::functions().kind {
        bail!("{}: expected kind Function, found {}", path.display(), f.kind);
    }
    Ok(f)
}

async fn kube_clients(ns: &str) -> Result<(Arc<dyn ResourceClient>, Arc<dyn ResourceClient>)> {
    let client = kube::Client::try_default().await.context("building Kubernetes client")?;
    let functions = KubeResourceClient::discover(client.clone(), &ResourceKind::functions(), Some(ns)).await?;
    let triggers = KubeResourceClient::discover(client, &ResourceKind::triggers(), Some(ns)).await?;
    Ok((Arc::new(functions), Arc::new(triggers)))
}

fn print_json<T: serde::Serialize>(v: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Apply { function, triggers, dry_run } => {
            let ns_flag = cli.namespace.as_deref();
            let f = single_function(&function, ns_flag)?;
            let ns = f.metadata.namespace.clone().unwrap_or_else(|| "default".to_string());
            let trigger_items = match &triggers {
                Some(p) => load_manifests(p, Some(&ns))?,
                None => Vec::new(),
            };
            info!(function = %f.name(), ns = %ns, triggers = trigger_items.len(), dry_run, "apply invoked");
            let (fns, trs) = kube_clients(&ns).await?;
            let status = deploy(fns, trs, f, trigger_items, dry_run_stages(dry_run)).await?;
            match cli.output {
                Output::Human => println!(
                    "function {} {} (uid {})",
                    status.name,
                    status.outcome,
                    status.uid.as_deref().unwrap_or("-")
                ),
                Output::Json => print_json(&status)?,
            }
        }
        Commands::Delete { function, dry_run } => {
            let f = single_function(&function, cli.namespace.as_deref())?;
            let ns = f.metadata.namespace.clone().unwrap_or_else(|| "default".to_string());
            let name = f.name().to_string();
            let (fns, _) = kube_clients(&ns).await?;
            let op = Operator::functions(fns, vec![f]);
            let opts = DeleteOptions {
                dry_run: dry_run_stages(dry_run),
                propagation: hydro_core::Propagation::Foreground,
                pre: Vec::new(),
                post: vec![Arc::new(IgnoreNotFound), Arc::new(LogStatus::scoped("delete"))],
            };
            op.delete(&opts).await?;
            match cli.output {
                Output::Human => println!("function {name} deleted"),
                Output::Json => print_json(&serde_json::json!({ "name": name, "deleted": true }))?,
            }
        }
        Commands::Install { resources_dir, plan, workers, queue_cap, timeout_secs, settle_secs } => {
            let mut plan = match &plan {
                Some(p) => InstallPlan::load(p)?,
                None => InstallPlan::default(),
            };
            if let Some(s) = settle_secs { plan.settle_secs = s; }
            let mut cfg = DispatchConfig::from_env();
            if let Some(w) = workers { cfg.workers = w; }
            if let Some(c) = queue_cap { cfg.queue_capacity = c; }
            if let Some(t) = timeout_secs { cfg.deadline = Duration::from_secs(t); }

            let helm: Arc<dyn Installer> = Arc::new(HelmCli::default());
            info!(prerequisites = plan.prerequisites.len(), components = plan.components.len(), workers = cfg.workers, "install invoked");
            let report = run_plan(resources_dir, helm.clone(), &plan, cfg).await?;

            let releases = match helm.list_releases().await {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %format!("{e:#}"), "listing releases failed");
                    Vec::new()
                }
            };
            match cli.output {
                Output::Human => {
                    for name in &report.dispatch.dropped {
                        println!("dismissed  {name}");
                    }
                    for (c, r) in &report.prerequisites {
                        if let Err(e) = r { println!("failed     {}: {e}", c.name); }
                    }
                    for j in report.dispatch.failed() {
                        if let Err(e) = &j.result { println!("failed     {}: {e}", j.component.name); }
                    }
                    for name in &report.dispatch.abandoned {
                        println!("abandoned  {name}");
                    }
                    if report.dispatch.timed_out {
                        println!("timed out after {:?}; some installs may still be running", report.elapsed);
                    }
                    for r in &releases {
                        println!("{:<28} {:<18} {}", r.name, r.namespace, r.status);
                    }
                }
                Output::Json => print_json(&serde_json::json!({
                    "elapsedMs": report.elapsed.as_millis() as u64,
                    "timedOut": report.dispatch.timed_out,
                    "dropped": report.dispatch.dropped,
                    "abandoned": report.dispatch.abandoned,
                    "succeeded": report.dispatch.succeeded().count(),
                    "failed": report.dispatch.failed().map(|j| j.component.name.clone()).collect::<Vec<_>>(),
                    "releases": releases,
                }))?,
            }
        }
        Commands::Releases => {
            let releases = HelmCli::default().list_releases().await?;
            match cli.output {
                Output::Human => {
                    println!("NAME                         NAMESPACE          REVISION  STATUS");
                    for r in &releases {
                        println!("{:<28} {:<18} {:<9} {}", r.name, r.namespace, r.revision, r.status);
                    }
                }
                Output::Json => print_json(&releases)?,
            }
        }
        Commands::Logs { id } => {
            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_signal.cancel();
                }
            });
            let docker = DockerCli::default();
            let json = cli.output == Output::Json;
            let n = follow_run(&docker, &id, cancel, |line| {
                if json {
                    println!("{}", serde_json::json!({ "container": id, "line": line }));
                } else {
                    println!("{line}");
                }
            })
            .await?;
            info!(container = %id, lines = n, "logs finished");
        }
    }
    Ok(())
}
