use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use keel_core::{ClusterClient, StorageCluster};
use keel_executor::{ExecutionStrategy, Requeue, RunResult};
use keel_kubehub::{KubeCluster, MemoryCluster};
use keel_operands::{package_builder, OperandContext, OperatorConfig, StorageOperator};
use keel_render::{ContentSource, FsSource, RenderMode};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "keelctl", version, about = "Keel storage cluster operator CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Directory holding one sub-directory per manifest package
    #[arg(long = "manifests", env = "KEEL_MANIFESTS_DIR", global = true)]
    manifests: Option<PathBuf>,

    /// Field manager used for server-side apply
    #[arg(long = "field-manager", env = "KEEL_FIELD_MANAGER", global = true)]
    field_manager: Option<String>,

    /// Run a layer's operands concurrently or one at a time
    #[arg(long = "exec-strategy", env = "KEEL_EXEC_STRATEGY", value_enum, ignore_case = true, global = true)]
    exec_strategy: Option<ExecStrategy>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum ExecStrategy {
    Serial,
    Parallel,
}

impl From<ExecStrategy> for ExecutionStrategy {
    fn from(s: ExecStrategy) -> Self {
        match s {
            ExecStrategy::Serial => ExecutionStrategy::Serial,
            ExecStrategy::Parallel => ExecutionStrategy::Parallel,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the operand layers in execution order
    Plan {
        /// Emit Graphviz dot instead
        #[arg(long = "dot", action = ArgAction::SetTrue)]
        dot: bool,
    },
    /// Render one manifest package for a StorageCluster and print it as YAML
    Render {
        /// Package name, e.g. "node" or "api-manager"
        package: String,
        /// StorageCluster YAML file
        #[arg(long = "cluster")]
        cluster: PathBuf,
        /// Render in deletion order
        #[arg(long = "delete", action = ArgAction::SetTrue)]
        delete: bool,
    },
    /// Run one converge (or teardown) pass for a StorageCluster
    Reconcile {
        /// StorageCluster YAML file
        #[arg(long = "cluster")]
        cluster: PathBuf,
        /// Tear down instead of converging
        #[arg(long = "delete", action = ArgAction::SetTrue)]
        delete: bool,
        /// Apply into an in-memory cluster instead of the API server
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
    },
}

fn init_tracing() {
    let env = std::env::var("KEEL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KEEL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KEEL_METRICS_ADDR; expected host:port");
        }
    }
}

fn load_cluster(path: &Path) -> Result<StorageCluster> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("parsing StorageCluster from {}", path.display()))
}

fn config(cli: &Cli) -> OperatorConfig {
    let mut cfg = OperatorConfig::from_env();
    if let Some(dir) = &cli.manifests {
        cfg.manifests_dir = dir.clone();
    }
    if let Some(fm) = &cli.field_manager {
        cfg.field_manager = fm.clone();
    }
    if let Some(strategy) = cli.exec_strategy {
        cfg.executor.strategy = strategy.into();
    }
    cfg
}

fn context(cfg: &OperatorConfig, client: Arc<dyn ClusterClient>) -> OperandContext {
    let source: Arc<dyn ContentSource> = Arc::new(FsSource::new(&cfg.manifests_dir));
    OperandContext::new(client, source, cfg.images.clone())
}

fn print_run(run: &RunResult, output: Output) -> Result<()> {
    let requeue = match run.requeue {
        Requeue::No => None,
        Requeue::After(d) => Some(d.as_secs()),
    };
    match output {
        Output::Human => {
            println!("{} -> {:?}", run.direction, run.state);
            for o in &run.outcomes {
                let status = match (&o.error, o.ready) {
                    (Some(e), _) => format!("error: {}", e),
                    (None, Some(false)) => "not ready".to_string(),
                    (None, _) => "ok".to_string(),
                };
                println!("  [{}] {:<24} {}", o.layer, o.name, status);
            }
            for ev in &run.events {
                println!("  event {:?} {}: {}", ev.type_, ev.reason, ev.message);
            }
            match requeue {
                Some(s) => println!("requeue after {}s", s),
                None => println!("no requeue"),
            }
        }
        Output::Json => {
            let outcomes: Vec<_> = run
                .outcomes
                .iter()
                .map(|o| {
                    serde_json::json!({
                        "name": o.name,
                        "layer": o.layer,
                        "ready": o.ready,
                        "error": o.error.as_ref().map(|e| e.to_string()),
                    })
                })
                .collect();
            let doc = serde_json::json!({
                "direction": run.direction,
                "state": run.state,
                "outcomes": outcomes,
                "events": run.events,
                "requeueAfterSecs": requeue,
            });
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let cfg = config(&cli);

    match &cli.command {
        Commands::Plan { dot } => {
            let ctx = context(&cfg, Arc::new(MemoryCluster::new()));
            let op = StorageOperator::new(&cfg, &ctx)?;
            let graph = op.graph();
            if *dot {
                print!("{}", graph.to_dot());
                return Ok(());
            }
            match cli.output {
                Output::Human => {
                    for (i, layer) in graph.layer_names().iter().enumerate() {
                        println!("layer {}: {}", i, layer.join(", "));
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&graph.layer_names())?),
            }
        }
        Commands::Render { package, cluster, delete } => {
            let cluster = load_cluster(cluster)?;
            let build = package_builder(package).ok_or_else(|| anyhow!("unknown package {:?}", package))?;
            let ctx = context(&cfg, Arc::new(MemoryCluster::new()));
            let mode = if *delete { RenderMode::Delete } else { RenderMode::Apply };
            info!(package = %package, ?mode, manifests = %cfg.manifests_dir.display(), "render invoked");
            let rendered = ctx.renderer.render(&build(&ctx, &cluster), mode)?;
            match cli.output {
                Output::Human => print!("{}", rendered.to_yaml()?),
                Output::Json => println!("{}", serde_json::to_string_pretty(&rendered.objects)?),
            }
        }
        Commands::Reconcile { cluster, delete, dry_run } => {
            let mut cluster = load_cluster(cluster)?;
            let client: Arc<dyn ClusterClient> = if *dry_run {
                // Owner references need a uid; files written by hand rarely carry one.
                if cluster.metadata.uid.is_none() {
                    cluster.metadata.uid = Some("dry-run".to_string());
                }
                Arc::new(MemoryCluster::new())
            } else {
                Arc::new(KubeCluster::try_default(&cfg.field_manager).await?)
            };
            let ctx = context(&cfg, client);
            let op = StorageOperator::new(&cfg, &ctx)?;

            let cancel = CancellationToken::new();
            let run = {
                let work = async {
                    if *delete {
                        op.teardown(&cluster, &cancel).await
                    } else {
                        op.reconcile(&cluster, &cancel).await
                    }
                };
                tokio::pin!(work);
                loop {
                    tokio::select! {
                        res = &mut work => break res?,
                        _ = signal::ctrl_c(), if !cancel.is_cancelled() => {
                            warn!("interrupt received; cancelling reconcile");
                            cancel.cancel();
                        }
                    }
                }
            };
            print_run(&run, cli.output)?;
        }
    }
    Ok(())
}
