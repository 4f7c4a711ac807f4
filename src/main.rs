//! Keystone - self-hosted Kubernetes bootstrap orchestrator

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use keystone::address::BootstrapConfig;
use keystone::assets::AssetGenerator;
use keystone::config::{NodeSpec, OrchestratorConfig};
use keystone::health::EtcdctlProbe;
use keystone::node::{Node, NodeRole};
use keystone::orchestrator::{ClusterOrchestrator, Collaborators, Phase, WorkerOutcome};
use keystone::pki::TlsAssetGenerator;
use keystone::platform::{CommandProvisioner, MachineProvisioner};
use keystone::ssh::SshExecutor;
use keystone::template::render_node_config;
use keystone::{Error, DEFAULT_KUBELET_VERSION};

/// Keystone - bring up a self-hosted Kubernetes cluster on fresh machines
#[derive(Parser, Debug)]
#[command(name = "keystone", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Bring up the cluster and stay running until Ctrl-C
    ///
    /// Waits for etcd on the control plane, generates assets, installs and
    /// starts bootkube on the control plane and then on every worker.
    Up(UpArgs),

    /// Print the cloud-config a node of the given role should boot from
    RenderConfig(RenderConfigArgs),

    /// Generate the cluster assets locally for inspection
    Assets(AssetsArgs),
}

/// `up` arguments
#[derive(Parser, Debug)]
struct UpArgs {
    /// Path to the cluster YAML configuration file
    #[arg(short = 'f', long = "config")]
    config_file: PathBuf,

    /// Number of workers to create, overriding the config file
    #[arg(long, env = "KEYSTONE_WORKERS")]
    workers: Option<usize>,

    /// Local bootkube executable, overriding the config file
    #[arg(long, env = "KEYSTONE_BOOTKUBE")]
    bootkube: Option<PathBuf>,
}

/// `render-config` arguments
#[derive(Parser, Debug)]
struct RenderConfigArgs {
    /// Node role: control-plane or worker
    #[arg(long)]
    role: NodeRole,

    /// etcd endpoint flannel uses (required for workers)
    #[arg(long)]
    etcd_endpoint: Option<String>,

    /// Kubeconfig to embed in the config
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Kubelet version
    #[arg(long, env = "KEYSTONE_KUBELET_VERSION", default_value = DEFAULT_KUBELET_VERSION)]
    kubelet_version: String,
}

/// `assets` arguments
#[derive(Parser, Debug)]
struct AssetsArgs {
    /// Path to the cluster YAML configuration file
    #[arg(short = 'f', long = "config")]
    config_file: PathBuf,

    /// Directory the assets are written to
    #[arg(long)]
    out: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Up(args) => run_up(args).await,
        Commands::RenderConfig(args) => run_render_config(args).await,
        Commands::Assets(args) => run_assets(args).await,
    }
}

/// The single control-plane entry of the config
fn control_plane_spec(config: &OrchestratorConfig) -> Result<&NodeSpec, Error> {
    let control_planes: Vec<&NodeSpec> = config
        .nodes
        .iter()
        .filter(|n| n.role.is_control_plane())
        .collect();
    match control_planes.as_slice() {
        [cp] => Ok(*cp),
        other => Err(Error::InvalidTopology { found: other.len() }),
    }
}

/// Bring the cluster up and wait for Ctrl-C
async fn run_up(args: UpArgs) -> anyhow::Result<()> {
    let mut config = OrchestratorConfig::load(&args.config_file).await?;
    if let Some(workers) = args.workers {
        config.workers.count = workers;
    }
    if let Some(bootkube) = args.bootkube {
        config.paths.local_bootkube = bootkube;
    }
    config.validate()?;

    let nodes: Vec<Node> = config
        .nodes
        .iter()
        .map(|spec| SshExecutor::node(spec.id(), spec.address.clone(), spec.role, &config.ssh))
        .collect();

    let span = info_span!("keystone", config = %args.config_file.display());
    let machines = match &config.workers.provisioner_command {
        Some(command) => Some(Arc::new(
            CommandProvisioner::new(command, config.ssh.clone())?.with_span(span.clone()),
        ) as Arc<dyn MachineProvisioner>),
        None => None,
    };
    let collaborators = Collaborators {
        generator: Arc::new(TlsAssetGenerator::new()),
        probe: Arc::new(EtcdctlProbe::default()),
        machines,
    };

    let orchestrator = ClusterOrchestrator::new(nodes, config, collaborators).with_span(span);

    // Ctrl-C stops a running cluster cleanly; during bring-up it aborts
    let cancel = CancellationToken::new();
    let phases = orchestrator.phase_receiver();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            if *phases.borrow() == Phase::Running {
                trigger.cancel();
            } else {
                warn!(phase = %*phases.borrow(), "Interrupted during bring-up");
                std::process::exit(130);
            }
        }
    });

    let report = orchestrator.run(cancel).await?;

    for outcome in &report.workers {
        match outcome {
            WorkerOutcome::Launched { node, address } => {
                info!(node = %node, address = %address, "Worker launched");
            }
            WorkerOutcome::Failed {
                node,
                address,
                error,
            } => warn!(node = %node, address = %address, error = %error, "Worker failed"),
            WorkerOutcome::NotMaterialized { requested, error } => {
                warn!(requested, error = %error, "Workers were not created");
            }
        }
    }
    info!(
        control_plane = %report.control_plane,
        workers = report.launched_workers(),
        phase = %report.phase,
        "Shut down"
    );

    if report.has_worker_failures() {
        anyhow::bail!("{} worker(s) did not launch", report.failed_workers());
    }
    Ok(())
}

/// Print the cloud-config for a role
async fn run_render_config(args: RenderConfigArgs) -> anyhow::Result<()> {
    let kubeconfig = match &args.kubeconfig {
        Some(path) => Some(tokio::fs::read(path).await.map_err(|e| {
            anyhow::anyhow!("Failed to read kubeconfig {}: {}", path.display(), e)
        })?),
        None => None,
    };

    let rendered = render_node_config(
        args.role,
        &args.kubelet_version,
        args.etcd_endpoint.as_deref(),
        kubeconfig.as_deref(),
    )?;
    println!("{rendered}");
    Ok(())
}

/// Generate assets for the configured control plane into a local directory
async fn run_assets(args: AssetsArgs) -> anyhow::Result<()> {
    let config = OrchestratorConfig::load(&args.config_file).await?;
    let control_plane = control_plane_spec(&config)?;

    let bootstrap = BootstrapConfig::from_control_plane(&control_plane.address)?;
    let assets = TlsAssetGenerator::new().generate(&bootstrap).await?;
    assets.write_to_dir(&args.out).await?;

    for asset in assets.iter() {
        println!("{}", args.out.join(asset.name).display());
    }
    Ok(())
}
