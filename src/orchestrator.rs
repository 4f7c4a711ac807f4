//! Cluster bring-up state machine
//!
//! A single task drives the sequence below. Every transition is logged and
//! published on a watch channel.
//!
//! ```text
//! Validating -> WaitingForStoreHealth -> GeneratingAssets
//!   -> ProvisioningControlPlane -> LaunchingControlPlane
//!   -> ProvisioningWorkers -> LaunchingWorkers -> Running -> Terminated
//! ```
//!
//! Any control-plane failure ends the run in `Failed`. Worker failures are
//! recorded in the [`BootstrapReport`] and never stop sibling workers.

use std::fmt;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument, Span};

use crate::address::{create_url, BootstrapConfig};
use crate::assets::{AssetCollection, AssetGenerator};
use crate::config::OrchestratorConfig;
use crate::health::{ReadinessGate, StoreHealthProbe};
use crate::launch::BootstrapLauncher;
use crate::node::{Node, NodeRole};
use crate::platform::MachineProvisioner;
use crate::provision::NodeProvisioner;
use crate::template::{kubeconfig_text, NodeConfigContext, NodeConfigRenderer};
use crate::{Error, Result, ETCD_CLIENT_PORT};

/// Bring-up phase
///
/// Variants are ordered as a run progresses through them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    /// Checking the initial machine set
    Validating,
    /// Polling the control plane's etcd
    WaitingForStoreHealth,
    /// Deriving the bootstrap config and generating assets
    GeneratingAssets,
    /// Installing bootkube and assets on the control plane
    ProvisioningControlPlane,
    /// Starting bootkube on the control plane
    LaunchingControlPlane,
    /// Creating worker machines and installing bootkube and assets on them
    ProvisioningWorkers,
    /// Starting bootkube on workers
    LaunchingWorkers,
    /// Bring-up finished; waiting for cancellation
    Running,
    /// Cancelled after reaching `Running`
    Terminated,
    /// Bring-up stopped on a control-plane error
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Validating => "Validating",
            Phase::WaitingForStoreHealth => "WaitingForStoreHealth",
            Phase::GeneratingAssets => "GeneratingAssets",
            Phase::ProvisioningControlPlane => "ProvisioningControlPlane",
            Phase::LaunchingControlPlane => "LaunchingControlPlane",
            Phase::ProvisioningWorkers => "ProvisioningWorkers",
            Phase::LaunchingWorkers => "LaunchingWorkers",
            Phase::Running => "Running",
            Phase::Terminated => "Terminated",
            Phase::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// What happened to one worker (or to a batch that never materialized)
#[derive(Debug)]
pub enum WorkerOutcome {
    /// bootkube was started on the worker
    Launched {
        /// Node identity
        node: String,
        /// Node address
        address: String,
    },
    /// Provisioning or launching the worker failed
    Failed {
        /// Node identity
        node: String,
        /// Node address
        address: String,
        /// The failure
        error: Error,
    },
    /// The machine provisioner could not create the requested workers
    NotMaterialized {
        /// Workers that were not created
        requested: usize,
        /// The failure
        error: Error,
    },
}

impl WorkerOutcome {
    fn launched(node: &Node) -> Self {
        WorkerOutcome::Launched {
            node: node.id().to_string(),
            address: node.address().to_string(),
        }
    }

    fn failed(node: &Node, error: Error) -> Self {
        warn!(node = %node.id(), address = %node.address(), error = %error, "Worker failed");
        WorkerOutcome::Failed {
            node: node.id().to_string(),
            address: node.address().to_string(),
            error,
        }
    }

    /// Whether bootkube was started
    pub fn is_launched(&self) -> bool {
        matches!(self, WorkerOutcome::Launched { .. })
    }
}

/// Summary of a bring-up
#[derive(Debug)]
pub struct BootstrapReport {
    /// Control-plane node identity
    pub control_plane: String,
    /// Control-plane address
    pub control_plane_address: String,
    /// Per-worker outcomes, in the order workers were provisioned
    pub workers: Vec<WorkerOutcome>,
    /// Phase the run ended in
    pub phase: Phase,
}

impl BootstrapReport {
    /// Number of workers bootkube was started on
    pub fn launched_workers(&self) -> usize {
        self.workers.iter().filter(|w| w.is_launched()).count()
    }

    /// Whether any worker failed or failed to materialize
    pub fn has_worker_failures(&self) -> bool {
        self.workers.iter().any(|w| !w.is_launched())
    }

    /// Number of workers that did not launch, including ones never created
    pub fn failed_workers(&self) -> usize {
        self.workers
            .iter()
            .map(|w| match w {
                WorkerOutcome::Launched { .. } => 0,
                WorkerOutcome::Failed { .. } => 1,
                WorkerOutcome::NotMaterialized { requested, .. } => *requested,
            })
            .sum()
    }
}

/// External collaborators the orchestrator drives
#[derive(Clone)]
pub struct Collaborators {
    /// Produces the cluster assets
    pub generator: Arc<dyn AssetGenerator>,
    /// Reports the control plane's etcd health
    pub probe: Arc<dyn StoreHealthProbe>,
    /// Creates worker machines; required when workers are requested
    pub machines: Option<Arc<dyn MachineProvisioner>>,
}

/// Drives a cluster from fresh machines to running bootkube
pub struct ClusterOrchestrator {
    nodes: Vec<Node>,
    config: OrchestratorConfig,
    generator: Arc<dyn AssetGenerator>,
    machines: Option<Arc<dyn MachineProvisioner>>,
    gate: ReadinessGate,
    provisioner: NodeProvisioner,
    launcher: BootstrapLauncher,
    phase_tx: watch::Sender<Phase>,
    span: Span,
}

impl ClusterOrchestrator {
    /// Create an orchestrator for the initial machine set
    pub fn new(nodes: Vec<Node>, config: OrchestratorConfig, collaborators: Collaborators) -> Self {
        let (phase_tx, _) = watch::channel(Phase::Validating);
        Self {
            gate: ReadinessGate::new(collaborators.probe, config.store_health.clone()),
            provisioner: NodeProvisioner::new(config.paths.clone()),
            launcher: BootstrapLauncher::new(config.paths.bootkube.clone()),
            nodes,
            config,
            generator: collaborators.generator,
            machines: collaborators.machines,
            phase_tx,
            span: Span::current(),
        }
    }

    /// Record all work, including that of the components, under `span`
    pub fn with_span(mut self, span: Span) -> Self {
        self.gate = self.gate.with_span(span.clone());
        self.provisioner = self.provisioner.with_span(span.clone());
        self.launcher = self.launcher.with_span(span.clone());
        self.span = span;
        self
    }

    /// Observe phase transitions
    pub fn phase_receiver(&self) -> watch::Receiver<Phase> {
        self.phase_tx.subscribe()
    }

    /// Current phase
    pub fn phase(&self) -> Phase {
        *self.phase_tx.borrow()
    }

    fn set_phase(&self, phase: Phase) {
        let previous = self.phase_tx.send_replace(phase);
        info!(from = %previous, to = %phase, "Phase transition");
    }

    /// Bring the cluster up to `Running`
    pub async fn bring_up(&self) -> Result<BootstrapReport> {
        let span = info_span!(parent: &self.span, "bring_up");
        let result = self.bring_up_inner().instrument(span).await;
        if let Err(e) = &result {
            error!(error = %e, node_scoped = e.is_node_scoped(), "Bring-up failed");
            self.set_phase(Phase::Failed);
        }
        result
    }

    /// Bring the cluster up, then stay running until `cancel` fires
    ///
    /// Nothing is torn down on cancellation.
    pub async fn run(&self, cancel: CancellationToken) -> Result<BootstrapReport> {
        let mut report = self.bring_up().await?;
        info!(
            control_plane = %report.control_plane,
            workers = report.launched_workers(),
            "Cluster running, waiting for shutdown"
        );
        cancel.cancelled().await;
        self.set_phase(Phase::Terminated);
        report.phase = Phase::Terminated;
        Ok(report)
    }

    fn validate(&self) -> Result<(&Node, Vec<Node>)> {
        self.config.validate()?;
        let control_planes: Vec<&Node> = self
            .nodes
            .iter()
            .filter(|n| n.role().is_control_plane())
            .collect();
        if control_planes.len() != 1 {
            return Err(Error::InvalidTopology {
                found: control_planes.len(),
            });
        }
        if self.config.workers.count > 0 && self.machines.is_none() {
            return Err(Error::config(format!(
                "{} workers requested but no machine provisioner is configured",
                self.config.workers.count
            )));
        }
        let existing_workers = self
            .nodes
            .iter()
            .filter(|n| n.role() == NodeRole::Worker)
            .cloned()
            .collect();
        Ok((control_planes[0], existing_workers))
    }

    async fn bring_up_inner(&self) -> Result<BootstrapReport> {
        self.set_phase(Phase::Validating);
        let (control_plane, mut workers) = self.validate()?;
        info!(
            node = %control_plane.id(),
            address = %control_plane.address(),
            existing_workers = workers.len(),
            requested_workers = self.config.workers.count,
            "Topology valid"
        );

        self.set_phase(Phase::WaitingForStoreHealth);
        self.gate.wait(control_plane, 1).await?;

        self.set_phase(Phase::GeneratingAssets);
        let bootstrap = BootstrapConfig::from_control_plane(control_plane.address())?;
        let etcd_server = bootstrap.primary_etcd_server().ok_or_else(|| {
            Error::malformed_endpoint(control_plane.address(), "no etcd server derived")
        })?;
        let assets = Arc::new(self.generator.generate(&bootstrap).await?);
        info!(assets = assets.len(), "Assets generated");

        self.set_phase(Phase::ProvisioningControlPlane);
        self.provisioner.provision(control_plane, &assets).await?;

        self.set_phase(Phase::LaunchingControlPlane);
        self.launcher
            .start(
                control_plane,
                &self.provisioner.paths().asset_dir,
                &etcd_server,
                self.config.log_path.as_deref(),
            )
            .await?;

        let mut outcomes = Vec::new();
        if self.config.workers.count > 0 || !workers.is_empty() {
            self.set_phase(Phase::ProvisioningWorkers);
            if self.config.workers.count > 0 {
                let (created, shortfall) = self.materialize_workers(control_plane, &assets).await;
                workers.extend(created);
                outcomes.extend(shortfall);
            }

            let provisioned = self.provision_workers(workers, &assets, &mut outcomes).await;

            self.set_phase(Phase::LaunchingWorkers);
            self.launch_workers(provisioned, &etcd_server, &mut outcomes)
                .await;
        }

        self.set_phase(Phase::Running);
        Ok(BootstrapReport {
            control_plane: control_plane.id().to_string(),
            control_plane_address: control_plane.address().to_string(),
            workers: outcomes,
            phase: Phase::Running,
        })
    }

    /// Render the config workers boot from
    ///
    /// The kubelet on a worker requires the admin kubeconfig, so assets
    /// without one cannot produce a worker config.
    fn worker_user_data(&self, control_plane: &Node, assets: &AssetCollection) -> Result<String> {
        let etcd_endpoint = create_url("http", control_plane.address(), ETCD_CLIENT_PORT)?;
        let kubeconfig = assets.kubeconfig().ok_or_else(|| {
            Error::template("generated assets contain no kubeconfig to embed in the worker config")
        })?;
        let ctx = NodeConfigContext::worker(
            &self.config.kubelet_version,
            etcd_endpoint.as_str().trim_end_matches('/'),
            Some(kubeconfig_text(kubeconfig)?),
        )
        .with_kubeconfig_path(&self.provisioner.paths().kubeconfig);
        Ok(NodeConfigRenderer::new().render(&ctx)?.content)
    }

    /// Ask the machine provisioner for workers booting the worker config
    ///
    /// Whatever could not be created is returned as a `NotMaterialized`
    /// outcome alongside the machines that were.
    async fn materialize_workers(
        &self,
        control_plane: &Node,
        assets: &AssetCollection,
    ) -> (Vec<Node>, Option<WorkerOutcome>) {
        let requested = self.config.workers.count;
        let not_materialized = |error: Error| {
            warn!(requested, error = %error, "Worker machines could not be created");
            WorkerOutcome::NotMaterialized { requested, error }
        };

        let Some(machines) = &self.machines else {
            let error = Error::config("no machine provisioner is configured");
            return (Vec::new(), Some(not_materialized(error)));
        };
        let user_data = match self.worker_user_data(control_plane, assets) {
            Ok(user_data) => user_data,
            Err(error) => return (Vec::new(), Some(not_materialized(error))),
        };

        info!(count = requested, "Creating worker machines");
        match machines.create_workers(&user_data, requested).await {
            Ok(created) if created.len() < requested => {
                let missing = requested - created.len();
                warn!(requested, created = created.len(), "Provisioner created fewer workers than requested");
                let error = Error::machine_provisioning(format!(
                    "provisioner created {} of {} workers",
                    created.len(),
                    requested
                ));
                let outcome = WorkerOutcome::NotMaterialized {
                    requested: missing,
                    error,
                };
                (created, Some(outcome))
            }
            Ok(created) => {
                if created.len() > requested {
                    warn!(requested, created = created.len(), "Provisioner created more workers than requested");
                }
                (created, None)
            }
            Err(error) => (Vec::new(), Some(not_materialized(error))),
        }
    }

    async fn provision_workers(
        &self,
        workers: Vec<Node>,
        assets: &Arc<AssetCollection>,
        outcomes: &mut Vec<WorkerOutcome>,
    ) -> Vec<Node> {
        let results: Vec<std::result::Result<Node, WorkerOutcome>> = stream::iter(workers)
            .map(|node| {
                let assets = Arc::clone(assets);
                async move {
                    match self.provisioner.provision(&node, &assets).await {
                        Ok(()) => Ok(node),
                        Err(error) => Err(WorkerOutcome::failed(&node, error)),
                    }
                }
            })
            .buffered(self.config.workers.concurrency.max(1))
            .collect()
            .await;

        let mut provisioned = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(node) => provisioned.push(node),
                Err(outcome) => outcomes.push(outcome),
            }
        }
        provisioned
    }

    async fn launch_workers(
        &self,
        workers: Vec<Node>,
        etcd_server: &str,
        outcomes: &mut Vec<WorkerOutcome>,
    ) {
        let log_path = self.config.log_path.as_deref();
        let asset_dir = self.provisioner.paths().asset_dir.as_str();
        let launched: Vec<WorkerOutcome> = stream::iter(workers)
            .map(|node| async move {
                match self
                    .launcher
                    .start(&node, asset_dir, etcd_server, log_path)
                    .await
                {
                    Ok(_) => WorkerOutcome::launched(&node),
                    Err(error) => WorkerOutcome::failed(&node, error),
                }
            })
            .buffered(self.config.workers.concurrency.max(1))
            .collect()
            .await;
        outcomes.extend(launched);
    }
}
