//! Bring-up integration tests through the public API
//!
//! Machines are simulated by in-memory fakes that keep a journal of every
//! command and file written, so the tests can check exactly what a real node
//! would have received. Assets come from the real TLS generator.
//!
//! What these tests verify:
//! - Full control plane + worker bring-up with real assets
//! - The kubeconfig reaches the fixed node path byte-for-byte
//! - Worker user data embeds the same kubeconfig
//! - A refused asset directory fails the node before any asset is written
//! - Invalid topologies leave every machine untouched
//!
//! What these tests do NOT verify:
//! - ssh transport
//! - Whether bootkube actually starts

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;

use keystone::assets::{AssetCollection, KUBECONFIG_ASSET_PATH};
use keystone::config::{NodePaths, OrchestratorConfig};
use keystone::health::{ProbeError, StoreHealth, StoreHealthProbe};
use keystone::node::{Node, NodeRole, RemoteError, RemoteExecutor};
use keystone::orchestrator::{ClusterOrchestrator, Collaborators, Phase, WorkerOutcome};
use keystone::pki::TlsAssetGenerator;
use keystone::platform::MachineProvisioner;
use keystone::provision::NodeProvisioner;
use keystone::retry::RetryConfig;
use keystone::{Error, Result};

// =============================================================================
// Fakes
// =============================================================================

/// In-memory machine: remembers commands and the files written to it
#[derive(Default)]
struct FakeMachine {
    commands: Mutex<Vec<String>>,
    files: Mutex<BTreeMap<String, (Vec<u8>, u32)>>,
    refuse_dir: Option<String>,
}

impl FakeMachine {
    fn refusing(dir: &str) -> Self {
        Self {
            refuse_dir: Some(dir.to_string()),
            ..Default::default()
        }
    }

    fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(path).map(|(c, _)| c.clone())
    }

    fn file_count(&self) -> usize {
        self.files.lock().unwrap().len()
    }
}

#[async_trait]
impl RemoteExecutor for FakeMachine {
    async fn run(&self, command: &str) -> std::result::Result<String, RemoteError> {
        self.commands.lock().unwrap().push(command.to_string());
        if let Some(dir) = &self.refuse_dir {
            if command.starts_with("sudo mkdir") && command.contains(dir.as_str()) {
                return Err(RemoteError::new(command, "Permission denied"));
            }
        }
        Ok(String::new())
    }

    async fn install_file(
        &self,
        content: &[u8],
        dest: &str,
        mode: u32,
    ) -> std::result::Result<(), RemoteError> {
        self.files
            .lock()
            .unwrap()
            .insert(dest.to_string(), (content.to_vec(), mode));
        Ok(())
    }
}

/// etcd that is healthy after a number of polls
struct FakeProbe {
    polls: Mutex<u32>,
    healthy_after: u32,
}

impl FakeProbe {
    fn healthy_after(polls: u32) -> Self {
        Self {
            polls: Mutex::new(0),
            healthy_after: polls,
        }
    }
}

#[async_trait]
impl StoreHealthProbe for FakeProbe {
    async fn check(&self, _node: &Node) -> std::result::Result<StoreHealth, ProbeError> {
        let mut polls = self.polls.lock().unwrap();
        *polls += 1;
        if *polls < self.healthy_after {
            return Err(ProbeError::Transient("connection refused".to_string()));
        }
        Ok(StoreHealth {
            healthy_members: 1,
            cluster_healthy: true,
        })
    }
}

/// Hands out pre-built worker machines and remembers the user data
struct FakeCloud {
    machines: Vec<(String, Arc<FakeMachine>)>,
    user_data: Mutex<Option<String>>,
}

#[async_trait]
impl MachineProvisioner for FakeCloud {
    async fn create_workers(&self, user_data: &str, count: usize) -> Result<Vec<Node>> {
        *self.user_data.lock().unwrap() = Some(user_data.to_string());
        Ok(self
            .machines
            .iter()
            .take(count)
            .enumerate()
            .map(|(i, (id, machine))| {
                Node::new(
                    id.clone(),
                    format!("10.0.1.{}", i + 10),
                    NodeRole::Worker,
                    machine.clone() as Arc<dyn RemoteExecutor>,
                )
            })
            .collect())
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn local_bootkube() -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(b"\x7fELF bootkube").unwrap();
    file
}

fn config(bootkube: &NamedTempFile, workers: usize) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.paths.local_bootkube = bootkube.path().to_path_buf();
    config.workers.count = workers;
    config.workers.concurrency = 2;
    config.store_health = RetryConfig {
        max_attempts: 5,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        backoff_multiplier: 2.0,
    };
    config
}

fn node(id: &str, address: &str, role: NodeRole, machine: &Arc<FakeMachine>) -> Node {
    Node::new(id, address, role, machine.clone() as Arc<dyn RemoteExecutor>)
}

// =============================================================================
// Tests
// =============================================================================

/// Story: One control plane and two workers come up with real assets
#[tokio::test]
async fn story_full_bring_up_with_generated_assets() {
    let bootkube = local_bootkube();
    let control = Arc::new(FakeMachine::default());
    let workers = vec![
        ("worker-a".to_string(), Arc::new(FakeMachine::default())),
        ("worker-b".to_string(), Arc::new(FakeMachine::default())),
    ];
    let cloud = Arc::new(FakeCloud {
        machines: workers.clone(),
        user_data: Mutex::new(None),
    });

    let orchestrator = ClusterOrchestrator::new(
        vec![node("cp", "10.0.0.2", NodeRole::ControlPlane, &control)],
        config(&bootkube, 2),
        Collaborators {
            generator: Arc::new(TlsAssetGenerator::new()),
            probe: Arc::new(FakeProbe::healthy_after(3)),
            machines: Some(cloud.clone()),
        },
    );

    let cancel = CancellationToken::new();
    let mut phases = orchestrator.phase_receiver();
    let trigger = cancel.clone();
    let (report, _) = tokio::join!(orchestrator.run(cancel), async move {
        phases.wait_for(|p| *p == Phase::Running).await.unwrap();
        trigger.cancel();
    });
    let report = report.unwrap();

    assert_eq!(report.phase, Phase::Terminated);
    assert_eq!(report.control_plane_address, "10.0.0.2");
    assert_eq!(report.launched_workers(), 2);

    // Control plane got the executable, the assets and the start command
    assert_eq!(
        control.file("/home/core/bootkube").unwrap(),
        b"\x7fELF bootkube".to_vec()
    );
    assert!(control.file("/home/core/cluster/tls/apiserver.crt").is_some());
    assert!(control.file("/home/core/cluster/auth/kubeconfig").is_none());
    let kubeconfig = control.file("/etc/kubernetes/kubeconfig").unwrap();
    let kubeconfig_text = String::from_utf8(kubeconfig.clone()).unwrap();
    assert!(kubeconfig_text.contains("server: https://10.0.0.2"));
    assert!(control
        .commands()
        .last()
        .unwrap()
        .contains("--etcd-server=http://127.0.0.1:2379"));

    // Workers booted from a config embedding the same kubeconfig
    let user_data = cloud.user_data.lock().unwrap().clone().unwrap();
    assert!(user_data.contains(&STANDARD.encode(&kubeconfig)));
    assert!(user_data.contains("etcd_endpoints: http://10.0.0.2:2379"));

    for (_, machine) in &workers {
        assert_eq!(machine.file("/etc/kubernetes/kubeconfig").unwrap(), kubeconfig);
        assert!(machine
            .commands()
            .iter()
            .any(|c| c.starts_with("sudo nohup bash -c \"/home/core/bootkube start")));
    }
}

/// Story: A refused asset directory names the path and writes nothing
#[tokio::test]
async fn story_refused_directory_writes_no_assets() {
    let machine = Arc::new(FakeMachine::refusing("/home/core/cluster/tls"));
    let node = node("w", "10.0.1.4", NodeRole::Worker, &machine);
    let assets = AssetCollection::new()
        .with("tls/ca.crt", "ca")
        .with("manifests/kube-apiserver.yaml", "kind: Pod")
        .with(KUBECONFIG_ASSET_PATH, "kubeconfig");

    let err = NodeProvisioner::new(NodePaths::default())
        .install_assets(&node, &assets, "/home/core/cluster")
        .await
        .unwrap_err();

    match err {
        Error::AssetInstallFailed { node, path, .. } => {
            assert_eq!(node, "w");
            assert_eq!(path, "/home/core/cluster/tls");
        }
        other => panic!("expected AssetInstallFailed, got {:?}", other),
    }
    assert_eq!(machine.file_count(), 0);
}

/// Story: Two control planes leave every machine untouched
#[tokio::test]
async fn story_invalid_topology_touches_nothing() {
    let bootkube = local_bootkube();
    let a = Arc::new(FakeMachine::default());
    let b = Arc::new(FakeMachine::default());

    let orchestrator = ClusterOrchestrator::new(
        vec![
            node("cp-a", "10.0.0.2", NodeRole::ControlPlane, &a),
            node("cp-b", "10.0.0.3", NodeRole::ControlPlane, &b),
        ],
        config(&bootkube, 0),
        Collaborators {
            generator: Arc::new(TlsAssetGenerator::new()),
            probe: Arc::new(FakeProbe::healthy_after(1)),
            machines: None,
        },
    );

    let err = orchestrator.bring_up().await.unwrap_err();
    assert!(matches!(err, Error::InvalidTopology { found: 2 }));
    for machine in [&a, &b] {
        assert!(machine.commands().is_empty());
        assert_eq!(machine.file_count(), 0);
    }
}

/// Story: A worker that cannot be written to is reported, its sibling launches
#[tokio::test]
async fn story_worker_failure_is_reported_with_context() {
    let bootkube = local_bootkube();
    let control = Arc::new(FakeMachine::default());
    let cloud = Arc::new(FakeCloud {
        machines: vec![
            ("good".to_string(), Arc::new(FakeMachine::default())),
            ("bad".to_string(), Arc::new(FakeMachine::refusing("/etc/kubernetes"))),
        ],
        user_data: Mutex::new(None),
    });

    let orchestrator = ClusterOrchestrator::new(
        vec![node("cp", "10.0.0.2", NodeRole::ControlPlane, &control)],
        config(&bootkube, 2),
        Collaborators {
            generator: Arc::new(TlsAssetGenerator::new()),
            probe: Arc::new(FakeProbe::healthy_after(1)),
            machines: Some(cloud),
        },
    );

    let report = orchestrator.bring_up().await.unwrap();

    assert_eq!(report.launched_workers(), 1);
    let failure = report
        .workers
        .iter()
        .find_map(|w| match w {
            WorkerOutcome::Failed {
                node,
                address,
                error,
            } => Some((node.clone(), address.clone(), error.to_string())),
            _ => None,
        })
        .unwrap();
    assert_eq!(failure.0, "bad");
    assert_eq!(failure.1, "10.0.1.11");
    assert!(failure.2.contains("/etc/kubernetes"));
}
