//! Orchestrator configuration
//!
//! Read from a YAML file passed to `keystone up -f`. Every field has a
//! default matching the fixed node layout, so a minimal file only lists the
//! control-plane node:
//!
//! ```yaml
//! nodes:
//!   - id: cp-0
//!     address: 10.0.0.2
//!     role: control-plane
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::node::NodeRole;
use crate::retry::RetryConfig;
use crate::{
    Error, Result, DEFAULT_KUBELET_VERSION, LOCAL_BOOTKUBE_PATH, NODE_KUBECONFIG_PATH,
    REMOTE_ASSET_DIR, REMOTE_BOOTKUBE_PATH,
};

/// Where things live on the operator's machine and on each node
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodePaths {
    /// Local bootkube executable copied to every node
    pub local_bootkube: PathBuf,
    /// Install path of bootkube on the node
    pub bootkube: String,
    /// Asset root on the node
    pub asset_dir: String,
    /// Kubelet kubeconfig on the node
    pub kubeconfig: String,
}

impl Default for NodePaths {
    fn default() -> Self {
        Self {
            local_bootkube: PathBuf::from(LOCAL_BOOTKUBE_PATH),
            bootkube: REMOTE_BOOTKUBE_PATH.to_string(),
            asset_dir: REMOTE_ASSET_DIR.to_string(),
            kubeconfig: NODE_KUBECONFIG_PATH.to_string(),
        }
    }
}

/// A machine that already exists when orchestration starts
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Identity; defaults to the address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Address reachable over ssh
    pub address: String,
    /// Role the machine was created for
    pub role: NodeRole,
}

impl NodeSpec {
    /// Identity used in logs and errors
    pub fn id(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.address)
    }
}

/// How to reach nodes over ssh
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    /// Remote user
    pub user: String,
    /// Remote port
    pub port: u16,
    /// Private key passed with `-i`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<PathBuf>,
    /// Extra `-o` options
    pub options: Vec<String>,
    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: "core".to_string(),
            port: 22,
            identity_file: None,
            options: vec![
                "StrictHostKeyChecking=no".to_string(),
                "UserKnownHostsFile=/dev/null".to_string(),
            ],
            connect_timeout_secs: 10,
        }
    }
}

/// Worker materialization settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    /// Number of workers to create after the control plane is up
    pub count: usize,
    /// How many workers are provisioned at once
    pub concurrency: usize,
    /// Command creating one machine: receives the worker cloud-config on
    /// stdin and prints `{"id": ..., "address": ...}` on stdout
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provisioner_command: Option<Vec<String>>,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            count: 0,
            concurrency: 1,
            provisioner_command: None,
        }
    }
}

/// Top-level configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Machines that exist before orchestration starts
    pub nodes: Vec<NodeSpec>,
    /// ssh settings shared by all nodes
    pub ssh: SshConfig,
    /// Local and on-node paths
    pub paths: NodePaths,
    /// Kubelet version written into node configs
    pub kubelet_version: String,
    /// Polling budget for the control plane's etcd
    pub store_health: RetryConfig,
    /// Worker settings
    pub workers: WorkersConfig,
    /// bootkube log file on each node; defaults to `<bootkube>.log`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_path: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            ssh: SshConfig::default(),
            paths: NodePaths::default(),
            kubelet_version: DEFAULT_KUBELET_VERSION.to_string(),
            store_health: RetryConfig::store_health(),
            workers: WorkersConfig::default(),
            log_path: None,
        }
    }
}

impl OrchestratorConfig {
    /// Parse and validate a YAML document
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| Error::config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML file
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::config(format!("failed to read config file {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Check invariants serde cannot express
    ///
    /// Topology (exactly one control plane) is checked by the orchestrator,
    /// not here, so that it is reported as `InvalidTopology`.
    pub fn validate(&self) -> Result<()> {
        for node in &self.nodes {
            if node.address.trim().is_empty() {
                return Err(Error::config(format!(
                    "node '{}' has an empty address",
                    node.id()
                )));
            }
        }
        if self.workers.concurrency == 0 {
            return Err(Error::config("workers.concurrency must be at least 1"));
        }
        if !self.store_health.is_bounded() {
            return Err(Error::config(
                "store_health.max_attempts must be at least 1",
            ));
        }
        if let Some(cmd) = &self.workers.provisioner_command {
            if cmd.is_empty() {
                return Err(Error::config("workers.provisioner_command must not be empty"));
            }
        }
        Ok(())
    }
}
