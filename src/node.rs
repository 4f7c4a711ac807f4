//! Nodes and the remote execution seam
//!
//! A [`Node`] is a machine created by an external provisioner. Keystone never
//! creates or destroys machines itself; it only talks to them through a
//! [`RemoteExecutor`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Role a node plays in the cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    /// Runs etcd and the bootstrap control plane
    ControlPlane,
    /// Joins the cluster using the generated kubeconfig
    Worker,
}

impl NodeRole {
    /// Whether this is the control plane role
    pub fn is_control_plane(&self) -> bool {
        matches!(self, NodeRole::ControlPlane)
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::ControlPlane => write!(f, "control-plane"),
            NodeRole::Worker => write!(f, "worker"),
        }
    }
}

impl std::str::FromStr for NodeRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "control-plane" | "controlplane" | "master" => Ok(NodeRole::ControlPlane),
            "worker" => Ok(NodeRole::Worker),
            other => Err(format!(
                "unknown node role '{}', expected control-plane or worker",
                other
            )),
        }
    }
}

/// Failure reported by the remote channel
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("`{command}` failed: {message}")]
pub struct RemoteError {
    /// Command (or file operation) that failed
    pub command: String,
    /// Error output or transport error
    pub message: String,
}

impl RemoteError {
    /// Create a remote error
    pub fn new(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            message: message.into(),
        }
    }
}

/// Point-to-point command and file channel to one node
///
/// This trait abstracts the transport (ssh in production) for testability.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run a shell command on the node and return its captured output
    async fn run(&self, command: &str) -> Result<String, RemoteError>;

    /// Write `content` to the absolute path `dest` with the given mode,
    /// creating parent directories of `dest` only if the transport does so
    async fn install_file(&self, content: &[u8], dest: &str, mode: u32)
        -> Result<(), RemoteError>;
}

/// An externally provisioned machine
#[derive(Clone)]
pub struct Node {
    id: String,
    address: String,
    role: NodeRole,
    executor: Arc<dyn RemoteExecutor>,
}

impl Node {
    /// Create a node handle
    pub fn new(
        id: impl Into<String>,
        address: impl Into<String>,
        role: NodeRole,
        executor: Arc<dyn RemoteExecutor>,
    ) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            role,
            executor,
        }
    }

    /// Machine identity assigned by the provisioner
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Address the node is reachable at
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Role the node was tagged with
    pub fn role(&self) -> NodeRole {
        self.role
    }

    /// Run a command on the node
    pub async fn run(&self, command: &str) -> Result<String, RemoteError> {
        self.executor.run(command).await
    }

    /// Install a file on the node
    pub async fn install_file(
        &self,
        content: &[u8],
        dest: &str,
        mode: u32,
    ) -> Result<(), RemoteError> {
        self.executor.install_file(content, dest, mode).await
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.address)
    }
}
