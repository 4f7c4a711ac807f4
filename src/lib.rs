//! Keystone - self-hosted Kubernetes bootstrap orchestrator
//!
//! Keystone brings up a small cluster (one control-plane node plus optional
//! workers) on freshly created machines. A temporary static control plane,
//! started by the bootkube executable, installs the permanent self-hosted one;
//! workers then join using credentials generated for the cluster.
//!
//! # Bring-up Sequence
//!
//! 1. Validate that exactly one control-plane node exists
//! 2. Wait for the control plane's local etcd to report a healthy member
//! 3. Derive the bootstrap config from the control plane's address
//! 4. Generate the cluster assets (certificates, keys, kubeconfig)
//! 5. Install bootkube and the assets on the control plane, then start it
//! 6. Materialize workers with a config embedding the kubeconfig, then
//!    install and start bootkube on each of them
//! 7. Stay running until cancelled
//!
//! # Modules
//!
//! - [`address`] - Endpoint URL composition and certificate alternate names
//! - [`assets`] - Asset collections and the [`assets::AssetGenerator`] seam
//! - [`pki`] - rcgen-backed asset generator
//! - [`node`] - Nodes, roles and the [`node::RemoteExecutor`] seam
//! - [`ssh`] - `ssh`-backed remote executor
//! - [`provision`] - Installs the executable and assets on a node
//! - [`health`] - Readiness gate polling the coordination store
//! - [`launch`] - Starts bootkube detached on a node
//! - [`template`] - Boot-time node configuration rendering
//! - [`platform`] - Worker machine materialization
//! - [`orchestrator`] - The bring-up state machine
//! - [`config`] - YAML configuration
//! - [`retry`] - Bounded retry with backoff
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod address;
pub mod assets;
pub mod config;
pub mod error;
pub mod health;
pub mod launch;
pub mod node;
pub mod orchestrator;
pub mod pki;
pub mod platform;
pub mod provision;
pub mod retry;
pub mod ssh;
pub mod template;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Fixed Node Paths
// =============================================================================
// Every node gets the same layout, so the launcher can reference files the
// provisioner created without passing paths around.

/// Where the bootkube executable is installed on each node
pub const REMOTE_BOOTKUBE_PATH: &str = "/home/core/bootkube";

/// Where bootkube assets are installed on each node
pub const REMOTE_ASSET_DIR: &str = "/home/core/cluster";

/// Kubelet kubeconfig location on each node
pub const NODE_KUBECONFIG_PATH: &str = "/etc/kubernetes/kubeconfig";

/// Default location of the bootkube executable on the operator's machine
pub const LOCAL_BOOTKUBE_PATH: &str = "./data/bootkube";

/// Kubelet version placed in every node's boot configuration
pub const DEFAULT_KUBELET_VERSION: &str = "latest";

/// Client port of the coordination store
pub const ETCD_CLIENT_PORT: u16 = 2379;

/// Port the API server listens on
pub const API_SERVER_PORT: u16 = 443;
