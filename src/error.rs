//! Error types for the bootstrap orchestrator

use std::time::Duration;

use thiserror::Error;

/// Main error type for Keystone operations
///
/// Every variant that concerns a node carries its identity and address so an
/// operator can diagnose a failure from the message alone.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The initial machine set does not contain exactly one control plane
    #[error("invalid topology: expected exactly 1 control-plane node, found {found}")]
    InvalidTopology {
        /// Number of control-plane nodes that were supplied
        found: usize,
    },

    /// An endpoint could not be composed into a valid URL
    #[error("malformed endpoint '{endpoint}': {reason}")]
    MalformedEndpoint {
        /// The composed endpoint string
        endpoint: String,
        /// Why it was rejected
        reason: String,
    },

    /// The coordination store never reached the target member count
    #[error("etcd on {node} ({address}) not healthy after {attempts} attempts ({elapsed:?}): {last}")]
    HealthCheckTimeout {
        /// Node identity
        node: String,
        /// Node address
        address: String,
        /// Attempts made before giving up
        attempts: u32,
        /// Time spent polling
        elapsed: Duration,
        /// Last observation (report or probe error)
        last: String,
    },

    /// The coordination store reported an error that retrying cannot fix
    #[error("etcd health check failed on {node} ({address}): {reason}")]
    HealthCheckFailed {
        /// Node identity
        node: String,
        /// Node address
        address: String,
        /// Reported failure
        reason: String,
    },

    /// The asset generator failed
    #[error("asset generation failed: {0}")]
    AssetGenerationFailed(String),

    /// Copying the bootstrap executable to a node failed
    #[error("failed to install '{source_path}' to '{dest}' on {node} ({address}): {reason}")]
    TransferFailed {
        /// Node identity
        node: String,
        /// Node address
        address: String,
        /// Local source path
        source_path: String,
        /// Remote destination path
        dest: String,
        /// Underlying failure
        reason: String,
    },

    /// Creating an asset directory or writing an asset on a node failed
    #[error("failed to install asset path '{path}' on {node} ({address}): {reason}")]
    AssetInstallFailed {
        /// Node identity
        node: String,
        /// Node address
        address: String,
        /// Offending remote path (directory or file)
        path: String,
        /// Underlying failure
        reason: String,
    },

    /// The remote command starting bootkube could not be issued
    #[error("could not start bootkube on {node} ({address}) with `{command}`: {reason}")]
    LaunchFailed {
        /// Node identity
        node: String,
        /// Node address
        address: String,
        /// The command that was issued
        command: String,
        /// Underlying failure
        reason: String,
    },

    /// The external machine provisioner could not create workers
    #[error("machine provisioning error: {0}")]
    MachineProvisioning(String),

    /// Node configuration rendering failed
    #[error("template error: {0}")]
    Template(String),

    /// Configuration file or CLI input is invalid
    #[error("config error: {0}")]
    Config(String),

    /// Local I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a malformed endpoint error
    pub fn malformed_endpoint(endpoint: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedEndpoint {
            endpoint: endpoint.into(),
            reason: reason.into(),
        }
    }

    /// Create an asset generation error with the given message
    pub fn asset_generation(msg: impl Into<String>) -> Self {
        Self::AssetGenerationFailed(msg.into())
    }

    /// Create a machine provisioning error with the given message
    pub fn machine_provisioning(msg: impl Into<String>) -> Self {
        Self::MachineProvisioning(msg.into())
    }

    /// Create a template error with the given message
    pub fn template(msg: impl Into<String>) -> Self {
        Self::Template(msg.into())
    }

    /// Create a config error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether this error concerns a single node's installation
    ///
    /// Node-scoped failures on a worker are isolated to that worker; anything
    /// else means no node can be brought up.
    pub fn is_node_scoped(&self) -> bool {
        matches!(
            self,
            Error::TransferFailed { .. }
                | Error::AssetInstallFailed { .. }
                | Error::LaunchFailed { .. }
                | Error::HealthCheckTimeout { .. }
                | Error::HealthCheckFailed { .. }
        )
    }
}
