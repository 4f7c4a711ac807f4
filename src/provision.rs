//! Node provisioning: executable and asset installation
//!
//! Everything is pushed through the node's [`RemoteExecutor`]. There is no
//! atomic mkdir-and-write on the remote side, so all directories are created
//! before the first file is written.
//!
//! [`RemoteExecutor`]: crate::node::RemoteExecutor

use std::collections::BTreeSet;
use std::path::Path;

use tracing::{debug, info, info_span, Instrument, Span};

use crate::assets::AssetCollection;
use crate::config::NodePaths;
use crate::node::Node;
use crate::{Error, Result};

/// Mode for the bootstrap executable
const EXECUTABLE_MODE: u32 = 0o755;

/// Mode for installed assets
const ASSET_MODE: u32 = 0o644;

/// Quote a path for a POSIX shell
pub(crate) fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Parent directory of an absolute remote path
fn remote_parent(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some(("", _)) => Some("/"),
        Some((parent, _)) => Some(parent),
        None => None,
    }
}

/// Installs the bootkube executable and assets on nodes
#[derive(Clone, Debug)]
pub struct NodeProvisioner {
    paths: NodePaths,
    span: Span,
}

impl NodeProvisioner {
    /// Create a provisioner using the given on-node layout
    pub fn new(paths: NodePaths) -> Self {
        Self {
            paths,
            span: Span::current(),
        }
    }

    /// Attach the span all provisioning work is recorded under
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// On-node layout this provisioner installs into
    pub fn paths(&self) -> &NodePaths {
        &self.paths
    }

    /// Install the executable and then the assets, using the configured paths
    pub async fn provision(&self, node: &Node, assets: &AssetCollection) -> Result<()> {
        info!(node = %node.id(), address = %node.address(), "Provisioning bootkube executable");
        self.install_executable(node, &self.paths.local_bootkube, &self.paths.bootkube)
            .await?;

        info!(node = %node.id(), address = %node.address(), "Provisioning bootkube assets");
        self.install_assets(node, assets, &self.paths.asset_dir)
            .await
    }

    /// Copy a local executable to an absolute path on the node
    pub async fn install_executable(
        &self,
        node: &Node,
        local_source: &Path,
        remote_dest: &str,
    ) -> Result<()> {
        let span = info_span!(parent: &self.span, "install_executable", node = %node.id());
        async {
            let transfer_failed = |reason: String| Error::TransferFailed {
                node: node.id().to_string(),
                address: node.address().to_string(),
                source_path: local_source.display().to_string(),
                dest: remote_dest.to_string(),
                reason,
            };

            let content = tokio::fs::read(local_source).await.map_err(|e| {
                transfer_failed(format!("could not read local executable: {}", e))
            })?;

            node.install_file(&content, remote_dest, EXECUTABLE_MODE)
                .await
                .map_err(|e| transfer_failed(e.to_string()))?;

            debug!(bytes = content.len(), dest = %remote_dest, "Executable installed");
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Install every asset under `dest_root`, kubeconfig excepted
    ///
    /// The kubeconfig goes to the node kubeconfig path so the kubelet finds it
    /// without extra flags. All directories are created before any write;
    /// the first failure aborts the install and nothing is rolled back.
    pub async fn install_assets(
        &self,
        node: &Node,
        assets: &AssetCollection,
        dest_root: &str,
    ) -> Result<()> {
        let span = info_span!(parent: &self.span, "install_assets", node = %node.id());
        async {
            let install_failed = |path: &str, reason: String| Error::AssetInstallFailed {
                node: node.id().to_string(),
                address: node.address().to_string(),
                path: path.to_string(),
                reason,
            };

            let destinations: Vec<(String, &[u8])> = assets
                .iter()
                .map(|asset| {
                    let dst = if asset.is_kubeconfig() {
                        self.paths.kubeconfig.clone()
                    } else {
                        format!("{}/{}", dest_root.trim_end_matches('/'), asset.name)
                    };
                    (dst, asset.data)
                })
                .collect();

            let dirs: BTreeSet<&str> = destinations
                .iter()
                .filter_map(|(dst, _)| remote_parent(dst))
                .collect();

            for &dir in &dirs {
                let cmd = format!("sudo mkdir -p {}", shell_quote(dir));
                node.run(&cmd)
                    .await
                    .map_err(|e| install_failed(dir, format!("failed to create directory: {}", e)))?;
            }
            debug!(directories = dirs.len(), "Asset directories created");

            for (dst, data) in &destinations {
                node.install_file(data, dst, ASSET_MODE)
                    .await
                    .map_err(|e| install_failed(dst.as_str(), e.to_string()))?;
            }

            info!(assets = destinations.len(), root = %dest_root, "Assets installed");
            Ok(())
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::KUBECONFIG_ASSET_PATH;
    use crate::node::{MockRemoteExecutor, NodeRole, RemoteError};
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq)]
    enum Op {
        Run(String),
        Write { dest: String, content: Vec<u8>, mode: u32 },
    }

    /// Mock executor that records every operation and succeeds
    fn recording_executor(log: Arc<Mutex<Vec<Op>>>) -> MockRemoteExecutor {
        let mut exec = MockRemoteExecutor::new();
        let run_log = log.clone();
        exec.expect_run().returning(move |cmd| {
            run_log.lock().unwrap().push(Op::Run(cmd.to_string()));
            Ok(String::new())
        });
        exec.expect_install_file().returning(move |content, dest, mode| {
            log.lock().unwrap().push(Op::Write {
                dest: dest.to_string(),
                content: content.to_vec(),
                mode,
            });
            Ok(())
        });
        exec
    }

    fn node_with(exec: MockRemoteExecutor) -> Node {
        Node::new("cp-0", "10.0.0.2", NodeRole::ControlPlane, Arc::new(exec))
    }

    fn provisioner() -> NodeProvisioner {
        NodeProvisioner::new(NodePaths::default())
    }

    #[test]
    fn parents_of_remote_paths() {
        assert_eq!(remote_parent("/home/core/cluster/tls/ca.crt"), Some("/home/core/cluster/tls"));
        assert_eq!(remote_parent("/bootkube"), Some("/"));
        assert_eq!(remote_parent("relative"), None);
    }

    #[test]
    fn shell_quoting_escapes_single_quotes() {
        assert_eq!(shell_quote("/a b"), "'/a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    // =========================================================================
    // Story: Kubeconfig goes where the kubelet looks for it
    // =========================================================================

    #[tokio::test]
    async fn story_kubeconfig_is_redirected_and_content_preserved() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let node = node_with(recording_executor(log.clone()));

        let ca = vec![0u8, 159, 146, 150, 255];
        let assets = AssetCollection::new()
            .with(KUBECONFIG_ASSET_PATH, "apiVersion: v1\nkind: Config\n")
            .with("tls/ca.crt", ca.clone())
            .with("manifests/kube-apiserver.yaml", "kind: Pod");

        provisioner()
            .install_assets(&node, &assets, "/home/core/cluster")
            .await
            .unwrap();

        let writes: Vec<Op> = log
            .lock()
            .unwrap()
            .iter()
            .filter(|op| matches!(op, Op::Write { .. }))
            .cloned()
            .collect();
        assert_eq!(writes.len(), 3);
        assert!(writes.contains(&Op::Write {
            dest: "/etc/kubernetes/kubeconfig".to_string(),
            content: b"apiVersion: v1\nkind: Config\n".to_vec(),
            mode: 0o644,
        }));
        assert!(writes.contains(&Op::Write {
            dest: "/home/core/cluster/tls/ca.crt".to_string(),
            content: ca,
            mode: 0o644,
        }));
        assert!(writes.contains(&Op::Write {
            dest: "/home/core/cluster/manifests/kube-apiserver.yaml".to_string(),
            content: b"kind: Pod".to_vec(),
            mode: 0o644,
        }));
        assert!(!writes.iter().any(|op| matches!(
            op,
            Op::Write { dest, .. } if dest.ends_with("auth/kubeconfig")
        )));
    }

    // =========================================================================
    // Story: Directories exist before anything is written
    // =========================================================================

    #[tokio::test]
    async fn story_all_directories_are_created_before_any_write() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let node = node_with(recording_executor(log.clone()));

        let assets = AssetCollection::new()
            .with("tls/ca.crt", "a")
            .with("tls/apiserver.crt", "b")
            .with("manifests/etcd.yaml", "c")
            .with(KUBECONFIG_ASSET_PATH, "d");

        provisioner()
            .install_assets(&node, &assets, "/home/core/cluster")
            .await
            .unwrap();

        let ops = log.lock().unwrap().clone();
        let last_mkdir = ops.iter().rposition(|op| matches!(op, Op::Run(_))).unwrap();
        let first_write = ops.iter().position(|op| matches!(op, Op::Write { .. })).unwrap();
        assert!(last_mkdir < first_write);

        let mkdirs: Vec<_> = ops
            .iter()
            .filter_map(|op| match op {
                Op::Run(cmd) => Some(cmd.clone()),
                _ => None,
            })
            .collect();
        // tls and manifests share nothing; the kubeconfig needs /etc/kubernetes
        assert_eq!(
            mkdirs,
            vec![
                "sudo mkdir -p '/etc/kubernetes'",
                "sudo mkdir -p '/home/core/cluster/manifests'",
                "sudo mkdir -p '/home/core/cluster/tls'",
            ]
        );
    }

    // =========================================================================
    // Story: A refused directory aborts before any content is written
    // =========================================================================

    #[tokio::test]
    async fn story_refused_directory_names_path_and_writes_nothing() {
        let mut exec = MockRemoteExecutor::new();
        exec.expect_run()
            .returning(|cmd| Err(RemoteError::new(cmd, "permission denied")));
        exec.expect_install_file().times(0);
        let node = node_with(exec);

        let assets = AssetCollection::new().with("secrets/token.key", "secret");
        let err = provisioner()
            .install_assets(&node, &assets, "/home/core/cluster")
            .await
            .unwrap_err();

        match err {
            Error::AssetInstallFailed { node, path, reason, .. } => {
                assert_eq!(node, "cp-0");
                assert_eq!(path, "/home/core/cluster/secrets");
                assert!(reason.contains("permission denied"));
            }
            other => panic!("expected AssetInstallFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_write_names_the_file() {
        let mut exec = MockRemoteExecutor::new();
        exec.expect_run().returning(|_| Ok(String::new()));
        exec.expect_install_file()
            .returning(|_, dest, _| Err(RemoteError::new(format!("install {dest}"), "disk full")));
        let node = node_with(exec);

        let assets = AssetCollection::new().with("tls/ca.crt", "x");
        let err = provisioner()
            .install_assets(&node, &assets, "/home/core/cluster/")
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::AssetInstallFailed { ref path, .. } if path == "/home/core/cluster/tls/ca.crt"
        ));
    }

    // =========================================================================
    // Story: Installing the bootkube executable
    // =========================================================================

    #[tokio::test]
    async fn executable_is_installed_executable() {
        let local = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(local.path(), b"#!/bin/sh\necho bootkube\n").unwrap();

        let mut exec = MockRemoteExecutor::new();
        exec.expect_install_file()
            .withf(|content, dest, mode| {
                content == &b"#!/bin/sh\necho bootkube\n"[..]
                    && dest == "/home/core/bootkube"
                    && *mode == 0o755
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        let node = node_with(exec);

        provisioner()
            .install_executable(&node, local.path(), "/home/core/bootkube")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn missing_local_executable_is_a_transfer_failure() {
        let mut exec = MockRemoteExecutor::new();
        exec.expect_install_file().times(0);
        let node = node_with(exec);

        let err = provisioner()
            .install_executable(&node, Path::new("/nonexistent/bootkube"), "/home/core/bootkube")
            .await
            .unwrap_err();

        match err {
            Error::TransferFailed { source_path, dest, reason, .. } => {
                assert_eq!(source_path, "/nonexistent/bootkube");
                assert_eq!(dest, "/home/core/bootkube");
                assert!(reason.contains("could not read"));
            }
            other => panic!("expected TransferFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn remote_write_failure_is_a_transfer_failure() {
        let local = tempfile::NamedTempFile::new().unwrap();
        let mut exec = MockRemoteExecutor::new();
        exec.expect_install_file()
            .returning(|_, _, _| Err(RemoteError::new("install", "connection closed")));
        let node = node_with(exec);

        let err = provisioner()
            .install_executable(&node, local.path(), "/home/core/bootkube")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TransferFailed { .. }));
        assert!(err.to_string().contains("connection closed"));
    }
}
