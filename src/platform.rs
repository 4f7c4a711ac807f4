//! Worker machine materialization
//!
//! Keystone does not create machines itself. Workers are requested from a
//! [`MachineProvisioner`] with the rendered worker cloud-config as user data,
//! and come back as [`Node`]s ready for provisioning.

use std::process::Stdio;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{info, info_span, Instrument, Span};

use crate::config::SshConfig;
use crate::node::{Node, NodeRole};
use crate::ssh::SshExecutor;
use crate::{Error, Result};

/// Environment variable carrying the worker index to the provisioner command
pub const WORKER_INDEX_ENV: &str = "KEYSTONE_WORKER_INDEX";

/// Creates worker machines booted from the given user data
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MachineProvisioner: Send + Sync {
    /// Create `count` machines booting from `user_data`
    async fn create_workers(&self, user_data: &str, count: usize) -> Result<Vec<Node>>;
}

/// What the provisioner command prints for each machine
#[derive(Debug, Deserialize)]
struct CreatedMachine {
    id: String,
    address: String,
}

/// Runs an operator command once per worker
///
/// The command gets the user data on stdin and the worker index in
/// `KEYSTONE_WORKER_INDEX`, and must print `{"id": "...", "address": "..."}`
/// as the last line of stdout once the machine is reachable.
#[derive(Clone, Debug)]
pub struct CommandProvisioner {
    program: String,
    args: Vec<String>,
    ssh: SshConfig,
    span: Span,
}

impl CommandProvisioner {
    /// Provisioner running `command` (program followed by arguments)
    pub fn new(command: &[String], ssh: SshConfig) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| Error::config("provisioner command must not be empty"))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            ssh,
            span: Span::current(),
        })
    }

    /// Attach the span machine creation is recorded under
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    async fn create_one(&self, user_data: &str, index: usize) -> Result<Node> {
        let failed = |msg: String| {
            Error::machine_provisioning(format!(
                "`{}` for worker {}: {}",
                self.command_line(),
                index,
                msg
            ))
        };

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env(WORKER_INDEX_ENV, index.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| failed(format!("failed to start: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(user_data.as_bytes())
                .await
                .map_err(|e| failed(format!("failed to write user data: {}", e)))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| failed(e.to_string()))?;
        if !output.status.success() {
            return Err(failed(format!(
                "{}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let last = stdout
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .ok_or_else(|| failed("printed nothing".to_string()))?;
        let machine: CreatedMachine = serde_json::from_str(last.trim())
            .map_err(|e| failed(format!("unexpected output '{}': {}", last.trim(), e)))?;
        if machine.address.trim().is_empty() {
            return Err(failed(format!("machine '{}' has no address", machine.id)));
        }

        info!(worker = index, id = %machine.id, address = %machine.address, "Worker machine created");
        Ok(SshExecutor::node(
            machine.id,
            machine.address,
            NodeRole::Worker,
            &self.ssh,
        ))
    }
}

#[async_trait]
impl MachineProvisioner for CommandProvisioner {
    async fn create_workers(&self, user_data: &str, count: usize) -> Result<Vec<Node>> {
        let span = info_span!(parent: &self.span, "create_workers", count);
        async {
            let mut nodes = Vec::with_capacity(count);
            for index in 0..count {
                nodes.push(self.create_one(user_data, index).await?);
            }
            Ok(nodes)
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandProvisioner {
        let command = vec!["sh".to_string(), "-c".to_string(), script.to_string()];
        CommandProvisioner::new(&command, SshConfig::default()).unwrap()
    }

    #[test]
    fn empty_command_is_rejected() {
        let err = CommandProvisioner::new(&[], SshConfig::default()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn command_runs_once_per_worker() {
        let provisioner = sh(r#"cat >/dev/null; echo "creating"; echo "{\"id\":\"w-$KEYSTONE_WORKER_INDEX\",\"address\":\"10.0.1.$KEYSTONE_WORKER_INDEX\"}""#);

        let nodes = provisioner.create_workers("#cloud-config\n", 2).await.unwrap();

        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].id(), "w-0");
        assert_eq!(nodes[1].address(), "10.0.1.1");
        assert!(nodes.iter().all(|n| n.role() == NodeRole::Worker));
    }

    #[tokio::test]
    async fn user_data_arrives_on_stdin() {
        let provisioner = sh(r#"grep -q '^#cloud-config' && echo '{"id":"w","address":"10.0.1.5"}'"#);

        let nodes = provisioner
            .create_workers("#cloud-config\nwrite_files: []\n", 1)
            .await
            .unwrap();
        assert_eq!(nodes[0].address(), "10.0.1.5");
    }

    #[tokio::test]
    async fn zero_workers_runs_nothing() {
        let provisioner = sh("exit 1");
        assert!(provisioner.create_workers("", 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failing_command_is_machine_provisioning_error() {
        let provisioner = sh("cat >/dev/null; echo 'quota exceeded' >&2; exit 3");

        let err = provisioner.create_workers("#cloud-config\n", 1).await.unwrap_err();
        assert!(matches!(err, Error::MachineProvisioning(_)));
        assert!(err.to_string().contains("quota exceeded"));
    }

    #[tokio::test]
    async fn unparseable_output_is_rejected() {
        let provisioner = sh("cat >/dev/null; echo 'machine ready'");

        let err = provisioner.create_workers("#cloud-config\n", 1).await.unwrap_err();
        assert!(err.to_string().contains("machine ready"));
    }
}
