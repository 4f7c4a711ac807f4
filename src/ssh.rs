//! `ssh`-backed remote executor
//!
//! Shells out to the system `ssh` client so host keys, agents and
//! `~/.ssh/config` behave exactly as they do for the operator.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::trace;

use crate::config::SshConfig;
use crate::node::{Node, NodeRole, RemoteError, RemoteExecutor};
use crate::provision::shell_quote;

/// Runs commands on one host through the `ssh` binary
#[derive(Clone, Debug)]
pub struct SshExecutor {
    host: String,
    config: SshConfig,
}

impl SshExecutor {
    /// Executor for `host` using the given connection settings
    pub fn new(host: impl Into<String>, config: SshConfig) -> Self {
        Self {
            host: host.into(),
            config,
        }
    }

    /// Build a [`Node`] reached over ssh
    pub fn node(
        id: impl Into<String>,
        address: impl Into<String>,
        role: NodeRole,
        config: &SshConfig,
    ) -> Node {
        let address = address.into();
        let executor = Arc::new(Self::new(address.clone(), config.clone()));
        Node::new(id, address, role, executor)
    }

    /// Arguments passed to `ssh` for a remote command
    pub fn args(&self, command: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.config.connect_timeout_secs),
            "-p".to_string(),
            self.config.port.to_string(),
        ];
        if let Some(identity) = &self.config.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        for option in &self.config.options {
            args.push("-o".to_string());
            args.push(option.clone());
        }
        args.push(format!("{}@{}", self.config.user, self.host));
        args.push("--".to_string());
        args.push(command.to_string());
        args
    }

    async fn exec(&self, command: &str, input: Option<&[u8]>) -> Result<String, RemoteError> {
        trace!(host = %self.host, command = %command, "ssh");
        let spawn_error = |e: std::io::Error| RemoteError::new(command, format!("ssh: {}", e));

        let mut child = Command::new("ssh")
            .args(self.args(command))
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_error)?;

        if let (Some(data), Some(mut stdin)) = (input, child.stdin.take()) {
            stdin.write_all(data).await.map_err(spawn_error)?;
        }

        let output = child.wait_with_output().await.map_err(spawn_error)?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = if stderr.trim().is_empty() {
                stdout.trim()
            } else {
                stderr.trim()
            };
            return Err(RemoteError::new(
                command,
                format!("{} ({})", detail, output.status),
            ));
        }
        Ok(stdout)
    }

    /// Remote command writing stdin to `dest` with `mode`
    pub fn install_command(dest: &str, mode: u32) -> String {
        format!("sudo install -m {:04o} /dev/stdin {}", mode, shell_quote(dest))
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn run(&self, command: &str) -> Result<String, RemoteError> {
        self.exec(command, None).await
    }

    async fn install_file(&self, content: &[u8], dest: &str, mode: u32) -> Result<(), RemoteError> {
        self.exec(&Self::install_command(dest, mode), Some(content))
            .await
            .map(|_| ())
    }
}
