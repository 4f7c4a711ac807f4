//! Starting bootkube on a node

use tracing::{info, info_span, Instrument, Span};

use crate::node::Node;
use crate::{Error, Result};

/// Starts the bootstrap executable detached on nodes
#[derive(Clone, Debug)]
pub struct BootstrapLauncher {
    executable: String,
    span: Span,
}

impl BootstrapLauncher {
    /// Launcher for the executable installed at `executable` on each node
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            span: Span::current(),
        }
    }

    /// Attach the span launches are recorded under
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Log file used when none is given
    pub fn default_log_path(&self) -> String {
        format!("{}.log", self.executable)
    }

    /// Remote command starting bootkube in the background
    pub fn command(&self, asset_dir: &str, etcd_server: &str, log_path: Option<&str>) -> String {
        let log = log_path
            .map(str::to_string)
            .unwrap_or_else(|| self.default_log_path());
        format!(
            "sudo nohup bash -c \"{} start --asset-dir={} --etcd-server={} &\" >>{} 2>&1",
            self.executable, asset_dir, etcd_server, log
        )
    }

    /// Issue the start command on `node` and return its captured output
    ///
    /// Only issuing the command is checked; whether bootkube keeps running
    /// is not observed.
    pub async fn start(
        &self,
        node: &Node,
        asset_dir: &str,
        etcd_server: &str,
        log_path: Option<&str>,
    ) -> Result<String> {
        let command = self.command(asset_dir, etcd_server, log_path);
        let span = info_span!(parent: &self.span, "launch", node = %node.id());
        async {
            info!(address = %node.address(), command = %command, "Starting bootkube");
            let output = node.run(&command).await.map_err(|e| Error::LaunchFailed {
                node: node.id().to_string(),
                address: node.address().to_string(),
                command: command.clone(),
                reason: e.message,
            })?;
            info!(output = %output.trim(), "bootkube started");
            Ok(output)
        }
        .instrument(span)
        .await
    }
}
