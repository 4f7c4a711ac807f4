//! Coordination store readiness
//!
//! The control plane's etcd is started by the machine's boot config, so it
//! may still be coming up when orchestration begins. [`ReadinessGate`] polls
//! a [`StoreHealthProbe`] under a bounded [`RetryConfig`] until enough
//! members report healthy.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use thiserror::Error;
use tracing::{debug, info, info_span, Instrument, Span};

use crate::node::Node;
use crate::retry::{retry_with_backoff, RetryConfig, RetryError};
use crate::{Error, Result};

/// Member report from the coordination store
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreHealth {
    /// Members that answered healthy
    pub healthy_members: usize,
    /// Whether the store considers the cluster healthy as a whole
    pub cluster_healthy: bool,
}

impl StoreHealth {
    /// Parse the output of `etcdctl cluster-health`
    ///
    /// Each `member <id> is healthy` line counts one member and a
    /// `cluster is healthy` line marks the cluster healthy. Anything else is
    /// ignored.
    pub fn from_etcdctl_output(output: &str) -> Self {
        let mut health = StoreHealth::default();
        for line in output.lines().map(str::trim) {
            if line.starts_with("member ") && line.contains(" is healthy") {
                health.healthy_members += 1;
            } else if line == "cluster is healthy" {
                health.cluster_healthy = true;
            }
        }
        health
    }

    /// Whether this report satisfies a target member count
    pub fn meets(&self, target_members: usize) -> bool {
        self.cluster_healthy && self.healthy_members >= target_members
    }
}

impl fmt::Display for StoreHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} members healthy, cluster {}",
            self.healthy_members,
            if self.cluster_healthy { "healthy" } else { "unhealthy" }
        )
    }
}

/// Failure to obtain a health report
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProbeError {
    /// Worth asking again later
    #[error("{0}")]
    Transient(String),

    /// Asking again cannot succeed
    #[error("{0}")]
    Terminal(String),
}

impl ProbeError {
    /// Whether polling should continue after this error
    pub fn is_transient(&self) -> bool {
        matches!(self, ProbeError::Transient(_))
    }
}

/// Query for a node's coordination store health
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StoreHealthProbe: Send + Sync {
    /// Ask the store on `node` for its member report
    async fn check(&self, node: &Node) -> std::result::Result<StoreHealth, ProbeError>;
}

/// Probe running `etcdctl cluster-health` on the node
#[derive(Clone, Debug)]
pub struct EtcdctlProbe {
    command: String,
}

impl Default for EtcdctlProbe {
    fn default() -> Self {
        Self {
            command: "etcdctl cluster-health".to_string(),
        }
    }
}

impl EtcdctlProbe {
    /// Probe with a custom command line, e.g. one passing `--endpoints`
    pub fn with_command(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl StoreHealthProbe for EtcdctlProbe {
    async fn check(&self, node: &Node) -> std::result::Result<StoreHealth, ProbeError> {
        match node.run(&self.command).await {
            Ok(output) => Ok(StoreHealth::from_etcdctl_output(&output)),
            Err(e) if e.message.contains("command not found") => {
                Err(ProbeError::Terminal(e.to_string()))
            }
            Err(e) => Err(ProbeError::Transient(e.to_string())),
        }
    }
}

/// Outcome of one polling attempt that did not pass the gate
#[derive(Debug)]
enum Attempt {
    BelowTarget(StoreHealth),
    Probe(ProbeError),
}

impl Attempt {
    fn is_retryable(&self) -> bool {
        match self {
            Attempt::BelowTarget(_) => true,
            Attempt::Probe(e) => e.is_transient(),
        }
    }
}

impl fmt::Display for Attempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Attempt::BelowTarget(health) => write!(f, "{}", health),
            Attempt::Probe(e) => write!(f, "{}", e),
        }
    }
}

/// Blocks until a node's coordination store has enough healthy members
#[derive(Clone)]
pub struct ReadinessGate {
    probe: Arc<dyn StoreHealthProbe>,
    retry: RetryConfig,
    span: Span,
}

impl ReadinessGate {
    /// Create a gate polling `probe` under the given budget
    pub fn new(probe: Arc<dyn StoreHealthProbe>, retry: RetryConfig) -> Self {
        Self {
            probe,
            retry,
            span: Span::current(),
        }
    }

    /// Attach the span polling is recorded under
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Poll until `target_members` report healthy
    ///
    /// Below-target reports and transient probe failures are retried until
    /// the budget runs out (`HealthCheckTimeout`). A terminal probe failure
    /// ends polling at once (`HealthCheckFailed`).
    pub async fn wait(&self, node: &Node, target_members: usize) -> Result<StoreHealth> {
        let span = info_span!(parent: &self.span, "store_health", node = %node.id());
        async {
            info!(
                address = %node.address(),
                target = target_members,
                max_attempts = self.retry.max_attempts,
                "Waiting for etcd to become healthy"
            );
            let started = Instant::now();

            let result = retry_with_backoff(
                &self.retry,
                "etcd_health",
                || async {
                    let health = self.probe.check(node).await.map_err(Attempt::Probe)?;
                    debug!(%health, "Health report");
                    if health.meets(target_members) {
                        Ok(health)
                    } else {
                        Err(Attempt::BelowTarget(health))
                    }
                },
                Attempt::is_retryable,
            )
            .await;

            match result {
                Ok(health) => {
                    info!(%health, elapsed_ms = started.elapsed().as_millis(), "etcd healthy");
                    Ok(health)
                }
                Err(RetryError::Exhausted { attempts, last }) => Err(Error::HealthCheckTimeout {
                    node: node.id().to_string(),
                    address: node.address().to_string(),
                    attempts,
                    elapsed: started.elapsed(),
                    last: last.to_string(),
                }),
                Err(RetryError::Aborted { error, .. }) => Err(Error::HealthCheckFailed {
                    node: node.id().to_string(),
                    address: node.address().to_string(),
                    reason: error.to_string(),
                }),
            }
        }
        .instrument(span)
        .await
    }
}
