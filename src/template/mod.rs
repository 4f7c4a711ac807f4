//! Boot-time node configuration
//!
//! Machines are created by an external provisioner and boot from a
//! cloud-config rendered here. The control plane runs a single-member etcd;
//! workers point flannel at the control plane's etcd and get the generated
//! kubeconfig written to disk before the kubelet starts.
//!
//! # Context
//!
//! - `control_plane` - whether to enable etcd and the master node label
//! - `kubelet_version` - kubelet image tag
//! - `etcd_endpoint` - etcd flannel talks to
//! - `kubeconfig_path` - kubeconfig the kubelet is started with
//! - `kubeconfig` - kubeconfig content written via `write_files` (workers)

mod engine;
mod filters;

use std::fmt;

use serde::Serialize;

pub use engine::TemplateEngine;

use crate::node::NodeRole;
use crate::{Error, Result, ETCD_CLIENT_PORT, NODE_KUBECONFIG_PATH};

/// Cloud-config for every node role
pub const CLOUD_CONFIG_TEMPLATE: &str = r#"#cloud-config
{%- if kubeconfig %}
write_files:
  - path: {{ kubeconfig_path }}
    permissions: "0644"
    encoding: b64
    content: {{ kubeconfig | base64_encode }}
{%- endif %}
coreos:
{%- if control_plane %}
  etcd2:
    name: controller
    advertise-client-urls: http://$private_ipv4:2379
    initial-advertise-peer-urls: http://$private_ipv4:2380
    listen-client-urls: http://0.0.0.0:2379
    listen-peer-urls: http://0.0.0.0:2380
    initial-cluster: controller=http://$private_ipv4:2380
{%- endif %}
  flannel:
    etcd_endpoints: {{ etcd_endpoint | required }}
  units:
{%- if control_plane %}
    - name: etcd2.service
      command: start
      runtime: true
{%- endif %}
    - name: flanneld.service
      command: start
      drop-ins:
      - name: 50-network-config.conf
        content: |
          [Service]
          ExecStartPre=/usr/bin/etcdctl --endpoint={{ etcd_endpoint }} set /coreos.com/network/config '{ "Network": "10.2.0.0/16" }'
    - name: docker.service
      drop-ins:
      - name: 50-flannel.conf
        content: |
          [Unit]
          Requires=flanneld.service
          After=flanneld.service
    - name: kubelet.service
      command: start
      content: |
        [Service]
        EnvironmentFile=/etc/environment
        Environment=KUBELET_ACI=quay.io/dan_gillespie/hyperkube-amd64
        Environment=KUBELET_VERSION={{ kubelet_version | required }}
        ExecStartPre=/bin/mkdir -p /etc/kubernetes/manifests
        ExecStartPre=/bin/mkdir -p /srv/kubernetes/manifests
        ExecStartPre=/bin/mkdir -p /etc/kubernetes/checkpoint-secrets
        ExecStart=/usr/lib/coreos/kubelet-wrapper \
          --kubeconfig={{ kubeconfig_path }} \
          --require-kubeconfig \
          --lock-file=/var/run/lock/kubelet.lock \
          --exit-on-lock-contention \
          --pod-manifest-path=/etc/kubernetes/manifests \
          --allow-privileged \
{%- if control_plane %}
          --node-labels=master=true \
{%- endif %}
          --register-node=true \
          --v=4 \
          --cluster_dns=10.3.0.10 \
          --cluster_domain=cluster.local
        Restart=always
        RestartSec=5

        [Install]
        WantedBy=multi-user.target
"#;

/// Values the cloud-config template is rendered with
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NodeConfigContext {
    /// Enables etcd and the master node label
    pub control_plane: bool,
    /// Kubelet image tag
    pub kubelet_version: String,
    /// etcd endpoint flannel uses
    pub etcd_endpoint: String,
    /// Where the kubelet reads its kubeconfig
    pub kubeconfig_path: String,
    /// Kubeconfig written onto the node at boot
    pub kubeconfig: Option<String>,
}

impl NodeConfigContext {
    /// Context for the control plane, which talks to its own local etcd
    pub fn control_plane(kubelet_version: impl Into<String>) -> Self {
        Self {
            control_plane: true,
            kubelet_version: kubelet_version.into(),
            etcd_endpoint: format!("http://127.0.0.1:{}", ETCD_CLIENT_PORT),
            kubeconfig_path: NODE_KUBECONFIG_PATH.to_string(),
            kubeconfig: None,
        }
    }

    /// Context for a worker joining through the control plane's etcd
    pub fn worker(
        kubelet_version: impl Into<String>,
        etcd_endpoint: impl Into<String>,
        kubeconfig: Option<String>,
    ) -> Self {
        Self {
            control_plane: false,
            kubelet_version: kubelet_version.into(),
            etcd_endpoint: etcd_endpoint.into(),
            kubeconfig_path: NODE_KUBECONFIG_PATH.to_string(),
            kubeconfig,
        }
    }

    /// Override the on-node kubeconfig path
    pub fn with_kubeconfig_path(mut self, path: impl Into<String>) -> Self {
        self.kubeconfig_path = path.into();
        self
    }
}

/// Cloud-config text for one node role
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderedNodeConfig {
    /// Role the config was rendered for
    pub role: NodeRole,
    /// cloud-config document
    pub content: String,
}

impl RenderedNodeConfig {
    /// Document text
    pub fn as_str(&self) -> &str {
        &self.content
    }
}

impl fmt::Display for RenderedNodeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.content)
    }
}

/// Renders cloud-config documents for nodes
#[derive(Default)]
pub struct NodeConfigRenderer {
    engine: TemplateEngine,
}

impl NodeConfigRenderer {
    /// Create a renderer
    pub fn new() -> Self {
        Self::default()
    }

    /// Render the cloud-config for a context
    pub fn render(&self, ctx: &NodeConfigContext) -> Result<RenderedNodeConfig> {
        let content = self.engine.render(CLOUD_CONFIG_TEMPLATE, ctx)?;
        let role = if ctx.control_plane {
            NodeRole::ControlPlane
        } else {
            NodeRole::Worker
        };
        Ok(RenderedNodeConfig { role, content })
    }
}

/// Kubeconfig bytes as text for embedding in a node config
pub fn kubeconfig_text(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|e| Error::template(format!("kubeconfig is not valid UTF-8: {}", e)))
}

/// Render the cloud-config for a role
///
/// Workers need the control plane's etcd endpoint; the control plane uses
/// its local etcd unless another endpoint is given. `kubeconfig` must be
/// UTF-8 text.
pub fn render_node_config(
    role: NodeRole,
    kubelet_version: &str,
    etcd_endpoint: Option<&str>,
    kubeconfig: Option<&[u8]>,
) -> Result<RenderedNodeConfig> {
    let kubeconfig = kubeconfig.map(kubeconfig_text).transpose()?;

    let ctx = match role {
        NodeRole::ControlPlane => {
            let mut ctx = NodeConfigContext::control_plane(kubelet_version);
            if let Some(endpoint) = etcd_endpoint {
                ctx.etcd_endpoint = endpoint.to_string();
            }
            ctx.kubeconfig = kubeconfig;
            ctx
        }
        NodeRole::Worker => {
            let endpoint = etcd_endpoint.ok_or_else(|| {
                Error::template("worker config needs the control plane's etcd endpoint")
            })?;
            NodeConfigContext::worker(kubelet_version, endpoint, kubeconfig)
        }
    };

    NodeConfigRenderer::new().render(&ctx)
}
