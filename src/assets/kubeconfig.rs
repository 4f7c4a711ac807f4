//! Kubeconfig rendering for the generated client credentials

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

const CLUSTER_NAME: &str = "local";
const USER_NAME: &str = "kubelet";
const CONTEXT_NAME: &str = "kubelet-context";

/// Inputs for a single-cluster, single-user kubeconfig
#[derive(Clone, Debug)]
pub struct KubeconfigSpec<'a> {
    /// API server URL
    pub server: &'a str,
    /// CA certificate PEM
    pub ca_cert_pem: &'a str,
    /// Client certificate PEM
    pub client_cert_pem: &'a str,
    /// Client key PEM
    pub client_key_pem: &'a str,
}

/// Kubeconfig document
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Kubeconfig {
    #[serde(rename = "apiVersion")]
    api_version: String,
    kind: String,
    clusters: Vec<NamedCluster>,
    users: Vec<NamedUser>,
    contexts: Vec<NamedContext>,
    current_context: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct NamedCluster {
    name: String,
    cluster: ClusterEntry,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ClusterEntry {
    server: String,
    certificate_authority_data: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct NamedUser {
    name: String,
    user: UserEntry,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct UserEntry {
    client_certificate_data: String,
    client_key_data: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct NamedContext {
    name: String,
    context: ContextEntry,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct ContextEntry {
    cluster: String,
    user: String,
}

impl Kubeconfig {
    /// Build a kubeconfig embedding the given credentials as base64 data
    pub fn new(spec: &KubeconfigSpec<'_>) -> Self {
        Self {
            api_version: "v1".to_string(),
            kind: "Config".to_string(),
            clusters: vec![NamedCluster {
                name: CLUSTER_NAME.to_string(),
                cluster: ClusterEntry {
                    server: spec.server.to_string(),
                    certificate_authority_data: STANDARD.encode(spec.ca_cert_pem),
                },
            }],
            users: vec![NamedUser {
                name: USER_NAME.to_string(),
                user: UserEntry {
                    client_certificate_data: STANDARD.encode(spec.client_cert_pem),
                    client_key_data: STANDARD.encode(spec.client_key_pem),
                },
            }],
            contexts: vec![NamedContext {
                name: CONTEXT_NAME.to_string(),
                context: ContextEntry {
                    cluster: CLUSTER_NAME.to_string(),
                    user: USER_NAME.to_string(),
                },
            }],
            current_context: CONTEXT_NAME.to_string(),
        }
    }

    /// API server of the current cluster
    pub fn server(&self) -> Option<&str> {
        self.clusters.first().map(|c| c.cluster.server.as_str())
    }

    /// Serialize to YAML
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| Error::asset_generation(format!("failed to serialize kubeconfig: {}", e)))
    }

    /// Parse from YAML
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| Error::config(format!("invalid kubeconfig: {}", e)))
    }
}
