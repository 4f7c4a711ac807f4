//! Bootstrap assets
//!
//! An [`AssetCollection`] is the set of certificates, keys and credential
//! bundles bootkube needs. It is generated once per cluster and then copied,
//! never modified, onto every node.

mod kubeconfig;

pub use kubeconfig::{Kubeconfig, KubeconfigSpec};

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::address::BootstrapConfig;
use crate::Result;

/// Logical path of the distinguished client credential bundle
pub const KUBECONFIG_ASSET_PATH: &str = "auth/kubeconfig";

/// A single named artifact
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Asset<'a> {
    /// Logical path relative to the asset root
    pub name: &'a str,
    /// Raw content
    pub data: &'a [u8],
}

impl Asset<'_> {
    /// Whether this is the kubeconfig that goes to the node kubeconfig path
    pub fn is_kubeconfig(&self) -> bool {
        self.name == KUBECONFIG_ASSET_PATH
    }
}

/// Mapping from logical artifact path to content
///
/// Paths are unique; inserting an existing path replaces its content.
/// Iteration order is sorted by path.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AssetCollection {
    assets: BTreeMap<String, Vec<u8>>,
}

impl AssetCollection {
    /// Create an empty collection
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an artifact, returning the previous content for that path
    pub fn insert(&mut self, name: impl Into<String>, data: impl Into<Vec<u8>>) -> Option<Vec<u8>> {
        self.assets.insert(name.into(), data.into())
    }

    /// Builder-style insert
    pub fn with(mut self, name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        self.insert(name, data);
        self
    }

    /// Look up an artifact by logical path
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.assets.get(name).map(Vec::as_slice)
    }

    /// The kubeconfig artifact, if the generator produced one
    pub fn kubeconfig(&self) -> Option<&[u8]> {
        self.get(KUBECONFIG_ASSET_PATH)
    }

    /// Iterate over all artifacts
    pub fn iter(&self) -> impl Iterator<Item = Asset<'_>> {
        self.assets.iter().map(|(name, data)| Asset {
            name: name.as_str(),
            data: data.as_slice(),
        })
    }

    /// Number of artifacts
    pub fn len(&self) -> usize {
        self.assets.len()
    }

    /// Whether the collection is empty
    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    /// Write every artifact below a local directory
    ///
    /// Used by the `assets` subcommand to inspect what would be installed.
    pub async fn write_to_dir(&self, dir: &Path) -> Result<()> {
        for asset in self.iter() {
            let dst = dir.join(asset.name);
            if let Some(parent) = dst.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&dst, asset.data).await?;
        }
        Ok(())
    }
}

/// Produces the cluster's assets from a bootstrap config
///
/// Failures are reported as [`crate::Error::AssetGenerationFailed`] and are
/// not retried.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AssetGenerator: Send + Sync {
    /// Generate the full asset collection
    async fn generate(&self, config: &BootstrapConfig) -> Result<AssetCollection>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_unique_and_last_write_wins() {
        let mut assets = AssetCollection::new();
        assert!(assets.insert("tls/ca.crt", b"one".to_vec()).is_none());
        assert_eq!(
            assets.insert("tls/ca.crt", b"two".to_vec()),
            Some(b"one".to_vec())
        );
        assert_eq!(assets.len(), 1);
        assert_eq!(assets.get("tls/ca.crt"), Some(&b"two"[..]));
    }

    #[test]
    fn kubeconfig_is_distinguished_by_path() {
        let assets = AssetCollection::new()
            .with(KUBECONFIG_ASSET_PATH, "apiVersion: v1")
            .with("tls/ca.crt", "cert");

        assert_eq!(assets.kubeconfig(), Some(&b"apiVersion: v1"[..]));
        let flagged: Vec<_> = assets.iter().filter(|a| a.is_kubeconfig()).collect();
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].name, KUBECONFIG_ASSET_PATH);
    }

    #[tokio::test]
    async fn collection_can_be_written_to_a_local_directory() {
        let dir = tempfile::tempdir().unwrap();
        let assets = AssetCollection::new()
            .with("tls/ca.crt", vec![0u8, 1, 2, 255])
            .with("auth/kubeconfig", "kc");

        assets.write_to_dir(dir.path()).await.unwrap();

        assert_eq!(
            std::fs::read(dir.path().join("tls/ca.crt")).unwrap(),
            vec![0u8, 1, 2, 255]
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("auth/kubeconfig")).unwrap(),
            "kc"
        );
    }
}
