//! PKI for cluster bootstrap assets
//!
//! Generates a fresh cluster CA and the leaf certificates bootkube expects,
//! then packages everything (plus an admin kubeconfig) as an
//! [`AssetCollection`].
//!
//! # Generated Assets
//!
//! - `tls/ca.crt`, `tls/ca.key` - cluster CA
//! - `tls/apiserver.crt`, `tls/apiserver.key` - API server serving cert, SANs
//!   from the bootstrap config plus the in-cluster service names
//! - `tls/kubelet.crt`, `tls/kubelet.key` - kubelet client cert
//! - `tls/etcd-client.crt`, `tls/etcd-client.key` - etcd client cert
//! - `tls/service-account.key`, `tls/service-account.pub` - token signing key
//! - `auth/kubeconfig` - kubeconfig using the kubelet credentials

use std::net::{IpAddr, Ipv4Addr};

use async_trait::async_trait;
use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use thiserror::Error;
use tracing::{debug, info};

use crate::address::BootstrapConfig;
use crate::assets::{AssetCollection, AssetGenerator, Kubeconfig, KubeconfigSpec, KUBECONFIG_ASSET_PATH};

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// A name could not be placed in a certificate
    #[error("invalid subject alternative name '{0}'")]
    InvalidName(String),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// First address of the service CIDR, where the `kubernetes` service lives
pub const API_SERVICE_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 3, 0, 1));

/// In-cluster names of the API server
const API_SERVICE_DNS_NAMES: &[&str] = &[
    "kubernetes",
    "kubernetes.default",
    "kubernetes.default.svc",
    "kubernetes.default.svc.cluster.local",
];

/// A signed leaf certificate and its private key
#[derive(Clone, Debug)]
pub struct IssuedCert {
    /// Certificate PEM
    pub cert_pem: String,
    /// Private key PEM
    pub key_pem: String,
}

/// What a leaf certificate is used for
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CertUsage {
    /// TLS server
    Server,
    /// TLS client
    Client,
}

/// Profile of a leaf certificate to issue
#[derive(Clone, Debug)]
pub struct LeafProfile {
    /// Subject common name
    pub common_name: String,
    /// Subject organization (Kubernetes maps this to a group)
    pub organization: Option<String>,
    /// Subject alternative names
    pub sans: Vec<SanType>,
    /// Extended key usage
    pub usage: CertUsage,
}

/// Self-signed cluster CA
pub struct CertificateAuthority {
    ca_cert_pem: String,
    ca_key_pem: String,
    issuer: Issuer<'static, KeyPair>,
}

impl CertificateAuthority {
    /// Create a new self-signed CA
    pub fn new(common_name: &str) -> Result<Self> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(common_name.to_string()),
        );
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String("keystone".to_string()),
        );
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        // 10 year validity
        params.not_before = rcgen::date_time_ymd(2024, 1, 1);
        params.not_after = rcgen::date_time_ymd(2034, 1, 1);

        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate CA key: {}", e))
        })?;
        let ca_key_pem = key_pair.serialize_pem();

        let cert = params.self_signed(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CA cert: {}", e))
        })?;

        Ok(Self {
            ca_cert_pem: cert.pem(),
            ca_key_pem,
            issuer: Issuer::new(params, key_pair),
        })
    }

    /// CA certificate in PEM format
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// CA private key in PEM format
    pub fn ca_key_pem(&self) -> &str {
        &self.ca_key_pem
    }

    /// Generate a key pair and sign a leaf certificate for it
    pub fn issue(&self, profile: &LeafProfile) -> Result<IssuedCert> {
        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!(
                "failed to generate key for {}: {}",
                profile.common_name, e
            ))
        })?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(profile.common_name.clone()),
        );
        if let Some(org) = &profile.organization {
            dn.push(DnType::OrganizationName, DnValue::Utf8String(org.clone()));
        }
        params.distinguished_name = dn;

        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = match profile.usage {
            CertUsage::Server => vec![
                ExtendedKeyUsagePurpose::ServerAuth,
                ExtendedKeyUsagePurpose::ClientAuth,
            ],
            CertUsage::Client => vec![ExtendedKeyUsagePurpose::ClientAuth],
        };
        params.subject_alt_names = profile.sans.clone();

        params.not_before = rcgen::date_time_ymd(2024, 1, 1);
        params.not_after = rcgen::date_time_ymd(2031, 1, 1);

        let cert = params.signed_by(&key_pair, &self.issuer).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!(
                "failed to sign certificate for {}: {}",
                profile.common_name, e
            ))
        })?;

        Ok(IssuedCert {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }
}

/// Convert a DNS name into a SAN entry
fn dns_san(name: &str) -> Result<SanType> {
    Ia5String::try_from(name.to_string())
        .map(SanType::DnsName)
        .map_err(|_| PkiError::InvalidName(name.to_string()))
}

/// SANs for the API server serving certificate
fn api_server_sans(config: &BootstrapConfig) -> Result<Vec<SanType>> {
    let mut sans = Vec::new();
    for name in &config.alt_names.dns_names {
        sans.push(dns_san(name)?);
    }
    for name in API_SERVICE_DNS_NAMES {
        sans.push(dns_san(name)?);
    }
    for ip in &config.alt_names.ips {
        sans.push(SanType::IpAddress(*ip));
    }
    sans.push(SanType::IpAddress(API_SERVICE_IP));
    Ok(sans)
}

/// Asset generator backed by an in-process CA
#[derive(Clone, Debug, Default)]
pub struct TlsAssetGenerator;

impl TlsAssetGenerator {
    /// Create a new generator
    pub fn new() -> Self {
        Self
    }

    /// Generate all assets synchronously
    pub fn generate_assets(&self, config: &BootstrapConfig) -> crate::Result<AssetCollection> {
        self.build(config)
            .map_err(|e| crate::Error::asset_generation(e.to_string()))
    }

    fn build(&self, config: &BootstrapConfig) -> std::result::Result<AssetCollection, BuildError> {
        let server = config
            .primary_api_server()
            .ok_or(BuildError::NoApiServer)?;

        let ca = CertificateAuthority::new("kube-ca")?;
        debug!("Generated cluster CA");

        let apiserver = ca.issue(&LeafProfile {
            common_name: "kube-apiserver".to_string(),
            organization: None,
            sans: api_server_sans(config)?,
            usage: CertUsage::Server,
        })?;

        let kubelet = ca.issue(&LeafProfile {
            common_name: "kubelet".to_string(),
            organization: Some("system:masters".to_string()),
            sans: Vec::new(),
            usage: CertUsage::Client,
        })?;

        let etcd_client = ca.issue(&LeafProfile {
            common_name: "etcd-client".to_string(),
            organization: None,
            sans: Vec::new(),
            usage: CertUsage::Client,
        })?;

        let service_account = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate service account key: {}", e))
        })?;

        let kubeconfig = Kubeconfig::new(&KubeconfigSpec {
            server: &server,
            ca_cert_pem: ca.ca_cert_pem(),
            client_cert_pem: &kubelet.cert_pem,
            client_key_pem: &kubelet.key_pem,
        })
        .to_yaml()
        .map_err(|e| BuildError::Kubeconfig(e.to_string()))?;

        let assets = AssetCollection::new()
            .with("tls/ca.crt", ca.ca_cert_pem())
            .with("tls/ca.key", ca.ca_key_pem())
            .with("tls/apiserver.crt", apiserver.cert_pem)
            .with("tls/apiserver.key", apiserver.key_pem)
            .with("tls/kubelet.crt", kubelet.cert_pem)
            .with("tls/kubelet.key", kubelet.key_pem)
            .with("tls/etcd-client.crt", etcd_client.cert_pem)
            .with("tls/etcd-client.key", etcd_client.key_pem)
            .with("tls/service-account.key", service_account.serialize_pem())
            .with("tls/service-account.pub", service_account.public_key_pem())
            .with(KUBECONFIG_ASSET_PATH, kubeconfig);

        info!(
            assets = assets.len(),
            server = %server,
            dns_names = ?config.alt_names.dns_names,
            ips = ?config.alt_names.ips,
            "Generated bootstrap assets"
        );
        Ok(assets)
    }
}

#[derive(Debug, Error)]
enum BuildError {
    #[error("bootstrap config has no API server endpoint")]
    NoApiServer,
    #[error(transparent)]
    Pki(#[from] PkiError),
    #[error("{0}")]
    Kubeconfig(String),
}

#[async_trait]
impl AssetGenerator for TlsAssetGenerator {
    async fn generate(&self, config: &BootstrapConfig) -> crate::Result<AssetCollection> {
        let generator = self.clone();
        let config = config.clone();
        tokio::task::spawn_blocking(move || generator.generate_assets(&config))
            .await
            .map_err(|e| crate::Error::asset_generation(format!("generator task failed: {}", e)))?
    }
}
