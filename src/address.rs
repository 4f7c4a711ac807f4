//! Endpoint resolution for the bootstrap config
//!
//! Composes the coordination-store and API server URLs for a control-plane
//! node and derives the certificate alternate names from them.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv6Addr};

use serde::{Deserialize, Serialize};
use url::{Host, Url};

use crate::{Error, Result, API_SERVER_PORT, ETCD_CLIENT_PORT};

/// Alternate names placed on the API server certificate
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AltNames {
    /// DNS names, sorted and unique
    pub dns_names: Vec<String>,
    /// IP addresses, sorted and unique
    pub ips: Vec<IpAddr>,
}

/// Configuration handed to the asset generator
///
/// Derived once from the control plane's address and never changed afterwards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootstrapConfig {
    /// Coordination store endpoints
    pub etcd_servers: Vec<Url>,
    /// API server endpoints
    pub api_servers: Vec<Url>,
    /// Alternate names derived from `api_servers`
    pub alt_names: AltNames,
}

impl BootstrapConfig {
    /// Build the config for a control plane reachable at `address`
    ///
    /// The store is node-local, so its endpoint is always loopback. The API
    /// endpoint uses the node's address.
    pub fn from_control_plane(address: &str) -> Result<Self> {
        let etcd_url = create_url("http", "127.0.0.1", ETCD_CLIENT_PORT)?;
        let api_url = create_url("https", address, API_SERVER_PORT)?;

        let api_servers = vec![api_url];
        let alt_names = alt_names_from_urls(&api_servers);
        Ok(Self {
            etcd_servers: vec![etcd_url],
            api_servers,
            alt_names,
        })
    }

    /// The store endpoint bootkube is pointed at, without a trailing slash
    pub fn primary_etcd_server(&self) -> Option<String> {
        self.etcd_servers
            .first()
            .map(|u| u.as_str().trim_end_matches('/').to_string())
    }

    /// The API endpoint placed in the admin kubeconfig
    pub fn primary_api_server(&self) -> Option<String> {
        self.api_servers
            .first()
            .map(|u| u.as_str().trim_end_matches('/').to_string())
    }
}

/// Compose `scheme://host:port` and validate it as a URL with a host
///
/// IPv6 literals are bracketed before composition. The result must parse
/// back to exactly `host` and `port`; an address that smuggles in a path,
/// query, fragment or userinfo is malformed.
pub fn create_url(scheme: &str, host: &str, port: u16) -> Result<Url> {
    let host_part = if host.parse::<Ipv6Addr>().is_ok() {
        format!("[{}]", host)
    } else {
        host.to_string()
    };
    let composed = format!("{}://{}:{}", scheme, host_part, port);

    let url = Url::parse(&composed)
        .map_err(|e| Error::malformed_endpoint(&composed, e.to_string()))?;

    let same_host = match (url.host(), host.parse::<IpAddr>()) {
        (None, _) => return Err(Error::malformed_endpoint(composed, "empty host")),
        (Some(Host::Domain(d)), _) if d.is_empty() => {
            return Err(Error::malformed_endpoint(composed, "empty host"))
        }
        (Some(Host::Ipv4(a)), Ok(ip)) => IpAddr::V4(a) == ip,
        (Some(Host::Ipv6(a)), Ok(ip)) => IpAddr::V6(a) == ip,
        (Some(Host::Domain(d)), Err(_)) => d.eq_ignore_ascii_case(host),
        _ => false,
    };
    if !same_host {
        return Err(Error::malformed_endpoint(
            composed,
            format!("host does not parse back as {:?}", host),
        ));
    }
    if url.port_or_known_default() != Some(port) {
        return Err(Error::malformed_endpoint(composed, "port does not parse back"));
    }
    let extra = !url.username().is_empty()
        || url.password().is_some()
        || !matches!(url.path(), "" | "/")
        || url.query().is_some()
        || url.fragment().is_some();
    if extra {
        return Err(Error::malformed_endpoint(
            composed,
            "endpoint carries more than a host and port",
        ));
    }

    Ok(url)
}

/// Split `host:port`, returning `None` when there is no port to split off
///
/// Bracketed IPv6 hosts are unbracketed.
fn split_host_port(authority: &str) -> Option<&str> {
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        return tail.strip_prefix(':').map(|_| host);
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.parse::<u16>().is_ok() => Some(host),
        _ => None,
    }
}

/// Derive certificate alternate names from a set of endpoints
///
/// Each endpoint's host is split from its port (the raw host is used when
/// there is no port) and classified: IP literals go to `ips`, everything else
/// to `dns_names`. Endpoints without a host contribute nothing. The result
/// does not depend on input order.
pub fn alt_names_from_urls(urls: &[Url]) -> AltNames {
    let mut dns_names = BTreeSet::new();
    let mut ips = BTreeSet::new();

    for url in urls {
        let Some(raw_host) = url.host_str() else {
            continue;
        };
        let authority = match url.port() {
            Some(port) => format!("{}:{}", raw_host, port),
            None => raw_host.to_string(),
        };
        let host = split_host_port(&authority)
            .unwrap_or(raw_host)
            .trim_start_matches('[')
            .trim_end_matches(']');

        match host.parse::<IpAddr>() {
            Ok(ip) => {
                ips.insert(ip);
            }
            Err(_) => {
                dns_names.insert(host.to_string());
            }
        }
    }

    AltNames {
        dns_names: dns_names.into_iter().collect(),
        ips: ips.into_iter().collect(),
    }
}
