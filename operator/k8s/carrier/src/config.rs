//! The configuration document of the carrier2 interception proxy.
//!
//! Each proxy listens on one container port and sends traffic to its
//! cluster upstream unless a bridge rule matches. Bridges are kept in a map
//! sorted by name; the first matching bridge in that order wins, and a
//! bridge's rules are evaluated in their declared order.

use gefyra_operator_core::{Error, Result};
use gefyra_operator_k8s_api::{rules::Rule, Container, Tls};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const ERROR_LOG: &str = "/tmp/carrier.log";
pub const PID_FILE: &str = "/tmp/carrier2.pid";
pub const CONFIG_FILE: &str = "/tmp/config.yaml";

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    pub version: u32,
    pub threads: u32,
    pub error_log: String,
    pub pid_file: String,
    pub upgrade_sock: String,
    pub upstream_keepalive_pool_size: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probes: Option<Probes>,
    #[serde(default)]
    pub proxy: Vec<Proxy>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Probes {
    #[serde(rename = "httpGet")]
    pub http_get: Vec<u16>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Proxy {
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<Tls>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_upstream: Option<Vec<String>>,
    #[serde(default)]
    pub bridges: BTreeMap<String, Bridge>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Bridge {
    pub endpoint: String,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("no proxy serves port {0}")]
pub struct NoProxy(pub u16);

impl Default for Config {
    fn default() -> Self {
        Self {
            version: 1,
            threads: 4,
            error_log: ERROR_LOG.to_string(),
            pid_file: PID_FILE.to_string(),
            upgrade_sock: "/tmp/carrier2.sock".to_string(),
            upstream_keepalive_pool_size: 100,
            probes: None,
            proxy: Vec::new(),
        }
    }
}

// === impl Config ===

impl Config {
    /// Builds the document for `container`: one proxy per container port,
    /// each forwarding to the same port of `upstream_host`.
    pub fn for_container(container: &Container, upstream_host: &str, tls: Option<&Tls>) -> Self {
        let proxy = container
            .ports
            .iter()
            .flatten()
            .filter_map(|p| u16::try_from(p.container_port).ok())
            .map(|port| Proxy {
                port,
                tls: tls.cloned(),
                cluster_upstream: Some(vec![format!("{upstream_host}:{port}")]),
                bridges: BTreeMap::new(),
            })
            .collect();
        let http_get = http_probe_ports(container);
        Self {
            probes: (!http_get.is_empty()).then_some(Probes { http_get }),
            proxy,
            ..Default::default()
        }
    }

    /// Serializes the document.
    ///
    /// Goes through JSON values so that rule predicates are written as
    /// single-key maps rather than YAML tags.
    pub fn to_yaml(&self) -> Result<String> {
        let value = serde_json::to_value(self)?;
        Ok(serde_yaml::to_string(&value)?)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let value = serde_yaml::from_str::<serde_json::Value>(raw)?;
        Ok(serde_json::from_value(value)?)
    }

    pub fn proxy_mut(&mut self, port: u16) -> Option<&mut Proxy> {
        self.proxy.iter_mut().find(|p| p.port == port)
    }

    /// Adds or replaces the named bridge of the proxy serving `port`.
    pub fn upsert_bridge(&mut self, port: u16, name: &str, bridge: Bridge) -> Result<(), NoProxy> {
        let proxy = self.proxy_mut(port).ok_or(NoProxy(port))?;
        proxy.bridges.insert(name.to_string(), bridge);
        Ok(())
    }

    /// Drops every bridge sending traffic to `endpoint`. Returns whether
    /// anything changed.
    pub fn remove_endpoint(&mut self, port: u16, endpoint: &str) -> bool {
        let Some(proxy) = self.proxy_mut(port) else {
            return false;
        };
        let before = proxy.bridges.len();
        proxy.bridges.retain(|_, b| b.endpoint != endpoint);
        proxy.bridges.len() != before
    }

    pub fn has_endpoint(&self, port: u16, endpoint: &str) -> bool {
        self.proxy
            .iter()
            .filter(|p| p.port == port)
            .flat_map(|p| p.bridges.values())
            .any(|b| b.endpoint == endpoint)
    }

    /// Whether any proxy has somewhere to send unmatched traffic.
    pub fn has_upstream(&self) -> bool {
        self.proxy
            .iter()
            .any(|p| p.cluster_upstream.as_ref().map_or(false, |u| !u.is_empty()))
    }
}

/// Ports of the container's HTTP probes. Named ports are resolved against
/// the container's ports.
pub fn http_probe_ports(container: &Container) -> Vec<u16> {
    let mut ports = Vec::new();
    for probe in gefyra_operator_k8s_api::pod::probes(container) {
        let Some(http) = probe.http_get.as_ref() else {
            continue;
        };
        let port = match &http.port {
            IntOrString::Int(port) => u16::try_from(*port).ok(),
            IntOrString::String(name) => container
                .ports
                .iter()
                .flatten()
                .find(|p| p.name.as_deref() == Some(name.as_str()))
                .and_then(|p| u16::try_from(p.container_port).ok()),
        };
        if let Some(port) = port {
            if !ports.contains(&port) {
                ports.push(port);
            }
        }
    }
    ports
}

/// Fails for probes the proxy cannot answer on behalf of the container.
pub fn check_probes(container: &Container) -> Result<()> {
    for probe in gefyra_operator_k8s_api::pod::probes(container) {
        if probe.exec.is_some() {
            return Err(Error::permanent(format!(
                "exec probes of container {} are not supported",
                container.name
            )));
        }
        if probe.tcp_socket.is_some() {
            return Err(Error::permanent(format!(
                "tcpSocket probes of container {} are not supported",
                container.name
            )));
        }
    }
    Ok(())
}
