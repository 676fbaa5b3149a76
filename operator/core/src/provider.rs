//! Interfaces of the pluggable providers the state machines drive.

use crate::{Error, Result};
use gefyra_operator_k8s_api::{
    rules::Rule, GefyraBridgeMount, MountParameters, PeerStatus, ResourceExt, TargetRef,
};
use std::collections::BTreeMap;

/// Terminates tunnel peers and relays traffic from the cluster to them.
#[async_trait::async_trait]
pub trait ConnectionProvider: Send + Sync {
    async fn install(&self) -> Result<()>;

    async fn installed(&self) -> Result<bool>;

    async fn uninstall(&self) -> Result<()>;

    async fn ready(&self) -> Result<bool>;

    async fn add_peer(&self, peer: &str, params: &BTreeMap<String, String>) -> Result<()>;

    async fn remove_peer(&self, peer: &str) -> Result<()>;

    async fn peer_exists(&self, peer: &str) -> Result<bool>;

    /// The connection details handed to the peer, as `Section.Key` pairs.
    async fn get_peer_config(&self, peer: &str) -> Result<BTreeMap<String, String>>;

    /// Exposes `host:port` of a peer inside the cluster and returns the
    /// in-cluster endpoint as `host:port`.
    async fn add_destination(&self, peer: &str, host: &str, port: u16) -> Result<String>;

    async fn remove_destination(&self, peer: &str, host: &str, port: u16) -> Result<()>;

    async fn destination_exists(&self, peer: &str, host: &str, port: u16) -> Result<bool>;

    async fn get_destination(&self, peer: &str, host: &str, port: u16) -> Result<String>;

    /// Checks activation parameters; failures are permanent errors.
    async fn validate(&self, peer: &str, params: &BTreeMap<String, String>) -> Result<()>;

    /// Live status of all peers known to the relay.
    async fn peer_status(&self) -> Result<Vec<PeerStatus>> {
        Ok(Vec::new())
    }

    /// The connection age limit applied to clients that set none.
    async fn default_max_connection_age(&self) -> Result<Option<u64>> {
        Ok(None)
    }
}

/// Prepares a workload so that bridges can intercept its traffic.
#[async_trait::async_trait]
pub trait BridgeMountProvider: Send + Sync {
    async fn prepare(&self) -> Result<()>;

    async fn prepared(&self) -> Result<bool>;

    async fn install(&self) -> Result<()>;

    async fn ready(&self) -> Result<bool>;

    /// Returns the target workload to its original configuration.
    async fn restore(&self) -> Result<()>;

    async fn uninstall(&self) -> Result<()>;

    async fn is_intact(&self) -> Result<bool> {
        Ok(self.prepared().await? && self.ready().await?)
    }
}

/// Installs traffic match rules into a mounted workload.
#[async_trait::async_trait]
pub trait BridgeProvider: Send + Sync {
    async fn install(&self) -> Result<()>;

    async fn installed(&self) -> Result<bool>;

    async fn ready(&self) -> Result<bool>;

    async fn uninstall(&self) -> Result<()>;

    async fn add_proxy_route(&self, route: &ProxyRoute) -> Result<()>;

    async fn remove_proxy_route(&self, container_port: u16, destination: &str) -> Result<()>;

    async fn proxy_route_exists(&self, container_port: u16, destination: &str) -> Result<bool>;

    /// Checks the rules of a bridge; failures are permanent errors.
    fn validate(&self, rules: &[Rule]) -> Result<()>;
}

/// Provisions the cluster identity a client uses.
#[async_trait::async_trait]
pub trait Credentials: Send + Sync {
    async fn provision(&self, client: &str) -> Result<ServiceAccount>;

    async fn revoke(&self, client: &str) -> Result<()>;
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServiceAccount {
    pub name: String,
    /// Token, `ca.crt` and namespace.
    pub data: BTreeMap<String, String>,
}

/// Traffic of `container_port` matching `rules` goes to `destination`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyRoute {
    /// The name of the bridge owning the route.
    pub bridge: String,
    pub container_port: u16,
    /// The relay endpoint in `host:port` form.
    pub destination: String,
    pub rules: Vec<Rule>,
}

/// Everything a mount or bridge provider needs to find its workload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountTarget {
    /// The name of the bridge mount.
    pub name: String,
    pub target: TargetRef,
    pub namespace: String,
    pub container: String,
    pub parameters: MountParameters,
}

// === impl MountTarget ===

impl MountTarget {
    pub fn from_resource(mount: &GefyraBridgeMount) -> Result<Self> {
        let target = mount
            .spec
            .target_ref()
            .map_err(|e| Error::permanent(e.to_string()))?;
        Ok(Self {
            name: mount.name_any(),
            target,
            namespace: mount.spec.target_namespace.clone(),
            container: mount.spec.target_container.clone(),
            parameters: mount.spec.provider_parameter.clone(),
        })
    }
}
