use crate::{carrier::CarrierConfig, stowaway::StowawayConfig};
use std::time::Duration;

/// Settings of the operator and the components it installs.
#[derive(Clone, Debug, clap::Args)]
pub struct OperatorConfig {
    /// The namespace holding all Gefyra resources.
    #[clap(long, env = "GEFYRA_NAMESPACE", default_value = "gefyra")]
    pub namespace: String,

    #[clap(long, env = "GEFYRA_STOWAWAY_IMAGE", default_value = "quay.io/gefyra/stowaway")]
    pub stowaway_image: String,

    #[clap(long, env = "GEFYRA_STOWAWAY_TAG", default_value = "latest")]
    pub stowaway_tag: String,

    #[clap(
        long,
        env = "GEFYRA_STOWAWAY_IMAGE_PULLPOLICY",
        default_value = "IfNotPresent"
    )]
    pub stowaway_image_pull_policy: String,

    /// The node port clients connect their tunnels to.
    #[clap(long, env = "GEFYRA_STOWAWAY_SERVERPORT", default_value = "31820")]
    pub stowaway_server_port: u16,

    #[clap(long, env = "GEFYRA_STOWAWAY_SERVERPORT_TCP", default_value = "31821")]
    pub stowaway_server_port_tcp: u16,

    #[clap(long, env = "GEFYRA_STOWAWAY_PUID", default_value = "1000")]
    pub stowaway_puid: String,

    #[clap(long, env = "GEFYRA_STOWAWAY_PGID", default_value = "1000")]
    pub stowaway_pgid: String,

    #[clap(long, env = "GEFYRA_STOWAWAY_PEERDNS", default_value = "auto")]
    pub stowaway_peer_dns: String,

    #[clap(long, env = "GEFYRA_STOWAWAY_PEER_CONFIG_PATH", default_value = "/config/")]
    pub stowaway_peer_config_path: String,

    #[clap(long, env = "GEFYRA_INTERNAL_SUBNET", default_value = "192.168.99.0")]
    pub stowaway_internal_subnet: String,

    /// Size of the relay's config volume, in MiB.
    #[clap(long, env = "GEFYRA_STOWAWAY_STORAGE", default_value = "64")]
    pub stowaway_storage_mi: u32,

    /// Seconds a connection provider may take to become ready.
    #[clap(
        long,
        env = "CONNECTION_PROVIDER_STARTUP_TIMEOUT",
        default_value = "180"
    )]
    pub connection_provider_startup_timeout: u64,

    #[clap(long, env = "GEFYRA_CARRIER_IMAGE", default_value = "quay.io/gefyra/carrier")]
    pub carrier_image: String,

    #[clap(long, env = "GEFYRA_CARRIER_IMAGE_TAG", default_value = "latest")]
    pub carrier_tag: String,

    #[clap(long, env = "GEFYRA_CARRIER2_IMAGE", default_value = "quay.io/gefyra/carrier2")]
    pub carrier2_image: String,

    #[clap(long, env = "GEFYRA_CARRIER2_IMAGE_TAG", default_value = "latest")]
    pub carrier2_tag: String,

    #[clap(long, env = "GEFYRA_CARRIER2_DEBUG")]
    pub carrier2_debug: bool,

    #[clap(long, env = "GEFYRA_CARRIER_STARTUP_TIMEOUT", default_value = "60")]
    pub carrier_startup_timeout: u64,

    /// Seconds between drift checks of bridge mounts.
    #[clap(long, env = "GEFYRA_RECONCILE_INTERVAL", default_value = "10")]
    pub reconcile_interval: u64,
}

impl OperatorConfig {
    pub fn stowaway(&self) -> StowawayConfig {
        StowawayConfig {
            namespace: self.namespace.clone(),
            image: self.stowaway_image.clone(),
            tag: self.stowaway_tag.clone(),
            image_pull_policy: self.stowaway_image_pull_policy.clone(),
            server_port: self.stowaway_server_port,
            server_port_tcp: self.stowaway_server_port_tcp,
            puid: self.stowaway_puid.clone(),
            pgid: self.stowaway_pgid.clone(),
            peer_dns: self.stowaway_peer_dns.clone(),
            peer_config_path: self.stowaway_peer_config_path.clone(),
            internal_subnet: self.stowaway_internal_subnet.clone(),
            storage_mi: self.stowaway_storage_mi,
            startup_timeout: self.startup_timeout(),
        }
    }

    pub fn carrier(&self) -> CarrierConfig {
        CarrierConfig {
            namespace: self.namespace.clone(),
            carrier_image: self.carrier_image.clone(),
            carrier_tag: self.carrier_tag.clone(),
            carrier2_image: self.carrier2_image.clone(),
            carrier2_tag: self.carrier2_tag.clone(),
            carrier2_debug: self.carrier2_debug,
            startup_timeout: Duration::from_secs(self.carrier_startup_timeout),
        }
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_provider_startup_timeout)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval.max(1))
    }
}
