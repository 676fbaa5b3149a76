use crate::{
    carrier::{Carrier, Carrier2, Carrier2Mount, CarrierConfig},
    core::{BridgeProviders, ConnectionProviders, MountProviders},
    stowaway::{Stowaway, StowawayConfig},
};
use gefyra_operator_k8s_api::Client;
use std::sync::Arc;

/// Every provider the operator knows, by name.
pub struct Providers {
    pub connections: ConnectionProviders,
    pub mounts: MountProviders,
    pub bridges: BridgeProviders,
}

impl Providers {
    pub fn new(client: Client, stowaway: StowawayConfig, carrier: CarrierConfig) -> Self {
        let stowaway = Stowaway::new(client.clone(), Arc::new(stowaway));
        let carrier = Arc::new(carrier);

        let connections = ConnectionProviders::new("connection")
            .register(Stowaway::NAME, move |_| Arc::new(stowaway.clone()));

        let mounts = {
            let (client, carrier) = (client.clone(), carrier.clone());
            MountProviders::new("bridge mount").register(Carrier2Mount::NAME, move |target| {
                Arc::new(Carrier2Mount::new(client.clone(), carrier.clone(), target.clone()))
            })
        };

        let bridges = {
            let (c2_client, c2_config) = (client.clone(), carrier.clone());
            BridgeProviders::new("bridge")
                .register(Carrier2::NAME, move |target| {
                    Arc::new(Carrier2::new(c2_client.clone(), c2_config.clone(), target.clone()))
                })
                .register(Carrier::NAME, move |target| {
                    Arc::new(Carrier::new(client.clone(), carrier.clone(), target.clone()))
                })
        };

        Self {
            connections,
            mounts,
            bridges,
        }
    }
}
