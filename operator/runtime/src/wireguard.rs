//! Mirrors the relay's live peer status into active clients.

use crate::{core, providers::Providers};
use gefyra_operator_k8s_api::{
    Api, ClientState, GefyraClient, ListParams, Patch, PatchParams, PeerStatus, ResourceExt,
};
use serde_json::json;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::time;
use tracing::{debug, info, warn};

pub const INTERVAL: Duration = Duration::from_secs(60);

const PUBLIC_KEY: &str = "Interface.PublicKey";
const ADDRESS: &str = "Interface.Address";

/// Updates `status.wireguard` of active clients until shutdown is signaled.
pub async fn run(api: Api<GefyraClient>, providers: Arc<Providers>, drain: drain::Watch) {
    let mut interval = time::interval(INTERVAL);
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    let shutdown = drain.signaled();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _release = &mut shutdown => {
                debug!("Stopped peer status updates");
                return;
            }
        }
        if let Err(error) = update(&api, &providers).await {
            warn!(%error, "Failed to update peer status");
        }
    }
}

async fn update(api: &Api<GefyraClient>, providers: &Providers) -> core::Result<()> {
    let clients = api.list(&ListParams::default()).await?.items;
    let mut by_provider = BTreeMap::<&str, Vec<&GefyraClient>>::new();
    for client in clients.iter().filter(|c| c.state() == ClientState::Active) {
        by_provider
            .entry(client.spec.provider.as_str())
            .or_default()
            .push(client);
    }

    for (name, clients) in by_provider {
        let peers = providers.connections.build(name, &())?.peer_status().await?;
        for (client, status) in changed(&clients, &peers) {
            let patch = json!({ "status": { "wireguard": status } });
            api.patch_status(&client, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
            info!(%client, "Updated peer status");
        }
    }
    Ok(())
}

/// Finds the relay's peer of a client, by public key when the config names
/// one and otherwise by the tunnel address routed to it.
fn peer_of<'p>(config: &BTreeMap<String, String>, peers: &'p [PeerStatus]) -> Option<&'p PeerStatus> {
    if let Some(key) = config.get(PUBLIC_KEY) {
        return peers.iter().find(|p| &p.public_key == key);
    }
    let address = config.get(ADDRESS)?;
    let address = address.split('/').next().unwrap_or(address).trim();
    peers.iter().find(|p| {
        p.allowed_ips
            .iter()
            .any(|ip| ip.split('/').next() == Some(address))
    })
}

/// Pairs each client with its peer, leaving out clients whose recorded
/// status is current.
fn changed<'p>(clients: &[&GefyraClient], peers: &'p [PeerStatus]) -> Vec<(String, &'p PeerStatus)> {
    clients
        .iter()
        .filter_map(|client| {
            let status = client.status.as_ref()?;
            let peer = peer_of(&status.provider_config, peers)?;
            if status.wireguard.as_ref() == Some(peer) {
                return None;
            }
            Some((client.name_any(), peer))
        })
        .collect()
}
