//! Editing the relay's peer list and reading what the relay reports back.

use gefyra_operator_k8s_api::PeerStatus;
use ipnet::IpNet;
use std::collections::BTreeMap;

/// The config key holding the comma separated peer names.
pub const PEERS: &str = "PEERS";

const ALLOWED_IPS_PREFIX: &str = "SERVER_ALLOWEDIPS_PEER_";

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum InvalidSubnet {
    #[error("invalid subnet {0:?}")]
    Malformed(String),

    #[error("subnet {subnet} overlaps {existing} of peer {peer}")]
    Overlaps {
        subnet: IpNet,
        existing: IpNet,
        peer: String,
    },
}

/// Translates a client id into a peer name the relay accepts.
pub fn sanitize(id: &str) -> String {
    id.chars().filter(char::is_ascii_alphanumeric).collect()
}

pub fn allowed_ips_key(peer: &str) -> String {
    format!("{ALLOWED_IPS_PREFIX}{peer}")
}

pub fn peers(data: &BTreeMap<String, String>) -> Vec<&str> {
    data.get(PEERS)
        .map(|p| p.split(',').filter(|p| !p.is_empty()).collect())
        .unwrap_or_default()
}

pub fn contains(data: &BTreeMap<String, String>, peer: &str) -> bool {
    peers(data).contains(&peer)
}

/// Prepends `peer` to the peer list. Returns false when it is already known.
pub fn add(data: &mut BTreeMap<String, String>, peer: &str, subnet: Option<&str>) -> bool {
    if contains(data, peer) {
        return false;
    }
    let mut list = vec![peer];
    list.extend(peers(data));
    let joined = list.join(",");
    data.insert(PEERS.to_string(), joined);
    if let Some(subnet) = subnet {
        data.insert(allowed_ips_key(peer), subnet.to_string());
    }
    true
}

/// Drops `peer` and its allowed IPs. Returns false when it was not known.
pub fn remove(data: &mut BTreeMap<String, String>, peer: &str) -> bool {
    if !contains(data, peer) {
        return false;
    }
    let rest = peers(data)
        .into_iter()
        .filter(|p| *p != peer)
        .collect::<Vec<_>>()
        .join(",");
    data.insert(PEERS.to_string(), rest);
    data.remove(&allowed_ips_key(peer));
    true
}

/// Checks that `subnet` is a network no other peer was assigned already.
pub fn check_subnet(
    data: &BTreeMap<String, String>,
    peer: &str,
    subnet: &str,
) -> Result<IpNet, InvalidSubnet> {
    let subnet = subnet
        .trim()
        .parse::<IpNet>()
        .map_err(|_| InvalidSubnet::Malformed(subnet.to_string()))?;
    for (key, value) in data {
        let Some(other) = key.strip_prefix(ALLOWED_IPS_PREFIX) else {
            continue;
        };
        if other == peer {
            continue;
        }
        let Ok(existing) = value.trim().parse::<IpNet>() else {
            continue;
        };
        if existing.contains(&subnet.network()) || subnet.contains(&existing.network()) {
            return Err(InvalidSubnet::Overlaps {
                subnet,
                existing,
                peer: other.to_string(),
            });
        }
    }
    Ok(subnet)
}

/// Reads a WireGuard peer config into `Section.Key` pairs.
///
/// Keys before the first section are prefixed with `none`.
pub fn parse_wireguard_config(raw: &str) -> BTreeMap<String, String> {
    let mut section = "none";
    let mut config = BTreeMap::new();
    for line in raw.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.contains("[Interface]") {
            section = "Interface";
            continue;
        }
        if line.contains("[Peer]") {
            section = "Peer";
            continue;
        }
        match line.split_once('=') {
            Some((key, value)) => {
                config.insert(format!("{section}.{}", key.trim()), value.trim().to_string());
            }
            None => tracing::debug!(%line, "Skipping malformed WireGuard config line"),
        }
    }
    config
}

/// Parses the peer lines of `wg show all dump`.
///
/// Interface lines carry five fields and peer lines nine; anything else is
/// skipped.
pub fn parse_wg_dump(raw: &str) -> Vec<PeerStatus> {
    raw.lines()
        .filter_map(|line| {
            let fields = line.split('\t').collect::<Vec<_>>();
            let [_iface, public_key, _psk, endpoint, allowed_ips, handshake, rx, tx, _keepalive] =
                fields[..]
            else {
                return None;
            };
            Some(PeerStatus {
                public_key: public_key.to_string(),
                endpoint: (endpoint != "(none)").then(|| endpoint.to_string()),
                allowed_ips: allowed_ips
                    .split(',')
                    .filter(|ip| !ip.is_empty() && *ip != "(none)")
                    .map(str::to_string)
                    .collect(),
                latest_handshake: handshake.parse().unwrap_or_default(),
                transfer_rx: rx.parse().unwrap_or_default(),
                transfer_tx: tx.parse().unwrap_or_default(),
            })
        })
        .collect()
}
