//! The proxy route table kept in the relay's route ConfigMap.
//!
//! Every entry maps `<peer>-<suffix>` to `<host>:<port>,<relay port>`. The
//! relay forwards its relay port to the destination through the peer's
//! tunnel.

use rand::Rng;
use std::{collections::BTreeMap, ops::Range};

/// Relay ports handed out to routes.
pub const PORT_RANGE: Range<u16> = 10000..20000;

const SUFFIX_LEN: usize = 10;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    pub key: String,
    pub peer: String,
    /// `host:port` reached through the tunnel.
    pub destination: String,
    pub port: u16,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("all relay ports between {} and {} are taken", PORT_RANGE.start, PORT_RANGE.end)]
pub struct Exhausted;

pub fn destination(host: &str, port: u16) -> String {
    format!("{host}:{port}")
}

/// Parses a single table entry, skipping anything malformed.
pub fn parse(key: &str, value: &str) -> Option<Route> {
    let (peer, _) = key.rsplit_once('-')?;
    let (destination, port) = value.rsplit_once(',')?;
    Some(Route {
        key: key.to_string(),
        peer: peer.to_string(),
        destination: destination.to_string(),
        port: port.trim().parse().ok()?,
    })
}

pub fn all(table: &BTreeMap<String, String>) -> impl Iterator<Item = Route> + '_ {
    table.iter().filter_map(|(k, v)| parse(k, v))
}

pub fn find(table: &BTreeMap<String, String>, peer: &str, destination: &str) -> Option<Route> {
    all(table).find(|r| r.peer == peer && r.destination == destination)
}

/// The lowest relay port no route uses.
pub fn free_port(table: &BTreeMap<String, String>) -> Option<u16> {
    let taken = all(table).map(|r| r.port).collect::<std::collections::BTreeSet<_>>();
    PORT_RANGE.clone().find(|p| !taken.contains(p))
}

/// Adds a route unless one exists for the pair and returns it.
pub fn insert<R: Rng + ?Sized>(
    table: &mut BTreeMap<String, String>,
    peer: &str,
    destination: &str,
    rng: &mut R,
) -> Result<Route, Exhausted> {
    if let Some(route) = find(table, peer, destination) {
        return Ok(route);
    }
    let port = free_port(table).ok_or(Exhausted)?;
    let key = loop {
        let suffix = (0..SUFFIX_LEN)
            .map(|_| rng.gen_range(b'a'..=b'z') as char)
            .collect::<String>();
        let key = format!("{peer}-{suffix}");
        if !table.contains_key(&key) {
            break key;
        }
    };
    table.insert(key.clone(), format!("{destination},{port}"));
    Ok(Route {
        key,
        peer: peer.to_string(),
        destination: destination.to_string(),
        port,
    })
}

/// Removes the route of the pair, if any, and returns it.
pub fn remove(table: &mut BTreeMap<String, String>, peer: &str, destination: &str) -> Option<Route> {
    let route = find(table, peer, destination)?;
    table.remove(&route.key);
    Some(route)
}
