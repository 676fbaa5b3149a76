//! In-memory doubles for machine tests.

use crate::{
    events::{EventKind, Events},
    fsm::Persist,
    provider::{
        BridgeMountProvider, BridgeProvider, ConnectionProvider, Credentials, ProxyRoute,
        ServiceAccount,
    },
    Error, Result,
};
use chrono::{DateTime, Utc};
use gefyra_operator_k8s_api::rules::Rule;
use maplit::btreemap;
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

#[derive(Default)]
pub struct MemoryPersist {
    states: Mutex<Vec<&'static str>>,
    status: Mutex<Vec<serde_json::Value>>,
    spec: Mutex<Vec<serde_json::Value>>,
}

impl MemoryPersist {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn states(&self) -> Vec<&'static str> {
        self.states.lock().clone()
    }

    pub fn status_patches(&self) -> Vec<serde_json::Value> {
        self.status.lock().clone()
    }

    pub fn spec_patches(&self) -> Vec<serde_json::Value> {
        self.spec.lock().clone()
    }
}

#[async_trait::async_trait]
impl Persist for MemoryPersist {
    async fn record_state(&self, state: &'static str, _: DateTime<Utc>) -> Result<()> {
        self.states.lock().push(state);
        Ok(())
    }

    async fn patch_status(&self, patch: serde_json::Value) -> Result<()> {
        self.status.lock().push(patch);
        Ok(())
    }

    async fn patch_spec(&self, patch: serde_json::Value) -> Result<()> {
        self.spec.lock().push(patch);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingEvents(Mutex<Vec<(EventKind, String)>>);

impl RecordingEvents {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn warnings(&self) -> Vec<String> {
        self.0
            .lock()
            .iter()
            .filter(|(kind, _)| *kind == EventKind::Warning)
            .map(|(_, reason)| reason.clone())
            .collect()
    }
}

#[async_trait::async_trait]
impl Events for RecordingEvents {
    async fn publish(&self, kind: EventKind, reason: &str, _: String) {
        self.0.lock().push((kind, reason.to_string()));
    }
}

#[derive(Default)]
pub struct FakeConnection {
    pub peers: Mutex<BTreeSet<String>>,
    pub destinations: Mutex<BTreeMap<(String, String, u16), String>>,
    pub max_age: Option<u64>,
}

#[async_trait::async_trait]
impl ConnectionProvider for FakeConnection {
    async fn install(&self) -> Result<()> {
        Ok(())
    }

    async fn installed(&self) -> Result<bool> {
        Ok(true)
    }

    async fn uninstall(&self) -> Result<()> {
        Ok(())
    }

    async fn ready(&self) -> Result<bool> {
        Ok(true)
    }

    async fn add_peer(&self, peer: &str, _: &BTreeMap<String, String>) -> Result<()> {
        self.peers.lock().insert(peer.to_string());
        Ok(())
    }

    async fn remove_peer(&self, peer: &str) -> Result<()> {
        self.peers.lock().remove(peer);
        Ok(())
    }

    async fn peer_exists(&self, peer: &str) -> Result<bool> {
        Ok(self.peers.lock().contains(peer))
    }

    async fn get_peer_config(&self, peer: &str) -> Result<BTreeMap<String, String>> {
        if !self.peers.lock().contains(peer) {
            return Err(Error::temporary(format!("no config for {peer}")));
        }
        Ok(btreemap! {
            "Interface.Address".to_string() => "192.168.99.2".to_string(),
            "Peer.Endpoint".to_string() => "relay:31820".to_string(),
        })
    }

    async fn add_destination(&self, peer: &str, host: &str, port: u16) -> Result<String> {
        let mut destinations = self.destinations.lock();
        let endpoint = format!("relay-{}:{}", destinations.len(), 10000 + destinations.len());
        destinations.insert((peer.to_string(), host.to_string(), port), endpoint.clone());
        Ok(endpoint)
    }

    async fn remove_destination(&self, peer: &str, host: &str, port: u16) -> Result<()> {
        self.destinations
            .lock()
            .remove(&(peer.to_string(), host.to_string(), port));
        Ok(())
    }

    async fn destination_exists(&self, peer: &str, host: &str, port: u16) -> Result<bool> {
        Ok(self
            .destinations
            .lock()
            .contains_key(&(peer.to_string(), host.to_string(), port)))
    }

    async fn get_destination(&self, peer: &str, host: &str, port: u16) -> Result<String> {
        self.destinations
            .lock()
            .get(&(peer.to_string(), host.to_string(), port))
            .cloned()
            .ok_or_else(|| Error::temporary("no such destination"))
    }

    async fn validate(&self, _: &str, params: &BTreeMap<String, String>) -> Result<()> {
        if params.contains_key("subnet") {
            Ok(())
        } else {
            Err(Error::permanent("subnet is required"))
        }
    }

    async fn default_max_connection_age(&self) -> Result<Option<u64>> {
        Ok(self.max_age)
    }
}

#[derive(Default)]
pub struct FakeCredentials {
    pub accounts: Mutex<BTreeSet<String>>,
}

#[async_trait::async_trait]
impl Credentials for FakeCredentials {
    async fn provision(&self, client: &str) -> Result<ServiceAccount> {
        let name = format!("gefyra-client-{client}");
        self.accounts.lock().insert(name.clone());
        Ok(ServiceAccount {
            name,
            data: btreemap! { "token".to_string() => "t0k3n".to_string() },
        })
    }

    async fn revoke(&self, client: &str) -> Result<()> {
        self.accounts.lock().remove(&format!("gefyra-client-{client}"));
        Ok(())
    }
}

/// A mount whose readiness is controlled by the test.
#[derive(Default)]
pub struct FakeMount {
    pub prepared: Mutex<bool>,
    pub ready: Mutex<bool>,
    pub calls: Mutex<Vec<&'static str>>,
    pub fail_install: Mutex<Option<&'static str>>,
}

impl FakeMount {
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }

    pub fn set(&self, prepared: bool, ready: bool) {
        *self.prepared.lock() = prepared;
        *self.ready.lock() = ready;
    }
}

#[async_trait::async_trait]
impl BridgeMountProvider for FakeMount {
    async fn prepare(&self) -> Result<()> {
        self.calls.lock().push("prepare");
        Ok(())
    }

    async fn prepared(&self) -> Result<bool> {
        Ok(*self.prepared.lock())
    }

    async fn install(&self) -> Result<()> {
        self.calls.lock().push("install");
        match *self.fail_install.lock() {
            Some(msg) => Err(Error::permanent(msg)),
            None => Ok(()),
        }
    }

    async fn ready(&self) -> Result<bool> {
        Ok(*self.ready.lock())
    }

    async fn restore(&self) -> Result<()> {
        self.calls.lock().push("restore");
        Ok(())
    }

    async fn uninstall(&self) -> Result<()> {
        self.calls.lock().push("uninstall");
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeBridge {
    pub not_ready: Mutex<bool>,
    pub routes: Mutex<Vec<ProxyRoute>>,
    pub calls: Mutex<Vec<&'static str>>,
}

impl FakeBridge {
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }

    pub fn routes(&self) -> Vec<ProxyRoute> {
        self.routes.lock().clone()
    }
}

#[async_trait::async_trait]
impl BridgeProvider for FakeBridge {
    async fn install(&self) -> Result<()> {
        self.calls.lock().push("install");
        Ok(())
    }

    async fn installed(&self) -> Result<bool> {
        Ok(true)
    }

    async fn ready(&self) -> Result<bool> {
        Ok(!*self.not_ready.lock())
    }

    async fn uninstall(&self) -> Result<()> {
        self.calls.lock().push("uninstall");
        Ok(())
    }

    async fn add_proxy_route(&self, route: &ProxyRoute) -> Result<()> {
        self.routes.lock().push(route.clone());
        Ok(())
    }

    async fn remove_proxy_route(&self, container_port: u16, destination: &str) -> Result<()> {
        self.routes
            .lock()
            .retain(|r| !(r.container_port == container_port && r.destination == destination));
        Ok(())
    }

    async fn proxy_route_exists(&self, container_port: u16, destination: &str) -> Result<bool> {
        Ok(self
            .routes
            .lock()
            .iter()
            .any(|r| r.container_port == container_port && r.destination == destination))
    }

    fn validate(&self, rules: &[Rule]) -> Result<()> {
        if rules.iter().any(|r| r.matches.is_empty()) {
            return Err(Error::permanent("empty rule"));
        }
        Ok(())
    }
}
