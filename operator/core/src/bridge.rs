//! The life-cycle of a traffic bridge from a mounted workload to a client.

use crate::{
    events::Events,
    fsm::{Edge, Machine, Persist, Transition},
    provider::{BridgeProvider, ConnectionProvider, ProxyRoute},
    until_sunset, Error, Outcome, Result,
};
use chrono::{DateTime, Utc};
use gefyra_operator_k8s_api::{bridge::PortMapping, BridgeSpec, BridgeState as S, GefyraBridge, ResourceExt};
use serde_json::json;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tracing::{debug, info, warn};

pub const INSTALL: Transition<S> = Transition::new(
    "install",
    &[Edge::new(
        &[S::Requested, S::Error, S::Installing],
        S::Installing,
    )],
);

pub const SET_INSTALLED: Transition<S> = Transition::new(
    "set_installed",
    &[Edge::new(
        &[
            S::Requested,
            S::Removing,
            S::Installing,
            S::Error,
            S::Installed,
        ],
        S::Installed,
    )],
);

pub const ACTIVATE: Transition<S> = Transition::new(
    "activate",
    &[Edge::new(
        &[S::Installed, S::Error, S::Creating],
        S::Creating,
    )],
);

pub const ESTABLISH: Transition<S> =
    Transition::new("establish", &[Edge::new(&[S::Creating, S::Error], S::Active)]);

pub const REMOVE: Transition<S> = Transition::new(
    "remove",
    &[Edge::new(
        &[S::Active, S::Error, S::Creating, S::Removing],
        S::Removing,
    )],
);

pub const RESTORE: Transition<S> = Transition::new(
    "restore",
    &[Edge::new(
        &[S::Installed, S::Error, S::Restoring],
        S::Restoring,
    )],
);

pub const IMPAIR: Transition<S> = Transition::new(
    "impair",
    &[Edge::new(
        &[
            S::Requested,
            S::Installing,
            S::Installed,
            S::Creating,
            S::Active,
            S::Removing,
            S::Restoring,
            S::Error,
        ],
        S::Error,
    )],
);

pub const TERMINATE: Transition<S> =
    Transition::new("terminate", &[Edge::new(S::ALL, S::Terminating)]);

/// Drives a [`GefyraBridge`] through its states.
pub struct BridgeMachine {
    name: String,
    spec: BridgeSpec,
    machine: Machine<S>,
    connection: Arc<dyn ConnectionProvider>,
    /// Absent when the bridge mount no longer exists.
    bridge: Option<Arc<dyn BridgeProvider>>,
    events: Arc<dyn Events>,
}

impl BridgeMachine {
    pub fn new(
        bridge: &GefyraBridge,
        persist: Arc<dyn Persist>,
        connection: Arc<dyn ConnectionProvider>,
        provider: Option<Arc<dyn BridgeProvider>>,
        events: Arc<dyn Events>,
    ) -> Self {
        Self {
            name: bridge.name_any(),
            spec: bridge.spec.clone(),
            machine: Machine::new(bridge.state(), persist),
            connection,
            bridge: provider,
            events,
        }
    }

    pub fn state(&self) -> S {
        self.machine.state()
    }

    pub async fn reconcile(&mut self, now: DateTime<Utc>) -> Result<Outcome> {
        let sunset = match until_sunset(self.spec.sunset.as_deref(), now) {
            Some(None) => {
                info!(bridge = %self.name, "Sunset reached");
                return Ok(Outcome::Delete);
            }
            Some(due) => due,
            None => None,
        };

        match self.pump().await {
            Ok(due) => Ok(Outcome::after(crate::earliest(sunset, due))),
            Err(error) if !error.is_transient() => {
                warn!(bridge = %self.name, state = %self.state(), %error, "Failed");
                self.events.warning("Failed", error.to_string()).await;
                self.machine.apply(&IMPAIR).await?;
                Ok(Outcome::after(sunset))
            }
            Err(error) => Err(error),
        }
    }

    /// Tears the bridge down: routes first, then the provider installation.
    ///
    /// A missing bridge mount does not block deletion.
    pub async fn terminate(&mut self) -> Result<()> {
        if matches!(
            self.state(),
            S::Active | S::Creating | S::Removing | S::Error
        ) {
            match self.remove().await {
                Ok(()) => {}
                Err(error) if error.is_transient() => return Err(error),
                Err(error) => warn!(bridge = %self.name, %error, "Failed to remove routes"),
            }
        }
        if matches!(self.state(), S::Installed | S::Error | S::Restoring) {
            self.restore().await?;
        }
        if self.state() != S::Terminating {
            self.machine.apply(&TERMINATE).await?;
        }
        info!(bridge = %self.name, "Terminated");
        Ok(())
    }

    async fn pump(&mut self) -> Result<Option<Duration>> {
        loop {
            match self.state() {
                S::Requested | S::Installing | S::Error => self.install().await?,
                S::Installed | S::Creating => self.activate().await?,
                S::Removing => self.remove().await?,
                S::Active | S::Restoring | S::Terminating => return Ok(None),
            }
        }
    }

    fn provider(&self) -> Result<&Arc<dyn BridgeProvider>> {
        self.bridge.as_ref().ok_or_else(|| {
            Error::temporary(format!("bridge mount {} does not exist", self.spec.target))
        })
    }

    fn mappings(&self) -> Result<Vec<PortMapping>> {
        self.spec
            .port_mappings()
            .map_err(|e| Error::permanent(e.to_string()))
    }

    async fn install(&mut self) -> Result<()> {
        let provider = self.provider()?.clone();
        let from = self.machine.apply(&INSTALL).await?;
        if from != S::Installing {
            provider.install().await?;
            self.events
                .normal("Installing", format!("Installing bridge {}", self.name))
                .await;
            return Ok(());
        }

        if !provider.ready().await? {
            return Err(Error::temporary(format!(
                "bridge provider for {} is not ready",
                self.spec.target
            )));
        }
        self.machine.apply(&SET_INSTALLED).await?;
        Ok(())
    }

    async fn activate(&mut self) -> Result<()> {
        let provider = self.provider()?.clone();
        let mappings = self.mappings()?;
        self.machine.apply(&ACTIVATE).await?;

        let client = &self.spec.client;
        let host = &self.spec.destination_ip;
        let mut endpoints = BTreeMap::new();
        for mapping in &mappings {
            let endpoint = if self
                .connection
                .destination_exists(client, host, mapping.local)
                .await?
            {
                self.connection
                    .get_destination(client, host, mapping.local)
                    .await?
            } else {
                self.connection
                    .add_destination(client, host, mapping.local)
                    .await?
            };
            self.events
                .normal(
                    "Destination",
                    format!(
                        "Port {} of {host} ({client}) is reachable at {endpoint}",
                        mapping.local
                    ),
                )
                .await;
            endpoints.insert(mapping.target, endpoint);
        }
        self.machine
            .persist()
            .patch_status(json!({
                "clusterEndpoint": endpoints
                    .iter()
                    .map(|(port, endpoint)| (port.to_string(), endpoint.clone()))
                    .collect::<BTreeMap<_, _>>(),
            }))
            .await?;

        for (container_port, destination) in endpoints {
            if provider
                .proxy_route_exists(container_port, &destination)
                .await?
            {
                debug!(bridge = %self.name, container_port, %destination, "Route exists");
                continue;
            }
            provider
                .add_proxy_route(&ProxyRoute {
                    bridge: self.name.clone(),
                    container_port,
                    destination,
                    rules: self.spec.provider_parameter.rules.clone(),
                })
                .await?;
        }

        self.machine.apply(&ESTABLISH).await?;
        self.events
            .normal("Active", format!("Bridge {} is active", self.name))
            .await;
        info!(bridge = %self.name, "Activated");
        Ok(())
    }

    async fn remove(&mut self) -> Result<()> {
        self.machine.apply(&REMOVE).await?;
        let mappings = self.mappings()?;
        let client = &self.spec.client;
        let host = &self.spec.destination_ip;
        for mapping in mappings {
            if !self
                .connection
                .destination_exists(client, host, mapping.local)
                .await?
            {
                continue;
            }
            let endpoint = self
                .connection
                .get_destination(client, host, mapping.local)
                .await?;
            if let Some(provider) = self.bridge.as_ref() {
                let removed = match provider.proxy_route_exists(mapping.target, &endpoint).await {
                    Ok(true) => provider.remove_proxy_route(mapping.target, &endpoint).await,
                    Ok(false) => Ok(()),
                    Err(error) => Err(error),
                };
                if let Err(error) = removed {
                    warn!(bridge = %self.name, port = mapping.target, %error, "Failed to remove proxy route");
                }
            }
            self.connection
                .remove_destination(client, host, mapping.local)
                .await?;
        }
        self.machine
            .persist()
            .patch_status(json!({ "clusterEndpoint": null }))
            .await?;
        self.machine.apply(&SET_INSTALLED).await?;
        Ok(())
    }

    async fn restore(&mut self) -> Result<()> {
        self.machine.apply(&RESTORE).await?;
        match self.bridge.as_ref() {
            Some(provider) => {
                if let Err(error) = provider.uninstall().await {
                    warn!(bridge = %self.name, %error, "Failed to uninstall");
                }
            }
            None => debug!(bridge = %self.name, "Bridge mount is gone"),
        }
        self.machine.apply(&TERMINATE).await?;
        Ok(())
    }
}
