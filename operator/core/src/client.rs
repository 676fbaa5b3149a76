//! The life-cycle of a tunnel peer.

use crate::{
    earliest,
    events::Events,
    fsm::{Edge, Machine, Persist, Transition},
    provider::{ConnectionProvider, Credentials},
    until_sunset, Error, Outcome, Result,
};
use chrono::{DateTime, Utc};
use gefyra_operator_k8s_api::{
    format_timestamp, ClientSpec, ClientState as S, ClientStatus, GefyraClient, ResourceExt,
};
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};

pub const CREATE: Transition<S> = Transition::new(
    "create",
    &[Edge::new(&[S::Requested, S::Error, S::Creating], S::Creating)],
);

pub const WAIT: Transition<S> = Transition::new(
    "wait",
    &[Edge::new(
        &[S::Creating, S::Waiting, S::Error, S::Disabling],
        S::Waiting,
    )],
);

pub const ENABLE: Transition<S> =
    Transition::new("enable", &[Edge::new(&[S::Waiting, S::Error], S::Enabling)]);

pub const ACTIVATE: Transition<S> = Transition::new(
    "activate",
    &[Edge::new(&[S::Enabling, S::Error, S::Active], S::Active)],
);

pub const DISABLE: Transition<S> =
    Transition::new("disable", &[Edge::new(&[S::Active, S::Error], S::Disabling)]);

pub const IMPAIR: Transition<S> = Transition::new(
    "impair",
    &[Edge::new(
        &[
            S::Requested,
            S::Creating,
            S::Waiting,
            S::Enabling,
            S::Active,
            S::Disabling,
            S::Error,
        ],
        S::Error,
    )],
);

pub const TERMINATE: Transition<S> = Transition::new("terminate", &[Edge::new(S::ALL, S::Terminating)]);

/// Drives a [`GefyraClient`] through its states.
pub struct ClientMachine {
    id: String,
    spec: ClientSpec,
    status: ClientStatus,
    machine: Machine<S>,
    provider: Arc<dyn ConnectionProvider>,
    credentials: Arc<dyn Credentials>,
    events: Arc<dyn Events>,
}

impl ClientMachine {
    pub fn new(
        client: &GefyraClient,
        persist: Arc<dyn Persist>,
        provider: Arc<dyn ConnectionProvider>,
        credentials: Arc<dyn Credentials>,
        events: Arc<dyn Events>,
    ) -> Self {
        let status = client.status.clone().unwrap_or_default();
        Self {
            id: client.name_any(),
            spec: client.spec.clone(),
            machine: Machine::new(status.state, persist),
            status,
            provider,
            credentials,
            events,
        }
    }

    pub fn state(&self) -> S {
        self.machine.state()
    }

    /// Moves the client as far as its resource allows.
    ///
    /// Permanent failures move the client to ERROR; transient failures are
    /// returned without changing state.
    pub async fn reconcile(&mut self, now: DateTime<Utc>) -> Result<Outcome> {
        let sunset = match until_sunset(self.spec.sunset.as_deref(), now) {
            Some(None) => {
                info!(client = %self.id, "Sunset reached");
                return Ok(Outcome::Delete);
            }
            Some(due) => due,
            None => None,
        };

        match self.pump(now).await {
            Ok(due) => Ok(Outcome::after(earliest(sunset, due))),
            Err(error) if !error.is_transient() => {
                self.impair(&error).await?;
                Ok(Outcome::after(sunset))
            }
            Err(error) => Err(error),
        }
    }

    /// Removes the peer and revokes the client's identity.
    pub async fn terminate(&mut self) -> Result<()> {
        self.apply(&TERMINATE).await?;
        if self.provider.peer_exists(&self.id).await? {
            self.provider.remove_peer(&self.id).await?;
        }
        self.credentials.revoke(&self.id).await?;
        info!(client = %self.id, "Terminated");
        Ok(())
    }

    async fn pump(&mut self, now: DateTime<Utc>) -> Result<Option<Duration>> {
        loop {
            match self.state() {
                S::Requested | S::Creating => self.create().await?,
                S::Waiting if self.has_parameters() => {
                    self.apply(&ENABLE).await?;
                }
                S::Waiting | S::Terminating => return Ok(None),
                S::Enabling => self.activate().await?,
                S::Active if !self.has_parameters() => {
                    self.apply(&DISABLE).await?;
                }
                S::Active if self.status.provider_config.is_empty() => self.activate().await?,
                S::Active => match self.remaining_age(now).await? {
                    Some(left) if left.is_zero() => {
                        info!(client = %self.id, "Maximum connection age reached");
                        self.events
                            .normal("Disconnect", "Maximum connection age reached".to_string())
                            .await;
                        self.apply(&DISABLE).await?;
                    }
                    left => return Ok(left),
                },
                S::Disabling => self.wait().await?,
                S::Error => self.recover().await?,
            }
        }
    }

    async fn create(&mut self) -> Result<()> {
        self.apply(&CREATE).await?;
        let account = self.credentials.provision(&self.id).await?;
        self.machine
            .persist()
            .patch_status(json!({
                "serviceAccountName": account.name,
                "serviceAccount": account.data,
            }))
            .await?;
        self.events
            .normal("ServiceAccount", format!("Created service account {}", account.name))
            .await;
        self.status.service_account_name = Some(account.name);
        self.status.service_account = account.data;
        self.wait().await
    }

    async fn wait(&mut self) -> Result<()> {
        let from = self.apply(&WAIT).await?;
        if matches!(from, S::Creating | S::Waiting) {
            return Ok(());
        }

        if self.provider.peer_exists(&self.id).await? {
            self.provider.remove_peer(&self.id).await?;
            self.events
                .normal("Disconnected", format!("Removed peer {}", self.id))
                .await;
        }
        let persist = self.machine.persist().clone();
        persist.patch_status(json!({ "providerConfig": null })).await?;
        self.status.provider_config.clear();
        if self.has_parameters() {
            persist.patch_spec(json!({ "providerParameter": null })).await?;
            self.spec.provider_parameter.clear();
        }
        Ok(())
    }

    async fn activate(&mut self) -> Result<()> {
        let from = self.apply(&ACTIVATE).await?;
        if self.provider.peer_exists(&self.id).await? {
            if from == S::Enabling {
                return Err(Error::permanent(format!(
                    "peer {} already exists in the connection provider",
                    self.id
                )));
            }
        } else {
            self.provider
                .add_peer(&self.id, &self.spec.provider_parameter)
                .await?;
        }

        let config = self.provider.get_peer_config(&self.id).await?;
        self.machine
            .persist()
            .patch_status(json!({ "providerConfig": config }))
            .await?;
        self.status.provider_config = config;
        self.events
            .normal("Connected", format!("Peer {} is active", self.id))
            .await;
        info!(client = %self.id, "Activated");
        Ok(())
    }

    /// Retries the step implied by the resource.
    async fn recover(&mut self) -> Result<()> {
        if self.has_parameters() {
            self.apply(&ENABLE).await?;
            Ok(())
        } else if self.status.service_account_name.is_none() {
            self.create().await
        } else {
            self.wait().await
        }
    }

    async fn impair(&mut self, error: &Error) -> Result<()> {
        warn!(client = %self.id, state = %self.state(), %error, "Failed");
        self.events.warning("Failed", error.to_string()).await;
        self.apply(&IMPAIR).await?;
        Ok(())
    }

    /// The time left until an active connection reaches its maximum age.
    async fn remaining_age(&self, now: DateTime<Utc>) -> Result<Option<Duration>> {
        let max_age = match self.spec.max_connection_age {
            Some(age) => age,
            None => match self.provider.default_max_connection_age().await? {
                Some(age) => age,
                None => return Ok(None),
            },
        };
        let entered = self.entered(S::Active).unwrap_or(now);
        let age = (now - entered).to_std().unwrap_or_default();
        Ok(Some(Duration::from_secs(max_age).saturating_sub(age)))
    }

    fn entered(&self, state: S) -> Option<DateTime<Utc>> {
        let ts = self.status.state_transitions.get(state.as_str())?;
        gefyra_operator_k8s_api::parse_timestamp(ts).ok()
    }

    async fn apply(&mut self, transition: &Transition<S>) -> Result<S> {
        let from = self.machine.apply(transition).await?;
        let to = self.state();
        if from != to {
            self.status
                .state_transitions
                .insert(to.as_str().to_string(), format_timestamp(Utc::now()));
        }
        Ok(from)
    }

    fn has_parameters(&self) -> bool {
        !self.spec.provider_parameter.is_empty()
    }
}

#[cfg(test)]
mod tests;
