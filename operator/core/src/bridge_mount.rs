//! The life-cycle of a workload prepared for interception.

use crate::{
    events::Events,
    fsm::{Edge, Machine, Persist, Transition},
    provider::BridgeMountProvider,
    until_sunset, Error, Outcome, Result,
};
use chrono::{DateTime, Utc};
use gefyra_operator_k8s_api::{GefyraBridgeMount, MountState as S, ResourceExt};
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};

/// How long to wait before checking a mount that is still coming up.
pub const POLL: Duration = Duration::from_secs(5);

pub const PREPARE: Transition<S> = Transition::new(
    "prepare",
    &[Edge::new(
        &[S::Requested, S::Error, S::Restoring, S::Preparing],
        S::Preparing,
    )],
);

pub const INSTALL: Transition<S> = Transition::new(
    "install",
    &[Edge::new(&[S::Preparing, S::Installing], S::Installing)],
);

pub const ACTIVATE: Transition<S> = Transition::new(
    "activate",
    &[Edge::new(&[S::Installing, S::Active], S::Active)],
);

pub const RESTORE: Transition<S> = Transition::new(
    "restore",
    &[Edge::new(&[S::Active, S::Error, S::Restoring], S::Restoring)],
);

pub const IMPAIR: Transition<S> = Transition::new(
    "impair",
    &[Edge::new(
        &[
            S::Requested,
            S::Preparing,
            S::Installing,
            S::Active,
            S::Restoring,
            S::Error,
        ],
        S::Error,
    )],
);

pub const TERMINATE: Transition<S> =
    Transition::new("terminate", &[Edge::new(S::ALL, S::Terminated)]);

/// Drives a [`GefyraBridgeMount`] through its states.
pub struct MountMachine {
    name: String,
    sunset: Option<String>,
    machine: Machine<S>,
    provider: Arc<dyn BridgeMountProvider>,
    events: Arc<dyn Events>,
}

impl MountMachine {
    pub fn new(
        mount: &GefyraBridgeMount,
        persist: Arc<dyn Persist>,
        provider: Arc<dyn BridgeMountProvider>,
        events: Arc<dyn Events>,
    ) -> Self {
        Self {
            name: mount.name_any(),
            sunset: mount.spec.sunset.clone(),
            machine: Machine::new(mount.state(), persist),
            provider,
            events,
        }
    }

    pub fn state(&self) -> S {
        self.machine.state()
    }

    pub async fn reconcile(&mut self, now: DateTime<Utc>) -> Result<Outcome> {
        let sunset = match until_sunset(self.sunset.as_deref(), now) {
            Some(None) => {
                info!(mount = %self.name, "Sunset reached");
                return Ok(Outcome::Delete);
            }
            Some(due) => due,
            None => None,
        };

        match self.pump().await {
            Ok(due) => Ok(Outcome::after(crate::earliest(sunset, due))),
            Err(error) if !error.is_transient() => {
                record_failure(&self.name, &mut self.machine, &*self.events, &error).await?;
                Ok(Outcome::after(sunset))
            }
            Err(error) => Err(error),
        }
    }

    /// Removes everything the provider installed.
    ///
    /// Provider failures are logged and never block deletion.
    pub async fn terminate(&mut self) -> Result<()> {
        self.machine.apply(&TERMINATE).await?;
        if let Err(error) = self.provider.uninstall().await {
            warn!(mount = %self.name, %error, "Failed to uninstall");
        }
        info!(mount = %self.name, "Terminated");
        Ok(())
    }

    async fn pump(&mut self) -> Result<Option<Duration>> {
        loop {
            match self.state() {
                S::Requested => self.prepare().await?,
                // A failed install may have left the target patched, so it is
                // restored before it is duplicated again.
                S::Error => {
                    self.events
                        .normal("Recovering", format!("Recovering bridge mount {}", self.name))
                        .await;
                    self.restore().await?;
                }
                S::Restoring => self.restore().await?,
                S::Preparing => {
                    if !self.provider.prepared().await? {
                        return Ok(Some(POLL));
                    }
                    self.install().await?;
                    if !self.provider.ready().await? {
                        return Ok(Some(POLL));
                    }
                    self.activate().await?;
                }
                S::Installing => {
                    if !self.provider.ready().await? {
                        self.install().await?;
                        return Ok(Some(POLL));
                    }
                    self.activate().await?;
                }
                S::Active => {
                    if self.provider.is_intact().await? {
                        return Ok(None);
                    }
                    self.events
                        .warning(
                            "Restoring",
                            format!("Bridge mount {} drifted, restoring", self.name),
                        )
                        .await;
                    self.restore().await?;
                }
                S::Terminated => return Ok(None),
            }
        }
    }

    async fn prepare(&mut self) -> Result<()> {
        self.machine.apply(&PREPARE).await?;
        self.provider.prepare().await?;
        self.events
            .normal("Preparing", format!("Preparing bridge mount {}", self.name))
            .await;
        Ok(())
    }

    async fn install(&mut self) -> Result<()> {
        if self.state() == S::Preparing && !self.provider.prepared().await? {
            return Err(Error::temporary(format!(
                "bridge mount {} is not prepared",
                self.name
            )));
        }
        self.machine.apply(&INSTALL).await?;
        self.provider.install().await
    }

    async fn activate(&mut self) -> Result<()> {
        self.machine.apply(&ACTIVATE).await?;
        self.events
            .normal("Active", format!("Bridge mount {} is active", self.name))
            .await;
        info!(mount = %self.name, "Activated");
        Ok(())
    }

    async fn restore(&mut self) -> Result<()> {
        self.machine.apply(&RESTORE).await?;
        self.provider.restore().await?;
        self.prepare().await
    }
}

/// Moves a mount whose provider could not be built into ERROR.
///
/// A mount already in ERROR or TERMINATED is left as it is.
pub async fn impair(
    mount: &GefyraBridgeMount,
    persist: Arc<dyn Persist>,
    events: Arc<dyn Events>,
    error: &Error,
) -> Result<()> {
    let mut machine = Machine::new(mount.state(), persist);
    if machine.state() == S::Error || !machine.allows(&IMPAIR) {
        return Ok(());
    }
    record_failure(&mount.name_any(), &mut machine, &*events, error).await
}

async fn record_failure(
    name: &str,
    machine: &mut Machine<S>,
    events: &dyn Events,
    error: &Error,
) -> Result<()> {
    warn!(mount = %name, state = %machine.state(), %error, "Failed");
    events.warning("Failed", error.to_string()).await;
    machine.apply(&IMPAIR).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeMount, MemoryPersist, RecordingEvents};
    use gefyra_operator_k8s_api::{MountSpec, MountStatus};
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn mount(state: S) -> GefyraBridgeMount {
        let mut mount = GefyraBridgeMount::new(
            "nginx",
            MountSpec {
                target: "deploy/nginx".to_string(),
                target_namespace: "default".to_string(),
                target_container: "nginx".to_string(),
                provider: "carrier2mount".to_string(),
                provider_parameter: Default::default(),
                sunset: None,
            },
        );
        mount.status = Some(MountStatus {
            state,
            ..Default::default()
        });
        mount
    }

    struct Harness {
        persist: Arc<MemoryPersist>,
        provider: Arc<FakeMount>,
        events: Arc<RecordingEvents>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                persist: MemoryPersist::new(),
                provider: Arc::new(FakeMount::default()),
                events: RecordingEvents::new(),
            }
        }

        fn machine(&self, state: S) -> MountMachine {
            MountMachine::new(
                &mount(state),
                self.persist.clone(),
                self.provider.clone(),
                self.events.clone(),
            )
        }
    }

    #[tokio::test]
    async fn comes_up_step_by_step() {
        let h = Harness::new();

        let mut machine = h.machine(S::Requested);
        let outcome = machine.reconcile(Utc::now()).await.unwrap();
        assert_eq!(outcome, Outcome::RequeueAfter(POLL));
        assert_eq!(machine.state(), S::Preparing);

        h.provider.set(true, false);
        let mut machine = h.machine(S::Preparing);
        assert_eq!(machine.reconcile(Utc::now()).await.unwrap(), Outcome::RequeueAfter(POLL));
        assert_eq!(machine.state(), S::Installing);

        h.provider.set(true, true);
        let mut machine = h.machine(S::Installing);
        assert_eq!(machine.reconcile(Utc::now()).await.unwrap(), Outcome::Settled);
        assert_eq!(machine.state(), S::Active);

        assert_eq!(h.persist.states(), vec!["PREPARING", "INSTALLING", "ACTIVE"]);
        assert_eq!(h.provider.calls(), vec!["prepare", "install"]);
    }

    #[tokio::test]
    async fn installing_reinstalls_until_ready() {
        let h = Harness::new();
        h.provider.set(true, false);
        let mut machine = h.machine(S::Installing);

        assert_eq!(machine.reconcile(Utc::now()).await.unwrap(), Outcome::RequeueAfter(POLL));
        assert_eq!(machine.state(), S::Installing);
        assert_eq!(h.provider.calls(), vec!["install"]);
        assert!(h.persist.states().is_empty());
    }

    #[tokio::test]
    async fn intact_mount_stays_active() {
        let h = Harness::new();
        h.provider.set(true, true);
        let mut machine = h.machine(S::Active);

        for _ in 0..3 {
            assert_eq!(machine.reconcile(Utc::now()).await.unwrap(), Outcome::Settled);
        }
        assert_eq!(machine.state(), S::Active);
        assert!(h.persist.states().is_empty());
        assert!(h.provider.calls().is_empty());
    }

    #[tokio::test]
    async fn drift_restores_and_prepares_again() {
        let h = Harness::new();
        h.provider.set(false, true);
        let mut machine = h.machine(S::Active);

        assert_eq!(machine.reconcile(Utc::now()).await.unwrap(), Outcome::RequeueAfter(POLL));
        assert_eq!(machine.state(), S::Preparing);
        assert_eq!(h.persist.states(), vec!["RESTORING", "PREPARING"]);
        assert_eq!(h.provider.calls(), vec!["restore", "prepare"]);
        assert_eq!(h.events.warnings(), vec!["Restoring"]);
    }

    #[tokio::test]
    async fn permanent_failure_impairs() {
        let h = Harness::new();
        h.provider.set(true, false);
        *h.provider.fail_install.lock() = Some("exec probes are not supported");
        let mut machine = h.machine(S::Preparing);

        assert_eq!(machine.reconcile(Utc::now()).await.unwrap(), Outcome::Settled);
        assert_eq!(machine.state(), S::Error);
        assert_eq!(h.persist.states(), vec!["INSTALLING", "ERROR"]);
        assert_eq!(h.events.warnings(), vec!["Failed"]);

        // The next pass starts over.
        *h.provider.fail_install.lock() = None;
        h.provider.set(false, false);
        let mut machine = h.machine(S::Error);
        machine.reconcile(Utc::now()).await.unwrap();
        assert_eq!(machine.state(), S::Preparing);
    }

    #[tokio::test]
    async fn error_restores_before_preparing() {
        let h = Harness::new();
        let mut machine = h.machine(S::Error);

        assert_eq!(machine.reconcile(Utc::now()).await.unwrap(), Outcome::RequeueAfter(POLL));
        assert_eq!(machine.state(), S::Preparing);
        assert_eq!(h.persist.states(), vec!["RESTORING", "PREPARING"]);
        assert_eq!(h.provider.calls(), vec!["restore", "prepare"]);
        assert!(h.events.warnings().is_empty());
    }

    #[tokio::test]
    async fn interrupted_restore_resumes() {
        let h = Harness::new();
        let mut machine = h.machine(S::Restoring);

        machine.reconcile(Utc::now()).await.unwrap();
        assert_eq!(machine.state(), S::Preparing);
        assert_eq!(h.provider.calls(), vec!["restore", "prepare"]);
    }

    #[tokio::test]
    async fn unbuildable_mounts_are_impaired_once() {
        let h = Harness::new();
        let error = Error::permanent("unknown bridge mount provider 'carrier3'");

        impair(&mount(S::Requested), h.persist.clone(), h.events.clone(), &error)
            .await
            .unwrap();
        assert_eq!(h.persist.states(), vec!["ERROR"]);
        assert_eq!(h.events.warnings(), vec!["Failed"]);

        impair(&mount(S::Error), h.persist.clone(), h.events.clone(), &error)
            .await
            .unwrap();
        impair(&mount(S::Terminated), h.persist.clone(), h.events.clone(), &error)
            .await
            .unwrap();
        assert_eq!(h.persist.states(), vec!["ERROR"]);
        assert_eq!(h.events.warnings(), vec!["Failed"]);
    }

    #[tokio::test]
    async fn terminate_uninstalls() {
        let h = Harness::new();
        let mut machine = h.machine(S::Active);
        machine.terminate().await.unwrap();
        assert_eq!(machine.state(), S::Terminated);
        assert_eq!(h.provider.calls(), vec!["uninstall"]);
    }

    #[tokio::test]
    async fn sunset_requests_deletion() {
        let h = Harness::new();
        let mut expired = mount(S::Active);
        expired.spec.sunset = Some("2000-01-01T00:00:00".to_string());
        let mut machine = MountMachine::new(
            &expired,
            h.persist.clone(),
            h.provider.clone(),
            h.events.clone(),
        );
        assert_eq!(machine.reconcile(Utc::now()).await.unwrap(), Outcome::Delete);
    }

    #[rstest]
    #[case::install_from_requested(S::Requested, &INSTALL)]
    #[case::activate_from_preparing(S::Preparing, &ACTIVATE)]
    #[case::restore_from_installing(S::Installing, &RESTORE)]
    #[case::prepare_from_active(S::Active, &PREPARE)]
    #[case::impair_from_terminated(S::Terminated, &IMPAIR)]
    #[tokio::test]
    async fn invalid_transitions_leave_state(#[case] from: S, #[case] transition: &Transition<S>) {
        let persist = MemoryPersist::new();
        let mut machine = Machine::new(from, persist.clone());
        assert!(matches!(
            machine.apply(transition).await,
            Err(Error::InvalidTransition { .. })
        ));
        assert_eq!(machine.state(), from);
        assert!(persist.states().is_empty());
    }
}
