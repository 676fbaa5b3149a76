use super::*;
use crate::testing::{FakeConnection, FakeCredentials, MemoryPersist, RecordingEvents};
use gefyra_operator_k8s_api::format_timestamp;
use maplit::btreemap;
use pretty_assertions::assert_eq;
use rstest::rstest;
use std::collections::BTreeMap;

struct Harness {
    persist: Arc<MemoryPersist>,
    provider: Arc<FakeConnection>,
    credentials: Arc<FakeCredentials>,
    events: Arc<RecordingEvents>,
}

impl Harness {
    fn new() -> Self {
        Self {
            persist: MemoryPersist::new(),
            provider: Arc::new(FakeConnection::default()),
            credentials: Arc::new(FakeCredentials::default()),
            events: RecordingEvents::new(),
        }
    }

    fn machine(&self, client: &GefyraClient) -> ClientMachine {
        ClientMachine::new(
            client,
            self.persist.clone(),
            self.provider.clone(),
            self.credentials.clone(),
            self.events.clone(),
        )
    }
}

fn client(state: S, params: BTreeMap<String, String>) -> GefyraClient {
    let mut client = GefyraClient::new(
        "alice",
        ClientSpec {
            provider: "stowaway".to_string(),
            provider_parameter: params,
            sunset: None,
            max_connection_age: None,
        },
    );
    client.status = Some(ClientStatus {
        state,
        ..Default::default()
    });
    client
}

fn subnet() -> BTreeMap<String, String> {
    btreemap! { "subnet".to_string() => "192.168.101.0/24".to_string() }
}

#[tokio::test]
async fn requested_client_waits_for_parameters() {
    let h = Harness::new();
    let mut machine = h.machine(&client(S::Requested, BTreeMap::new()));

    let outcome = machine.reconcile(Utc::now()).await.unwrap();
    assert_eq!(outcome, Outcome::Settled);
    assert_eq!(machine.state(), S::Waiting);
    assert_eq!(h.persist.states(), vec!["CREATING", "WAITING"]);
    assert!(h.credentials.accounts.lock().contains("gefyra-client-alice"));
    assert_eq!(
        h.persist.status_patches(),
        vec![json!({
            "serviceAccountName": "gefyra-client-alice",
            "serviceAccount": { "token": "t0k3n" },
        })]
    );
}

#[tokio::test]
async fn parameters_activate_and_clearing_disables() {
    let h = Harness::new();
    let mut machine = h.machine(&client(S::Waiting, subnet()));
    machine.reconcile(Utc::now()).await.unwrap();
    assert_eq!(machine.state(), S::Active);
    assert_eq!(h.persist.states(), vec!["ENABLING", "ACTIVE"]);
    assert!(h.provider.peers.lock().contains("alice"));
    let patches = h.persist.status_patches();
    assert_eq!(
        patches.last().unwrap()["providerConfig"]["Interface.Address"],
        "192.168.99.2"
    );

    // The user cleared the parameters.
    let mut active = client(S::Active, BTreeMap::new());
    active.status.as_mut().unwrap().provider_config =
        btreemap! { "Interface.Address".to_string() => "192.168.99.2".to_string() };
    let mut machine = h.machine(&active);
    machine.reconcile(Utc::now()).await.unwrap();
    assert_eq!(machine.state(), S::Waiting);
    assert_eq!(
        h.persist.states(),
        vec!["ENABLING", "ACTIVE", "DISABLING", "WAITING"]
    );
    assert!(h.provider.peers.lock().is_empty());
    assert_eq!(
        h.persist.status_patches().last().unwrap(),
        &json!({ "providerConfig": null })
    );
    assert!(h.persist.spec_patches().is_empty());
}

#[tokio::test]
async fn existing_peer_impairs_activation() {
    let h = Harness::new();
    h.provider.peers.lock().insert("alice".to_string());
    let mut machine = h.machine(&client(S::Waiting, subnet()));

    let outcome = machine.reconcile(Utc::now()).await.unwrap();
    assert_eq!(outcome, Outcome::Settled);
    assert_eq!(machine.state(), S::Error);
    assert_eq!(h.persist.states(), vec!["ENABLING", "ACTIVE", "ERROR"]);
    assert_eq!(h.events.warnings(), vec!["Failed"]);
}

#[tokio::test]
async fn error_recovers_towards_resource() {
    let h = Harness::new();
    let mut errored = client(S::Error, BTreeMap::new());
    errored.status.as_mut().unwrap().service_account_name = Some("gefyra-client-alice".to_string());
    let mut machine = h.machine(&errored);

    machine.reconcile(Utc::now()).await.unwrap();
    assert_eq!(machine.state(), S::Waiting);
    assert_eq!(h.persist.states(), vec!["WAITING"]);
}

#[tokio::test]
async fn max_connection_age_disconnects() {
    let h = Harness::new();
    let now = Utc::now();
    let mut active = client(S::Active, subnet());
    active.spec.max_connection_age = Some(60);
    let status = active.status.as_mut().unwrap();
    status.provider_config = btreemap! { "Peer.Endpoint".to_string() => "relay:31820".to_string() };
    status.state_transitions = btreemap! {
        "ACTIVE".to_string() => format_timestamp(now - chrono::Duration::seconds(30)),
    };

    let mut machine = h.machine(&active);
    let outcome = machine.reconcile(now).await.unwrap();
    assert_eq!(machine.state(), S::Active);
    match outcome {
        Outcome::RequeueAfter(left) => assert!(left <= Duration::from_secs(30)),
        other => panic!("unexpected outcome: {other:?}"),
    }

    let later = now + chrono::Duration::seconds(31);
    let outcome = machine.reconcile(later).await.unwrap();
    assert_eq!(outcome, Outcome::Settled);
    assert_eq!(machine.state(), S::Waiting);
    assert_eq!(
        h.persist.spec_patches(),
        vec![json!({ "providerParameter": null })]
    );
}

#[tokio::test]
async fn provider_default_age_applies() {
    let h = Harness {
        provider: Arc::new(FakeConnection {
            max_age: Some(5),
            ..Default::default()
        }),
        ..Harness::new()
    };
    let now = Utc::now();
    let mut active = client(S::Active, subnet());
    let status = active.status.as_mut().unwrap();
    status.provider_config = btreemap! { "Peer.Endpoint".to_string() => "relay:31820".to_string() };
    status.state_transitions = btreemap! {
        "ACTIVE".to_string() => format_timestamp(now - chrono::Duration::seconds(10)),
    };

    let mut machine = h.machine(&active);
    machine.reconcile(now).await.unwrap();
    assert_eq!(machine.state(), S::Waiting);
}

#[tokio::test]
async fn sunset_requests_deletion() {
    let h = Harness::new();
    let mut expired = client(S::Waiting, BTreeMap::new());
    expired.spec.sunset = Some("2020-01-01T00:00:00Z".to_string());
    let mut machine = h.machine(&expired);

    assert_eq!(machine.reconcile(Utc::now()).await.unwrap(), Outcome::Delete);
    assert!(h.persist.states().is_empty());
}

#[tokio::test]
async fn terminate_releases_everything() {
    let h = Harness::new();
    h.provider.peers.lock().insert("alice".to_string());
    h.credentials
        .accounts
        .lock()
        .insert("gefyra-client-alice".to_string());
    let mut machine = h.machine(&client(S::Active, subnet()));

    machine.terminate().await.unwrap();
    assert_eq!(machine.state(), S::Terminating);
    assert!(h.provider.peers.lock().is_empty());
    assert!(h.credentials.accounts.lock().is_empty());
}

#[rstest]
#[case::enable_from_requested(S::Requested, &ENABLE)]
#[case::activate_from_waiting(S::Waiting, &ACTIVATE)]
#[case::disable_from_waiting(S::Waiting, &DISABLE)]
#[case::wait_from_active(S::Active, &WAIT)]
#[case::create_from_active(S::Active, &CREATE)]
#[case::impair_from_terminating(S::Terminating, &IMPAIR)]
#[tokio::test]
async fn invalid_transitions_leave_state(#[case] from: S, #[case] transition: &Transition<S>) {
    let persist = MemoryPersist::new();
    let mut machine = Machine::new(from, persist.clone());
    let error = machine.apply(transition).await.unwrap_err();
    assert!(matches!(error, Error::InvalidTransition { .. }));
    assert_eq!(machine.state(), from);
    assert!(persist.states().is_empty());
}
