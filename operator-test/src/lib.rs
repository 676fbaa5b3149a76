#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod admission;
pub mod fixtures;

use gefyra_operator_k8s_api as k8s;
use k8s_openapi::api::{apps::v1::Deployment, core::v1::{Namespace, Pod}};
use kube::{api::AttachParams, Resource};
use maplit::{btreemap, convert_args};
use serde::{de::DeserializeOwned, Serialize};
use std::{fmt::Debug, time::Duration};
use tokio::time;
use tracing::Instrument;

/// The namespace the operator under test watches.
pub const OPERATOR_NAMESPACE: &str = "gefyra";

/// Upper bound for the operator to move a resource into a state. Mounts
/// wait for image pulls and pod restarts.
pub const STATE_TIMEOUT: Duration = Duration::from_secs(180);

/// Runs a test with a random namespace that is deleted on test completion
pub async fn with_temp_ns<F, Fut>(test: F)
where
    F: FnOnce(kube::Client, String) -> Fut,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let _tracing = init_tracing();

    let namespace = format!("gefyra-operator-test-{}", random_suffix(6));

    tracing::debug!("initializing client");
    let client = kube::Client::try_default()
        .await
        .expect("failed to initialize k8s client");
    let api = kube::Api::<Namespace>::all(client.clone());

    tracing::debug!(%namespace, "creating");
    let ns = Namespace {
        metadata: k8s::ObjectMeta {
            name: Some(namespace.clone()),
            labels: Some(convert_args!(btreemap!(
                "gefyra-operator-test" => std::thread::current().name().unwrap_or(""),
            ))),
            ..Default::default()
        },
        ..Default::default()
    };
    api.create(
        &kube::api::PostParams {
            dry_run: false,
            field_manager: Some("gefyra-operator-test".to_string()),
        },
        &ns,
    )
    .await
    .expect("failed to create Namespace");

    tracing::trace!("spawning");
    let test = test(client.clone(), namespace.clone());
    let res = tokio::spawn(test.instrument(tracing::info_span!("test", %namespace))).await;
    if res.is_err() {
        // Stop tracing so that the failure is not buried under cleanup logs.
        drop(_tracing);
    }

    tracing::debug!(%namespace, "deleting");
    api.delete(&namespace, &kube::api::DeleteParams::background())
        .await
        .expect("failed to delete Namespace");
    if let Err(err) = res {
        std::panic::resume_unwind(err.into_panic());
    }
}

/// Reads `.status.state` of any Gefyra resource.
pub fn state_of<K: Serialize>(obj: &K) -> Option<String> {
    let value = serde_json::to_value(obj).ok()?;
    value["status"]["state"].as_str().map(str::to_string)
}

/// Waits until the named resource in the operator namespace is in `state`.
pub async fn await_state<K>(client: &kube::Client, name: &str, state: &str) -> K
where
    K: Resource<Scope = kube::core::NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + DeserializeOwned
        + Serialize
        + Send
        + 'static,
{
    let expected = state.to_string();
    await_until(client, name, state, move |obj: &K| {
        state_of(obj).as_deref() == Some(expected.as_str())
    })
    .await
}

/// Waits until the named resource in the operator namespace satisfies
/// `cond`. `what` describes the condition in timeout messages.
pub async fn await_until<K, F>(client: &kube::Client, name: &str, what: &str, cond: F) -> K
where
    K: Resource<Scope = kube::core::NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + DeserializeOwned
        + Send
        + 'static,
    F: Fn(&K) -> bool,
{
    let api = kube::Api::<K>::namespaced(client.clone(), OPERATOR_NAMESPACE);
    let reached = kube::runtime::wait::await_condition(api.clone(), name, move |obj: Option<&K>| {
        obj.map_or(false, &cond)
    });
    match time::timeout(STATE_TIMEOUT, reached).await {
        Ok(Ok(_)) => {}
        Ok(Err(error)) => panic!("failed to watch {name}: {error}"),
        Err(_timeout) => panic!("timeout waiting for {name} to become {what}"),
    }
    api.get(name).await.expect("resource must exist")
}

/// Waits until the latest rollout of the named Deployment has completed.
pub async fn await_rollout(client: &kube::Client, ns: &str, name: &str) -> Deployment {
    let api = kube::Api::<Deployment>::namespaced(client.clone(), ns);
    let completed = kube::runtime::wait::await_condition(
        api.clone(),
        name,
        kube::runtime::wait::conditions::is_deployment_completed(),
    );
    match time::timeout(STATE_TIMEOUT, completed).await {
        Ok(Ok(_)) => {}
        Ok(Err(error)) => panic!("failed to watch {name}: {error}"),
        Err(_timeout) => panic!("timeout waiting for {name} to roll out"),
    }
    api.get(name).await.expect("deployment must exist")
}

/// Polls `check` once a second until it holds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let poll = async {
        while !check().await {
            time::sleep(Duration::from_secs(1)).await;
        }
    };
    if time::timeout(STATE_TIMEOUT, poll).await.is_err() {
        panic!("timeout waiting for {what}");
    }
}

/// Runs `command` in a container and returns what it wrote to stdout.
pub async fn exec(
    client: &kube::Client,
    ns: &str,
    pod: &str,
    container: &str,
    command: &[&str],
) -> String {
    use tokio::io::AsyncReadExt;

    let api = kube::Api::<Pod>::namespaced(client.clone(), ns);
    let params = AttachParams::default().container(container).stderr(false);
    let mut process = api
        .exec(pod, command.iter().copied(), &params)
        .await
        .expect("exec must start");
    let mut stdout = String::new();
    if let Some(mut out) = process.stdout() {
        out.read_to_string(&mut stdout)
            .await
            .expect("stdout must be readable");
    }
    process.join().await.expect("exec must finish");
    stdout
}

/// Waits until the named resource in the operator namespace is gone.
pub async fn await_deleted<K>(client: &kube::Client, name: &str)
where
    K: Resource<Scope = kube::core::NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + DeserializeOwned
        + Send
        + 'static,
{
    let api = kube::Api::<K>::namespaced(client.clone(), OPERATOR_NAMESPACE);
    let deleted =
        kube::runtime::wait::await_condition(api, name, |obj: Option<&K>| obj.is_none());
    match time::timeout(STATE_TIMEOUT, deleted).await {
        Ok(Ok(_)) => {}
        Ok(Err(error)) => panic!("failed to watch {name}: {error}"),
        Err(_timeout) => panic!("timeout waiting for {name} to be deleted"),
    }
}

pub fn random_suffix(len: usize) -> String {
    use rand::Rng;

    let rng = &mut rand::thread_rng();
    (0..len)
        .map(|_| rng.sample(LowercaseAlphanumeric) as char)
        .collect()
}

fn init_tracing() -> tracing::subscriber::DefaultGuard {
    tracing::subscriber::set_default(
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "gefyra=trace,debug".parse().unwrap()),
            )
            .finish(),
    )
}

struct LowercaseAlphanumeric;

impl rand::distributions::Distribution<u8> for LowercaseAlphanumeric {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> u8 {
        const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
        CHARSET[rng.gen_range(0..CHARSET.len())]
    }
}
