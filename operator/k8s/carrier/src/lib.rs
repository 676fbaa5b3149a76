#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Traffic interception for bridged workloads.
//!
//! [`Carrier2Mount`] duplicates a target workload and swaps the image of
//! its pods for the carrier2 proxy. [`Carrier2`] then writes bridge rules
//! into the proxy's configuration document. [`Carrier`] drives the older
//! nginx-based carrier, which forwards whole ports.

mod bridge;
pub mod config;
pub mod control;
mod legacy;
mod mount;
pub mod snapshot;
pub mod workload;

pub use self::{bridge::Carrier2, legacy::Carrier, mount::Carrier2Mount};

use gefyra_operator_core::{Error, MountTarget, Result};
use gefyra_operator_k8s_api::{pod, Api, Client, ConfigMap, Container, Pod, ResourceExt};
use std::time::Duration;
use tokio::time::Instant;

const RESTART_TIMEOUT: Duration = Duration::from_secs(30);
const RESTART_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Clone, Debug)]
pub struct CarrierConfig {
    /// The operator namespace, home of bridges and restore snapshots.
    pub namespace: String,
    pub carrier_image: String,
    pub carrier_tag: String,
    pub carrier2_image: String,
    pub carrier2_tag: String,
    /// Runs carrier2 with debug logging.
    pub carrier2_debug: bool,
    /// How long the legacy carrier may take to come up after the swap.
    pub startup_timeout: Duration,
}

impl Default for CarrierConfig {
    fn default() -> Self {
        Self {
            namespace: "gefyra".to_string(),
            carrier_image: "quay.io/gefyra/carrier".to_string(),
            carrier_tag: "latest".to_string(),
            carrier2_image: "quay.io/gefyra/carrier2".to_string(),
            carrier2_tag: "latest".to_string(),
            carrier2_debug: false,
            startup_timeout: Duration::from_secs(60),
        }
    }
}

impl CarrierConfig {
    pub fn carrier(&self) -> String {
        format!("{}:{}", self.carrier_image, self.carrier_tag)
    }

    pub fn carrier2(&self) -> String {
        format!("{}:{}", self.carrier2_image, self.carrier2_tag)
    }
}

/// The repository of an image reference, without tag or digest.
pub(crate) fn repository(image: &str) -> &str {
    let image = image.split('@').next().unwrap_or(image);
    let name_start = image.rfind('/').map_or(0, |i| i + 1);
    match image[name_start..].find(':') {
        Some(i) => &image[..name_start + i],
        None => image,
    }
}

/// Whether the named container of `pod` runs an image of `repo`.
///
/// The status is checked, as it reflects what the kubelet actually started.
pub(crate) fn runs_image(pod: &Pod, container: &str, repo: &str) -> bool {
    pod::container_status(pod, container).map_or(false, |s| repository(&s.image) == repo)
}

/// Whether the spec of `container` already names an image of `repo`.
pub(crate) fn specifies_image(container: &Container, repo: &str) -> bool {
    container
        .image
        .as_deref()
        .map_or(false, |image| repository(image) == repo)
}

/// Saves the original settings of `container` before a carrier image of
/// `repo` replaces them.
///
/// An existing snapshot is kept, and a container already patched to the
/// carrier is never snapshotted.
pub(crate) async fn save_original(
    snapshots: &Api<ConfigMap>,
    name: &str,
    key: &str,
    container: &Container,
    repo: &str,
) -> Result<()> {
    if specifies_image(container, repo) {
        tracing::debug!(%key, "Container already patched, keeping snapshot");
        return Ok(());
    }
    if !snapshot::save(snapshots, name, key, &snapshot::Snapshot::of(container)).await? {
        tracing::debug!(%key, "Snapshot exists");
    }
    Ok(())
}

/// Sets the image of the named container of a pod and waits for the
/// container to be restarted with it.
pub(crate) async fn swap_image(
    api: &Api<Pod>,
    pod: &Pod,
    container: &str,
    image: &str,
    timeout: Duration,
) -> Result<()> {
    let name = pod.name_any();
    let before = pod::restart_count(pod, container).unwrap_or(0);
    let patch = serde_json::json!({
        "spec": { "containers": [{ "name": container, "image": image }] }
    });
    api.patch(
        &name,
        &gefyra_operator_k8s_api::PatchParams::default(),
        &gefyra_operator_k8s_api::Patch::Strategic(&patch),
    )
    .await?;
    tracing::info!(pod = %name, %container, %image, "Swapped container image");

    let deadline = Instant::now() + timeout;
    loop {
        let pod = api.get(&name).await?;
        if pod::restart_count(&pod, container).unwrap_or(0) > before {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(Error::temporary(format!(
                "container {container} of pod {name} was not restarted within {}s",
                timeout.as_secs()
            )));
        }
        tokio::time::sleep(RESTART_BACKOFF).await;
    }
}

/// Shared state of the providers acting on a mount's target.
#[derive(Clone)]
pub(crate) struct Target {
    pub client: Client,
    pub config: std::sync::Arc<CarrierConfig>,
    pub mount: MountTarget,
}

impl Target {
    pub fn pods_api(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.mount.namespace)
    }

    pub fn snapshots(&self) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    pub async fn workload(&self) -> Result<workload::Workload> {
        workload::Workload::require(&self.client, &self.mount.namespace, &self.mount.target).await
    }

    /// Pods of the original workload.
    pub async fn pods(&self) -> Result<Vec<Pod>> {
        self.workload()
            .await?
            .pods(&self.client, &self.mount.namespace)
            .await
    }
}
