use crate::{
    config::{self, Config},
    control, runs_image, save_original, snapshot, swap_image,
    workload::{self, Workload},
    CarrierConfig, Target, RESTART_TIMEOUT,
};
use chrono::Utc;
use gefyra_operator_core::{BridgeMountProvider, Error, MountTarget, Result};
use gefyra_operator_k8s_api::{
    labels, objects, pod, Api, BridgeState, Client, Deployment, GefyraBridge, ListParams, Patch,
    PatchParams, Pod, ResourceExt, Service, StatefulSet, WorkloadKind,
};
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};

const SNAPSHOTS: &str = "gefyra-carrier2-restore-configmap";

/// Retry delay while the target is rolling out.
const ROLLOUT_RETRY: Duration = Duration::from_secs(5);

/// Intercepts a workload by duplicating it and running carrier2 in place of
/// the original container.
///
/// The duplicate keeps serving traffic that no bridge matches.
#[derive(Clone)]
pub struct Carrier2Mount {
    target: Target,
}

// === impl Carrier2Mount ===

impl Carrier2Mount {
    pub const NAME: &'static str = "carrier2mount";

    pub fn new(client: Client, config: Arc<CarrierConfig>, mount: MountTarget) -> Self {
        Self {
            target: Target {
                client,
                config,
                mount,
            },
        }
    }

    fn mount(&self) -> &MountTarget {
        &self.target.mount
    }

    async fn shadow_pods(&self) -> Result<Vec<Pod>> {
        let shadow = self.mount().target.shadow();
        match Workload::get(&self.target.client, &self.mount().namespace, &shadow).await? {
            Some(w) => w.pods(&self.target.client, &self.mount().namespace).await,
            None => Ok(Vec::new()),
        }
    }

    async fn shadow_ready(&self) -> Result<bool> {
        let pods = self.shadow_pods().await?;
        let container = &self.mount().container;
        Ok(!pods.is_empty() && pods.iter().all(|p| pod::ready_and_healthy(p, container)))
    }

    /// The document for pods of the target, with the rules of every bridge
    /// already attached to this mount.
    async fn build_config(&self, container: &gefyra_operator_k8s_api::Container) -> Result<Config> {
        let mount = self.mount();
        let host = workload::service_host(&mount.target, &mount.container, &mount.namespace);
        let mut config = Config::for_container(container, &host, mount.parameters.tls.as_ref());

        let bridges = Api::<GefyraBridge>::namespaced(
            self.target.client.clone(),
            &self.target.config.namespace,
        )
        .list(&ListParams::default().labels(&format!("{}={}", labels::BRIDGE_MOUNT, mount.name)))
        .await?;
        for bridge in bridges.items {
            if bridge.state() == BridgeState::Removing {
                continue;
            }
            let name = bridge.name_any();
            let Ok(mappings) = bridge.spec.port_mappings() else {
                continue;
            };
            let endpoints = bridge
                .status
                .as_ref()
                .map(|s| &s.cluster_endpoint);
            for mapping in mappings {
                let Some(endpoint) = endpoints.and_then(|e| e.get(&mapping.target.to_string()))
                else {
                    continue;
                };
                let entry = config::Bridge {
                    endpoint: endpoint.clone(),
                    rules: bridge.spec.provider_parameter.rules.clone(),
                };
                if let Err(error) = config.upsert_bridge(mapping.target, &name, entry) {
                    warn!(bridge = %name, %error, "Skipping bridge");
                }
            }
        }
        Ok(config)
    }

    /// Snapshot keys of the target's current pods. A missing target has none.
    async fn snapshot_keys(&self) -> Result<Vec<String>> {
        let mount = self.mount();
        let Some(workload) =
            Workload::get(&self.target.client, &mount.namespace, &mount.target).await?
        else {
            return Ok(Vec::new());
        };
        let pods = workload.pods(&self.target.client, &mount.namespace).await?;
        Ok(snapshot::keys_of(&mount.namespace, &pods))
    }

    async fn restore_pods(&self) -> Result<()> {
        let api = self.target.pods_api();
        let snapshots = self.target.snapshots();
        let container = &self.mount().container;
        for pod in self.target.pods().await? {
            let key = snapshot::key(&self.mount().namespace, &pod.name_any());
            let Some(snap) = snapshot::load(&snapshots, SNAPSHOTS, &key).await? else {
                warn!(pod = %pod.name_any(), "No snapshot to restore from");
                continue;
            };
            api.patch(
                &pod.name_any(),
                &PatchParams::default(),
                &Patch::Strategic(&snap.restore_patch(container)),
            )
            .await?;
            snapshot::forget(&snapshots, SNAPSHOTS, &key).await?;
            info!(pod = %pod.name_any(), "Restored original container");
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl BridgeMountProvider for Carrier2Mount {
    async fn prepare(&self) -> Result<()> {
        let mount = self.mount();
        let original = self.target.workload().await?;
        if original.container(&mount.container).is_none() {
            return Err(Error::permanent(format!(
                "container {} not found in {}",
                mount.container, mount.target
            )));
        }
        // A repeated prepare keeps the id so the shadow is not rolled again.
        let existing =
            Workload::get(&self.target.client, &mount.namespace, &mount.target.shadow()).await?;
        let id = existing
            .as_ref()
            .and_then(|w| w.duplication_id())
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let shadow = original.duplicate(&id);
        shadow.apply(&self.target.client, &mount.namespace).await?;
        info!(target = %mount.target, shadow = %shadow.name(), "Duplicated workload");

        let svc = shadow.service(&mount.target, &mount.container)?;
        objects::create_or_apply(
            &Api::<Service>::namespaced(self.target.client.clone(), &mount.namespace),
            &svc,
        )
        .await?;
        info!(service = %svc.name_any(), "Created shadow service");
        Ok(())
    }

    async fn prepared(&self) -> Result<bool> {
        self.shadow_ready().await
    }

    async fn install(&self) -> Result<()> {
        let mount = self.mount();
        let original = self.target.workload().await?;
        let pods = original.pods(&self.target.client, &mount.namespace).await?;
        if pod::owner_names(&pods).len() > 1 {
            return Err(Error::temporary_after(
                format!("{} is rolling out", mount.target),
                ROLLOUT_RETRY,
            ));
        }
        let container = original.container(&mount.container).ok_or_else(|| {
            Error::permanent(format!(
                "container {} not found in {}",
                mount.container, mount.target
            ))
        })?;
        config::check_probes(container)?;

        let api = self.target.pods_api();
        let snapshots = self.target.snapshots();
        let image = self.target.config.carrier2();
        for pod in &pods {
            if runs_image(pod, &mount.container, &self.target.config.carrier2_image) {
                debug!(pod = %pod.name_any(), "Carrier2 already installed");
                continue;
            }
            let Some(current) = pod::container(pod, &mount.container) else {
                return Err(Error::permanent(format!(
                    "container {} not found in pod {}",
                    mount.container,
                    pod.name_any()
                )));
            };
            let key = snapshot::key(&mount.namespace, &pod.name_any());
            save_original(
                &snapshots,
                SNAPSHOTS,
                &key,
                current,
                &self.target.config.carrier2_image,
            )
            .await?;
            swap_image(&api, pod, &mount.container, &image, RESTART_TIMEOUT).await?;
        }

        let config = self.build_config(container).await?;
        for pod in &pods {
            control::commit(
                &api,
                &pod.name_any(),
                &mount.container,
                &config,
                self.target.config.carrier2_debug,
            )
            .await?;
        }
        Ok(())
    }

    async fn ready(&self) -> Result<bool> {
        let mount = self.mount();
        let shadow = self.shadow_pods().await?;
        if shadow.is_empty() || !shadow.iter().all(|p| pod::ready_and_healthy(p, &mount.container)) {
            return Ok(false);
        }
        let pods = self.target.pods().await?;
        let carrier = &self.target.config.carrier2_image;
        let installed = pods.iter().all(|p| {
            runs_image(p, &mount.container, carrier) && pod::ready_and_healthy(p, &mount.container)
        });
        if pods.is_empty() || !installed || pods.len() != shadow.len() {
            return Ok(false);
        }
        let api = self.target.pods_api();
        for pod in &pods {
            match control::read(&api, &pod.name_any(), &mount.container).await? {
                Some(config) if config.has_upstream() => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    async fn restore(&self) -> Result<()> {
        let mount = self.mount();
        let restarted_at = labels::RESTARTED_AT;
        let patch = json!({
            "spec": { "template": { "metadata": { "annotations": {
                restarted_at: gefyra_operator_k8s_api::format_timestamp(Utc::now()),
            } } } }
        });
        let name = &mount.target.name;
        let params = PatchParams::default();
        let client = self.target.client.clone();
        // The rollout replaces the pods, so their snapshots go with them.
        let keys = self.snapshot_keys().await?;
        let res = match mount.target.kind {
            WorkloadKind::Pod => return self.restore_pods().await,
            WorkloadKind::Deployment => Api::<Deployment>::namespaced(client, &mount.namespace)
                .patch(name, &params, &Patch::Strategic(&patch))
                .await
                .map(|_| ()),
            WorkloadKind::StatefulSet => Api::<StatefulSet>::namespaced(client, &mount.namespace)
                .patch(name, &params, &Patch::Strategic(&patch))
                .await
                .map(|_| ()),
        };
        match res {
            Ok(()) => {
                info!(target = %mount.target, "Restarted workload");
                snapshot::forget_all(&self.target.snapshots(), SNAPSHOTS, &keys).await
            }
            Err(error) if objects::is_status(&error, 404) => {
                warn!(target = %mount.target, "Workload to restore is gone");
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn uninstall(&self) -> Result<()> {
        let mount = self.mount();
        let shadow = mount.target.shadow();
        if !workload::delete(&self.target.client, &mount.namespace, &shadow).await? {
            warn!(shadow = %shadow, "Shadow workload not found");
        }
        let svc = workload::service_name(&mount.target, &mount.container);
        let services = Api::<Service>::namespaced(self.target.client.clone(), &mount.namespace);
        if !objects::delete(&services, &svc).await? {
            warn!(service = %svc, "Shadow service not found");
        }
        self.restore().await
    }
}
