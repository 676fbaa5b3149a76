#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! A WireGuard relay terminating client tunnels inside the cluster.
//!
//! Peers are kept in the relay's config ConfigMap; adding or removing one
//! restarts the relay. Routes into the tunnels are kept in a second
//! ConfigMap the relay watches.

pub mod peers;
pub mod resources;
pub mod routes;

use chrono::Utc;
use gefyra_operator_core::{ConnectionProvider, Error, Result};
use gefyra_operator_k8s_api::{
    objects,
    pod::{self, ExecOutput},
    Api, Client, ConfigMap, DeleteParams, ListParams, Patch, PatchParams, PeerStatus, Pod,
    ResourceExt, Service, ServiceAccount,
};
use k8s_openapi::api::apps::v1::StatefulSet;
use serde_json::json;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tracing::{debug, info, warn};

/// Attempts of a read-modify-write on a shared ConfigMap.
const CONFLICT_RETRIES: usize = 3;

const RELOAD_ROUTES: &[&str] = &["/stowaway/proxyroutes-reload.sh"];

const MAX_AGE_KEY: &str = "DEFAULT_MAX_CONNECTION_AGE";

#[derive(Clone, Debug)]
pub struct StowawayConfig {
    pub namespace: String,
    pub image: String,
    pub tag: String,
    pub image_pull_policy: String,
    /// The node port of the tunnel endpoint.
    pub server_port: u16,
    pub server_port_tcp: u16,
    pub puid: String,
    pub pgid: String,
    pub peer_dns: String,
    /// Where the relay writes peer configs.
    pub peer_config_path: String,
    pub internal_subnet: String,
    pub storage_mi: u32,
    /// How long the relay may take to become ready.
    pub startup_timeout: Duration,
}

impl Default for StowawayConfig {
    fn default() -> Self {
        Self {
            namespace: "gefyra".to_string(),
            image: "quay.io/gefyra/stowaway".to_string(),
            tag: "latest".to_string(),
            image_pull_policy: "IfNotPresent".to_string(),
            server_port: 31820,
            server_port_tcp: 31821,
            puid: "1000".to_string(),
            pgid: "1000".to_string(),
            peer_dns: "auto".to_string(),
            peer_config_path: "/config/".to_string(),
            internal_subnet: "192.168.99.0".to_string(),
            storage_mi: 64,
            startup_timeout: Duration::from_secs(180),
        }
    }
}

#[derive(Clone)]
pub struct Stowaway {
    client: Client,
    config: Arc<StowawayConfig>,
}

// === impl Stowaway ===

impl Stowaway {
    pub const NAME: &'static str = "stowaway";

    pub fn new(client: Client, config: Arc<StowawayConfig>) -> Self {
        Self { client, config }
    }

    fn api<K>(&self) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    /// Looks the relay pod up; it is recreated on every restart.
    async fn find_pod(&self) -> Result<Option<Pod>> {
        let selector = gefyra_operator_k8s_api::labels::selector(&resources::labels());
        let pods = self
            .api::<Pod>()
            .list(&ListParams::default().labels(&selector))
            .await?;
        Ok(pods
            .items
            .into_iter()
            .find(|p| p.metadata.deletion_timestamp.is_none()))
    }

    async fn pod(&self) -> Result<Pod> {
        self.find_pod()
            .await?
            .ok_or_else(|| Error::temporary("no stowaway pod found"))
    }

    async fn exec(&self, command: &[&str]) -> Result<ExecOutput> {
        let pod = self.pod().await?;
        let out = pod::exec(
            &self.api(),
            &pod.name_any(),
            Some(resources::CONTAINER),
            command.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
        )
        .await?;
        Ok(out)
    }

    async fn data(&self, name: &str) -> Result<BTreeMap<String, String>> {
        let cm = self.api::<ConfigMap>().get_opt(name).await?;
        Ok(cm.and_then(|cm| cm.data).unwrap_or_default())
    }

    /// Applies `edit` to the data of a ConfigMap and writes it back unless
    /// the edit reports no change. Concurrent writers are retried from a
    /// fresh read.
    async fn update<T>(
        &self,
        name: &str,
        mut edit: impl FnMut(&mut BTreeMap<String, String>) -> Result<(T, bool)>,
    ) -> Result<T> {
        let api = self.api::<ConfigMap>();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut cm = api.get(name).await?;
            let mut data = cm.data.take().unwrap_or_default();
            let (value, changed) = edit(&mut data)?;
            if !changed {
                return Ok(value);
            }
            cm.data = Some(data);
            match api.replace(name, &Default::default(), &cm).await {
                Ok(_) => return Ok(value),
                Err(error) if objects::is_status(&error, 409) && attempt < CONFLICT_RETRIES => {
                    debug!(configmap = %name, attempt, "Conflicting update, retrying");
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    /// Deletes the relay pod and waits for its replacement to become ready.
    async fn restart(&self) -> Result<()> {
        let pod = self.pod().await?;
        let old = pod.uid();
        info!(pod = %pod.name_any(), "Restarting stowaway");
        let params = DeleteParams {
            grace_period_seconds: Some(0),
            ..Default::default()
        };
        if let Err(error) = self.api::<Pod>().delete(&pod.name_any(), &params).await {
            if !objects::is_status(&error, 404) {
                return Err(error.into());
            }
        }

        let wait = async {
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                if let Some(pod) = self.find_pod().await? {
                    if pod.uid() != old && pod::first_container_ready(&pod) {
                        return Ok::<_, Error>(());
                    }
                }
            }
        };
        match tokio::time::timeout(self.config.startup_timeout, wait).await {
            Ok(res) => res,
            Err(_) => Err(Error::temporary(format!(
                "stowaway did not become ready within {}s",
                self.config.startup_timeout.as_secs()
            ))),
        }
    }

    /// Wakes the relay so that it picks up changed routes.
    ///
    /// Failures are logged only; the relay also reloads on its own.
    async fn notify(&self) {
        let pod = match self.pod().await {
            Ok(pod) => pod,
            Err(error) => {
                warn!(%error, "Cannot notify stowaway");
                return;
            }
        };
        let name = pod.name_any();
        let stamp = Utc::now().format("%Y%m%d%H%M%S").to_string();
        let patch = json!({
            "metadata": {
                "annotations": { "operator": format!("update-notification-{stamp}") }
            }
        });
        if let Err(error) = self
            .api::<Pod>()
            .patch(&name, &PatchParams::default(), &Patch::Merge(patch))
            .await
        {
            warn!(pod = %name, %error, "Failed to annotate stowaway");
        }
        match self.exec(RELOAD_ROUTES).await {
            Ok(out) if out.success => debug!(pod = %name, "Reloaded proxy routes"),
            Ok(out) => debug!(pod = %name, output = %out.merged(), "Proxy route reload failed"),
            Err(error) => debug!(pod = %name, %error, "Proxy route reload failed"),
        }
    }

    fn peer_config_file(&self, peer: &str) -> String {
        format!(
            "{}/peer_{peer}/peer_{peer}.conf",
            self.config.peer_config_path.trim_end_matches('/')
        )
    }
}

#[async_trait::async_trait]
impl ConnectionProvider for Stowaway {
    async fn install(&self) -> Result<()> {
        let config = &self.config;
        objects::create_or_apply(&self.api(), &resources::service_account(config)).await?;
        // Both ConfigMaps hold state and are never overwritten.
        objects::create_if_missing(&self.api(), &resources::proxy_routes(config)).await?;
        objects::create_if_missing(&self.api(), &resources::config_map(config)).await?;
        objects::create_or_apply(&self.api(), &resources::stateful_set(config)).await?;
        objects::create_or_apply(&self.api(), &resources::wireguard_service(config)).await?;
        info!(namespace = %config.namespace, "Installed stowaway");
        Ok(())
    }

    async fn installed(&self) -> Result<bool> {
        Ok(self
            .api::<ServiceAccount>()
            .get_opt(resources::NAME)
            .await?
            .is_some()
            && self.api::<ConfigMap>().get_opt(resources::PROXY_ROUTES).await?.is_some()
            && self.api::<ConfigMap>().get_opt(resources::CONFIG).await?.is_some()
            && self.api::<StatefulSet>().get_opt(resources::NAME).await?.is_some()
            && self
                .api::<Service>()
                .get_opt(resources::WIREGUARD_SERVICE)
                .await?
                .is_some())
    }

    async fn uninstall(&self) -> Result<()> {
        let services = self.api::<Service>();
        let selector = "gefyra.dev/app=stowaway,gefyra.dev/role=proxy";
        for svc in services.list(&ListParams::default().labels(selector)).await? {
            objects::delete(&services, &svc.name_any()).await?;
        }
        objects::delete(&services, resources::WIREGUARD_SERVICE).await?;
        objects::delete(&self.api::<StatefulSet>(), resources::NAME).await?;
        objects::delete(&self.api::<ConfigMap>(), resources::CONFIG).await?;
        objects::delete(&self.api::<ConfigMap>(), resources::PROXY_ROUTES).await?;
        objects::delete(&self.api::<ServiceAccount>(), resources::NAME).await?;
        info!(namespace = %self.config.namespace, "Uninstalled stowaway");
        Ok(())
    }

    async fn ready(&self) -> Result<bool> {
        Ok(self
            .find_pod()
            .await?
            .map_or(false, |pod| pod::first_container_ready(&pod)))
    }

    async fn add_peer(&self, peer: &str, params: &BTreeMap<String, String>) -> Result<()> {
        let name = peers::sanitize(peer);
        let subnet = params.get("subnet").map(String::as_str);
        let added = self
            .update(resources::CONFIG, |data| {
                let added = peers::add(data, &name, subnet);
                Ok((added, added))
            })
            .await?;
        if added {
            info!(peer = %name, ?subnet, "Added peer");
            self.restart().await?;
        }
        Ok(())
    }

    async fn remove_peer(&self, peer: &str) -> Result<()> {
        let name = peers::sanitize(peer);
        let removed = self
            .update(resources::CONFIG, |data| {
                let removed = peers::remove(data, &name);
                Ok((removed, removed))
            })
            .await?;
        if !removed {
            return Ok(());
        }
        info!(peer = %name, "Removed peer");
        let dir = format!(
            "{}/peer_{name}",
            self.config.peer_config_path.trim_end_matches('/')
        );
        let out = self.exec(&["rm", "-rf", dir.as_str()]).await?;
        if !out.success {
            warn!(peer = %name, output = %out.merged(), "Failed to remove peer config");
        }
        self.restart().await
    }

    async fn peer_exists(&self, peer: &str) -> Result<bool> {
        let data = self.data(resources::CONFIG).await?;
        Ok(peers::contains(&data, &peers::sanitize(peer)))
    }

    async fn get_peer_config(&self, peer: &str) -> Result<BTreeMap<String, String>> {
        let name = peers::sanitize(peer);
        if !self.peer_exists(peer).await? {
            return Err(Error::temporary(format!("peer {name} does not exist")));
        }
        let file = self.peer_config_file(&name);
        let out = self.exec(&["cat", file.as_str()]).await?;
        let config = peers::parse_wireguard_config(&out.stdout);
        if !out.success || config.is_empty() {
            return Err(Error::temporary(format!(
                "config of peer {name} is not available yet"
            )));
        }
        Ok(config)
    }

    async fn add_destination(&self, peer: &str, host: &str, port: u16) -> Result<String> {
        let name = peers::sanitize(peer);
        let destination = routes::destination(host, port);
        let route = self
            .update(resources::PROXY_ROUTES, |table| {
                if let Some(route) = routes::find(table, &name, &destination) {
                    return Ok((route, false));
                }
                let route = routes::insert(table, &name, &destination, &mut rand::thread_rng())
                    .map_err(|e| Error::permanent(e.to_string()))?;
                Ok((route, true))
            })
            .await?;
        let svc = resources::proxy_service(&self.config, route.port, &name, &destination);
        objects::create_or_apply(&self.api(), &svc).await?;
        self.notify().await;
        info!(peer = %name, %destination, port = route.port, "Added route");
        Ok(resources::proxy_endpoint(&self.config, route.port))
    }

    async fn remove_destination(&self, peer: &str, host: &str, port: u16) -> Result<()> {
        let name = peers::sanitize(peer);
        let destination = routes::destination(host, port);
        let removed = self
            .update(resources::PROXY_ROUTES, |table| {
                let route = routes::remove(table, &name, &destination);
                let changed = route.is_some();
                Ok((route, changed))
            })
            .await?;
        if let Some(route) = removed {
            let svc = resources::proxy_service_name(route.port);
            objects::delete(&self.api::<Service>(), &svc).await?;
            self.notify().await;
            info!(peer = %name, %destination, port = route.port, "Removed route");
        }
        Ok(())
    }

    async fn destination_exists(&self, peer: &str, host: &str, port: u16) -> Result<bool> {
        let table = self.data(resources::PROXY_ROUTES).await?;
        Ok(routes::find(&table, &peers::sanitize(peer), &routes::destination(host, port)).is_some())
    }

    async fn get_destination(&self, peer: &str, host: &str, port: u16) -> Result<String> {
        let table = self.data(resources::PROXY_ROUTES).await?;
        let destination = routes::destination(host, port);
        match routes::find(&table, &peers::sanitize(peer), &destination) {
            Some(route) => Ok(resources::proxy_endpoint(&self.config, route.port)),
            None => Err(Error::temporary(format!(
                "no route to {destination} for {peer}"
            ))),
        }
    }

    async fn validate(&self, peer: &str, params: &BTreeMap<String, String>) -> Result<()> {
        let Some(subnet) = params.get("subnet") else {
            return Ok(());
        };
        let data = self.data(resources::CONFIG).await?;
        peers::check_subnet(&data, &peers::sanitize(peer), subnet)
            .map(|_| ())
            .map_err(|e| Error::permanent(e.to_string()))
    }

    async fn peer_status(&self) -> Result<Vec<PeerStatus>> {
        let out = self.exec(&["wg", "show", "all", "dump"]).await?;
        if !out.success {
            return Err(Error::temporary(format!(
                "wg show failed: {}",
                out.merged().trim()
            )));
        }
        Ok(peers::parse_wg_dump(&out.stdout))
    }

    async fn default_max_connection_age(&self) -> Result<Option<u64>> {
        let data = self.data(resources::CONFIG).await?;
        Ok(data.get(MAX_AGE_KEY).and_then(|age| age.trim().parse().ok()))
    }
}
