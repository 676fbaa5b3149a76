use crate::{config, runs_image, save_original, snapshot, swap_image, CarrierConfig, Target};
use gefyra_operator_core::{BridgeProvider, Error, MountTarget, ProxyRoute, Result};
use gefyra_operator_k8s_api::{pod, rules::Rule, Client, Patch, PatchParams, Pod, ResourceExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

const SNAPSHOTS: &str = "gefyra-carrier-restore-configmap";
const NGINX_CONFIG: &str = "/tmp/nginx.conf";

/// The nginx-based carrier. It forwards whole container ports to a client
/// and knows no match rules.
#[derive(Clone)]
pub struct Carrier {
    target: Target,
}

/// The nginx stanza the carrier writes for a forwarded port.
fn stanza(port: u16, destination: &str) -> String {
    format!(
        "upstream stowaway-{port} {{server {destination};}} \
         server {{listen {port}; proxy_pass stowaway-{port};}}"
    )
}

// === impl Carrier ===

impl Carrier {
    pub const NAME: &'static str = "carrier";

    pub fn new(client: Client, config: Arc<CarrierConfig>, mount: MountTarget) -> Self {
        Self {
            target: Target {
                client,
                config,
                mount,
            },
        }
    }

    fn container(&self) -> &str {
        &self.target.mount.container
    }

    async fn busybox(&self, pod: &Pod, script: &str, arguments: &[&str]) -> Result<String> {
        let mut command = vec!["/bin/busybox", "sh", script];
        command.extend_from_slice(arguments);
        let out = pod::exec(
            &self.target.pods_api(),
            &pod.name_any(),
            Some(self.container()),
            command,
        )
        .await?;
        Ok(out.merged())
    }

    fn installed_in(&self, pods: &[Pod]) -> bool {
        let image = &self.target.config.carrier_image;
        !pods.is_empty() && pods.iter().all(|p| runs_image(p, self.container(), image))
    }
}

#[async_trait::async_trait]
impl BridgeProvider for Carrier {
    async fn install(&self) -> Result<()> {
        let api = self.target.pods_api();
        let snapshots = self.target.snapshots();
        let image = self.target.config.carrier();
        let namespace = &self.target.mount.namespace;
        for pod in self.target.pods().await? {
            let Some(container) = pod::container(&pod, self.container()).cloned() else {
                return Err(Error::permanent(format!(
                    "container {} not found in pod {}",
                    self.container(),
                    pod.name_any()
                )));
            };
            if runs_image(&pod, self.container(), &self.target.config.carrier_image) {
                debug!(pod = %pod.name_any(), "Carrier already installed");
                continue;
            }
            let key = snapshot::key(namespace, &pod.name_any());
            save_original(
                &snapshots,
                SNAPSHOTS,
                &key,
                &container,
                &self.target.config.carrier_image,
            )
            .await?;
            swap_image(
                &api,
                &pod,
                self.container(),
                &image,
                self.target.config.startup_timeout,
            )
            .await?;
            for port in config::http_probe_ports(&container) {
                let port = port.to_string();
                let out = self.busybox(&pod, "setprobe.sh", &[port.as_str()]).await?;
                debug!(pod = %pod.name_any(), %port, %out, "Set probe");
            }
        }
        Ok(())
    }

    async fn installed(&self) -> Result<bool> {
        let pods = self.target.pods().await?;
        Ok(self.installed_in(&pods))
    }

    async fn ready(&self) -> Result<bool> {
        let pods = self.target.pods().await?;
        Ok(self.installed_in(&pods) && pods.iter().all(pod::all_containers_ready))
    }

    async fn uninstall(&self) -> Result<()> {
        let api = self.target.pods_api();
        let snapshots = self.target.snapshots();
        for pod in self.target.pods().await? {
            let key = snapshot::key(&self.target.mount.namespace, &pod.name_any());
            let Some(snap) = snapshot::load(&snapshots, SNAPSHOTS, &key).await? else {
                warn!(pod = %pod.name_any(), "No snapshot to restore from");
                continue;
            };
            api.patch(
                &pod.name_any(),
                &PatchParams::default(),
                &Patch::Strategic(&snap.restore_patch(self.container())),
            )
            .await?;
            snapshot::forget(&snapshots, SNAPSHOTS, &key).await?;
            info!(pod = %pod.name_any(), "Restored original container");
        }
        Ok(())
    }

    async fn add_proxy_route(&self, route: &ProxyRoute) -> Result<()> {
        let port = route.container_port.to_string();
        for pod in self.target.pods().await? {
            let out = self
                .busybox(&pod, "setroute.sh", &[port.as_str(), route.destination.as_str()])
                .await?;
            info!(pod = %pod.name_any(), %port, destination = %route.destination, %out, "Set route");
        }
        Ok(())
    }

    async fn remove_proxy_route(&self, container_port: u16, destination: &str) -> Result<()> {
        // Routes go away with the carrier itself.
        debug!(port = container_port, %destination, "Keeping carrier route");
        Ok(())
    }

    async fn proxy_route_exists(&self, container_port: u16, destination: &str) -> Result<bool> {
        let Some(pod) = self.target.pods().await?.into_iter().next() else {
            return Ok(false);
        };
        let out = pod::exec(
            &self.target.pods_api(),
            &pod.name_any(),
            Some(self.container()),
            ["cat", NGINX_CONFIG],
        )
        .await?;
        Ok(out.stdout.contains(&stanza(container_port, destination)))
    }

    fn validate(&self, rules: &[Rule]) -> Result<()> {
        if !rules.is_empty() {
            return Err(Error::permanent(
                "the carrier provider forwards whole ports and takes no rules",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn nginx_stanza() {
        assert_eq!(
            stanza(8080, "gefyra-stowaway-proxy-10000.gefyra.svc.cluster.local:10000"),
            "upstream stowaway-8080 {server gefyra-stowaway-proxy-10000.gefyra.svc.cluster.local:10000;} \
             server {listen 8080; proxy_pass stowaway-8080;}"
        );
    }
}
