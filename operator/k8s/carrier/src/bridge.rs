use crate::{
    config::{self, Config},
    control, workload, CarrierConfig, Target,
};
use gefyra_operator_core::{BridgeProvider, Error, MountTarget, ProxyRoute, Result};
use gefyra_operator_k8s_api::{pod, rules::Rule, Client, Pod, ResourceExt};
use std::sync::Arc;
use tracing::{debug, info};

/// Routes matching requests to a client by editing the carrier2 document
/// of every pod of a mounted workload.
#[derive(Clone)]
pub struct Carrier2 {
    target: Target,
}

// === impl Carrier2 ===

impl Carrier2 {
    pub const NAME: &'static str = "carrier2";

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

    /// The live document of `pod`, or a fresh one for the mount when the
    /// proxy has none yet.
    async fn current(&self, pod: &Pod) -> Result<Config> {
        let api = self.target.pods_api();
        if let Some(config) = control::read(&api, &pod.name_any(), self.container()).await? {
            return Ok(config);
        }
        let mount = &self.target.mount;
        let container = pod::container(pod, self.container()).ok_or_else(|| {
            Error::permanent(format!(
                "container {} not found in pod {}",
                mount.container,
                pod.name_any()
            ))
        })?;
        let host = workload::service_host(&mount.target, &mount.container, &mount.namespace);
        Ok(Config::for_container(
            container,
            &host,
            mount.parameters.tls.as_ref(),
        ))
    }

    async fn commit(&self, pod: &Pod, config: &Config) -> Result<()> {
        control::commit(
            &self.target.pods_api(),
            &pod.name_any(),
            self.container(),
            config,
            self.target.config.carrier2_debug,
        )
        .await
    }
}

/// Checks that every rule has predicates and every regex compiles.
pub(crate) fn validate_rules(rules: &[Rule]) -> Result<()> {
    if rules.is_empty() {
        return Err(Error::permanent("at least one rule is required"));
    }
    for rule in rules {
        if rule.matches.is_empty() {
            return Err(Error::permanent("rules must match on at least one predicate"));
        }
        for pattern in rule.matches.iter().filter_map(|m| m.regex()) {
            if let Err(error) = regex::Regex::new(pattern) {
                return Err(Error::permanent(format!("invalid regex '{pattern}': {error}")));
            }
        }
    }
    Ok(())
}

#[async_trait::async_trait]
impl BridgeProvider for Carrier2 {
    async fn install(&self) -> Result<()> {
        Ok(())
    }

    async fn installed(&self) -> Result<bool> {
        self.ready().await
    }

    async fn ready(&self) -> Result<bool> {
        let pods = self.target.pods().await?;
        if pods.is_empty() || !pods.iter().all(|p| pod::ready_and_healthy(p, self.container())) {
            return Err(Error::temporary(format!(
                "pods of {} are not ready",
                self.target.mount.target
            )));
        }
        Ok(true)
    }

    async fn uninstall(&self) -> Result<()> {
        Ok(())
    }

    async fn add_proxy_route(&self, route: &ProxyRoute) -> Result<()> {
        for pod in self.target.pods().await? {
            let mut config = self.current(&pod).await?;
            let bridge = config::Bridge {
                endpoint: route.destination.clone(),
                rules: route.rules.clone(),
            };
            config
                .upsert_bridge(route.container_port, &route.bridge, bridge)
                .map_err(|e| Error::permanent(e.to_string()))?;
            self.commit(&pod, &config).await?;
            info!(
                pod = %pod.name_any(),
                bridge = %route.bridge,
                port = route.container_port,
                destination = %route.destination,
                "Added proxy route"
            );
        }
        Ok(())
    }

    async fn remove_proxy_route(&self, container_port: u16, destination: &str) -> Result<()> {
        let api = self.target.pods_api();
        for pod in self.target.pods().await? {
            let Some(mut config) = control::read(&api, &pod.name_any(), self.container()).await?
            else {
                continue;
            };
            if !config.remove_endpoint(container_port, destination) {
                debug!(pod = %pod.name_any(), %destination, "No proxy route to remove");
                continue;
            }
            self.commit(&pod, &config).await?;
            info!(pod = %pod.name_any(), port = container_port, %destination, "Removed proxy route");
        }
        Ok(())
    }

    async fn proxy_route_exists(&self, container_port: u16, destination: &str) -> Result<bool> {
        let Some(pod) = self.target.pods().await?.into_iter().next() else {
            return Ok(false);
        };
        let api = self.target.pods_api();
        Ok(control::read(&api, &pod.name_any(), self.container())
            .await?
            .map_or(false, |c| c.has_endpoint(container_port, destination)))
    }

    fn validate(&self, rules: &[Rule]) -> Result<()> {
        validate_rules(rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gefyra_operator_k8s_api::rules::{Match, MatchType};

    #[test]
    fn validates_rules() {
        let rule = |matches| Rule { matches };
        assert!(validate_rules(&[rule(vec![Match::header("x-user", "alice", MatchType::Exact)])]).is_ok());
        assert!(validate_rules(&[rule(vec![Match::path("^/v[0-9]+/", MatchType::Regex)])]).is_ok());

        for invalid in [
            vec![],
            vec![rule(vec![])],
            vec![rule(vec![Match::path("^/v[0-9+/", MatchType::Regex)])],
            vec![rule(vec![Match::header("x-user", "(alice", MatchType::Regex)])],
        ] {
            let error = validate_rules(&invalid).unwrap_err();
            assert!(!error.is_transient(), "{invalid:?}");
        }
    }
}
