//! The cluster objects making up the relay.

use crate::StowawayConfig;
use gefyra_operator_k8s_api::{
    api::{
        apps::v1::{StatefulSet, StatefulSetSpec},
        core::v1::{
            Capabilities, ConfigMap, ConfigMapEnvSource, ConfigMapVolumeSource, Container,
            ContainerPort, EnvFromSource, HTTPGetAction, HostPathVolumeSource,
            PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec, Probe,
            ResourceRequirements, SecurityContext, Service, ServiceAccount, ServicePort,
            ServiceSpec, Volume, VolumeMount, VolumeResourceRequirements,
        },
    },
    labels, ObjectMeta,
};
use k8s_openapi::apimachinery::pkg::{
    api::resource::Quantity, apis::meta::v1::LabelSelector, util::intstr::IntOrString,
};
use std::collections::BTreeMap;

pub const NAME: &str = "gefyra-stowaway";
pub const CONTAINER: &str = "stowaway";
pub const CONFIG: &str = "gefyra-stowaway-config";
pub const PROXY_ROUTES: &str = "gefyra-stowaway-proxyroutes";
pub const WIREGUARD_SERVICE: &str = "gefyra-stowaway-wireguard";

pub const WIREGUARD_PORT: i32 = 51820;
pub const HEALTH_PORT: i32 = 51822;

const PROXY_ROUTES_MOUNT: &str = "/stowaway/proxyroutes";

pub fn labels() -> BTreeMap<String, String> {
    [
        (labels::APP, "stowaway"),
        (labels::ROLE, "connection"),
        (labels::PROVIDER, "stowaway"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

fn app_label(role: Option<&str>) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::from([(labels::APP.to_string(), "stowaway".to_string())]);
    if let Some(role) = role {
        labels.insert(labels::ROLE.to_string(), role.to_string());
    }
    labels
}

fn meta(config: &StowawayConfig, name: &str, labels: BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(config.namespace.clone()),
        labels: Some(labels),
        ..Default::default()
    }
}

pub fn service_account(config: &StowawayConfig) -> ServiceAccount {
    ServiceAccount {
        metadata: meta(config, NAME, app_label(None)),
        ..Default::default()
    }
}

pub fn proxy_routes(config: &StowawayConfig) -> ConfigMap {
    ConfigMap {
        metadata: meta(config, PROXY_ROUTES, app_label(Some("proxyroute"))),
        data: Some(BTreeMap::new()),
        ..Default::default()
    }
}

/// The environment of the relay, including its peer list.
pub fn config_map(config: &StowawayConfig) -> ConfigMap {
    let data = [
        ("PEERS", "0".to_string()),
        ("SERVERPORT", config.server_port.to_string()),
        ("SERVERPORT_TCP", config.server_port_tcp.to_string()),
        ("PUID", config.puid.clone()),
        ("PGID", config.pgid.clone()),
        ("PEERDNS", config.peer_dns.clone()),
        ("INTERNAL_SUBNET", config.internal_subnet.clone()),
        ("LOG_CONFS", "false".to_string()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();
    ConfigMap {
        metadata: meta(config, CONFIG, app_label(Some("connection"))),
        data: Some(data),
        ..Default::default()
    }
}

fn health_probe() -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some("/".to_string()),
            port: IntOrString::Int(HEALTH_PORT),
            ..Default::default()
        }),
        period_seconds: Some(1),
        initial_delay_seconds: Some(5),
        ..Default::default()
    }
}

fn quantities(cpu: &str, memory: &str) -> BTreeMap<String, Quantity> {
    BTreeMap::from([
        ("cpu".to_string(), Quantity(cpu.to_string())),
        ("memory".to_string(), Quantity(memory.to_string())),
    ])
}

pub fn stateful_set(config: &StowawayConfig) -> StatefulSet {
    let labels = labels();
    let container = Container {
        name: CONTAINER.to_string(),
        image: Some(format!("{}:{}", config.image, config.tag)),
        image_pull_policy: Some(config.image_pull_policy.clone()),
        ports: Some(vec![
            ContainerPort {
                container_port: WIREGUARD_PORT,
                protocol: Some("UDP".to_string()),
                ..Default::default()
            },
            ContainerPort {
                container_port: HEALTH_PORT,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
        ]),
        resources: Some(ResourceRequirements {
            requests: Some(quantities("0.1", "100Mi")),
            limits: Some(quantities("0.75", "500Mi")),
            ..Default::default()
        }),
        startup_probe: Some(health_probe()),
        readiness_probe: Some(health_probe()),
        liveness_probe: Some(health_probe()),
        env_from: Some(vec![EnvFromSource {
            config_map_ref: Some(ConfigMapEnvSource {
                name: CONFIG.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }]),
        security_context: Some(SecurityContext {
            privileged: Some(true),
            capabilities: Some(Capabilities {
                add: Some(vec!["NET_ADMIN".to_string(), "SYS_MODULE".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        }),
        volume_mounts: Some(vec![
            VolumeMount {
                name: "proxyroutes".to_string(),
                mount_path: PROXY_ROUTES_MOUNT.to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: "host-libs".to_string(),
                mount_path: "/lib/modules".to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: "stowaway-config".to_string(),
                mount_path: "/config".to_string(),
                ..Default::default()
            },
        ]),
        ..Default::default()
    };

    StatefulSet {
        metadata: meta(config, NAME, labels.clone()),
        spec: Some(StatefulSetSpec {
            replicas: Some(1),
            service_name: Some(NAME.to_string()),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(NAME.to_string()),
                    containers: vec![container],
                    volumes: Some(vec![
                        Volume {
                            name: "proxyroutes".to_string(),
                            config_map: Some(ConfigMapVolumeSource {
                                name: PROXY_ROUTES.to_string(),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                        Volume {
                            name: "host-libs".to_string(),
                            host_path: Some(HostPathVolumeSource {
                                path: "/lib/modules".to_string(),
                                type_: Some("Directory".to_string()),
                            }),
                            ..Default::default()
                        },
                    ]),
                    ..Default::default()
                }),
            },
            volume_claim_templates: Some(vec![PersistentVolumeClaim {
                metadata: ObjectMeta {
                    name: Some("stowaway-config".to_string()),
                    ..Default::default()
                },
                spec: Some(PersistentVolumeClaimSpec {
                    access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                    resources: Some(VolumeResourceRequirements {
                        requests: Some(BTreeMap::from([(
                            "storage".to_string(),
                            Quantity(format!("{}Mi", config.storage_mi)),
                        )])),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Exposes the tunnel endpoint on every node.
pub fn wireguard_service(config: &StowawayConfig) -> Service {
    Service {
        metadata: meta(config, WIREGUARD_SERVICE, app_label(None)),
        spec: Some(ServiceSpec {
            type_: Some("NodePort".to_string()),
            selector: Some(labels()),
            ports: Some(vec![ServicePort {
                name: Some("gefyra-wireguard".to_string()),
                protocol: Some("UDP".to_string()),
                port: WIREGUARD_PORT,
                target_port: Some(IntOrString::Int(WIREGUARD_PORT)),
                node_port: Some(i32::from(config.server_port)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn proxy_service_name(port: u16) -> String {
    format!("gefyra-stowaway-proxy-{port}")
}

/// A headless Service making one relay port of a route resolvable.
pub fn proxy_service(config: &StowawayConfig, port: u16, peer: &str, destination: &str) -> Service {
    let mut labels = app_label(Some("proxy"));
    labels.extend([
        ("gefyra.dev/proxy-port".to_string(), port.to_string()),
        ("gefyra.dev/client-id".to_string(), peer.to_string()),
        // Label values must not contain ':'.
        ("gefyra.dev/destination".to_string(), destination.replace(':', "_")),
    ]);
    Service {
        metadata: meta(config, &proxy_service_name(port), labels),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            cluster_ip: Some("None".to_string()),
            selector: Some(self::labels()),
            ports: Some(vec![ServicePort {
                name: Some(port.to_string()),
                port: i32::from(port),
                target_port: Some(IntOrString::Int(i32::from(port))),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// The in-cluster address of a route.
pub fn proxy_endpoint(config: &StowawayConfig, port: u16) -> String {
    format!(
        "{}.{}.svc.cluster.local:{port}",
        proxy_service_name(port),
        config.namespace
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn relay_environment() {
        let cm = config_map(&StowawayConfig::default());
        let data = cm.data.unwrap();
        assert_eq!(data["PEERS"], "0");
        assert_eq!(data["SERVERPORT"], "31820");
        assert_eq!(data["SERVERPORT_TCP"], "31821");
        assert_eq!(data["INTERNAL_SUBNET"], "192.168.99.0");
        assert_eq!(data["LOG_CONFS"], "false");
        assert_eq!(cm.metadata.namespace.as_deref(), Some("gefyra"));
    }

    #[test]
    fn stateful_set_mounts_routes_and_config() {
        let config = StowawayConfig {
            tag: "2.1.0".to_string(),
            storage_mi: 128,
            ..Default::default()
        };
        let sts = stateful_set(&config);
        let spec = sts.spec.unwrap();
        assert_eq!(spec.selector.match_labels, Some(labels()));
        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.service_account_name.as_deref(), Some(NAME));
        let container = &pod.containers[0];
        assert_eq!(
            container.image.as_deref(),
            Some("quay.io/gefyra/stowaway:2.1.0")
        );
        let mounts = container
            .volume_mounts
            .iter()
            .flatten()
            .map(|m| m.mount_path.as_str())
            .collect::<Vec<_>>();
        assert_eq!(mounts, vec![PROXY_ROUTES_MOUNT, "/lib/modules", "/config"]);
        let claim = &spec.volume_claim_templates.unwrap()[0];
        assert_eq!(
            claim.spec.as_ref().unwrap().resources.as_ref().unwrap().requests.as_ref().unwrap()
                ["storage"],
            Quantity("128Mi".to_string())
        );
    }

    #[test]
    fn proxy_service_is_headless() {
        let config = StowawayConfig::default();
        let svc = proxy_service(&config, 10001, "alice", "192.168.101.2:8000");
        assert_eq!(svc.metadata.name.as_deref(), Some("gefyra-stowaway-proxy-10001"));
        assert_eq!(
            svc.metadata.labels.unwrap()["gefyra.dev/destination"],
            "192.168.101.2_8000"
        );
        let spec = svc.spec.unwrap();
        assert_eq!(spec.cluster_ip.as_deref(), Some("None"));
        assert_eq!(spec.ports.unwrap()[0].port, 10001);
        assert_eq!(
            proxy_endpoint(&config, 10001),
            "gefyra-stowaway-proxy-10001.gefyra.svc.cluster.local:10001"
        );
    }
}
