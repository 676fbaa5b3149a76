use crate::k8s::{
    self, bridge::BridgeParameters, labels, rules::Rule, BridgeSpec, ClientSpec, Deployment,
    GefyraBridge, GefyraBridgeMount, GefyraClient, MountSpec,
};
use k8s_openapi::{
    api::{
        apps::v1::DeploymentSpec,
        core::v1::{ContainerPort, PodTemplateSpec},
    },
    apimachinery::pkg::apis::meta::v1::LabelSelector,
};
use maplit::{btreemap, convert_args};

pub const NGINX_IMAGE: &str = "docker.io/library/nginx:latest";

/// A single replica nginx Deployment serving port 80.
pub fn nginx(ns: &str) -> Deployment {
    let labels = convert_args!(btreemap!("app" => "nginx"));
    Deployment {
        metadata: k8s::ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some("nginx".to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(k8s::ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(k8s::PodSpec {
                    containers: vec![k8s::Container {
                        name: "nginx".to_string(),
                        image: Some(NGINX_IMAGE.to_string()),
                        ports: Some(vec![ContainerPort {
                            container_port: 80,
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn client(ns: &str, name: &str) -> GefyraClient {
    let mut client = GefyraClient::new(
        name,
        ClientSpec {
            provider: "stowaway".to_string(),
            provider_parameter: Default::default(),
            sunset: None,
            max_connection_age: None,
        },
    );
    client.metadata.namespace = Some(ns.to_string());
    client
}

pub fn mount(ns: &str, name: &str, target: &str, target_ns: &str) -> GefyraBridgeMount {
    let mut mount = GefyraBridgeMount::new(
        name,
        MountSpec {
            target: target.to_string(),
            target_namespace: target_ns.to_string(),
            target_container: "nginx".to_string(),
            provider: "carrier2mount".to_string(),
            provider_parameter: Default::default(),
            sunset: None,
        },
    );
    mount.metadata.namespace = Some(ns.to_string());
    mount
}

pub fn bridge(ns: &str, name: &str, mount: &str, client: &str, rules: Vec<Rule>) -> GefyraBridge {
    let mut bridge = GefyraBridge::new(
        name,
        BridgeSpec {
            target: mount.to_string(),
            client: client.to_string(),
            destination_ip: "192.168.99.1".to_string(),
            port_mappings: vec!["8080:80".to_string()],
            provider_parameter: BridgeParameters { rules },
            provider: "carrier2".to_string(),
            connection_provider: "stowaway".to_string(),
            sunset: None,
        },
    );
    bridge.metadata.namespace = Some(ns.to_string());
    bridge.metadata.labels = Some(btreemap! {
        labels::BRIDGE_MOUNT.to_string() => mount.to_string(),
        labels::CLIENT.to_string() => client.to_string(),
    });
    bridge
}
