//! Target workloads and their shadow copies.

use gefyra_operator_core::{Error, Result};
use gefyra_operator_k8s_api::{
    api::core::v1::{ServicePort, ServiceSpec},
    labels::{self, conform_name},
    objects, Api, Client, Container, Deployment, ListParams, ObjectMeta, Pod, PodSpec,
    ResourceExt, Service, StatefulSet, TargetRef, WorkloadKind,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::BTreeMap;

const SHADOW_SUFFIX: &str = "-gefyra";

#[derive(Clone, Debug, PartialEq)]
pub enum Workload {
    Deployment(Deployment),
    StatefulSet(StatefulSet),
    Pod(Pod),
}

const SERVICE_SUFFIX: &str = "-gefyra-svc";

/// Shadow Services are named after the workload and the intercepted
/// container, truncated to a valid DNS label.
pub fn service_name(target: &TargetRef, container: &str) -> String {
    conform_name(&format!("{}-{container}", target.name), SERVICE_SUFFIX)
}

/// The in-cluster host of a shadow Service.
pub fn service_host(target: &TargetRef, container: &str, namespace: &str) -> String {
    format!(
        "{}.{namespace}.svc.cluster.local",
        service_name(target, container)
    )
}

fn shadow_labels(labels: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    labels
        .iter()
        .map(|(k, v)| (k.clone(), conform_name(v, SHADOW_SUFFIX)))
        .collect()
}

/// Copies identity-free metadata under a new name.
fn shadow_meta(meta: &ObjectMeta, name: String) -> ObjectMeta {
    let mut annotations = meta.annotations.clone().unwrap_or_default();
    for key in labels::UNCOPIED_ANNOTATIONS {
        annotations.remove(*key);
    }
    ObjectMeta {
        name: Some(name),
        namespace: meta.namespace.clone(),
        labels: meta.labels.as_ref().map(shadow_labels),
        annotations: Some(annotations).filter(|a| !a.is_empty()),
        ..Default::default()
    }
}

fn mark_template(meta: &mut Option<ObjectMeta>, id: &str) {
    let meta = meta.get_or_insert_with(Default::default);
    let mut labels = meta.labels.as_ref().map(shadow_labels).unwrap_or_default();
    labels.insert(labels::DUPLICATION_ID.to_string(), id.to_string());
    meta.labels = Some(labels);
}

// === impl Workload ===

impl Workload {
    pub async fn get(client: &Client, namespace: &str, target: &TargetRef) -> Result<Option<Self>> {
        let found = match target.kind {
            WorkloadKind::Deployment => Api::<Deployment>::namespaced(client.clone(), namespace)
                .get_opt(&target.name)
                .await?
                .map(Self::Deployment),
            WorkloadKind::StatefulSet => Api::<StatefulSet>::namespaced(client.clone(), namespace)
                .get_opt(&target.name)
                .await?
                .map(Self::StatefulSet),
            WorkloadKind::Pod => Api::<Pod>::namespaced(client.clone(), namespace)
                .get_opt(&target.name)
                .await?
                .map(Self::Pod),
        };
        Ok(found)
    }

    /// Like [`Workload::get`], but a missing workload is a permanent error.
    pub async fn require(client: &Client, namespace: &str, target: &TargetRef) -> Result<Self> {
        Self::get(client, namespace, target).await?.ok_or_else(|| {
            Error::permanent(format!("{target} not found in namespace {namespace}"))
        })
    }

    pub fn name(&self) -> String {
        match self {
            Self::Deployment(d) => d.name_any(),
            Self::StatefulSet(s) => s.name_any(),
            Self::Pod(p) => p.name_any(),
        }
    }

    pub fn pod_spec(&self) -> Option<&PodSpec> {
        match self {
            Self::Deployment(d) => d.spec.as_ref()?.template.spec.as_ref(),
            Self::StatefulSet(s) => s.spec.as_ref()?.template.spec.as_ref(),
            Self::Pod(p) => p.spec.as_ref(),
        }
    }

    pub fn container(&self, name: &str) -> Option<&Container> {
        self.pod_spec()?.containers.iter().find(|c| c.name == name)
    }

    /// The labels selecting the workload's pods; `None` for a bare pod.
    fn selector(&self) -> Option<BTreeMap<String, String>> {
        match self {
            Self::Deployment(d) => d.spec.as_ref()?.selector.match_labels.clone(),
            Self::StatefulSet(s) => s.spec.as_ref()?.selector.match_labels.clone(),
            Self::Pod(_) => None,
        }
    }

    /// Lists the live pods of the workload.
    pub async fn pods(&self, client: &Client, namespace: &str) -> Result<Vec<Pod>> {
        let api = Api::<Pod>::namespaced(client.clone(), namespace);
        let pods = match self {
            Self::Pod(pod) => api.get_opt(&pod.name_any()).await?.into_iter().collect(),
            _ => {
                let selector = self.selector().unwrap_or_default();
                if selector.is_empty() {
                    return Err(Error::permanent(format!(
                        "workload {} has no label selector",
                        self.name()
                    )));
                }
                api.list(&ListParams::default().labels(&labels::selector(&selector)))
                    .await?
                    .items
            }
        };
        Ok(pods
            .into_iter()
            .filter(|p| p.metadata.deletion_timestamp.is_none())
            .collect())
    }

    /// A copy of the workload under its shadow name whose pods carry the
    /// duplication id `id`. Labels are suffixed so that the copy's
    /// selectors never match the original's pods.
    pub fn duplicate(&self, id: &str) -> Self {
        let shadow = |name: String| format!("{name}{SHADOW_SUFFIX}");
        match self {
            Self::Deployment(d) => {
                let mut spec = d.spec.clone().unwrap_or_default();
                spec.selector.match_labels = spec.selector.match_labels.as_ref().map(shadow_labels);
                mark_template(&mut spec.template.metadata, id);
                Self::Deployment(Deployment {
                    metadata: shadow_meta(&d.metadata, shadow(d.name_any())),
                    spec: Some(spec),
                    status: None,
                })
            }
            Self::StatefulSet(s) => {
                let mut spec = s.spec.clone().unwrap_or_default();
                spec.selector.match_labels = spec.selector.match_labels.as_ref().map(shadow_labels);
                mark_template(&mut spec.template.metadata, id);
                Self::StatefulSet(StatefulSet {
                    metadata: shadow_meta(&s.metadata, shadow(s.name_any())),
                    spec: Some(spec),
                    status: None,
                })
            }
            Self::Pod(p) => {
                let mut metadata = shadow_meta(&p.metadata, shadow(p.name_any()));
                let mut labels = metadata.labels.take().unwrap_or_default();
                labels.insert(labels::DUPLICATION_ID.to_string(), id.to_string());
                metadata.labels = Some(labels);
                let mut spec = p.spec.clone().unwrap_or_default();
                spec.node_name = None;
                Self::Pod(Pod {
                    metadata,
                    spec: Some(spec),
                    status: None,
                })
            }
        }
    }

    /// The duplication id stamped on the pods of a shadow workload.
    pub fn duplication_id(&self) -> Option<&str> {
        let labels = match self {
            Self::Deployment(d) => d.spec.as_ref()?.template.metadata.as_ref()?.labels.as_ref(),
            Self::StatefulSet(s) => s.spec.as_ref()?.template.metadata.as_ref()?.labels.as_ref(),
            Self::Pod(p) => p.metadata.labels.as_ref(),
        };
        labels?.get(labels::DUPLICATION_ID).map(String::as_str)
    }

    /// The Service reaching the shadow pods on every port of `container`.
    pub fn service(&self, target: &TargetRef, container: &str) -> Result<Service> {
        let id = self
            .duplication_id()
            .ok_or_else(|| Error::permanent(format!("{} is not a shadow workload", self.name())))?;
        let c = self.container(container).ok_or_else(|| {
            Error::permanent(format!("container {container} not found in {target}"))
        })?;
        let ports = c
            .ports
            .iter()
            .flatten()
            .map(|p| ServicePort {
                name: Some(format!("port-{}", p.container_port)),
                port: p.container_port,
                target_port: Some(IntOrString::Int(p.container_port)),
                protocol: p.protocol.clone(),
                ..Default::default()
            })
            .collect::<Vec<_>>();
        let meta = match self {
            Self::Deployment(d) => &d.metadata,
            Self::StatefulSet(s) => &s.metadata,
            Self::Pod(p) => &p.metadata,
        };
        Ok(Service {
            metadata: ObjectMeta {
                name: Some(service_name(target, container)),
                namespace: meta.namespace.clone(),
                labels: meta.labels.clone(),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                selector: Some(BTreeMap::from([(
                    labels::DUPLICATION_ID.to_string(),
                    id.to_string(),
                )])),
                ports: Some(ports),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    /// Creates the workload, taking over an existing one of the same name.
    pub async fn apply(&self, client: &Client, namespace: &str) -> Result<()> {
        match self {
            Self::Deployment(d) => {
                objects::create_or_apply(&Api::namespaced(client.clone(), namespace), d).await?;
            }
            Self::StatefulSet(s) => {
                objects::create_or_apply(&Api::namespaced(client.clone(), namespace), s).await?;
            }
            Self::Pod(p) => {
                objects::create_or_apply(&Api::namespaced(client.clone(), namespace), p).await?;
            }
        }
        Ok(())
    }
}

/// Deletes the referenced workload. Returns false when it did not exist.
pub async fn delete(client: &Client, namespace: &str, target: &TargetRef) -> Result<bool> {
    let deleted = match target.kind {
        WorkloadKind::Deployment => {
            objects::delete(&Api::<Deployment>::namespaced(client.clone(), namespace), &target.name)
                .await?
        }
        WorkloadKind::StatefulSet => {
            objects::delete(&Api::<StatefulSet>::namespaced(client.clone(), namespace), &target.name)
                .await?
        }
        WorkloadKind::Pod => {
            objects::delete(&Api::<Pod>::namespaced(client.clone(), namespace), &target.name).await?
        }
    };
    Ok(deleted)
}
