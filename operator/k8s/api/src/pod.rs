use k8s_openapi::api::core::v1::{Container, ContainerStatus, Pod, Probe};
use kube::api::{Api, AttachParams};
use tokio::io::AsyncReadExt;

/// The merged output of a command run in a container.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    /// Whether the command exited successfully.
    pub success: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("failed to attach to pod {pod}: {source}")]
    Attach {
        pod: String,
        #[source]
        source: kube::Error,
    },

    #[error("failed to read output of pod {pod}: {source}")]
    Read {
        pod: String,
        #[source]
        source: std::io::Error,
    },

    #[error("exec session with pod {pod} failed: {message}")]
    Session { pod: String, message: String },
}

// === impl ExecOutput ===

impl ExecOutput {
    /// Stdout followed by stderr.
    pub fn merged(&self) -> String {
        let mut out = self.stdout.clone();
        out.push_str(&self.stderr);
        out
    }
}

/// Runs `command` in `container` of the named pod and collects its output.
pub async fn exec<I, T>(
    api: &Api<Pod>,
    pod: &str,
    container: Option<&str>,
    command: I,
) -> Result<ExecOutput, ExecError>
where
    I: IntoIterator<Item = T> + std::fmt::Debug,
    T: Into<String>,
{
    tracing::debug!(%pod, ?container, ?command, "Exec");
    let mut params = AttachParams::default().stdout(true).stderr(true);
    if let Some(container) = container {
        params = params.container(container);
    }
    let mut attached = api
        .exec(pod, command, &params)
        .await
        .map_err(|source| ExecError::Attach {
            pod: pod.to_string(),
            source,
        })?;

    let status = attached.take_status();
    let mut stdout = attached.stdout();
    let mut stderr = attached.stderr();
    let read = |source: std::io::Error| ExecError::Read {
        pod: pod.to_string(),
        source,
    };
    let (out, err) = tokio::join!(
        async {
            let mut buf = String::new();
            if let Some(r) = stdout.as_mut() {
                r.read_to_string(&mut buf).await?;
            }
            Ok::<_, std::io::Error>(buf)
        },
        async {
            let mut buf = String::new();
            if let Some(r) = stderr.as_mut() {
                r.read_to_string(&mut buf).await?;
            }
            Ok::<_, std::io::Error>(buf)
        },
    );
    let output = ExecOutput {
        stdout: out.map_err(read)?,
        stderr: err.map_err(read)?,
        success: match status {
            Some(status) => status
                .await
                .and_then(|s| s.status)
                .map_or(true, |s| s == "Success"),
            None => true,
        },
    };
    drop((stdout, stderr));
    attached.join().await.map_err(|e| ExecError::Session {
        pod: pod.to_string(),
        message: e.to_string(),
    })?;
    tracing::trace!(%pod, output = %output.merged(), success = output.success);
    Ok(output)
}

/// Returns the status of the named container.
pub fn container_status<'p>(pod: &'p Pod, container: &str) -> Option<&'p ContainerStatus> {
    pod.status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .iter()
        .find(|s| s.name == container)
}

/// Returns the spec of the named container.
pub fn container<'p>(pod: &'p Pod, name: &str) -> Option<&'p Container> {
    pod.spec.as_ref()?.containers.iter().find(|c| c.name == name)
}

pub fn is_running(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .map_or(false, |phase| phase == "Running")
}

/// A pod is ready and healthy when it is running and the named container
/// is ready, started and running since a known instant.
pub fn ready_and_healthy(pod: &Pod, container: &str) -> bool {
    let Some(status) = container_status(pod, container) else {
        return false;
    };
    is_running(pod)
        && status.ready
        && status.started.unwrap_or(false)
        && status
            .state
            .as_ref()
            .and_then(|s| s.running.as_ref())
            .and_then(|r| r.started_at.as_ref())
            .is_some()
}

/// Whether the first container of the pod reports ready.
pub fn first_container_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|s| s.first())
        .map_or(false, |s| s.ready)
}

pub fn all_containers_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .map_or(false, |s| !s.is_empty() && s.iter().all(|c| c.ready))
}

pub fn restart_count(pod: &Pod, container: &str) -> Option<i32> {
    container_status(pod, container).map(|s| s.restart_count)
}

/// Startup, readiness and liveness probes of a container, in that order.
pub fn probes(container: &Container) -> Vec<&Probe> {
    [
        container.startup_probe.as_ref(),
        container.readiness_probe.as_ref(),
        container.liveness_probe.as_ref(),
    ]
    .into_iter()
    .flatten()
    .collect()
}

/// The names of the controllers owning the given pods.
pub fn owner_names<'p>(pods: impl IntoIterator<Item = &'p Pod>) -> std::collections::BTreeSet<String> {
    pods.into_iter()
        .filter_map(|p| p.metadata.owner_references.as_ref()?.first())
        .map(|o| o.name.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::{
        api::core::v1::{
            ContainerState, ContainerStateRunning, HTTPGetAction, PodSpec, PodStatus,
        },
        apimachinery::pkg::{apis::meta::v1::Time, util::intstr::IntOrString},
    };
    use pretty_assertions::assert_eq;

    fn pod(phase: &str, ready: bool, started_at: bool) -> Pod {
        Pod {
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "app".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                container_statuses: Some(vec![ContainerStatus {
                    name: "app".to_string(),
                    ready,
                    started: Some(true),
                    restart_count: 1,
                    state: Some(ContainerState {
                        running: Some(ContainerStateRunning {
                            started_at: started_at.then(|| Time(chrono::Utc::now())),
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

    #[test]
    fn readiness() {
        assert!(ready_and_healthy(&pod("Running", true, true), "app"));
        assert!(!ready_and_healthy(&pod("Running", true, true), "sidecar"));
        assert!(!ready_and_healthy(&pod("Pending", true, true), "app"));
        assert!(!ready_and_healthy(&pod("Running", false, true), "app"));
        assert!(!ready_and_healthy(&pod("Running", true, false), "app"));
        assert!(first_container_ready(&pod("Running", true, false)));
        assert!(!all_containers_ready(&Pod::default()));
        assert_eq!(restart_count(&pod("Running", true, true), "app"), Some(1));
    }

    #[test]
    fn probes_in_order() {
        let http = |port| Probe {
            http_get: Some(HTTPGetAction {
                port: IntOrString::Int(port),
                ..Default::default()
            }),
            ..Default::default()
        };
        let container = Container {
            name: "app".to_string(),
            liveness_probe: Some(http(8081)),
            startup_probe: Some(http(8080)),
            ..Default::default()
        };
        let ports = probes(&container)
            .into_iter()
            .filter_map(|p| match p.http_get.as_ref()?.port {
                IntOrString::Int(port) => Some(port),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(ports, vec![8080, 8081]);
    }
}
