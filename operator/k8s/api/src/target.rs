use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// A reference to a workload in `[kind/]name` form, e.g. `deploy/nginx`.
///
/// A bare name refers to a Pod.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct TargetRef {
    pub kind: WorkloadKind,
    pub name: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
    Pod,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum InvalidTarget {
    #[error("target must not be empty")]
    Empty,

    #[error("unsupported workload kind '{kind}' in reference {target}")]
    UnsupportedKind { kind: String, target: String },
}

// === impl TargetRef ===

impl TargetRef {
    pub fn new(kind: WorkloadKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    /// The name of the shadow copy of this workload.
    pub fn shadow_name(&self) -> String {
        format!("{}-gefyra", self.name)
    }

    /// The shadow workload, of the same kind as this one.
    pub fn shadow(&self) -> Self {
        Self::new(self.kind, self.shadow_name())
    }
}

impl FromStr for TargetRef {
    type Err = InvalidTarget;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, name) = match s.split_once('/') {
            Some((kind, name)) => (kind.to_ascii_lowercase(), name),
            None => ("pod".to_string(), s),
        };
        if name.is_empty() {
            return Err(InvalidTarget::Empty);
        }
        let kind = match kind.as_str() {
            "deploy" | "deployment" | "deployments" => WorkloadKind::Deployment,
            "sts" | "statefulset" | "statefulsets" => WorkloadKind::StatefulSet,
            "po" | "pod" | "pods" => WorkloadKind::Pod,
            _ => {
                return Err(InvalidTarget::UnsupportedKind {
                    kind,
                    target: s.to_string(),
                })
            }
        };
        Ok(Self::new(kind, name))
    }
}

impl fmt::Display for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deployment => f.write_str("deployment"),
            Self::StatefulSet => f.write_str("statefulset"),
            Self::Pod => f.write_str("pod"),
        }
    }
}
