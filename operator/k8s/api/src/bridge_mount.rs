use crate::target::{InvalidTarget, TargetRef};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A target workload prepared for traffic interception.
#[derive(Clone, Debug, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "gefyra.dev",
    version = "v1",
    kind = "GefyraBridgeMount",
    namespaced,
    status = "MountStatus",
    shortname = "gmount",
    printcolumn = r#"{"name":"Target", "type":"string", "jsonPath":".spec.target"}"#,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MountSpec {
    /// The workload in `[kind/]name` form.
    pub target: String,
    pub target_namespace: String,
    pub target_container: String,

    #[serde(default = "default_provider")]
    pub provider: String,

    #[serde(default)]
    pub provider_parameter: MountParameters,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sunset: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct MountParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<Tls>,
}

/// TLS material terminated by the interception proxy.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct Tls {
    pub certificate: String,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sni: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MountStatus {
    #[serde(default)]
    pub state: MountState,

    #[serde(default)]
    pub state_transitions: BTreeMap<String, String>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MountState {
    #[default]
    Requested,
    Preparing,
    Installing,
    Active,
    Restoring,
    Error,
    Terminated,
}

crate::states!(MountState {
    Requested => "REQUESTED",
    Preparing => "PREPARING",
    Installing => "INSTALLING",
    Active => "ACTIVE",
    Restoring => "RESTORING",
    Error => "ERROR",
    Terminated => "TERMINATED",
});

fn default_provider() -> String {
    "carrier2mount".to_string()
}

impl GefyraBridgeMount {
    pub fn state(&self) -> MountState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }
}

impl MountSpec {
    pub fn target_ref(&self) -> Result<TargetRef, InvalidTarget> {
        self.target.parse()
    }
}
