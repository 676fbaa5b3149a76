use crate::rules::Rule;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr};

/// Routes matching traffic of a mounted workload to a client.
#[derive(Clone, Debug, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "gefyra.dev",
    version = "v1",
    kind = "GefyraBridge",
    namespaced,
    status = "BridgeStatus",
    shortname = "gbridge",
    printcolumn = r#"{"name":"Mount", "type":"string", "jsonPath":".spec.target"}"#,
    printcolumn = r#"{"name":"Client", "type":"string", "jsonPath":".spec.client"}"#,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BridgeSpec {
    /// The name of the bridge mount this bridge attaches to.
    pub target: String,
    pub client: String,

    #[serde(rename = "destinationIP")]
    pub destination_ip: String,

    /// Mappings in `<local>:<target>` form.
    pub port_mappings: Vec<String>,

    #[serde(default)]
    pub provider_parameter: BridgeParameters,

    #[serde(default = "default_provider")]
    pub provider: String,

    #[serde(default = "default_connection_provider")]
    pub connection_provider: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sunset: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct BridgeParameters {
    #[serde(default)]
    pub rules: Vec<Rule>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BridgeStatus {
    #[serde(default)]
    pub state: BridgeState,

    #[serde(default)]
    pub state_transitions: BTreeMap<String, String>,

    /// The relay endpoint per target port, in `host:port` form.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub cluster_endpoint: BTreeMap<String, String>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BridgeState {
    #[default]
    Requested,
    Installing,
    Installed,
    Creating,
    Active,
    Removing,
    Restoring,
    Error,
    Terminating,
}

crate::states!(BridgeState {
    Requested => "REQUESTED",
    Installing => "INSTALLING",
    Installed => "INSTALLED",
    Creating => "CREATING",
    Active => "ACTIVE",
    Removing => "REMOVING",
    Restoring => "RESTORING",
    Error => "ERROR",
    Terminating => "TERMINATING",
});

/// A `<local>:<target>` port pair.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct PortMapping {
    /// The port the client serves on its local machine.
    pub local: u16,
    /// The container port of the target workload.
    pub target: u16,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid port mapping '{0}', expected <local>:<target>")]
pub struct InvalidPortMapping(pub String);

fn default_provider() -> String {
    "carrier2".to_string()
}

fn default_connection_provider() -> String {
    "stowaway".to_string()
}

// === impl GefyraBridge ===

impl GefyraBridge {
    pub fn state(&self) -> BridgeState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }
}

impl BridgeSpec {
    pub fn port_mappings(&self) -> Result<Vec<PortMapping>, InvalidPortMapping> {
        self.port_mappings.iter().map(|m| m.parse()).collect()
    }
}

// === impl PortMapping ===

impl FromStr for PortMapping {
    type Err = InvalidPortMapping;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidPortMapping(s.to_string());
        let (local, target) = s.split_once(':').ok_or_else(invalid)?;
        let local = local.trim().parse().map_err(|_| invalid())?;
        let target = target.trim().parse().map_err(|_| invalid())?;
        if local == 0 || target == 0 {
            return Err(invalid());
        }
        Ok(Self { local, target })
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.local, self.target)
    }
}
