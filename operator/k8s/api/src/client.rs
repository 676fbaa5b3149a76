use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A tunnel peer identity linking a developer machine to the cluster.
///
/// The resource name is the client id.
#[derive(Clone, Debug, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "gefyra.dev",
    version = "v1",
    kind = "GefyraClient",
    namespaced,
    status = "ClientStatus",
    shortname = "gclient",
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClientSpec {
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Provider specific activation parameters. Setting them activates the
    /// connection, clearing them disables it.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub provider_parameter: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sunset: Option<String>,

    /// Maximum number of seconds a connection stays active.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connection_age: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClientStatus {
    #[serde(default)]
    pub state: ClientState,

    #[serde(default)]
    pub state_transitions: BTreeMap<String, String>,

    /// Connection details handed out to the peer once it is active.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub provider_config: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub service_account: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wireguard: Option<PeerStatus>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientState {
    #[default]
    Requested,
    Creating,
    Waiting,
    Enabling,
    Active,
    Disabling,
    Error,
    Terminating,
}

crate::states!(ClientState {
    Requested => "REQUESTED",
    Creating => "CREATING",
    Waiting => "WAITING",
    Enabling => "ENABLING",
    Active => "ACTIVE",
    Disabling => "DISABLING",
    Error => "ERROR",
    Terminating => "TERMINATING",
});

/// Live tunnel status of a single peer as reported by the relay.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PeerStatus {
    pub public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    /// Seconds since the epoch; zero when no handshake happened yet.
    #[serde(default)]
    pub latest_handshake: u64,
    #[serde(default)]
    pub transfer_rx: u64,
    #[serde(default)]
    pub transfer_tx: u64,
}

fn default_provider() -> String {
    "stowaway".to_string()
}

impl GefyraClient {
    pub fn state(&self) -> ClientState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }

    /// Returns when the client entered `state` the last time, if recorded.
    pub fn entered(&self, state: ClientState) -> Option<chrono::DateTime<chrono::Utc>> {
        let ts = self.status.as_ref()?.state_transitions.get(state.as_str())?;
        crate::parse_timestamp(ts).ok()
    }
}
