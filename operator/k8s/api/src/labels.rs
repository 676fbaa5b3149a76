use std::collections::BTreeMap;

/// Selects bridges by the mount they attach to.
pub const BRIDGE_MOUNT: &str = "gefyra.dev/bridge-mount";

/// Selects bridges by the client they route to.
pub const CLIENT: &str = "gefyra.dev/client";

pub const APP: &str = "gefyra.dev/app";
pub const ROLE: &str = "gefyra.dev/role";
pub const PROVIDER: &str = "gefyra.dev/provider";

/// Set on the pods of a shadow workload; its Service selects on it.
pub const DUPLICATION_ID: &str = "bridge.gefyra.dev/duplication-id";

pub const RESTARTED_AT: &str = "kubectl.kubernetes.io/restartedAt";

/// Annotations that must not be carried over to a shadow workload.
pub const UNCOPIED_ANNOTATIONS: &[&str] = &[
    "kubectl.kubernetes.io/last-applied-configuration",
    "deployment.kubernetes.io/revision",
];

const MAX_LABEL_VALUE: usize = 63;

/// Appends `suffix` to `value`, truncating `value` so that the result is a
/// valid label value of at most 63 characters.
pub fn conform_name(value: &str, suffix: &str) -> String {
    let keep = MAX_LABEL_VALUE.saturating_sub(suffix.len());
    let mut head = value.chars().take(keep).collect::<String>();
    while head.ends_with(|c: char| !c.is_ascii_alphanumeric()) {
        head.pop();
    }
    format!("{head}{suffix}")
}

/// Renders a label map as a `k=v,k=v` selector.
pub fn selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}
