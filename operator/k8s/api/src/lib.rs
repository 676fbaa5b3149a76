#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

/// Implements the string conversions shared by all state enums.
macro_rules! states {
    ($name:ident { $($variant:ident => $value:literal),+ $(,)? }) => {
        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $value),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::UnknownState;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($value => Ok($name::$variant),)+
                    _ => Err($crate::UnknownState(s.to_string())),
                }
            }
        }
    };
}
pub(crate) use states;

pub mod bridge;
pub mod bridge_mount;
pub mod client;
pub mod labels;
pub mod objects;
pub mod pod;
pub mod rules;
pub mod target;

pub use self::{
    bridge::{BridgeSpec, BridgeState, BridgeStatus, GefyraBridge, PortMapping},
    bridge_mount::{GefyraBridgeMount, MountParameters, MountSpec, MountState, MountStatus, Tls},
    client::{ClientSpec, ClientState, ClientStatus, GefyraClient, PeerStatus},
    target::{TargetRef, WorkloadKind},
};
pub use k8s_openapi::api::{
    self,
    apps::v1::{Deployment, StatefulSet},
    core::v1::{ConfigMap, Container, Pod, PodSpec, Probe, Secret, Service, ServiceAccount},
};
pub use kube::{
    api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams, ResourceExt},
    Client, Resource,
};

use chrono::{DateTime, Utc};

/// The API group of all Gefyra resources.
pub const GROUP: &str = "gefyra.dev";

/// Parses an ISO-8601 timestamp as written by clients into `sunset` fields.
///
/// Offsets are honored; a timestamp without an offset is read as UTC.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    let naive = chrono::NaiveDateTime::parse_from_str(value.trim_end_matches('Z'), "%Y-%m-%dT%H:%M:%S%.f")?;
    Ok(naive.and_utc())
}

/// Formats a timestamp the way state transitions are recorded.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown state: {0}")]
pub struct UnknownState(pub String);

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_timestamps() {
        let expected = "2024-05-01T12:30:00Z";
        for raw in [
            "2024-05-01T12:30:00Z",
            "2024-05-01T12:30:00",
            "2024-05-01T12:30:00.000",
            "2024-05-01T14:30:00+02:00",
        ] {
            let ts = parse_timestamp(raw).unwrap();
            assert_eq!(format_timestamp(ts), expected, "{raw}");
        }
        assert!(parse_timestamp("tomorrow").is_err());
    }
}
