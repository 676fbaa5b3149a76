#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod bridge;
pub mod bridge_mount;
pub mod client;
mod error;
pub mod events;
pub mod fsm;
pub mod provider;
pub mod registry;
#[cfg(test)]
mod testing;

pub use self::{
    error::{Error, Result, DEFAULT_RETRY},
    events::{EventKind, Events, NoopEvents},
    fsm::{Machine, Persist, State},
    provider::{
        BridgeMountProvider, BridgeProvider, ConnectionProvider, Credentials, MountTarget,
        ProxyRoute, ServiceAccount,
    },
    registry::{BridgeProviders, ConnectionProviders, MountProviders, Registry},
};

use chrono::{DateTime, Utc};
use std::time::Duration;

/// What the caller should do after a machine was driven.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing is pending; check again at the usual interval.
    Settled,
    /// Something becomes due after the given delay.
    RequeueAfter(Duration),
    /// The resource reached its sunset and should be deleted.
    Delete,
}

/// Returns the time left until `sunset`, or `None` when it has passed.
///
/// Unparseable values never expire.
pub(crate) fn until_sunset(sunset: Option<&str>, now: DateTime<Utc>) -> Option<Option<Duration>> {
    let sunset = sunset?;
    match gefyra_operator_k8s_api::parse_timestamp(sunset) {
        Ok(at) => Some((at - now).to_std().ok().filter(|d| !d.is_zero())),
        Err(error) => {
            tracing::warn!(%sunset, %error, "Ignoring invalid sunset");
            None
        }
    }
}

/// The earlier of two optional deadlines.
pub(crate) fn earliest(a: Option<Duration>, b: Option<Duration>) -> Option<Duration> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

impl Outcome {
    pub(crate) fn after(delay: Option<Duration>) -> Self {
        delay.map_or(Self::Settled, Self::RequeueAfter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn sunsets() {
        let now = gefyra_operator_k8s_api::parse_timestamp("2024-05-01T12:00:00Z").unwrap();
        assert_eq!(until_sunset(None, now), None);
        assert_eq!(until_sunset(Some("soon"), now), None);
        assert_eq!(
            until_sunset(Some("2024-05-01T12:00:30Z"), now),
            Some(Some(Duration::from_secs(30)))
        );
        assert_eq!(until_sunset(Some("2024-05-01T11:00:00Z"), now), Some(None));
        assert_eq!(
            earliest(Some(Duration::from_secs(3)), Some(Duration::from_secs(2))),
            Some(Duration::from_secs(2))
        );
        assert_eq!(earliest(None, Some(Duration::from_secs(2))), Some(Duration::from_secs(2)));
    }
}
