//! Checks of Gefyra resources that need nothing but the objects involved.
//!
//! Provider lookups and cluster reads happen in the admission service, which
//! then hands the results to these functions.

use anyhow::{anyhow, bail, ensure, Result};
use gefyra_operator_k8s_api::{
    labels, parse_timestamp, BridgeState, ClientState, GefyraBridge, GefyraBridgeMount,
    GefyraClient, MountState, PortMapping, ResourceExt,
};
use kube::core::admission::Operation;
use std::{collections::BTreeSet, net::IpAddr};

pub(crate) fn sunset(sunset: Option<&str>) -> Result<()> {
    if let Some(sunset) = sunset {
        parse_timestamp(sunset).map_err(|e| anyhow!("cannot parse 'sunset': {e}"))?;
    }
    Ok(())
}

/// Whether an update sets activation parameters to a new, non-empty value.
pub(crate) fn parameters_set(old: Option<&GefyraClient>, new: &GefyraClient) -> bool {
    !new.spec.provider_parameter.is_empty()
        && old.map_or(true, |old| old.spec.provider_parameter != new.spec.provider_parameter)
}

pub(crate) fn client(
    operation: &Operation,
    old: Option<&GefyraClient>,
    new: &GefyraClient,
) -> Result<()> {
    sunset(new.spec.sunset.as_deref())?;
    if new.spec.max_connection_age == Some(0) {
        bail!("'maxConnectionAge' must be positive");
    }

    match (operation, old) {
        (Operation::Create, _) => ensure!(
            new.spec.provider_parameter.is_empty(),
            "cannot set 'providerParameter' when creating a Gefyra client"
        ),
        (Operation::Update, Some(old)) => {
            ensure!(
                old.spec.provider == new.spec.provider,
                "'provider' cannot be changed"
            );
            if parameters_set(Some(old), new) && old.state() != ClientState::Waiting {
                bail!(
                    "cannot set 'providerParameter' when state is not {}",
                    ClientState::Waiting
                );
            }
        }
        _ => {}
    }
    Ok(())
}

/// Two mounts collide when they target the same workload.
fn same_target(a: &GefyraBridgeMount, b: &GefyraBridgeMount) -> bool {
    if a.spec.target_namespace != b.spec.target_namespace {
        return false;
    }
    match (a.spec.target_ref(), b.spec.target_ref()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a.spec.target == b.spec.target,
    }
}

/// `existing` lists the mounts already present in the namespace.
pub(crate) fn mount(
    operation: &Operation,
    old: Option<&GefyraBridgeMount>,
    new: &GefyraBridgeMount,
    existing: &[GefyraBridgeMount],
) -> Result<()> {
    let spec = &new.spec;
    ensure!(!spec.target.is_empty(), "'target' must not be empty");
    ensure!(
        !spec.target_namespace.is_empty(),
        "'targetNamespace' must not be empty"
    );
    ensure!(
        !spec.target_container.is_empty(),
        "'targetContainer' must not be empty"
    );
    spec.target_ref()?;
    if let Some(tls) = &spec.provider_parameter.tls {
        ensure!(
            !tls.certificate.is_empty() && !tls.key.is_empty(),
            "'tls' requires a certificate and a key"
        );
    }
    sunset(spec.sunset.as_deref())?;

    match (operation, old) {
        (Operation::Create, _) => {
            let name = new.name_any();
            if let Some(other) = existing
                .iter()
                .find(|m| m.name_any() != name && same_target(m, new))
            {
                bail!(
                    "{} in namespace {} is already mounted by {}",
                    spec.target,
                    spec.target_namespace,
                    other.name_any()
                );
            }
        }
        (Operation::Update, Some(old)) => {
            ensure!(
                old.spec.target == spec.target
                    && old.spec.target_namespace == spec.target_namespace
                    && old.spec.target_container == spec.target_container,
                "the target of a bridge mount cannot be changed"
            );
            ensure!(
                old.spec.provider == spec.provider,
                "'provider' cannot be changed"
            );
        }
        _ => {}
    }
    Ok(())
}

/// A bridge still holds its routes unless it is on its way out.
fn is_live(bridge: &GefyraBridge) -> bool {
    bridge.metadata.deletion_timestamp.is_none()
        && !matches!(
            bridge.state(),
            BridgeState::Removing | BridgeState::Restoring | BridgeState::Terminating
        )
}

fn target_ports(bridge: &GefyraBridge) -> BTreeSet<u16> {
    bridge
        .spec
        .port_mappings()
        .map(|mappings| mappings.into_iter().map(|m| m.target).collect())
        .unwrap_or_default()
}

/// `mount` is the bridge mount named by the bridge, if it exists; `bridges`
/// lists the bridges of that mount.
pub(crate) fn bridge(
    operation: &Operation,
    old: Option<&GefyraBridge>,
    new: &GefyraBridge,
    mount: Option<&GefyraBridgeMount>,
    bridges: &[GefyraBridge],
) -> Result<()> {
    let spec = &new.spec;
    let bridge_labels = new.labels();
    ensure!(
        bridge_labels.get(labels::BRIDGE_MOUNT) == Some(&spec.target),
        "label {} must name the bridge mount {}",
        labels::BRIDGE_MOUNT,
        spec.target
    );
    ensure!(
        bridge_labels.get(labels::CLIENT) == Some(&spec.client),
        "label {} must name the client {}",
        labels::CLIENT,
        spec.client
    );

    let mappings: Vec<PortMapping> = spec.port_mappings()?;
    ensure!(!mappings.is_empty(), "'portMappings' must not be empty");
    spec.destination_ip
        .parse::<IpAddr>()
        .map_err(|e| anyhow!("invalid 'destinationIP' {}: {e}", spec.destination_ip))?;
    sunset(spec.sunset.as_deref())?;

    match (operation, old) {
        (Operation::Create, _) => {
            let Some(mount) = mount else {
                bail!("bridge mount {} does not exist", spec.target);
            };
            ensure!(
                mount.state() == MountState::Active,
                "bridge mount {} is not {}",
                spec.target,
                MountState::Active
            );

            let name = new.name_any();
            let ports = target_ports(new);
            for other in bridges {
                if other.name_any() == name
                    || other.spec.target != spec.target
                    || !is_live(other)
                {
                    continue;
                }
                let shared = target_ports(other).intersection(&ports).next().copied();
                if let Some(port) = shared {
                    if other.spec.provider_parameter.rules == spec.provider_parameter.rules {
                        bail!(
                            "bridge {} already routes the same rules of port {port}",
                            other.name_any()
                        );
                    }
                }
            }
        }
        (Operation::Update, Some(old)) => {
            let mut unchanged = old.spec.clone();
            unchanged.sunset = spec.sunset.clone();
            ensure!(
                &unchanged == spec,
                "only 'sunset' of a bridge can be changed"
            );
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gefyra_operator_k8s_api::{
        bridge::BridgeParameters,
        rules::{Match, MatchType, Rule},
        BridgeSpec, BridgeStatus, ClientSpec, ClientStatus, MountSpec,
        MountStatus, Tls,
    };
    use maplit::btreemap;
    use rstest::rstest;

    fn gclient(params: &[(&str, &str)], state: ClientState) -> GefyraClient {
        let mut client = GefyraClient::new(
            "alice",
            ClientSpec {
                provider: "stowaway".to_string(),
                provider_parameter: params
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                sunset: None,
                max_connection_age: None,
            },
        );
        client.status = Some(ClientStatus {
            state,
            ..Default::default()
        });
        client
    }

    fn gmount(name: &str, target: &str) -> GefyraBridgeMount {
        let mut mount = GefyraBridgeMount::new(
            name,
            MountSpec {
                target: target.to_string(),
                target_namespace: "default".to_string(),
                target_container: "nginx".to_string(),
                provider: "carrier2mount".to_string(),
                provider_parameter: Default::default(),
                sunset: None,
            },
        );
        mount.status = Some(MountStatus {
            state: MountState::Active,
            ..Default::default()
        });
        mount
    }

    fn header(value: &str) -> Rule {
        Rule {
            matches: vec![Match::header("x-gefyra", value, MatchType::Exact)],
        }
    }

    fn gbridge(name: &str, port: u16, rules: Vec<Rule>) -> GefyraBridge {
        let mut bridge = GefyraBridge::new(
            name,
            BridgeSpec {
                target: "nginx".to_string(),
                client: "alice".to_string(),
                destination_ip: "192.168.99.2".to_string(),
                port_mappings: vec![format!("8080:{port}")],
                provider_parameter: BridgeParameters { rules },
                provider: "carrier2".to_string(),
                connection_provider: "stowaway".to_string(),
                sunset: None,
            },
        );
        bridge.metadata.labels = Some(btreemap! {
            labels::BRIDGE_MOUNT.to_string() => "nginx".to_string(),
            labels::CLIENT.to_string() => "alice".to_string(),
        });
        bridge.status = Some(BridgeStatus {
            state: BridgeState::Active,
            ..Default::default()
        });
        bridge
    }

    #[test]
    fn client_parameters_only_on_waiting() {
        assert!(client(&Operation::Create, None, &gclient(&[], ClientState::Requested)).is_ok());
        assert!(client(
            &Operation::Create,
            None,
            &gclient(&[("subnet", "192.168.101.0/24")], ClientState::Requested)
        )
        .is_err());

        let params = [("subnet", "192.168.101.0/24")];
        let waiting = gclient(&[], ClientState::Waiting);
        let creating = gclient(&[], ClientState::Creating);
        let active = gclient(&params, ClientState::Active);
        let new = gclient(&params, ClientState::Waiting);
        assert!(client(&Operation::Update, Some(&waiting), &new).is_ok());
        assert!(client(&Operation::Update, Some(&creating), &new).is_err());

        // Unchanged and cleared parameters are always accepted.
        assert!(client(&Operation::Update, Some(&active), &new).is_ok());
        assert!(client(&Operation::Update, Some(&active), &waiting).is_ok());
    }

    #[test]
    fn client_fields() {
        let mut c = gclient(&[], ClientState::Requested);
        c.spec.sunset = Some("2024-05-01T12:00:00Z".to_string());
        assert!(client(&Operation::Create, None, &c).is_ok());
        c.spec.sunset = Some("tomorrow".to_string());
        assert!(client(&Operation::Create, None, &c).is_err());

        let mut c = gclient(&[], ClientState::Requested);
        c.spec.max_connection_age = Some(0);
        assert!(client(&Operation::Create, None, &c).is_err());

        let old = gclient(&[], ClientState::Waiting);
        let mut new = old.clone();
        new.spec.provider = "other".to_string();
        assert!(client(&Operation::Update, Some(&old), &new).is_err());
    }

    #[test]
    fn parameter_changes() {
        let empty = gclient(&[], ClientState::Waiting);
        let set = gclient(&[("subnet", "10.0.0.0/24")], ClientState::Waiting);
        assert!(parameters_set(None, &set));
        assert!(parameters_set(Some(&empty), &set));
        assert!(!parameters_set(Some(&set), &set));
        assert!(!parameters_set(Some(&set), &empty));
    }

    #[rstest]
    #[case("deploy/nginx", "deployment/nginx", true)]
    #[case("deploy/nginx", "deploy/other", false)]
    #[case("deploy/nginx", "pod/nginx", false)]
    #[case("nginx-0", "pods/nginx-0", true)]
    fn duplicate_mounts(#[case] existing: &str, #[case] requested: &str, #[case] denied: bool) {
        let existing = vec![gmount("first", existing)];
        let res = mount(&Operation::Create, None, &gmount("second", requested), &existing);
        assert_eq!(res.is_err(), denied, "{res:?}");
    }

    #[test]
    fn mount_fields() {
        let mut m = gmount("nginx", "job/nginx");
        assert!(mount(&Operation::Create, None, &m, &[]).is_err());

        m.spec.target = "deploy/nginx".to_string();
        m.spec.target_container = String::new();
        assert!(mount(&Operation::Create, None, &m, &[]).is_err());

        m.spec.target_container = "nginx".to_string();
        m.spec.provider_parameter.tls = Some(Tls {
            certificate: "cert".to_string(),
            key: String::new(),
            sni: None,
        });
        assert!(mount(&Operation::Create, None, &m, &[]).is_err());

        m.spec.provider_parameter.tls = None;
        assert!(mount(&Operation::Create, None, &m, &[m.clone()]).is_ok());
    }

    #[test]
    fn mount_target_is_immutable() {
        let old = gmount("nginx", "deploy/nginx");
        let mut new = old.clone();
        new.spec.sunset = Some("2024-05-01T12:00:00Z".to_string());
        assert!(mount(&Operation::Update, Some(&old), &new, &[]).is_ok());

        new.spec.target = "deploy/other".to_string();
        assert!(mount(&Operation::Update, Some(&old), &new, &[]).is_err());

        let mut new = old.clone();
        new.spec.provider = "other".to_string();
        assert!(mount(&Operation::Update, Some(&old), &new, &[]).is_err());
    }

    #[test]
    fn bridge_requires_active_mount() {
        let new = gbridge("b1", 80, vec![header("alice")]);
        assert!(bridge(&Operation::Create, None, &new, None, &[]).is_err());

        let mut m = gmount("nginx", "deploy/nginx");
        m.status = Some(MountStatus {
            state: MountState::Preparing,
            ..Default::default()
        });
        assert!(bridge(&Operation::Create, None, &new, Some(&m), &[]).is_err());

        let m = gmount("nginx", "deploy/nginx");
        assert!(bridge(&Operation::Create, None, &new, Some(&m), &[]).is_ok());
    }

    #[test]
    fn bridge_fields() {
        let m = gmount("nginx", "deploy/nginx");

        let mut b = gbridge("b1", 80, vec![]);
        b.metadata.labels = None;
        assert!(bridge(&Operation::Create, None, &b, Some(&m), &[]).is_err());

        let mut b = gbridge("b1", 80, vec![]);
        b.spec.port_mappings = vec!["8080".to_string()];
        assert!(bridge(&Operation::Create, None, &b, Some(&m), &[]).is_err());

        let mut b = gbridge("b1", 80, vec![]);
        b.spec.port_mappings = vec![];
        assert!(bridge(&Operation::Create, None, &b, Some(&m), &[]).is_err());

        let mut b = gbridge("b1", 80, vec![]);
        b.spec.destination_ip = "laptop".to_string();
        assert!(bridge(&Operation::Create, None, &b, Some(&m), &[]).is_err());
    }

    #[test]
    fn bridge_rule_collisions() {
        let m = gmount("nginx", "deploy/nginx");
        let live = vec![gbridge("b1", 80, vec![header("alice")])];

        let same = gbridge("b2", 80, vec![header("alice")]);
        assert!(bridge(&Operation::Create, None, &same, Some(&m), &live).is_err());

        let other_rules = gbridge("b2", 80, vec![header("bob")]);
        assert!(bridge(&Operation::Create, None, &other_rules, Some(&m), &live).is_ok());

        let other_port = gbridge("b2", 81, vec![header("alice")]);
        assert!(bridge(&Operation::Create, None, &other_port, Some(&m), &live).is_ok());

        let mut removing = live.clone();
        removing[0].status = Some(BridgeStatus {
            state: BridgeState::Removing,
            ..Default::default()
        });
        assert!(bridge(&Operation::Create, None, &same, Some(&m), &removing).is_ok());
    }

    #[test]
    fn bridge_only_sunset_changes() {
        let old = gbridge("b1", 80, vec![header("alice")]);
        let mut new = old.clone();
        new.spec.sunset = Some("2024-05-01T12:00:00Z".to_string());
        assert!(bridge(&Operation::Update, Some(&old), &new, None, &[]).is_ok());

        new.spec.provider_parameter.rules = vec![header("bob")];
        assert!(bridge(&Operation::Update, Some(&old), &new, None, &[]).is_err());
    }
}
