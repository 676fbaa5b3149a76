use gefyra_operator_k8s_api::{
    rules::{Match, MatchType, Rule},
    Deployment, GefyraBridge, GefyraBridgeMount, GefyraClient, Pod, ResourceExt,
};
use gefyra_operator_test::{
    await_deleted, await_rollout, await_state, eventually, exec, fixtures, random_suffix,
    with_temp_ns, OPERATOR_NAMESPACE,
};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use serde_json::json;

/// The carrier2 documents of every live nginx pod.
async fn carrier_configs(client: &kube::Client, ns: &str) -> Vec<String> {
    let pods = kube::Api::<Pod>::namespaced(client.clone(), ns)
        .list(&ListParams::default().labels("app=nginx"))
        .await
        .expect("pods must list");
    let mut configs = Vec::new();
    for pod in pods
        .items
        .iter()
        .filter(|pod| pod.metadata.deletion_timestamp.is_none())
    {
        let config = exec(
            client,
            ns,
            &pod.name_any(),
            "nginx",
            &["cat", "/tmp/config.yaml"],
        )
        .await;
        configs.push(config);
    }
    configs
}

#[tokio::test(flavor = "current_thread")]
async fn bridge_lifecycle() {
    with_temp_ns(|client, ns| async move {
        kube::Api::<Deployment>::namespaced(client.clone(), &ns)
            .create(&PostParams::default(), &fixtures::nginx(&ns))
            .await
            .expect("deployment must apply");
        await_rollout(&client, &ns, "nginx").await;

        let suffix = random_suffix(5);
        let mount = format!("mount-{suffix}");
        let peer = format!("client-{suffix}");
        let bridge = format!("bridge-{suffix}");

        let mounts = kube::Api::<GefyraBridgeMount>::namespaced(client.clone(), OPERATOR_NAMESPACE);
        mounts
            .create(
                &PostParams::default(),
                &fixtures::mount(OPERATOR_NAMESPACE, &mount, "deploy/nginx", &ns),
            )
            .await
            .expect("mount must apply");

        let clients = kube::Api::<GefyraClient>::namespaced(client.clone(), OPERATOR_NAMESPACE);
        clients
            .create(&PostParams::default(), &fixtures::client(OPERATOR_NAMESPACE, &peer))
            .await
            .expect("client must apply");
        await_state::<GefyraClient>(&client, &peer, "WAITING").await;
        let subnet = json!({ "spec": { "providerParameter": { "subnet": "192.168.103.0/24" } } });
        clients
            .patch(&peer, &PatchParams::default(), &Patch::Merge(&subnet))
            .await
            .expect("parameters must apply");

        await_state::<GefyraClient>(&client, &peer, "ACTIVE").await;
        await_state::<GefyraBridgeMount>(&client, &mount, "ACTIVE").await;

        let rules = vec![Rule {
            matches: vec![Match::header("x-gefyra", peer.as_str(), MatchType::Exact)],
        }];
        let bridges = kube::Api::<GefyraBridge>::namespaced(client.clone(), OPERATOR_NAMESPACE);
        bridges
            .create(
                &PostParams::default(),
                &fixtures::bridge(OPERATOR_NAMESPACE, &bridge, &mount, &peer, rules.clone()),
            )
            .await
            .expect("bridge must apply");

        let active = await_state::<GefyraBridge>(&client, &bridge, "ACTIVE").await;
        let status = active.status.expect("bridge must have a status");
        assert!(
            !status.cluster_endpoint.is_empty(),
            "bridge must expose a cluster endpoint"
        );
        let endpoint = status
            .cluster_endpoint
            .get("80")
            .expect("target port 80 must be routed")
            .clone();

        let configs = carrier_configs(&client, &ns).await;
        assert!(!configs.is_empty(), "nginx pods must run");
        for config in &configs {
            assert!(config.contains(&bridge), "bridge missing from {config}");
            assert!(config.contains(&endpoint), "endpoint missing from {config}");
            assert!(config.contains("x-gefyra"), "header rule missing from {config}");
            assert!(config.contains(&peer), "header value missing from {config}");
        }

        // A second bridge with the same rules on the same port collides.
        bridges
            .create(
                &PostParams::default(),
                &fixtures::bridge(OPERATOR_NAMESPACE, "collision", &mount, &peer, rules),
            )
            .await
            .expect_err("colliding rules must not apply");

        bridges
            .delete(&bridge, &DeleteParams::default())
            .await
            .expect("bridge must delete");
        await_deleted::<GefyraBridge>(&client, &bridge).await;

        let (kube_client, target_ns) = (&client, ns.as_str());
        let (name, routed) = (bridge.as_str(), endpoint.as_str());
        eventually("the route to leave the carrier2 documents", move || async move {
            carrier_configs(kube_client, target_ns)
                .await
                .iter()
                .all(|config| !config.contains(name) && !config.contains(routed))
        })
        .await;

        clients
            .delete(&peer, &DeleteParams::default())
            .await
            .expect("client must delete");
        mounts
            .delete(&mount, &DeleteParams::default())
            .await
            .expect("mount must delete");
        await_deleted::<GefyraClient>(&client, &peer).await;
        await_deleted::<GefyraBridgeMount>(&client, &mount).await;
    })
    .await;
}
