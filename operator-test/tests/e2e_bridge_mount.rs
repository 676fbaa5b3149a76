use gefyra_operator_k8s_api::{Deployment, GefyraBridgeMount, Pod};
use gefyra_operator_test::{
    await_deleted, await_rollout, await_state, await_until, eventually, fixtures, random_suffix,
    with_temp_ns, OPERATOR_NAMESPACE,
};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use serde_json::json;

/// Images of the `nginx` containers of live pods labeled `app=nginx`.
async fn nginx_images(client: &kube::Client, ns: &str) -> Vec<String> {
    kube::Api::<Pod>::namespaced(client.clone(), ns)
        .list(&ListParams::default().labels("app=nginx"))
        .await
        .expect("pods must list")
        .items
        .into_iter()
        .filter(|pod| pod.metadata.deletion_timestamp.is_none())
        .flat_map(|pod| pod.spec.map(|spec| spec.containers).unwrap_or_default())
        .filter(|container| container.name == "nginx")
        .filter_map(|container| container.image)
        .collect()
}

async fn deploy_nginx(client: &kube::Client, ns: &str) {
    kube::Api::<Deployment>::namespaced(client.clone(), ns)
        .create(&PostParams::default(), &fixtures::nginx(ns))
        .await
        .expect("deployment must apply");
    await_rollout(client, ns, "nginx").await;
}

async fn create_mount(client: &kube::Client, ns: &str) -> String {
    let name = format!("mount-{}", random_suffix(5));
    kube::Api::<GefyraBridgeMount>::namespaced(client.clone(), OPERATOR_NAMESPACE)
        .create(
            &PostParams::default(),
            &fixtures::mount(OPERATOR_NAMESPACE, &name, "deploy/nginx", ns),
        )
        .await
        .expect("mount must apply");
    name
}

async fn delete_mount(client: &kube::Client, name: &str) {
    kube::Api::<GefyraBridgeMount>::namespaced(client.clone(), OPERATOR_NAMESPACE)
        .delete(name, &DeleteParams::default())
        .await
        .expect("mount must delete");
    await_deleted::<GefyraBridgeMount>(client, name).await;
}

#[tokio::test(flavor = "current_thread")]
async fn mount_lifecycle() {
    with_temp_ns(|client, ns| async move {
        deploy_nginx(&client, &ns).await;
        let name = create_mount(&client, &ns).await;

        let active = await_state::<GefyraBridgeMount>(&client, &name, "ACTIVE").await;
        let status = active.status.expect("mount must have a status");
        assert!(status.state_transitions.contains_key("ACTIVE"));

        let images = nginx_images(&client, &ns).await;
        assert!(!images.is_empty(), "nginx pods must run");
        assert!(
            images.iter().all(|image| image.contains("gefyra/carrier2")),
            "pods must run carrier2: {images:?}"
        );

        delete_mount(&client, &name).await;

        // The restore is a rollout; old pods keep the carrier until replaced.
        let (kube_client, target_ns) = (&client, ns.as_str());
        eventually("the original image to be restored", move || async move {
            let images = nginx_images(kube_client, target_ns).await;
            !images.is_empty() && images.iter().all(|image| image == fixtures::NGINX_IMAGE)
        })
        .await;
        await_rollout(&client, &ns, "nginx").await;
        let images = nginx_images(&client, &ns).await;
        assert!(
            images.iter().all(|image| image == fixtures::NGINX_IMAGE),
            "images must be restored: {images:?}"
        );
    })
    .await;
}

#[tokio::test(flavor = "current_thread")]
async fn scaled_target_is_restored_and_mounted_again() {
    with_temp_ns(|client, ns| async move {
        deploy_nginx(&client, &ns).await;
        let name = create_mount(&client, &ns).await;
        await_state::<GefyraBridgeMount>(&client, &name, "ACTIVE").await;

        let deployments = kube::Api::<Deployment>::namespaced(client.clone(), &ns);
        deployments
            .patch(
                "nginx",
                &PatchParams::default(),
                &Patch::Merge(&json!({ "spec": { "replicas": 2 } })),
            )
            .await
            .expect("deployment must scale");

        await_until(
            &client,
            &name,
            "ACTIVE after restoring",
            |mount: &GefyraBridgeMount| {
                mount.status.as_ref().map_or(false, |status| {
                    status.state_transitions.contains_key("RESTORING")
                        && gefyra_operator_test::state_of(mount).as_deref() == Some("ACTIVE")
                })
            },
        )
        .await;

        let original = deployments.get("nginx").await.expect("target must exist");
        let shadow = deployments
            .get("nginx-gefyra")
            .await
            .expect("shadow must exist");
        let replicas = |d: &Deployment| d.spec.as_ref().and_then(|s| s.replicas);
        assert_eq!(replicas(&original), Some(2));
        assert_eq!(replicas(&shadow), replicas(&original));

        let images = nginx_images(&client, &ns).await;
        assert_eq!(images.len(), 2, "{images:?}");
        assert!(
            images.iter().all(|image| image.contains("gefyra/carrier2")),
            "scaled pods must run carrier2: {images:?}"
        );

        delete_mount(&client, &name).await;
    })
    .await;
}
