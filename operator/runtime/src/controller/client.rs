use super::{Context, Error};
use crate::core::client::ClientMachine;
use chrono::Utc;
use gefyra_operator_k8s_api::{
    labels, ClientState, DeleteParams, GefyraBridge, GefyraClient, ListParams, ResourceExt,
};
use kube::runtime::controller::Action;
use std::{sync::Arc, time::Duration};
use tracing::{info, instrument, warn};

const INTERVAL: Duration = Duration::from_secs(60);

pub(crate) async fn reconcile(
    client: Arc<GefyraClient>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    super::reconcile(client, ctx, apply, cleanup).await
}

#[instrument(skip_all, fields(client = %client.name_any()))]
async fn apply(client: Arc<GefyraClient>, ctx: Arc<Context>) -> Result<Action, Error> {
    let provider = ctx.providers.connections.build(&client.spec.provider, &())?;
    let mut machine = ClientMachine::new(
        &client,
        ctx.persist(&*client),
        provider,
        ctx.credentials.clone(),
        ctx.events(&*client),
    );
    let outcome = machine.reconcile(Utc::now()).await?;
    let failed = machine.state() == ClientState::Error;
    ctx.requeue(&*client, outcome, failed, INTERVAL).await
}

/// Removes the peer, revokes the client's identity and deletes every
/// bridge routing to it.
#[instrument(skip_all, fields(client = %client.name_any()))]
async fn cleanup(client: Arc<GefyraClient>, ctx: Arc<Context>) -> Result<Action, Error> {
    let id = client.name_any();
    match ctx.providers.connections.build(&client.spec.provider, &()) {
        Ok(provider) => {
            ClientMachine::new(
                &client,
                ctx.persist(&*client),
                provider,
                ctx.credentials.clone(),
                ctx.events(&*client),
            )
            .terminate()
            .await?
        }
        Err(error) => {
            warn!(%error, "Skipping peer removal");
            ctx.credentials.revoke(&id).await?;
        }
    }

    let bridges = ctx.api::<GefyraBridge>();
    let selector = format!("{}={id}", labels::CLIENT);
    for bridge in bridges.list(&ListParams::default().labels(&selector)).await? {
        let name = bridge.name_any();
        info!(bridge = %name, "Deleting bridge of removed client");
        match bridges.delete(&name, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(rsp)) if rsp.code == 404 => {}
            Err(error) => return Err(error.into()),
        }
    }
    Ok(Action::await_change())
}
