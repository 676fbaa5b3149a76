use super::{Context, Error};
use crate::core::{bridge::BridgeMachine, BridgeProvider, MountTarget};
use chrono::Utc;
use gefyra_operator_k8s_api::{BridgeState, GefyraBridge, GefyraBridgeMount, ResourceExt};
use kube::runtime::controller::Action;
use std::{sync::Arc, time::Duration};
use tracing::{debug, instrument};

const INTERVAL: Duration = Duration::from_secs(60);

pub(crate) async fn reconcile(
    bridge: Arc<GefyraBridge>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    super::reconcile(bridge, ctx, apply, cleanup).await
}

/// Builds the machine of a bridge. The bridge provider is bound to the
/// bridge mount and is absent when the mount is gone.
async fn machine(bridge: &GefyraBridge, ctx: &Context) -> Result<BridgeMachine, Error> {
    let connection = ctx
        .providers
        .connections
        .build(&bridge.spec.connection_provider, &())?;

    let provider: Option<Arc<dyn BridgeProvider>> =
        match ctx.api::<GefyraBridgeMount>().get_opt(&bridge.spec.target).await? {
            Some(mount) => {
                let target = MountTarget::from_resource(&mount)?;
                Some(ctx.providers.bridges.build(&bridge.spec.provider, &target)?)
            }
            None => {
                debug!(mount = %bridge.spec.target, "Bridge mount not found");
                None
            }
        };

    Ok(BridgeMachine::new(
        bridge,
        ctx.persist(bridge),
        connection,
        provider,
        ctx.events(bridge),
    ))
}

#[instrument(skip_all, fields(bridge = %bridge.name_any()))]
async fn apply(bridge: Arc<GefyraBridge>, ctx: Arc<Context>) -> Result<Action, Error> {
    let mut machine = machine(&bridge, &ctx).await?;
    let outcome = machine.reconcile(Utc::now()).await?;
    let failed = machine.state() == BridgeState::Error;
    ctx.requeue(&*bridge, outcome, failed, INTERVAL).await
}

#[instrument(skip_all, fields(bridge = %bridge.name_any()))]
async fn cleanup(bridge: Arc<GefyraBridge>, ctx: Arc<Context>) -> Result<Action, Error> {
    machine(&bridge, &ctx).await?.terminate().await?;
    Ok(Action::await_change())
}
