use super::{Context, Error};
use crate::core::{
    bridge_mount::{self, MountMachine},
    BridgeMountProvider, MountTarget, Outcome,
};
use chrono::Utc;
use gefyra_operator_k8s_api::{GefyraBridgeMount, MountState, ResourceExt};
use kube::runtime::controller::Action;
use std::sync::Arc;
use tracing::{instrument, warn};

pub(crate) async fn reconcile(
    mount: Arc<GefyraBridgeMount>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    super::reconcile(mount, ctx, apply, cleanup).await
}

fn provider(
    mount: &GefyraBridgeMount,
    ctx: &Context,
) -> crate::core::Result<Arc<dyn BridgeMountProvider>> {
    let target = MountTarget::from_resource(mount)?;
    ctx.providers.mounts.build(&mount.spec.provider, &target)
}

/// Mounts are requeued at the reconcile interval so that drift of the
/// target workload is noticed.
#[instrument(skip_all, fields(mount = %mount.name_any()))]
async fn apply(mount: Arc<GefyraBridgeMount>, ctx: Arc<Context>) -> Result<Action, Error> {
    let provider = match provider(&mount, &ctx) {
        Ok(provider) => provider,
        Err(error) if !error.is_transient() => {
            bridge_mount::impair(&mount, ctx.persist(&*mount), ctx.events(&*mount), &error)
                .await?;
            return ctx
                .requeue(&*mount, Outcome::Settled, true, ctx.reconcile_interval)
                .await;
        }
        Err(error) => return Err(error.into()),
    };
    let mut machine = MountMachine::new(
        &mount,
        ctx.persist(&*mount),
        provider,
        ctx.events(&*mount),
    );
    let outcome = machine.reconcile(Utc::now()).await?;
    let failed = machine.state() == MountState::Error;
    ctx.requeue(&*mount, outcome, failed, ctx.reconcile_interval)
        .await
}

#[instrument(skip_all, fields(mount = %mount.name_any()))]
async fn cleanup(mount: Arc<GefyraBridgeMount>, ctx: Arc<Context>) -> Result<Action, Error> {
    match provider(&mount, &ctx) {
        Ok(provider) => {
            MountMachine::new(&mount, ctx.persist(&*mount), provider, ctx.events(&*mount))
                .terminate()
                .await?
        }
        // Nothing can have been installed for an unknown provider or target.
        Err(error) => warn!(%error, "Skipping uninstall"),
    }
    Ok(Action::await_change())
}
