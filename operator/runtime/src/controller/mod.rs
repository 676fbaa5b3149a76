//! Drives every Gefyra resource through its state machine.
//!
//! Each kind gets its own [`Controller`]. A reconcile rebuilds the machine
//! from the resource, pumps it and turns the outcome into a requeue. The
//! finalizer runs the terminal transition before an object goes away.

pub(crate) mod bridge;
pub(crate) mod client;
pub(crate) mod mount;

use crate::{
    core::{self, Credentials, Outcome},
    events::KubeEvents,
    metrics::ControllerMetrics,
    persist::KubePersist,
    providers::Providers,
};
use futures::prelude::*;
use gefyra_operator_k8s_api::{Api, Client, DeleteParams};
use kube::{
    runtime::{controller::Action, finalizer, watcher, Controller},
    Resource, ResourceExt,
};
use serde::de::DeserializeOwned;
use std::{fmt::Debug, sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const FINALIZER: &str = "operator.gefyra.dev/cleanup";

pub struct Context {
    pub client: Client,
    pub namespace: String,
    pub providers: Arc<Providers>,
    pub credentials: Arc<dyn Credentials>,
    /// How often mounts are checked for drift and failed objects retried.
    pub reconcile_interval: Duration,
    pub metrics: ControllerMetrics,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Operator(#[from] core::Error),

    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("object has no name")]
    UnnamedObject,

    #[error("invalid finalizer")]
    InvalidFinalizer,
}

impl From<finalizer::Error<Error>> for Error {
    fn from(error: finalizer::Error<Error>) -> Self {
        match error {
            finalizer::Error::ApplyFailed(e) | finalizer::Error::CleanupFailed(e) => e,
            finalizer::Error::AddFinalizer(e) | finalizer::Error::RemoveFinalizer(e) => {
                Error::Kube(e)
            }
            finalizer::Error::UnnamedObject => Error::UnnamedObject,
            finalizer::Error::InvalidFinalizer => Error::InvalidFinalizer,
        }
    }
}

// === impl Context ===

impl Context {
    pub(crate) fn api<K>(&self) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    pub(crate) fn persist<K>(&self, obj: &K) -> Arc<KubePersist<K>>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>
            + Clone
            + Debug
            + DeserializeOwned
            + Send
            + Sync
            + 'static,
    {
        Arc::new(KubePersist::new(self.api(), obj.name_any()))
    }

    pub(crate) fn events<K: Resource<DynamicType = ()>>(&self, obj: &K) -> Arc<KubeEvents> {
        Arc::new(KubeEvents::new(self.client.clone(), obj.object_ref(&())))
    }

    /// Turns the outcome of a machine into the next reconcile.
    ///
    /// `every` is the usual interval of the kind; failed objects are
    /// retried at the reconcile interval.
    pub(crate) async fn requeue<K>(
        &self,
        obj: &K,
        outcome: Outcome,
        failed: bool,
        every: Duration,
    ) -> Result<Action, Error>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>
            + Clone
            + Debug
            + DeserializeOwned,
    {
        let every = if failed {
            self.reconcile_interval
        } else {
            every
        };
        match outcome {
            Outcome::Settled => Ok(Action::requeue(every)),
            Outcome::RequeueAfter(due) => Ok(Action::requeue(due.min(every))),
            Outcome::Delete => {
                let name = obj.name_any();
                info!(kind = %K::kind(&()), %name, "Deleting after sunset");
                match self.api::<K>().delete(&name, &DeleteParams::default()).await {
                    Ok(_) => {}
                    Err(kube::Error::Api(rsp)) if rsp.code == 404 => {}
                    Err(error) => return Err(error.into()),
                }
                Ok(Action::await_change())
            }
        }
    }
}

/// Runs the finalizer-guarded reconcile of one object.
pub(crate) async fn reconcile<K, A, AFut, C, CFut>(
    obj: Arc<K>,
    ctx: Arc<Context>,
    apply: A,
    cleanup: C,
) -> Result<Action, Error>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + DeserializeOwned
        + serde::Serialize
        + Send
        + Sync
        + 'static,
    A: FnOnce(Arc<K>, Arc<Context>) -> AFut,
    AFut: Future<Output = Result<Action, Error>>,
    C: FnOnce(Arc<K>, Arc<Context>) -> CFut,
    CFut: Future<Output = Result<Action, Error>>,
{
    let kind = K::kind(&());
    let started = Instant::now();
    let api = ctx.api::<K>();
    let res = finalizer(&api, FINALIZER, obj, |event| {
        let ctx = ctx.clone();
        async move {
            match event {
                finalizer::Event::Apply(obj) => apply(obj, ctx).await,
                finalizer::Event::Cleanup(obj) => cleanup(obj, ctx).await,
            }
        }
    })
    .await
    .map_err(Error::from);
    ctx.metrics
        .observe(kind_label(&kind), res.is_ok(), started.elapsed());
    res
}

fn kind_label(kind: &str) -> &'static str {
    match kind {
        "GefyraClient" => "client",
        "GefyraBridgeMount" => "bridgemount",
        "GefyraBridge" => "bridge",
        _ => "other",
    }
}

/// Transient failures come back after their own delay, everything else at
/// the reconcile interval.
pub(crate) fn error_policy<K>(obj: Arc<K>, error: &Error, ctx: Arc<Context>) -> Action
where
    K: Resource<DynamicType = ()>,
{
    match error {
        Error::Operator(e) if e.is_transient() => {
            debug!(name = %obj.name_any(), error = %e, "Retrying");
            Action::requeue(e.retry_after())
        }
        Error::Kube(_) => Action::requeue(core::DEFAULT_RETRY),
        _ => Action::requeue(ctx.reconcile_interval),
    }
}

/// Runs the controller of one kind until shutdown is signaled.
pub(crate) async fn run<K, R, Fut>(ctx: Arc<Context>, reconcile: R, drain: drain::Watch)
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
    R: FnMut(Arc<K>, Arc<Context>) -> Fut,
    Fut: Future<Output = Result<Action, Error>> + Send + 'static,
{
    let kind = K::kind(&()).to_string();
    let (close_tx, close_rx) = tokio::sync::oneshot::channel::<()>();
    let controller = Controller::new(ctx.api::<K>(), watcher::Config::default())
        .graceful_shutdown_on(close_rx.map(|_| ()))
        .run(reconcile, error_policy, ctx)
        .for_each(|res| {
            match res {
                Ok((obj, _)) => debug!(%kind, name = %obj.name, "Reconciled"),
                Err(error) => warn!(%kind, %error, "Reconcile failed"),
            }
            future::ready(())
        });
    tokio::pin!(controller);

    info!(kind = %K::kind(&()), "Controller started");
    tokio::select! {
        () = &mut controller => {}
        handle = drain.signaled() => {
            let _ = close_tx.send(());
            handle.release_after(controller).await;
        }
    }
}
