use crate::{core::MountTarget, providers::Providers, validation};
use anyhow::{anyhow, ensure, Result};
use futures::future;
use gefyra_operator_k8s_api::{
    labels, Api, Client, GefyraBridge, GefyraBridgeMount, GefyraClient, ListParams, ResourceExt,
};
use http_body_util::BodyExt;
use hyper::{http, Request, Response};
use kube::{
    core::{admission::Operation, DynamicObject},
    Resource,
};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Validates Gefyra resources before they are persisted. Never mutates.
#[derive(Clone)]
pub struct Admission {
    client: Client,
    namespace: Arc<str>,
    providers: Arc<Providers>,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Request(#[from] hyper::Error),

    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),
}

type Review = kube::core::admission::AdmissionReview<DynamicObject>;
type AdmissionRequest = kube::core::admission::AdmissionRequest<DynamicObject>;
type AdmissionResponse = kube::core::admission::AdmissionResponse;
type AdmissionReview = kube::core::admission::AdmissionReview<DynamicObject>;

#[async_trait::async_trait]
trait Validate<T> {
    async fn validate(
        self,
        ns: &str,
        operation: &Operation,
        old: Option<&T>,
        new: &T,
    ) -> Result<()>;
}

type Body = http_body_util::Full<bytes::Bytes>;

// === impl Admission ===

impl tower::Service<Request<hyper::body::Incoming>> for Admission {
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<hyper::body::Incoming>) -> Self::Future {
        trace!(?req);
        if req.method() != http::Method::POST || req.uri().path() != "/" {
            return Box::pin(future::ok(not_found()));
        }

        let admission = self.clone();
        Box::pin(async move {
            use bytes::Buf;
            let bytes = req.into_body().collect().await?.to_bytes();
            let review: Review = match serde_json::from_reader(bytes.reader()) {
                Ok(review) => review,
                Err(error) => {
                    warn!(%error, "Failed to parse request body");
                    return json_response(AdmissionResponse::invalid(error).into_review());
                }
            };
            trace!(?review);

            let rsp = match review.try_into() {
                Ok(req) => {
                    debug!(?req);
                    admission.admit(req).await
                }
                Err(error) => {
                    warn!(%error, "Invalid admission request");
                    AdmissionResponse::invalid(error)
                }
            };
            debug!(?rsp);
            json_response(rsp.into_review())
        })
    }
}

impl Admission {
    pub fn new(client: Client, namespace: impl Into<Arc<str>>, providers: Arc<Providers>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            providers,
        }
    }

    fn api<K>(&self, ns: &str) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), ns)
    }

    async fn admit(self, req: AdmissionRequest) -> AdmissionResponse {
        if !matches!(req.operation, Operation::Create | Operation::Update) {
            return AdmissionResponse::from(&req);
        }

        if is_kind::<GefyraClient>(&req) {
            return self.admit_resource::<GefyraClient>(req).await;
        }

        if is_kind::<GefyraBridgeMount>(&req) {
            return self.admit_resource::<GefyraBridgeMount>(req).await;
        }

        if is_kind::<GefyraBridge>(&req) {
            return self.admit_resource::<GefyraBridge>(req).await;
        }

        AdmissionResponse::invalid(format_args!(
            "unsupported resource type: {}.{}.{}",
            req.kind.group, req.kind.version, req.kind.kind
        ))
    }

    async fn admit_resource<T>(self, req: AdmissionRequest) -> AdmissionResponse
    where
        T: DeserializeOwned + Send + Sync,
        Self: Validate<T>,
    {
        let rsp = AdmissionResponse::from(&req);

        let kind = req.kind.kind.clone();
        let name = req.name.clone();
        let ns = req
            .namespace
            .clone()
            .unwrap_or_else(|| self.namespace.to_string());
        let operation = req.operation.clone();
        let (old, new) = match parse::<T>(req) {
            Ok(objs) => objs,
            Err(error) => {
                info!(%error, "Failed to parse {}", kind);
                return rsp.deny(error);
            }
        };

        if let Err(error) = self.validate(&ns, &operation, old.as_ref(), &new).await {
            info!(%error, %name, %kind, "Denied");
            return rsp.deny(error);
        }

        rsp
    }
}

fn is_kind<T>(req: &AdmissionRequest) -> bool
where
    T: Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();
    req.kind.group.eq_ignore_ascii_case(&T::group(&dt))
        && req.kind.kind.eq_ignore_ascii_case(&T::kind(&dt))
}

fn not_found() -> Response<Body> {
    let mut rsp = Response::new(Body::default());
    *rsp.status_mut() = http::StatusCode::NOT_FOUND;
    rsp
}

fn json_response(rsp: AdmissionReview) -> Result<Response<Body>, Error> {
    let bytes = serde_json::to_vec(&rsp)?;
    let mut rsp = Response::new(Body::from(bytes));
    rsp.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/json"),
    );
    Ok(rsp)
}

/// Reads the old and the new object of a request as typed resources.
fn parse<T: DeserializeOwned>(req: AdmissionRequest) -> Result<(Option<T>, T)> {
    fn typed<T: DeserializeOwned>(obj: DynamicObject) -> Result<T> {
        Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
    }

    let new = req
        .object
        .ok_or_else(|| anyhow!("admission request missing 'object'"))?;
    let old = req.old_object.map(typed).transpose()?;
    Ok((old, typed(new)?))
}

#[async_trait::async_trait]
impl Validate<GefyraClient> for Admission {
    async fn validate(
        self,
        _ns: &str,
        operation: &Operation,
        old: Option<&GefyraClient>,
        new: &GefyraClient,
    ) -> Result<()> {
        validation::client(operation, old, new)?;

        let provider = self
            .providers
            .connections
            .build(&new.spec.provider, &())?;
        if validation::parameters_set(old, new) {
            provider
                .validate(&new.name_any(), &new.spec.provider_parameter)
                .await?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Validate<GefyraBridgeMount> for Admission {
    async fn validate(
        self,
        ns: &str,
        operation: &Operation,
        old: Option<&GefyraBridgeMount>,
        new: &GefyraBridgeMount,
    ) -> Result<()> {
        ensure!(
            self.providers.mounts.contains(&new.spec.provider),
            "unknown bridge mount provider '{}'",
            new.spec.provider
        );

        let existing = match operation {
            Operation::Create => {
                self.api::<GefyraBridgeMount>(ns)
                    .list(&ListParams::default())
                    .await?
                    .items
            }
            _ => Vec::new(),
        };
        validation::mount(operation, old, new, &existing)
    }
}

#[async_trait::async_trait]
impl Validate<GefyraBridge> for Admission {
    async fn validate(
        self,
        ns: &str,
        operation: &Operation,
        old: Option<&GefyraBridge>,
        new: &GefyraBridge,
    ) -> Result<()> {
        let spec = &new.spec;
        ensure!(
            self.providers.connections.contains(&spec.connection_provider),
            "unknown connection provider '{}'",
            spec.connection_provider
        );
        ensure!(
            self.providers.bridges.contains(&spec.provider),
            "unknown bridge provider '{}'",
            spec.provider
        );

        let mount = self
            .api::<GefyraBridgeMount>(ns)
            .get_opt(&spec.target)
            .await?;
        let bridges = match operation {
            Operation::Create => {
                let selector = format!("{}={}", labels::BRIDGE_MOUNT, spec.target);
                self.api::<GefyraBridge>(ns)
                    .list(&ListParams::default().labels(&selector))
                    .await?
                    .items
            }
            _ => Vec::new(),
        };
        validation::bridge(operation, old, new, mount.as_ref(), &bridges)?;

        if let Some(mount) = &mount {
            let target = MountTarget::from_resource(mount)?;
            self.providers
                .bridges
                .build(&spec.provider, &target)?
                .validate(&spec.provider_parameter.rules)?;
        }
        Ok(())
    }
}
