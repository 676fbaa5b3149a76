use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, PostParams},
    Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Debug;

/// The field manager of everything the operator applies.
pub const FIELD_MANAGER: &str = "gefyra.dev/operator";

/// Creates `obj`; when it exists already, takes over its fields instead.
pub async fn create_or_apply<K>(api: &Api<K>, obj: &K) -> Result<K, kube::Error>
where
    K: Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned + Serialize,
{
    let name = obj.name_any();
    match api.create(&PostParams::default(), obj).await {
        Ok(created) => {
            tracing::info!(kind = %K::kind(&()), %name, "Created");
            Ok(created)
        }
        Err(kube::Error::Api(rsp)) if rsp.code == 409 => {
            tracing::debug!(kind = %K::kind(&()), %name, "Exists, applying");
            let params = PatchParams::apply(FIELD_MANAGER).force();
            api.patch(&name, &params, &Patch::Apply(obj)).await
        }
        Err(error) => Err(error),
    }
}

/// Creates `obj` unless it exists. Returns whether it was created.
pub async fn create_if_missing<K>(api: &Api<K>, obj: &K) -> Result<bool, kube::Error>
where
    K: Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned + Serialize,
{
    match api.create(&PostParams::default(), obj).await {
        Ok(_) => {
            tracing::info!(kind = %K::kind(&()), name = %obj.name_any(), "Created");
            Ok(true)
        }
        Err(kube::Error::Api(rsp)) if rsp.code == 409 => Ok(false),
        Err(error) => Err(error),
    }
}

/// Deletes the named object. Returns false when it did not exist.
pub async fn delete<K>(api: &Api<K>, name: &str) -> Result<bool, kube::Error>
where
    K: Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => {
            tracing::info!(kind = %K::kind(&()), %name, "Deleted");
            Ok(true)
        }
        Err(kube::Error::Api(rsp)) if rsp.code == 404 => Ok(false),
        Err(error) => Err(error),
    }
}

pub fn is_status(error: &kube::Error, code: u16) -> bool {
    matches!(error, kube::Error::Api(rsp) if rsp.code == code)
}
