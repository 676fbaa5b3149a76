use crate::core::{Persist, Result};
use chrono::{DateTime, Utc};
use gefyra_operator_k8s_api::{format_timestamp, Api, Patch, PatchParams};
use kube::Resource;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::fmt::Debug;

/// Writes state changes of a custom resource through the API server.
///
/// State and provider output go to the status subresource; the spec is
/// patched only when a machine clears user input it consumed.
pub struct KubePersist<K> {
    api: Api<K>,
    name: String,
}

impl<K> KubePersist<K> {
    pub fn new(api: Api<K>, name: impl Into<String>) -> Self {
        Self {
            api,
            name: name.into(),
        }
    }
}

/// The status patch recording that `state` was entered at `at`.
pub(crate) fn state_patch(state: &str, at: DateTime<Utc>) -> serde_json::Value {
    json!({
        "status": {
            "state": state,
            "stateTransitions": { state: format_timestamp(at) },
        }
    })
}

#[async_trait::async_trait]
impl<K> Persist for KubePersist<K>
where
    K: Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
{
    async fn record_state(&self, state: &'static str, at: DateTime<Utc>) -> Result<()> {
        let patch = state_patch(state, at);
        self.api
            .patch_status(&self.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        tracing::info!(kind = %K::kind(&()), name = %self.name, %state, "State changed");
        Ok(())
    }

    async fn patch_status(&self, patch: serde_json::Value) -> Result<()> {
        let patch = json!({ "status": patch });
        self.api
            .patch_status(&self.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_spec(&self, patch: serde_json::Value) -> Result<()> {
        let patch = json!({ "spec": patch });
        self.api
            .patch(&self.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}
