//! Original container settings saved before a carrier image replaces them.

use gefyra_operator_core::Result;
use gefyra_operator_k8s_api::{
    objects, Api, ConfigMap, Container, ObjectMeta, Patch, PatchParams, Pod, ResourceExt,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub original_config: OriginalConfig,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct OriginalConfig {
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
}

/// Snapshots are keyed by the namespace and name of the pod.
pub fn key(namespace: &str, pod: &str) -> String {
    format!("{namespace}-{pod}")
}

/// The keys of the snapshots taken of `pods`.
pub fn keys_of(namespace: &str, pods: &[Pod]) -> Vec<String> {
    pods.iter().map(|p| key(namespace, &p.name_any())).collect()
}

// === impl Snapshot ===

impl Snapshot {
    pub fn of(container: &Container) -> Self {
        Self {
            original_config: OriginalConfig {
                image: container.image.clone().unwrap_or_default(),
                command: container.command.clone(),
                args: container.args.clone(),
            },
        }
    }

    /// A strategic merge patch putting the original settings back into the
    /// named container of a pod.
    pub fn restore_patch(&self, container: &str) -> serde_json::Value {
        let original = &self.original_config;
        let mut c = json!({ "name": container, "image": original.image });
        if let Some(command) = original.command.as_ref() {
            c["command"] = json!(command);
        }
        if let Some(args) = original.args.as_ref() {
            c["args"] = json!(args);
        }
        json!({ "spec": { "containers": [c] } })
    }
}

fn stored(cm: &ConfigMap, key: &str) -> bool {
    cm.data.as_ref().map_or(false, |d| d.contains_key(key))
}

/// Stores `snapshot` under `key` in the named ConfigMap, creating it when
/// missing. A snapshot already stored under `key` is never replaced.
///
/// Returns whether `snapshot` was stored.
pub async fn save(api: &Api<ConfigMap>, name: &str, key: &str, snapshot: &Snapshot) -> Result<bool> {
    let existing = api.get_opt(name).await?;
    if existing.as_ref().map_or(false, |cm| stored(cm, key)) {
        return Ok(false);
    }
    let value = serde_json::to_string(snapshot)?;
    let patch = json!({ "data": { key: value } });
    match api
        .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => Ok(true),
        Err(error) if objects::is_status(&error, 404) => {
            let cm = ConfigMap {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    ..Default::default()
                },
                data: Some(BTreeMap::from([(key.to_string(), value)])),
                ..Default::default()
            };
            objects::create_or_apply(api, &cm).await?;
            Ok(true)
        }
        Err(error) => Err(error.into()),
    }
}

pub async fn load(api: &Api<ConfigMap>, name: &str, key: &str) -> Result<Option<Snapshot>> {
    let Some(cm) = api.get_opt(name).await? else {
        return Ok(None);
    };
    match cm.data.as_ref().and_then(|d| d.get(key)) {
        Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
        None => Ok(None),
    }
}

/// Drops the snapshot stored under `key`.
pub async fn forget(api: &Api<ConfigMap>, name: &str, key: &str) -> Result<()> {
    forget_all(api, name, &[key.to_string()]).await
}

fn forget_patch(keys: &[String]) -> serde_json::Value {
    let data = keys
        .iter()
        .map(|k| (k.clone(), serde_json::Value::Null))
        .collect::<serde_json::Map<_, _>>();
    json!({ "data": data })
}

/// Drops the snapshots stored under `keys`.
pub async fn forget_all(api: &Api<ConfigMap>, name: &str, keys: &[String]) -> Result<()> {
    if keys.is_empty() {
        return Ok(());
    }
    let patch = forget_patch(keys);
    match api
        .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => Ok(()),
        Err(error) if objects::is_status(&error, 404) => Ok(()),
        Err(error) => Err(error.into()),
    }
}
