//! Cluster identities handed to clients.

use crate::core::{self, Credentials, Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use gefyra_operator_k8s_api::{objects, Api, Client, ObjectMeta, Secret, ServiceAccount};
use k8s_openapi::{
    api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject},
    ByteString,
};
use std::{collections::BTreeMap, time::Duration};
use tracing::info;

/// The role every client account is bound to.
pub const ROLE: &str = "gefyra-client";

const TOKEN_TYPE: &str = "kubernetes.io/service-account-token";
const SERVICE_ACCOUNT_NAME: &str = "kubernetes.io/service-account.name";

/// Provisions a service account per client, allowed to manage clients.
#[derive(Clone)]
pub struct KubeCredentials {
    client: Client,
    namespace: String,
}

pub fn account_name(client: &str) -> String {
    format!("gefyra-client-{client}")
}

fn token_secret_name(account: &str) -> String {
    format!("{account}-token")
}

fn binding_name(account: &str) -> String {
    format!("gefyra-client-{account}")
}

/// Encodes secret data the way it appears in the Secret's manifest.
fn encode(data: &BTreeMap<String, ByteString>) -> BTreeMap<String, String> {
    data.iter()
        .map(|(k, ByteString(v))| (k.clone(), STANDARD.encode(v)))
        .collect()
}

impl KubeCredentials {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn api<K>(&self) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn meta(&self, name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(self.namespace.clone()),
            ..Default::default()
        }
    }

    fn role(&self) -> Role {
        Role {
            metadata: self.meta(ROLE),
            rules: Some(vec![PolicyRule {
                api_groups: Some(vec![gefyra_operator_k8s_api::GROUP.to_string()]),
                resources: Some(vec!["gefyraclients".to_string()]),
                verbs: vec!["*".to_string()],
                ..Default::default()
            }]),
        }
    }

    fn binding(&self, account: &str) -> RoleBinding {
        RoleBinding {
            metadata: self.meta(&binding_name(account)),
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "Role".to_string(),
                name: ROLE.to_string(),
            },
            subjects: Some(vec![Subject {
                kind: "ServiceAccount".to_string(),
                name: account.to_string(),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            }]),
        }
    }

    fn token_secret(&self, account: &str) -> Secret {
        let mut metadata = self.meta(&token_secret_name(account));
        metadata.annotations = Some(BTreeMap::from([(
            SERVICE_ACCOUNT_NAME.to_string(),
            account.to_string(),
        )]));
        Secret {
            metadata,
            type_: Some(TOKEN_TYPE.to_string()),
            ..Default::default()
        }
    }
}

#[async_trait::async_trait]
impl Credentials for KubeCredentials {
    async fn provision(&self, client: &str) -> Result<core::ServiceAccount> {
        let account = account_name(client);
        objects::create_if_missing(&self.api::<Role>(), &self.role()).await?;
        if objects::create_if_missing(
            &self.api::<ServiceAccount>(),
            &ServiceAccount {
                metadata: self.meta(&account),
                ..Default::default()
            },
        )
        .await?
        {
            info!(%client, %account, "Created service account");
        }
        objects::create_if_missing(&self.api::<RoleBinding>(), &self.binding(&account)).await?;

        let secrets = self.api::<Secret>();
        objects::create_if_missing(&secrets, &self.token_secret(&account)).await?;
        let data = secrets
            .get(&token_secret_name(&account))
            .await?
            .data
            .filter(|d| d.contains_key("token"))
            .ok_or_else(|| {
                Error::temporary_after(
                    format!("token of service account {account} not yet generated"),
                    Duration::from_secs(1),
                )
            })?;
        Ok(core::ServiceAccount {
            name: account,
            data: encode(&data),
        })
    }

    async fn revoke(&self, client: &str) -> Result<()> {
        let account = account_name(client);
        objects::delete(&self.api::<Secret>(), &token_secret_name(&account)).await?;
        objects::delete(&self.api::<RoleBinding>(), &binding_name(&account)).await?;
        if objects::delete(&self.api::<ServiceAccount>(), &account).await? {
            info!(%client, %account, "Deleted service account");
        }
        Ok(())
    }
}
