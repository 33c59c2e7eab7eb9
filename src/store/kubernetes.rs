//! Kubernetes-backed store

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::{ListParams, PostParams};
use kube::core::ObjectMeta;
use kube::{Api, Client, Resource, ResourceExt};
use tracing::{debug, error};

use super::{AccountStore, not_found};
use crate::config::OperatorConfig;
use crate::controller::error::{Error, Result};
use crate::crd::{Account, AccountClaim};

/// Field manager recorded on objects written by the operator
pub const FIELD_MANAGER: &str = "aws-account-operator";

/// Store implementation on top of the Kubernetes API
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    config_namespace: String,
    config_name: String,
}

impl KubeStore {
    pub fn new(client: Client, config_namespace: &str, config_name: &str) -> Self {
        Self {
            client,
            config_namespace: config_namespace.to_string(),
            config_name: config_name.to_string(),
        }
    }

    fn accounts(&self, namespace: &str) -> Api<Account> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn claims(&self, namespace: &str) -> Api<AccountClaim> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn secrets(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

/// Map API status codes onto the store's error vocabulary
fn map_api_error(err: kube::Error, what: String) -> Error {
    match &err {
        kube::Error::Api(resp) if resp.code == 409 => Error::Conflict(what),
        kube::Error::Api(resp) if resp.code == 404 => Error::NotFound(what),
        _ => Error::KubeError(err),
    }
}

fn object_key<K: Resource>(obj: &K) -> Result<(String, String)> {
    let name = obj
        .meta()
        .name
        .clone()
        .ok_or(Error::MissingObjectKey(".metadata.name"))?;
    let namespace = obj
        .meta()
        .namespace
        .clone()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    Ok((namespace, name))
}

#[async_trait]
impl AccountStore for KubeStore {
    async fn get_account(&self, namespace: &str, name: &str) -> Result<Account> {
        self.accounts(namespace)
            .get(name)
            .await
            .map_err(|e| map_api_error(e, format!("account {}/{}", namespace, name)))
    }

    async fn update_account(&self, account: &Account) -> Result<Account> {
        let (namespace, name) = object_key(account)?;
        debug!("Replacing account {}/{}", namespace, name);
        self.accounts(&namespace)
            .replace(&name, &post_params(), account)
            .await
            .map_err(|e| map_api_error(e, format!("account {}/{}", namespace, name)))
    }

    async fn update_account_status(&self, account: &Account) -> Result<Account> {
        let (namespace, name) = object_key(account)?;
        let data = serde_json::to_vec(account)?;
        self.accounts(&namespace)
            .replace_status(&name, &post_params(), data)
            .await
            .map_err(|e| map_api_error(e, format!("account status {}/{}", namespace, name)))
    }

    async fn list_accounts(&self, namespace: &str) -> Result<Vec<Account>> {
        let list = self.accounts(namespace).list(&ListParams::default()).await?;
        Ok(list.items)
    }

    async fn get_claim(&self, namespace: &str, name: &str) -> Result<AccountClaim> {
        self.claims(namespace)
            .get(name)
            .await
            .map_err(|e| map_api_error(e, format!("accountclaim {}/{}", namespace, name)))
    }

    async fn update_claim_status(&self, claim: &AccountClaim) -> Result<AccountClaim> {
        let (namespace, name) = object_key(claim)?;
        let data = serde_json::to_vec(claim)?;
        self.claims(&namespace)
            .replace_status(&name, &post_params(), data)
            .await
            .map_err(|e| map_api_error(e, format!("accountclaim status {}/{}", namespace, name)))
    }

    async fn secret_exists(&self, namespace: &str, name: &str) -> Result<bool> {
        Ok(self.secrets(namespace).get_opt(name).await?.is_some())
    }

    async fn create_secret(
        &self,
        owner: &Account,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<()> {
        let namespace = owner
            .namespace()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
        let owner_ref = owner
            .controller_owner_ref(&())
            .ok_or(Error::MissingObjectKey(".metadata.uid"))?;

        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.clone()),
                owner_references: Some(vec![owner_ref]),
                ..Default::default()
            },
            type_: Some("Opaque".to_string()),
            string_data: Some(data),
            ..Default::default()
        };

        match self.secrets(&namespace).create(&post_params(), &secret).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 409 => {
                debug!("Secret {}/{} already exists", namespace, name);
                Ok(())
            }
            Err(e) => {
                error!("Failed to create secret {}/{}: {}", namespace, name, e);
                Err(e.into())
            }
        }
    }

    async fn operator_config(&self) -> Result<OperatorConfig> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.config_namespace);
        let cm = api.get_opt(&self.config_name).await?.ok_or_else(|| {
            not_found("configmap", &self.config_namespace, &self.config_name)
        })?;
        Ok(OperatorConfig::from_data(&cm.data.unwrap_or_default()))
    }
}
