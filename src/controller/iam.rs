//! IAM principals owned by the operator inside managed accounts
//!
//! Every principal created here is tagged with the owning Account's name and
//! namespace. Cleanup only ever touches principals carrying both tags.

use std::collections::BTreeMap;

use kube::ResourceExt;
use rand::Rng;
use rand::distr::Alphanumeric;
use tracing::{debug, error, info, warn};

use crate::cloud::{
    AssumedRole, CloudClient, DEFAULT_REGION, IamUser, RetryPolicy, codes, collect_pages,
    retry_cloud_call,
};
use crate::config::OperatorConfig;
use crate::controller::context::Context;
use crate::controller::error::{Error, Result};
use crate::controller::status::{
    UpdateConditionMode, condition_status, condition_types, set_condition,
};
use crate::crd::{Account, ClaimState, ORGANIZATION_ACCESS_ROLE};
use crate::store::AccountStore;

pub const ADMIN_ACCESS_POLICY_ARN: &str = "arn:aws:iam::aws:policy/AdministratorAccess";

/// Prefix of the admin IAM user created in pooled accounts
pub const ADMIN_USER_PREFIX: &str = "osdManagedAdmin";

/// Ownership tag keys
pub mod tag_keys {
    pub const ACCOUNT_NAME: &str = "clusterAccountName";
    pub const NAMESPACE: &str = "clusterNamespace";
    pub const CLAIM_LINK: &str = "clusterClaimLink";
    pub const CLAIM_LINK_NAMESPACE: &str = "clusterClaimLinkNamespace";

    pub const ALL: [&str; 4] = [ACCOUNT_NAME, NAMESPACE, CLAIM_LINK, CLAIM_LINK_NAMESPACE];
}

/// Random lowercase id shared by the admin user and the support role
pub fn generate_short_id() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}

/// Tags identifying the Account that owns a cloud resource
pub fn ownership_tags(account: &Account) -> BTreeMap<String, String> {
    BTreeMap::from([
        (tag_keys::ACCOUNT_NAME.to_string(), account.name_any()),
        (
            tag_keys::NAMESPACE.to_string(),
            account.namespace().unwrap_or_default(),
        ),
        (
            tag_keys::CLAIM_LINK.to_string(),
            account.spec.claim_link.clone(),
        ),
        (
            tag_keys::CLAIM_LINK_NAMESPACE.to_string(),
            account.spec.claim_link_namespace.clone(),
        ),
    ])
}

/// Tags for resources the operator creates inside the account
///
/// Managed tags come first, then the claim's custom tags. Ownership keys
/// always keep their own value.
pub fn resource_tags(
    account: &Account,
    managed: &BTreeMap<String, String>,
    custom: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut tags = managed.clone();
    tags.extend(custom.iter().map(|(k, v)| (k.clone(), v.clone())));
    tags.extend(ownership_tags(account));
    tags
}

/// Custom tags of the claim bound to the account, empty if there is none
pub async fn claim_custom_tags(store: &dyn AccountStore, account: &Account) -> BTreeMap<String, String> {
    if account.spec.claim_link.is_empty() {
        return BTreeMap::new();
    }
    match store
        .get_claim(&account.spec.claim_link_namespace, &account.spec.claim_link)
        .await
    {
        Ok(claim) => claim.custom_tags(),
        Err(e) => {
            if account.is_byoc() {
                error!("Error getting AccountClaim to get custom tags: {}", e);
            }
            BTreeMap::new()
        }
    }
}

fn owned_by(tags: &BTreeMap<String, String>, account: &Account) -> bool {
    tags.get(tag_keys::ACCOUNT_NAME) == Some(&account.name_any())
        && tags.get(tag_keys::NAMESPACE) == account.namespace().as_ref()
}

pub fn admin_user_name(id: &str) -> String {
    format!("{}-{}", ADMIN_USER_PREFIX, id)
}

/// Name of the secret holding the admin user's credentials
pub fn iam_user_secret_name(account_name: &str) -> String {
    format!("{}-secret", account_name).to_lowercase()
}

/// Trust policy letting `principals` assume a role
pub fn trust_policy(principals: &[String]) -> String {
    serde_json::json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Principal": { "AWS": principals },
            "Action": "sts:AssumeRole",
        }],
    })
    .to_string()
}

/// Condition type and reason recorded when IAM setup fails
pub fn iam_failure(err: &Error) -> (&'static str, &'static str) {
    match err.cloud_code() {
        Some(codes::INVALID_CLIENT_TOKEN_ID) => {
            ("InvalidClientTokenId", condition_types::AUTHENTICATION_ERROR)
        }
        Some(codes::ACCESS_DENIED) => ("AccessDenied", condition_types::AUTHORIZATION_ERROR),
        Some(_) => ("ClientError", condition_types::CLIENT_ERROR),
        None => ("UnhandledError", condition_types::UNHANDLED_ERROR),
    }
}

/// Make sure the support role exists with exactly the admin policy attached
///
/// `setup` supplies the operator's own identity for the trust policy; the
/// role is created through `client`. Returns the role id.
pub async fn ensure_support_role(
    setup: &dyn CloudClient,
    client: &dyn CloudClient,
    role_name: &str,
    sre_access_arn: Option<&str>,
    tags: &BTreeMap<String, String>,
) -> Result<String> {
    info!("Creating support role {}", role_name);
    let policy = RetryPolicy::iam();

    let caller = retry_cloud_call(&policy, "caller_arn", || setup.caller_arn()).await?;
    let sre_access_arn = sre_access_arn.ok_or_else(|| {
        Error::InvalidConfig(format!("missing '{}' in ConfigMap", crate::config::SRE_ACCESS_ARN))
    })?;
    let principals = vec![caller, sre_access_arn.to_string()];

    let mut role_id = None;
    let mut role_is_valid = false;
    if let Some(existing) = retry_cloud_call(&policy, "get_role", || client.get_role(role_name)).await? {
        info!("Found pre-existing role {}, verifying policies", role_name);
        role_id = Some(existing.id);
        let attached = retry_cloud_call(&policy, "list_attached_role_policies", || {
            client.list_attached_role_policies(role_name)
        })
        .await?;
        for policy_arn in attached {
            if policy_arn == ADMIN_ACCESS_POLICY_ARN {
                role_is_valid = true;
            } else {
                info!("Detaching undesired policy {} from {}", policy_arn, role_name);
                retry_cloud_call(&policy, "detach_role_policy", || {
                    client.detach_role_policy(role_name, &policy_arn)
                })
                .await?;
            }
        }
    }

    if let (Some(id), true) = (&role_id, role_is_valid) {
        return Ok(id.clone());
    }

    let role_id = match role_id {
        Some(id) => id,
        None => {
            let document = trust_policy(&principals);
            let created = retry_cloud_call(&policy, "create_role", || {
                client.create_role(role_name, &document, tags)
            })
            .await?;
            info!("Created role {} ({})", role_name, created.id);
            created.id
        }
    };

    retry_cloud_call(&policy, "attach_role_policy", || {
        client.attach_role_policy(role_name, ADMIN_ACCESS_POLICY_ARN)
    })
    .await?;
    Ok(role_id)
}

/// Enter the account and make sure the support role exists
///
/// Pooled accounts are entered through the organization role and the
/// support role is created from inside. Customer accounts have the role
/// created with their own credentials, then it is assumed.
pub async fn setup_admin_access(
    ctx: &Context,
    account: &Account,
    setup: &dyn CloudClient,
    config: &OperatorConfig,
    tags: &BTreeMap<String, String>,
) -> Result<AssumedRole> {
    let role_name = account.support_role_name();
    let account_id = &account.spec.aws_account_id;

    if account.is_byoc() {
        let claim = ctx
            .store
            .get_claim(&account.spec.claim_link_namespace, &account.spec.claim_link)
            .await?;
        let secret = claim.spec.byoc_secret_ref.as_ref().ok_or_else(|| {
            Error::InvalidClaim(format!("claim {} has no byocSecretRef", claim.name_any()))
        })?;
        let customer = ctx.cloud.customer_client(secret, DEFAULT_REGION).await?;

        let role_id = ensure_support_role(
            setup,
            customer.as_ref(),
            &role_name,
            config.sre_access_arn.as_deref(),
            tags,
        )
        .await?;
        debug!("Support role {} has id {}", role_name, role_id);

        Ok(ctx
            .role_assumer
            .assume_role(setup, account_id, &role_name, DEFAULT_REGION)
            .await?)
    } else {
        let assumed = ctx
            .role_assumer
            .assume_role(setup, account_id, ORGANIZATION_ACCESS_ROLE, DEFAULT_REGION)
            .await?;

        ensure_support_role(
            setup,
            assumed.client.as_ref(),
            &role_name,
            config.sre_access_arn.as_deref(),
            tags,
        )
        .await?;
        Ok(assumed)
    }
}

/// Assume the support role of a manual-STS account
///
/// The claim must still exist; if it cannot be read it is flagged.
pub async fn assume_sts_support_role(
    ctx: &Context,
    account: &Account,
    setup: &dyn CloudClient,
) -> Result<AssumedRole> {
    let store = ctx.store.as_ref();
    if let Err(e) = store
        .get_claim(&account.spec.claim_link_namespace, &account.spec.claim_link)
        .await
    {
        error!("Failed to get AccountClaim for Account {}: {}", account.name_any(), e);
        flag_claim_unreadable(store, account).await;
        return Err(e);
    }

    Ok(ctx
        .role_assumer
        .assume_role(
            setup,
            &account.spec.aws_account_id,
            &account.support_role_name(),
            DEFAULT_REGION,
        )
        .await?)
}

async fn flag_claim_unreadable(store: &dyn AccountStore, account: &Account) {
    let Ok(mut claim) = store
        .get_claim(&account.spec.claim_link_namespace, &account.spec.claim_link)
        .await
    else {
        return;
    };
    let status = claim.status.get_or_insert_with(Default::default);
    set_condition(
        &mut status.conditions,
        "ClientError",
        condition_status::TRUE,
        "FailedRetrievingAccountClaim",
        "Failed to get AccountClaim for Account",
        UpdateConditionMode::Never,
    );
    status.state = Some(ClaimState::Error);
    if let Err(e) = store.update_claim_status(&claim).await {
        error!("Failed to update accountclaim status: {}", e);
    }
}

/// Make sure the admin user exists with credentials stored in a secret
///
/// Returns the secret name.
pub async fn build_iam_user(
    store: &dyn AccountStore,
    client: &dyn CloudClient,
    account: &Account,
    user_name: &str,
    tags: &BTreeMap<String, String>,
) -> Result<String> {
    let policy = RetryPolicy::iam();

    let user: IamUser = match retry_cloud_call(&policy, "get_user", || client.get_user(user_name))
        .await?
    {
        Some(user) => user,
        None => {
            info!("Creating IAM user {}", user_name);
            retry_cloud_call(&policy, "create_user", || client.create_user(user_name, tags))
                .await?
        }
    };

    info!("Attaching admin policy to IAM user {}", user.name);
    retry_cloud_call(&policy, "attach_user_policy", || {
        client.attach_user_policy(&user.name, ADMIN_ACCESS_POLICY_ARN)
    })
    .await?;

    let namespace = account
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let secret_name = iam_user_secret_name(&account.name_any());

    if !store.secret_exists(&namespace, &secret_name).await? {
        // The secret is the only copy of a key, so start from no keys
        delete_all_access_keys(client, &user.name).await?;
        let key = retry_cloud_call(&policy, "create_access_key", || {
            client.create_access_key(&user.name)
        })
        .await?;

        let data = BTreeMap::from([
            ("aws_user_name".to_string(), user.name.clone()),
            ("aws_access_key_id".to_string(), key.id),
            ("aws_secret_access_key".to_string(), key.secret),
        ]);
        store.create_secret(account, &secret_name, data).await?;
    }

    Ok(secret_name)
}

async fn delete_all_access_keys(client: &dyn CloudClient, user: &str) -> Result<()> {
    let policy = RetryPolicy::iam();
    let keys = retry_cloud_call(&policy, "list_access_keys", || client.list_access_keys(user)).await?;
    for key in keys {
        debug!("Deleting access key {} of {}", key, user);
        retry_cloud_call(&policy, "delete_access_key", || {
            client.delete_access_key(user, &key)
        })
        .await?;
    }
    Ok(())
}

/// Delete every IAM user and role the account owns, users first
pub async fn cleanup_iam(client: &dyn CloudClient, account: &Account) -> Result<()> {
    delete_iam_users(client, account).await?;
    delete_iam_roles(client, account).await?;
    Ok(())
}

async fn delete_iam_users(client: &dyn CloudClient, account: &Account) -> Result<()> {
    info!("Cleaning up IAM users");
    let policy = RetryPolicy::iam();
    let names = collect_pages(|marker| {
        let policy = &policy;
        async move { retry_cloud_call(policy, "list_users", || client.list_users(marker.clone())).await }
    })
    .await?;

    for name in names {
        let Some(user) = retry_cloud_call(&policy, "get_user", || client.get_user(&name)).await?
        else {
            continue;
        };
        if !owned_by(&user.tags, account) {
            continue;
        }

        let attached = retry_cloud_call(&policy, "list_attached_user_policies", || {
            client.list_attached_user_policies(&user.name)
        })
        .await?;
        for policy_arn in attached {
            retry_cloud_call(&policy, "detach_user_policy", || {
                client.detach_user_policy(&user.name, &policy_arn)
            })
            .await?;
        }
        delete_all_access_keys(client, &user.name).await?;
        retry_cloud_call(&policy, "delete_user", || client.delete_user(&user.name)).await?;
        info!("Deleted IAM user {}", user.name);
    }
    Ok(())
}

async fn delete_iam_roles(client: &dyn CloudClient, account: &Account) -> Result<()> {
    info!("Cleaning up IAM roles");
    let policy = RetryPolicy::iam();
    let names = collect_pages(|marker| {
        let policy = &policy;
        async move { retry_cloud_call(policy, "list_roles", || client.list_roles(marker.clone())).await }
    })
    .await?;

    for name in names {
        let role = match retry_cloud_call(&policy, "get_role", || client.get_role(&name)).await {
            Ok(Some(role)) => role,
            Ok(None) => continue,
            Err(e) if e.is(codes::NO_SUCH_ENTITY) => continue,
            Err(e) => return Err(e.into()),
        };
        if !owned_by(&role.tags, account) {
            continue;
        }

        let attached = retry_cloud_call(&policy, "list_attached_role_policies", || {
            client.list_attached_role_policies(&role.name)
        })
        .await?;
        for policy_arn in attached {
            retry_cloud_call(&policy, "detach_role_policy", || {
                client.detach_role_policy(&role.name, &policy_arn)
            })
            .await?;
        }
        match retry_cloud_call(&policy, "delete_role", || client.delete_role(&role.name)).await {
            Ok(()) => info!("Deleted IAM role {}", role.name),
            Err(e) => warn!("Failed to delete IAM role {}: {}", role.name, e),
        }
    }
    Ok(())
}
