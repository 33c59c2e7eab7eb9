//! Provisioning of new accounts
//!
//! Pooled accounts are created through the organization API; customer
//! accounts are initialized from the claim that brought them.

use std::collections::BTreeMap;
use std::time::Duration;

use kube::ResourceExt;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::cloud::{
    CloudClient, CloudError, CreateAccountState, RetryPolicy, codes, retry_cloud_call,
};
use crate::config::OperatorConfig;
use crate::controller::context::Context;
use crate::controller::error::{AccountCreationError, Error, Result};
use crate::controller::state_machine::{AccountEvent, StateName, TransitionContext};
use crate::controller::status::{condition_types, set_account_status};
use crate::crd::{Account, AccountClaim, AccountState};
use crate::store::AccountStore;

/// Wait between creation status polls
const CREATE_STATUS_POLL: Duration = Duration::from_secs(5);

/// Mailbox used for a new account: `osd-creds-mgmt-abc123` becomes
/// `osd-creds-mgmt+abc123@redhat.com`
pub fn account_email(name: &str) -> String {
    match name.rsplit_once('-') {
        Some((prefix, last)) => format!("{}+{}@redhat.com", prefix, last),
        None => format!("{}+{}@redhat.com", name, name),
    }
}

/// Category of a rejected CreateAccount call
pub fn map_create_error(err: &CloudError) -> AccountCreationError {
    match err.code.as_str() {
        codes::CONCURRENT_MODIFICATION => AccountCreationError::ConcurrentModification,
        codes::CONSTRAINT_VIOLATION => AccountCreationError::AccountLimitExceeded,
        codes::SERVICE_EXCEPTION => AccountCreationError::InternalFailure,
        codes::TOO_MANY_REQUESTS => AccountCreationError::TooManyRequests,
        _ => AccountCreationError::FailedCreateAccount,
    }
}

/// Category of a creation request that finished as FAILED
pub fn map_failure_reason(reason: Option<&str>) -> AccountCreationError {
    match reason {
        Some("ACCOUNT_LIMIT_EXCEEDED") => AccountCreationError::AccountLimitExceeded,
        Some("INTERNAL_FAILURE") => AccountCreationError::InternalFailure,
        _ => AccountCreationError::FailedCreateAccount,
    }
}

/// Create an account and wait for the request to settle
pub async fn create_account(
    client: &dyn CloudClient,
    name: &str,
    email: &str,
    budget: Duration,
) -> Result<String, AccountCreationError> {
    let request_id = retry_cloud_call(&RetryPolicy::organizations(), "create_account", || {
        client.create_account(name, email)
    })
    .await
    .map_err(|e| {
        let category = map_create_error(&e);
        error!("Error creating account {}: {} ({})", name, e, category);
        category
    })?;

    let deadline = Instant::now() + budget;
    loop {
        let status = retry_cloud_call(
            &RetryPolicy::organizations(),
            "describe_create_account_status",
            || client.describe_create_account_status(&request_id),
        )
        .await
        .map_err(|e| {
            error!("Error describing account creation {}: {}", request_id, e);
            AccountCreationError::InternalFailure
        })?;

        match status.state {
            CreateAccountState::Failed => {
                return Err(map_failure_reason(status.failure_reason.as_deref()));
            }
            CreateAccountState::Succeeded => {
                return status
                    .account_id
                    .filter(|id| !id.is_empty())
                    .ok_or(AccountCreationError::FailedCreateAccount);
            }
            CreateAccountState::InProgress => {
                if Instant::now() >= deadline {
                    warn!("Account creation {} still in progress after {:?}", request_id, budget);
                    return Err(AccountCreationError::FailedCreateAccount);
                }
                debug!("Account creation {} in progress", request_id);
                tokio::time::sleep(CREATE_STATUS_POLL).await;
            }
        }
    }
}

/// Whether the fleet is still under the configured account limit
pub async fn accounts_can_be_created(
    store: &dyn AccountStore,
    namespace: &str,
    limit: Option<usize>,
) -> Result<bool> {
    let Some(limit) = limit else {
        return Ok(true);
    };
    let total = store.list_accounts(namespace).await?.len();
    debug!("{} accounts in {}, limit {}", total, namespace, limit);
    Ok(total < limit)
}

/// Tag a new account with its shard owner and compliance tags
pub async fn tag_account(
    client: &dyn CloudClient,
    account_id: &str,
    config: &OperatorConfig,
) -> Result<()> {
    let mut tags = BTreeMap::new();
    tags.insert("owner".to_string(), config.shard_name.clone());
    tags.extend(config.compliance_tags.clone());

    retry_cloud_call(&RetryPolicy::default(), "tag_account", || {
        client.tag_account(account_id, &tags)
    })
    .await?;
    Ok(())
}

/// Create the cloud account behind a pooled Account and move it to Creating
///
/// Only the generic creation failure touches the account; every other
/// category is returned with the account left as it was.
pub async fn assign_account_id(
    ctx: &Context,
    account: &mut Account,
    setup: &dyn CloudClient,
    config: &OperatorConfig,
) -> Result<()> {
    info!("Creating AWS account for {}", account.name_any());
    let email = account_email(&account.name_any());

    let account_id =
        match create_account(setup, &account.name_any(), &email, ctx.settings.wait_time).await {
            Ok(id) => id,
            Err(AccountCreationError::FailedCreateAccount) => {
                set_account_status(
                    account,
                    "Failed to create AWS Account",
                    condition_types::CREATION_FAILED,
                    AccountState::Failed,
                );
                *account = ctx.store.update_account_status(account).await?;
                error!("Failed to create AWS Account {}", account.name_any());
                return Err(AccountCreationError::FailedCreateAccount.into());
            }
            Err(e) => {
                error!("Failed to create AWS Account {}, account untouched: {}", account.name_any(), e);
                return Err(e.into());
            }
        };

    info!("AWS account {} created for {}", account_id, account.name_any());

    // Persist the id before anything else so a crash never provisions twice
    account.spec.aws_account_id = account_id.clone();
    *account = ctx.store.update_account(account).await?;

    if let Err(e) = tag_account(setup, &account_id, config).await {
        info!("Unable to tag aws account {}: {}", account_id, e);
    }

    mark_creating(ctx, account, "Creating", AccountEvent::Assigned).await
}

/// Move an account without state to Creating
pub async fn mark_creating(
    ctx: &Context,
    account: &mut Account,
    message: &str,
    event: AccountEvent,
) -> Result<()> {
    let tctx = TransitionContext::new(account.is_byoc());
    let Some(target) = ctx
        .state_machine
        .transition(account.state(), event, &tctx)
        .target()
    else {
        warn!(
            "Ignoring {} for account {} in state {}",
            event,
            account.name_any(),
            StateName(account.state())
        );
        return Ok(());
    };

    set_account_status(account, message, condition_types::CREATING, target);
    *account = ctx.store.update_account_status(account).await?;
    Ok(())
}

/// Check that a claim carries everything a customer account needs
pub fn validate_byoc_claim(claim: &AccountClaim) -> Result<()> {
    if claim.spec.byoc_aws_account_id.is_empty() {
        return Err(Error::InvalidClaim(format!(
            "claim {} has no byocAWSAccountID",
            claim.name_any()
        )));
    }
    match &claim.spec.byoc_secret_ref {
        Some(secret) if !secret.name.is_empty() && !secret.namespace.is_empty() => Ok(()),
        _ => Err(Error::InvalidClaim(format!(
            "claim {} has no byocSecretRef",
            claim.name_any()
        ))),
    }
}

/// Initialize a customer account from its claim and move it to Creating
pub async fn initialize_byoc_account(ctx: &Context, account: &mut Account) -> Result<()> {
    if !account.has_claim_link() {
        return Err(Error::InvalidClaim(format!(
            "account {} has no claim link",
            account.name_any()
        )));
    }

    let claim = ctx
        .store
        .get_claim(&account.spec.claim_link_namespace, &account.spec.claim_link)
        .await?;
    validate_byoc_claim(&claim)?;

    if account.spec.aws_account_id != claim.spec.byoc_aws_account_id {
        account.spec.aws_account_id = claim.spec.byoc_aws_account_id.clone();
        *account = ctx.store.update_account(account).await?;
    }

    account.status.get_or_insert_with(Default::default).claimed = true;
    mark_creating(ctx, account, "BYOC Account Creating", AccountEvent::ByocInitialized).await
}
