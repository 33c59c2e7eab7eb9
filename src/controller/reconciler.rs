//! Reconciliation logic for Account resources
//!
//! Each invocation moves an account at most one phase forward. Long
//! running work (region initialization) is detached and reports back
//! through a status write, which triggers the next invocation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use kube::ResourceExt;
use kube::runtime::controller::Action;
use tracing::{debug, error, info, instrument, warn};

use crate::cloud::{AssumedRole, CloudClient, DEFAULT_REGION, codes};
use crate::config::OperatorConfig;
use crate::controller::account_creation::{
    accounts_can_be_created, assign_account_id, initialize_byoc_account, mark_creating,
};
use crate::controller::context::Context;
use crate::controller::error::{BackoffConfig, Error, Result};
use crate::controller::finalizer::{add_finalizer, remove_finalizer};
use crate::controller::iam::{
    admin_user_name, assume_sts_support_role, build_iam_user, claim_custom_tags, cleanup_iam,
    generate_short_id, iam_failure, resource_tags, setup_admin_access,
};
use crate::controller::opt_in::handle_opt_in_regions;
use crate::controller::region_init::{handle_initializing_regions, start_region_init};
use crate::controller::service_quota::handle_pending_verification;
use crate::controller::state_machine::AccountEvent;
use crate::controller::status::{claim_account, condition_types, set_failed};
use crate::crd::{Account, IAM_USER_ID_LABEL, ORGANIZATION_ACCESS_ROLE};

/// Requeue after writing the iamUserId label
const LABEL_REQUEUE: Duration = Duration::from_secs(1);

/// Main reconciliation function
#[instrument(skip(account, ctx), fields(name = %account.name_any(), namespace = account.namespace().unwrap_or_default()))]
pub async fn reconcile(account: Arc<Account>, ctx: Arc<Context>) -> Result<Action> {
    let start = Instant::now();
    debug!("Reconciling Account");

    let mut account = (*account).clone();
    let result = reconcile_account(&mut account, &ctx).await;

    match &result {
        Ok(action) => {
            debug!("Reconciliation completed: {:?}", action);
            ctx.record_reconcile(start.elapsed().as_secs_f64());
        }
        Err(e) => {
            error!("Reconciliation failed: {}", e);
            ctx.record_error();
        }
    }
    result
}

/// Error policy for the controller with exponential backoff
pub fn error_policy(account: Arc<Account>, error: &Error, _ctx: Arc<Context>) -> Action {
    let name = account.name_any();
    let backoff = BackoffConfig::default();

    // The controller does not hand us a retry count; jitter spreads retries instead
    let delay = backoff.delay_for_error(error, 0);

    if error.is_retryable() {
        warn!(
            "Retryable error for {}: {:?}, requeuing in {:?}",
            name, error, delay
        );
    } else {
        error!(
            "Non-retryable error for {}: {:?}, requeuing in {:?} for manual intervention",
            name, error, delay
        );
    }

    Action::requeue(delay)
}

async fn reconcile_account(account: &mut Account, ctx: &Arc<Context>) -> Result<Action> {
    let namespace = account
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let config = ctx.store.operator_config().await?;
    let setup = ctx.cloud.setup_client(DEFAULT_REGION).await?;
    let settings = &ctx.settings;

    if !account.is_manual_sts() && !account.is_pending_deletion() {
        add_finalizer(
            ctx.store.as_ref(),
            account,
            settings.finalizer_retries,
            settings.finalizer_backoff,
        )
        .await?;
    }

    if account.is_pending_deletion() {
        return handle_deletion(ctx, account, setup.as_ref()).await;
    }

    if account.is_failed() {
        info!("Account {} is failed. Ignoring.", account.name_any());
        return Ok(Action::await_change());
    }

    if account.is_initializing_regions() {
        return handle_initializing_regions(ctx, account).await;
    }

    if account.is_new_byoc() {
        if let Err(e) = initialize_byoc_account(ctx, account).await {
            error!("Failed initializing new BYOC account: {}", e);
            set_failed(
                ctx.store.as_ref(),
                account,
                condition_types::CREATION_FAILED,
                &e.to_string(),
                "Failed to initialize new BYOC account",
            )
            .await?;
            return Err(e);
        }
    }

    if account.is_pending_verification() {
        return handle_pending_verification(ctx, account, setup.as_ref()).await;
    }

    if account.is_ready_unclaimed_and_has_claim_link() {
        claim_account(account);
        *account = ctx.store.update_account_status(account).await?;
        return Ok(Action::await_change());
    }

    if account.is_creating() && creating_longer_than(account, settings.create_pending_timeout) {
        let message = format!(
            "Creation pending for longer than {} minutes",
            settings.create_pending_timeout.as_secs() / 60
        );
        set_failed(
            ctx.store.as_ref(),
            account,
            condition_types::CREATION_FAILED,
            "CreationTimeout",
            &message,
        )
        .await;
    }

    if !account.is_byoc() && account.is_unclaimed_and_has_no_state() {
        if account.has_aws_account_id() {
            mark_creating(
                ctx,
                account,
                "AWS account already created",
                AccountEvent::Assigned,
            )
            .await?;
        } else {
            if !accounts_can_be_created(ctx.store.as_ref(), &namespace, config.account_limit)
                .await?
            {
                info!(
                    "AWS Account limit reached. This does not always indicate a problem, \
                     it's a limit enforced to prevent runaway account creation"
                );
                return Ok(Action::requeue(settings.account_limit_requeue));
            }
            assign_account_id(ctx, account, setup.as_ref(), &config).await?;
        }
    }

    if account.ready_for_region_enablement() && config.opt_in_active() {
        return handle_opt_in_regions(ctx, account, setup.as_ref(), &config).await;
    }

    if account.ready_for_initialization() {
        return initialize_account(ctx, account, setup.as_ref(), &config).await;
    }

    Ok(Action::await_change())
}

/// Whether the account entered Creating longer than `timeout` ago
///
/// Entering Creating refreshes the probe time of its condition, so an
/// account sent back to Creating gets a fresh window.
fn creating_longer_than(account: &Account, timeout: Duration) -> bool {
    let since = account
        .get_condition(condition_types::CREATING)
        .and_then(|c| c.last_probe())
        .or_else(|| account.creation_timestamp().map(|t| t.0));
    since.is_some_and(|t| (Utc::now() - t).to_std().unwrap_or_default() > timeout)
}

/// Build credentials for the account and launch region initialization
async fn initialize_account(
    ctx: &Arc<Context>,
    account: &mut Account,
    setup: &dyn CloudClient,
    config: &OperatorConfig,
) -> Result<Action> {
    info!(
        "Initializing account {}",
        account.spec.aws_account_id
    );

    let assumed = if account.is_manual_sts() {
        assume_sts_support_role(ctx, account, setup).await?
    } else {
        if account.iam_user_id().is_none() {
            account
                .labels_mut()
                .insert(IAM_USER_ID_LABEL.to_string(), generate_short_id());
            *account = ctx.store.update_account(account).await?;
            return Ok(Action::requeue(LABEL_REQUEUE));
        }

        match create_iam_credentials(ctx, account, setup, config).await {
            Ok(assumed) => assumed,
            Err(e) => {
                error!("Error during IAM user creation: {}", e);
                if e.cloud_code().is_some() {
                    let (reason, type_) = iam_failure(&e);
                    set_failed(ctx.store.as_ref(), account, type_, reason, &e.to_string()).await?;
                }
                return Err(e);
            }
        }
    };

    match start_region_init(ctx, account, &assumed, config).await {
        Ok(()) => Ok(Action::await_change()),
        Err(e) if e.cloud_code() == Some(codes::OPT_IN_REQUIRED) => {
            info!("AWS account not ready yet, requeuing");
            Ok(Action::requeue(ctx.settings.not_activated_requeue))
        }
        Err(e) => Err(e),
    }
}

/// Set up the support role and admin user, recording the credentials secret
async fn create_iam_credentials(
    ctx: &Context,
    account: &mut Account,
    setup: &dyn CloudClient,
    config: &OperatorConfig,
) -> Result<AssumedRole> {
    let custom = claim_custom_tags(ctx.store.as_ref(), account).await;
    let tags = resource_tags(account, &config.managed_tags, &custom);
    let assumed = setup_admin_access(ctx, account, setup, config, &tags).await?;

    let id = account.iam_user_id().unwrap_or_default().to_string();
    let secret = build_iam_user(
        ctx.store.as_ref(),
        assumed.client.as_ref(),
        account,
        &admin_user_name(&id),
        &tags,
    )
    .await?;

    if account.spec.iam_user_secret != secret {
        account.spec.iam_user_secret = secret;
        *account = ctx.store.update_account(account).await?;
    }
    Ok(assumed)
}

/// Clean up IAM principals and release the account
async fn handle_deletion(
    ctx: &Context,
    account: &mut Account,
    setup: &dyn CloudClient,
) -> Result<Action> {
    let name = account.name_any();
    info!("Handling deletion of {}", name);

    let store = ctx.store.as_ref();
    let retries = ctx.settings.finalizer_retries;
    let backoff = ctx.settings.finalizer_backoff;

    if account.is_manual_sts() || !account.has_aws_account_id() {
        remove_finalizer(store, account, retries, backoff).await?;
        return Ok(Action::await_change());
    }

    let assumed = if account.is_byoc() {
        match ctx
            .role_assumer
            .assume_role(
                setup,
                &account.spec.aws_account_id,
                &account.support_role_name(),
                DEFAULT_REGION,
            )
            .await
        {
            Ok(assumed) => assumed,
            Err(e) if e.is(codes::ACCESS_DENIED) => {
                info!("Access to customer account {} was revoked, skipping cleanup", name);
                remove_finalizer(store, account, retries, backoff).await?;
                return Ok(Action::await_change());
            }
            Err(e) => return Err(e.into()),
        }
    } else {
        match ctx
            .role_assumer
            .assume_role(
                setup,
                &account.spec.aws_account_id,
                ORGANIZATION_ACCESS_ROLE,
                DEFAULT_REGION,
            )
            .await
        {
            Ok(assumed) => assumed,
            Err(e) => {
                let message = format!("Failed to assume role {}: {}", ORGANIZATION_ACCESS_ROLE, e);
                set_failed(
                    store,
                    account,
                    condition_types::CLIENT_ERROR,
                    "AssumeRoleFailed",
                    &message,
                )
                .await?;
                return Err(e.into());
            }
        }
    };

    if account.iam_user_id().is_some() {
        if let Err(e) = cleanup_iam(assumed.client.as_ref(), account).await {
            error!("Failed cleaning up IAM principals of {}: {}", name, e);
        }
    }

    remove_finalizer(store, account, retries, backoff).await?;
    Ok(Action::await_change())
}
