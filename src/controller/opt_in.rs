//! Opt-in region enablement
//!
//! The provider limits how many regions may be enabling at once, both per
//! account and across the organization, so requests are admitted in
//! batches and tracked in the Account status until they settle.

use std::collections::BTreeMap;
use std::time::Duration;

use kube::ResourceExt;
use kube::runtime::controller::Action;
use tracing::{debug, info, warn};

use crate::cloud::{CloudClient, RetryPolicy, codes, retry_cloud_call};
use crate::config::OperatorConfig;
use crate::controller::context::Context;
use crate::controller::error::{Error, Result};
use crate::controller::state_machine::{AccountEvent, StateName, TransitionContext};
use crate::controller::status::{condition_types, set_account_status};
use crate::crd::{Account, OptInRegionStatus, ServiceRequestStatus};

/// Requeue while enable requests are still open
pub const OPT_IN_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// What to do with a status entry after polling its region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptInOutcome {
    Keep,
    /// The provider does not know the region code
    Remove,
}

/// Request status for a provider opt-in status
pub fn map_opt_status(status: &str) -> Option<ServiceRequestStatus> {
    match status {
        "ENABLING" => Some(ServiceRequestStatus::InProgress),
        "ENABLED" | "ENABLED_BY_DEFAULT" => Some(ServiceRequestStatus::Completed),
        "DISABLED" | "DISABLING" => Some(ServiceRequestStatus::Todo),
        _ => None,
    }
}

/// Fresh Todo entries for the configured regions
pub fn snapshot_opt_in_regions(regions: &[String]) -> BTreeMap<String, OptInRegionStatus> {
    regions
        .iter()
        .map(|region| {
            (
                region.clone(),
                OptInRegionStatus {
                    status: ServiceRequestStatus::Todo,
                },
            )
        })
        .collect()
}

/// Regions to handle this round: every InProgress entry, then Todo entries
/// until `ceiling` would be exceeded
pub fn select_opt_in_batch(account: &Account, ceiling: usize) -> Vec<String> {
    let mut batch = account.opt_in_requests_by_status(ServiceRequestStatus::InProgress);
    let room = ceiling.saturating_sub(batch.len());
    batch.extend(
        account
            .opt_in_requests_by_status(ServiceRequestStatus::Todo)
            .into_iter()
            .take(room),
    );
    batch
}

/// Number of accounts currently opting in to regions
pub fn count_opting_in(accounts: &[Account]) -> usize {
    accounts.iter().filter(|a| a.is_opting_in_regions()).count()
}

/// Poll one region and submit its enable request if needed
pub async fn handle_opt_in_request(
    client: &dyn CloudClient,
    region: &str,
    entry: &mut OptInRegionStatus,
) -> Result<OptInOutcome> {
    let policy = RetryPolicy::opt_in();

    let status = match retry_cloud_call(&policy, "get_region_opt_status", || {
        client.get_region_opt_status(region)
    })
    .await
    {
        Ok(status) => status,
        Err(e) if e.is(codes::VALIDATION_EXCEPTION) => {
            warn!("Region code {} rejected by the provider, dropping it", region);
            return Ok(OptInOutcome::Remove);
        }
        Err(e) => return Err(e.into()),
    };

    match map_opt_status(&status) {
        Some(ServiceRequestStatus::Todo) => {
            match retry_cloud_call(&policy, "enable_region", || client.enable_region(region)).await
            {
                Ok(()) => info!("Opt-in requested for region {}", region),
                Err(e) if e.is(codes::RESOURCE_ALREADY_EXISTS) => {
                    debug!("Opt-in for region {} already requested", region)
                }
                Err(e) if e.is(codes::VALIDATION_EXCEPTION) => {
                    warn!("Region code {} rejected by the provider, dropping it", region);
                    return Ok(OptInOutcome::Remove);
                }
                Err(e) => return Err(e.into()),
            }
            entry.status = ServiceRequestStatus::InProgress;
        }
        Some(status) => {
            debug!("Region {} opt-in is {}", region, status);
            entry.status = status;
        }
        None => warn!("Unknown opt-in status {} for region {}", status, region),
    }
    Ok(OptInOutcome::Keep)
}

/// Handle one batch of open opt-in requests
pub async fn sync_opt_in_requests(
    ctx: &Context,
    account: &mut Account,
    setup: &dyn CloudClient,
) -> Result<()> {
    let batch = select_opt_in_batch(account, ctx.settings.opt_in_account_ceiling);
    info!("Handling {} opt-in region requests", batch.len());

    for region in batch {
        let assumed = ctx
            .role_assumer
            .assume_role(
                setup,
                &account.spec.aws_account_id,
                &account.assume_role_name(),
                &region,
            )
            .await?;

        let Some(status) = account.status.as_mut() else {
            break;
        };
        let Some(entry) = status.opt_in_regions.get_mut(&region) else {
            continue;
        };

        match handle_opt_in_request(assumed.client.as_ref(), &region, entry).await {
            Ok(OptInOutcome::Keep) => {}
            Ok(OptInOutcome::Remove) => {
                status.opt_in_regions.remove(&region);
            }
            Err(e) => warn!("Failed to handle opt-in for region {}: {}", region, e),
        }
    }
    Ok(())
}

fn transition_to(ctx: &Context, account: &mut Account, event: AccountEvent, message: &str, type_: &str) -> bool {
    let tctx = TransitionContext::new(account.is_byoc());
    match ctx
        .state_machine
        .transition(account.state(), event, &tctx)
        .target()
    {
        Some(target) => {
            set_account_status(account, message, type_, target);
            true
        }
        None => {
            warn!(
                "Ignoring {} for account {} in state {}",
                event,
                account.name_any(),
                StateName(account.state())
            );
            false
        }
    }
}

/// Drive opt-in region enablement for an eligible account
pub async fn handle_opt_in_regions(
    ctx: &Context,
    account: &mut Account,
    setup: &dyn CloudClient,
    config: &OperatorConfig,
) -> Result<Action> {
    let no_entries = account
        .status
        .as_ref()
        .is_none_or(|s| s.opt_in_regions.is_empty());

    if no_entries {
        let namespace = account
            .namespace()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
        let accounts = ctx.store.list_accounts(&namespace).await?;
        let opting_in = count_opting_in(&accounts);
        if opting_in >= ctx.settings.opt_in_fleet_ceiling {
            info!(
                "{} accounts already opting in to regions, waiting",
                opting_in
            );
            return Ok(Action::requeue(ctx.settings.verification_poll_interval));
        }

        account
            .status
            .get_or_insert_with(Default::default)
            .opt_in_regions = snapshot_opt_in_regions(&config.opt_in_regions);
        if !transition_to(
            ctx,
            account,
            AccountEvent::OptInStarted,
            "Opting-In Regions",
            condition_types::OPTING_IN_REGIONS,
        ) {
            return Ok(Action::await_change());
        }
        *account = ctx.store.update_account_status(account).await?;
    }

    if account.has_open_opt_in_region_requests() {
        sync_opt_in_requests(ctx, account, setup).await?;
        *account = ctx.store.update_account_status(account).await?;
    }

    if account.has_open_opt_in_region_requests() {
        return Ok(Action::requeue(OPT_IN_POLL_INTERVAL));
    }

    info!(
        "All Opt-In Regions have been enabled for {}",
        account.spec.aws_account_id
    );
    if transition_to(
        ctx,
        account,
        AccountEvent::OptInCompleted,
        "Opt-In Regions Enabled",
        condition_types::OPT_IN_REGIONS_ENABLED,
    ) {
        *account = ctx.store.update_account_status(account).await?;
    }
    Ok(Action::await_change())
}
