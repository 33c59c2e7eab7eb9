//! Support case and service quota tracking for pooled accounts
//!
//! A pooled account stays in PendingVerification until the provider
//! resolves its support case and every quota increase recorded in the status
//! has settled.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use kube::ResourceExt;
use kube::runtime::controller::Action;
use tracing::{debug, error, info, warn};

use crate::cloud::{
    CloudClient, CloudError, DEFAULT_REGION, QuotaChange, RetryPolicy, SupportCase, codes, collect_pages,
    retry_cloud_call,
};
use crate::controller::context::Context;
use crate::controller::error::{Error, Result, SupportCaseError};
use crate::controller::state_machine::{AccountEvent, TransitionContext};
use crate::controller::status::{condition_types, set_account_status, set_failed};
use crate::crd::{
    Account, AccountState, DEFAULT_QUOTA_KEY, RegionalServiceQuotas, ServiceQuotaStatus, ServiceRequestStatus,
};

pub const EC2_SERVICE_CODE: &str = "ec2";
pub const ELB_SERVICE_CODE: &str = "elasticloadbalancing";
pub const VPC_SERVICE_CODE: &str = "vpc";

pub const QUOTA_DENIED_REASON: &str = "QuotaIncreaseDenied";

const CASE_CATEGORY_CODE: &str = "other-account-issues";
const CASE_SERVICE_CODE: &str = "customer-account";
const CASE_ISSUE_TYPE: &str = "customer-service";
const CASE_SEVERITY: &str = "high";
const CASE_LANGUAGE: &str = "en";
const CASE_STATUS_RESOLVED: &str = "resolved";

/// Service owning a supported quota code
pub fn service_code(quota_code: &str) -> Option<&'static str> {
    match quota_code {
        // Running instances, EC2-VPC elastic IPs, network ACLs, gp2 storage
        "L-1216C47A" | "L-0263D0A3" | "L-7A658B76" | "L-B4A6D682" => Some(EC2_SERVICE_CODE),
        // Network load balancers per region
        "L-69A177A2" => Some(ELB_SERVICE_CODE),
        // Rules per security group
        "L-0EA8095F" | "L-F678F1CE" => Some(VPC_SERVICE_CODE),
        _ => None,
    }
}

/// Request status of a quota change history entry
pub fn map_history_status(status: &str) -> Option<ServiceRequestStatus> {
    match status {
        "PENDING" | "CASE_OPENED" => Some(ServiceRequestStatus::InProgress),
        "APPROVED" | "CASE_CLOSED" => Some(ServiceRequestStatus::Completed),
        "DENIED" | "INVALID_REQUEST" | "NOT_APPROVED" => Some(ServiceRequestStatus::Denied),
        _ => None,
    }
}

fn change_matches(change: &QuotaChange, quota_code: &str, desired: f64) -> bool {
    change.quota_code == quota_code && change.desired_value == desired
}

async fn current_quota(client: &dyn CloudClient, service: &str, quota_code: &str) -> Result<f64> {
    Ok(
        retry_cloud_call(&RetryPolicy::quota(), "get_service_quota", || {
            client.get_service_quota(service, quota_code)
        })
        .await?,
    )
}

/// Status of an earlier increase request for the same value, Todo if none
async fn history_status(
    client: &dyn CloudClient,
    service: &str,
    quota_code: &str,
    desired: f64,
) -> Result<ServiceRequestStatus> {
    let policy = RetryPolicy::quota();
    let changes = collect_pages(|token| {
        let policy = &policy;
        async move {
            retry_cloud_call(policy, "list_quota_history", || {
                client.list_quota_history(service, quota_code, token.clone())
            })
            .await
        }
    })
    .await?;

    Ok(changes
        .iter()
        .filter(|c| change_matches(c, quota_code, desired))
        .find_map(|c| map_history_status(&c.status))
        .unwrap_or(ServiceRequestStatus::Todo))
}

/// Submit an increase, `None` when the provider already has one open
async fn submit_increase(
    client: &dyn CloudClient,
    service: &str,
    quota_code: &str,
    desired: f64,
) -> Result<Option<String>> {
    match retry_cloud_call(&RetryPolicy::quota(), "request_quota_increase", || {
        client.request_quota_increase(service, quota_code, desired)
    })
    .await
    {
        Ok(request_id) => Ok(Some(request_id)),
        Err(e) if e.is(codes::RESOURCE_ALREADY_EXISTS) => {
            debug!("Increase of {} already requested", quota_code);
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

/// Move one quota entry forward
///
/// A sufficient current value completes the entry without a request. An
/// entry already InProgress is only polled, never submitted again.
pub async fn handle_quota_request(
    client: &dyn CloudClient,
    quota_code: &str,
    quota: &mut ServiceQuotaStatus,
) -> Result<()> {
    let service = service_code(quota_code).ok_or_else(|| {
        Error::InvalidConfig(format!("no service code for quota code {}", quota_code))
    })?;
    let desired = quota.value as f64;

    let current = current_quota(client, service, quota_code).await?;
    if current >= desired {
        debug!(
            "Quota {} already at {} (wanted {})",
            quota_code, current, desired
        );
        quota.status = ServiceRequestStatus::Completed;
        return Ok(());
    }

    info!(
        "Quota increase required for {} ({}): current {} wanted {}",
        quota_code, service, current, desired
    );
    match history_status(client, service, quota_code, desired).await? {
        ServiceRequestStatus::Todo if quota.status == ServiceRequestStatus::InProgress => {
            debug!("Increase of {} not visible in history yet", quota_code);
        }
        ServiceRequestStatus::Todo => {
            if let Some(request_id) = submit_increase(client, service, quota_code, desired).await? {
                info!("Quota increase requested for {}: {}", quota_code, request_id);
                quota.request_id = Some(request_id);
            }
            quota.status = ServiceRequestStatus::InProgress;
        }
        status => {
            info!("Quota increase for {} is {}", quota_code, status);
            quota.status = status;
        }
    }
    Ok(())
}

/// Per-region quota targets from the spec, every entry Todo
///
/// Only `enabled_regions` get entries, so the status never names a region
/// the provider does not know.
pub fn snapshot_quotas(
    spec_quotas: &BTreeMap<String, BTreeMap<String, i64>>,
    enabled_regions: &[String],
) -> Result<RegionalServiceQuotas> {
    if spec_quotas.is_empty() {
        return Ok(RegionalServiceQuotas::new());
    }
    let defaults = spec_quotas.get(DEFAULT_QUOTA_KEY).ok_or_else(|| {
        Error::InvalidConfig("could not find default key in regionalServiceQuotas".to_string())
    })?;

    Ok(enabled_regions
        .iter()
        .map(|region| {
            let mut values = defaults.clone();
            if let Some(overrides) = spec_quotas.get(region) {
                values.extend(overrides.iter().map(|(k, v)| (k.clone(), *v)));
            }
            let quotas = values
                .into_iter()
                .map(|(code, value)| {
                    (
                        code,
                        ServiceQuotaStatus {
                            value,
                            status: ServiceRequestStatus::Todo,
                            request_id: None,
                        },
                    )
                })
                .collect();
            (region.clone(), quotas)
        })
        .collect())
}

/// Record the quota targets of every enabled region in the status
///
/// Nothing is written while the account is not activated yet.
pub async fn set_current_account_service_quotas(
    ctx: &Context,
    account: &mut Account,
    setup: &dyn CloudClient,
) -> Result<()> {
    if account.spec.regional_service_quotas.is_empty() {
        return Ok(());
    }
    if !account
        .spec
        .regional_service_quotas
        .contains_key(DEFAULT_QUOTA_KEY)
    {
        error!("Could not find default key in regionalServiceQuotas for Account");
        return Err(Error::InvalidConfig(
            "could not find default key in regionalServiceQuotas".to_string(),
        ));
    }

    let assumed = ctx
        .role_assumer
        .assume_role(
            setup,
            &account.spec.aws_account_id,
            &account.assume_role_name(),
            DEFAULT_REGION,
        )
        .await?;

    let regions = match retry_cloud_call(&RetryPolicy::compute(), "list_enabled_regions", || {
        assumed.client.list_enabled_regions()
    })
    .await
    {
        Ok(regions) => regions,
        Err(e) if e.is(codes::OPT_IN_REQUIRED) => return Ok(()),
        Err(e) => {
            error!("Failed to retrieve list of regions enabled in this account: {}", e);
            return Err(e.into());
        }
    };

    let quotas = snapshot_quotas(&account.spec.regional_service_quotas, &regions)?;
    account
        .status
        .get_or_insert_with(Default::default)
        .regional_service_quotas = quotas;
    Ok(())
}

/// Advance the open quota requests of an account
///
/// InProgress entries are always polled. Todo entries are admitted only
/// up to the ceiling of requests in flight. Returns the region and quota
/// code of a denied request, if any.
pub async fn sync_quota_requests(
    ctx: &Context,
    account: &mut Account,
    setup: &dyn CloudClient,
) -> Result<Option<(String, String)>> {
    let ceiling = ctx.settings.quota_ceiling;
    let (_, in_progress) = account.quota_requests_by_status(&[ServiceRequestStatus::InProgress]);
    let (_, todo) = account.quota_requests_by_status(&[ServiceRequestStatus::Todo]);

    let in_flight = in_progress.values().map(|q| q.len()).sum::<usize>();
    let mut work: Vec<(String, String, ServiceQuotaStatus)> = Vec::new();
    for (region, quotas) in in_progress {
        work.extend(quotas.into_iter().map(|(code, q)| (region.clone(), code, q)));
    }
    let admit = ceiling.saturating_sub(in_flight);
    work.extend(
        todo.into_iter()
            .flat_map(|(region, quotas)| {
                quotas
                    .into_iter()
                    .map(move |(code, q)| (region.clone(), code, q))
            })
            .take(admit),
    );
    debug!(
        "{} quota requests in flight for {}, admitting up to {} more",
        in_flight,
        account.name_any(),
        admit
    );

    let mut clients: BTreeMap<String, Arc<dyn CloudClient>> = BTreeMap::new();
    let mut denied = None;
    for (region, code, mut quota) in work {
        let client = match clients.get(&region) {
            Some(client) => Arc::clone(client),
            None => {
                let assumed = ctx
                    .role_assumer
                    .assume_role(
                        setup,
                        &account.spec.aws_account_id,
                        &account.assume_role_name(),
                        &region,
                    )
                    .await?;
                clients.insert(region.clone(), Arc::clone(&assumed.client));
                assumed.client
            }
        };

        if let Err(e) = handle_quota_request(client.as_ref(), &code, &mut quota).await {
            warn!("Quota request {} in {} failed: {}", code, region, e);
            continue;
        }
        if quota.status == ServiceRequestStatus::Denied && denied.is_none() {
            denied = Some((region.clone(), code.clone()));
        }

        if let Some(entry) = account
            .status
            .as_mut()
            .and_then(|s| s.regional_service_quotas.get_mut(&region))
            .and_then(|q| q.get_mut(&code))
        {
            *entry = quota;
        }
    }
    Ok(denied)
}

/// Parameters of the case asking the provider to verify a new account
pub fn support_case(account: &Account) -> SupportCase {
    let account_id = &account.spec.aws_account_id;
    SupportCase {
        subject: format!("Add account {} to Enterprise Support", account_id),
        body: format!(
            "Hello AWS,\n\n\
             Please enable Enterprise Support on AWS account {}.\n\n\
             Once this has been completed and the default EC2 limits are ready for use, \
             please resolve this support case. Please do not set the case to Pending Customer Action.\n\n\
             Thanks.\n\n\
             [rh-internal-account-name: {}]",
            account_id,
            account.name_any()
        ),
        category_code: CASE_CATEGORY_CODE.to_string(),
        service_code: CASE_SERVICE_CODE.to_string(),
        issue_type: CASE_ISSUE_TYPE.to_string(),
        severity_code: CASE_SEVERITY.to_string(),
        language: CASE_LANGUAGE.to_string(),
    }
}

pub fn map_create_case_error(err: &CloudError) -> SupportCaseError {
    match err.code.as_str() {
        codes::CASE_CREATION_LIMIT_EXCEEDED => SupportCaseError::CaseCreationLimitExceeded,
        codes::INTERNAL_SERVER_ERROR => SupportCaseError::InternalFailure,
        _ => SupportCaseError::FailedCreateSupportCase,
    }
}

pub fn map_describe_case_error(err: &CloudError) -> SupportCaseError {
    match err.code.as_str() {
        codes::CASE_ID_NOT_FOUND => SupportCaseError::CaseIdNotFound,
        codes::INTERNAL_SERVER_ERROR => SupportCaseError::InternalFailure,
        _ => SupportCaseError::FailedDescribeSupportCase,
    }
}

pub async fn create_case(client: &dyn CloudClient, account: &Account) -> Result<String> {
    let case = support_case(account);
    let case_id = retry_cloud_call(&RetryPolicy::support(), "create_case", || {
        client.create_case(&case)
    })
    .await
    .map_err(|e| {
        let category = map_create_case_error(&e);
        error!("New AWS Error while creating case: {} ({})", e, category);
        category
    })?;
    info!(
        "Support case {} created for account {}",
        case_id, account.spec.aws_account_id
    );
    Ok(case_id)
}

pub async fn case_resolved(client: &dyn CloudClient, case_id: &str) -> Result<bool> {
    let status = retry_cloud_call(&RetryPolicy::support(), "case_status", || {
        client.case_status(case_id)
    })
    .await
    .map_err(|e| {
        let category = map_describe_case_error(&e);
        error!("New AWS Error while checking case resolution: {} ({})", e, category);
        category
    })?;
    let resolved = status == CASE_STATUS_RESOLVED;
    if resolved {
        info!("Case Resolved: {}", case_id);
    }
    Ok(resolved)
}

/// Requeue after opening a case, spread over 30 seconds by account id
pub fn case_creation_requeue(base: Duration, account_id: &str) -> Result<Duration> {
    let id: u64 = account_id.parse().map_err(|_| {
        Error::InvalidConfig(format!("account id {} is not numeric", account_id))
    })?;
    Ok(base + Duration::from_secs(id % 30))
}

/// Drive a pooled account through PendingVerification
pub async fn handle_pending_verification(
    ctx: &Context,
    account: &mut Account,
    setup: &dyn CloudClient,
) -> Result<Action> {
    if account.is_byoc() {
        return Err(Error::InvalidConfig(format!(
            "account {} is BYOC and is never verified through a support case",
            account.name_any()
        )));
    }

    if !account.has_support_case_id() {
        // A failed snapshot must not leave an orphaned case behind
        set_current_account_service_quotas(ctx, account, setup).await?;
        let case_id = create_case(setup, account).await?;
        account
            .status
            .get_or_insert_with(Default::default)
            .support_case_id = case_id;
        set_account_status(
            account,
            "Account pending verification in AWS",
            condition_types::PENDING_VERIFICATION,
            AccountState::PendingVerification,
        );
        *account = ctx.store.update_account_status(account).await?;

        let requeue =
            case_creation_requeue(ctx.settings.case_creation_requeue, &account.spec.aws_account_id)?;
        return Ok(Action::requeue(requeue));
    }

    let case_id = account
        .status
        .as_ref()
        .map(|s| s.support_case_id.clone())
        .unwrap_or_default();
    let resolved = case_resolved(setup, &case_id).await?;

    if account.has_open_quota_increase_requests() {
        let denied = sync_quota_requests(ctx, account, setup).await?;
        if let Some((region, code)) = denied {
            let message = format!("Quota increase request for {} in {} was denied", code, region);
            return set_failed(
                ctx.store.as_ref(),
                account,
                condition_types::QUOTA_DENIED,
                QUOTA_DENIED_REASON,
                &message,
            )
            .await;
        }
        *account = ctx.store.update_account_status(account).await?;
    }

    let (open, _) = account.quota_requests_by_status(&[
        ServiceRequestStatus::Todo,
        ServiceRequestStatus::InProgress,
    ]);
    let tctx = TransitionContext::new(false)
        .with_case_resolved(resolved)
        .with_open_quota_requests(open);

    match ctx
        .state_machine
        .transition(account.state(), AccountEvent::Verified, &tctx)
        .target()
    {
        Some(target) => {
            info!("Case {} and quota increases resolved", case_id);
            set_account_status(
                account,
                "Account ready to be claimed",
                condition_types::READY,
                target,
            );
            *account = ctx.store.update_account_status(account).await?;
            Ok(Action::await_change())
        }
        None => {
            if !resolved {
                info!("Case {} not yet resolved, retrying", case_id);
            }
            Ok(Action::requeue(ctx.settings.verification_poll_interval))
        }
    }
}
