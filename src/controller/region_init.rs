//! Region initialization
//!
//! Every target region is proven usable by launching and terminating a
//! minimal instance in it. Workers run detached from the reconcile that
//! started them and report back only through the Account status.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kube::ResourceExt;
use kube::runtime::controller::Action;
use tokio::sync::{Semaphore, mpsc};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::cloud::{
    AssumedRole, CloudClient, CloudClientBuilder, CloudError, CloudResult, Credentials,
    MachineImage, RetryPolicy, RunInstanceRequest, codes, retry_cloud_call,
};
use crate::config::OperatorConfig;
use crate::controller::context::Context;
use crate::controller::error::{Error, Result};
use crate::controller::iam::{claim_custom_tags, resource_tags, tag_keys};
use crate::controller::service_quota;
use crate::controller::state_machine::{
    AccountEvent, StateName, TransitionContext, region_init_event,
};
use crate::controller::status::{
    UpdateConditionMode, condition_status, condition_types, propagate_claim_error,
    set_account_condition, set_account_status, set_failed,
};
use crate::crd::{Account, AccountState, ServiceQuotaStatus};
use crate::store::update_status_with_retry;

pub const INSTANCE_TYPE: &str = "t3.micro";
pub const FALLBACK_INSTANCE_TYPE: &str = "t2.micro";

/// Running On-Demand Standard instances, in vCPUs
pub const VCPU_QUOTA_CODE: &str = "L-1216C47A";

pub const IMAGE_ARCHITECTURE: &str = "x86_64";
/// Only images launchable by any account are candidates
pub const IMAGE_EXECUTABLE_BY: &str = "all";

/// Image name markers that disqualify a candidate
const EXCLUDED_IMAGE_MARKERS: [&str; 2] = ["SAP", "BETA"];

const INSTANCE_RUNNING: i32 = 16;
const INSTANCE_UNAUTHORIZED: i32 = 401;

const SANDBOX_VPC_CIDR: &str = "10.0.0.0/16";
const SANDBOX_SUBNET_CIDR: &str = "10.0.0.0/24";
const NETWORK_AVAILABLE: &str = "available";

/// Provider code returned while a new account is still being verified
const PENDING_VERIFICATION: &str = "PendingVerification";

pub const REGION_INIT_FAILED_REASON: &str = "RegionInitializationFailed";
pub const REGION_INIT_TIMEOUT_REASON: &str = "RegionInitializationTimeout";
pub const MISSING_CONDITION_REASON: &str = "MissingCondition";
pub const RECOVERING_MESSAGE: &str = "Recovering from stale region initialization.";

/// How a region worker finished successfully
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionOutcome {
    /// An instance was launched and terminated
    Initialized,
    /// Leftovers from an earlier attempt were found and cleaned
    AlreadyInitialized,
    /// Nothing was launched; GovCloud regions are bring-your-own-VPC
    Skipped,
}

/// Result of one region worker, tagged with its region
#[derive(Clone, Debug, PartialEq)]
pub struct RegionReport {
    pub region: String,
    pub outcome: std::result::Result<RegionOutcome, String>,
}

impl RegionReport {
    fn metric_label(&self) -> &'static str {
        match self.outcome {
            Ok(RegionOutcome::Initialized) => "initialized",
            Ok(RegionOutcome::AlreadyInitialized) => "already_initialized",
            Ok(RegionOutcome::Skipped) => "skipped",
            Err(_) => "error",
        }
    }
}

/// Inputs shared by every region worker of one account
#[derive(Clone, Debug)]
pub struct RegionWorkerConfig {
    pub ami_owner: String,
    pub vcpu_quota: Option<f64>,
    pub network_sandbox: bool,
    /// Skip every region without launching anything
    pub fedramp: bool,
    pub tags: BTreeMap<String, String>,
    /// Customer key for the instance's encrypted root volume
    pub kms_key_id: Option<String>,
    pub poll_budget: Duration,
    pub poll_initial_delay: Duration,
}

/// First eligible image: matching architecture, no excluded marker in the name
pub fn select_image<'a>(images: &'a [MachineImage], architecture: &str) -> Option<&'a MachineImage> {
    images.iter().find(|image| {
        image.architecture == architecture
            && !EXCLUDED_IMAGE_MARKERS
                .iter()
                .any(|marker| image.name.contains(marker))
    })
}

/// Regions that make the account fail, if any
///
/// Only a single expected region is fatal. With several targets every
/// region error is tolerated.
pub fn failed_expected_regions(target_count: usize, reports: &[RegionReport]) -> Option<Vec<String>> {
    if target_count != 1 {
        return None;
    }
    let failed: Vec<String> = reports
        .iter()
        .filter(|r| r.outcome.is_err())
        .map(|r| r.region.clone())
        .collect();
    (!failed.is_empty()).then_some(failed)
}

pub fn region_failure_message(account_name: &str, regions: &[String]) -> String {
    format!(
        "Account {} failed to initialize expected region [{}]",
        account_name,
        regions.join(" ")
    )
}

/// Poll with a wait that doubles each round, bounded by `budget` in total
///
/// Returns `None` once the budget is spent without `check` yielding a value.
async fn poll_with_doubling_wait<T, F, Fut>(
    initial: Duration,
    budget: Duration,
    mut check: F,
) -> Result<Option<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let mut remaining = budget;
    let mut wait = initial;
    while !remaining.is_zero() {
        wait = (wait * 2).min(remaining);
        remaining -= wait;
        tokio::time::sleep(wait).await;
        if let Some(value) = check().await? {
            return Ok(Some(value));
        }
    }
    Ok(None)
}

async fn pick_instance_type(client: &dyn CloudClient) -> Result<String> {
    let wanted = [INSTANCE_TYPE.to_string()];
    let found = retry_cloud_call(&RetryPolicy::compute(), "describe_instance_types", || {
        client.describe_instance_types(&wanted)
    })
    .await;
    match found {
        Ok(found) if found.iter().any(|t| t == INSTANCE_TYPE) => Ok(INSTANCE_TYPE.to_string()),
        Ok(_) => Ok(FALLBACK_INSTANCE_TYPE.to_string()),
        Err(e) if e.is(codes::INVALID_INSTANCE_TYPE) => {
            info!("Did not find {} - falling back to {}", INSTANCE_TYPE, FALLBACK_INSTANCE_TYPE);
            Ok(FALLBACK_INSTANCE_TYPE.to_string())
        }
        Err(e) => Err(e.into()),
    }
}

async fn pick_image(client: &dyn CloudClient, owner: &str) -> Result<String> {
    let images = retry_cloud_call(&RetryPolicy::compute(), "describe_images", || {
        client.describe_images(owner, IMAGE_ARCHITECTURE, IMAGE_EXECUTABLE_BY)
    })
    .await?;
    select_image(&images, IMAGE_ARCHITECTURE)
        .map(|image| image.id.clone())
        .ok_or_else(|| Error::InvalidConfig(format!("no eligible image owned by {}", owner)))
}

/// Terminate instances left running by an earlier attempt
///
/// Returns true when something had to be cleaned.
async fn clean_region(client: &dyn CloudClient, instance_type: &str) -> Result<bool> {
    let keys: Vec<String> = tag_keys::ALL.iter().map(|k| k.to_string()).collect();
    let leftovers = retry_cloud_call(&RetryPolicy::compute(), "find_tagged_instances", || {
        client.find_tagged_instances(instance_type, &keys)
    })
    .await?;
    if leftovers.is_empty() {
        return Ok(false);
    }
    info!("Terminating {} hanging instances", leftovers.len());
    retry_cloud_call(&RetryPolicy::compute(), "terminate_instances", || {
        client.terminate_instances(&leftovers)
    })
    .await?;
    Ok(true)
}

struct NetworkSandbox {
    vpc_id: String,
    subnet_id: Option<String>,
}

async fn wait_available<F, Fut>(config: &RegionWorkerConfig, what: &str, state: F) -> Result<()>
where
    F: Fn() -> Fut,
    Fut: Future<Output = CloudResult<String>>,
{
    let policy = RetryPolicy::compute();
    let available = poll_with_doubling_wait(config.poll_initial_delay, config.poll_budget, || {
        let fut = retry_cloud_call(&policy, what, &state);
        async move { Ok((fut.await? == NETWORK_AVAILABLE).then_some(())) }
    })
    .await?;
    available.ok_or_else(|| Error::TransientError(format!("{} never became available", what)))
}

async fn create_sandbox(client: &dyn CloudClient, config: &RegionWorkerConfig) -> Result<NetworkSandbox> {
    let policy = RetryPolicy::compute();
    let vpc_id = retry_cloud_call(&policy, "create_vpc", || {
        client.create_vpc(SANDBOX_VPC_CIDR, &config.tags)
    })
    .await?;
    let mut sandbox = NetworkSandbox {
        vpc_id,
        subnet_id: None,
    };

    let setup = async {
        wait_available(config, "VPC", || client.vpc_state(&sandbox.vpc_id)).await?;
        let subnet_id = retry_cloud_call(&policy, "create_subnet", || {
            client.create_subnet(&sandbox.vpc_id, SANDBOX_SUBNET_CIDR)
        })
        .await?;
        wait_available(config, "subnet", || client.subnet_state(&subnet_id)).await?;
        Ok::<_, Error>(subnet_id)
    };

    match setup.await {
        Ok(subnet_id) => {
            sandbox.subnet_id = Some(subnet_id);
            Ok(sandbox)
        }
        Err(e) => {
            delete_sandbox(client, &sandbox).await;
            Err(e)
        }
    }
}

async fn delete_sandbox(client: &dyn CloudClient, sandbox: &NetworkSandbox) {
    let policy = RetryPolicy::compute();
    if let Some(subnet_id) = &sandbox.subnet_id
        && let Err(e) =
            retry_cloud_call(&policy, "delete_subnet", || client.delete_subnet(subnet_id)).await
    {
        warn!("Failed to delete subnet {}: {}", subnet_id, e);
    }
    if let Err(e) =
        retry_cloud_call(&policy, "delete_vpc", || client.delete_vpc(&sandbox.vpc_id)).await
    {
        warn!("Failed to delete VPC {}: {}", sandbox.vpc_id, e);
    }
}

async fn launch_instance(client: &dyn CloudClient, config: &RegionWorkerConfig, request: &RunInstanceRequest) -> Result<String> {
    let launched = poll_with_doubling_wait(config.poll_initial_delay, config.poll_budget, || async {
        let launched =
            retry_cloud_call(&RetryPolicy::compute(), "run_instance", || client.run_instance(request))
                .await;
        match launched {
            Ok(id) => Ok(Some(id)),
            Err(e) if e.is(PENDING_VERIFICATION) || e.is(codes::OPT_IN_REQUIRED) => {
                debug!("Account not ready to launch instances yet: {}", e);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    })
    .await?;
    launched.ok_or_else(|| Error::TransientError("timed out launching instance".to_string()))
}

async fn wait_running(client: &dyn CloudClient, config: &RegionWorkerConfig, instance_id: &str) -> Result<()> {
    let running = poll_with_doubling_wait(config.poll_initial_delay, config.poll_budget, || async {
        match client.instance_state(instance_id).await {
            Ok(Some(INSTANCE_RUNNING)) => Ok(Some(())),
            Ok(Some(INSTANCE_UNAUTHORIZED)) => Err(CloudError::new(
                codes::UNAUTHORIZED_OPERATION,
                format!("missing permissions to run instance {}", instance_id),
            )
            .into()),
            Ok(_) => Ok(None),
            Err(e) => {
                warn!("Could not get state of instance {}: {}", instance_id, e);
                Ok(None)
            }
        }
    })
    .await?;
    running.ok_or_else(|| {
        Error::TransientError(format!("instance {} never reached running", instance_id))
    })
}

async fn build_and_destroy_instance(
    client: &dyn CloudClient,
    config: &RegionWorkerConfig,
    request: &RunInstanceRequest,
) -> Result<()> {
    let instance_id = launch_instance(client, config, request).await?;
    info!("Launched instance {}", instance_id);

    let running = wait_running(client, config, &instance_id).await;

    let terminate = [instance_id.clone()];
    let terminated = retry_cloud_call(&RetryPolicy::compute(), "terminate_instances", || {
        client.terminate_instances(&terminate)
    })
    .await;

    running?;
    terminated?;
    info!("Instance {} terminated", instance_id);
    Ok(())
}

/// Prove one region usable with the given credentials
pub async fn initialize_region(
    builder: &dyn CloudClientBuilder,
    credentials: &Credentials,
    region: &str,
    config: &RegionWorkerConfig,
) -> Result<RegionOutcome> {
    let client = builder
        .client_from_credentials(credentials, region)
        .await
        .map_err(|e| {
            error!("unable to get AWS client when attempting to initialize region {}: {}", region, e);
            e
        })?;
    let client = client.as_ref();

    if config.fedramp {
        info!("Skipping region initialization for GovCloud (BYOVPC)");
        return Ok(RegionOutcome::Skipped);
    }

    if let Err(e) = retry_cloud_call(&RetryPolicy::compute(), "dry_run_describe_instances", || {
        client.dry_run_describe_instances()
    })
    .await
        && e.is(codes::AUTH_FAILURE)
    {
        error!("No usable credentials to clean or initialize region {}", region);
        return Err(e.into());
    }

    let instance_type = pick_instance_type(client).await?;
    if clean_region(client, &instance_type).await? {
        return Ok(RegionOutcome::AlreadyInitialized);
    }

    let image_id = pick_image(client, &config.ami_owner).await?;

    if let Some(desired) = config.vcpu_quota.filter(|q| *q > 0.0) {
        let mut quota = ServiceQuotaStatus {
            value: desired as i64,
            ..Default::default()
        };
        if let Err(e) = service_quota::handle_quota_request(client, VCPU_QUOTA_CODE, &mut quota).await {
            warn!("vCPU quota request in {} failed: {}", region, e);
        }
    }

    let sandbox = if config.network_sandbox {
        Some(create_sandbox(client, config).await?)
    } else {
        None
    };

    let request = RunInstanceRequest {
        image_id,
        instance_type,
        subnet_id: sandbox.as_ref().and_then(|s| s.subnet_id.clone()),
        tags: config.tags.clone(),
        kms_key_id: config.kms_key_id.clone(),
    };
    let result = build_and_destroy_instance(client, config, &request).await;

    if let Some(sandbox) = &sandbox {
        delete_sandbox(client, sandbox).await;
    }
    result.map(|()| RegionOutcome::Initialized)
}

/// Run one worker per region, at most `max_workers` at a time
///
/// Exactly one report comes back per region, in completion order.
pub async fn run_region_workers(
    builder: Arc<dyn CloudClientBuilder>,
    credentials: Credentials,
    regions: Vec<String>,
    config: RegionWorkerConfig,
    max_workers: usize,
) -> Vec<RegionReport> {
    let expected = regions.len();
    let (tx, mut rx) = mpsc::channel(expected.max(1));
    let permits = Arc::new(Semaphore::new(max_workers.max(1)));
    let config = Arc::new(config);

    for region in regions.iter().cloned() {
        let tx = tx.clone();
        let builder = Arc::clone(&builder);
        let credentials = credentials.clone();
        let config = Arc::clone(&config);
        let permits = Arc::clone(&permits);
        let span = info_span!("region_worker", region = %region);

        tokio::spawn(
            async move {
                let outcome = match permits.acquire_owned().await {
                    Ok(_permit) => {
                        initialize_region(builder.as_ref(), &credentials, &region, &config)
                            .await
                            .map_err(|e| e.to_string())
                    }
                    Err(e) => Err(format!("worker pool closed: {}", e)),
                };
                let _ = tx.send(RegionReport { region, outcome }).await;
            }
            .instrument(span),
        );
    }
    drop(tx);

    let mut reports = Vec::with_capacity(expected);
    while reports.len() < expected {
        match rx.recv().await {
            Some(report) => reports.push(report),
            None => break,
        }
    }

    // A worker that died without reporting still counts as an error
    let reported: BTreeSet<String> = reports.iter().map(|r| r.region.clone()).collect();
    for region in regions {
        if !reported.contains(&region) {
            reports.push(RegionReport {
                region,
                outcome: Err("region worker exited without reporting".to_string()),
            });
        }
    }
    reports
}

/// Write the result of a finished region initialization
///
/// The write is skipped when the account has left InitializingRegions in
/// the meantime, e.g. because it timed out.
pub async fn complete_region_init(
    ctx: &Context,
    namespace: &str,
    name: &str,
    target_count: usize,
    reports: &[RegionReport],
) -> Result<()> {
    for report in reports {
        match &report.outcome {
            Ok(RegionOutcome::Initialized) => info!(
                "EC2 instance created and terminated successfully in region: {}",
                report.region
            ),
            Ok(RegionOutcome::AlreadyInitialized) => {
                info!("Region {} was already initialized", report.region)
            }
            Ok(RegionOutcome::Skipped) => {
                info!("Region {} initialization skipped for GovCloud (BYOVPC)", report.region)
            }
            Err(e) => error!("Region {} failed to initialize: {}", report.region, e),
        }
        ctx.record_region_init(report.metric_label());
    }

    let failed = failed_expected_regions(target_count, reports);
    let machine = ctx.state_machine.as_ref();

    let updated = update_status_with_retry(ctx.store.as_ref(), namespace, name, |account| {
        let tctx = TransitionContext::new(account.is_byoc())
            .with_case_resolved(account.get_condition(condition_types::READY).is_some());
        let event = if failed.is_some() {
            AccountEvent::Failure
        } else {
            region_init_event(&tctx)
        };

        if !account.is_initializing_regions() {
            warn!(
                "Account {} left InitializingRegions (now {}), dropping {}",
                name,
                StateName(account.state()),
                event
            );
            return false;
        }
        let Some(target) = machine.transition(account.state(), event, &tctx).target() else {
            warn!("Ignoring {} for account {}", event, name);
            return false;
        };

        set_account_condition(
            account,
            condition_types::INITIALIZING_REGIONS,
            condition_status::FALSE,
            "RegionInitializationFinished",
            "Region initialization finished",
            UpdateConditionMode::Always,
        );

        match &failed {
            Some(regions) => {
                set_account_condition(
                    account,
                    condition_types::FAILED,
                    condition_status::TRUE,
                    REGION_INIT_FAILED_REASON,
                    &region_failure_message(name, regions),
                    UpdateConditionMode::Always,
                );
                if let Some(status) = account.status.as_mut() {
                    status.state = Some(target);
                }
            }
            None => {
                let (message, condition) = match target {
                    AccountState::Ready if account.is_byoc() => {
                        ("BYOC Account Ready", condition_types::READY)
                    }
                    AccountState::Ready => (
                        "Account support case already resolved; Account Ready",
                        condition_types::READY,
                    ),
                    _ => (
                        "Account pending AWS limits verification",
                        condition_types::PENDING_VERIFICATION,
                    ),
                };
                info!("{}", message);
                set_account_status(account, message, condition, target);
            }
        }
        true
    })
    .await?;

    if let Some(regions) = failed
        && updated.is_failed()
    {
        let message = region_failure_message(name, &regions);
        if let Err(e) =
            propagate_claim_error(ctx.store.as_ref(), &updated, REGION_INIT_FAILED_REASON, &message)
                .await
        {
            error!("Failed to propagate region failure to claim: {}", e);
        }
    }
    Ok(())
}

/// Move the account to InitializingRegions and launch the detached workers
///
/// Returns as soon as the workers are spawned. "OptInRequired" from the
/// region listing is returned as a cloud error for the caller to requeue.
pub async fn start_region_init(
    ctx: &Arc<Context>,
    account: &mut Account,
    assumed: &AssumedRole,
    config: &OperatorConfig,
) -> Result<()> {
    let ami_owner = config.ami_owner()?.to_string();
    let namespace = account
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let name = account.name_any();

    let enabled = retry_cloud_call(&RetryPolicy::compute(), "list_enabled_regions", || {
        assumed.client.list_enabled_regions()
    })
    .await?;

    let tctx = TransitionContext::new(account.is_byoc());
    let Some(target) = ctx
        .state_machine
        .transition(account.state(), AccountEvent::RegionInitStarted, &tctx)
        .target()
    else {
        warn!(
            "Account {} cannot start region initialization from {}",
            name,
            StateName(account.state())
        );
        return Ok(());
    };

    // Switch off first so the transition time always belongs to this attempt
    set_account_condition(
        account,
        condition_types::INITIALIZING_REGIONS,
        condition_status::FALSE,
        "Restarting",
        "Initializing Regions",
        UpdateConditionMode::Always,
    );
    set_account_status(
        account,
        "Initializing Regions",
        condition_types::INITIALIZING_REGIONS,
        target,
    );
    *account = ctx.store.update_account_status(account).await?;

    let claim = if account.is_byoc() {
        Some(
            ctx.store
                .get_claim(&account.spec.claim_link_namespace, &account.spec.claim_link)
                .await?,
        )
    } else {
        None
    };

    let regions = if let Some(claim) = &claim {
        let wanted = claim.region_names();
        if let Some(missing) = wanted.iter().find(|r| !enabled.contains(r)) {
            let message = format!(
                "AWS region {} is not supported for AWS account {}",
                missing, name
            );
            set_account_condition(
                account,
                condition_types::INITIALIZING_REGIONS,
                condition_status::TRUE,
                &AccountState::InitializingRegions.to_string(),
                &message,
                UpdateConditionMode::IfReasonOrMessageChange,
            );
            *account = ctx.store.update_account_status(account).await?;
            return Err(Error::InvalidClaim(message));
        }
        wanted
    } else {
        enabled
    };

    info!("Initializing {} regions", regions.len());

    let custom = match &claim {
        Some(claim) => claim.custom_tags(),
        None => claim_custom_tags(ctx.store.as_ref(), account).await,
    };
    let kms_key_id = claim
        .as_ref()
        .and_then(|c| c.kms_key_id())
        .map(String::from);
    if let Some(key) = &kms_key_id {
        info!("Retrieved KMS key to use: {}", key);
    }

    let worker_config = RegionWorkerConfig {
        ami_owner,
        vcpu_quota: config.vcpu_quota,
        network_sandbox: config.network_sandbox,
        fedramp: config.fedramp,
        tags: resource_tags(account, &config.managed_tags, &custom),
        kms_key_id,
        poll_budget: ctx.settings.instance_poll_budget,
        poll_initial_delay: ctx.settings.instance_poll_initial_delay,
    };
    let credentials = assumed.credentials.clone();
    let ctx = Arc::clone(ctx);
    let span = info_span!("region_init", account = %name, namespace = %namespace);

    tokio::spawn(
        async move {
            let target_count = regions.len();
            let reports = run_region_workers(
                Arc::clone(&ctx.cloud),
                credentials,
                regions,
                worker_config,
                ctx.settings.max_region_workers,
            )
            .await;
            if let Err(e) = complete_region_init(&ctx, &namespace, &name, target_count, &reports).await {
                error!("Could not record region initialization result: {}", e);
            }
        }
        .instrument(span),
    );

    Ok(())
}

/// Handle an account whose region workers should be running
///
/// Workers started by a previous process are gone; the account goes back to
/// Creating so they are started again. Otherwise only the timeout applies.
pub async fn handle_initializing_regions(ctx: &Context, account: &mut Account) -> Result<Action> {
    let store = ctx.store.as_ref();
    let Some(condition) = account
        .get_condition(condition_types::INITIALIZING_REGIONS)
        .cloned()
    else {
        return set_failed(
            store,
            account,
            condition_types::INTERNAL_ERROR,
            MISSING_CONDITION_REASON,
            "Unexpectedly couldn't find the InitializingRegions Condition",
        )
        .await;
    };

    let started = condition.last_transition();
    if started.is_none_or(|t| t < ctx.started_at) {
        let tctx = TransitionContext::new(account.is_byoc());
        let Some(target) = ctx
            .state_machine
            .transition(account.state(), AccountEvent::RegionInitRecovered, &tctx)
            .target()
        else {
            return Ok(Action::await_change());
        };

        info!("{}", RECOVERING_MESSAGE);
        set_account_condition(
            account,
            condition_types::INITIALIZING_REGIONS,
            condition_status::FALSE,
            &AccountState::InitializingRegions.to_string(),
            RECOVERING_MESSAGE,
            UpdateConditionMode::Always,
        );
        set_account_status(account, RECOVERING_MESSAGE, condition_types::CREATING, target);
        *account = store.update_account_status(account).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    let elapsed = started
        .map(|t| (Utc::now() - t).to_std().unwrap_or_default())
        .unwrap_or_default();
    if elapsed > ctx.settings.region_init_timeout {
        let message = format!(
            "Initializing regions for longer than {} seconds",
            ctx.settings.region_init_timeout.as_secs()
        );
        return set_failed(
            store,
            account,
            condition_types::CREATION_FAILED,
            REGION_INIT_TIMEOUT_REASON,
            &message,
        )
        .await;
    }

    info!("Account {} is initializing regions. Ignoring.", account.name_any());
    Ok(Action::await_change())
}
