//! Status and conditions management for Account resources
//!
//! Conditions double as a recovery signal: the last transition time of the
//! InitializingRegions condition tells whether region initialization was
//! started by this process or orphaned by a previous one.

use std::time::Duration;

use chrono::Utc;
use kube::ResourceExt;
use kube::runtime::controller::Action;
use tracing::{error, info, warn};

use crate::controller::error::Result;
use crate::crd::{Account, AccountClaim, AccountState, AccountStatus, ClaimState, Condition};
use crate::store::AccountStore;

/// Condition types used on Accounts and AccountClaims
pub mod condition_types {
    pub const CREATING: &str = "Creating";
    pub const READY: &str = "Ready";
    pub const FAILED: &str = "Failed";
    pub const PENDING_VERIFICATION: &str = "PendingVerification";
    pub const INITIALIZING_REGIONS: &str = "InitializingRegions";
    pub const OPTING_IN_REGIONS: &str = "OptingInRegions";
    pub const OPT_IN_REGIONS_ENABLED: &str = "OptInRegionsEnabled";
    pub const CLAIMED: &str = "Claimed";
    pub const CREATION_FAILED: &str = "AccountCreationFailed";
    pub const CLIENT_ERROR: &str = "AccountClientError";
    pub const AUTHORIZATION_ERROR: &str = "AuthorizationError";
    pub const AUTHENTICATION_ERROR: &str = "AuthenticationError";
    pub const UNHANDLED_ERROR: &str = "UnhandledError";
    pub const INTERNAL_ERROR: &str = "InternalError";
    pub const QUOTA_DENIED: &str = "QuotaDenied";
}

/// Requeue returned after marking an account Failed
///
/// A lost Failed write is retried from a fresh copy; a stored Failed
/// account is ignored on the next pass.
pub const FAILED_REQUEUE: Duration = Duration::from_secs(1);

/// Condition status values
pub mod condition_status {
    pub const TRUE: &str = "True";
    pub const FALSE: &str = "False";
}

/// When an existing condition with an unchanged status is rewritten
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateConditionMode {
    Always,
    Never,
    IfReasonOrMessageChange,
}

impl UpdateConditionMode {
    fn allows(self, existing: &Condition, reason: &str, message: &str) -> bool {
        match self {
            UpdateConditionMode::Always => true,
            UpdateConditionMode::Never => false,
            UpdateConditionMode::IfReasonOrMessageChange => {
                existing.reason != reason || existing.message != message
            }
        }
    }
}

/// Set a condition, adding it only if it is True
///
/// A status change always rewrites the condition and moves its transition
/// time. Otherwise `mode` decides whether reason and message are replaced.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: &str,
    reason: &str,
    message: &str,
    mode: UpdateConditionMode,
) {
    let now = Utc::now().to_rfc3339();

    match conditions.iter_mut().find(|c| c.type_ == type_) {
        Some(existing) => {
            if existing.status != status || mode.allows(existing, reason, message) {
                if existing.status != status {
                    existing.last_transition_time = now.clone();
                }
                existing.status = status.to_string();
                existing.reason = reason.to_string();
                existing.message = message.to_string();
            }
            existing.last_probe_time = now;
        }
        None if status == condition_status::TRUE => conditions.push(Condition {
            type_: type_.to_string(),
            status: status.to_string(),
            reason: reason.to_string(),
            message: message.to_string(),
            last_probe_time: now.clone(),
            last_transition_time: now,
        }),
        None => {}
    }
}

fn status_mut(account: &mut Account) -> &mut AccountStatus {
    account.status.get_or_insert_with(AccountStatus::default)
}

/// Set an account condition
pub fn set_account_condition(
    account: &mut Account,
    type_: &str,
    status: &str,
    reason: &str,
    message: &str,
    mode: UpdateConditionMode,
) {
    set_condition(
        &mut status_mut(account).conditions,
        type_,
        status,
        reason,
        message,
        mode,
    );
}

/// Record a state change with its condition, reason being the state name
pub fn set_account_status(account: &mut Account, message: &str, type_: &str, state: AccountState) {
    set_account_condition(
        account,
        type_,
        condition_status::TRUE,
        &state.to_string(),
        message,
        UpdateConditionMode::Never,
    );
    status_mut(account).state = Some(state);
    info!(
        "Transitioned account {}/{} to state {}",
        account.namespace().unwrap_or_default(),
        account.name_any(),
        state
    );
}

/// Mark the account claimed and record who claimed it
pub fn claim_account(account: &mut Account) {
    let message = format!(
        "Account {} was claimed: {} (Namespace: {})",
        account.name_any(),
        account.spec.claim_link,
        account.spec.claim_link_namespace
    );
    status_mut(account).claimed = true;
    set_account_condition(
        account,
        condition_types::CLAIMED,
        condition_status::TRUE,
        "Claimed",
        &message,
        UpdateConditionMode::Always,
    );
}

/// Record a failure on the claim consuming this account
///
/// A claim that no longer exists is not an error.
pub async fn propagate_claim_error(
    store: &dyn AccountStore,
    account: &Account,
    reason: &str,
    message: &str,
) -> Result<()> {
    if !account.has_claim_link() {
        return Ok(());
    }

    let mut claim = match store
        .get_claim(&account.spec.claim_link_namespace, &account.spec.claim_link)
        .await
    {
        Ok(claim) => claim,
        Err(e) if e.is_not_found() => {
            warn!(
                "Claim {} for account {} no longer exists",
                account.spec.claim_link,
                account.name_any()
            );
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    mark_claim_error(&mut claim, reason, message);
    store.update_claim_status(&claim).await?;
    Ok(())
}

/// Switch every claim condition off and record the error
pub fn mark_claim_error(claim: &mut AccountClaim, reason: &str, message: &str) {
    let status = claim.status.get_or_insert_with(Default::default);
    let now = Utc::now().to_rfc3339();
    for condition in status.conditions.iter_mut() {
        if condition.status != condition_status::FALSE {
            condition.status = condition_status::FALSE.to_string();
            condition.last_transition_time = now.clone();
        }
        condition.last_probe_time = now.clone();
    }
    set_condition(
        &mut status.conditions,
        condition_types::INTERNAL_ERROR,
        condition_status::TRUE,
        reason,
        message,
        UpdateConditionMode::IfReasonOrMessageChange,
    );
    status.state = Some(ClaimState::Error);
}

/// Mark the account Failed, tell its claim, and write the status
///
/// Write failures are only logged. The returned action always requeues so a
/// lost write is attempted again; callers return it as is.
pub async fn set_failed(
    store: &dyn AccountStore,
    account: &mut Account,
    type_: &str,
    reason: &str,
    message: &str,
) -> Result<Action> {
    info!("{}", message);
    set_account_condition(
        account,
        type_,
        condition_status::TRUE,
        reason,
        message,
        UpdateConditionMode::Never,
    );
    status_mut(account).state = Some(AccountState::Failed);

    propagate_claim_error(store, account, reason, message).await?;

    match store.update_account_status(account).await {
        Ok(updated) => *account = updated,
        Err(e) => error!("Failed to update account status: {}", e),
    }
    Ok(Action::requeue(FAILED_REQUEUE))
}
