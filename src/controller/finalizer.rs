//! Finalizer bookkeeping for Account resources

use std::time::Duration;

use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::controller::error::{Error, Result};
use crate::crd::{ACCOUNT_FINALIZER, Account};
use crate::store::AccountStore;

/// Add or remove the account finalizer on a copy, returning whether it changed
fn apply(account: &mut Account, present: bool) -> bool {
    let finalizers = account.metadata.finalizers.get_or_insert_with(Vec::new);
    let has = finalizers.iter().any(|f| f == ACCOUNT_FINALIZER);
    match (present, has) {
        (true, false) => {
            finalizers.push(ACCOUNT_FINALIZER.to_string());
            true
        }
        (false, true) => {
            finalizers.retain(|f| f != ACCOUNT_FINALIZER);
            true
        }
        _ => false,
    }
}

async fn set_finalizer(
    store: &dyn AccountStore,
    account: &mut Account,
    present: bool,
    retries: u32,
    backoff: Duration,
) -> Result<()> {
    let namespace = account
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let name = account.name_any();

    let mut attempt = 0;
    loop {
        if !apply(account, present) {
            return Ok(());
        }
        match store.update_account(account).await {
            Ok(updated) => {
                *account = updated;
                return Ok(());
            }
            Err(e) if e.is_not_found() => {
                debug!("Account {} is gone, nothing to finalize", name);
                return Ok(());
            }
            Err(e) if e.is_conflict() && attempt + 1 < retries => {
                debug!("Finalizer update of {} conflicted (attempt {})", name, attempt + 1);
                tokio::time::sleep(backoff * (attempt + 1)).await;
                attempt += 1;
                *account = match store.get_account(&namespace, &name).await {
                    Ok(fresh) => fresh,
                    Err(e) if e.is_not_found() => return Ok(()),
                    Err(e) => return Err(e),
                };
            }
            Err(e) => {
                warn!("Failed to update finalizers of {}: {}", name, e);
                return Err(Error::FinalizerError(e.to_string()));
            }
        }
    }
}

/// Ensure the account carries the finalizer
pub async fn add_finalizer(
    store: &dyn AccountStore,
    account: &mut Account,
    retries: u32,
    backoff: Duration,
) -> Result<()> {
    if account.has_finalizer(ACCOUNT_FINALIZER) {
        return Ok(());
    }
    set_finalizer(store, account, true, retries, backoff).await?;
    info!("Added finalizer to {}", account.name_any());
    Ok(())
}

/// Drop the finalizer so deletion can proceed
pub async fn remove_finalizer(
    store: &dyn AccountStore,
    account: &mut Account,
    retries: u32,
    backoff: Duration,
) -> Result<()> {
    if !account.has_finalizer(ACCOUNT_FINALIZER) {
        return Ok(());
    }
    set_finalizer(store, account, false, retries, backoff).await?;
    info!("Removed finalizer from {}", account.name_any());
    Ok(())
}
