//! Declarative store seam
//!
//! Accounts and claims are read and written through [`AccountStore`]. Every
//! write carries the resourceVersion of the copy it was computed from, and a
//! stale copy is rejected with [`Error::Conflict`]. Callers never retry a
//! rejected write with the same object; they re-read first.

mod kubernetes;

pub use self::kubernetes::KubeStore;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::{debug, warn};

use crate::config::OperatorConfig;
use crate::controller::error::{Error, Result};
use crate::crd::{Account, AccountClaim, AccountStatus};

/// Attempts made by [`update_status_with_retry`] before giving up
pub const STATUS_UPDATE_ATTEMPTS: u32 = 5;

/// Store operations used by the account controller
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn get_account(&self, namespace: &str, name: &str) -> Result<Account>;

    /// Replace metadata and spec, failing with `Conflict` on a stale copy
    async fn update_account(&self, account: &Account) -> Result<Account>;

    /// Replace the status subresource, failing with `Conflict` on a stale copy
    async fn update_account_status(&self, account: &Account) -> Result<Account>;

    async fn list_accounts(&self, namespace: &str) -> Result<Vec<Account>>;

    async fn get_claim(&self, namespace: &str, name: &str) -> Result<AccountClaim>;

    async fn update_claim_status(&self, claim: &AccountClaim) -> Result<AccountClaim>;

    async fn secret_exists(&self, namespace: &str, name: &str) -> Result<bool>;

    /// Create a secret owned by `owner` in the owner's namespace
    async fn create_secret(
        &self,
        owner: &Account,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<()>;

    /// Current operator configuration
    async fn operator_config(&self) -> Result<OperatorConfig>;
}

/// Apply `mutate` to a freshly read account status and write it back,
/// re-reading and retrying when the write loses a version race.
///
/// `mutate` returns false when the fresh copy needs no write. Returns the
/// stored account, or `NotFound` if it disappeared meanwhile.
pub async fn update_status_with_retry<F>(
    store: &dyn AccountStore,
    namespace: &str,
    name: &str,
    mut mutate: F,
) -> Result<Account>
where
    F: FnMut(&mut Account) -> bool + Send,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let mut fresh = store.get_account(namespace, name).await?;
        if fresh.status.is_none() {
            fresh.status = Some(AccountStatus::default());
        }
        if !mutate(&mut fresh) {
            return Ok(fresh);
        }

        match store.update_account_status(&fresh).await {
            Ok(updated) => return Ok(updated),
            Err(e) if e.is_conflict() && attempt < STATUS_UPDATE_ATTEMPTS => {
                debug!(
                    "Status update of {} conflicted (attempt {}), re-reading",
                    fresh.name_any(),
                    attempt
                );
                tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
            }
            Err(e) => {
                warn!("Status update of {} failed: {}", name, e);
                return Err(e);
            }
        }
    }
}

/// `namespace/name` of an account, for error messages
pub fn account_key(account: &Account) -> String {
    format!(
        "{}/{}",
        account.namespace().unwrap_or_default(),
        account.name_any()
    )
}

/// Build a `NotFound` error for a missing object
pub fn not_found(kind: &str, namespace: &str, name: &str) -> Error {
    Error::NotFound(format!("{} {}/{}", kind, namespace, name))
}
