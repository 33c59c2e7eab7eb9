//! End-to-end lifecycles of pooled, customer and STS accounts

use std::collections::BTreeMap;
use std::time::Duration;

use kube::runtime::controller::Action;

use account_operator::OperatorConfig;
use account_operator::cloud::codes;
use account_operator::controller::condition_types;
use account_operator::controller::status::FAILED_REQUEUE;
use account_operator::controller::iam::ADMIN_ACCESS_POLICY_ARN;
use account_operator::crd::{ACCOUNT_FINALIZER, AccountState, ORGANIZATION_ACCESS_ROLE};
use account_operator::store::AccountStore;

use crate::common::*;

const POOLED: &str = "osd-creds-mgmt-abc123";
const BYOC: &str = "byoc-acct";
const BYOC_ID: &str = "111122223333";

fn is_state(state: AccountState) -> impl Fn(&account_operator::Account) -> bool {
    move |a| a.state() == Some(state)
}

#[tokio::test(start_paused = true)]
async fn test_pooled_account_reaches_ready_and_is_claimed() {
    let h = Harness::new(operator_config());
    h.store.insert_account(AccountBuilder::new(POOLED).build());

    // Creation and the iamUserId label happen in the first pass
    let action = h.reconcile(POOLED).await.unwrap();
    assert_eq!(action, Action::requeue(Duration::from_secs(1)));
    let account = h.account(POOLED);
    assert_eq!(account.spec.aws_account_id, ACCOUNT_ID);
    assert_eq!(account.state(), Some(AccountState::Creating));
    assert!(account.has_finalizer(ACCOUNT_FINALIZER));
    assert!(account.iam_user_id().is_some());
    assert_eq!(h.cloud.count("create_account"), 1);
    assert_eq!(h.cloud.with(|s| s.tagged_accounts.len()), 1);

    // Credentials, then region workers
    let action = h.reconcile(POOLED).await.unwrap();
    assert_eq!(action, Action::await_change());
    let account = h.account(POOLED);
    assert_eq!(account.spec.iam_user_secret, "osd-creds-mgmt-abc123-secret");
    let secret = h
        .store
        .secret(NAMESPACE, "osd-creds-mgmt-abc123-secret")
        .unwrap();
    assert!(secret.contains_key("aws_access_key_id"));
    assert_eq!(h.assumer.roles()[0], ORGANIZATION_ACCESS_ROLE);

    let account = h
        .wait_until(POOLED, is_state(AccountState::PendingVerification))
        .await;
    let condition = account
        .get_condition(condition_types::INITIALIZING_REGIONS)
        .unwrap();
    assert_eq!(condition.status, "False");
    assert_eq!(h.cloud.with(|s| s.launched.len()), 1);
    assert_eq!(h.cloud.with(|s| s.terminated.len()), 1);

    // A support case is opened, then polled
    let action = h.reconcile(POOLED).await.unwrap();
    assert_eq!(
        action,
        Action::requeue(Duration::from_secs(30 + 123456789012 % 30))
    );
    assert!(h.account(POOLED).has_support_case_id());
    assert_eq!(h.cloud.count("create_case"), 1);

    let action = h.reconcile(POOLED).await.unwrap();
    assert_eq!(action, Action::requeue(Duration::from_secs(600)));
    assert_eq!(h.account(POOLED).state(), Some(AccountState::PendingVerification));

    h.cloud.with(|s| s.case_status = "resolved".to_string());
    let action = h.reconcile(POOLED).await.unwrap();
    assert_eq!(action, Action::await_change());
    let account = h.account(POOLED);
    assert_eq!(account.state(), Some(AccountState::Ready));
    assert!(account.get_condition(condition_types::READY).is_some());
    assert_eq!(h.cloud.count("create_case"), 1);

    // The claim controller links a claim; the account records it
    let mut linked = h.account(POOLED);
    linked.spec.claim_link = "cluster-claim".to_string();
    linked.spec.claim_link_namespace = CLAIM_NAMESPACE.to_string();
    h.store.update_account(&linked).await.unwrap();

    h.reconcile(POOLED).await.unwrap();
    let account = h.account(POOLED);
    assert!(account.is_claimed());
    let claimed = account.get_condition(condition_types::CLAIMED).unwrap();
    assert!(claimed.message.contains("cluster-claim"));
}

#[tokio::test(start_paused = true)]
async fn test_byoc_account_becomes_ready_without_verification() {
    let h = Harness::new(operator_config());
    h.store.insert_claim(
        ClaimBuilder::new("byoc-claim")
            .byoc(BYOC_ID)
            .with_regions(&["us-east-1"])
            .build(),
    );
    h.store.insert_account(
        AccountBuilder::new(BYOC)
            .byoc()
            .with_claim_link("byoc-claim", CLAIM_NAMESPACE)
            .build(),
    );

    let action = h.reconcile(BYOC).await.unwrap();
    assert_eq!(action, Action::requeue(Duration::from_secs(1)));
    let account = h.account(BYOC);
    assert_eq!(account.spec.aws_account_id, BYOC_ID);
    assert_eq!(account.state(), Some(AccountState::Creating));
    assert!(account.is_claimed());
    assert_eq!(h.cloud.count("create_account"), 0);

    h.reconcile(BYOC).await.unwrap();
    let id = h.account(BYOC).iam_user_id().unwrap().to_string();
    let support_role = format!("ManagedOpenShift-Support-{}", id);

    assert!(h.assumer.roles().contains(&support_role));
    let policies = h
        .cloud
        .with(|s| s.role_policies.get(&support_role).cloned().unwrap_or_default());
    assert_eq!(policies, vec![ADMIN_ACCESS_POLICY_ARN.to_string()]);

    let account = h.wait_until(BYOC, is_state(AccountState::Ready)).await;
    let ready = account.get_condition(condition_types::READY).unwrap();
    assert_eq!(ready.message, "BYOC Account Ready");
    assert_eq!(h.cloud.count("create_case"), 0);

    // Nothing left to do
    assert_eq!(h.reconcile(BYOC).await.unwrap(), Action::await_change());
}

#[tokio::test(start_paused = true)]
async fn test_byoc_tags_and_kms_key_reach_created_resources() {
    let config = OperatorConfig {
        managed_tags: BTreeMap::from([("red-hat-managed".to_string(), "true".to_string())]),
        ..operator_config()
    };
    let h = Harness::new(config);
    h.store.insert_claim(
        ClaimBuilder::new("byoc-claim")
            .byoc(BYOC_ID)
            .with_regions(&["us-east-1"])
            .with_custom_tags("cost-center=42\nclusterAccountName=spoofed\n")
            .with_kms_key("arn:aws:kms:us-east-1:111122223333:key/abcd")
            .build(),
    );
    h.store.insert_account(
        AccountBuilder::new(BYOC)
            .byoc()
            .with_claim_link("byoc-claim", CLAIM_NAMESPACE)
            .build(),
    );

    h.reconcile(BYOC).await.unwrap();
    h.reconcile(BYOC).await.unwrap();
    h.wait_until(BYOC, is_state(AccountState::Ready)).await;

    let id = h.account(BYOC).iam_user_id().unwrap().to_string();
    let role_tags = h.cloud.with(|s| {
        s.roles[&format!("ManagedOpenShift-Support-{}", id)]
            .tags
            .clone()
    });
    assert_eq!(role_tags["red-hat-managed"], "true");
    assert_eq!(role_tags["cost-center"], "42");
    assert_eq!(role_tags["clusterAccountName"], BYOC);

    let launched = h.cloud.with(|s| s.launched.clone());
    assert_eq!(launched.len(), 1);
    let request = &launched[0].1;
    assert_eq!(
        request.kms_key_id.as_deref(),
        Some("arn:aws:kms:us-east-1:111122223333:key/abcd")
    );
    assert_eq!(request.tags["cost-center"], "42");
    assert_eq!(request.tags["red-hat-managed"], "true");
}

#[tokio::test(start_paused = true)]
async fn test_pooled_admin_user_carries_managed_tags() {
    let config = OperatorConfig {
        managed_tags: BTreeMap::from([("red-hat-managed".to_string(), "true".to_string())]),
        ..operator_config()
    };
    let h = Harness::new(config);
    h.store.insert_account(AccountBuilder::new(POOLED).build());

    h.reconcile(POOLED).await.unwrap();
    h.reconcile(POOLED).await.unwrap();

    let users = h.cloud.with(|s| s.users.clone());
    assert_eq!(users.len(), 1);
    let user = users.values().next().unwrap();
    assert_eq!(user.tags["red-hat-managed"], "true");
    assert_eq!(user.tags["clusterAccountName"], POOLED);

    h.wait_until(POOLED, is_state(AccountState::PendingVerification))
        .await;
    let launched = h.cloud.with(|s| s.launched.clone());
    assert_eq!(launched[0].1.kms_key_id, None);
    assert_eq!(launched[0].1.tags["red-hat-managed"], "true");
}

#[tokio::test(start_paused = true)]
async fn test_byoc_region_outside_enabled_set_is_rejected() {
    let h = Harness::new(operator_config());
    h.store.insert_claim(
        ClaimBuilder::new("byoc-claim")
            .byoc(BYOC_ID)
            .with_regions(&["ap-fake-1"])
            .build(),
    );
    h.store.insert_account(
        AccountBuilder::new(BYOC)
            .byoc()
            .with_claim_link("byoc-claim", CLAIM_NAMESPACE)
            .build(),
    );

    h.reconcile(BYOC).await.unwrap();
    let err = h.reconcile(BYOC).await.unwrap_err();
    assert!(err.to_string().contains("ap-fake-1"));

    let account = h.account(BYOC);
    let condition = account
        .get_condition(condition_types::INITIALIZING_REGIONS)
        .unwrap();
    assert!(condition.message.contains("is not supported"));
    assert_eq!(h.cloud.count("run_instance"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_byoc_claim_without_secret_fails_account() {
    let h = Harness::new(operator_config());
    h.store.insert_claim(
        ClaimBuilder::new("byoc-claim")
            .byoc(BYOC_ID)
            .without_secret_ref()
            .build(),
    );
    h.store.insert_account(
        AccountBuilder::new(BYOC)
            .byoc()
            .with_claim_link("byoc-claim", CLAIM_NAMESPACE)
            .build(),
    );

    assert!(h.reconcile(BYOC).await.is_err());
    let account = h.account(BYOC);
    assert!(account.is_failed());
    let failed = account
        .get_condition(condition_types::CREATION_FAILED)
        .unwrap();
    assert!(failed.reason.contains("byocSecretRef"));

    // The claim hears about it
    let claim = h.store.claim(CLAIM_NAMESPACE, "byoc-claim").unwrap();
    assert_eq!(
        claim.status.and_then(|s| s.state),
        Some(account_operator::crd::ClaimState::Error)
    );
}

#[tokio::test(start_paused = true)]
async fn test_manual_sts_account_skips_iam_user_and_finalizer() {
    let h = Harness::new(operator_config());
    h.store.insert_claim(ClaimBuilder::new("sts-claim").build());
    h.store.insert_account(
        AccountBuilder::new("sts-acct")
            .manual_sts()
            .with_account_id(ACCOUNT_ID)
            .with_claim_link("sts-claim", CLAIM_NAMESPACE)
            .with_state(AccountState::Creating)
            .build(),
    );

    h.reconcile("sts-acct").await.unwrap();
    let account = h
        .wait_until("sts-acct", |a| a.state() != Some(AccountState::Creating))
        .await;
    assert!(!account.has_finalizer(ACCOUNT_FINALIZER));
    assert_eq!(h.cloud.count("create_user"), 0);
    assert!(
        h.assumer
            .roles()
            .iter()
            .all(|r| r.starts_with("ManagedOpenShift-Support"))
    );
}

#[tokio::test(start_paused = true)]
async fn test_manual_sts_account_with_missing_claim_errors() {
    let h = Harness::new(operator_config());
    h.store.insert_account(
        AccountBuilder::new("sts-acct")
            .manual_sts()
            .with_account_id(ACCOUNT_ID)
            .with_claim_link("gone", CLAIM_NAMESPACE)
            .with_state(AccountState::Creating)
            .build(),
    );

    let err = h.reconcile("sts-acct").await.unwrap_err();
    assert!(err.is_not_found());
    assert!(h.assumer.roles().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_account_limit_defers_creation() {
    let config = OperatorConfig {
        account_limit: Some(1),
        ..operator_config()
    };
    let h = Harness::new(config);
    h.store.insert_account(
        AccountBuilder::new("existing")
            .with_account_id("999999999999")
            .with_state(AccountState::Ready)
            .build(),
    );
    h.store.insert_account(AccountBuilder::new(POOLED).build());

    let action = h.reconcile(POOLED).await.unwrap();
    assert_eq!(action, Action::requeue(Duration::from_secs(300)));
    assert_eq!(h.cloud.count("create_account"), 0);
    assert!(!h.account(POOLED).has_state());
}

#[tokio::test(start_paused = true)]
async fn test_existing_account_id_is_not_recreated() {
    let h = Harness::new(operator_config());
    h.store
        .insert_account(AccountBuilder::new(POOLED).with_account_id(ACCOUNT_ID).build());

    h.reconcile(POOLED).await.unwrap();
    let account = h.account(POOLED);
    assert_eq!(account.state(), Some(AccountState::Creating));
    assert_eq!(
        account
            .get_condition(condition_types::CREATING)
            .unwrap()
            .message,
        "AWS account already created"
    );
    assert_eq!(h.cloud.count("create_account"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_creating_too_long_fails() {
    let h = Harness::new(operator_config());
    let long_ago = chrono::Utc::now() - chrono::Duration::minutes(30);
    h.store.insert_account(
        AccountBuilder::new(POOLED)
            .with_account_id(ACCOUNT_ID)
            .with_iam_user_id("abc123")
            .with_finalizer(ACCOUNT_FINALIZER)
            .with_state(AccountState::Creating)
            .with_condition(condition_at(condition_types::CREATING, "True", long_ago))
            .build(),
    );

    let action = h.reconcile(POOLED).await.unwrap();
    assert_eq!(action, Action::requeue(FAILED_REQUEUE));
    let account = h.account(POOLED);
    assert!(account.is_failed());
    let failed = account
        .get_condition(condition_types::CREATION_FAILED)
        .unwrap();
    assert_eq!(failed.reason, "CreationTimeout");
    assert_eq!(failed.message, "Creation pending for longer than 25 minutes");
}

#[tokio::test(start_paused = true)]
async fn test_lost_failed_write_is_retried() {
    let h = Harness::new(operator_config());
    let long_ago = chrono::Utc::now() - chrono::Duration::minutes(30);
    h.store.insert_account(
        AccountBuilder::new(POOLED)
            .with_account_id(ACCOUNT_ID)
            .with_iam_user_id("abc123")
            .with_finalizer(ACCOUNT_FINALIZER)
            .with_state(AccountState::Creating)
            .with_condition(condition_at(condition_types::CREATING, "True", long_ago))
            .build(),
    );
    let mut stale = h.account(POOLED);
    stale.metadata.resource_version = Some("0".to_string());

    let action = h.reconcile_copy(stale).await.unwrap();
    assert_eq!(action, Action::requeue(FAILED_REQUEUE));
    assert_eq!(h.account(POOLED).state(), Some(AccountState::Creating));

    // The requeued pass works from a fresh copy
    assert_eq!(
        h.reconcile(POOLED).await.unwrap(),
        Action::requeue(FAILED_REQUEUE)
    );
    let account = h.account(POOLED);
    assert!(account.is_failed());
    assert_eq!(
        account
            .get_condition(condition_types::CREATION_FAILED)
            .unwrap()
            .reason,
        "CreationTimeout"
    );
}

#[tokio::test(start_paused = true)]
async fn test_ready_byoc_account_is_claimed_once() {
    let h = Harness::new(operator_config());
    h.store.insert_claim(ClaimBuilder::new("byoc-claim").byoc(BYOC_ID).build());
    h.store.insert_account(
        AccountBuilder::new(BYOC)
            .byoc()
            .with_account_id(BYOC_ID)
            .with_iam_user_id("byoc01")
            .with_finalizer(ACCOUNT_FINALIZER)
            .with_claim_link("byoc-claim", CLAIM_NAMESPACE)
            .with_state(AccountState::Ready)
            .build(),
    );

    assert_eq!(h.reconcile(BYOC).await.unwrap(), Action::await_change());
    let writes = h.store.status_writes();
    assert_eq!(h.reconcile(BYOC).await.unwrap(), Action::await_change());

    let account = h.account(BYOC);
    assert!(account.is_claimed());
    assert_eq!(account.state(), Some(AccountState::Ready));
    let claimed: Vec<_> = account
        .status
        .as_ref()
        .unwrap()
        .conditions
        .iter()
        .filter(|c| c.type_ == condition_types::CLAIMED)
        .collect();
    assert_eq!(claimed.len(), 1);
    assert!(claimed[0].message.contains("byoc-claim"));
    assert_eq!(h.store.status_writes(), writes);
    assert!(h.cloud.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failed_account_is_left_alone() {
    let h = Harness::new(operator_config());
    h.store.insert_account(
        AccountBuilder::new(POOLED)
            .with_account_id(ACCOUNT_ID)
            .with_finalizer(ACCOUNT_FINALIZER)
            .with_state(AccountState::Failed)
            .build(),
    );
    let writes = h.store.status_writes();

    assert_eq!(h.reconcile(POOLED).await.unwrap(), Action::await_change());
    assert!(h.cloud.calls().is_empty());
    assert_eq!(h.store.status_writes(), writes);
}

#[tokio::test(start_paused = true)]
async fn test_iam_access_denied_marks_authorization_error() {
    let h = Harness::new(operator_config());
    h.cloud.fail("create_user", codes::ACCESS_DENIED);
    h.store.insert_account(
        AccountBuilder::new(POOLED)
            .with_account_id(ACCOUNT_ID)
            .with_iam_user_id("abc123")
            .with_finalizer(ACCOUNT_FINALIZER)
            .with_state(AccountState::Creating)
            .build(),
    );

    let err = h.reconcile(POOLED).await.unwrap_err();
    assert_eq!(err.cloud_code(), Some(codes::ACCESS_DENIED));
    let account = h.account(POOLED);
    assert!(account.is_failed());
    let condition = account
        .get_condition(condition_types::AUTHORIZATION_ERROR)
        .unwrap();
    assert_eq!(condition.reason, "AccessDenied");
}

#[tokio::test(start_paused = true)]
async fn test_missing_ami_owner_is_retried_not_failed() {
    let config = OperatorConfig {
        ami_owner: None,
        ..operator_config()
    };
    let h = Harness::new(config);
    h.store.insert_account(
        AccountBuilder::new(POOLED)
            .with_account_id(ACCOUNT_ID)
            .with_iam_user_id("abc123")
            .with_finalizer(ACCOUNT_FINALIZER)
            .with_state(AccountState::Creating)
            .build(),
    );

    let err = h.reconcile(POOLED).await.unwrap_err();
    assert!(!err.is_retryable());
    assert_eq!(h.account(POOLED).state(), Some(AccountState::Creating));
}
