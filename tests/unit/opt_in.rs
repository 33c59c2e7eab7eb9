use std::time::Duration;

use kube::runtime::controller::Action;

use account_operator::cloud::codes;
use account_operator::controller::condition_types;
use account_operator::controller::opt_in::{
    OPT_IN_POLL_INTERVAL, OptInOutcome, handle_opt_in_request, select_opt_in_batch,
};
use account_operator::crd::{
    ACCOUNT_FINALIZER, AccountState, OptInRegionStatus, ServiceRequestStatus,
};

use crate::common::*;

const NAME: &str = "osd-creds-mgmt-optin1";

fn ready() -> AccountBuilder {
    AccountBuilder::new(NAME)
        .with_account_id(ACCOUNT_ID)
        .with_iam_user_id("optin1")
        .with_finalizer(ACCOUNT_FINALIZER)
        .with_state(AccountState::Ready)
        .with_condition(condition_at(
            condition_types::READY,
            "True",
            chrono::Utc::now(),
        ))
}

fn opt_in_status(account: &account_operator::Account, region: &str) -> Option<ServiceRequestStatus> {
    account
        .status
        .as_ref()
        .and_then(|s| s.opt_in_regions.get(region))
        .map(|r| r.status)
}

#[tokio::test(start_paused = true)]
async fn test_opt_in_flow_ends_with_regions_reinitialized() {
    let h = Harness::new(opt_in_config(&["af-south-1", "ap-east-1"]));
    h.store.insert_account(ready().build());

    let action = h.reconcile(NAME).await.unwrap();
    assert_eq!(action, Action::requeue(OPT_IN_POLL_INTERVAL));
    let account = h.account(NAME);
    assert_eq!(account.state(), Some(AccountState::OptingInRegions));
    assert_eq!(
        opt_in_status(&account, "af-south-1"),
        Some(ServiceRequestStatus::InProgress)
    );
    assert_eq!(
        h.cloud.with(|s| s.enabled.clone()),
        vec!["af-south-1", "ap-east-1"]
    );

    // Still enabling: polled, not requested again
    assert_eq!(
        h.reconcile(NAME).await.unwrap(),
        Action::requeue(OPT_IN_POLL_INTERVAL)
    );
    assert_eq!(h.cloud.count("enable_region"), 2);

    h.cloud.with(|s| {
        for status in s.opt_status.values_mut() {
            *status = "ENABLED".to_string();
        }
        s.enabled_regions = vec![
            "us-east-1".to_string(),
            "af-south-1".to_string(),
            "ap-east-1".to_string(),
        ];
    });
    assert_eq!(h.reconcile(NAME).await.unwrap(), Action::await_change());
    let account = h.account(NAME);
    assert_eq!(account.state(), Some(AccountState::OptInRegionsEnabled));
    assert!(
        account
            .get_condition(condition_types::OPT_IN_REGIONS_ENABLED)
            .is_some()
    );

    // Newly enabled regions get initialized, then the account is Ready again
    h.reconcile(NAME).await.unwrap();
    assert!(h.account(NAME).is_initializing_regions());
    let account = h.wait_until(NAME, |a| a.is_ready()).await;
    assert_eq!(
        opt_in_status(&account, "ap-east-1"),
        Some(ServiceRequestStatus::Completed)
    );
    assert_eq!(h.cloud.with(|s| s.launched.len()), 3);
}

#[tokio::test(start_paused = true)]
async fn test_fleet_ceiling_defers_new_opt_ins() {
    let h = Harness::new(opt_in_config(&["af-south-1"]));
    for i in 0..9 {
        h.store.insert_account(
            AccountBuilder::new(&format!("busy-{}", i))
                .with_state(AccountState::OptingInRegions)
                .build(),
        );
    }
    h.store.insert_account(ready().build());

    let action = h.reconcile(NAME).await.unwrap();
    assert_eq!(action, Action::requeue(Duration::from_secs(600)));
    let account = h.account(NAME);
    assert_eq!(account.state(), Some(AccountState::Ready));
    assert_eq!(opt_in_status(&account, "af-south-1"), None);
    assert_eq!(h.cloud.count("enable_region"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_account_ceiling_limits_requests_in_flight() {
    let regions = [
        "af-south-1",
        "ap-east-1",
        "ap-south-2",
        "ap-southeast-3",
        "eu-central-2",
        "eu-south-1",
        "me-central-1",
        "me-south-1",
    ];
    let h = Harness::new(opt_in_config(&regions));
    h.store.insert_account(ready().build());

    h.reconcile(NAME).await.unwrap();

    let account = h.account(NAME);
    let in_progress = account.opt_in_requests_by_status(ServiceRequestStatus::InProgress);
    let todo = account.opt_in_requests_by_status(ServiceRequestStatus::Todo);
    assert_eq!(in_progress.len(), 6);
    assert_eq!(todo, vec!["me-central-1", "me-south-1"]);
    assert_eq!(h.cloud.count("enable_region"), 6);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_region_code_is_dropped() {
    let h = Harness::new(opt_in_config(&["af-south-1", "xx-bad-1"]));
    h.cloud
        .fail("get_region_opt_status@xx-bad-1", codes::VALIDATION_EXCEPTION);
    h.store.insert_account(ready().build());

    h.reconcile(NAME).await.unwrap();

    let account = h.account(NAME);
    assert_eq!(opt_in_status(&account, "xx-bad-1"), None);
    assert_eq!(
        opt_in_status(&account, "af-south-1"),
        Some(ServiceRequestStatus::InProgress)
    );
}

#[tokio::test(start_paused = true)]
async fn test_regions_enabled_by_default_complete_immediately() {
    let h = Harness::new(opt_in_config(&["ap-east-1"]));
    h.cloud.with(|s| {
        s.opt_status
            .insert("ap-east-1".to_string(), "ENABLED_BY_DEFAULT".to_string())
    });
    h.store.insert_account(ready().build());

    assert_eq!(h.reconcile(NAME).await.unwrap(), Action::await_change());
    let account = h.account(NAME);
    assert_eq!(account.state(), Some(AccountState::OptInRegionsEnabled));
    assert_eq!(h.cloud.count("enable_region"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_opt_in_needs_feature_flag() {
    let h = Harness::new(operator_config());
    h.store.insert_account(ready().build());

    assert_eq!(h.reconcile(NAME).await.unwrap(), Action::await_change());
    assert_eq!(h.account(NAME).state(), Some(AccountState::Ready));
    assert!(h.cloud.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_claimed_account_is_not_opted_in() {
    let h = Harness::new(opt_in_config(&["af-south-1"]));
    h.store.insert_account(
        ready()
            .claimed()
            .with_claim_link("claim", CLAIM_NAMESPACE)
            .build(),
    );

    assert_eq!(h.reconcile(NAME).await.unwrap(), Action::await_change());
    assert_eq!(h.account(NAME).state(), Some(AccountState::Ready));
    assert_eq!(h.cloud.count("get_region_opt_status"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_already_requested_region_moves_to_in_progress() {
    let cloud = FakeCloud::new();
    cloud.fail("enable_region", codes::RESOURCE_ALREADY_EXISTS);
    let client = cloud.in_region("af-south-1");

    let mut entry = OptInRegionStatus::default();
    let outcome = handle_opt_in_request(client.as_ref(), "af-south-1", &mut entry)
        .await
        .unwrap();
    assert_eq!(outcome, OptInOutcome::Keep);
    assert_eq!(entry.status, ServiceRequestStatus::InProgress);
}

#[test]
fn test_batch_fills_remaining_room_in_region_order() {
    let account = AccountBuilder::new(NAME)
        .with_state(AccountState::OptingInRegions)
        .with_opt_in("ap-east-1", ServiceRequestStatus::Todo)
        .with_opt_in("af-south-1", ServiceRequestStatus::InProgress)
        .with_opt_in("eu-south-1", ServiceRequestStatus::Todo)
        .with_opt_in("me-south-1", ServiceRequestStatus::Completed)
        .build();

    assert_eq!(
        select_opt_in_batch(&account, 2),
        vec!["af-south-1".to_string(), "ap-east-1".to_string()]
    );
    assert_eq!(select_opt_in_batch(&account, 0), vec!["af-south-1".to_string()]);
}
