// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Property-based tests for the pure decision helpers
//!
//! These tests use proptest to generate random inputs and verify that:
//! 1. Image selection is deterministic and never picks an excluded image
//! 2. Opt-in batches respect the per-account ceiling
//! 3. The state machine never panics and Failed stays terminal
//! 4. Quota snapshots never name a region the provider does not know

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use proptest::prelude::*;

use account_operator::cloud::MachineImage;
use account_operator::controller::account_creation::account_email;
use account_operator::controller::opt_in::{map_opt_status, select_opt_in_batch};
use account_operator::controller::region_init::select_image;
use account_operator::controller::service_quota::{case_creation_requeue, snapshot_quotas};
use account_operator::controller::state_machine::{
    AccountEvent, AccountStateMachine, TransitionContext, TransitionResult,
};
use account_operator::crd::{
    Account, AccountSpec, AccountState, AccountStatus, OptInRegionStatus, ServiceRequestStatus,
};

// =============================================================================
// Strategies
// =============================================================================

fn architecture() -> impl Strategy<Value = String> {
    prop_oneof![Just("x86_64".to_string()), Just("arm64".to_string())]
}

fn machine_image() -> impl Strategy<Value = MachineImage> {
    (
        "ami-[0-9a-f]{8}",
        prop_oneof![
            "RHEL-[0-9]\\.[0-9]",
            "RHEL-SAP-[0-9]\\.[0-9]",
            "RHEL-[0-9]\\.[0-9]-BETA",
        ],
        architecture(),
    )
        .prop_map(|(id, name, architecture)| MachineImage {
            id,
            name,
            architecture,
        })
}

fn request_status() -> impl Strategy<Value = ServiceRequestStatus> {
    prop_oneof![
        Just(ServiceRequestStatus::Todo),
        Just(ServiceRequestStatus::InProgress),
        Just(ServiceRequestStatus::Completed),
        Just(ServiceRequestStatus::Denied),
    ]
}

fn account_state() -> impl Strategy<Value = Option<AccountState>> {
    prop_oneof![
        Just(None),
        Just(Some(AccountState::Creating)),
        Just(Some(AccountState::InitializingRegions)),
        Just(Some(AccountState::PendingVerification)),
        Just(Some(AccountState::Ready)),
        Just(Some(AccountState::OptingInRegions)),
        Just(Some(AccountState::OptInRegionsEnabled)),
        Just(Some(AccountState::Failed)),
    ]
}

fn account_event() -> impl Strategy<Value = AccountEvent> {
    prop_oneof![
        Just(AccountEvent::Assigned),
        Just(AccountEvent::ByocInitialized),
        Just(AccountEvent::RegionInitStarted),
        Just(AccountEvent::RegionInitRecovered),
        Just(AccountEvent::RegionsVerified),
        Just(AccountEvent::AwaitingVerification),
        Just(AccountEvent::Verified),
        Just(AccountEvent::OptInStarted),
        Just(AccountEvent::OptInCompleted),
        Just(AccountEvent::Failure),
    ]
}

fn transition_context() -> impl Strategy<Value = TransitionContext> {
    (any::<bool>(), any::<bool>(), 0usize..5).prop_map(|(byoc, resolved, open)| {
        TransitionContext::new(byoc)
            .with_case_resolved(resolved)
            .with_open_quota_requests(open)
    })
}

fn region() -> impl Strategy<Value = String> {
    "[a-z]{2}-[a-z]{4,9}-[1-3]"
}

fn account_with_opt_ins(entries: BTreeMap<String, ServiceRequestStatus>) -> Account {
    let mut account = Account::new("osd-creds-mgmt-prop01", AccountSpec::default());
    account.status = Some(AccountStatus {
        state: Some(AccountState::OptingInRegions),
        opt_in_regions: entries
            .into_iter()
            .map(|(region, status)| (region, OptInRegionStatus { status }))
            .collect(),
        ..Default::default()
    });
    account
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_image_selection_is_deterministic(
        images in prop::collection::vec(machine_image(), 0..12),
        arch in architecture(),
    ) {
        let first = select_image(&images, &arch).map(|i| i.id.clone());
        let second = select_image(&images, &arch).map(|i| i.id.clone());
        prop_assert_eq!(first, second);
    }

    #[test]
    fn prop_selected_image_is_eligible(
        images in prop::collection::vec(machine_image(), 0..12),
        arch in architecture(),
    ) {
        match select_image(&images, &arch) {
            Some(image) => {
                prop_assert_eq!(&image.architecture, &arch);
                prop_assert!(!image.name.contains("SAP"));
                prop_assert!(!image.name.contains("BETA"));
            }
            None => {
                let none_eligible = images.iter().all(|i| {
                    i.architecture != arch || i.name.contains("SAP") || i.name.contains("BETA")
                });
                prop_assert!(none_eligible, "an eligible image was skipped");
            }
        }
    }

    #[test]
    fn prop_opt_in_batch_respects_ceiling(
        entries in prop::collection::btree_map(region(), request_status(), 0..15),
        ceiling in 0usize..10,
    ) {
        let account = account_with_opt_ins(entries.clone());
        let batch = select_opt_in_batch(&account, ceiling);

        let in_progress: Vec<&String> = entries
            .iter()
            .filter(|(_, s)| **s == ServiceRequestStatus::InProgress)
            .map(|(r, _)| r)
            .collect();
        prop_assert!(batch.len() <= ceiling.max(in_progress.len()));
        for region in in_progress {
            prop_assert!(batch.contains(region));
        }
        for region in &batch {
            prop_assert!(matches!(
                entries.get(region),
                Some(ServiceRequestStatus::InProgress | ServiceRequestStatus::Todo)
            ));
        }
        let unique: BTreeSet<&String> = batch.iter().collect();
        prop_assert_eq!(unique.len(), batch.len());
    }

    #[test]
    fn prop_state_machine_never_panics(
        start in account_state(),
        events in prop::collection::vec((account_event(), transition_context()), 0..20),
    ) {
        let sm = AccountStateMachine::new();
        let mut state = start;
        for (event, ctx) in events {
            let was_failed = state == Some(AccountState::Failed);
            let result = sm.transition(state, event, &ctx);
            if was_failed {
                prop_assert!(
                    matches!(result, TransitionResult::InvalidTransition { .. }),
                    "Failed accepted {}",
                    event
                );
            }
            if let Some(next) = result.target() {
                state = Some(next);
            }
        }
    }

    #[test]
    fn prop_failure_reachable_from_every_live_state(start in account_state()) {
        let sm = AccountStateMachine::new();
        let result = sm.transition(start, AccountEvent::Failure, &TransitionContext::default());
        if start == Some(AccountState::Failed) {
            prop_assert!(result.target().is_none());
        } else {
            prop_assert_eq!(result.target(), Some(AccountState::Failed));
        }
    }

    #[test]
    fn prop_quota_snapshot_only_names_enabled_regions(
        overrides in prop::collection::btree_map(region(), prop::collection::btree_map("L-[0-9A-F]{8}", 1i64..500, 0..3), 0..4),
        defaults in prop::collection::btree_map("L-[0-9A-F]{8}", 1i64..500, 1..4),
        enabled in prop::collection::vec(region(), 0..6),
    ) {
        let mut spec = overrides.clone();
        spec.insert("default".to_string(), defaults.clone());

        let snapshot = snapshot_quotas(&spec, &enabled).unwrap();

        let enabled_set: BTreeSet<&String> = enabled.iter().collect();
        prop_assert_eq!(snapshot.len(), enabled_set.len());
        for (region, quotas) in &snapshot {
            prop_assert!(enabled_set.contains(region));
            for code in defaults.keys() {
                prop_assert!(quotas.contains_key(code));
            }
            for quota in quotas.values() {
                prop_assert_eq!(quota.status, ServiceRequestStatus::Todo);
            }
            if let Some(region_overrides) = overrides.get(region) {
                for (code, value) in region_overrides {
                    prop_assert_eq!(quotas[code].value, *value);
                }
            }
        }
    }

    #[test]
    fn prop_quota_snapshot_needs_default_key(
        overrides in prop::collection::btree_map(region(), prop::collection::btree_map("L-[0-9A-F]{8}", 1i64..500, 1..3), 1..4),
        enabled in prop::collection::vec(region(), 1..6),
    ) {
        prop_assert!(snapshot_quotas(&overrides, &enabled).is_err());
    }

    #[test]
    fn prop_case_requeue_is_spread_over_thirty_seconds(id in 0u64..1_000_000_000_000, base in 1u64..120) {
        let base = Duration::from_secs(base);
        let delay = case_creation_requeue(base, &format!("{:012}", id)).unwrap();
        prop_assert!(delay >= base);
        prop_assert!(delay < base + Duration::from_secs(30));
    }

    #[test]
    fn prop_non_numeric_account_id_is_rejected(id in "[a-z]{1,12}") {
        prop_assert!(case_creation_requeue(Duration::from_secs(30), &id).is_err());
    }

    #[test]
    fn prop_unknown_opt_status_is_unmapped(status in "[a-z_]{1,16}") {
        // Provider statuses are upper-case
        prop_assert_eq!(map_opt_status(&status), None);
    }

    #[test]
    fn prop_account_email_keeps_prefix(prefix in "[a-z]{1,8}(-[a-z]{1,8}){0,3}", suffix in "[a-z0-9]{6}") {
        let name = format!("{}-{}", prefix, suffix);
        prop_assert_eq!(
            account_email(&name),
            format!("{}+{}@redhat.com", prefix, suffix)
        );
    }
}
