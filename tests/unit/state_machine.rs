use account_operator::controller::state_machine::{
    AccountEvent, AccountStateMachine, TransitionContext, TransitionResult, region_init_event,
};
use account_operator::crd::AccountState;

use AccountEvent as E;
use AccountState as S;

fn pooled() -> TransitionContext {
    TransitionContext::new(false)
}

fn byoc() -> TransitionContext {
    TransitionContext::new(true)
}

#[test]
fn test_pooled_happy_path() {
    let sm = AccountStateMachine::new();
    let steps = [
        (None, E::Assigned, pooled(), S::Creating),
        (Some(S::Creating), E::RegionInitStarted, pooled(), S::InitializingRegions),
        (
            Some(S::InitializingRegions),
            E::AwaitingVerification,
            pooled(),
            S::PendingVerification,
        ),
        (
            Some(S::PendingVerification),
            E::Verified,
            pooled().with_case_resolved(true),
            S::Ready,
        ),
        (Some(S::Ready), E::OptInStarted, pooled(), S::OptingInRegions),
        (
            Some(S::OptingInRegions),
            E::OptInCompleted,
            pooled(),
            S::OptInRegionsEnabled,
        ),
        (
            Some(S::OptInRegionsEnabled),
            E::RegionInitStarted,
            pooled(),
            S::InitializingRegions,
        ),
    ];
    for (from, event, ctx, to) in steps {
        assert_eq!(
            sm.transition(from, event, &ctx).target(),
            Some(to),
            "{:?} --{}-->",
            from,
            event
        );
    }
}

#[test]
fn test_byoc_skips_verification() {
    let sm = AccountStateMachine::new();
    assert_eq!(
        sm.transition(None, E::ByocInitialized, &byoc()).target(),
        Some(S::Creating)
    );
    assert_eq!(
        sm.transition(Some(S::InitializingRegions), E::RegionsVerified, &byoc())
            .target(),
        Some(S::Ready)
    );
    assert!(matches!(
        sm.transition(Some(S::InitializingRegions), E::AwaitingVerification, &byoc()),
        TransitionResult::GuardFailed { .. }
    ));
}

#[test]
fn test_region_init_without_state_is_byoc_only() {
    let sm = AccountStateMachine::new();
    assert_eq!(
        sm.transition(None, E::RegionInitStarted, &byoc()).target(),
        Some(S::InitializingRegions)
    );
    assert!(matches!(
        sm.transition(None, E::RegionInitStarted, &pooled()),
        TransitionResult::GuardFailed { .. }
    ));
}

#[test]
fn test_verification_guards() {
    let sm = AccountStateMachine::new();
    let from = Some(S::PendingVerification);

    match sm.transition(from, E::Verified, &pooled()) {
        TransitionResult::GuardFailed { reason, .. } => {
            assert!(reason.contains("not been resolved"))
        }
        other => panic!("expected guard failure, got {:?}", other),
    }

    let open = pooled().with_case_resolved(true).with_open_quota_requests(3);
    match sm.transition(from, E::Verified, &open) {
        TransitionResult::GuardFailed { reason, .. } => {
            assert_eq!(reason, "3 quota increase requests still open")
        }
        other => panic!("expected guard failure, got {:?}", other),
    }
}

#[test]
fn test_pooled_region_completion_needs_resolved_case_to_be_ready() {
    let sm = AccountStateMachine::new();
    let from = Some(S::InitializingRegions);
    assert!(sm.transition(from, E::RegionsVerified, &pooled()).target().is_none());
    assert_eq!(
        sm.transition(from, E::RegionsVerified, &pooled().with_case_resolved(true))
            .target(),
        Some(S::Ready)
    );
    assert_eq!(
        region_init_event(&pooled().with_case_resolved(true)),
        E::RegionsVerified
    );
}

#[test]
fn test_recovery_returns_to_creating() {
    let sm = AccountStateMachine::new();
    assert_eq!(
        sm.transition(Some(S::InitializingRegions), E::RegionInitRecovered, &pooled())
            .target(),
        Some(S::Creating)
    );
    assert!(!sm.can_transition(Some(S::Creating), E::RegionInitRecovered));
}

#[test]
fn test_failed_is_terminal() {
    let sm = AccountStateMachine::new();
    let all_events = [
        E::Assigned,
        E::ByocInitialized,
        E::RegionInitStarted,
        E::RegionInitRecovered,
        E::RegionsVerified,
        E::AwaitingVerification,
        E::Verified,
        E::OptInStarted,
        E::OptInCompleted,
        E::Failure,
    ];
    for event in all_events {
        assert!(matches!(
            sm.transition(Some(S::Failed), event, &pooled()),
            TransitionResult::InvalidTransition { .. }
        ));
    }
    assert!(sm.valid_events(Some(S::Failed)).is_empty());
}

#[test]
fn test_every_other_state_can_fail() {
    let sm = AccountStateMachine::new();
    let states = [
        None,
        Some(S::Creating),
        Some(S::InitializingRegions),
        Some(S::PendingVerification),
        Some(S::Ready),
        Some(S::OptingInRegions),
        Some(S::OptInRegionsEnabled),
    ];
    for state in states {
        assert_eq!(
            sm.transition(state, E::Failure, &pooled()).target(),
            Some(S::Failed)
        );
        assert!(sm.valid_events(state).contains(&E::Failure));
    }
}

#[test]
fn test_ready_account_cannot_restart_creation() {
    let sm = AccountStateMachine::new();
    assert!(!sm.can_transition(Some(S::Ready), E::Assigned));
    assert!(!sm.can_transition(Some(S::Ready), E::RegionInitStarted));
    assert!(!sm.can_transition(Some(S::PendingVerification), E::RegionInitStarted));
}
