//! Finite state machine for the Account lifecycle
//!
//! Every state change the controller makes is looked up in this table first.
//! Background tasks use it to refuse writes that no longer apply, e.g. a
//! region initialization finishing after the account already timed out.

use std::fmt;

use crate::crd::AccountState;

/// Events that move an account between states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccountEvent {
    /// A pooled account received its cloud account id
    Assigned,
    /// A customer-supplied account was initialized from its claim
    ByocInitialized,
    /// Region workers were launched
    RegionInitStarted,
    /// Region initialization was orphaned by a restart and is being redone
    RegionInitRecovered,
    /// Every region worker reported and the account needs no verification
    RegionsVerified,
    /// Every region worker reported and limits still need verification
    AwaitingVerification,
    /// Support case resolved and quota requests settled
    Verified,
    /// Opt-in region requests were recorded
    OptInStarted,
    /// No opt-in region request remains open
    OptInCompleted,
    /// An unrecoverable error occurred
    Failure,
}

impl fmt::Display for AccountEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccountEvent::Assigned => write!(f, "Assigned"),
            AccountEvent::ByocInitialized => write!(f, "ByocInitialized"),
            AccountEvent::RegionInitStarted => write!(f, "RegionInitStarted"),
            AccountEvent::RegionInitRecovered => write!(f, "RegionInitRecovered"),
            AccountEvent::RegionsVerified => write!(f, "RegionsVerified"),
            AccountEvent::AwaitingVerification => write!(f, "AwaitingVerification"),
            AccountEvent::Verified => write!(f, "Verified"),
            AccountEvent::OptInStarted => write!(f, "OptInStarted"),
            AccountEvent::OptInCompleted => write!(f, "OptInCompleted"),
            AccountEvent::Failure => write!(f, "Failure"),
        }
    }
}

/// Display helper for an optional state, `New` when unset
pub struct StateName(pub Option<AccountState>);

impl fmt::Display for StateName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(state) => write!(f, "{}", state),
            None => write!(f, "New"),
        }
    }
}

/// Facts about the account that guards look at
#[derive(Debug, Clone, Default)]
pub struct TransitionContext {
    /// Account is customer-supplied
    pub byoc: bool,
    /// Support case has been resolved (or the account was verified before)
    pub case_resolved: bool,
    /// Quota requests still Todo or InProgress
    pub open_quota_requests: usize,
}

impl TransitionContext {
    pub fn new(byoc: bool) -> Self {
        Self {
            byoc,
            ..Default::default()
        }
    }

    pub fn with_case_resolved(mut self, resolved: bool) -> Self {
        self.case_resolved = resolved;
        self
    }

    pub fn with_open_quota_requests(mut self, open: usize) -> Self {
        self.open_quota_requests = open;
        self
    }
}

/// A state transition definition
#[derive(Debug)]
pub struct Transition {
    pub from: Option<AccountState>,
    pub to: AccountState,
    pub event: AccountEvent,
    pub description: &'static str,
}

impl Transition {
    const fn new(
        from: Option<AccountState>,
        to: AccountState,
        event: AccountEvent,
        description: &'static str,
    ) -> Self {
        Self {
            from,
            to,
            event,
            description,
        }
    }
}

/// Result of attempting a state transition
#[derive(Debug)]
pub enum TransitionResult {
    Success {
        from: Option<AccountState>,
        to: AccountState,
        event: AccountEvent,
        description: &'static str,
    },
    InvalidTransition {
        current: Option<AccountState>,
        event: AccountEvent,
    },
    GuardFailed {
        from: Option<AccountState>,
        to: AccountState,
        event: AccountEvent,
        reason: String,
    },
}

impl TransitionResult {
    /// Target state of a successful transition
    pub fn target(&self) -> Option<AccountState> {
        match self {
            TransitionResult::Success { to, .. } => Some(*to),
            _ => None,
        }
    }
}

/// Transition table of the Account lifecycle
pub struct AccountStateMachine {
    transitions: Vec<Transition>,
}

impl Default for AccountStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl AccountStateMachine {
    pub fn new() -> Self {
        use AccountEvent as E;
        use AccountState as S;

        let mut transitions = vec![
            // === New accounts ===
            Transition::new(None, S::Creating, E::Assigned, "Cloud account id assigned"),
            Transition::new(
                None,
                S::Creating,
                E::ByocInitialized,
                "Customer account initialized from claim",
            ),
            Transition::new(
                None,
                S::InitializingRegions,
                E::RegionInitStarted,
                "Customer account entering region initialization",
            ),
            // === Region initialization ===
            Transition::new(
                Some(S::Creating),
                S::InitializingRegions,
                E::RegionInitStarted,
                "Launching region workers",
            ),
            Transition::new(
                Some(S::OptingInRegions),
                S::InitializingRegions,
                E::RegionInitStarted,
                "Initializing regions after opt-in",
            ),
            Transition::new(
                Some(S::OptInRegionsEnabled),
                S::InitializingRegions,
                E::RegionInitStarted,
                "Initializing newly enabled regions",
            ),
            Transition::new(
                Some(S::InitializingRegions),
                S::Creating,
                E::RegionInitRecovered,
                "Recovering region initialization from a previous process",
            ),
            Transition::new(
                Some(S::InitializingRegions),
                S::Ready,
                E::RegionsVerified,
                "Regions initialized, account ready",
            ),
            Transition::new(
                Some(S::InitializingRegions),
                S::PendingVerification,
                E::AwaitingVerification,
                "Regions initialized, limits pending verification",
            ),
            // === Verification ===
            Transition::new(
                Some(S::PendingVerification),
                S::Ready,
                E::Verified,
                "Support case resolved and quotas settled",
            ),
            // === Opt-in regions ===
            Transition::new(
                Some(S::Ready),
                S::OptingInRegions,
                E::OptInStarted,
                "Opt-in region requests recorded",
            ),
            Transition::new(
                Some(S::OptingInRegions),
                S::OptingInRegions,
                E::OptInStarted,
                "Opt-in region requests re-recorded",
            ),
            Transition::new(
                Some(S::OptingInRegions),
                S::OptInRegionsEnabled,
                E::OptInCompleted,
                "All opt-in regions settled",
            ),
        ];

        // Failed is reachable from everything except itself
        let failable = [
            None,
            Some(S::Creating),
            Some(S::InitializingRegions),
            Some(S::PendingVerification),
            Some(S::Ready),
            Some(S::OptingInRegions),
            Some(S::OptInRegionsEnabled),
        ];
        transitions.extend(
            failable
                .into_iter()
                .map(|from| Transition::new(from, S::Failed, E::Failure, "Unrecoverable error")),
        );

        Self { transitions }
    }

    /// Attempt a transition from `current` on `event`
    pub fn transition(
        &self,
        current: Option<AccountState>,
        event: AccountEvent,
        ctx: &TransitionContext,
    ) -> TransitionResult {
        match self
            .transitions
            .iter()
            .find(|t| t.from == current && t.event == event)
        {
            Some(t) => match self.check_guard(t, ctx) {
                Some(reason) => TransitionResult::GuardFailed {
                    from: t.from,
                    to: t.to,
                    event,
                    reason,
                },
                None => TransitionResult::Success {
                    from: t.from,
                    to: t.to,
                    event,
                    description: t.description,
                },
            },
            None => TransitionResult::InvalidTransition { current, event },
        }
    }

    /// Check if a transition exists, ignoring guards
    pub fn can_transition(&self, from: Option<AccountState>, event: AccountEvent) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == from && t.event == event)
    }

    /// All events accepted in a state
    pub fn valid_events(&self, state: Option<AccountState>) -> Vec<AccountEvent> {
        self.transitions
            .iter()
            .filter(|t| t.from == state)
            .map(|t| t.event)
            .collect()
    }

    fn check_guard(&self, transition: &Transition, ctx: &TransitionContext) -> Option<String> {
        match (transition.from, transition.event) {
            (None, AccountEvent::RegionInitStarted) if !ctx.byoc => {
                Some("Only customer accounts start region initialization without a state".into())
            }
            (_, AccountEvent::AwaitingVerification) if ctx.byoc => {
                Some("Customer accounts are not verified through a support case".into())
            }
            (_, AccountEvent::RegionsVerified) if !ctx.byoc && !ctx.case_resolved => {
                Some("Support case has not been resolved".into())
            }
            (_, AccountEvent::Verified) if !ctx.case_resolved => {
                Some("Support case has not been resolved".into())
            }
            (_, AccountEvent::Verified) if ctx.open_quota_requests > 0 => Some(format!(
                "{} quota increase requests still open",
                ctx.open_quota_requests
            )),
            _ => None,
        }
    }
}

/// Event reported by a finished region initialization
pub fn region_init_event(ctx: &TransitionContext) -> AccountEvent {
    if ctx.byoc || ctx.case_resolved {
        AccountEvent::RegionsVerified
    } else {
        AccountEvent::AwaitingVerification
    }
}
