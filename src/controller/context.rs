use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::cloud::{CloudClientBuilder, RoleAssumer, StsRoleAssumer};
use crate::controller::state_machine::AccountStateMachine;
use crate::health::HealthState;
use crate::store::AccountStore;

/// Tunables of the account controller
#[derive(Clone, Debug)]
pub struct Settings {
    /// Base wait used for the creation and instance polling budgets
    pub wait_time: Duration,
    /// How long an account may stay in Creating
    pub create_pending_timeout: Duration,
    /// How long region initialization may run before the account fails
    pub region_init_timeout: Duration,
    /// Requeue used while the provider has not activated the account yet
    pub not_activated_requeue: Duration,
    /// Requeue used while the fleet is at its account limit
    pub account_limit_requeue: Duration,
    /// Fixed part of the requeue after opening a support case
    pub case_creation_requeue: Duration,
    /// Poll interval while waiting for verification or opt-in
    pub verification_poll_interval: Duration,
    /// Quota requests handled per reconcile
    pub quota_ceiling: usize,
    /// Opt-in requests one account may have open at once
    pub opt_in_account_ceiling: usize,
    /// Accounts that may be opting in to regions at once
    pub opt_in_fleet_ceiling: usize,
    /// Region workers allowed to run concurrently per account
    pub max_region_workers: usize,
    /// Total time allowed for an instance to reach running
    pub instance_poll_budget: Duration,
    /// First wait between instance state polls, doubled each time
    pub instance_poll_initial_delay: Duration,
    /// Attempts made to remove the finalizer
    pub finalizer_retries: u32,
    /// Base of the linear backoff between finalizer attempts
    pub finalizer_backoff: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        let wait_time = Duration::from_secs(25 * 60);
        Self {
            wait_time,
            create_pending_timeout: wait_time,
            region_init_timeout: wait_time * 2 + Duration::from_secs(60),
            not_activated_requeue: Duration::from_secs(60),
            account_limit_requeue: Duration::from_secs(5 * 60),
            case_creation_requeue: Duration::from_secs(30),
            verification_poll_interval: Duration::from_secs(10 * 60),
            quota_ceiling: 20,
            opt_in_account_ceiling: 6,
            opt_in_fleet_ceiling: 9,
            max_region_workers: 32,
            instance_poll_budget: wait_time,
            instance_poll_initial_delay: Duration::from_secs(1),
            finalizer_retries: 5,
            finalizer_backoff: Duration::from_millis(100),
        }
    }
}

/// Shared context for the controller
#[derive(Clone)]
pub struct Context {
    /// Access to Accounts, AccountClaims, secrets and operator configuration
    pub store: Arc<dyn AccountStore>,
    /// Factory for provider clients
    pub cloud: Arc<dyn CloudClientBuilder>,
    /// Strategy used to enter managed accounts
    pub role_assumer: Arc<dyn RoleAssumer>,
    pub settings: Settings,
    pub state_machine: Arc<AccountStateMachine>,
    /// Process start, used to detect region initialization orphaned by a restart
    pub started_at: DateTime<Utc>,
    /// Health state for recording metrics
    pub health_state: Option<Arc<HealthState>>,
}

impl Context {
    /// Context using STS role assumption through `cloud`
    pub fn new(
        store: Arc<dyn AccountStore>,
        cloud: Arc<dyn CloudClientBuilder>,
        health_state: Option<Arc<HealthState>>,
    ) -> Self {
        let role_assumer = Arc::new(StsRoleAssumer::new(cloud.clone()));
        Self {
            store,
            cloud,
            role_assumer,
            settings: Settings::default(),
            state_machine: Arc::new(AccountStateMachine::new()),
            started_at: Utc::now(),
            health_state,
        }
    }

    pub fn with_role_assumer(mut self, role_assumer: Arc<dyn RoleAssumer>) -> Self {
        self.role_assumer = role_assumer;
        self
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_started_at(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = started_at;
        self
    }

    /// Record a successful reconciliation
    pub fn record_reconcile(&self, duration_secs: f64) {
        if let Some(ref state) = self.health_state {
            state.metrics.record_reconcile(duration_secs);
        }
    }

    /// Record a failed reconciliation
    pub fn record_error(&self) {
        if let Some(ref state) = self.health_state {
            state.metrics.record_error();
        }
    }

    /// Record the outcome of one region worker
    pub fn record_region_init(&self, result: &str) {
        if let Some(ref state) = self.health_state {
            state.metrics.record_region_init(result);
        }
    }
}
