use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Finalizer guarding IAM cleanup of non-STS accounts
pub const ACCOUNT_FINALIZER: &str = "finalizer.aws.managed.openshift.io";

/// Label carrying the short id shared by the admin IAM user and support role
pub const IAM_USER_ID_LABEL: &str = "iamUserId";

/// Role assumed in fleet-pooled accounts
pub const ORGANIZATION_ACCESS_ROLE: &str = "OrganizationAccountAccessRole";

/// Prefix of the per-account support role
pub const MANAGED_SUPPORT_ROLE: &str = "ManagedOpenShift-Support";

/// Spec key holding quota values applied to every region
pub const DEFAULT_QUOTA_KEY: &str = "default";

/// Account is the Schema for the accounts API
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "aws.managed.openshift.io",
    version = "v1alpha1",
    kind = "Account",
    plural = "accounts",
    shortname = "acct",
    namespaced,
    status = "AccountStatus",
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"AWS Account ID", "type":"string", "jsonPath":".spec.awsAccountId"}"#,
    printcolumn = r#"{"name":"Claimed", "type":"boolean", "jsonPath":".status.claimed"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AccountSpec {
    /// Cloud account identifier, empty until one is assigned
    #[serde(default)]
    pub aws_account_id: String,

    /// Name of the secret holding the admin IAM user credentials
    #[serde(default)]
    pub iam_user_secret: String,

    /// Account is supplied by the cluster owner rather than drawn from the pool
    #[serde(default)]
    pub byoc: bool,

    /// Name of the claim consuming this account
    #[serde(default)]
    pub claim_link: String,

    /// Namespace of the claim consuming this account
    #[serde(default)]
    pub claim_link_namespace: String,

    /// Only short-lived federated credentials are used, no IAM user
    #[serde(default, rename = "manualSTSMode")]
    pub manual_sts_mode: bool,

    /// Desired quota values keyed by region, with "default" applying everywhere
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub regional_service_quotas: BTreeMap<String, BTreeMap<String, i64>>,
}

/// Status of the Account, owned by the reconciler
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AccountStatus {
    /// Coarse lifecycle state; unset for a freshly allocated account
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<AccountState>,

    #[serde(default)]
    pub claimed: bool,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub support_case_id: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Quota requests keyed by cloud-confirmed region, then quota code
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub regional_service_quotas: RegionalServiceQuotas,

    /// Opt-in requests keyed by region code
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub opt_in_regions: BTreeMap<String, OptInRegionStatus>,
}

/// Account lifecycle state
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Hash)]
pub enum AccountState {
    Creating,
    InitializingRegions,
    PendingVerification,
    Ready,
    OptingInRegions,
    OptInRegionsEnabled,
    Failed,
}

impl std::fmt::Display for AccountState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccountState::Creating => write!(f, "Creating"),
            AccountState::InitializingRegions => write!(f, "InitializingRegions"),
            AccountState::PendingVerification => write!(f, "PendingVerification"),
            AccountState::Ready => write!(f, "Ready"),
            AccountState::OptingInRegions => write!(f, "OptingInRegions"),
            AccountState::OptInRegionsEnabled => write!(f, "OptInRegionsEnabled"),
            AccountState::Failed => write!(f, "Failed"),
        }
    }
}

/// Progress of a quota increase or opt-in request
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq, Hash)]
pub enum ServiceRequestStatus {
    #[default]
    Todo,
    InProgress,
    Completed,
    Denied,
}

impl std::fmt::Display for ServiceRequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceRequestStatus::Todo => write!(f, "Todo"),
            ServiceRequestStatus::InProgress => write!(f, "InProgress"),
            ServiceRequestStatus::Completed => write!(f, "Completed"),
            ServiceRequestStatus::Denied => write!(f, "Denied"),
        }
    }
}

/// Desired value and request progress of one quota in one region
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceQuotaStatus {
    pub value: i64,

    #[serde(default)]
    pub status: ServiceRequestStatus,

    /// Provider id of the increase request once submitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

pub type ServiceQuotas = BTreeMap<String, ServiceQuotaStatus>;
pub type RegionalServiceQuotas = BTreeMap<String, ServiceQuotas>;

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OptInRegionStatus {
    #[serde(default)]
    pub status: ServiceRequestStatus,
}

/// Kubernetes-style condition with probe and transition timestamps
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition: True, False, or Unknown
    pub status: String,

    /// Reason for the condition's last transition
    #[serde(default)]
    pub reason: String,

    /// Human-readable message
    #[serde(default)]
    pub message: String,

    /// Last time the condition was evaluated (RFC 3339)
    #[serde(default)]
    pub last_probe_time: String,

    /// Last time the condition changed status (RFC 3339)
    #[serde(default)]
    pub last_transition_time: String,
}

impl Condition {
    /// Parsed last transition time, `None` when absent or malformed
    pub fn last_transition(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.last_transition_time)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    /// Parsed last probe time, `None` when absent or malformed
    pub fn last_probe(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.last_probe_time)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }
}

impl Account {
    pub fn state(&self) -> Option<AccountState> {
        self.status.as_ref().and_then(|s| s.state)
    }

    fn is_in(&self, state: AccountState) -> bool {
        self.state() == Some(state)
    }

    pub fn has_state(&self) -> bool {
        self.state().is_some()
    }

    pub fn is_byoc(&self) -> bool {
        self.spec.byoc
    }

    pub fn is_manual_sts(&self) -> bool {
        self.spec.manual_sts_mode
    }

    pub fn is_failed(&self) -> bool {
        self.is_in(AccountState::Failed)
    }

    pub fn is_ready(&self) -> bool {
        self.is_in(AccountState::Ready)
    }

    pub fn is_creating(&self) -> bool {
        self.is_in(AccountState::Creating)
    }

    pub fn is_initializing_regions(&self) -> bool {
        self.is_in(AccountState::InitializingRegions)
    }

    pub fn is_pending_verification(&self) -> bool {
        self.is_in(AccountState::PendingVerification)
    }

    pub fn is_opting_in_regions(&self) -> bool {
        self.is_in(AccountState::OptingInRegions)
    }

    pub fn has_opted_in_regions(&self) -> bool {
        self.is_in(AccountState::OptInRegionsEnabled)
    }

    pub fn is_claimed(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.claimed)
    }

    pub fn has_claim_link(&self) -> bool {
        !self.spec.claim_link.is_empty()
    }

    pub fn has_aws_account_id(&self) -> bool {
        !self.spec.aws_account_id.is_empty()
    }

    pub fn has_support_case_id(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| !s.support_case_id.is_empty())
    }

    pub fn is_pending_deletion(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| f.iter().any(|x| x == finalizer))
    }

    /// Short id from the `iamUserId` label, if the account was ever initialized
    pub fn iam_user_id(&self) -> Option<&str> {
        self.metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(IAM_USER_ID_LABEL))
            .map(String::as_str)
            .filter(|id| !id.is_empty())
    }

    /// Name of the role the operator assumes inside the account
    pub fn assume_role_name(&self) -> String {
        if self.is_byoc() {
            self.support_role_name()
        } else {
            ORGANIZATION_ACCESS_ROLE.to_string()
        }
    }

    pub fn support_role_name(&self) -> String {
        format!(
            "{}-{}",
            MANAGED_SUPPORT_ROLE,
            self.iam_user_id().unwrap_or_default()
        )
    }

    pub fn is_unclaimed_and_has_no_state(&self) -> bool {
        !self.has_state() && !self.is_claimed()
    }

    pub fn is_ready_unclaimed_and_has_claim_link(&self) -> bool {
        self.is_ready() && self.has_claim_link() && !self.is_claimed()
    }

    /// BYOC accounts still waiting for customer-account initialization
    pub fn is_new_byoc(&self) -> bool {
        self.is_byoc() && self.is_unclaimed_and_has_no_state()
    }

    /// Whether region initialization should be (re)started on this reconcile
    pub fn ready_for_initialization(&self) -> bool {
        (self.is_byoc() && !self.is_ready())
            || (!self.is_claimed()
                && (self.is_creating()
                    || self.is_opting_in_regions()
                    || self.has_opted_in_regions()))
    }

    /// Whether opt-in region enablement applies, feature flags aside
    pub fn ready_for_region_enablement(&self) -> bool {
        if self.is_byoc() || self.is_claimed() {
            return false;
        }
        let no_opt_in_recorded = self
            .status
            .as_ref()
            .is_none_or(|s| s.opt_in_regions.is_empty());
        (self.is_ready() && no_opt_in_recorded) || self.is_opting_in_regions()
    }

    pub fn get_condition(&self, type_: &str) -> Option<&Condition> {
        self.status
            .as_ref()
            .and_then(|s| s.conditions.iter().find(|c| c.type_ == type_))
    }

    pub fn has_open_quota_increase_requests(&self) -> bool {
        self.status.as_ref().is_some_and(|s| {
            s.regional_service_quotas.values().any(|quotas| {
                quotas.values().any(|q| {
                    matches!(
                        q.status,
                        ServiceRequestStatus::Todo | ServiceRequestStatus::InProgress
                    )
                })
            })
        })
    }

    /// Count and collect the quota entries whose status is one of `statuses`
    pub fn quota_requests_by_status(
        &self,
        statuses: &[ServiceRequestStatus],
    ) -> (usize, RegionalServiceQuotas) {
        let mut matched = RegionalServiceQuotas::new();
        let mut count = 0;
        if let Some(status) = &self.status {
            for (region, quotas) in &status.regional_service_quotas {
                for (code, quota) in quotas {
                    if statuses.contains(&quota.status) {
                        matched
                            .entry(region.clone())
                            .or_default()
                            .insert(code.clone(), quota.clone());
                        count += 1;
                    }
                }
            }
        }
        (count, matched)
    }

    pub fn has_open_opt_in_region_requests(&self) -> bool {
        self.status.as_ref().is_some_and(|s| {
            s.opt_in_regions.values().any(|r| {
                matches!(
                    r.status,
                    ServiceRequestStatus::Todo | ServiceRequestStatus::InProgress
                )
            })
        })
    }

    /// Regions whose opt-in request currently has `status`, in region order
    pub fn opt_in_requests_by_status(&self, status: ServiceRequestStatus) -> Vec<String> {
        self.status
            .as_ref()
            .map(|s| {
                s.opt_in_regions
                    .iter()
                    .filter(|(_, r)| r.status == status)
                    .map(|(region, _)| region.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}
