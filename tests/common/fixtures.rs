//! Test fixtures and builders for Account and AccountClaim resources
//!
//! # Quick Start
//!
//! ```rust,ignore
//! let account = AccountBuilder::new("osd-creds-mgmt-abc123")
//!     .with_account_id("123456789012")
//!     .with_state(AccountState::Creating)
//!     .build();
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::ObjectMeta;

use account_operator::config::{
    AMI_OWNER, FEATURE_OPT_IN_REGIONS, OPT_IN_REGIONS, OperatorConfig, SRE_ACCESS_ARN,
};
use account_operator::crd::{
    Account, AccountClaim, AccountClaimSpec, AccountSpec, AccountState, AccountStatus,
    AwsClaimSpec, AwsRegion, Condition, IAM_USER_ID_LABEL, OptInRegionStatus, SecretRef,
    ServiceQuotaStatus, ServiceRequestStatus,
};

pub const NAMESPACE: &str = "aws-account-operator";
pub const ACCOUNT_ID: &str = "123456789012";
pub const CLAIM_NAMESPACE: &str = "uhc-production-1234";
pub const SRE_ARN: &str = "arn:aws:iam::000000000000:role/SRE";

/// Operator configuration with everything region initialization needs
pub fn operator_config() -> OperatorConfig {
    OperatorConfig::from_data(&BTreeMap::from([
        (AMI_OWNER.to_string(), "309956199498".to_string()),
        (SRE_ACCESS_ARN.to_string(), SRE_ARN.to_string()),
    ]))
}

/// Configuration with opt-in enablement switched on for `regions`
pub fn opt_in_config(regions: &[&str]) -> OperatorConfig {
    let mut data = BTreeMap::from([
        (AMI_OWNER.to_string(), "309956199498".to_string()),
        (SRE_ACCESS_ARN.to_string(), SRE_ARN.to_string()),
        (FEATURE_OPT_IN_REGIONS.to_string(), "true".to_string()),
    ]);
    data.insert(OPT_IN_REGIONS.to_string(), regions.join(","));
    OperatorConfig::from_data(&data)
}

/// Condition with explicit timestamps
pub fn condition_at(type_: &str, status: &str, at: DateTime<Utc>) -> Condition {
    Condition {
        type_: type_.to_string(),
        status: status.to_string(),
        reason: type_.to_string(),
        message: String::new(),
        last_probe_time: at.to_rfc3339(),
        last_transition_time: at.to_rfc3339(),
    }
}

/// Builder for Account test fixtures
#[allow(dead_code)]
pub struct AccountBuilder {
    name: String,
    namespace: String,
    spec: AccountSpec,
    status: Option<AccountStatus>,
    labels: BTreeMap<String, String>,
    finalizers: Vec<String>,
    deleting: bool,
    created: Option<DateTime<Utc>>,
}

#[allow(dead_code)]
impl AccountBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: NAMESPACE.to_string(),
            spec: AccountSpec::default(),
            status: None,
            labels: BTreeMap::new(),
            finalizers: Vec::new(),
            deleting: false,
            created: None,
        }
    }

    pub fn with_account_id(mut self, id: &str) -> Self {
        self.spec.aws_account_id = id.to_string();
        self
    }

    pub fn byoc(mut self) -> Self {
        self.spec.byoc = true;
        self
    }

    pub fn manual_sts(mut self) -> Self {
        self.spec.manual_sts_mode = true;
        self
    }

    pub fn with_claim_link(mut self, name: &str, namespace: &str) -> Self {
        self.spec.claim_link = name.to_string();
        self.spec.claim_link_namespace = namespace.to_string();
        self
    }

    pub fn with_iam_user_id(mut self, id: &str) -> Self {
        self.labels
            .insert(IAM_USER_ID_LABEL.to_string(), id.to_string());
        self
    }

    pub fn with_state(mut self, state: AccountState) -> Self {
        self.status.get_or_insert_with(Default::default).state = Some(state);
        self
    }

    pub fn claimed(mut self) -> Self {
        self.status.get_or_insert_with(Default::default).claimed = true;
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.status
            .get_or_insert_with(Default::default)
            .conditions
            .push(condition);
        self
    }

    pub fn with_support_case(mut self, case_id: &str) -> Self {
        self.status
            .get_or_insert_with(Default::default)
            .support_case_id = case_id.to_string();
        self
    }

    pub fn with_spec_quota(mut self, region: &str, code: &str, value: i64) -> Self {
        self.spec
            .regional_service_quotas
            .entry(region.to_string())
            .or_default()
            .insert(code.to_string(), value);
        self
    }

    pub fn with_status_quota(
        mut self,
        region: &str,
        code: &str,
        value: i64,
        status: ServiceRequestStatus,
    ) -> Self {
        self.status
            .get_or_insert_with(Default::default)
            .regional_service_quotas
            .entry(region.to_string())
            .or_default()
            .insert(
                code.to_string(),
                ServiceQuotaStatus {
                    value,
                    status,
                    request_id: None,
                },
            );
        self
    }

    pub fn with_opt_in(mut self, region: &str, status: ServiceRequestStatus) -> Self {
        self.status
            .get_or_insert_with(Default::default)
            .opt_in_regions
            .insert(region.to_string(), OptInRegionStatus { status });
        self
    }

    pub fn with_finalizer(mut self, finalizer: &str) -> Self {
        self.finalizers.push(finalizer.to_string());
        self
    }

    pub fn deleting(mut self) -> Self {
        self.deleting = true;
        self
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created = Some(at);
        self
    }

    pub fn build(self) -> Account {
        Account {
            metadata: ObjectMeta {
                name: Some(self.name),
                namespace: Some(self.namespace),
                uid: Some("test-uid-12345".to_string()),
                labels: (!self.labels.is_empty()).then_some(self.labels),
                finalizers: (!self.finalizers.is_empty()).then_some(self.finalizers),
                deletion_timestamp: self.deleting.then(|| Time(Utc::now())),
                creation_timestamp: self.created.map(Time),
                ..Default::default()
            },
            spec: self.spec,
            status: self.status,
        }
    }
}

/// Builder for AccountClaim test fixtures
#[allow(dead_code)]
pub struct ClaimBuilder {
    name: String,
    namespace: String,
    spec: AccountClaimSpec,
}

#[allow(dead_code)]
impl ClaimBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: CLAIM_NAMESPACE.to_string(),
            spec: AccountClaimSpec::default(),
        }
    }

    pub fn byoc(mut self, account_id: &str) -> Self {
        self.spec.byoc_aws_account_id = account_id.to_string();
        self.spec.byoc_secret_ref = Some(SecretRef {
            name: "byoc".to_string(),
            namespace: self.namespace.clone(),
        });
        self
    }

    pub fn without_secret_ref(mut self) -> Self {
        self.spec.byoc_secret_ref = None;
        self
    }

    pub fn with_regions(mut self, regions: &[&str]) -> Self {
        self.spec.aws = AwsClaimSpec {
            regions: regions
                .iter()
                .map(|r| AwsRegion {
                    name: r.to_string(),
                })
                .collect(),
        };
        self
    }

    pub fn with_custom_tags(mut self, tags: &str) -> Self {
        self.spec.custom_tags = tags.to_string();
        self
    }

    pub fn with_kms_key(mut self, key: &str) -> Self {
        self.spec.kms_key_id = key.to_string();
        self
    }

    pub fn build(self) -> AccountClaim {
        AccountClaim {
            metadata: ObjectMeta {
                name: Some(self.name),
                namespace: Some(self.namespace),
                ..Default::default()
            },
            spec: self.spec,
            status: None,
        }
    }
}
