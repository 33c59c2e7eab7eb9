//! Operator configuration read from the operator ConfigMap
//!
//! The ConfigMap is a flat string map. Feature flags that fail to parse are
//! treated as disabled rather than as errors.

use std::collections::BTreeMap;

use tracing::{info, warn};

use crate::controller::error::{Error, Result};

pub const FEATURE_OPT_IN_REGIONS: &str = "feature.opt_in_regions";
pub const FEATURE_COMPLIANCE_TAGS: &str = "feature.compliance_tags";
pub const AMI_OWNER: &str = "ami-owner";
pub const OPT_IN_REGIONS: &str = "opt-in-regions";
pub const QUOTA_VCPU: &str = "quota.vcpu";
pub const SHARD_NAME: &str = "shard-name";
pub const ACCOUNT_LIMIT: &str = "account-limit";
pub const SRE_ACCESS_ARN: &str = "sre-access-arn";
pub const NETWORK_SANDBOX: &str = "network-sandbox";
pub const MANAGED_TAGS: &str = "aws-managed-tags";
pub const FEDRAMP: &str = "fedramp";

/// Compliance tag keys copied verbatim from the ConfigMap
const COMPLIANCE_TAG_KEYS: [&str; 3] = ["app-code", "service-phase", "cost-center"];

/// Parsed operator configuration
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OperatorConfig {
    pub opt_in_regions_enabled: bool,
    pub opt_in_regions: Vec<String>,
    /// Tags applied to new accounts when compliance tagging is on
    pub compliance_tags: BTreeMap<String, String>,
    pub ami_owner: Option<String>,
    pub vcpu_quota: Option<f64>,
    pub shard_name: String,
    pub account_limit: Option<usize>,
    pub sre_access_arn: Option<String>,
    /// Region init must run inside an isolated VPC/subnet
    pub network_sandbox: bool,
    /// Tags added to every IAM principal and init instance
    pub managed_tags: BTreeMap<String, String>,
    /// GovCloud mode; regions are bring-your-own-VPC and never initialized
    pub fedramp: bool,
}

impl OperatorConfig {
    /// Build the configuration from ConfigMap data
    pub fn from_data(data: &BTreeMap<String, String>) -> Self {
        let opt_in_regions_enabled = feature_flag(data, FEATURE_OPT_IN_REGIONS);
        let opt_in_regions = data
            .get(OPT_IN_REGIONS)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|r| !r.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let mut compliance_tags = BTreeMap::new();
        if feature_flag(data, FEATURE_COMPLIANCE_TAGS) {
            for key in COMPLIANCE_TAG_KEYS {
                match data.get(key).filter(|v| !v.is_empty()) {
                    Some(value) => {
                        compliance_tags.insert(key.to_string(), value.clone());
                    }
                    None => info!("ConfigMap value '{}' missing, compliance tag skipped", key),
                }
            }
        }

        Self {
            opt_in_regions_enabled,
            opt_in_regions,
            compliance_tags,
            ami_owner: non_empty(data, AMI_OWNER),
            vcpu_quota: non_empty(data, QUOTA_VCPU).and_then(|v| v.parse().ok()),
            shard_name: data.get(SHARD_NAME).cloned().unwrap_or_default(),
            account_limit: non_empty(data, ACCOUNT_LIMIT).and_then(|v| v.parse().ok()),
            sre_access_arn: non_empty(data, SRE_ACCESS_ARN),
            network_sandbox: feature_flag(data, NETWORK_SANDBOX),
            managed_tags: data.get(MANAGED_TAGS).map(|v| parse_tags(v)).unwrap_or_default(),
            fedramp: feature_flag(data, FEDRAMP),
        }
    }

    /// Approved image owner, required before any region can be initialized
    pub fn ami_owner(&self) -> Result<&str> {
        self.ami_owner
            .as_deref()
            .ok_or_else(|| Error::InvalidConfig(format!("missing '{}' in ConfigMap", AMI_OWNER)))
    }

    /// Whether opt-in enablement should run at all
    pub fn opt_in_active(&self) -> bool {
        self.opt_in_regions_enabled && !self.opt_in_regions.is_empty()
    }
}

/// Parse `key=value` pairs, one per line
///
/// Only the first `=` splits. Blank lines are skipped, as are lines without
/// a separator.
pub fn parse_tags(raw: &str) -> BTreeMap<String, String> {
    let mut tags = BTreeMap::new();
    for line in raw.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match line.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                tags.insert(key.to_string(), value.to_string());
            }
            _ => warn!("Ignoring malformed tag '{}'", line),
        }
    }
    tags
}

fn non_empty(data: &BTreeMap<String, String>, key: &str) -> Option<String> {
    data.get(key).map(|v| v.trim()).filter(|v| !v.is_empty()).map(String::from)
}

fn feature_flag(data: &BTreeMap<String, String>, key: &str) -> bool {
    match data.get(key).map(|v| v.trim().parse::<bool>()) {
        Some(Ok(enabled)) => enabled,
        _ => {
            info!("Could not read feature flag '{}', feature disabled", key);
            false
        }
    }
}
