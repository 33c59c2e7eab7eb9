use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::Condition;
use crate::config::parse_tags;

/// AccountClaim is a consumer's request for an Account
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "aws.managed.openshift.io",
    version = "v1alpha1",
    kind = "AccountClaim",
    plural = "accountclaims",
    shortname = "aclaim",
    namespaced,
    status = "AccountClaimStatus",
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Account", "type":"string", "jsonPath":".spec.accountLink"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AccountClaimSpec {
    /// Name of the Account bound to this claim
    #[serde(default)]
    pub account_link: String,

    /// Customer-supplied account id (BYOC only)
    #[serde(default, rename = "byocAWSAccountID")]
    pub byoc_aws_account_id: String,

    /// Secret with the customer's credentials (BYOC only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub byoc_secret_ref: Option<SecretRef>,

    #[serde(default)]
    pub aws: AwsClaimSpec,

    #[serde(default, rename = "manualSTSMode")]
    pub manual_sts_mode: bool,

    /// Extra `key=value` tags, one per line, for resources made in the account
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub custom_tags: String,

    /// Customer KMS key used to encrypt init instance volumes (BYOC only)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kms_key_id: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct SecretRef {
    pub name: String,
    pub namespace: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct AwsClaimSpec {
    /// Regions the consumer needs initialized
    #[serde(default)]
    pub regions: Vec<AwsRegion>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct AwsRegion {
    pub name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AccountClaimStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ClaimState>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum ClaimState {
    Pending,
    Ready,
    Error,
}

impl AccountClaim {
    pub fn is_byoc(&self) -> bool {
        !self.spec.byoc_aws_account_id.is_empty()
    }

    pub fn region_names(&self) -> Vec<String> {
        self.spec.aws.regions.iter().map(|r| r.name.clone()).collect()
    }

    pub fn custom_tags(&self) -> BTreeMap<String, String> {
        parse_tags(&self.spec.custom_tags)
    }

    pub fn kms_key_id(&self) -> Option<&str> {
        Some(self.spec.kms_key_id.trim()).filter(|k| !k.is_empty())
    }
}
