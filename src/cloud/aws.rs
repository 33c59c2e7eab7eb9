//! AWS implementation of the cloud abstraction
//!
//! Each [`AwsClient`] bundles the service clients for one region and one set
//! of credentials. SDK errors are flattened to [`CloudError`] using the
//! service error code, so the controller never sees SDK types.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use aws_config::retry::RetryConfig;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_sdk_sts::config::{Credentials as SdkCredentials, SharedCredentialsProvider};
use aws_sdk_sts::error::{ProvideErrorMetadata, SdkError};
use chrono::DateTime;
use k8s_openapi::api::core::v1::Secret;
use kube::Api;
use tracing::debug;

use super::{
    AccessKey, CloudClient, CloudClientBuilder, CloudError, CloudResult, CreateAccountState,
    CreateAccountStatus, Credentials, IamRole, IamUser, MachineImage, Page, QuotaChange,
    RunInstanceRequest, SupportCase, codes,
};
use crate::crd::SecretRef;

/// Code used when a response lacks a field the operator relies on
const MALFORMED_RESPONSE: &str = "MalformedResponse";
/// Code used when BYOC credentials cannot be read
const CREDENTIALS_UNAVAILABLE: &str = "CredentialsUnavailable";
/// Root volume of init instances, always encrypted
const ROOT_DEVICE_NAME: &str = "/dev/sda1";
const ROOT_VOLUME_GIB: i32 = 10;
/// Attempts the SDK makes per request before an error reaches the caller
pub const SDK_MAX_ATTEMPTS: u32 = 10;

fn sdk_retry_config() -> RetryConfig {
    RetryConfig::standard().with_max_attempts(SDK_MAX_ATTEMPTS)
}

fn sdk_error<E, R>(err: SdkError<E, R>) -> CloudError
where
    E: ProvideErrorMetadata + Debug,
    R: Debug,
{
    let code = err.code().unwrap_or("Unknown").to_string();
    let message = err
        .message()
        .map(str::to_string)
        .unwrap_or_else(|| format!("{:?}", err));
    CloudError::new(code, message)
}

fn malformed(what: &str) -> CloudError {
    CloudError::new(MALFORMED_RESPONSE, format!("response without {}", what))
}

fn build_error(err: impl std::fmt::Display) -> CloudError {
    CloudError::new(codes::VALIDATION_EXCEPTION, err.to_string())
}

fn iam_tags(tags: &BTreeMap<String, String>) -> CloudResult<Vec<aws_sdk_iam::types::Tag>> {
    tags.iter()
        .map(|(k, v)| {
            aws_sdk_iam::types::Tag::builder()
                .key(k)
                .value(v)
                .build()
                .map_err(build_error)
        })
        .collect()
}

fn iam_tag_map(tags: &[aws_sdk_iam::types::Tag]) -> BTreeMap<String, String> {
    tags.iter()
        .map(|t| (t.key().to_string(), t.value().to_string()))
        .collect()
}

fn ec2_tags(
    resource: aws_sdk_ec2::types::ResourceType,
    tags: &BTreeMap<String, String>,
) -> aws_sdk_ec2::types::TagSpecification {
    aws_sdk_ec2::types::TagSpecification::builder()
        .resource_type(resource)
        .set_tags(Some(
            tags.iter()
                .map(|(k, v)| aws_sdk_ec2::types::Tag::builder().key(k).value(v).build())
                .collect(),
        ))
        .build()
}

fn ec2_filter(name: &str, value: &str) -> aws_sdk_ec2::types::Filter {
    aws_sdk_ec2::types::Filter::builder()
        .name(name)
        .values(value)
        .build()
}

/// Service clients for one region and identity
pub struct AwsClient {
    organizations: aws_sdk_organizations::Client,
    sts: aws_sdk_sts::Client,
    iam: aws_sdk_iam::Client,
    ec2: aws_sdk_ec2::Client,
    quotas: aws_sdk_servicequotas::Client,
    support: aws_sdk_support::Client,
    account: aws_sdk_account::Client,
}

impl AwsClient {
    pub fn new(config: &SdkConfig) -> Self {
        Self {
            organizations: aws_sdk_organizations::Client::new(config),
            sts: aws_sdk_sts::Client::new(config),
            iam: aws_sdk_iam::Client::new(config),
            ec2: aws_sdk_ec2::Client::new(config),
            quotas: aws_sdk_servicequotas::Client::new(config),
            support: aws_sdk_support::Client::new(config),
            account: aws_sdk_account::Client::new(config),
        }
    }
}

#[async_trait]
impl CloudClient for AwsClient {
    async fn create_account(&self, name: &str, email: &str) -> CloudResult<String> {
        let out = self
            .organizations
            .create_account()
            .account_name(name)
            .email(email)
            .send()
            .await
            .map_err(sdk_error)?;
        out.create_account_status()
            .and_then(|s| s.id())
            .map(str::to_string)
            .ok_or_else(|| malformed("create account request id"))
    }

    async fn describe_create_account_status(
        &self,
        request_id: &str,
    ) -> CloudResult<CreateAccountStatus> {
        use aws_sdk_organizations::types::CreateAccountState as State;

        let out = self
            .organizations
            .describe_create_account_status()
            .create_account_request_id(request_id)
            .send()
            .await
            .map_err(sdk_error)?;
        let status = out
            .create_account_status()
            .ok_or_else(|| malformed("create account status"))?;
        let state = match status.state() {
            Some(State::Succeeded) => CreateAccountState::Succeeded,
            Some(State::Failed) => CreateAccountState::Failed,
            _ => CreateAccountState::InProgress,
        };
        Ok(CreateAccountStatus {
            state,
            account_id: status.account_id().map(str::to_string),
            failure_reason: status.failure_reason().map(|r| r.as_str().to_string()),
        })
    }

    async fn tag_account(
        &self,
        account_id: &str,
        tags: &BTreeMap<String, String>,
    ) -> CloudResult<()> {
        let tags = tags
            .iter()
            .map(|(k, v)| {
                aws_sdk_organizations::types::Tag::builder()
                    .key(k)
                    .value(v)
                    .build()
                    .map_err(build_error)
            })
            .collect::<CloudResult<Vec<_>>>()?;
        self.organizations
            .tag_resource()
            .resource_id(account_id)
            .set_tags(Some(tags))
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    async fn caller_arn(&self) -> CloudResult<String> {
        let out = self
            .sts
            .get_caller_identity()
            .send()
            .await
            .map_err(sdk_error)?;
        out.arn()
            .map(str::to_string)
            .ok_or_else(|| malformed("caller arn"))
    }

    async fn assume_role(&self, role_arn: &str, session_name: &str) -> CloudResult<Credentials> {
        let out = self
            .sts
            .assume_role()
            .role_arn(role_arn)
            .role_session_name(session_name)
            .send()
            .await
            .map_err(sdk_error)?;
        let creds = out.credentials().ok_or_else(|| malformed("credentials"))?;
        Ok(Credentials {
            access_key_id: creds.access_key_id().to_string(),
            secret_access_key: creds.secret_access_key().to_string(),
            session_token: creds.session_token().to_string(),
            expiration: DateTime::from_timestamp(creds.expiration().secs(), 0),
        })
    }

    async fn get_user(&self, name: &str) -> CloudResult<Option<IamUser>> {
        match self.iam.get_user().user_name(name).send().await {
            Ok(out) => Ok(out.user().map(|u| IamUser {
                name: u.user_name().to_string(),
                arn: u.arn().to_string(),
                tags: iam_tag_map(u.tags()),
            })),
            Err(e) => {
                let err = sdk_error(e);
                if err.is(codes::NO_SUCH_ENTITY) {
                    Ok(None)
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn create_user(
        &self,
        name: &str,
        tags: &BTreeMap<String, String>,
    ) -> CloudResult<IamUser> {
        let out = self
            .iam
            .create_user()
            .user_name(name)
            .set_tags(Some(iam_tags(tags)?))
            .send()
            .await
            .map_err(sdk_error)?;
        let user = out.user().ok_or_else(|| malformed("user"))?;
        Ok(IamUser {
            name: user.user_name().to_string(),
            arn: user.arn().to_string(),
            tags: tags.clone(),
        })
    }

    async fn delete_user(&self, name: &str) -> CloudResult<()> {
        self.iam
            .delete_user()
            .user_name(name)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    async fn list_users(&self, marker: Option<String>) -> CloudResult<Page<String>> {
        let out = self
            .iam
            .list_users()
            .set_marker(marker)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(Page {
            items: out.users().iter().map(|u| u.user_name().to_string()).collect(),
            marker: out
                .is_truncated()
                .then(|| out.marker().map(str::to_string))
                .flatten(),
        })
    }

    async fn attach_user_policy(&self, user: &str, policy_arn: &str) -> CloudResult<()> {
        self.iam
            .attach_user_policy()
            .user_name(user)
            .policy_arn(policy_arn)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    async fn detach_user_policy(&self, user: &str, policy_arn: &str) -> CloudResult<()> {
        self.iam
            .detach_user_policy()
            .user_name(user)
            .policy_arn(policy_arn)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    async fn list_attached_user_policies(&self, user: &str) -> CloudResult<Vec<String>> {
        let out = self
            .iam
            .list_attached_user_policies()
            .user_name(user)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(out
            .attached_policies()
            .iter()
            .filter_map(|p| p.policy_arn().map(str::to_string))
            .collect())
    }

    async fn create_access_key(&self, user: &str) -> CloudResult<AccessKey> {
        let out = self
            .iam
            .create_access_key()
            .user_name(user)
            .send()
            .await
            .map_err(sdk_error)?;
        let key = out.access_key().ok_or_else(|| malformed("access key"))?;
        Ok(AccessKey {
            id: key.access_key_id().to_string(),
            secret: key.secret_access_key().to_string(),
        })
    }

    async fn list_access_keys(&self, user: &str) -> CloudResult<Vec<String>> {
        let out = self
            .iam
            .list_access_keys()
            .user_name(user)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(out
            .access_key_metadata()
            .iter()
            .filter_map(|k| k.access_key_id().map(str::to_string))
            .collect())
    }

    async fn delete_access_key(&self, user: &str, key_id: &str) -> CloudResult<()> {
        self.iam
            .delete_access_key()
            .user_name(user)
            .access_key_id(key_id)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    async fn get_role(&self, name: &str) -> CloudResult<Option<IamRole>> {
        match self.iam.get_role().role_name(name).send().await {
            Ok(out) => Ok(out.role().map(|r| IamRole {
                name: r.role_name().to_string(),
                id: r.role_id().to_string(),
                arn: r.arn().to_string(),
                tags: iam_tag_map(r.tags()),
            })),
            Err(e) => {
                let err = sdk_error(e);
                if err.is(codes::NO_SUCH_ENTITY) {
                    Ok(None)
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn create_role(
        &self,
        name: &str,
        trust_policy: &str,
        tags: &BTreeMap<String, String>,
    ) -> CloudResult<IamRole> {
        let out = self
            .iam
            .create_role()
            .role_name(name)
            .assume_role_policy_document(trust_policy)
            .set_tags(Some(iam_tags(tags)?))
            .send()
            .await
            .map_err(sdk_error)?;
        let role = out.role().ok_or_else(|| malformed("role"))?;
        Ok(IamRole {
            name: role.role_name().to_string(),
            id: role.role_id().to_string(),
            arn: role.arn().to_string(),
            tags: tags.clone(),
        })
    }

    async fn delete_role(&self, name: &str) -> CloudResult<()> {
        self.iam
            .delete_role()
            .role_name(name)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    async fn list_roles(&self, marker: Option<String>) -> CloudResult<Page<String>> {
        let out = self
            .iam
            .list_roles()
            .set_marker(marker)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(Page {
            items: out.roles().iter().map(|r| r.role_name().to_string()).collect(),
            marker: out
                .is_truncated()
                .then(|| out.marker().map(str::to_string))
                .flatten(),
        })
    }

    async fn attach_role_policy(&self, role: &str, policy_arn: &str) -> CloudResult<()> {
        self.iam
            .attach_role_policy()
            .role_name(role)
            .policy_arn(policy_arn)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    async fn detach_role_policy(&self, role: &str, policy_arn: &str) -> CloudResult<()> {
        self.iam
            .detach_role_policy()
            .role_name(role)
            .policy_arn(policy_arn)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    async fn list_attached_role_policies(&self, role: &str) -> CloudResult<Vec<String>> {
        let out = self
            .iam
            .list_attached_role_policies()
            .role_name(role)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(out
            .attached_policies()
            .iter()
            .filter_map(|p| p.policy_arn().map(str::to_string))
            .collect())
    }

    async fn list_enabled_regions(&self) -> CloudResult<Vec<String>> {
        let out = self
            .ec2
            .describe_regions()
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(out
            .regions()
            .iter()
            .filter_map(|r| r.region_name().map(str::to_string))
            .collect())
    }

    async fn dry_run_describe_instances(&self) -> CloudResult<()> {
        match self.ec2.describe_instances().dry_run(true).send().await {
            Ok(_) => Ok(()),
            Err(e) => {
                let err = sdk_error(e);
                if err.is(codes::DRY_RUN_OPERATION) {
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn describe_instance_types(&self, instance_types: &[String]) -> CloudResult<Vec<String>> {
        use aws_sdk_ec2::types::InstanceType;

        let out = self
            .ec2
            .describe_instance_types()
            .set_instance_types(Some(
                instance_types
                    .iter()
                    .map(|t| InstanceType::from(t.as_str()))
                    .collect(),
            ))
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(out
            .instance_types()
            .iter()
            .filter_map(|t| t.instance_type().map(|t| t.as_str().to_string()))
            .collect())
    }

    async fn describe_images(
        &self,
        owner: &str,
        architecture: &str,
        executable_by: &str,
    ) -> CloudResult<Vec<MachineImage>> {
        let out = self
            .ec2
            .describe_images()
            .executable_users(executable_by)
            .owners(owner)
            .filters(ec2_filter("architecture", architecture))
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(out
            .images()
            .iter()
            .filter_map(|i| {
                Some(MachineImage {
                    id: i.image_id()?.to_string(),
                    name: i.name().unwrap_or_default().to_string(),
                    architecture: i
                        .architecture()
                        .map(|a| a.as_str().to_string())
                        .unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn run_instance(&self, request: &RunInstanceRequest) -> CloudResult<String> {
        use aws_sdk_ec2::types::{
            BlockDeviceMapping, EbsBlockDevice, InstanceType, ResourceType,
        };

        let root_volume = EbsBlockDevice::builder()
            .volume_size(ROOT_VOLUME_GIB)
            .delete_on_termination(true)
            .encrypted(true)
            .set_kms_key_id(request.kms_key_id.clone())
            .build();
        let out = self
            .ec2
            .run_instances()
            .image_id(&request.image_id)
            .instance_type(InstanceType::from(request.instance_type.as_str()))
            .min_count(1)
            .max_count(1)
            .set_subnet_id(request.subnet_id.clone())
            .tag_specifications(ec2_tags(ResourceType::Instance, &request.tags))
            .tag_specifications(ec2_tags(ResourceType::Volume, &request.tags))
            .block_device_mappings(
                BlockDeviceMapping::builder()
                    .device_name(ROOT_DEVICE_NAME)
                    .ebs(root_volume)
                    .build(),
            )
            .send()
            .await
            .map_err(sdk_error)?;
        out.instances()
            .first()
            .and_then(|i| i.instance_id())
            .map(str::to_string)
            .ok_or_else(|| malformed("instance id"))
    }

    async fn instance_state(&self, instance_id: &str) -> CloudResult<Option<i32>> {
        let out = self
            .ec2
            .describe_instance_status()
            .instance_ids(instance_id)
            .include_all_instances(true)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(out
            .instance_statuses()
            .first()
            .and_then(|s| s.instance_state())
            .and_then(|s| s.code()))
    }

    async fn terminate_instances(&self, instance_ids: &[String]) -> CloudResult<()> {
        self.ec2
            .terminate_instances()
            .set_instance_ids(Some(instance_ids.to_vec()))
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    async fn find_tagged_instances(
        &self,
        instance_type: &str,
        tag_keys: &[String],
    ) -> CloudResult<Vec<String>> {
        let mut request = self
            .ec2
            .describe_instances()
            .filters(ec2_filter("instance-type", instance_type))
            .filters(ec2_filter("instance-state-name", "running"));
        for key in tag_keys {
            request = request.filters(ec2_filter("tag-key", key));
        }
        let out = request.send().await.map_err(sdk_error)?;
        Ok(out
            .reservations()
            .iter()
            .flat_map(|r| r.instances())
            .filter_map(|i| i.instance_id().map(str::to_string))
            .collect())
    }

    async fn create_vpc(&self, cidr: &str, tags: &BTreeMap<String, String>) -> CloudResult<String> {
        use aws_sdk_ec2::types::ResourceType;

        let out = self
            .ec2
            .create_vpc()
            .cidr_block(cidr)
            .tag_specifications(ec2_tags(ResourceType::Vpc, tags))
            .send()
            .await
            .map_err(sdk_error)?;
        out.vpc()
            .and_then(|v| v.vpc_id())
            .map(str::to_string)
            .ok_or_else(|| malformed("vpc id"))
    }

    async fn vpc_state(&self, vpc_id: &str) -> CloudResult<String> {
        let out = self
            .ec2
            .describe_vpcs()
            .vpc_ids(vpc_id)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(out
            .vpcs()
            .first()
            .and_then(|v| v.state())
            .map(|s| s.as_str().to_string())
            .unwrap_or_default())
    }

    async fn delete_vpc(&self, vpc_id: &str) -> CloudResult<()> {
        self.ec2
            .delete_vpc()
            .vpc_id(vpc_id)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    async fn create_subnet(&self, vpc_id: &str, cidr: &str) -> CloudResult<String> {
        let out = self
            .ec2
            .create_subnet()
            .vpc_id(vpc_id)
            .cidr_block(cidr)
            .send()
            .await
            .map_err(sdk_error)?;
        out.subnet()
            .and_then(|s| s.subnet_id())
            .map(str::to_string)
            .ok_or_else(|| malformed("subnet id"))
    }

    async fn subnet_state(&self, subnet_id: &str) -> CloudResult<String> {
        let out = self
            .ec2
            .describe_subnets()
            .subnet_ids(subnet_id)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(out
            .subnets()
            .first()
            .and_then(|s| s.state())
            .map(|s| s.as_str().to_string())
            .unwrap_or_default())
    }

    async fn delete_subnet(&self, subnet_id: &str) -> CloudResult<()> {
        self.ec2
            .delete_subnet()
            .subnet_id(subnet_id)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    async fn get_service_quota(&self, service_code: &str, quota_code: &str) -> CloudResult<f64> {
        let out = self
            .quotas
            .get_service_quota()
            .service_code(service_code)
            .quota_code(quota_code)
            .send()
            .await
            .map_err(sdk_error)?;
        out.quota()
            .and_then(|q| q.value())
            .ok_or_else(|| malformed("quota value"))
    }

    async fn request_quota_increase(
        &self,
        service_code: &str,
        quota_code: &str,
        desired_value: f64,
    ) -> CloudResult<String> {
        let out = self
            .quotas
            .request_service_quota_increase()
            .service_code(service_code)
            .quota_code(quota_code)
            .desired_value(desired_value)
            .send()
            .await
            .map_err(sdk_error)?;
        out.requested_quota()
            .and_then(|q| q.id())
            .map(str::to_string)
            .ok_or_else(|| malformed("quota request id"))
    }

    async fn list_quota_history(
        &self,
        service_code: &str,
        quota_code: &str,
        next_token: Option<String>,
    ) -> CloudResult<Page<QuotaChange>> {
        let out = self
            .quotas
            .list_requested_service_quota_change_history_by_quota()
            .service_code(service_code)
            .quota_code(quota_code)
            .set_next_token(next_token)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(Page {
            items: out
                .requested_quotas()
                .iter()
                .map(|q| QuotaChange {
                    quota_code: q.quota_code().unwrap_or_default().to_string(),
                    desired_value: q.desired_value().unwrap_or_default(),
                    status: q.status().map(|s| s.as_str().to_string()).unwrap_or_default(),
                    case_id: q.case_id().map(str::to_string),
                })
                .collect(),
            marker: out.next_token().map(str::to_string),
        })
    }

    async fn create_case(&self, case: &SupportCase) -> CloudResult<String> {
        let out = self
            .support
            .create_case()
            .subject(&case.subject)
            .communication_body(&case.body)
            .category_code(&case.category_code)
            .service_code(&case.service_code)
            .issue_type(&case.issue_type)
            .severity_code(&case.severity_code)
            .language(&case.language)
            .send()
            .await
            .map_err(sdk_error)?;
        out.case_id()
            .map(str::to_string)
            .ok_or_else(|| malformed("case id"))
    }

    async fn case_status(&self, case_id: &str) -> CloudResult<String> {
        let out = self
            .support
            .describe_cases()
            .case_id_list(case_id)
            .include_resolved_cases(true)
            .send()
            .await
            .map_err(sdk_error)?;
        out.cases()
            .first()
            .and_then(|c| c.status())
            .map(str::to_string)
            .ok_or_else(|| CloudError::new(codes::CASE_ID_NOT_FOUND, case_id))
    }

    async fn get_region_opt_status(&self, region: &str) -> CloudResult<String> {
        let out = self
            .account
            .get_region_opt_status()
            .region_name(region)
            .send()
            .await
            .map_err(sdk_error)?;
        out.region_opt_status()
            .map(|s| s.as_str().to_string())
            .ok_or_else(|| malformed("region opt status"))
    }

    async fn enable_region(&self, region: &str) -> CloudResult<()> {
        self.account
            .enable_region()
            .region_name(region)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }
}

/// Builds [`AwsClient`]s from the operator's environment credentials
pub struct AwsClientBuilder {
    base: SdkConfig,
    kube: kube::Client,
}

impl AwsClientBuilder {
    /// Load the operator's credentials from the standard provider chain
    pub async fn from_env(kube: kube::Client) -> Self {
        let base = aws_config::defaults(BehaviorVersion::latest())
            .retry_config(sdk_retry_config())
            .load()
            .await;
        Self { base, kube }
    }

    fn client(&self, region: &str, credentials: Option<SdkCredentials>) -> Arc<dyn CloudClient> {
        let mut builder = self
            .base
            .to_builder()
            .region(Region::new(region.to_string()));
        if let Some(credentials) = credentials {
            builder = builder.credentials_provider(SharedCredentialsProvider::new(credentials));
        }
        Arc::new(AwsClient::new(&builder.build()))
    }
}

#[async_trait]
impl CloudClientBuilder for AwsClientBuilder {
    async fn setup_client(&self, region: &str) -> CloudResult<Arc<dyn CloudClient>> {
        Ok(self.client(region, None))
    }

    async fn client_from_credentials(
        &self,
        credentials: &Credentials,
        region: &str,
    ) -> CloudResult<Arc<dyn CloudClient>> {
        let credentials = SdkCredentials::new(
            &credentials.access_key_id,
            &credentials.secret_access_key,
            Some(credentials.session_token.clone()),
            None,
            "assumed-role",
        );
        Ok(self.client(region, Some(credentials)))
    }

    async fn customer_client(
        &self,
        secret: &SecretRef,
        region: &str,
    ) -> CloudResult<Arc<dyn CloudClient>> {
        debug!("Loading customer credentials from {}/{}", secret.namespace, secret.name);
        let api: Api<Secret> = Api::namespaced(self.kube.clone(), &secret.namespace);
        let stored = api
            .get(&secret.name)
            .await
            .map_err(|e| CloudError::new(CREDENTIALS_UNAVAILABLE, e.to_string()))?;

        let data = stored.data.unwrap_or_default();
        let field = |key: &str| -> CloudResult<String> {
            data.get(key)
                .and_then(|v| String::from_utf8(v.0.clone()).ok())
                .ok_or_else(|| {
                    CloudError::new(
                        CREDENTIALS_UNAVAILABLE,
                        format!("secret {}/{} has no {}", secret.namespace, secret.name, key),
                    )
                })
        };

        let credentials = SdkCredentials::new(
            field("aws_access_key_id")?,
            field("aws_secret_access_key")?,
            None,
            None,
            "byoc-secret",
        );
        Ok(self.client(region, Some(credentials)))
    }
}
