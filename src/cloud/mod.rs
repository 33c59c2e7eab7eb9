//! Cloud provider abstraction
//!
//! The controller only talks to the provider through [`CloudClient`], built by
//! an injected [`CloudClientBuilder`]. Role assumption is a separate
//! [`RoleAssumer`] strategy so tests can substitute it without touching
//! global state.

pub mod retry;

#[cfg(feature = "aws")]
pub mod aws;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;

use crate::crd::SecretRef;

pub use retry::{RetryPolicy, retry_cloud_call};

/// Region used for account-wide (non-regional) calls
pub const DEFAULT_REGION: &str = "us-east-1";

/// Session name used when assuming roles into managed accounts
pub const ROLE_SESSION_NAME: &str = "awsAccountOperator";

/// Error returned by the provider, keyed by its stable error code
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct CloudError {
    pub code: String,
    pub message: String,
}

impl CloudError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Check the provider error code
    pub fn is(&self, code: &str) -> bool {
        self.code == code
    }
}

pub type CloudResult<T> = std::result::Result<T, CloudError>;

/// Well-known provider error codes
pub mod codes {
    pub const ACCESS_DENIED: &str = "AccessDenied";
    pub const ACCESS_DENIED_EXCEPTION: &str = "AccessDeniedException";
    pub const AUTH_FAILURE: &str = "AuthFailure";
    pub const CASE_CREATION_LIMIT_EXCEEDED: &str = "CaseCreationLimitExceeded";
    pub const CASE_ID_NOT_FOUND: &str = "CaseIdNotFound";
    pub const CONCURRENT_MODIFICATION: &str = "ConcurrentModificationException";
    pub const CONSTRAINT_VIOLATION: &str = "ConstraintViolationException";
    pub const DRY_RUN_OPERATION: &str = "DryRunOperation";
    pub const ENTITY_ALREADY_EXISTS: &str = "EntityAlreadyExists";
    pub const INTERNAL_SERVER_ERROR: &str = "InternalServerError";
    pub const INVALID_CLIENT_TOKEN_ID: &str = "InvalidClientTokenId";
    pub const INVALID_INSTANCE_TYPE: &str = "InvalidInstanceType";
    pub const NO_SUCH_ENTITY: &str = "NoSuchEntity";
    pub const OPT_IN_REQUIRED: &str = "OptInRequired";
    pub const RESOURCE_ALREADY_EXISTS: &str = "ResourceAlreadyExistsException";
    pub const SERVICE_EXCEPTION: &str = "ServiceException";
    pub const TOO_MANY_REQUESTS: &str = "TooManyRequestsException";
    pub const UNAUTHORIZED_OPERATION: &str = "UnauthorizedOperation";
    pub const VALIDATION_EXCEPTION: &str = "ValidationException";
}

/// Temporary credentials returned by role assumption
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    pub expiration: Option<DateTime<Utc>>,
}

/// One page of a marker-paginated listing
#[derive(Clone, Debug, Default)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub marker: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct IamUser {
    pub name: String,
    pub arn: String,
    pub tags: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct IamRole {
    pub name: String,
    pub id: String,
    pub arn: String,
    pub tags: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AccessKey {
    pub id: String,
    pub secret: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateAccountState {
    InProgress,
    Succeeded,
    Failed,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CreateAccountStatus {
    pub state: CreateAccountState,
    pub account_id: Option<String>,
    pub failure_reason: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MachineImage {
    pub id: String,
    pub name: String,
    pub architecture: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunInstanceRequest {
    pub image_id: String,
    pub instance_type: String,
    pub subnet_id: Option<String>,
    pub tags: BTreeMap<String, String>,
    /// KMS key for the encrypted root volume; the provider default when unset
    pub kms_key_id: Option<String>,
}

/// One entry of a quota's request history
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QuotaChange {
    pub quota_code: String,
    pub desired_value: f64,
    pub status: String,
    pub case_id: Option<String>,
}

/// Parameters of a support case
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SupportCase {
    pub subject: String,
    pub body: String,
    pub category_code: String,
    pub service_code: String,
    pub issue_type: String,
    pub severity_code: String,
    pub language: String,
}

/// Provider operations used by the account controller
#[async_trait]
pub trait CloudClient: Send + Sync {
    // Identity and organization
    async fn create_account(&self, name: &str, email: &str) -> CloudResult<String>;
    async fn describe_create_account_status(&self, request_id: &str)
    -> CloudResult<CreateAccountStatus>;
    async fn tag_account(&self, account_id: &str, tags: &BTreeMap<String, String>)
    -> CloudResult<()>;
    async fn caller_arn(&self) -> CloudResult<String>;
    async fn assume_role(&self, role_arn: &str, session_name: &str) -> CloudResult<Credentials>;

    // IAM
    async fn get_user(&self, name: &str) -> CloudResult<Option<IamUser>>;
    async fn create_user(&self, name: &str, tags: &BTreeMap<String, String>)
    -> CloudResult<IamUser>;
    async fn delete_user(&self, name: &str) -> CloudResult<()>;
    async fn list_users(&self, marker: Option<String>) -> CloudResult<Page<String>>;
    async fn attach_user_policy(&self, user: &str, policy_arn: &str) -> CloudResult<()>;
    async fn detach_user_policy(&self, user: &str, policy_arn: &str) -> CloudResult<()>;
    async fn list_attached_user_policies(&self, user: &str) -> CloudResult<Vec<String>>;
    async fn create_access_key(&self, user: &str) -> CloudResult<AccessKey>;
    async fn list_access_keys(&self, user: &str) -> CloudResult<Vec<String>>;
    async fn delete_access_key(&self, user: &str, key_id: &str) -> CloudResult<()>;
    async fn get_role(&self, name: &str) -> CloudResult<Option<IamRole>>;
    async fn create_role(
        &self,
        name: &str,
        trust_policy: &str,
        tags: &BTreeMap<String, String>,
    ) -> CloudResult<IamRole>;
    async fn delete_role(&self, name: &str) -> CloudResult<()>;
    async fn list_roles(&self, marker: Option<String>) -> CloudResult<Page<String>>;
    async fn attach_role_policy(&self, role: &str, policy_arn: &str) -> CloudResult<()>;
    async fn detach_role_policy(&self, role: &str, policy_arn: &str) -> CloudResult<()>;
    async fn list_attached_role_policies(&self, role: &str) -> CloudResult<Vec<String>>;

    // Compute
    async fn list_enabled_regions(&self) -> CloudResult<Vec<String>>;
    async fn dry_run_describe_instances(&self) -> CloudResult<()>;
    async fn describe_instance_types(&self, instance_types: &[String]) -> CloudResult<Vec<String>>;
    async fn describe_images(
        &self,
        owner: &str,
        architecture: &str,
        executable_by: &str,
    ) -> CloudResult<Vec<MachineImage>>;
    async fn run_instance(&self, request: &RunInstanceRequest) -> CloudResult<String>;
    async fn instance_state(&self, instance_id: &str) -> CloudResult<Option<i32>>;
    async fn terminate_instances(&self, instance_ids: &[String]) -> CloudResult<()>;
    /// Running instances of `instance_type` carrying every tag key in `tag_keys`
    async fn find_tagged_instances(
        &self,
        instance_type: &str,
        tag_keys: &[String],
    ) -> CloudResult<Vec<String>>;
    async fn create_vpc(&self, cidr: &str, tags: &BTreeMap<String, String>)
    -> CloudResult<String>;
    async fn vpc_state(&self, vpc_id: &str) -> CloudResult<String>;
    async fn delete_vpc(&self, vpc_id: &str) -> CloudResult<()>;
    async fn create_subnet(&self, vpc_id: &str, cidr: &str) -> CloudResult<String>;
    async fn subnet_state(&self, subnet_id: &str) -> CloudResult<String>;
    async fn delete_subnet(&self, subnet_id: &str) -> CloudResult<()>;

    // Quotas
    async fn get_service_quota(&self, service_code: &str, quota_code: &str) -> CloudResult<f64>;
    /// Submit an increase request, returning the provider's request id
    async fn request_quota_increase(
        &self,
        service_code: &str,
        quota_code: &str,
        desired_value: f64,
    ) -> CloudResult<String>;
    async fn list_quota_history(
        &self,
        service_code: &str,
        quota_code: &str,
        next_token: Option<String>,
    ) -> CloudResult<Page<QuotaChange>>;

    // Support
    async fn create_case(&self, case: &SupportCase) -> CloudResult<String>;
    async fn case_status(&self, case_id: &str) -> CloudResult<String>;

    // Region opt-in
    async fn get_region_opt_status(&self, region: &str) -> CloudResult<String>;
    async fn enable_region(&self, region: &str) -> CloudResult<()>;
}

/// Factory for provider clients
#[async_trait]
pub trait CloudClientBuilder: Send + Sync {
    /// Client using the operator's own credentials
    async fn setup_client(&self, region: &str) -> CloudResult<Arc<dyn CloudClient>>;

    /// Client using temporary credentials from role assumption
    async fn client_from_credentials(
        &self,
        credentials: &Credentials,
        region: &str,
    ) -> CloudResult<Arc<dyn CloudClient>>;

    /// Client using a customer's credentials secret (BYOC)
    async fn customer_client(
        &self,
        secret: &SecretRef,
        region: &str,
    ) -> CloudResult<Arc<dyn CloudClient>>;
}

/// A client operating inside a managed account, plus the credentials behind it
#[derive(Clone)]
pub struct AssumedRole {
    pub client: Arc<dyn CloudClient>,
    pub credentials: Credentials,
}

/// Strategy for entering a managed account
#[async_trait]
pub trait RoleAssumer: Send + Sync {
    async fn assume_role(
        &self,
        setup: &dyn CloudClient,
        account_id: &str,
        role_name: &str,
        region: &str,
    ) -> CloudResult<AssumedRole>;
}

/// Default role assumption through STS
pub struct StsRoleAssumer {
    builder: Arc<dyn CloudClientBuilder>,
    policy: RetryPolicy,
}

impl StsRoleAssumer {
    pub fn new(builder: Arc<dyn CloudClientBuilder>) -> Self {
        Self {
            builder,
            policy: RetryPolicy::iam(),
        }
    }
}

#[async_trait]
impl RoleAssumer for StsRoleAssumer {
    async fn assume_role(
        &self,
        setup: &dyn CloudClient,
        account_id: &str,
        role_name: &str,
        region: &str,
    ) -> CloudResult<AssumedRole> {
        let role_arn = role_arn(account_id, role_name);
        debug!("Assuming role {}", role_arn);

        // A freshly created role can take a while to become assumable
        let credentials = retry_cloud_call(&self.policy, "assume_role", || {
            setup.assume_role(&role_arn, ROLE_SESSION_NAME)
        })
        .await?;

        let client = self
            .builder
            .client_from_credentials(&credentials, region)
            .await?;

        Ok(AssumedRole {
            client,
            credentials,
        })
    }
}

pub fn role_arn(account_id: &str, role_name: &str) -> String {
    format!("arn:aws:iam::{}:role/{}", account_id, role_name)
}

/// Walk every page of a marker-paginated listing
pub async fn collect_pages<T, F, Fut>(mut fetch: F) -> CloudResult<Vec<T>>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: std::future::Future<Output = CloudResult<Page<T>>>,
{
    let mut items = Vec::new();
    let mut marker = None;
    loop {
        let page = fetch(marker).await?;
        items.extend(page.items);
        match page.marker {
            Some(next) => marker = Some(next),
            None => return Ok(items),
        }
    }
}
