//! Error types for the Account controller

use std::time::Duration;

use thiserror::Error;

use crate::cloud::CloudError;

/// Error variants are named with the `Error` suffix for clarity (e.g., `KubeError`, `CloudError`).
#[allow(clippy::enum_variant_names)]
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Missing object key: {0}")]
    MissingObjectKey(&'static str),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Resource version conflict: {0}")]
    Conflict(String),

    #[error("Finalizer error: {0}")]
    FinalizerError(String),

    #[error("Cloud provider error: {0}")]
    CloudError(#[from] CloudError),

    #[error("Account creation error: {0}")]
    AccountCreationError(#[from] AccountCreationError),

    #[error("Support case error: {0}")]
    SupportCaseError(#[from] SupportCaseError),

    #[error("Invalid account claim: {0}")]
    InvalidClaim(String),

    #[error("Transient error (will retry): {0}")]
    TransientError(String),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::KubeError(e) => match e {
                kube::Error::Api(api_err) => {
                    // 4xx errors (except 409 Conflict, 429 TooManyRequests) are usually not retryable
                    let code = api_err.code;
                    if (400..500).contains(&code) {
                        return code == 409 || code == 429;
                    }
                    true
                }
                _ => true,
            },
            Error::Conflict(_) => true,
            Error::NotFound(_) => true,
            Error::FinalizerError(_) => true,
            Error::TransientError(_) => true,
            Error::CloudError(_) => true,
            Error::AccountCreationError(e) => !matches!(e, AccountCreationError::FailedCreateAccount),
            Error::SupportCaseError(_) => true,
            Error::InvalidConfig(_) => false,
            Error::InvalidClaim(_) => false,
            Error::SerializationError(_) => false,
            Error::MissingObjectKey(_) => false,
        }
    }

    /// Whether the object (or a dependency) no longer exists
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::KubeError(kube::Error::Api(api_err)) => api_err.code == 404,
            _ => false,
        }
    }

    /// Whether a write was rejected because the in-memory copy was stale
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict(_) => true,
            Error::KubeError(kube::Error::Api(api_err)) => api_err.code == 409,
            _ => false,
        }
    }

    /// Provider error code, if this error came from the provider
    pub fn cloud_code(&self) -> Option<&str> {
        match self {
            Error::CloudError(e) => Some(e.code.as_str()),
            _ => None,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Stable categories for account creation failures
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountCreationError {
    #[error("concurrent modification of the organization")]
    ConcurrentModification,
    #[error("account limit exceeded")]
    AccountLimitExceeded,
    #[error("internal failure at the provider")]
    InternalFailure,
    #[error("too many requests")]
    TooManyRequests,
    #[error("failed to create account")]
    FailedCreateAccount,
}

/// Stable categories for support case failures
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupportCaseError {
    #[error("support case creation limit exceeded")]
    CaseCreationLimitExceeded,
    #[error("internal failure at the provider")]
    InternalFailure,
    #[error("failed to create support case")]
    FailedCreateSupportCase,
    #[error("support case id not found")]
    CaseIdNotFound,
    #[error("failed to describe support case")]
    FailedDescribeSupportCase,
}

/// Exponential backoff configuration
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Initial delay for first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for each subsequent retry
    pub multiplier: f64,
    /// Random jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300), // 5 minutes
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    /// Calculate the backoff delay for a given retry attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay_secs =
            self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);

        let jitter_range = base_delay_secs * self.jitter;
        let jitter = rand::random::<f64>() * jitter_range * 2.0 - jitter_range;
        let delay_with_jitter = (base_delay_secs + jitter).max(0.0);

        let capped_delay = delay_with_jitter.min(self.max_delay.as_secs_f64());

        Duration::from_secs_f64(capped_delay)
    }

    /// Get the delay for an error, with different handling for retryable vs non-retryable
    pub fn delay_for_error(&self, error: &Error, attempt: u32) -> Duration {
        if error.is_retryable() {
            self.delay_for_attempt(attempt)
        } else {
            // Non-retryable errors wait for manual intervention
            self.max_delay
        }
    }
}
