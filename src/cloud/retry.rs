//! Classify-and-retry wrapper for provider calls
//!
//! Every provider call goes through [`retry_cloud_call`] with a policy naming
//! the error codes that are worth retrying for that API family. Any other
//! error is returned immediately; exhausting attempts returns the last error.
//! Instance state reads are the exception: their poll loop already treats
//! every error as "not yet".
//!
//! This sits on top of the SDK's own retries, which the `aws` client caps at
//! ten attempts per request.

use std::future::Future;
use std::time::Duration;

use tracing::{error, warn};

use super::{CloudError, CloudResult, codes};

/// Retry policy for one family of provider calls
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each failure
    pub backoff_multiplier: f64,
    /// Error codes considered transient
    pub retryable_codes: &'static [&'static str],
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            retryable_codes: &[
                "Throttling",
                codes::TOO_MANY_REQUESTS,
                "InternalFailure",
                "ServiceUnavailable",
            ],
        }
    }
}

impl RetryPolicy {
    /// IAM and STS: eventual consistency surfaces as auth errors
    pub fn iam() -> Self {
        Self {
            max_attempts: 10,
            retryable_codes: &[
                "ServiceFailure",
                codes::INVALID_CLIENT_TOKEN_ID,
                codes::ACCESS_DENIED,
                "Throttling",
            ],
            ..Default::default()
        }
    }

    /// Service quota calls
    pub fn quota() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(3),
            backoff_multiplier: 1.0,
            retryable_codes: &[
                codes::ACCESS_DENIED_EXCEPTION,
                codes::SERVICE_EXCEPTION,
                codes::TOO_MANY_REQUESTS,
                "UnrecognizedClientException",
            ],
            ..Default::default()
        }
    }

    /// Region opt-in calls
    pub fn opt_in() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(3),
            backoff_multiplier: 1.0,
            retryable_codes: &[
                codes::ACCESS_DENIED_EXCEPTION,
                "InternalServerException",
                codes::TOO_MANY_REQUESTS,
                "UnrecognizedClientException",
            ],
            ..Default::default()
        }
    }

    /// Organizations calls; creation errors are classified by the caller
    pub fn organizations() -> Self {
        Self {
            retryable_codes: &[
                codes::SERVICE_EXCEPTION,
                codes::TOO_MANY_REQUESTS,
                "Throttling",
            ],
            ..Default::default()
        }
    }

    /// Support case calls
    pub fn support() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            retryable_codes: &[codes::INTERNAL_SERVER_ERROR, "Throttling", codes::TOO_MANY_REQUESTS],
            ..Default::default()
        }
    }

    /// Compute calls
    pub fn compute() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            retryable_codes: &[
                "RequestLimitExceeded",
                "InternalError",
                "Unavailable",
                codes::AUTH_FAILURE,
            ],
            ..Default::default()
        }
    }

    pub fn is_retryable(&self, err: &CloudError) -> bool {
        self.retryable_codes.iter().any(|c| err.is(c))
    }

    /// Delay before attempt `attempt + 1`, with 0.5x to 1.5x jitter
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        let jitter = 0.5 + rand::random::<f64>();
        Duration::from_secs_f64((capped * jitter).min(self.max_delay.as_secs_f64()))
    }
}

/// Run `operation` under `policy`
pub async fn retry_cloud_call<F, Fut, T>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> CloudResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = CloudResult<T>>,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !policy.is_retryable(&e) => return Err(e),
            Err(e) => {
                if attempt >= policy.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Cloud call failed after max retries"
                    );
                    return Err(e);
                }

                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = delay.as_millis(),
                    "Cloud call failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
