use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use prost::Message;
use tokio_util::sync::CancellationToken;
use tonic::{Code, Status};
use tracing::{error, warn};

use crate::proto::rpc;

/// Bounded-exponential retry configuration shared by every remote
/// invocation.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Number of retries after the initial attempt.
    pub retry_limit: u32,
    /// Base delay; attempt `k` waits `base * 1.6^k`.
    pub retry_delay_base: Duration,
    /// Client-wide per-attempt timeout. `None` means no timeout.
    pub request_timeout: Option<Duration>,
    retryable: HashSet<Code>,
}

impl RetryPolicy {
    pub fn new(retry_limit: u32, retry_delay_base: Duration) -> Self {
        let mut retryable = HashSet::new();
        retryable.insert(Code::Unavailable);
        Self {
            retry_limit,
            retry_delay_base,
            request_timeout: None,
            retryable,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_retryable_code(mut self, code: Code) -> Self {
        self.retryable.insert(code);
        self
    }

    fn is_retryable(&self, status: &Status) -> bool {
        self.retryable.contains(&status.code())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(4, Duration::from_millis(1000))
    }
}

/// Wraps gRPC invocations with retries, per-attempt timeouts and cooperative
/// cancellation.
///
/// Status-code special cases that are not errors (NOT_FOUND on an
/// action-cache lookup, ALREADY_EXISTS on an action-cache update) are mapped
/// by the invocation closure itself, so the retrier only ever sees genuine
/// failures.
#[derive(Clone)]
pub struct Retrier {
    policy: RetryPolicy,
    stop_token: CancellationToken,
}

impl Retrier {
    pub fn new(policy: RetryPolicy, stop_token: CancellationToken) -> Self {
        Self { policy, stop_token }
    }

    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop_token
    }

    /// Issue `invocation` with the policy's client-wide timeout.
    pub async fn issue<T, F, Fut>(&self, name: &str, invocation: F) -> Result<T, Status>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Status>>,
    {
        self.issue_with_timeout(name, None, invocation).await
    }

    /// Issue `invocation`, bounding each attempt by the minimum non-zero of
    /// `timeout` and the client-wide default.
    pub async fn issue_with_timeout<T, F, Fut>(
        &self,
        name: &str,
        timeout: Option<Duration>,
        mut invocation: F,
    ) -> Result<T, Status>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Status>>,
    {
        let timeout = min_nonzero(timeout, self.policy.request_timeout);
        let mut delay_base = self.policy.retry_delay_base;
        let mut attempts: u32 = 0;
        loop {
            if self.stop_token.is_cancelled() {
                return Err(Status::cancelled(format!("{} cancelled", name)));
            }

            let result = match timeout {
                Some(timeout) => match tokio::time::timeout(timeout, invocation()).await {
                    Ok(result) => result,
                    Err(_) => Err(Status::deadline_exceeded(format!(
                        "{} timed out after {:?} (client timeout)",
                        name, timeout
                    ))),
                },
                None => invocation().await,
            };

            // A stop raised mid-attempt lets the attempt complete, but its
            // result is discarded and no more attempts are made.
            if self.stop_token.is_cancelled() {
                return Err(Status::cancelled(format!("{} cancelled", name)));
            }

            let status = match result {
                Ok(value) => return Ok(value),
                Err(status) => status,
            };

            if !self.policy.is_retryable(&status) {
                error!(invocation = name, code = ?status.code(), message = status.message(),
                       "request failed");
                return Err(status);
            }

            // The error might contain a RetryInfo message specifying how
            // long to wait before retrying; honored verbatim once, on the
            // first failure.
            if attempts == 0 {
                if let Some(server_delay) = retry_delay_from_status(&status) {
                    delay_base = server_delay;
                }
            }

            if attempts >= self.policy.retry_limit {
                error!(
                    invocation = name,
                    retry_limit = self.policy.retry_limit,
                    code = ?status.code(),
                    message = status.message(),
                    "retry limit exceeded"
                );
                return Err(status);
            }

            let delay = delay_for_attempt(delay_base, attempts);
            warn!(
                invocation = name,
                attempt = attempts + 1,
                total = self.policy.retry_limit + 1,
                code = ?status.code(),
                message = status.message(),
                delay_ms = delay.as_millis() as u64,
                "retrying failed request"
            );
            tokio::time::sleep(delay).await;
            attempts += 1;
        }
    }
}

/// Delay schedule: attempt `k` waits `base * 1.6^k`.
fn delay_for_attempt(base: Duration, attempt: u32) -> Duration {
    base.mul_f64(1.6f64.powi(attempt as i32))
}

/// The minimum of two optional timeouts, treating `None` as "no limit".
fn min_nonzero(a: Option<Duration>, b: Option<Duration>) -> Option<Duration> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, b) => b,
    }
}

/// Extract a server-hinted retry delay from the `grpc-status-details-bin`
/// payload of a failed RPC, if any.
fn retry_delay_from_status(status: &Status) -> Option<Duration> {
    let details = rpc::Status::decode(status.details()).ok()?;
    for any in &details.details {
        if any.type_url != rpc::RETRY_INFO_TYPE_URL {
            continue;
        }
        let retry_info = rpc::RetryInfo::decode(any.value.as_slice()).ok()?;
        let delay = retry_info.retry_delay?;
        if delay.seconds < 0 || delay.nanos < 0 {
            continue;
        }
        let delay = Duration::new(delay.seconds as u64, delay.nanos as u32);
        if !delay.is_zero() {
            return Some(delay);
        }
    }
    None
}
