//! 重试策略
//! 暂时性失败按指数退避重试，其他错误立即返回

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::RetryPolicy;
use crate::scan::probe::ProbeError;

const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Delay before attempt `attempt + 1`, where `attempt` counts from 1.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(30) as i32;
    let secs = policy.initial_backoff.as_secs_f64() * policy.backoff_multiplier.powi(exp);
    if !secs.is_finite() || secs >= MAX_BACKOFF.as_secs_f64() {
        return MAX_BACKOFF;
    }
    Duration::from_secs_f64(secs.max(0.0))
}

/// Run `attempt_fn` until it succeeds, fails for good, or the token fires.
/// Each attempt is bounded by `deadline`.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    deadline: Duration,
    cancel: &CancellationToken,
    label: &str,
    mut attempt_fn: F,
) -> Result<T, ProbeError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ProbeError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let res = tokio::select! {
            _ = cancel.cancelled() => Err(ProbeError::Cancelled),
            res = tokio::time::timeout(deadline, attempt_fn(attempt)) => {
                res.unwrap_or(Err(ProbeError::Timeout(deadline)))
            }
        };

        match res {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let delay = backoff_delay(policy, attempt);
                debug!(label, attempt, ?delay, error = %e, "retrying");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ProbeError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
