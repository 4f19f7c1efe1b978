//! Retry with exponential back-off and jitter for collaborator calls.
//!
//! Collaborators (scanners, research executors, loaders, health checks)
//! talk to the outside world and fail transiently. [`retry_with_backoff`]
//! wraps one call; the store layer never retries.

use std::future::Future;
use std::time::Duration;

use crate::config::RetryConfig;

const MAX_DELAY_MS: u64 = 60_000;

/// Delay before retry number `attempt` (1-based), before jitter.
fn base_delay_ms(backoff_base_ms: u64, attempt: u32) -> u64 {
    backoff_base_ms
        .saturating_mul(1u64 << (attempt.saturating_sub(1)).min(10))
        .min(MAX_DELAY_MS)
}

/// Longest total sleep `retry_with_backoff` can spend between attempts,
/// with jitter at its upper bound.
pub fn worst_case_backoff(policy: &RetryConfig) -> Duration {
    let total_ms: u64 = (1..=policy.max_retries)
        .map(|attempt| base_delay_ms(policy.backoff_base_ms, attempt) * 5 / 4)
        .sum();
    Duration::from_millis(total_ms)
}

/// Runs `operation` with up to `policy.max_retries` additional attempts.
///
/// Back-off schedule with `backoff_base_ms = 500`:
///
/// | Retry | Sleep before it            |
/// |-------|----------------------------|
/// | 1     | 500 ms × 2⁰ ± 25 % jitter  |
/// | 2     | 500 ms × 2¹ ± 25 % jitter  |
/// | 3     | 500 ms × 2² ± 25 % jitter  |
///
/// Delay is capped at 60 s. The last error is returned once retries run out.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryConfig,
    label: &str,
    mut operation: F,
) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= policy.max_retries {
                    return Err(err);
                }
                attempt += 1;
                let capped = base_delay_ms(policy.backoff_base_ms, attempt);
                let delay_ms = (capped as f64 * (rand::random::<f64>() * 0.5 + 0.75)) as u64;
                tracing::warn!(
                    call = label,
                    attempt,
                    max_retries = policy.max_retries,
                    delay_ms,
                    error = %err,
                    "collaborator call failed, retrying after back-off"
                );
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
        }
    }
}
