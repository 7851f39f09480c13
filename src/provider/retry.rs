//! Shared retry/backoff and preemptive rate-limit machinery used by all
//! three adapters (`spec.md` §4.4 "shared adapter responsibilities").

use std::time::Duration;

use tokio::sync::Mutex;

use crate::error::MgitError;

/// Below this fraction of a provider's quota remaining, adapters start
/// sleeping proactively before issuing the next request. `spec.md` §9
/// leaves the exact threshold an open question and suggests 10% as a
/// reasonable default; see `DESIGN.md`.
const RATE_LIMIT_HEADROOM_PCT: f64 = 0.10;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryConfig {
    /// Default policy for adapter API calls: 3 attempts, exponential
    /// backoff with jitter starting at 200ms (`spec.md` §4.4).
    pub fn for_api() -> Self {
        RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
        }
    }
}

/// What an attempt closure reports back to `retry_with_backoff`.
pub enum Attempt<T> {
    Ok(T),
    /// A transient failure; retry after the given delay (from a
    /// `Retry-After` header) or the policy's computed backoff if `None`.
    Retryable { error: MgitError, retry_after: Option<Duration> },
    /// A non-retryable failure; return immediately.
    Fatal(MgitError),
}

/// Runs `f` up to `cfg.max_attempts` times, applying exponential backoff
/// with jitter between retryable attempts and honoring any `Retry-After`
/// hint the attempt reports.
pub async fn retry_with_backoff<T, F, Fut>(cfg: &RetryConfig, mut f: F) -> Result<T, MgitError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Attempt<T>>,
{
    let mut attempt = 0u32;
    loop {
        match f().await {
            Attempt::Ok(v) => return Ok(v),
            Attempt::Fatal(e) => return Err(e),
            Attempt::Retryable { error, retry_after } => {
                attempt += 1;
                if attempt >= cfg.max_attempts {
                    return Err(error);
                }
                let delay = retry_after.unwrap_or_else(|| backoff_delay(cfg.base_delay, attempt));
                tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, "retrying after transient failure");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exp = base.as_millis().saturating_mul(1u128 << attempt.min(8));
    let jitter = (exp / 4).max(1) as u128 * (attempt as u128 % 3);
    Duration::from_millis((exp + jitter).min(30_000) as u64)
}

#[derive(Debug, Default)]
struct RateLimitState {
    remaining: Option<u32>,
    limit: Option<u32>,
}

/// Tracks a provider's rate-limit headroom and sleeps proactively when it
/// drops below the configured threshold.
pub struct RateLimiter {
    state: Mutex<RateLimitState>,
}

impl RateLimiter {
    pub fn new() -> Self {
        RateLimiter {
            state: Mutex::new(RateLimitState::default()),
        }
    }

    /// Records the remaining/limit values from a response's rate-limit
    /// headers.
    pub async fn observe(&self, remaining: Option<u32>, limit: Option<u32>) {
        let mut state = self.state.lock().await;
        if remaining.is_some() {
            state.remaining = remaining;
        }
        if limit.is_some() {
            state.limit = limit;
        }
    }

    /// Sleeps briefly if remaining quota has dropped below the headroom
    /// threshold. Called before issuing the next request.
    pub async fn acquire(&self) {
        let state = self.state.lock().await;
        if let (Some(remaining), Some(limit)) = (state.remaining, state.limit) {
            if limit > 0 && (remaining as f64 / limit as f64) < RATE_LIMIT_HEADROOM_PCT {
                drop(state);
                tracing::debug!(remaining, limit, "approaching rate limit, backing off");
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
