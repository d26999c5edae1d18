//! Retry With Backoff
//!
//! Shared retry primitive for coordination reconnection (unbounded) and
//! reconciliation's wait for a session (bounded).

use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// Exponential backoff policy
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Delay before the second attempt
    pub initial: Duration,
    /// Upper bound for any single delay
    pub max: Duration,
    /// Growth factor between attempts
    pub multiplier: u32,
    /// Total attempts allowed (`None` retries forever)
    pub max_attempts: Option<u32>,
    /// Randomize each delay by up to +/-25%
    pub jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(200),
            max: Duration::from_secs(5),
            multiplier: 2,
            max_attempts: None,
            jitter: true,
        }
    }
}

impl Backoff {
    /// Unbounded policy between `initial` and `max`
    pub fn unbounded(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            ..Self::default()
        }
    }

    /// Fixed-interval policy with a bounded number of attempts
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            initial: interval,
            max: interval,
            multiplier: 1,
            max_attempts: Some(max_attempts),
            jitter: false,
        }
    }

    /// Delay to wait after the given (1-based) failed attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1).saturating_pow(attempt.saturating_sub(1));
        let base = self.initial.saturating_mul(factor).min(self.max);

        if !self.jitter || base.is_zero() {
            return base;
        }

        let spread = base.as_millis() as u64 / 4;
        let offset = rand::thread_rng().gen_range(0..=spread * 2);
        (base + Duration::from_millis(offset))
            .saturating_sub(Duration::from_millis(spread))
            .min(self.max)
    }

    /// Whether another attempt is allowed after `attempt` failures
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt < max)
    }
}

/// Run `op` until it succeeds or the policy gives up.
///
/// Returns the last error when attempts are exhausted.
pub async fn retry<T, E, F, Fut>(policy: &Backoff, what: &str, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!("{} succeeded after {} attempts", what, attempt);
                }
                return Ok(value);
            }
            Err(e) => {
                if !policy.allows(attempt) {
                    tracing::warn!("{} failed after {} attempts: {}", what, attempt, e);
                    return Err(e);
                }
                let delay = policy.delay_for(attempt);
                tracing::debug!("{} failed (attempt {}): {}; retrying in {:?}", what, attempt, e, delay);
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Poll `check` until it returns true or the policy gives up
pub async fn wait_until<F, Fut>(policy: &Backoff, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        if check().await {
            return true;
        }
        if !policy.allows(attempt) {
            return false;
        }
        tokio::time::sleep(policy.delay_for(attempt)).await;
    }
}
