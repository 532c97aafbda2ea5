use std::future::Future;
use std::time::Duration;

use foundation::CancelFlag;
use rand::Rng;
use tracing::debug;

use crate::error::LoadError;

/// Bounded retry with exponential backoff and jitter, applied per source.
///
/// State is per call; nothing is shared between concurrent resolutions.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first. Zero behaves like one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub factor: u32,
    pub max_delay: Duration,
    /// Fraction of the delay added or removed at random (0.2 = ±20%).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            factor: 2,
            max_delay: Duration::from_secs(5),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// Un-jittered delay after the `retry`-th failed attempt (0-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let mult = self.factor.max(1).saturating_pow(retry);
        self.base_delay.saturating_mul(mult).min(self.max_delay)
    }

    fn jittered<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let secs = delay.as_secs_f64();
        let spread = secs * self.jitter.min(1.0);
        let offset = rng.gen_range(-spread..=spread);
        Duration::from_secs_f64((secs + offset).max(0.0))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome<T> {
    Success { value: T, attempts: u32 },
    /// A non-retryable failure; no further attempts were made.
    Terminal { error: LoadError, attempts: u32 },
    /// Every attempt failed with a retryable error.
    Exhausted { last: LoadError, attempts: u32 },
    /// The cancel flag was observed before an attempt.
    Cancelled { attempts: u32 },
}

impl<T> RetryOutcome<T> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Success { attempts, .. }
            | RetryOutcome::Terminal { attempts, .. }
            | RetryOutcome::Exhausted { attempts, .. }
            | RetryOutcome::Cancelled { attempts } => *attempts,
        }
    }
}

/// Runs `op` until it succeeds, fails terminally, or runs out of attempts.
///
/// Each attempt is bounded by `attempt_timeout`; a timeout counts as a
/// retryable failure. `cancel` is checked before every attempt.
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    attempt_timeout: Duration,
    cancel: &CancelFlag,
    mut op: F,
) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, LoadError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return RetryOutcome::Cancelled { attempts: attempt };
        }
        attempt += 1;

        let result = match tokio::time::timeout(attempt_timeout, op(attempt)).await {
            Ok(r) => r,
            Err(_) => Err(LoadError::Timeout(attempt_timeout)),
        };

        let error = match result {
            Ok(value) => return RetryOutcome::Success { value, attempts: attempt },
            Err(e) if !e.is_retryable() => {
                return RetryOutcome::Terminal { error: e, attempts: attempt };
            }
            Err(e) => e,
        };

        if attempt >= max_attempts {
            return RetryOutcome::Exhausted { last: error, attempts: attempt };
        }

        // The rng must not live across the await.
        let delay = {
            let mut rng = rand::thread_rng();
            policy.jittered(policy.backoff(attempt - 1), &mut rng)
        };
        debug!("attempt {attempt}/{max_attempts} failed ({error}), retrying in {delay:?}");
        tokio::time::sleep(delay).await;
    }
}
