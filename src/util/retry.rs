//! Retry with exponential backoff and jitter.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{Result, SessionError};

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    /// Initial backoff duration.
    pub initial_backoff: Duration,
    /// Maximum backoff duration.
    pub max_backoff: Duration,
    /// Backoff multiplier.
    pub multiplier: f64,
    /// Spread delays over 75%-125% of the nominal backoff.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt is allowed after `attempt` failures (1-based).
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before retry number `attempt` (1-based). A provider-supplied
    /// `retry_after` wins over the computed backoff but is still capped.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(after) = retry_after {
            return after.min(self.max_backoff);
        }
        let exponent = attempt.saturating_sub(1) as i32;
        let nominal = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = nominal.min(self.max_backoff.as_secs_f64());
        let factor = if self.jitter {
            0.75 + (rand_factor() * 0.5)
        } else {
            1.0
        };
        Duration::from_secs_f64((capped * factor).min(self.max_backoff.as_secs_f64()))
    }

    /// Sleep for `delay`, returning early with `Aborted` when the token fires.
    pub async fn wait(&self, delay: Duration, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            _ = cancel.cancelled() => Err(SessionError::Aborted),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

/// Simple pseudo-random factor [0, 1) without pulling in rand crate.
fn rand_factor() -> f64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .hash(&mut hasher);
    std::thread::current().id().hash(&mut hasher);

    let hash = hasher.finish();
    (hash % 10000) as f64 / 10000.0
}
