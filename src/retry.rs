//! Backoff policy shared by connection and enqueue retries.

use std::time::Duration;

/// Exponential backoff with jitter and a capped attempt budget.
///
/// Both roles use the same policy: the producer for failed enqueues,
/// the consumer for reconnects after a lost connection.  The delay for
/// attempt `n` is `base_delay * 2^(n-1)`, clamped to `max_delay`, with
/// a random jitter factor spread so a fleet of sessions retrying at
/// once does not reconverge into a thundering herd.  Once `n` exceeds
/// `max_attempts` the policy yields nothing and the operation fails
/// for good.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
    jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Sets the delay before the first retry.
    #[must_use]
    pub fn with_base_delay(self, base_delay: Duration) -> Self {
        Self { base_delay, ..self }
    }

    /// Sets the ceiling the exponential growth is clamped to.
    #[must_use]
    pub fn with_max_delay(self, max_delay: Duration) -> Self {
        Self { max_delay, ..self }
    }

    /// Sets how many retries follow a first failure before giving up.
    #[must_use]
    pub fn with_max_attempts(self, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..self
        }
    }

    /// Sets the jitter spread, from 0.0 (none) to 1.0.
    #[must_use]
    pub fn with_jitter(self, jitter: f64) -> Self {
        Self { jitter, ..self }
    }

    /// The configured attempt budget.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// The wait before retrying after the `attempt`-th consecutive
    /// failure (counted from 1), or `None` once the budget is spent.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }

        // Cap the exponent; anything past it is clamped by max_delay
        // anyway.
        let exponent = attempt.saturating_sub(1).min(20);
        let factor = 1u32 << exponent;
        let delay = self
            .base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        if self.jitter > 0.0 {
            use rand::Rng;
            let mut rng = rand::thread_rng();
            let spread = 1.0 - self.jitter + (rng.gen::<f64>() * self.jitter * 2.0);
            Some(delay.mul_f64(spread))
        } else {
            Some(delay)
        }
    }
}

/// Drives [`Backend::connect`][crate::Backend::connect] under the
/// policy, failing with [`Error::ConnectFailed`][crate::Error::ConnectFailed]
/// once the budget is spent.
#[cfg(any(feature = "producer", feature = "consumer"))]
pub(crate) async fn connect_with_retry<B: crate::Backend>(
    backend: &mut B,
    policy: &RetryPolicy,
) -> crate::Result<()> {
    let mut attempt = 0u32;

    loop {
        match backend.connect().await {
            Ok(()) => return Ok(()),
            Err(error) if error.is_transient() => {
                attempt += 1;
                let Some(delay) = policy.delay(attempt) else {
                    return Err(crate::Error::ConnectFailed {
                        attempts: attempt,
                        source: Box::new(error),
                    });
                };

                tracing::warn!(
                    %error,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "connect failed; backing off before retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(error) => return Err(error),
        }
    }
}
