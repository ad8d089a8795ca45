use std::{future::Future, time::Duration};

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::error::{KaikoError, KaikoResult};

/// Exponential backoff shared by segment downloads.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. `0` behaves like `1`.
    pub attempts: u32,
    /// Delay after the first failure, doubled for each following one.
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Adds up to half of `initial_delay` so parallel retries do not line up.
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn new(attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            attempts,
            initial_delay,
            max_delay,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay to wait after the failed attempt `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let delay = self
            .initial_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        let jitter_ms = self.initial_delay.as_millis() as u64 / 2;
        let room_ms = self.max_delay.saturating_sub(delay).as_millis() as u64;
        let jitter_ms = jitter_ms.min(room_ms);
        if !self.jitter || jitter_ms == 0 {
            return delay;
        }

        delay + Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
    }

    /// Runs `operation` until it succeeds, fails permanently or runs out of attempts.
    ///
    /// `operation` receives the 0-indexed attempt number. Only errors for which
    /// [KaikoError::is_transient] holds are retried. Cancellation interrupts the backoff
    /// and yields [KaikoError::Cancelled].
    pub async fn run<F, Fut, T>(&self, token: &CancellationToken, mut operation: F) -> KaikoResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = KaikoResult<T>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 0;
        loop {
            if token.is_cancelled() {
                return Err(KaikoError::Cancelled);
            }

            let error = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            attempt += 1;
            if !error.is_transient() || attempt >= attempts {
                return Err(error);
            }

            let delay = self.delay_for_attempt(attempt - 1);
            tracing::debug!(
                attempt,
                attempts,
                delay_ms = delay.as_millis() as u64,
                "Retrying after transient error: {error}"
            );
            tokio::select! {
                _ = token.cancelled() => return Err(KaikoError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
