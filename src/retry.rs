//! Bounded retry with exponential backoff, and a consecutive-failure circuit
//! breaker for outbound lookups.

use parking_lot::Mutex;
use std::fmt::Display;
use std::future::Future;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// total tries including the first one, never below 1
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            initial_backoff,
            max_backoff,
        }
    }

    /// single attempt, no waiting
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// delay before retry number `attempt` (1-based: the wait after the first failure is `backoff_for(1)`)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }

    /// Run `op` until it succeeds, the error is not retryable, or attempts
    /// run out. `op` receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut>(
        &self,
        label: &str,
        mut op: F,
        is_retryable: impl Fn(&E) -> bool,
    ) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.attempts && is_retryable(&e) => {
                    let wait = self.backoff_for(attempt);
                    tracing::warn!(
                        %label,
                        attempt,
                        max_attempts = self.attempts,
                        backoff_ms = wait.as_millis() as u64,
                        error = %e,
                        "attempt failed, retrying"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Opens after `threshold` consecutive failures and rejects calls for
/// `cooldown`. After the cooldown one trial call is let through; success
/// closes the breaker, failure re-opens it.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            state: Mutex::new(BreakerState::default()),
        }
    }

    pub fn allow(&self) -> bool {
        let mut state = self.state.lock();
        match state.opened_at {
            None => true,
            Some(opened) if opened.elapsed() >= self.cooldown => {
                // half-open: push the deadline out so only this caller probes
                state.opened_at = Some(Instant::now());
                true
            }
            Some(_) => false,
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures = 0;
        state.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        if state.consecutive_failures >= self.threshold {
            state.opened_at = Some(Instant::now());
        }
    }

    pub fn is_open(&self) -> bool {
        let state = self.state.lock();
        matches!(state.opened_at, Some(opened) if opened.elapsed() < self.cooldown)
    }
}
