//! Retry with exponential backoff, and the global request pacing gate.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use mineassembler_shared::{ApiConfig, ApiError};

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// How often and how patiently a call is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, first try included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay slept after the failed attempt number `attempt` (0-based):
    /// `base × 2^attempt`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let delay_ms = 2u64
            .checked_pow(attempt)
            .and_then(|factor| base_ms.checked_mul(factor))
            .unwrap_or(u64::MAX);
        Duration::from_millis(delay_ms).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::from(&ApiConfig::default())
    }
}

impl From<&ApiConfig> for RetryPolicy {
    fn from(config: &ApiConfig) -> Self {
        Self {
            max_attempts: config.retry_attempts.max(1),
            base_delay: Duration::from_millis(config.backoff_base_ms),
            max_delay: Duration::from_millis(config.backoff_cap_ms),
        }
    }
}

/// Run `op` until it succeeds, fails permanently, or `policy.max_attempts`
/// attempts have been spent. Only `Transient` and `RateLimited` are retried.
pub async fn with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt + 1 < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    call = label,
                    attempt = attempt + 1,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after backoff"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                if err.is_retryable() {
                    warn!(call = label, attempts = attempt + 1, error = %err, "giving up");
                }
                return Err(err);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// PacingGate
// ---------------------------------------------------------------------------

/// Inserts a fixed pause after every `every` calls, whatever their outcome.
///
/// While the pause runs no other call may start, so concurrent callers share
/// one budget.
#[derive(Debug)]
pub struct PacingGate {
    every: u32,
    pause: Duration,
    calls: AtomicU64,
    hold: Mutex<()>,
}

impl PacingGate {
    /// `every == 0` or a zero pause disables pacing.
    pub fn new(every: u32, pause: Duration) -> Self {
        Self {
            every,
            pause,
            calls: AtomicU64::new(0),
            hold: Mutex::new(()),
        }
    }

    pub fn disabled() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Wait for any pause in progress.
    pub async fn before_call(&self) {
        drop(self.hold.lock().await);
    }

    /// Count a finished call and pause if it completes a block of `every`.
    pub async fn after_call(&self) {
        let n = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        if self.every == 0 || self.pause.is_zero() || n % u64::from(self.every) != 0 {
            return;
        }
        let _held = self.hold.lock().await;
        debug!(calls = n, pause_ms = self.pause.as_millis() as u64, "pacing pause");
        tokio::time::sleep(self.pause).await;
    }

    /// Calls counted so far.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

impl From<&ApiConfig> for PacingGate {
    fn from(config: &ApiConfig) -> Self {
        Self::new(
            config.pacing_every,
            Duration::from_millis(config.pacing_pause_ms),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tokio::time::Instant;

    fn policy(attempts: u32, base_ms: u64, cap_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max_attempts: attempts,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(cap_ms),
        }
    }

    #[test]
    fn delay_doubles_and_caps() {
        let p = policy(10, 100, 1_000);
        assert_eq!(p.delay_for(0), Duration::from_millis(100));
        assert_eq!(p.delay_for(1), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(800));
        assert_eq!(p.delay_for(4), Duration::from_millis(1_000));
        assert_eq!(p.delay_for(63), Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn always_transient_fails_after_exact_attempts() {
        let p = policy(4, 100, 10_000);
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        let result: Result<(), ApiError> = with_backoff(&p, "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ApiError::Transient("boom".into()))
        })
        .await;

        assert_eq!(result, Err(ApiError::Transient("boom".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        // 100 + 200 + 400
        assert_eq!(start.elapsed(), Duration::from_millis(700));
    }

    #[tokio::test(start_paused = true)]
    async fn cumulative_delay_respects_cap() {
        let p = policy(5, 1_000, 2_500);
        let start = Instant::now();

        let _ = with_backoff(&p, "test", || async {
            Err::<(), _>(ApiError::RateLimited("429".into()))
        })
        .await;

        // 1000 + 2000 + 2500 + 2500
        assert_eq!(start.elapsed(), Duration::from_millis(8_000));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_are_not_retried() {
        let p = policy(5, 100, 1_000);
        for err in [
            ApiError::NotFound("1003".into()),
            ApiError::Unauthorized("/project/relationships".into()),
        ] {
            let calls = AtomicU32::new(0);
            let start = Instant::now();
            let result: Result<(), ApiError> = with_backoff(&p, "test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                let err = err.clone();
                async move { Err(err) }
            })
            .await;
            assert_eq!(result, Err(err));
            assert_eq!(calls.load(Ordering::SeqCst), 1);
            assert_eq!(start.elapsed(), Duration::ZERO);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_blip() {
        let p = policy(3, 50, 1_000);
        let calls = AtomicU32::new(0);
        let value = with_backoff(&p, "test", || async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(ApiError::Transient("reset".into()))
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(value, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn pacing_pauses_every_n_calls() {
        let gate = PacingGate::new(2, Duration::from_secs(1));
        let start = Instant::now();
        for _ in 0..5 {
            gate.before_call().await;
            gate.after_call().await;
        }
        assert_eq!(gate.calls(), 5);
        // Pauses after calls 2 and 4.
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_gate_never_sleeps() {
        let gate = PacingGate::disabled();
        let start = Instant::now();
        for _ in 0..10 {
            gate.before_call().await;
            gate.after_call().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
