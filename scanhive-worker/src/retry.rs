/// Retry policy for transient scanner failures
///
/// Exponential backoff with full jitter on top: attempt `n` waits
/// `min(cap, base * 2^(n-1))` plus up to 25% extra, so a fleet of workers
/// hammered by the same outage does not retry in lockstep. The same policy
/// also hands out the idle backoff used when a pool has no free capacity.
use rand::Rng;
use std::time::Duration;

/// Default transient-retry attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default backoff base.
pub const DEFAULT_BASE: Duration = Duration::from_secs(1);

/// Default backoff cap.
pub const DEFAULT_CAP: Duration = Duration::from_secs(30);

/// Exponential backoff policy
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts before giving up (first try included)
    pub max_attempts: u32,

    /// First delay
    pub base: Duration,

    /// Upper bound for any delay
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base: DEFAULT_BASE,
            cap: DEFAULT_CAP,
        }
    }
}

impl RetryPolicy {
    /// Policy scaled down for tests.
    pub fn fast() -> Self {
        RetryPolicy {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base: Duration::from_millis(5),
            cap: Duration::from_millis(20),
        }
    }

    /// Deterministic part of the delay before attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let raw = self.base.saturating_mul(1u32 << exp);
        raw.min(self.cap)
    }

    /// Backoff with up to 25% jitter added.
    pub fn jittered_backoff(&self, attempt: u32) -> Duration {
        jitter(self.backoff(attempt))
    }
}

/// Adds up to 25% random extra to a delay.
pub fn jitter(base: Duration) -> Duration {
    let extra = rand::thread_rng().gen_range(0.0..=0.25);
    base.mul_f64(1.0 + extra)
}
