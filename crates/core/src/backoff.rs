//! Capped exponential backoff with jitter.
//!
//! Every retried operation in the client (job fetches, asset downloads,
//! result uploads) shares this policy: delays start at
//! [`BackoffPolicy::base`], grow by [`BackoffPolicy::multiplier`] after
//! each failure, and are clamped to [`BackoffPolicy::cap`]. A jitter of
//! ±[`BackoffPolicy::jitter`] is applied on top so a fleet of workers
//! does not hammer the server in lockstep.

use std::time::Duration;

use rand::Rng;

/// Tunable parameters for the exponential-backoff strategy.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,
    /// Upper bound on the delay between attempts.
    pub cap: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
    /// Fractional jitter applied to each delay (0.2 = ±20 %).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Calculate the delay that follows `current`, clamped to the cap.
    pub fn next_delay(&self, current: Duration) -> Duration {
        let next_ms = (current.as_millis() as f64 * self.multiplier) as u64;
        Duration::from_millis(next_ms).min(self.cap)
    }
}

/// Stateful delay sequence for one retried operation.
///
/// [`Backoff::next`] yields the strictly increasing (until capped) base
/// sequence; call [`Backoff::reset`] after a success so the next failure
/// starts over at the base delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    current: Option<Duration>,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            current: None,
        }
    }

    /// The next delay in the sequence, with jitter applied.
    pub fn next(&mut self) -> Duration {
        let raw = self.advance();
        apply_jitter(raw, self.policy.jitter)
    }

    /// The next delay in the sequence without jitter. Exposed for tests
    /// and for callers that need deterministic pacing.
    pub fn advance(&mut self) -> Duration {
        let next = match self.current {
            None => self.policy.base,
            Some(current) => self.policy.next_delay(current),
        };
        self.current = Some(next);
        next
    }

    /// Start the sequence over from the base delay.
    pub fn reset(&mut self) {
        self.current = None;
    }
}

/// Scale `delay` by a random factor in `1 ± jitter`.
fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return delay;
    }
    let factor = rand::rng().random_range(1.0 - jitter..=1.0 + jitter);
    delay.mul_f64(factor)
}
