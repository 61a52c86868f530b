//! Retry policy: decides backoff delays between redeliveries.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with a cap and a little jitter so a burst of
/// failures does not redeliver in lockstep.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first redelivery.
    pub base_delay: Duration,

    /// Growth factor per further attempt.
    pub multiplier: f64,

    /// Upper bound on any single delay.
    pub max_delay: Duration,

    /// Relative jitter, e.g. 0.1 for +/-10%. Zero disables it.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Delay before redelivery after `attempts` completed attempts
    /// (1-indexed): base * multiplier^(attempts - 1), capped, jittered.
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31) as i32;
        let raw = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = raw.min(self.max_delay.as_secs_f64());
        let jittered = if self.jitter > 0.0 {
            let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
            capped * factor
        } else {
            capped
        };
        Duration::from_secs_f64(jittered.max(0.0))
    }
}
