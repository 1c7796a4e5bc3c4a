use rand::Rng;
use std::time::Duration;

/// Exponential backoff with jitter.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before retry number `attempt` (1-based).
    ///
    /// Doubles from `base` per attempt, capped at `max`, then scaled by a
    /// random factor in `[0.5, 1.0]` so failing keys do not retry in step.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let ceiling = self
            .base
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |d| d.min(self.max));
        let factor: f64 = rand::rng().random_range(0.5..=1.0);
        ceiling.mul_f64(factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_grows_and_caps() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1));

        let first = backoff.delay(1);
        assert!(first >= Duration::from_millis(50) && first <= Duration::from_millis(100));

        let third = backoff.delay(3);
        assert!(third >= Duration::from_millis(200) && third <= Duration::from_millis(400));

        for attempt in [10, 31, 32, u32::MAX] {
            assert!(backoff.delay(attempt) <= Duration::from_secs(1));
        }
    }

    #[test]
    fn test_zero_base_never_waits() {
        let backoff = Backoff::new(Duration::ZERO, Duration::from_secs(60));
        assert_eq!(backoff.delay(5), Duration::ZERO);
    }
}
