//! Outbox dispatcher backoff between failed publish attempts.

use std::time::Duration;

/// `min(max, base * 2^(attempts-1))`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboxBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for OutboxBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            max: Duration::from_secs(60),
        }
    }
}

impl OutboxBackoff {
    /// Delay after the `attempts`-th failed attempt (attempts already incremented).
    pub fn delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1);
        2u32.checked_pow(exponent)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(1, 5)]
    #[case(2, 10)]
    #[case(3, 20)]
    #[case(4, 40)]
    #[case(5, 60)]
    #[case(40, 60)]
    fn default_backoff_schedule(#[case] attempts: u32, #[case] expected_secs: u64) {
        assert_eq!(
            OutboxBackoff::default().delay(attempts),
            Duration::from_secs(expected_secs)
        );
    }

    #[test]
    fn backoff_never_decreases() {
        let backoff = OutboxBackoff::default();
        let mut previous = Duration::ZERO;
        for attempts in 1..100 {
            let delay = backoff.delay(attempts);
            assert!(delay >= previous);
            assert!(delay <= backoff.max);
            previous = delay;
        }
    }
}
