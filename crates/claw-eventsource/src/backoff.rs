//! Full-jitter exponential backoff.

use std::time::Duration;

use rand::Rng;

use crate::config::RetryPolicy;

/// Upper bound of the delay before retry number `attempt` (0-based).
///
/// `min(initial_delay * 2^attempt, max_delay)`, saturating on overflow.
#[must_use]
pub fn backoff_ceiling(attempt: u32, initial_delay: Duration, max_delay: Duration) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    initial_delay
        .checked_mul(factor)
        .unwrap_or(Duration::MAX)
        .min(max_delay)
}

/// Draw a delay uniformly from `[0, backoff_ceiling(attempt)]`.
#[must_use]
pub fn full_jitter<R: Rng + ?Sized>(
    rng: &mut R,
    attempt: u32,
    initial_delay: Duration,
    max_delay: Duration,
) -> Duration {
    let ceiling = backoff_ceiling(attempt, initial_delay, max_delay);
    let ceiling_millis = u64::try_from(ceiling.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(rng.gen_range(0..=ceiling_millis))
}

impl RetryPolicy {
    /// Backoff ceiling for retry number `attempt` under this policy.
    #[must_use]
    pub fn delay_ceiling(&self, attempt: u32) -> Duration {
        backoff_ceiling(attempt, self.initial_delay, self.max_delay)
    }

    /// Jittered delay for retry number `attempt` using the thread RNG.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        full_jitter(
            &mut rand::thread_rng(),
            attempt,
            self.initial_delay,
            self.max_delay,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use test_case::test_case;

    #[test_case(0, 1_000 ; "first retry")]
    #[test_case(1, 2_000 ; "second retry")]
    #[test_case(2, 4_000 ; "third retry")]
    #[test_case(3, 8_000 ; "fourth retry")]
    #[test_case(4, 10_000 ; "capped")]
    #[test_case(40, 10_000 ; "overflowing exponent")]
    fn test_backoff_ceiling(attempt: u32, expected_ms: u64) {
        let ceiling = backoff_ceiling(
            attempt,
            Duration::from_millis(1_000),
            Duration::from_millis(10_000),
        );
        assert_eq!(ceiling, Duration::from_millis(expected_ms));
    }

    #[test]
    fn test_zero_initial_delay_never_waits() {
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 0..5 {
            let delay = full_jitter(&mut rng, attempt, Duration::ZERO, Duration::from_secs(10));
            assert_eq!(delay, Duration::ZERO);
        }
    }

    #[test]
    fn test_jitter_spreads_delays() {
        let mut rng = StdRng::seed_from_u64(42);
        let delays: Vec<Duration> = (0..32)
            .map(|_| full_jitter(&mut rng, 3, Duration::from_millis(100), Duration::from_secs(10)))
            .collect();

        let first = delays[0];
        assert!(delays.iter().any(|d| *d != first), "delays should vary");
    }

    #[test]
    fn test_policy_delay_ceiling() {
        let policy = RetryPolicy::default()
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(500));

        assert_eq!(policy.delay_ceiling(0), Duration::from_millis(100));
        assert_eq!(policy.delay_ceiling(2), Duration::from_millis(400));
        assert_eq!(policy.delay_ceiling(3), Duration::from_millis(500));
    }

    proptest! {
        #[test]
        fn prop_jitter_within_ceiling(
            seed in any::<u64>(),
            attempt in 0u32..64,
            initial_ms in 0u64..5_000,
            extra_ms in 0u64..60_000,
        ) {
            let initial = Duration::from_millis(initial_ms);
            let max = Duration::from_millis(initial_ms + extra_ms);
            let mut rng = StdRng::seed_from_u64(seed);

            let delay = full_jitter(&mut rng, attempt, initial, max);
            prop_assert!(delay <= backoff_ceiling(attempt, initial, max));
            prop_assert!(delay <= max);
        }

        #[test]
        fn prop_policy_delay_within_ceiling(attempt in 0u32..16) {
            let policy = RetryPolicy::default();
            prop_assert!(policy.delay_for_attempt(attempt) <= policy.delay_ceiling(attempt));
        }
    }
}
